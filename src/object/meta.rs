//! Descriptive metadata carried by every object.

use serde::{Deserialize, Serialize};

use crate::error::ObjectError;

/// Row-major 4x4 identity.
pub const IDENTITY_TRANSFORM: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Block/timestep placement and provenance of an object. Copied by value.
///
/// Indices and counts use `-1` for "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub block: i32,
    pub num_blocks: i32,
    pub timestep: i32,
    pub num_timesteps: i32,
    pub animation_step: i32,
    pub num_animation_steps: i32,
    pub iteration: i32,
    pub execution_counter: i32,
    pub creator: i32,
    pub real_time: f64,
    pub transform: [f64; 16],
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            block: -1,
            num_blocks: -1,
            timestep: -1,
            num_timesteps: -1,
            animation_step: -1,
            num_animation_steps: -1,
            iteration: -1,
            execution_counter: -1,
            creator: -1,
            real_time: 0.0,
            transform: IDENTITY_TRANSFORM,
        }
    }
}

impl Meta {
    pub fn with_block(mut self, block: i32, num_blocks: i32) -> Self {
        self.block = block;
        self.num_blocks = num_blocks;
        self
    }

    pub fn with_timestep(mut self, timestep: i32, num_timesteps: i32) -> Self {
        self.timestep = timestep;
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_creator(mut self, creator: i32, execution_counter: i32) -> Self {
        self.creator = creator;
        self.execution_counter = execution_counter;
        self
    }

    /// Copy the placement fields of `other`, keeping provenance.
    pub fn copy_placement(&mut self, other: &Meta) {
        self.block = other.block;
        self.num_blocks = other.num_blocks;
        self.timestep = other.timestep;
        self.num_timesteps = other.num_timesteps;
        self.animation_step = other.animation_step;
        self.num_animation_steps = other.num_animation_steps;
        self.iteration = other.iteration;
        self.real_time = other.real_time;
        self.transform = other.transform;
    }

    /// Validate index/count pairs.
    pub fn check(&self) -> Result<(), ObjectError> {
        check_pair("block", self.block, self.num_blocks)?;
        check_pair("timestep", self.timestep, self.num_timesteps)?;
        check_pair(
            "animation_step",
            self.animation_step,
            self.num_animation_steps,
        )?;
        if self.iteration < -1 {
            return Err(ObjectError::InvalidMeta(format!(
                "iteration {} < -1",
                self.iteration
            )));
        }
        Ok(())
    }
}

fn check_pair(what: &str, index: i32, count: i32) -> Result<(), ObjectError> {
    if index < -1 || count < -1 {
        return Err(ObjectError::InvalidMeta(format!(
            "{} {}/{} below -1",
            what, index, count
        )));
    }
    if count != -1 && index >= count {
        return Err(ObjectError::InvalidMeta(format!(
            "{} {} out of range {}",
            what, index, count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unplaced() {
        let meta = Meta::default();
        assert_eq!(meta.block, -1);
        assert_eq!(meta.transform, IDENTITY_TRANSFORM);
        assert!(meta.check().is_ok());
    }

    #[test]
    fn test_check_rejects_out_of_range() {
        assert!(Meta::default().with_block(3, 4).check().is_ok());
        assert!(Meta::default().with_block(4, 4).check().is_err());
        assert!(Meta::default().with_timestep(-2, 5).check().is_err());
        // unknown count allows any index
        assert!(Meta::default().with_timestep(12, -1).check().is_ok());
    }

    #[test]
    fn test_copy_placement_keeps_creator() {
        let src = Meta::default().with_block(1, 2).with_creator(9, 3);
        let mut dst = Meta::default().with_creator(4, 1);
        dst.copy_placement(&src);
        assert_eq!(dst.block, 1);
        assert_eq!(dst.creator, 4);
        assert_eq!(dst.execution_counter, 1);
    }
}
