//! Shared, reference-counted data objects and arrays.
//!
//! # Architecture
//!
//! ```text
//! SharedRegion ──owns──► ObjectData ──refs──► ObjectData (attachments, children)
//!      │                     │
//!      └──owns──► ShmArray ◄─┘ refs (role → array)
//! ```
//!
//! - [`SharedRegion`] is the registry of every resident object and array,
//!   keyed by a unique name. It is explicitly constructed and passed around.
//! - [`Object`] and [`AnyArray`]/[`ShmVector`] are owning handles; each holds
//!   exactly one reference. `add_ref`/`unref` are available for holders that
//!   keep only a name.
//! - When a refcount reaches zero the record is removed from the region and
//!   every object and array it references is released in turn.
//! - References may be *pending* while an archive is being resolved; see
//!   [`ObjectData::is_complete`].

pub mod array;
pub mod data;
pub mod meta;
pub mod region;

pub use array::{AnyArray, ArrayBuffer, Scalar, ScalarType, ShmArray, ShmVector};
pub use data::{Object, ObjectData, Slot};
pub use meta::{Meta, IDENTITY_TRANSFORM};
pub use region::SharedRegion;

use serde::{Deserialize, Serialize};

/// Kind of data an object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Unknown,
    Empty,
    Placeholder,
    Texture1D,
    Points,
    Lines,
    Triangles,
    Polygons,
    UnstructuredGrid,
    UniformGrid,
    RectilinearGrid,
    StructuredGrid,
    Quads,
    LayerGrid,
    Normals,
    /// Per-element data with the given number of components.
    Vec(u8),
}

impl ObjectType {
    const VEC_BASE: i32 = 100;

    /// Stable numeric tag.
    pub fn as_i32(self) -> i32 {
        match self {
            ObjectType::Unknown => -1,
            ObjectType::Empty => 1,
            ObjectType::Placeholder => 11,
            ObjectType::Texture1D => 16,
            ObjectType::Points => 18,
            ObjectType::Lines => 20,
            ObjectType::Triangles => 22,
            ObjectType::Polygons => 23,
            ObjectType::UnstructuredGrid => 24,
            ObjectType::UniformGrid => 25,
            ObjectType::RectilinearGrid => 26,
            ObjectType::StructuredGrid => 27,
            ObjectType::Quads => 28,
            ObjectType::LayerGrid => 29,
            ObjectType::Normals => 99,
            ObjectType::Vec(dim) => Self::VEC_BASE + dim as i32,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            -1 => ObjectType::Unknown,
            1 => ObjectType::Empty,
            11 => ObjectType::Placeholder,
            16 => ObjectType::Texture1D,
            18 => ObjectType::Points,
            20 => ObjectType::Lines,
            22 => ObjectType::Triangles,
            23 => ObjectType::Polygons,
            24 => ObjectType::UnstructuredGrid,
            25 => ObjectType::UniformGrid,
            26 => ObjectType::RectilinearGrid,
            27 => ObjectType::StructuredGrid,
            28 => ObjectType::Quads,
            29 => ObjectType::LayerGrid,
            99 => ObjectType::Normals,
            v if (Self::VEC_BASE..=Self::VEC_BASE + u8::MAX as i32).contains(&v) => {
                ObjectType::Vec((v - Self::VEC_BASE) as u8)
            }
            _ => return None,
        })
    }

    /// Types whose geometry comes from a linked grid.
    pub fn is_data(self) -> bool {
        matches!(self, ObjectType::Vec(_))
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectType::Vec(dim) => write!(f, "VEC{}", dim),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_round_trip() {
        for ty in [
            ObjectType::Unknown,
            ObjectType::Empty,
            ObjectType::Points,
            ObjectType::LayerGrid,
            ObjectType::Normals,
            ObjectType::Vec(1),
            ObjectType::Vec(3),
        ] {
            assert_eq!(ObjectType::from_i32(ty.as_i32()), Some(ty));
        }
        assert_eq!(ObjectType::from_i32(2), None);
        assert_eq!(ObjectType::Vec(3).as_i32(), 103);
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectType::Vec(3).to_string(), "VEC3");
        assert_eq!(ObjectType::Points.to_string(), "Points");
    }
}
