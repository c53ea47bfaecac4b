//! Rank coordination for multi-rank modules.

/// Collective operations across the ranks of one module.
///
/// The dispatch loop only needs a logical OR reduction to agree on whether
/// any rank still has queued work and may therefore not block.
pub trait Collective: Send {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    /// `true` on every rank if `local` is `true` on at least one.
    fn all_reduce_or(&self, local: bool) -> bool;
    /// Value of rank `root`'s `value` on every rank.
    fn broadcast_bool(&self, value: bool, root: i32) -> bool;
}

/// The trivial collective of a module running on a single rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleRank;

impl Collective for SingleRank {
    fn rank(&self) -> i32 {
        0
    }

    fn size(&self) -> i32 {
        1
    }

    fn all_reduce_or(&self, local: bool) -> bool {
        local
    }

    fn broadcast_bool(&self, value: bool, _root: i32) -> bool {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rank_is_identity() {
        let c = SingleRank;
        assert_eq!((c.rank(), c.size()), (0, 1));
        assert!(c.all_reduce_or(true));
        assert!(!c.all_reduce_or(false));
        assert!(c.broadcast_bool(true, 0));
    }
}
