//! Ring selection.

use std::sync::Arc;

use crate::ring::Ring;

/// Pick the highest-priority ring with outstanding work.
///
/// Rings are scanned in index order (index 0 is the highest priority). A ring is empty when the CP
/// has fetched everything up to the driver's write pointer; the current ring additionally counts as
/// busy until its last submission has retired. Each ring's lock is held only while it is being
/// examined.
pub fn select_next(rings: &[Arc<Ring>], cur_ring: usize) -> Option<usize> {
    rings
        .iter()
        .enumerate()
        .find(|(index, ring)| ring.has_work(*index == cur_ring))
        .map(|(index, _)| index)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use crate::memory::{PageTableParams, StaticAddressSpace};

    fn rings(n: usize) -> Vec<Arc<Ring>> {
        let aspace = Arc::new(StaticAddressSpace(PageTableParams::default()));
        (0..n)
            .map(|i| {
                let memptrs = 0x10_0000 + 0x40 * i as u64;
                Arc::new(Ring::new(i, 0x1000 * i as u64, memptrs, aspace.clone()))
            })
            .collect()
    }

    #[test]
    fn all_empty_selects_nothing() {
        let rings = rings(3);
        assert_eq!(select_next(&rings, 0), None);
        assert_eq!(select_next(&rings, 2), None);
    }

    #[test]
    fn lowest_index_with_work_wins() {
        let rings = rings(4);
        rings[3].advance(4);
        assert_eq!(select_next(&rings, 0), Some(3));

        rings[1].advance(4);
        assert_eq!(select_next(&rings, 3), Some(1));

        rings[0].advance(4);
        assert_eq!(select_next(&rings, 3), Some(0));
    }

    #[test]
    fn current_ring_stays_busy_until_retired() {
        let rings = rings(2);
        rings[0].advance(16);
        rings[0].memptrs().set_rptr(16);
        rings[1].advance(8);

        // Ring 0 is fully fetched: as a non-current ring it is empty.
        assert_eq!(select_next(&rings, 1), Some(1));
        // As the current ring it is still executing its last submission.
        assert_eq!(select_next(&rings, 0), Some(0));

        rings[0].memptrs().set_fence(rings[0].last_seqno());
        assert_eq!(select_next(&rings, 0), Some(1));
    }

    #[test]
    fn out_of_range_current_ring_is_never_special() {
        let rings = rings(2);
        rings[1].advance(4);
        assert_eq!(select_next(&rings, usize::MAX), Some(1));
    }
}
