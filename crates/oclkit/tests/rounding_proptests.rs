//! Property-based tests for work-size rounding.
//!
//! Verified invariants for `G' = ceil_to_multiple(G, L)`:
//! - `G' >= G`
//! - `G' % L == 0`
//! - `G' - G < L`
//! - `G` already a multiple of `L` is returned unchanged.
//! - `None` exactly when the next multiple does not fit in `usize`.

use oclkit::ceil_to_multiple;
use proptest::prelude::*;

proptest! {
    #[test]
    fn rounded_size_is_smallest_covering_multiple(global in 0usize..1 << 24, local in 1usize..=1024) {
        let rounded = ceil_to_multiple(global, local).unwrap();
        prop_assert!(rounded >= global);
        prop_assert_eq!(rounded % local, 0);
        prop_assert!(rounded - global < local);
    }

    #[test]
    fn multiples_are_fixed_points(k in 0usize..1 << 16, local in 1usize..=1024) {
        let global = k * local;
        prop_assert_eq!(ceil_to_multiple(global, local), Some(global));
    }

    #[test]
    fn overflow_is_reported_only_when_rounding_is_needed(local in 2usize..=1024) {
        let rounded = ceil_to_multiple(usize::MAX, local);
        prop_assert_eq!(rounded.is_none(), usize::MAX % local != 0);
        if let Some(rounded) = rounded {
            prop_assert_eq!(rounded, usize::MAX);
        }
    }
}

#[test]
fn zero_local_size_is_rejected() {
    assert_eq!(ceil_to_multiple(64, 0), None);
}

#[test]
fn near_max_sizes() {
    // usize::MAX is divisible by 3 but not by 2.
    assert_eq!(ceil_to_multiple(usize::MAX, 3), Some(usize::MAX));
    assert_eq!(ceil_to_multiple(usize::MAX, 2), None);
    assert_eq!(ceil_to_multiple(usize::MAX - 1, 2), Some(usize::MAX - 1));
}
