//! Slot selection for scaling.

use std::ops::Range;

/// Indices to create when growing from `current` to `desired` instances.
///
/// Only the new high indices are returned; the range is empty when not
/// growing.
pub fn growth_range(current: u32, desired: u32) -> Range<u32> {
    current..desired.max(current)
}

/// Selects the slots to stop when shrinking to `new_count` instances.
///
/// Every slot whose index is at or above `new_count` is selected, highest
/// index first. For a dense index set this is exactly the N highest.
pub fn select_for_stop<T, F>(slots: Vec<T>, new_count: u32, index_of: F) -> Vec<T>
where
    F: Fn(&T) -> u32,
{
    let mut selected: Vec<_> = slots
        .into_iter()
        .filter(|s| index_of(s) >= new_count)
        .collect();
    selected.sort_by_key(|s| std::cmp::Reverse(index_of(s)));
    selected
}
