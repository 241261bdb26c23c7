use std::collections::BTreeSet;

/// Smallest non-negative slot not present in `occupied`.
///
/// Pure; callers pass a fresh snapshot of live instances each time. Two
/// concurrent callers with the same snapshot get the same slot.
pub fn next_slot(occupied: &[u32]) -> u32 {
    let taken: BTreeSet<u32> = occupied.iter().copied().collect();
    (0..).find(|slot| !taken.contains(slot)).unwrap_or(0)
}
