//! Slot partitioner
//!
//! Splits `total_slots` across the masters as evenly as possible: every
//! master gets `total / n` slots and `total % n` of them get one more.
//!
//! Without a prior assignment the ranges are contiguous and laid out in id
//! order, the first-sorted masters taking the extra slots. With a prior
//! assignment the partitioner moves as few slots as it can:
//!
//! 1. the extra slots go to the masters already holding the most;
//! 2. each surviving master keeps its lowest slots up to its target and
//!    releases the rest;
//! 3. released slots and the slots of departed masters are handed out in
//!    ascending order to the masters below target, in id order.
//!
//! Adding or removing one master therefore never moves slots between two
//! masters that were unaffected by the change.

use crate::topology::types::{compress, Assignment, NodeId, Slot};
use crate::{Error, Result};

const UNOWNED: u32 = u32::MAX;

/// Deterministic balanced split with no history
pub fn partition_fresh(masters: &[NodeId], total_slots: u32) -> Result<Assignment> {
    partition(masters, total_slots, None)
}

/// Balanced split that keeps as much of `prior` as possible.
///
/// Prior ownership counts only for masters still in `masters`; slots outside
/// the slot space are ignored, and a slot claimed twice stays with the
/// first master in id order.
pub fn partition(
    masters: &[NodeId],
    total_slots: u32,
    prior: Option<&Assignment>,
) -> Result<Assignment> {
    let mut sorted: Vec<&NodeId> = masters.iter().collect();
    sorted.sort();
    sorted.dedup();

    if sorted.is_empty() {
        return Err(Error::NoMastersAvailable);
    }
    if sorted.len() > total_slots as usize {
        return Err(Error::InsufficientSlotGranularity {
            masters: sorted.len(),
            total_slots,
        });
    }

    let n = sorted.len();
    let base = total_slots / n as u32;
    let extra = (total_slots % n as u32) as usize;

    // owner[slot] = index into `sorted`
    let mut owner = vec![UNOWNED; total_slots as usize];
    let mut held = vec![0u32; n];
    if let Some(prior) = prior {
        for (idx, id) in sorted.iter().enumerate() {
            let Some(ranges) = prior.get(*id) else {
                continue;
            };
            for range in ranges {
                if range.start > range.end {
                    continue;
                }
                for slot in range.start..=range.end.min(total_slots.saturating_sub(1)) {
                    let cell = &mut owner[slot as usize];
                    if *cell == UNOWNED {
                        *cell = idx as u32;
                        held[idx] += 1;
                    }
                }
            }
        }
    }

    let mut by_holdings: Vec<usize> = (0..n).collect();
    by_holdings.sort_by(|a, b| held[*b].cmp(&held[*a]).then(a.cmp(b)));
    let mut target = vec![base; n];
    for idx in by_holdings.into_iter().take(extra) {
        target[idx] += 1;
    }

    let mut kept = vec![0u32; n];
    for cell in owner.iter_mut() {
        if *cell == UNOWNED {
            continue;
        }
        let idx = *cell as usize;
        if kept[idx] < target[idx] {
            kept[idx] += 1;
        } else {
            *cell = UNOWNED;
        }
    }

    let mut cursor = 0usize;
    for cell in owner.iter_mut() {
        if *cell != UNOWNED {
            continue;
        }
        while kept[cursor] >= target[cursor] {
            cursor += 1;
        }
        *cell = cursor as u32;
        kept[cursor] += 1;
    }

    let mut per_master: Vec<Vec<Slot>> = vec![Vec::new(); n];
    for (slot, idx) in owner.iter().enumerate() {
        per_master[*idx as usize].push(slot as Slot);
    }

    Ok(sorted
        .into_iter()
        .zip(per_master)
        .map(|(id, slots)| (id.clone(), compress(slots)))
        .collect())
}

/// Slots whose owner differs between two assignments of the same slot space
pub fn moved_slots(before: &Assignment, after: &Assignment, total_slots: u32) -> u32 {
    let before = owner_table(before, total_slots);
    let after = owner_table(after, total_slots);
    before
        .iter()
        .zip(after.iter())
        .filter(|(b, a)| b != a)
        .count() as u32
}

/// `table[slot]` = owning master
pub fn owner_table(assignment: &Assignment, total_slots: u32) -> Vec<Option<&NodeId>> {
    let mut table = vec![None; total_slots as usize];
    for (id, ranges) in assignment {
        for range in ranges {
            for slot in range.start..=range.end.min(total_slots.saturating_sub(1)) {
                table[slot as usize].get_or_insert(id);
            }
        }
    }
    table
}
