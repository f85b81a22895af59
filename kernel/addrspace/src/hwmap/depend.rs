//! Records of which GPT slots produced which page table entries.

use super::mapping::MappingHandle;
use crate::object::ObjectId;
use super::pte::ENTRIES_PER_TABLE;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Range;

/// A binding from slots of one GPT to the entries of one mapping derived from them.
///
/// Slot `s` (if set in `slot_mask`) produced the `2^l2_slot_span` entries starting at
/// `base_pte + ((s - slot_bias) << l2_slot_span)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DependEntry {
    pub map: MappingHandle,
    pub slot_mask: u16,
    pub slot_bias: u8,
    pub l2_slot_span: u8,
    pub base_pte: u16,
}

impl DependEntry {
    pub fn new(map: MappingHandle, slot: usize, l2_slot_span: u8, entry: usize) -> Self {
        let base = entry & !((1 << l2_slot_span) - 1);
        Self {
            map,
            slot_mask: 1 << slot,
            slot_bias: slot as u8,
            l2_slot_span,
            base_pte: base as u16,
        }
    }

    /// Index of the entry that slot 0 would have produced, which may lie outside of the table
    fn implied_base(&self) -> i64 {
        self.base_pte as i64 - ((self.slot_bias as i64) << self.l2_slot_span)
    }

    /// The entries produced by `slot`
    pub fn entries_of(&self, slot: usize) -> Range<usize> {
        let start = self.implied_base() + ((slot as i64) << self.l2_slot_span);
        let end = start + (1 << self.l2_slot_span);
        let clamp = |i: i64| i.clamp(0, ENTRIES_PER_TABLE as i64) as usize;
        clamp(start)..clamp(end)
    }

    /// The entries produced by any slot of this record
    pub fn all_entries(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..16)
            .filter(|slot| self.slot_mask & (1 << slot) != 0)
            .map(|slot| self.entries_of(slot))
    }
}

/// All dependency records, grouped by the GPT whose slots they depend on
#[derive(Debug, Default)]
pub struct DependTable {
    records: BTreeMap<ObjectId, Vec<DependEntry>>,
}

impl DependTable {
    pub const fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remember that `entry` was derived from slots of `gpt`.
    ///
    /// Records for the same mapping whose slots translate to entries in the same way are merged.
    pub fn record(&mut self, gpt: ObjectId, entry: DependEntry) {
        let records = self.records.entry(gpt).or_default();
        let mergeable = records.iter_mut().find(|existing| {
            existing.map == entry.map
                && existing.l2_slot_span == entry.l2_slot_span
                && existing.implied_base() == entry.implied_base()
        });
        match mergeable {
            Some(existing) => existing.slot_mask |= entry.slot_mask,
            None => records.push(entry),
        }
    }

    /// Remove `slot` from all records of `gpt` and return the entries it produced
    pub fn take_slot(&mut self, gpt: ObjectId, slot: usize) -> Vec<(MappingHandle, Range<usize>)> {
        let Some(records) = self.records.get_mut(&gpt) else {
            return Vec::new();
        };
        let bit = 1u16 << slot;
        let mut taken = Vec::new();
        for record in records.iter_mut().filter(|r| r.slot_mask & bit != 0) {
            taken.push((record.map, record.entries_of(slot)));
            record.slot_mask &= !bit;
        }
        records.retain(|r| r.slot_mask != 0);
        if records.is_empty() {
            self.records.remove(&gpt);
        }
        taken
    }

    /// Remove and return every record of `gpt`
    pub fn take_all(&mut self, gpt: ObjectId) -> Vec<DependEntry> {
        self.records.remove(&gpt).unwrap_or_default()
    }

    /// Drop every record that refers to `map`
    pub fn forget_map(&mut self, map: MappingHandle) {
        self.records.retain(|_, records| {
            records.retain(|r| r.map != map);
            !records.is_empty()
        });
    }
}
