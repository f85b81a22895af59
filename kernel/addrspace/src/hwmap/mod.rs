//! Projection of address spaces onto Sv39 page tables.
//!
//! The hardware cannot walk GPTs, so every resolved fault is turned into ordinary page table entries. The tables
//! holding them ("mappings") are a pure cache of the capability tree: each one is derived from a single
//! *producing* GPT and tagged with everything its content depends on, which lets multiple spaces sharing a
//! subtree share the derived tables as well.
//!
//! Whenever an entry is written, the GPT slots it was derived from are remembered in a [`DependTable`]. A
//! mutation of a slot then clears exactly the entries that slot produced, while a mutation of a whole GPT
//! recalls every mapping it produced.
//!
//! All bookkeeping lives behind a single lock. Invalidations bump an epoch under that lock so that a fault
//! which walked the tree before an invalidation notices it and retries instead of installing stale entries.

mod depend;
mod fault;
mod mapping;
pub mod pte;
pub mod tlb;

pub use fault::{Access, Resolution};
pub use mapping::{MappingHandle, Tier, MAPPING_FRAME_BASE};

use crate::cap::{Capability, Restrictions};
use crate::config::Config;
use crate::guard::{high_bits, low_bits};
use crate::object::{ObjectId, ObjectSource};
use crate::walk::Walk;
use crate::{ADDR_BITS, PAGE_ADDR_BITS};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use depend::{DependEntry, DependTable};
use ksync::SpinLock;
use mapping::{MappingCache, MappingKey};
use pte::{EntryFlags, Level, PageTableEntry, ENTRIES_PER_TABLE, LEVELS};
use tlb::TlbFlush;

/// Physical address at which the frames of objects start
pub const OBJECT_FRAME_BASE: u64 = 0x8000_0000;

/// `satp` mode selecting Sv39 translation
const SATP_MODE_SV39: u64 = 8;

/// The physical address of the frame backing an object
pub const fn frame_paddr(id: ObjectId) -> u64 {
    OBJECT_FRAME_BASE + ((id.0 as u64) << PAGE_ADDR_BITS)
}

/// A top level table as handed to a hart.
///
/// Root tables are recycled like any other mapping, so a hart must check [`HardwareMap::is_current`] at its
/// safe points and fault in a fresh root if it was recycled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RootTable {
    handle: MappingHandle,
    generation: u32,
}

impl RootTable {
    pub fn handle(&self) -> MappingHandle {
        self.handle
    }

    pub fn paddr(&self) -> u64 {
        self.handle.paddr()
    }

    /// The value to load into `satp` to translate through this table
    pub fn satp(&self) -> u64 {
        (SATP_MODE_SV39 << 60) | (self.paddr() >> PAGE_ADDR_BITS)
    }
}

/// The result of looking up an address in projected tables
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub paddr: u64,
    pub flags: EntryFlags,
}

/// A snapshot of how much of the cache is in use
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProjectionStats {
    pub root_tables: usize,
    pub page_tables: usize,
    pub dependencies: usize,
}

struct ProjectionState {
    cache: MappingCache,
    depends: DependTable,
    /// Bumped by every invalidation
    epoch: u64,
    /// Set when an entry the hardware may have cached was removed
    stale: bool,
}

/// The projected page tables of all address spaces along with their invalidation bookkeeping
pub struct HardwareMap<T: TlbFlush> {
    state: SpinLock<ProjectionState>,
    tlb: T,
    shootdown_epoch: AtomicU64,
    user_va_bits: u8,
}

impl<T: TlbFlush> HardwareMap<T> {
    pub fn new(config: &Config, tlb: T) -> Self {
        Self {
            state: SpinLock::new(ProjectionState {
                cache: MappingCache::new(config.root_tables, config.page_tables),
                depends: DependTable::new(),
                epoch: 0,
                stale: false,
            }),
            tlb,
            shootdown_epoch: AtomicU64::new(0),
            user_va_bits: config.user_va_bits,
        }
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Counter bumped every time entries that other harts may have cached were removed
    pub fn shootdown_epoch(&self) -> u64 {
        self.shootdown_epoch.load(Ordering::Acquire)
    }

    pub fn user_va_bits(&self) -> u8 {
        self.user_va_bits
    }

    pub fn stats(&self) -> ProjectionStats {
        let state = self.state.spin_lock();
        ProjectionStats {
            root_tables: state.cache.used(Tier::Root),
            page_tables: state.cache.used(Tier::Table),
            dependencies: state.depends.len(),
        }
    }

    /// The root table that `space` is projected into, creating an empty one if necessary
    pub fn root_table(
        &self,
        src: &impl ObjectSource,
        space: Capability,
    ) -> Option<RootTable> {
        let (_, object) = space.memory_object()?;
        let span = src.with_gpt(object, |gpt| space.guard().l2g().min(gpt.effective_l2g()))?;
        let key = mapping_key(
            object.id,
            span,
            space.restrictions(),
            &LEVELS[0],
            space.guard().value(),
        );
        let mut state = self.state.spin_lock();
        let handle = state.get_mapping(key, &[]);
        let root = RootTable {
            handle,
            generation: state.cache.get(handle).generation,
        };
        self.finish(state);
        Some(root)
    }

    /// Whether `root` still holds the table it was handed out with
    pub fn is_current(&self, root: RootTable) -> bool {
        let state = self.state.spin_lock();
        let mapping = state.cache.get(root.handle);
        mapping.generation == root.generation && mapping.key.is_some()
    }

    /// Look up `va` in the projected tables below `root` the way the hardware would
    pub fn translate(&self, root: RootTable, va: u64) -> Option<Translation> {
        let state = self.state.spin_lock();
        if state.cache.get(root.handle).generation != root.generation {
            return None;
        }
        let mut table = root.handle;
        for level in LEVELS.iter() {
            let pte = state.cache.get(table).table.entries[level.index_of(va)];
            if !pte.is_present() {
                return None;
            }
            if pte.is_leaf() {
                if level.level != 0 {
                    return None;
                }
                return Some(Translation {
                    paddr: pte.paddr() | low_bits(va, PAGE_ADDR_BITS),
                    flags: pte.flags(),
                });
            }
            table = MappingHandle::from_paddr(pte.paddr())?;
        }
        None
    }

    /// Remove every entry derived from `slot` of `gpt`.
    ///
    /// Must be called before the slot is overwritten while the GPT is still locked.
    pub fn invalidate_slot(&self, gpt: ObjectId, slot: usize) {
        let mut state = self.state.spin_lock();
        state.epoch += 1;
        let taken = state.depends.take_slot(gpt, slot);
        log::debug!(
            "[hwmap] invalidating slot {slot} of {gpt:?} ({} dependency records)",
            taken.len()
        );
        for (map, entries) in taken {
            for index in entries {
                state.clear_entry(map, index);
            }
        }
        self.finish(state);
    }

    /// Remove every entry and mapping derived from any part of `gpt`
    pub fn invalidate_object(&self, gpt: ObjectId) {
        let mut state = self.state.spin_lock();
        state.epoch += 1;
        for record in state.depends.take_all(gpt) {
            for entries in record.all_entries() {
                for index in entries {
                    state.clear_entry(record.map, index);
                }
            }
        }
        let products = state.cache.products_of(gpt);
        log::debug!("[hwmap] recalling {} mappings produced by {gpt:?}", products.len());
        for handle in products {
            state.recall(handle);
        }
        self.finish(state);
    }

    /// Remove every leaf entry that maps the frame of `obj`
    pub fn unmap_frame(&self, obj: ObjectId) {
        let paddr = frame_paddr(obj);
        let mut state = self.state.spin_lock();
        state.epoch += 1;
        for handle in state.cache.in_use(0) {
            for index in 0..ENTRIES_PER_TABLE {
                let pte = state.cache.get(handle).table.entries[index];
                if pte.is_present() && pte.is_leaf() && pte.paddr() == paddr {
                    state.clear_entry(handle, index);
                }
            }
        }
        self.finish(state);
    }

    /// Release the lock and flush if entries the hardware may have cached were removed
    fn finish(&self, mut state: ksync::Guard<'_, ProjectionState>) {
        let stale = core::mem::take(&mut state.stale);
        drop(state);
        if stale {
            self.tlb.flush_all();
            self.shootdown_epoch.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Per-hart view of the shootdown epoch
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CpuTlbState {
    seen: u64,
}

impl CpuTlbState {
    pub const fn new() -> Self {
        Self { seen: 0 }
    }

    /// Flush the hart's TLB if entries were removed since the last safe point. Returns whether it flushed.
    pub fn safe_point<M: TlbFlush>(
        &mut self,
        hwmap: &HardwareMap<M>,
        local: &impl TlbFlush,
    ) -> bool {
        let current = hwmap.shootdown_epoch();
        if current == self.seen {
            return false;
        }
        local.flush_all();
        self.seen = current;
        true
    }
}

/// log2 of the span through which each traversed object is reachable, narrowing along the path
fn reachable_spans(walk: &Walk) -> Vec<u8> {
    walk.entries
        .iter()
        .scan(ADDR_BITS, |span, entry| {
            *span = (*span).min(entry.l2g);
            Some(*span)
        })
        .collect()
}

/// For every level, the index of the walk entry producing its table.
///
/// The root table is always produced by the root of the space. Lower tables are produced by the deepest GPT
/// that is reachable through a span covering the whole table.
fn producers(spans: &[u8], gpts: usize) -> [usize; 3] {
    LEVELS.map(|level| {
        if level.level == LEVELS[0].level {
            return 0;
        }
        (0..gpts)
            .rev()
            .find(|&i| spans[i] >= level.l2table)
            .unwrap_or(0)
    })
}

/// The tag of the table of `level` covering `va`, produced by an object reachable through `span`
fn mapping_key(
    producer: ObjectId,
    span: u8,
    restr: Restrictions,
    level: &Level,
    va: u64,
) -> MappingKey {
    let (lo, hi) = (span.min(level.l2table), span.max(level.l2table));
    let mask = high_bits(low_bits(u64::MAX, hi), lo);
    MappingKey {
        producer,
        level: level.level,
        mask,
        match_bits: va & mask,
        restr,
    }
}

impl ProjectionState {
    /// Find the mapping tagged with `key` or recycle the least recently used one that is not `pinned`
    fn get_mapping(&mut self, key: MappingKey, pinned: &[MappingHandle]) -> MappingHandle {
        if let Some(handle) = self.cache.lookup(&key) {
            return handle;
        }
        let tier = Tier::of_level(key.level);
        let Some(handle) = self.cache.victim(tier, pinned) else {
            panic!("every {tier:?} mapping is pinned by the current fault");
        };
        if self.cache.get(handle).key.is_some() {
            log::debug!("[hwmap] recycling {handle:?} for {key:?}");
            self.recall(handle);
        }
        self.cache.assign(handle, key);
        handle
    }

    /// Unlink a mapping from everything referring to it and return it to the unused state
    fn recall(&mut self, handle: MappingHandle) {
        let mapping = self.cache.get_mut(handle);
        let referrers = core::mem::take(&mut mapping.referrers);
        let children: Vec<_> = mapping.children().collect();
        for (parent, index) in referrers {
            self.cache.entry_mut(parent, index).clear();
            self.stale = true;
        }
        for (index, child) in children {
            self.cache
                .get_mut(child)
                .referrers
                .retain(|r| *r != (handle, index));
        }
        if handle.tier == Tier::Root {
            self.stale = true;
        }
        self.depends.forget_map(handle);
        self.cache.release(handle);
    }

    /// Point entry `index` of `parent` at the table of `child`
    fn link(&mut self, parent: MappingHandle, index: usize, child: MappingHandle) {
        let pte = self.cache.get(parent).table.entries[index];
        if pte.is_valid() && !pte.is_leaf() && pte.paddr() == child.paddr() {
            return;
        }
        self.clear_entry(parent, index);
        self.cache
            .entry_mut(parent, index)
            .set(child.paddr(), EntryFlags::Valid);
        self.cache.get_mut(child).referrers.push((parent, index));
    }

    fn clear_entry(&mut self, map: MappingHandle, index: usize) {
        let pte = self.cache.get(map).table.entries[index];
        if !pte.is_present() {
            return;
        }
        if pte.is_valid() && !pte.is_leaf() {
            if let Some(child) = MappingHandle::from_paddr(pte.paddr()) {
                self.cache
                    .get_mut(child)
                    .referrers
                    .retain(|r| *r != (map, index));
            }
        }
        self.cache.entry_mut(map, index).clear();
        self.stale = true;
    }

    /// Remember that entry `index` of `map` was derived from the slots the walk took between entries `from`
    /// and `to`
    #[allow(clippy::too_many_arguments)]
    fn record_path(
        &mut self,
        walk: &Walk,
        spans: &[u8],
        from: usize,
        to: usize,
        map: MappingHandle,
        index: usize,
        level: &Level,
    ) {
        for j in from..to {
            let Some(slot) = walk.entries[j + 1].slot else {
                continue;
            };
            let span = spans[j + 1]
                .min(level.l2table)
                .saturating_sub(level.l2slot);
            self.depends.record(
                walk.entries[j].object.id,
                DependEntry::new(map, slot, span, index),
            );
        }
    }

    /// Install the entries translating `va` as resolved by `walk`, which must have ended in a leaf
    fn project(&mut self, walk: &Walk, va: u64, leaf: PageTableEntry) -> (RootTable, bool) {
        let spans = reachable_spans(walk);
        let leaf_index = walk.entries.len() - 1;
        let producers = producers(&spans, leaf_index);

        let mut maps: Vec<MappingHandle> = Vec::with_capacity(LEVELS.len());
        for (n, level) in LEVELS.iter().enumerate() {
            let producer = producers[n];
            let restr = walk.entries[..=producer]
                .iter()
                .fold(Restrictions::empty(), |acc, e| acc | e.restr);
            let key = mapping_key(
                walk.entries[producer].object.id,
                spans[producer],
                restr,
                level,
                va,
            );
            let map = self.get_mapping(key, &maps);
            if let Some(&parent) = maps.last() {
                let above = &LEVELS[n - 1];
                let index = above.index_of(va);
                self.link(parent, index, map);
                self.record_path(walk, &spans, producers[n - 1], producer, parent, index, above);
            }
            maps.push(map);
        }

        let bottom = &LEVELS[LEVELS.len() - 1];
        let table = maps[maps.len() - 1];
        let index = bottom.index_of(va);
        let previous = self.cache.get(table).table.entries[index];
        *self.cache.entry_mut(table, index) = leaf;
        self.record_path(
            walk,
            &spans,
            producers[LEVELS.len() - 1],
            leaf_index,
            table,
            index,
            bottom,
        );

        let root = RootTable {
            handle: maps[0],
            generation: self.cache.get(maps[0]).generation,
        };
        (root, previous.is_present() && previous != leaf)
    }
}
