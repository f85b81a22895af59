//! The cache of page tables derived from GPTs.

use super::pte::{PageTable, PageTableEntry};
use crate::cap::Restrictions;
use crate::object::ObjectId;
use allocators::AgeList;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Physical address at which mapping tables are placed in the projected address format
pub const MAPPING_FRAME_BASE: u64 = 1 << 48;

const TIER_SHIFT: u64 = 31;

/// The two separately aged pools of mappings
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tier {
    /// Top level tables which are loaded into `satp`
    Root = 0,
    /// Every other level
    Table = 1,
}

impl Tier {
    pub const fn of_level(level: u8) -> Self {
        if level == 2 {
            Tier::Root
        } else {
            Tier::Table
        }
    }
}

/// A stable reference to a mapping slot of the cache
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MappingHandle {
    pub tier: Tier,
    pub index: u32,
}

impl MappingHandle {
    /// The physical address at which the table of this mapping is known to the hardware
    pub const fn paddr(self) -> u64 {
        MAPPING_FRAME_BASE + ((((self.tier as u64) << TIER_SHIFT) | self.index as u64) << 12)
    }

    /// Find the mapping a table address stored in a page table entry belongs to
    pub const fn from_paddr(paddr: u64) -> Option<Self> {
        if paddr < MAPPING_FRAME_BASE {
            return None;
        }
        let raw = (paddr - MAPPING_FRAME_BASE) >> 12;
        let tier = match raw >> TIER_SHIFT {
            0 => Tier::Root,
            1 => Tier::Table,
            _ => return None,
        };
        Some(Self {
            tier,
            index: (raw & ((1 << TIER_SHIFT) - 1)) as u32,
        })
    }
}

/// What a mapping was derived from.
///
/// A mapping is a pure function of its key: the producing GPT, the table level, the address bits selecting the
/// window of the producer which the table covers and the restrictions accumulated up to the producer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MappingKey {
    pub producer: ObjectId,
    pub level: u8,
    pub mask: u64,
    pub match_bits: u64,
    pub restr: Restrictions,
}

/// A cached page table along with its bookkeeping
pub struct Mapping {
    pub table: Box<PageTable>,
    pub key: Option<MappingKey>,
    /// Entries of other mappings that point at this one
    pub referrers: Vec<(MappingHandle, usize)>,
    /// Bumped every time the mapping is recycled
    pub generation: u32,
}

impl Mapping {
    fn new() -> Self {
        Self {
            table: Box::new(PageTable::empty()),
            key: None,
            referrers: Vec::new(),
            generation: 0,
        }
    }

    /// Handles of the mappings the entries of this one point to, along with the entry index
    pub fn children(&self) -> impl Iterator<Item = (usize, MappingHandle)> + '_ {
        self.table
            .entries
            .iter()
            .enumerate()
            .filter(|(_, pte)| pte.is_valid() && !pte.is_leaf())
            .filter_map(|(i, pte)| MappingHandle::from_paddr(pte.paddr()).map(|h| (i, h)))
    }
}

struct TierCache {
    maps: Vec<Mapping>,
    capacity: usize,
    /// Every allocated mapping from most to least recently used; unused mappings are kept at the old end
    ages: AgeList,
}

impl TierCache {
    fn new(capacity: usize) -> Self {
        Self {
            maps: Vec::new(),
            capacity,
            ages: AgeList::new(),
        }
    }
}

/// All mappings, split into tiers which grow lazily up to their configured capacity
pub struct MappingCache {
    tiers: [TierCache; 2],
    products: BTreeMap<ObjectId, Vec<MappingHandle>>,
}

impl MappingCache {
    pub fn new(root_tables: usize, page_tables: usize) -> Self {
        Self {
            tiers: [TierCache::new(root_tables), TierCache::new(page_tables)],
            products: BTreeMap::new(),
        }
    }

    fn tier(&self, tier: Tier) -> &TierCache {
        &self.tiers[tier as usize]
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierCache {
        &mut self.tiers[tier as usize]
    }

    /// # Panics
    /// Panics if the handle was not handed out by this cache
    pub fn get(&self, handle: MappingHandle) -> &Mapping {
        &self.tier(handle.tier).maps[handle.index as usize]
    }

    pub fn get_mut(&mut self, handle: MappingHandle) -> &mut Mapping {
        &mut self.tier_mut(handle.tier).maps[handle.index as usize]
    }

    /// The entry `index` of the referenced mapping
    pub fn entry_mut(&mut self, handle: MappingHandle, index: usize) -> &mut PageTableEntry {
        &mut self.get_mut(handle).table.entries[index]
    }

    /// Find the mapping derived from `key` and mark it as recently used
    pub fn lookup(&mut self, key: &MappingKey) -> Option<MappingHandle> {
        let handle = *self.products.get(&key.producer)?.iter().find(|h| {
            let tier = &self.tiers[h.tier as usize];
            tier.maps[h.index as usize].key.as_ref() == Some(key)
        })?;
        self.tier_mut(handle.tier).ages.touch(handle.index as usize);
        Some(handle)
    }

    /// Pick the mapping that should be used for new content in the given tier.
    ///
    /// As long as the tier has not reached its capacity a new mapping is created, afterwards the least recently
    /// used one that is not `pinned` is chosen. The caller must release the returned mapping if it still has
    /// a key.
    pub fn victim(&mut self, tier: Tier, pinned: &[MappingHandle]) -> Option<MappingHandle> {
        let cache = self.tier_mut(tier);
        if cache.maps.len() < cache.capacity {
            let index = cache.maps.len();
            cache.maps.push(Mapping::new());
            cache.ages.push_oldest(index);
            return Some(MappingHandle {
                tier,
                index: index as u32,
            });
        }
        cache
            .ages
            .iter_oldest_first()
            .map(|index| MappingHandle {
                tier,
                index: index as u32,
            })
            .find(|handle| !pinned.contains(handle))
    }

    /// Dedicate an unused mapping to content derived from `key`
    pub fn assign(&mut self, handle: MappingHandle, key: MappingKey) {
        let mapping = self.get_mut(handle);
        debug_assert!(mapping.key.is_none());
        mapping.key = Some(key);
        self.products.entry(key.producer).or_default().push(handle);
        self.tier_mut(handle.tier).ages.touch(handle.index as usize);
    }

    /// Reset a mapping to its unused state and forget what it was derived from.
    ///
    /// Entries pointing to or from the mapping must have been unlinked by the caller.
    pub fn release(&mut self, handle: MappingHandle) {
        let mapping = self.get_mut(handle);
        let key = mapping.key.take();
        mapping.table.clear();
        mapping.referrers.clear();
        mapping.generation = mapping.generation.wrapping_add(1);

        if let Some(key) = key {
            if let Some(products) = self.products.get_mut(&key.producer) {
                products.retain(|h| *h != handle);
                if products.is_empty() {
                    self.products.remove(&key.producer);
                }
            }
        }
        self.tier_mut(handle.tier).ages.retire(handle.index as usize);
    }

    /// Every mapping currently derived from `producer`
    pub fn products_of(&self, producer: ObjectId) -> Vec<MappingHandle> {
        self.products.get(&producer).cloned().unwrap_or_default()
    }

    /// Every mapping of the given hardware level that is currently in use
    pub fn in_use(&self, level: u8) -> Vec<MappingHandle> {
        let tier = Tier::of_level(level);
        self.tier(tier)
            .maps
            .iter()
            .enumerate()
            .filter(|(_, m)| m.key.is_some_and(|k| k.level == level))
            .map(|(index, _)| MappingHandle {
                tier,
                index: index as u32,
            })
            .collect()
    }

    /// How many mappings of a tier currently hold content
    pub fn used(&self, tier: Tier) -> usize {
        self.tier(tier).maps.iter().filter(|m| m.key.is_some()).count()
    }

    /// How many mappings of a tier exist, used or not
    pub fn allocated(&self, tier: Tier) -> usize {
        self.tier(tier).maps.len()
    }
}
