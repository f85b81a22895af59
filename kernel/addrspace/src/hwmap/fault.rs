//! Resolution of hardware page faults.

use super::pte::{EntryFlags, PageTableEntry};
use super::tlb::TlbFlush;
use super::{frame_paddr, HardwareMap, RootTable, Translation};
use crate::cap::{Capability, Restrictions};
use crate::guard::low_bits;
use crate::object::{ObjectKind, ObjectSource};
use crate::walk::{walk, FaultCode, Walk};
use crate::PAGE_ADDR_BITS;

/// What kind of access caused a fault
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Access {
    pub write: bool,
    pub execute: bool,
    /// The access targets the capability address space instead of data
    pub capability: bool,
}

impl Access {
    pub const READ: Access = Access {
        write: false,
        execute: false,
        capability: false,
    };
    pub const WRITE: Access = Access {
        write: true,
        ..Access::READ
    };
    pub const EXECUTE: Access = Access {
        execute: true,
        ..Access::READ
    };
    pub const CAP_READ: Access = Access {
        capability: true,
        ..Access::READ
    };
    pub const CAP_WRITE: Access = Access {
        write: true,
        capability: true,
        ..Access::READ
    };
}

/// A successfully resolved fault
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Resolution {
    /// The root table the address was projected into
    pub root: RootTable,
    pub translation: Translation,
}

/// The leaf entry mapping the object a walk resolved to, or `None` if it did not resolve to a leaf
pub(super) fn leaf_entry(walk: &Walk) -> Option<PageTableEntry> {
    let leaf = walk.leaf()?;
    let restr = walk.restrictions;
    let mut flags = EntryFlags::Read
        | EntryFlags::User
        | EntryFlags::Accessed
        | EntryFlags::Dirty
        | EntryFlags::SoftValid;
    if !restr.intersects(Restrictions::NO_WRITE) {
        flags |= EntryFlags::Write;
    }
    if !restr.contains(Restrictions::NO_EXECUTE) {
        flags |= EntryFlags::Execute;
    }
    if restr.contains(Restrictions::WEAK) {
        flags |= EntryFlags::Weak;
    }
    if restr.intersects(Restrictions::CACHE_DISABLE | Restrictions::WRITE_THROUGH) {
        flags |= EntryFlags::PbmtNc;
    }
    // capability pages must never be reachable by user mode
    if leaf.kind == ObjectKind::Page {
        flags |= EntryFlags::Valid;
    }
    Some(PageTableEntry::new(frame_paddr(leaf.object.id), flags))
}

impl<T: TlbFlush> HardwareMap<T> {
    /// Resolve a fault at `va` within `space` and install the entries translating it.
    ///
    /// The walk happens without holding the projection lock. If any invalidation happened in the meantime
    /// the walk may have seen a slot that is already being overwritten, so it is repeated.
    pub fn handle_fault(
        &self,
        src: &impl ObjectSource,
        space: Capability,
        va: u64,
        access: Access,
    ) -> Result<Resolution, FaultCode> {
        if va >= 1 << self.user_va_bits {
            log::debug!("[hwmap] fault at {va:#x} lies outside of the user address range");
            return Err(FaultCode::InvalidDataReference);
        }
        if let Some((kind @ (ObjectKind::Page | ObjectKind::CapPage), _)) = space.memory_object() {
            log::warn!("[hwmap] a {kind:?} cannot serve as the root of an address space");
            return Err(FaultCode::MalformedSpace);
        }

        loop {
            let epoch = self.state.spin_lock().epoch;
            let walk = walk(src, space, va, access.write);
            if let Some(fault) = walk.fault {
                return Err(fault);
            }
            let Some(leaf) = walk.leaf() else {
                return Err(FaultCode::InvalidDataReference);
            };
            match (leaf.kind, access.capability) {
                (ObjectKind::Page, true) => return Err(FaultCode::CapAccessTypeError),
                (ObjectKind::CapPage, false) => return Err(FaultCode::DataAccessTypeError),
                _ => {}
            }
            if access.execute && walk.restrictions.contains(Restrictions::NO_EXECUTE) {
                return Err(FaultCode::NoExecute);
            }
            let Some(entry) = leaf_entry(&walk) else {
                return Err(FaultCode::InvalidDataReference);
            };

            let mut state = self.state.spin_lock();
            if state.epoch != epoch {
                log::trace!("[hwmap] projection of {va:#x} raced with an invalidation, retrying");
                continue;
            }
            let (root, replaced) = state.project(&walk, va, entry);
            self.finish(state);
            if replaced {
                self.tlb.flush_va(va);
            }
            log::trace!("[hwmap] projected {va:#x} to {entry:?}");
            return Ok(Resolution {
                root,
                translation: Translation {
                    paddr: entry.paddr() | low_bits(va, PAGE_ADDR_BITS),
                    flags: entry.flags(),
                },
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::guard::Guard;
    use crate::hwmap::tlb::CountingTlb;
    use crate::object::ObjectRef;
    use crate::store::{BankId, ObjectStore};

    /// A root with l2v 16 holding a data page in slot 1 and a capability page in slot 2
    fn space(store: &ObjectStore, page_restr: Restrictions) -> (Capability, ObjectRef, ObjectRef) {
        let root = store.allocate(ObjectKind::Gpt, BankId(0)).unwrap();
        let page = store.allocate(ObjectKind::Page, BankId(0)).unwrap();
        let caps = store.allocate(ObjectKind::CapPage, BankId(0)).unwrap();
        store.with_gpt_mut(root, |gpt| {
            gpt.l2v = 16;
            let page_guard = Guard::new(0, 16).unwrap();
            gpt.slots[1] = Capability::memory(ObjectKind::Page, page, page_restr, page_guard);
            gpt.slots[2] =
                Capability::memory(ObjectKind::CapPage, caps, Restrictions::empty(), Guard::PAGE);
        });
        let space = Capability::memory(
            ObjectKind::Gpt,
            root,
            Restrictions::empty(),
            Guard::new(0, 20).unwrap(),
        );
        (space, page, caps)
    }

    #[test]
    fn test_fault_installs_translation() {
        // arrange
        let store = ObjectStore::with_capacity(4);
        let map = HardwareMap::new(&Config::default(), CountingTlb::new());
        let (space, page, _) = space(&store, Restrictions::empty());

        // act
        let resolution = map
            .handle_fault(&store, space, 0x1_0042, Access::WRITE)
            .unwrap();

        // assert
        assert_eq!(resolution.translation.paddr, frame_paddr(page.id) + 0x42);
        assert_eq!(
            map.translate(resolution.root, 0x1_0042),
            Some(resolution.translation)
        );
        assert!(resolution.translation.flags.contains(EntryFlags::Write | EntryFlags::Execute));
    }

    #[test]
    fn test_fault_rejections() {
        let store = ObjectStore::with_capacity(4);
        let map = HardwareMap::new(&Config::default(), CountingTlb::new());
        let (space, ..) = space(&store, Restrictions::READ_ONLY | Restrictions::NO_EXECUTE);

        assert_eq!(
            map.handle_fault(&store, space, 0x1_0000, Access::WRITE),
            Err(FaultCode::AccessViolation)
        );
        assert_eq!(
            map.handle_fault(&store, space, 0x1_0000, Access::EXECUTE),
            Err(FaultCode::NoExecute)
        );
        assert_eq!(
            map.handle_fault(&store, space, 0x1_0000, Access::CAP_READ),
            Err(FaultCode::CapAccessTypeError)
        );
        assert_eq!(
            map.handle_fault(&store, space, 0x2_0000, Access::READ),
            Err(FaultCode::DataAccessTypeError)
        );
        assert_eq!(
            map.handle_fault(&store, space, 0x3_0000, Access::READ),
            Err(FaultCode::InvalidDataReference)
        );
        assert_eq!(
            map.handle_fault(&store, space, 1 << 38, Access::READ),
            Err(FaultCode::InvalidDataReference)
        );
        assert_eq!(map.stats().page_tables, 0);
    }

    #[test]
    fn test_leaf_roots_are_malformed() {
        let store = ObjectStore::with_capacity(4);
        let map = HardwareMap::new(&Config::default(), CountingTlb::new());
        let (_, page, caps) = space(&store, Restrictions::empty());
        let page = Capability::memory(ObjectKind::Page, page, Restrictions::empty(), Guard::PAGE);
        let caps =
            Capability::memory(ObjectKind::CapPage, caps, Restrictions::empty(), Guard::PAGE);

        assert_eq!(
            map.handle_fault(&store, page, 0x42, Access::READ),
            Err(FaultCode::MalformedSpace)
        );
        assert_eq!(
            map.handle_fault(&store, caps, 0, Access::CAP_READ),
            Err(FaultCode::MalformedSpace)
        );
        assert_eq!(
            map.handle_fault(&store, Capability::NULL, 0, Access::READ),
            Err(FaultCode::InvalidDataReference)
        );
    }

    #[test]
    fn test_capability_pages_are_only_soft_valid() {
        let store = ObjectStore::with_capacity(4);
        let map = HardwareMap::new(&Config::default(), CountingTlb::new());
        let (space, _, caps) = space(&store, Restrictions::empty());

        let resolution = map
            .handle_fault(&store, space, 0x2_0000, Access::CAP_WRITE)
            .unwrap();

        let flags = resolution.translation.flags;
        assert!(flags.contains(EntryFlags::SoftValid));
        assert!(!flags.contains(EntryFlags::Valid));
        assert_eq!(resolution.translation.paddr, frame_paddr(caps.id));
    }

    #[test]
    fn test_weak_uncached_leaf_flags() {
        let store = ObjectStore::with_capacity(4);
        let map = HardwareMap::new(&Config::default(), CountingTlb::new());
        let (space, ..) = space(&store, Restrictions::WEAK | Restrictions::CACHE_DISABLE);

        let flags = map
            .handle_fault(&store, space, 0x1_0000, Access::READ)
            .unwrap()
            .translation
            .flags;

        assert!(flags.contains(EntryFlags::Weak | EntryFlags::PbmtNc));
        assert!(!flags.contains(EntryFlags::Write));
    }
}
