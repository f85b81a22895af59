//! The mutation API of live address spaces.
//!
//! Every change to a GPT of a running system goes through one of these operations. They all check the
//! restrictions of the invoked reference before touching anything and invalidate the projection of what they
//! change while the GPT is locked, so a later walk never observes a half applied mutation and no hardware
//! entry outlives the slot it was derived from.
//!
//! Operations on a GPT itself take the GPT capability they are invoked on. Operations that address a slot
//! indirectly (fetch, store and their extended forms) take the root of an address space and walk it.

use crate::cap::{Capability, Restrictions};
use crate::context::MemoryContext;
use crate::guard::{low_bits, shift_down, Guard};
use crate::hwmap::tlb::TlbFlush;
use crate::object::{Object, ObjectKind, ObjectRef, ObjectSource};
use crate::store::Bank;
use crate::walk::{extended_walk, walk, FaultCode, Walk};
use crate::{ADDR_BITS, CAP_SIZE, MAX_L2V, NUM_GPT_SLOTS, PAGE_ADDR_BITS};
use thiserror_no_std::Error;

/// Result codes of the mutation API
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum InvokeError {
    #[error("the request arguments are invalid")]
    RequestError,
    #[error("the invoked reference does not permit this operation")]
    NoAccess,
    #[error("the address space is opaque to the invoked reference")]
    OpaqueSpace,
    #[error("the address does not resolve to a capability page")]
    CapAccessTypeError,
    #[error("there is no slot at the requested granularity")]
    NoSuchSlot,
    #[error("the address does not resolve to any object")]
    InvalidAddress,
    #[error("the address space is not well formed")]
    MalformedSpace,
    #[error("the invoked capability does not refer to a live object of the required kind")]
    InvalidCapability,
}

impl From<FaultCode> for InvokeError {
    fn from(value: FaultCode) -> Self {
        match value {
            FaultCode::InvalidDataReference => InvokeError::InvalidAddress,
            FaultCode::AccessViolation | FaultCode::NoExecute => InvokeError::NoAccess,
            FaultCode::MalformedSpace => InvokeError::MalformedSpace,
            FaultCode::DataAccessTypeError | FaultCode::CapAccessTypeError => {
                InvokeError::CapAccessTypeError
            }
        }
    }
}

/// A slot read at an explicit granularity
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExtendedSlot {
    pub cap: Capability,
    /// `l2v` of the GPT holding the slot, 0 if the invoked reference itself was returned
    pub l2v: u8,
    /// Restrictions accumulated on the way to the GPT holding the slot
    pub restrictions: Restrictions,
}

/// The GPT a capability invokes, rejecting opaque references
fn invoked_gpt(cap: Capability) -> Result<ObjectRef, InvokeError> {
    match cap.memory_object() {
        Some((ObjectKind::Gpt, obj)) => {
            if cap.restrictions().contains(Restrictions::OPAQUE) {
                Err(InvokeError::OpaqueSpace)
            } else {
                Ok(obj)
            }
        }
        _ => Err(InvokeError::InvalidCapability),
    }
}

/// The GPT a capability invokes if the capability permits changing it
fn invoked_gpt_mut(cap: Capability) -> Result<ObjectRef, InvokeError> {
    let obj = invoked_gpt(cap)?;
    if cap.restrictions().intersects(Restrictions::NO_WRITE) {
        return Err(InvokeError::NoAccess);
    }
    Ok(obj)
}

fn check_slot(slot: usize) -> Result<(), InvokeError> {
    if slot >= NUM_GPT_SLOTS {
        return Err(InvokeError::RequestError);
    }
    Ok(())
}

/// Turn a walk into the error it ended with, reporting opacity before anything else
fn check_walk(walk: &Walk) -> Result<(), InvokeError> {
    if walk.restrictions.contains(Restrictions::OPAQUE) {
        return Err(InvokeError::OpaqueSpace);
    }
    match walk.fault {
        Some(fault) => Err(fault.into()),
        None => Ok(()),
    }
}

/// Validate the arguments of an extended fetch or store
fn check_extended(offset: u64, l2arg: u8) -> Result<(), InvokeError> {
    if !(PAGE_ADDR_BITS..=ADDR_BITS).contains(&l2arg) {
        return Err(InvokeError::RequestError);
    }
    if l2arg == ADDR_BITS && offset != 0 {
        return Err(InvokeError::RequestError);
    }
    if low_bits(offset, l2arg) != 0 {
        return Err(InvokeError::RequestError);
    }
    Ok(())
}

impl<T: TlbFlush> MemoryContext<T> {
    /// Read slot `slot` of the invoked GPT.
    ///
    /// Reading through a read-only or weak reference yields a weakened copy.
    pub fn get_slot(&self, gpt: Capability, slot: usize) -> Result<Capability, InvokeError> {
        let obj = invoked_gpt(gpt)?;
        check_slot(slot)?;
        let cap = self
            .store()
            .with_gpt(obj, |g| g.slots[slot])
            .ok_or(InvokeError::InvalidCapability)?;
        if gpt.restrictions().intersects(Restrictions::NO_WRITE) {
            Ok(cap.weaken())
        } else {
            Ok(cap)
        }
    }

    /// Overwrite slot `slot` of the invoked GPT with `cap`
    pub fn set_slot(
        &self,
        gpt: Capability,
        slot: usize,
        cap: Capability,
    ) -> Result<(), InvokeError> {
        let obj = invoked_gpt_mut(gpt)?;
        check_slot(slot)?;
        log::debug!("[ops] setting slot {slot} of {obj:?} to {cap:?}");
        self.replace_slot(obj, slot, None, cap)
            .ok_or(InvokeError::InvalidCapability)?;
        Ok(())
    }

    /// Overwrite slot `slot` of the invoked GPT with `cap` reachable through `guard`
    pub fn guarded_set_slot(
        &self,
        gpt: Capability,
        slot: usize,
        cap: Capability,
        guard: Guard,
    ) -> Result<(), InvokeError> {
        self.set_slot(gpt, slot, cap.with_guard(guard))
    }

    pub fn get_l2v(&self, gpt: Capability) -> Result<u8, InvokeError> {
        let obj = invoked_gpt(gpt)?;
        self.store()
            .with_gpt(obj, |g| g.l2v)
            .ok_or(InvokeError::InvalidCapability)
    }

    /// Change the size of the slots of the invoked GPT and return the previous one
    pub fn set_l2v(&self, gpt: Capability, l2v: u8) -> Result<u8, InvokeError> {
        let obj = invoked_gpt_mut(gpt)?;
        if !(PAGE_ADDR_BITS..=MAX_L2V).contains(&l2v) {
            return Err(InvokeError::RequestError);
        }
        self.modify_gpt(obj, |g| core::mem::replace(&mut g.l2v, l2v))
            .ok_or(InvokeError::InvalidCapability)
    }

    pub fn get_handler(&self, gpt: Capability) -> Result<bool, InvokeError> {
        let obj = invoked_gpt(gpt)?;
        self.store()
            .with_gpt(obj, |g| g.has_handler)
            .ok_or(InvokeError::InvalidCapability)
    }

    /// Reserve (or release) the handler slot of the invoked GPT and return the previous setting.
    ///
    /// Since the flag halves the addressable range of the GPT, every address below it may now resolve
    /// differently.
    pub fn set_handler(&self, gpt: Capability, has_handler: bool) -> Result<bool, InvokeError> {
        let obj = invoked_gpt_mut(gpt)?;
        self.modify_gpt(obj, |g| core::mem::replace(&mut g.has_handler, has_handler))
            .ok_or(InvokeError::InvalidCapability)
    }

    /// Reset the invoked GPT to the state of a freshly allocated one
    pub fn erase(&self, gpt: Capability) -> Result<(), InvokeError> {
        let obj = invoked_gpt_mut(gpt)?;
        if gpt.restrictions().contains(Restrictions::NO_REMOVE) {
            return Err(InvokeError::NoAccess);
        }
        log::debug!("[ops] erasing {obj:?}");
        self.modify_gpt(obj, |g| g.erase())
            .ok_or(InvokeError::InvalidCapability)
    }

    /// Replace the content of the invoked GPT with a copy of the GPT `source` refers to.
    ///
    /// The copy is weakened if `source` is weak. Returns the invoked capability carrying the guard of
    /// `source` so that it can stand in for it.
    pub fn copy_from(
        &self,
        gpt: Capability,
        source: Capability,
    ) -> Result<Capability, InvokeError> {
        let obj = invoked_gpt_mut(gpt)?;
        let Some((ObjectKind::Gpt, source_obj)) = source.memory_object() else {
            return Err(InvokeError::RequestError);
        };
        if source.restrictions().contains(Restrictions::OPAQUE) {
            return Err(InvokeError::RequestError);
        }
        let mut copy = self
            .store()
            .gpt(source_obj)
            .ok_or(InvokeError::RequestError)?;
        if source.restrictions().contains(Restrictions::WEAK) {
            copy = copy.weakened();
        }
        log::debug!("[ops] copying {source_obj:?} into {obj:?}");
        self.modify_gpt(obj, |g| *g = copy)
            .ok_or(InvokeError::InvalidCapability)?;
        Ok(gpt.with_guard(source.guard()))
    }

    /// Read the capability stored at capability address `addr` of `space`
    pub fn fetch_cap(&self, space: Capability, addr: u64) -> Result<Capability, InvokeError> {
        let (caps, index, restr) = self.cap_slot(space, addr, false)?;
        let cap = self
            .store()
            .with_object(caps, |object| match object {
                Object::CapPage(caps) => Some(caps[index]),
                _ => None,
            })
            .flatten()
            .ok_or(InvokeError::InvalidAddress)?;
        if restr.contains(Restrictions::WEAK) {
            Ok(cap.weaken())
        } else {
            Ok(cap)
        }
    }

    /// Write `cap` to capability address `addr` of `space`
    pub fn store_cap(
        &self,
        space: Capability,
        addr: u64,
        cap: Capability,
    ) -> Result<(), InvokeError> {
        let (caps, index, _) = self.cap_slot(space, addr, true)?;
        log::trace!("[ops] storing {cap:?} at capability address {addr:#x}");
        self.store()
            .with_cap_page_mut(caps, |caps| caps[index] = cap)
            .ok_or(InvokeError::InvalidAddress)
    }

    /// The capability page and index that capability address `addr` resolves to
    fn cap_slot(
        &self,
        space: Capability,
        addr: u64,
        for_write: bool,
    ) -> Result<(ObjectRef, usize, Restrictions), InvokeError> {
        if addr % CAP_SIZE as u64 != 0 {
            return Err(InvokeError::RequestError);
        }
        let walk = walk(self.store(), space, addr, for_write);
        check_walk(&walk)?;
        let leaf = walk.leaf().ok_or(InvokeError::InvalidAddress)?;
        if leaf.kind != ObjectKind::CapPage {
            return Err(InvokeError::CapAccessTypeError);
        }
        Ok((leaf.object, leaf.rem_addr as usize / CAP_SIZE, walk.restrictions))
    }

    /// Read the slot covering `offset` of the GPT whose slots span `2^l2arg` bytes.
    ///
    /// If no GPT along the path is that coarse, the invoked reference itself is returned with an `l2v` of 0.
    pub fn extended_fetch(
        &self,
        space: Capability,
        offset: u64,
        l2arg: u8,
    ) -> Result<ExtendedSlot, InvokeError> {
        check_extended(offset, l2arg)?;
        let walk = extended_walk(self.store(), space, offset, l2arg, false);
        check_walk(&walk)?;
        let Some(last) = walk.last() else {
            return Ok(ExtendedSlot {
                cap: space,
                l2v: 0,
                restrictions: Restrictions::empty(),
            });
        };

        let index = shift_down(last.rem_addr, last.l2v) as usize;
        let cap = self
            .store()
            .with_gpt(last.object, |g| {
                (index < g.addressable_slots()).then_some(g.slots[index])
            })
            .ok_or(InvokeError::InvalidAddress)?
            .ok_or(InvokeError::NoSuchSlot)?;
        Ok(ExtendedSlot {
            cap: if walk.restrictions.contains(Restrictions::WEAK) {
                cap.weaken()
            } else {
                cap
            },
            l2v: last.l2v,
            restrictions: walk.restrictions,
        })
    }

    /// Write `cap` into the slot covering `offset` of the GPT whose slots span exactly `2^l2arg` bytes,
    /// replacing its guard with `guard` if one is given.
    pub fn extended_store(
        &self,
        space: Capability,
        offset: u64,
        l2arg: u8,
        guard: Option<Guard>,
        cap: Capability,
    ) -> Result<(), InvokeError> {
        check_extended(offset, l2arg)?;
        let walk = extended_walk(self.store(), space, offset, l2arg, true);
        check_walk(&walk)?;
        let last = match walk.last() {
            Some(last) if last.l2v == l2arg => last,
            _ => return Err(InvokeError::NoSuchSlot),
        };

        let index = shift_down(last.rem_addr, last.l2v) as usize;
        let addressable = self
            .store()
            .with_gpt(last.object, |g| index < g.addressable_slots())
            .ok_or(InvokeError::InvalidAddress)?;
        if !addressable {
            return Err(InvokeError::NoSuchSlot);
        }
        let cap = match guard {
            Some(guard) => cap.with_guard(guard),
            None => cap,
        };
        log::debug!(
            "[ops] storing {cap:?} into slot {index} of {:?} at l2 {l2arg}",
            last.object
        );
        self.replace_slot(last.object, index, None, cap)
            .ok_or(InvokeError::InvalidAddress)?;
        Ok(())
    }

    /// Destroy the object `cap` refers to and return it to `bank`.
    ///
    /// References to the object that remain in other slots read as null from then on.
    pub fn destroy(&self, bank: &impl Bank, cap: Capability) -> Result<(), InvokeError> {
        let Some((kind, obj)) = cap.memory_object() else {
            return Err(InvokeError::InvalidCapability);
        };
        if cap
            .restrictions()
            .intersects(Restrictions::NO_DESTROY | Restrictions::NO_WRITE)
        {
            return Err(InvokeError::NoAccess);
        }
        match self.store().owner_of(obj) {
            None => return Err(InvokeError::InvalidCapability),
            Some(owner) if owner != bank.id() => return Err(InvokeError::NoAccess),
            Some(_) => {}
        }

        log::debug!("[ops] destroying {obj:?}");
        // the object stays locked from its invalidation until it is gone
        bank.free_with(obj, || match kind {
            ObjectKind::Gpt => self.projection().invalidate_object(obj.id),
            ObjectKind::Page | ObjectKind::CapPage => self.projection().unmap_frame(obj.id),
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::hwmap::tlb::CountingTlb;
    use crate::hwmap::Access;
    use crate::store::{BankId, SpaceBank};

    fn context() -> MemoryContext<CountingTlb> {
        MemoryContext::new(Config::default(), CountingTlb::new()).unwrap()
    }

    fn cap(kind: ObjectKind, obj: ObjectRef, restr: Restrictions, guard: Guard) -> Capability {
        Capability::memory(kind, obj, restr, guard)
    }

    /// A root with l2v 16 holding a data page in slot 1, a capability page in slot 2 and a GPT with l2v 12
    /// in slot 5
    struct Space {
        root: Capability,
        page: ObjectRef,
        caps: ObjectRef,
        child: ObjectRef,
    }

    fn space(context: &MemoryContext<CountingTlb>, bank: &impl Bank) -> Space {
        let root = bank.allocate(ObjectKind::Gpt).unwrap();
        let page = bank.allocate(ObjectKind::Page).unwrap();
        let caps = bank.allocate(ObjectKind::CapPage).unwrap();
        let child = bank.allocate(ObjectKind::Gpt).unwrap();
        context.store().with_gpt_mut(child, |g| g.l2v = 12);
        context.store().with_gpt_mut(root, |g| {
            g.l2v = 16;
            let guard = Guard::span(16).unwrap();
            g.slots[1] = cap(ObjectKind::Page, page, Restrictions::empty(), guard);
            g.slots[2] = cap(ObjectKind::CapPage, caps, Restrictions::empty(), guard);
            g.slots[5] = cap(ObjectKind::Gpt, child, Restrictions::empty(), guard);
        });
        Space {
            root: cap(ObjectKind::Gpt, root, Restrictions::empty(), Guard::span(20).unwrap()),
            page,
            caps,
            child,
        }
    }

    #[test]
    fn test_set_slot_removes_derived_translations() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0010, Access::READ).unwrap();

        // act
        context.set_slot(space.root, 1, Capability::NULL).unwrap();

        // assert
        assert_eq!(context.projection().translate(resolution.root, 0x1_0010), None);
        assert_eq!(
            context.handle_fault(space.root, 0x1_0010, Access::READ),
            Err(FaultCode::InvalidDataReference)
        );
        assert_eq!(context.get_slot(space.root, 1), Ok(Capability::NULL));
    }

    #[test]
    fn test_restricted_invocations() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let read_only = space.root.with_restrictions(Restrictions::READ_ONLY);
        let opaque = space.root.with_restrictions(Restrictions::OPAQUE);
        let no_remove = space.root.with_restrictions(Restrictions::NO_REMOVE);

        assert_eq!(
            context.set_slot(read_only, 1, Capability::NULL),
            Err(InvokeError::NoAccess)
        );
        assert_eq!(context.erase(read_only), Err(InvokeError::NoAccess));
        assert_eq!(context.set_l2v(read_only, 20), Err(InvokeError::NoAccess));
        assert_eq!(context.set_handler(read_only, true), Err(InvokeError::NoAccess));
        assert_eq!(context.erase(no_remove), Err(InvokeError::NoAccess));
        assert_eq!(context.get_slot(opaque, 1), Err(InvokeError::OpaqueSpace));
        assert_eq!(context.get_l2v(opaque), Err(InvokeError::OpaqueSpace));
        assert_eq!(context.fetch_cap(opaque, 0x2_0000), Err(InvokeError::OpaqueSpace));
        assert_eq!(
            context.get_slot(Capability::entry(3), 0),
            Err(InvokeError::InvalidCapability)
        );

        // nothing was changed by any of the above
        assert_eq!(context.get_l2v(space.root), Ok(16));
        assert!(!context.get_slot(space.root, 1).unwrap().is_null());
    }

    #[test]
    fn test_get_slot_weakens_through_read_only_references() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);

        let fetched = context
            .get_slot(space.root.with_restrictions(Restrictions::READ_ONLY), 5)
            .unwrap();

        assert_eq!(
            fetched.restrictions(),
            Restrictions::WEAK | Restrictions::READ_ONLY
        );
        assert_eq!(fetched.memory_object(), Some((ObjectKind::Gpt, space.child)));
    }

    #[test]
    fn test_argument_errors() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);

        assert_eq!(context.get_slot(space.root, 16), Err(InvokeError::RequestError));
        assert_eq!(
            context.set_slot(space.root, 16, Capability::NULL),
            Err(InvokeError::RequestError)
        );
        assert_eq!(context.set_l2v(space.root, 11), Err(InvokeError::RequestError));
        assert_eq!(context.set_l2v(space.root, 64), Err(InvokeError::RequestError));
        assert_eq!(context.fetch_cap(space.root, 0x2_0008), Err(InvokeError::RequestError));
        assert_eq!(
            context.extended_fetch(space.root, 0x5_8001, 12),
            Err(InvokeError::RequestError)
        );
        assert_eq!(
            context.extended_fetch(space.root, 0x1000, 64),
            Err(InvokeError::RequestError)
        );
        assert_eq!(
            context.extended_fetch(space.root, 0, 11),
            Err(InvokeError::RequestError)
        );
    }

    #[test]
    fn test_set_l2v_and_handler_invalidate_everything() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0000, Access::READ).unwrap();

        // act
        assert_eq!(context.set_handler(space.root, true), Ok(false));

        // assert
        assert_eq!(context.get_handler(space.root), Ok(true));
        assert_eq!(context.projection().translate(resolution.root, 0x1_0000), None);

        // act
        assert_eq!(context.set_l2v(space.root, 17), Ok(16));

        // assert
        assert_eq!(context.get_l2v(space.root), Ok(17));
        assert_eq!(
            context.handle_fault(space.root, 0x1_0000, Access::READ).map(|_| ()),
            Err(FaultCode::InvalidDataReference)
        );
    }

    #[test]
    fn test_erase_resets_the_gpt() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0000, Access::READ).unwrap();

        context.erase(space.root).unwrap();

        assert_eq!(context.get_l2v(space.root), Ok(PAGE_ADDR_BITS));
        assert_eq!(context.get_slot(space.root, 1), Ok(Capability::NULL));
        assert_eq!(context.projection().translate(resolution.root, 0x1_0000), None);
    }

    #[test]
    fn test_copy_from_weak_source() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let target = bank.allocate(ObjectKind::Gpt).unwrap();
        let target = cap(ObjectKind::Gpt, target, Restrictions::empty(), Guard::FULL);
        let source = space
            .root
            .with_restrictions(Restrictions::WEAK | Restrictions::READ_ONLY);

        // act
        let copied = context.copy_from(target, source).unwrap();

        // assert
        assert_eq!(copied.guard(), space.root.guard());
        assert_eq!(copied.memory_object(), target.memory_object());
        assert_eq!(context.get_l2v(target), Ok(16));
        let slot = context.get_slot(target, 1).unwrap();
        assert_eq!(slot.memory_object(), Some((ObjectKind::Page, space.page)));
        assert!(slot.restrictions().contains(Restrictions::WEAK));
        // the source is unaffected
        assert_eq!(
            context.get_slot(space.root, 1).unwrap().restrictions(),
            Restrictions::empty()
        );
    }

    #[test]
    fn test_copy_from_rejects_bad_sources() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let page = cap(ObjectKind::Page, space.page, Restrictions::empty(), Guard::PAGE);

        assert_eq!(
            context.copy_from(space.root, page),
            Err(InvokeError::RequestError)
        );
        assert_eq!(
            context.copy_from(space.root, space.root.with_restrictions(Restrictions::OPAQUE)),
            Err(InvokeError::RequestError)
        );
    }

    #[test]
    fn test_store_then_fetch_returns_the_stored_capability() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let value = cap(ObjectKind::Page, space.page, Restrictions::NO_EXECUTE, Guard::PAGE);

        // act
        context.store_cap(space.root, 0x2_0030, value).unwrap();

        // assert
        assert_eq!(context.fetch_cap(space.root, 0x2_0030), Ok(value));
        assert_eq!(context.fetch_cap(space.root, 0x2_0040), Ok(Capability::NULL));
        assert_eq!(
            context.fetch_cap(space.root.with_restrictions(Restrictions::WEAK), 0x2_0030),
            Ok(value.weaken())
        );
        let stored = context
            .store()
            .with_object(space.caps, |object| match object {
                Object::CapPage(caps) => caps[3],
                _ => Capability::NULL,
            });
        assert_eq!(stored, Some(value));
    }

    #[test]
    fn test_store_failures() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);

        assert_eq!(
            context.store_cap(
                space.root.with_restrictions(Restrictions::READ_ONLY),
                0x2_0000,
                Capability::NULL
            ),
            Err(InvokeError::NoAccess)
        );
        assert_eq!(
            context.store_cap(space.root, 0x1_0000, Capability::NULL),
            Err(InvokeError::CapAccessTypeError)
        );
        assert_eq!(
            context.store_cap(space.root, 0x3_0000, Capability::NULL),
            Err(InvokeError::InvalidAddress)
        );
    }

    #[test]
    fn test_extended_store_and_fetch() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let value = cap(ObjectKind::Page, space.page, Restrictions::empty(), Guard::FULL);

        // act
        context
            .extended_store(space.root, 0x5_8000, 12, Some(Guard::PAGE), value)
            .unwrap();

        // assert
        let fetched = context.extended_fetch(space.root, 0x5_8000, 12).unwrap();
        assert_eq!(fetched.l2v, 12);
        assert_eq!(fetched.cap, value.with_guard(Guard::PAGE));
        let resolved = crate::walk::resolve(context.store(), space.root, 0x5_8123);
        assert_eq!(resolved, Ok((ObjectKind::Page, space.page, 0x123)));

        let parent = context.extended_fetch(space.root, 0x5_0000, 16).unwrap();
        assert_eq!(parent.l2v, 16);
        assert_eq!(parent.cap.memory_object(), Some((ObjectKind::Gpt, space.child)));

        let invoked = context.extended_fetch(space.root, 0, 64).unwrap();
        assert_eq!(invoked.cap, space.root);
        assert_eq!(invoked.l2v, 0);
    }

    #[test]
    fn test_extended_store_requires_exact_granularity() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);

        assert_eq!(
            context.extended_store(space.root, 0x5_8000, 14, None, Capability::NULL),
            Err(InvokeError::NoSuchSlot)
        );
        assert_eq!(
            context.extended_store(space.root, 0, 64, None, Capability::NULL),
            Err(InvokeError::NoSuchSlot)
        );
        assert_eq!(
            context.extended_store(
                space.root.with_restrictions(Restrictions::WEAK),
                0x5_8000,
                12,
                None,
                Capability::NULL
            ),
            Err(InvokeError::NoAccess)
        );
    }

    #[test]
    fn test_extended_store_invalidates_the_replaced_slot() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0000, Access::READ).unwrap();

        // act
        context
            .extended_store(space.root, 0x1_0000, 16, None, Capability::NULL)
            .unwrap();

        // assert
        assert_eq!(context.projection().translate(resolution.root, 0x1_0000), None);
    }

    #[test]
    fn test_destroy_page() {
        // arrange
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0000, Access::WRITE).unwrap();
        let page = cap(ObjectKind::Page, space.page, Restrictions::empty(), Guard::PAGE);

        // act
        context.destroy(&bank, page).unwrap();

        // assert
        assert!(!context.store().is_live(space.page));
        assert_eq!(context.projection().translate(resolution.root, 0x1_0000), None);
        assert_eq!(
            context.handle_fault(space.root, 0x1_0000, Access::READ).map(|_| ()),
            Err(FaultCode::InvalidDataReference)
        );
        assert_eq!(context.destroy(&bank, page), Err(InvokeError::InvalidCapability));
        assert_eq!(bank.live(), 3);
    }

    #[test]
    fn test_destroy_gpt_recalls_its_tables() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let space = space(&context, &bank);
        let resolution = context.handle_fault(space.root, 0x1_0000, Access::READ).unwrap();

        context.destroy(&bank, space.root).unwrap();

        assert!(!context.projection().is_current(resolution.root));
        assert_eq!(context.get_l2v(space.root), Err(InvokeError::InvalidCapability));
    }

    #[test]
    fn test_destroy_permissions() {
        let context = context();
        let bank = SpaceBank::new(BankId(1), context.store());
        let other = SpaceBank::new(BankId(2), context.store());
        let space = space(&context, &bank);

        assert_eq!(
            context.destroy(&bank, space.root.with_restrictions(Restrictions::NO_DESTROY)),
            Err(InvokeError::NoAccess)
        );
        assert_eq!(context.destroy(&other, space.root), Err(InvokeError::NoAccess));
        assert_eq!(
            context.destroy(&bank, Capability::entry(1)),
            Err(InvokeError::InvalidCapability)
        );
        assert!(context.store().is_live(space.root.memory_object().unwrap().1));
    }
}
