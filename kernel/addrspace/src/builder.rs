//! Static insertion of subspaces into address spaces while authoring an [`Image`].
//!
//! Insertion never changes what any address outside the inserted range resolves to. Where the existing tree
//! has no slot of the requested size at the requested offset, it is restructured by
//! - wrapping guarded references in new GPTs at the first bit where their guard and the offset disagree,
//! - raising the `l2v` of GPTs whose slots are too small and pushing their content down into new GPTs.

use crate::cap::{Capability, Restrictions};
use crate::guard::{
    high_bits, l2_offset, low_bits, round_up, shift_down, shift_up, Guard, GuardError,
};
use crate::image::Image;
use crate::object::{ObjectKind, ObjectRef, ObjectSource};
use crate::store::BankId;
use crate::{ADDR_BITS, GPT_SLOT_INDEX_BITS, MAX_L2V, PAGE_ADDR_BITS};
use alloc::vec::Vec;
use thiserror_no_std::Error;

#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum BuildError {
    #[error("the image has no room for further objects")]
    Exhausted,
    #[error("offset {offset:#x} is not aligned to 2^{l2}")]
    Misaligned { offset: u64, l2: u8 },
    #[error("offset {offset:#x} lies outside of a slot spanning 2^{l2} bytes")]
    OffsetOutOfRange { offset: u64, l2: u8 },
    #[error("a size of 2^{0} bytes is not supported here")]
    SizeOutOfRange(u8),
    #[error("{0} bytes do not fit into a page")]
    ContentTooLarge(usize),
    #[error("the capability does not refer to memory")]
    NotMemory,
    #[error("the capability does not refer to an address space")]
    NotAddressSpace,
    #[error("the address space is not well formed")]
    MalformedSpace,
    #[error("could not construct a guard: {0}")]
    Guard(#[from] GuardError),
}

/// A position in an address space that holds a capability
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Location {
    /// The root capability of the space itself
    Root,
    Slot { gpt: ObjectRef, slot: usize },
}

/// Where [`Image::traverse_to_slot`] found room for an insertion
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Position {
    location: Location,
    /// Offset of the insertion relative to the start of the location
    offset: u64,
    /// log2 of the span of the location
    l2: u8,
}

/// The outcome of inserting a subspace
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Inserted {
    /// The new root of the address space, which may differ from the old one in restrictions and guard
    pub root: Capability,
    /// What was previously stored at the insertion point
    pub displaced: Capability,
}

/// Check that something spanning `2^l2g` bytes can be placed at `offset` within a slot of `2^l2_limit` bytes
fn check_placement(l2g: u8, offset: u64, l2_limit: u8) -> Result<(), BuildError> {
    if l2g > l2_limit {
        return Err(BuildError::SizeOutOfRange(l2g));
    }
    if low_bits(offset, l2g) != 0 {
        return Err(BuildError::Misaligned { offset, l2: l2g });
    }
    if shift_down(offset, l2_limit) != 0 {
        return Err(BuildError::OffsetOutOfRange {
            offset,
            l2: l2_limit,
        });
    }
    Ok(())
}

impl Image {
    fn load(&self, root: &Capability, location: Location) -> Result<Capability, BuildError> {
        match location {
            Location::Root => Ok(*root),
            Location::Slot { gpt, slot } => self
                .with_gpt(gpt, |gpt| gpt.slots[slot])
                .ok_or(BuildError::NotAddressSpace),
        }
    }

    fn store(
        &mut self,
        root: &mut Capability,
        location: Location,
        cap: Capability,
    ) -> Result<(), BuildError> {
        match location {
            Location::Root => *root = cap,
            Location::Slot { gpt, slot } => self.gpt_mut(gpt)?.slots[slot] = cap,
        }
        Ok(())
    }

    /// Place `space` at `offset` by folding the offset into its guard.
    ///
    /// Whatever does not fit into the guard's match field is handled by wrapping the capability into a new GPT
    /// and continuing with that GPT until the offset is fully absorbed. The existing match of `space` is ignored.
    /// The result spans at most `2^l2_limit` bytes so that it fits into a slot of that size.
    pub fn make_guarded_subspace(
        &mut self,
        bank: BankId,
        space: Capability,
        offset: u64,
        l2_limit: u8,
    ) -> Result<Capability, BuildError> {
        if space.is_null() {
            return Ok(space);
        }
        if !space.is_memory() {
            return Err(BuildError::NotMemory);
        }
        check_placement(space.guard().l2g(), offset, l2_limit)?;

        let match_bits = self.guard_match_bits();
        let mut cap = space;
        let mut offset = offset;
        loop {
            let l2g = cap.guard().l2g();
            let match_value = low_bits(shift_down(offset, l2g), match_bits);
            cap = cap.with_guard(Guard::new(match_value, l2g)?);
            offset = high_bits(offset, l2g + match_bits);
            if offset == 0 {
                return Ok(cap);
            }

            // the guard overflowed so the capability needs a larger space around it
            let l2v = l2g + match_bits;
            let wrapper_l2g = (l2v + GPT_SLOT_INDEX_BITS).min(l2_limit);
            let slot = low_bits(shift_down(offset, l2v), wrapper_l2g - l2v) as usize;
            let wrapper = self.alloc(ObjectKind::Gpt, bank)?;
            let gpt = self.gpt_mut(wrapper)?;
            gpt.l2v = l2v;
            gpt.slots[slot] = cap;
            log::debug!("[builder] wrapped {cap:?} into slot {slot} of {wrapper:?} (l2v {l2v})");

            cap = Capability::memory(
                ObjectKind::Gpt,
                wrapper,
                cap.restrictions() - Restrictions::OPAQUE,
                Guard::span(wrapper_l2g)?,
            );
            offset = high_bits(offset, wrapper_l2g);
        }
    }

    /// Prepare a GPT so that a slot of at least `2^l2arg` bytes exists at `offset`.
    ///
    /// This raises the GPT's `l2v` if its slots are too small or if its slots do not reach up to `offset`.
    /// Content of the old slots is moved into new GPTs below the raised slots, or folded into the guard if it is
    /// the only reference that ends up in a raised slot. The address space is the same before and after.
    fn split_gpt(
        &mut self,
        bank: BankId,
        obj: ObjectRef,
        offset: u64,
        l2arg: u8,
    ) -> Result<(), BuildError> {
        let gpt = self.gpt(obj).ok_or(BuildError::NotAddressSpace)?;
        let l2slots = gpt.slot_index_bits();
        let l2v = gpt.l2v;
        let l2vpslot = l2v + l2slots;

        if l2v >= l2arg && high_bits(offset, l2vpslot) == 0 {
            return Ok(());
        }

        let new_l2v = if high_bits(offset, l2vpslot) != 0 {
            let desired = l2v + round_up(l2_offset(offset) - l2v, GPT_SLOT_INDEX_BITS);
            let new_l2vpslot = desired.min(ADDR_BITS);
            (new_l2vpslot - l2slots).max(l2arg)
        } else {
            l2arg
        };
        if new_l2v > MAX_L2V {
            return Err(BuildError::SizeOutOfRange(new_l2v));
        }
        debug_assert!(new_l2v > l2v);

        let slot_max = 1usize << l2slots;
        let mut caps = Vec::with_capacity(slot_max);
        for j in 0..slot_max {
            let slot_offset = shift_up(j as u64, new_l2v);
            if shift_down(slot_offset, new_l2v) != j as u64
                || high_bits(slot_offset, l2vpslot) != 0
            {
                caps.push(Capability::NULL);
                continue;
            }

            let max_off = slot_max.min(shift_down(shift_up(1, new_l2v), l2v) as usize);
            let base_off = shift_down(slot_offset, l2v) as usize;
            let old = &gpt.slots[base_off..base_off + max_off];
            let mut occupied = old.iter().enumerate().filter(|(_, cap)| !cap.is_null());

            match (occupied.next(), occupied.next()) {
                (None, _) => {
                    caps.push(Capability::NULL);
                    continue;
                }
                (Some((last_slot, cap)), None)
                    if cap.is_memory() && high_bits(cap.guard().value(), l2v) == 0 =>
                {
                    // a single reachable reference does not need its own GPT
                    let new_guard = cap.guard().value() | shift_up(last_slot as u64, l2v);
                    let shrunk = cap.with_guard(Guard::span(cap.guard().l2g().min(l2v))?);
                    caps.push(self.make_guarded_subspace(bank, shrunk, new_guard, new_l2v)?);
                    continue;
                }
                _ => {}
            }

            let sub = self.alloc(ObjectKind::Gpt, bank)?;
            let sub_gpt = self.gpt_mut(sub)?;
            sub_gpt.l2v = l2v;
            sub_gpt.slots[..max_off].copy_from_slice(old);
            caps.push(Capability::memory(
                ObjectKind::Gpt,
                sub,
                Restrictions::empty(),
                Guard::span((l2v + GPT_SLOT_INDEX_BITS).min(new_l2v))?,
            ));
        }

        log::debug!("[builder] splitting {obj:?} from l2v {l2v} to {new_l2v}");
        let gpt = self.gpt_mut(obj)?;
        gpt.slots[..slot_max].copy_from_slice(&caps);
        gpt.l2v = new_l2v;
        Ok(())
    }

    /// Find (or make) the slot of exactly `2^l2arg` bytes which contains `offset`.
    ///
    /// Every location on the way is stripped of the restrictions not contained in `restr` once the slot was
    /// found, so that the inserted subspace is not more restricted than it was meant to be.
    fn traverse_to_slot(
        &mut self,
        bank: BankId,
        root: &mut Capability,
        offset: u64,
        l2arg: u8,
        restr: Restrictions,
    ) -> Result<Position, BuildError> {
        if !(PAGE_ADDR_BITS..=ADDR_BITS).contains(&l2arg) {
            return Err(BuildError::SizeOutOfRange(l2arg));
        }
        if low_bits(offset, l2arg) != 0 {
            return Err(BuildError::Misaligned { offset, l2: l2arg });
        }

        let mut path = Vec::new();
        let mut location = Location::Root;
        let mut offset = offset;
        let mut l2_limit = ADDR_BITS;
        let mut last_l2v: Option<u8> = None;

        let position = loop {
            let space = self.load(root, location)?;
            if space.is_null() {
                break Position {
                    location,
                    offset,
                    l2: l2_limit,
                };
            }
            let Some((kind, obj)) = space.memory_object() else {
                return Err(BuildError::NotMemory);
            };

            let base_l2 = space.guard().l2g();
            let l2s = l2arg.max(base_l2);
            let guard = space.guard().value();
            let mismatch = high_bits(offset ^ guard, l2s);

            if mismatch != 0 {
                // split the space at the highest differing bit by putting a new GPT in its place
                let l2_mismatch = l2_offset(mismatch);
                if l2_mismatch > l2_limit {
                    log::warn!(
                        "[builder] guard of {space:?} reaches beyond its slot of 2^{l2_limit} bytes"
                    );
                    return Err(BuildError::MalformedSpace);
                }
                let l2g_desired = base_l2 + round_up(l2_mismatch - base_l2, GPT_SLOT_INDEX_BITS);
                let new_l2g = l2g_desired.min(l2_limit);
                let new_l2v = (new_l2g - GPT_SLOT_INDEX_BITS).max(l2s);
                let l2slots = new_l2g - new_l2v;
                let space_slot = low_bits(shift_down(guard, new_l2v), l2slots) as usize;
                let arg_slot = low_bits(shift_down(offset, new_l2v), l2slots) as usize;
                debug_assert_ne!(space_slot, arg_slot);

                // nothing is allocated unless both halves are known to fit
                if new_l2v > MAX_L2V {
                    return Err(BuildError::SizeOutOfRange(new_l2v));
                }
                check_placement(base_l2, low_bits(guard, new_l2v), new_l2v)?;
                check_placement(new_l2g, high_bits(guard, new_l2g), l2_limit)?;

                let new = self.alloc(ObjectKind::Gpt, bank)?;
                let moved = self.make_guarded_subspace(
                    bank,
                    space.with_guard(Guard::span(base_l2)?),
                    low_bits(guard, new_l2v),
                    new_l2v,
                )?;
                let gpt = self.gpt_mut(new)?;
                gpt.l2v = new_l2v;
                gpt.slots[space_slot] = moved;
                log::debug!(
                    "[builder] inserted {new:?} (l2v {new_l2v}) above {space:?} at {offset:#x}"
                );

                let new_cap = Capability::memory(
                    ObjectKind::Gpt,
                    new,
                    restr & (space.restrictions() | Restrictions::OPAQUE),
                    Guard::span(new_l2g)?,
                );
                let placed =
                    self.make_guarded_subspace(bank, new_cap, high_bits(guard, new_l2g), l2_limit)?;
                self.store(root, location, placed)?;
                break Position {
                    location: Location::Slot {
                        gpt: new,
                        slot: arg_slot,
                    },
                    offset: low_bits(offset, new_l2v),
                    l2: new_l2v,
                };
            }

            if base_l2 <= l2arg {
                // the space is replaced entirely
                break Position {
                    location,
                    offset,
                    l2: l2_limit,
                };
            }

            offset = low_bits(offset, base_l2);
            if kind != ObjectKind::Gpt {
                return Err(BuildError::NotAddressSpace);
            }

            self.split_gpt(bank, obj, offset, l2arg)?;
            let (l2v, addressable) = self
                .with_gpt(obj, |gpt| (gpt.l2v, gpt.addressable_slots()))
                .ok_or(BuildError::NotAddressSpace)?;
            if last_l2v.is_some_and(|last| l2v >= last) {
                log::warn!(
                    "[builder] l2v of {obj:?} does not decrease along the path to {offset:#x}"
                );
                return Err(BuildError::MalformedSpace);
            }
            last_l2v = Some(l2v);

            let arg_slot = shift_down(offset, l2v) as usize;
            if arg_slot >= addressable {
                return Err(BuildError::MalformedSpace);
            }
            path.push(location);
            location = Location::Slot {
                gpt: obj,
                slot: arg_slot,
            };
            offset = low_bits(offset, l2v);
            l2_limit = l2v;

            if l2v == l2arg {
                break Position {
                    location,
                    offset,
                    l2: l2_limit,
                };
            }
        };

        for location in path {
            let cap = self.load(root, location)?;
            let narrowed = cap.restrictions() & (restr | Restrictions::OPAQUE);
            self.store(root, location, cap.with_restrictions(narrowed))?;
        }
        Ok(position)
    }

    /// Insert `subspace` into `space` so that it covers `2^l2arg` bytes at `offset`.
    ///
    /// `l2arg` defaults to the natural size of the subspace (its guard's `l2g`, or a page for null). Inserting
    /// null removes whatever was mapped in that range. Returns the new root of the space along with the
    /// capability that previously occupied the insertion point.
    pub fn insert_subtree(
        &mut self,
        bank: BankId,
        space: Capability,
        offset: u64,
        subspace: Capability,
        l2arg: Option<u8>,
    ) -> Result<Inserted, BuildError> {
        if !subspace.is_memory() && !subspace.is_null() {
            return Err(BuildError::NotMemory);
        }
        let l2arg = l2arg.unwrap_or(if subspace.is_null() {
            PAGE_ADDR_BITS
        } else {
            subspace.guard().l2g()
        });

        let restr = if subspace.is_null() {
            Restrictions::READ_ONLY | Restrictions::NO_EXECUTE | Restrictions::WEAK
        } else {
            subspace.restrictions() - Restrictions::OPAQUE
        };

        let mut root = space;
        let position = self.traverse_to_slot(bank, &mut root, offset, l2arg, restr)?;
        let displaced = self.load(&root, position.location)?;

        let subspace = if subspace.is_null() {
            subspace
        } else {
            subspace.with_guard(Guard::span(subspace.guard().l2g().min(l2arg))?)
        };
        let placed = self.make_guarded_subspace(bank, subspace, position.offset, position.l2)?;
        self.store(&mut root, position.location, placed)?;

        log::debug!("[builder] inserted {placed:?} at {offset:#x} (2^{l2arg} bytes)");
        Ok(Inserted { root, displaced })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::ImageConfig;
    use crate::walk::FaultCode;

    const BANK: BankId = BankId(1);

    fn page_at(image: &Image, space: Capability, addr: u64) -> Option<ObjectRef> {
        match image.resolve(space, addr) {
            Ok((ObjectKind::Page, obj, _)) => Some(obj),
            _ => None,
        }
    }

    #[test]
    fn test_insertion_with_narrow_guards_wraps_twice() {
        // arrange
        let mut image = Image::new(ImageConfig {
            guard_match_bits: 4,
            ..ImageConfig::default()
        });
        let space = image.new_space(BANK).unwrap();
        let page = image.alloc_page(BANK, &[0xaa]).unwrap();
        let before = image.len();

        // act
        let inserted = image
            .insert_subtree(BANK, space, 0x1234_5000, page, None)
            .unwrap();

        // assert
        assert_eq!(image.len(), before + 2);
        assert!(inserted.displaced.is_null());
        let (_, root) = inserted.root.memory_object().unwrap();
        let wrapper = image.gpt(root).unwrap().slots[0];
        assert_eq!(wrapper.guard(), Guard::new(1, 28).unwrap());
        let (_, wrapper) = wrapper.memory_object().unwrap();
        let wrapper = image.gpt(wrapper).unwrap();
        assert_eq!(wrapper.l2v, 24);
        assert_eq!(wrapper.slots[2].guard(), Guard::new(3, 20).unwrap());

        let leaf = page.memory_object().unwrap().1;
        assert_eq!(
            image.resolve(inserted.root, 0x1234_5000),
            Ok((ObjectKind::Page, leaf, 0))
        );
        assert_eq!(
            image.resolve(inserted.root, 0x1234_0000),
            Err(FaultCode::InvalidDataReference)
        );
    }

    #[test]
    fn test_insertion_with_wide_guards_needs_no_wrapper() {
        let mut image = Image::default();
        let space = image.new_space(BANK).unwrap();
        let page = image.alloc_page(BANK, &[]).unwrap();
        let before = image.len();

        let inserted = image
            .insert_subtree(BANK, space, 0x1234_5000, page, None)
            .unwrap();

        assert_eq!(image.len(), before);
        let (_, root) = inserted.root.memory_object().unwrap();
        assert_eq!(
            image.gpt(root).unwrap().slots[0].guard(),
            Guard::new(0x12345, 12).unwrap()
        );
    }

    #[test]
    fn test_guard_mismatch_inserts_gpt() {
        // arrange
        let mut image = Image::default();
        let mut space = image.new_space(BANK).unwrap();
        let a = image.alloc_page(BANK, &[]).unwrap();
        let b = image.alloc_page(BANK, &[]).unwrap();
        space = image.insert_subtree(BANK, space, 0x1000, a, None).unwrap().root;
        let before = image.len();

        // act
        space = image
            .insert_subtree(BANK, space, 0x2000_0000, b, None)
            .unwrap()
            .root;

        // assert
        assert_eq!(image.len(), before + 1);
        assert_eq!(page_at(&image, space, 0x1000), a.memory_object().map(|m| m.1));
        assert_eq!(
            page_at(&image, space, 0x2000_0000),
            b.memory_object().map(|m| m.1)
        );
        assert_eq!(page_at(&image, space, 0x2000_1000), None);
        assert_eq!(page_at(&image, space, 0), None);
    }

    #[test]
    fn test_mismatch_below_a_narrow_slot_stays_within_the_slot() {
        // arrange: the page at 0xcf0_0000 ends up in slot 7 of a GPT with l2v 21
        let mut image = Image::default();
        let mut space = image.new_space(BANK).unwrap();
        let a = image.alloc_page(BANK, &[]).unwrap();
        let b = image.alloc_page(BANK, &[]).unwrap();
        let c = image.alloc_page(BANK, &[]).unwrap();
        space = image.insert_subtree(BANK, space, 0xcf0_0000, a, Some(16)).unwrap().root;
        space = image.insert_subtree(BANK, space, 0xc20_0000, b, Some(21)).unwrap().root;
        let before = image.len();

        // act
        space = image
            .insert_subtree(BANK, space, 0xce0_0000, c, Some(16))
            .unwrap()
            .root;

        // assert
        assert_eq!(image.len(), before + 1);
        assert_eq!(page_at(&image, space, 0xcf0_0000), a.memory_object().map(|m| m.1));
        assert_eq!(page_at(&image, space, 0xc20_0000), b.memory_object().map(|m| m.1));
        assert_eq!(page_at(&image, space, 0xce0_0000), c.memory_object().map(|m| m.1));
    }

    #[test]
    fn test_raising_l2v_preserves_content() {
        // arrange: a GPT with small slots reachable through a large guard, holding two pages
        let mut image = Image::default();
        let mut space = image.new_space(BANK).unwrap();
        let gpt = image.alloc_gpt(BANK, 12).unwrap();
        let gpt = gpt.with_guard(Guard::span(24).unwrap());
        space = image.insert_subtree(BANK, space, 0, gpt, None).unwrap().root;
        let p0 = image.alloc_page(BANK, &[]).unwrap();
        let p1 = image.alloc_page(BANK, &[]).unwrap();
        space = image.insert_subtree(BANK, space, 0, p0, None).unwrap().root;
        space = image.insert_subtree(BANK, space, 0x5000, p1, None).unwrap().root;
        let caps = image.alloc_cap_page(BANK).unwrap();

        // act
        space = image
            .insert_subtree(BANK, space, 0x10_0000, caps, Some(20))
            .unwrap()
            .root;

        // assert
        let (_, gpt) = gpt.memory_object().unwrap();
        assert_eq!(image.gpt(gpt).unwrap().l2v, 20);
        assert_eq!(page_at(&image, space, 0), p0.memory_object().map(|m| m.1));
        assert_eq!(page_at(&image, space, 0x5000), p1.memory_object().map(|m| m.1));
        assert_eq!(
            image.resolve(space, 0x10_0000),
            Ok((ObjectKind::CapPage, caps.memory_object().unwrap().1, 0))
        );
        assert_eq!(page_at(&image, space, 0x1000), None);
        assert!(image.resolve(space, 0x10_1000).is_err());
    }

    #[test]
    fn test_raising_l2v_collapses_single_references() {
        let mut image = Image::default();
        let mut space = image.new_space(BANK).unwrap();
        let gpt = image.alloc_gpt(BANK, 12).unwrap();
        let gpt = gpt.with_guard(Guard::span(24).unwrap());
        space = image.insert_subtree(BANK, space, 0, gpt, None).unwrap().root;
        let p1 = image.alloc_page(BANK, &[]).unwrap();
        space = image.insert_subtree(BANK, space, 0x5000, p1, None).unwrap().root;
        let caps = image.alloc_cap_page(BANK).unwrap();
        let before = image.len();

        space = image
            .insert_subtree(BANK, space, 0x10_0000, caps, Some(20))
            .unwrap()
            .root;

        assert_eq!(image.len(), before);
        let (_, gpt) = gpt.memory_object().unwrap();
        assert_eq!(image.gpt(gpt).unwrap().slots[0].guard(), Guard::new(5, 12).unwrap());
        assert_eq!(page_at(&image, space, 0x5000), p1.memory_object().map(|m| m.1));
    }

    #[test]
    fn test_inserting_null_unmaps() {
        let mut image = Image::default();
        let mut space = image.new_space(BANK).unwrap();
        let page = image.alloc_page(BANK, &[]).unwrap();
        space = image.insert_subtree(BANK, space, 0x7000, page, None).unwrap().root;

        let inserted = image
            .insert_subtree(BANK, space, 0x7000, Capability::NULL, None)
            .unwrap();

        assert_eq!(inserted.displaced.memory_object(), page.memory_object());
        assert_eq!(page_at(&image, inserted.root, 0x7000), None);
    }

    #[test]
    fn test_insertion_lifts_restrictions_along_the_path() {
        let mut image = Image::default();
        let space = image
            .new_space(BANK)
            .unwrap()
            .with_restrictions(Restrictions::READ_ONLY | Restrictions::OPAQUE);
        let page = image.alloc_page(BANK, &[]).unwrap();

        let inserted = image.insert_subtree(BANK, space, 0, page, None).unwrap();

        assert_eq!(inserted.root.restrictions(), Restrictions::OPAQUE);
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let mut image = Image::default();
        let space = image.new_space(BANK).unwrap();
        let page = image.alloc_page(BANK, &[]).unwrap();

        assert_eq!(
            image.insert_subtree(BANK, space, 0x1800, page, None),
            Err(BuildError::Misaligned {
                offset: 0x1800,
                l2: 12
            })
        );
        assert_eq!(
            image.insert_subtree(BANK, space, 0, Capability::entry(1), None),
            Err(BuildError::NotMemory)
        );
        assert_eq!(
            image.insert_subtree(BANK, space, 0, page, Some(11)),
            Err(BuildError::SizeOutOfRange(11))
        );
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut image = Image::new(ImageConfig {
            guard_match_bits: 4,
            max_objects: Some(3),
        });
        let space = image.new_space(BANK).unwrap();
        let page = image.alloc_page(BANK, &[]).unwrap();
        assert_eq!(
            image.insert_subtree(BANK, space, 0x1234_5000, page, None),
            Err(BuildError::Exhausted)
        );
    }
}
