//! Fault-driven population of address spaces.
//!
//! The populator is the online counterpart of the [`builder`](crate::builder). Instead of knowing the shape of
//! the tree up front, it walks towards a faulting address one level at a time and repairs whatever stops the
//! access from succeeding:
//! - a guard that does not match the address gets a wrapper GPT inserted above it
//! - an empty slot gets a fresh leaf
//! - a read-only or weak reference on a write path is replaced by a strong copy of its object
//!
//! Every change is installed with a compare-and-set on the slot so that concurrent populators and mutations
//! never lose each other's work. A populator that loses a race returns its fresh object to the bank and
//! retries the level.

use crate::cap::{Capability, Restrictions};
use crate::context::MemoryContext;
use crate::guard::{high_bits, l2_offset, low_bits, round_up, shift_down, Guard};
use crate::hwmap::tlb::TlbFlush;
use crate::object::{ObjectKind, ObjectRef};
use crate::store::Bank;
use crate::walk::walk;
use crate::{ADDR_BITS, GPT_SLOT_INDEX_BITS, MAX_WALK_DEPTH, PAGE_ADDR_BITS};
use allocators::AllocError;
use thiserror_no_std::Error;

/// Upper bound on the steps taken by a single populate, counting retries and inserted wrappers
const MAX_POPULATE_STEPS: usize = 4 * MAX_WALK_DEPTH;

#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum PopulateError {
    #[error("the bank could not provide a fresh object")]
    Exhausted,
    #[error("the path to the address passes through an opaque reference")]
    Opaque,
    #[error("the address space is not well formed")]
    Malformed,
    #[error("the address cannot be reached within the address space")]
    InvalidAddress,
    #[error("the root of the address space does not permit the access")]
    AccessViolation,
    #[error("the address resolves to a leaf of the wrong kind")]
    AccessTypeError,
}

impl From<AllocError> for PopulateError {
    fn from(_: AllocError) -> Self {
        PopulateError::Exhausted
    }
}

/// The leaf an address resolved to after population
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Leaf {
    pub object: ObjectRef,
    pub kind: ObjectKind,
    /// Offset of the address within the leaf
    pub offset: u64,
    /// Restrictions accumulated along the path to the leaf
    pub restrictions: Restrictions,
}

/// What a GPT's slot looks like from the point of view of the populator
struct SlotView {
    l2v: u8,
    index: usize,
    cap: Capability,
}

enum Step {
    /// Something was installed or a race was lost; look at the same GPT again
    Retry,
    Descend {
        gpt: ObjectRef,
        rem: u64,
        l2g: u8,
        restr: Restrictions,
    },
    Done(Leaf),
}

impl<T: TlbFlush> MemoryContext<T> {
    /// Make `addr` of `space` accessible as requested, allocating from `bank` whatever is missing.
    ///
    /// Populating an address that is already accessible allocates nothing and returns the existing leaf.
    pub fn populate(
        &self,
        bank: &impl Bank,
        space: Capability,
        addr: u64,
        want_write: bool,
        want_cap: bool,
    ) -> Result<Leaf, PopulateError> {
        let Some((ObjectKind::Gpt, root)) = space.memory_object() else {
            return Err(if space.is_null() {
                PopulateError::InvalidAddress
            } else {
                PopulateError::Malformed
            });
        };

        let walk = walk(self.store(), space, addr, want_write);
        if let Some(leaf) = walk.leaf() {
            if walk.restrictions.contains(Restrictions::OPAQUE) {
                return Err(PopulateError::Opaque);
            }
            if (leaf.kind == ObjectKind::CapPage) != want_cap {
                return Err(PopulateError::AccessTypeError);
            }
            return Ok(Leaf {
                object: leaf.object,
                kind: leaf.kind,
                offset: leaf.rem_addr,
                restrictions: walk.restrictions,
            });
        }

        let guard = space.guard();
        let restr = space.restrictions();
        if !guard.matches(addr) {
            return Err(PopulateError::InvalidAddress);
        }
        if restr.contains(Restrictions::OPAQUE) {
            return Err(PopulateError::Opaque);
        }
        if want_write && restr.intersects(Restrictions::NO_WRITE) {
            return Err(PopulateError::AccessViolation);
        }

        let mut gpt = root;
        let mut rem = low_bits(addr, guard.l2g());
        let mut entered_l2g = guard.l2g();
        let mut path_restr = restr;
        let mut last_l2v = ADDR_BITS;
        for _ in 0..MAX_POPULATE_STEPS {
            let view = self.view_slot(gpt, rem, entered_l2g, last_l2v)?;
            match self.populate_slot(bank, gpt, &view, rem, path_restr, want_write, want_cap)? {
                Step::Retry => {}
                Step::Descend {
                    gpt: next,
                    rem: next_rem,
                    l2g,
                    restr,
                } => {
                    last_l2v = view.l2v;
                    gpt = next;
                    rem = next_rem;
                    entered_l2g = l2g;
                    path_restr |= restr;
                }
                Step::Done(leaf) => return Ok(leaf),
            }
        }
        log::warn!(
            "[populate] giving up on {addr:#x} in {space:?} after {MAX_POPULATE_STEPS} steps"
        );
        Err(PopulateError::Malformed)
    }

    /// Read the slot of `gpt` that `rem` selects and check that the GPT is well formed
    fn view_slot(
        &self,
        gpt: ObjectRef,
        rem: u64,
        entered_l2g: u8,
        last_l2v: u8,
    ) -> Result<SlotView, PopulateError> {
        let (l2v, addressable, slots) = self
            .store()
            .with_object(gpt, |object| {
                object
                    .as_gpt()
                    .map(|g| (g.l2v, g.addressable_slots(), g.slots))
            })
            .ok_or(PopulateError::InvalidAddress)?
            .ok_or(PopulateError::Malformed)?;

        if l2v >= last_l2v || entered_l2g < l2v {
            log::warn!("[populate] {gpt:?} with l2v {l2v} is not well formed at this position");
            return Err(PopulateError::Malformed);
        }
        let index = shift_down(rem, l2v) as usize;
        if index >= addressable {
            return Err(PopulateError::InvalidAddress);
        }
        Ok(SlotView {
            l2v,
            index,
            cap: slots[index],
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn populate_slot(
        &self,
        bank: &impl Bank,
        gpt: ObjectRef,
        view: &SlotView,
        rem: u64,
        path_restr: Restrictions,
        want_write: bool,
        want_cap: bool,
    ) -> Result<Step, PopulateError> {
        let slot_rem = low_bits(rem, view.l2v);
        let cap = view.cap;

        let (guard, absent) = if cap.is_null() {
            (Guard::PAGE, true)
        } else if cap.is_memory() {
            (cap.guard(), false)
        } else {
            return Err(PopulateError::Malformed);
        };
        if guard.l2g() > view.l2v || shift_down(guard.value(), view.l2v) != 0 {
            log::warn!(
                "[populate] slot {} of {gpt:?} holds {guard:?} which exceeds its l2v {}",
                view.index,
                view.l2v
            );
            return Err(PopulateError::Malformed);
        }

        if absent {
            let leaf_guard = Guard::new(shift_down(slot_rem, PAGE_ADDR_BITS), PAGE_ADDR_BITS);
            if let Ok(leaf_guard) = leaf_guard {
                let kind = if want_cap {
                    ObjectKind::CapPage
                } else {
                    ObjectKind::Page
                };
                let fresh = bank.allocate(kind)?;
                let installed = Capability::memory(kind, fresh, Restrictions::empty(), leaf_guard);
                if !self.install(bank, gpt, view, installed, fresh)? {
                    return Ok(Step::Retry);
                }
                log::debug!(
                    "[populate] installed fresh {kind:?} in slot {} of {gpt:?}",
                    view.index
                );
                return Ok(Step::Done(Leaf {
                    object: fresh,
                    kind,
                    offset: low_bits(slot_rem, PAGE_ADDR_BITS),
                    restrictions: path_restr,
                }));
            }
        }

        let mismatch = (slot_rem ^ guard.value()) & guard.mask();
        if mismatch != 0 {
            self.insert_wrapper(bank, gpt, view, guard, mismatch)?;
            return Ok(Step::Retry);
        }

        let restr = cap.restrictions();
        if restr.contains(Restrictions::OPAQUE) {
            return Err(PopulateError::Opaque);
        }
        let Some((kind, object)) = cap.memory_object() else {
            return Err(PopulateError::Malformed);
        };
        if kind.is_leaf() && (kind == ObjectKind::CapPage) != want_cap {
            return Err(PopulateError::AccessTypeError);
        }

        if want_write && restr.intersects(Restrictions::NO_WRITE) {
            self.upgrade(bank, gpt, view, kind, object)?;
            return Ok(Step::Retry);
        }

        let rem = low_bits(slot_rem, guard.l2g());
        if kind.is_leaf() {
            if high_bits(rem, PAGE_ADDR_BITS) != 0 {
                return Err(PopulateError::InvalidAddress);
            }
            return Ok(Step::Done(Leaf {
                object,
                kind,
                offset: rem,
                restrictions: path_restr | restr,
            }));
        }
        Ok(Step::Descend {
            gpt: object,
            rem,
            l2g: guard.l2g(),
            restr,
        })
    }

    /// Place a new GPT between slot `view` of `gpt` and its content so that the content keeps its addresses
    /// while the bits at which `mismatch` disagrees with its guard get their own slots
    fn insert_wrapper(
        &self,
        bank: &impl Bank,
        gpt: ObjectRef,
        view: &SlotView,
        guard: Guard,
        mismatch: u64,
    ) -> Result<(), PopulateError> {
        let l2g = guard.l2g();
        let value = guard.value();
        let desired_l2g =
            (l2g + round_up(l2_offset(mismatch) - l2g, GPT_SLOT_INDEX_BITS)).min(ADDR_BITS);
        let wrapper_l2v = (desired_l2g - GPT_SLOT_INDEX_BITS).max(l2g);
        let wrapper_l2g = desired_l2g.min(view.l2v);
        let wrapper_guard = Guard::new(shift_down(value, wrapper_l2g), wrapper_l2g)
            .map_err(|_| PopulateError::Malformed)?;
        let inner_slot = shift_down(low_bits(value, wrapper_l2g), wrapper_l2v) as usize;
        let inner_guard = Guard::new(shift_down(low_bits(value, wrapper_l2v), l2g), l2g)
            .map_err(|_| PopulateError::Malformed)?;

        let wrapper = bank.allocate(ObjectKind::Gpt)?;
        self.store().with_gpt_mut(wrapper, |g| {
            g.l2v = wrapper_l2v;
            if !view.cap.is_null() {
                g.slots[inner_slot] = view.cap.with_guard(inner_guard);
            }
        });
        let installed =
            Capability::memory(ObjectKind::Gpt, wrapper, Restrictions::empty(), wrapper_guard);
        if self.install(bank, gpt, view, installed, wrapper)? {
            log::debug!(
                "[populate] wrapped slot {} of {gpt:?} into {wrapper:?} (l2v {wrapper_l2v})",
                view.index
            );
        }
        Ok(())
    }

    /// Replace the read-only or weak reference in slot `view` of `gpt` by a strong reference to a fresh copy
    fn upgrade(
        &self,
        bank: &impl Bank,
        gpt: ObjectRef,
        view: &SlotView,
        kind: ObjectKind,
        object: ObjectRef,
    ) -> Result<(), PopulateError> {
        let restr = view.cap.restrictions();
        let Some(content) = self.store().with_object(object, |o| {
            if restr.contains(Restrictions::WEAK) {
                o.weakened()
            } else {
                o.clone()
            }
        }) else {
            return Err(PopulateError::InvalidAddress);
        };

        let fresh = bank.allocate(kind)?;
        self.store().with_object_mut(fresh, |o| *o = content);
        let strong = restr - (Restrictions::NO_WRITE | Restrictions::OPAQUE);
        let installed = Capability::memory(kind, fresh, strong, view.cap.guard());
        if self.install(bank, gpt, view, installed, fresh)? {
            log::debug!(
                "[populate] upgraded slot {} of {gpt:?} from {object:?} to {fresh:?}",
                view.index
            );
        }
        Ok(())
    }

    /// Install `cap` into slot `view` of `gpt` unless the slot changed since it was viewed.
    ///
    /// If the slot changed, `fresh` is returned to the bank and `false` is returned.
    fn install(
        &self,
        bank: &impl Bank,
        gpt: ObjectRef,
        view: &SlotView,
        cap: Capability,
        fresh: ObjectRef,
    ) -> Result<bool, PopulateError> {
        match self.replace_slot(gpt, view.index, Some(view.cap), cap) {
            Some(true) => Ok(true),
            Some(false) => {
                log::debug!(
                    "[populate] slot {} of {gpt:?} changed concurrently, retrying",
                    view.index
                );
                bank.free(fresh);
                Ok(false)
            }
            None => {
                bank.free(fresh);
                Err(PopulateError::InvalidAddress)
            }
        }
    }
}
