//! The walk from a root capability down to the object that resolves an address.
//!
//! Every consumer of address spaces uses this walk so that they all agree on which object an address
//! resolves to and which restrictions apply to it.

use crate::cap::{Capability, Restrictions};
use crate::guard::{high_bits, low_bits, shift_down};
use crate::object::{ObjectKind, ObjectRef, ObjectSource};
use crate::{MAX_WALK_DEPTH, PAGE_ADDR_BITS};
use alloc::vec::Vec;
use thiserror_no_std::Error;

/// Why an address could not be resolved or accessed
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum FaultCode {
    #[error("the address does not resolve to any object")]
    InvalidDataReference,
    #[error("the access is not permitted by the restrictions of the path")]
    AccessViolation,
    #[error("the address space is not well formed")]
    MalformedSpace,
    #[error("the address is not executable")]
    NoExecute,
    #[error("a data access resolved to a capability page")]
    DataAccessTypeError,
    #[error("a capability access resolved to a data page")]
    CapAccessTypeError,
}

/// One object traversed by a walk
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WalkEntry {
    /// The address bits the reference to this object compressed (`match << l2g`)
    pub guard_value: u64,
    /// The address remaining after the reference's guard was stripped
    pub rem_addr: u64,
    pub object: ObjectRef,
    pub kind: ObjectKind,
    /// log2 of the span this object is reachable through, never larger than the object itself
    pub l2g: u8,
    /// Restrictions of the reference to this object
    pub restr: Restrictions,
    /// Slot of the parent GPT that referenced this object or `None` for the root
    pub slot: Option<usize>,
    /// log2 of the slot size if this is a GPT, the page size otherwise
    pub l2v: u8,
}

/// The result of walking an address space
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Walk {
    pub entries: Vec<WalkEntry>,
    /// Union of the restrictions of all traversed references
    pub restrictions: Restrictions,
    pub fault: Option<FaultCode>,
}

impl Walk {
    pub fn last(&self) -> Option<&WalkEntry> {
        self.entries.last()
    }

    /// The leaf this walk resolved to, if it completed without a fault
    pub fn leaf(&self) -> Option<&WalkEntry> {
        match self.fault {
            None => self.entries.last().filter(|e| e.kind.is_leaf()),
            Some(_) => None,
        }
    }

    fn restrictions_up_to(&self, len: usize) -> Restrictions {
        self.entries[..len]
            .iter()
            .fold(Restrictions::empty(), |acc, e| acc | e.restr)
    }

    fn check_write(&mut self, for_write: bool) {
        if self.fault.is_none() && for_write && self.restrictions.intersects(Restrictions::NO_WRITE)
        {
            self.fault = Some(FaultCode::AccessViolation);
        }
    }
}

/// Walk `space` towards `addr` until a leaf or a fault is reached
pub fn walk(src: &impl ObjectSource, space: Capability, addr: u64, for_write: bool) -> Walk {
    let mut walk = Walk {
        entries: Vec::new(),
        restrictions: Restrictions::empty(),
        fault: None,
    };
    let mut cap = space;
    let mut rem = addr;
    let mut slot = None;

    walk.fault = loop {
        if walk.entries.len() >= MAX_WALK_DEPTH {
            log::warn!("[walk] exceeded the maximum depth while resolving {addr:#x}");
            break Some(FaultCode::MalformedSpace);
        }
        let Some((kind, object)) = cap.memory_object() else {
            break Some(if cap.is_null() {
                FaultCode::InvalidDataReference
            } else {
                FaultCode::MalformedSpace
            });
        };
        let guard = cap.guard();
        if !guard.matches(rem) {
            break Some(FaultCode::InvalidDataReference);
        }
        rem = low_bits(rem, guard.l2g());
        walk.restrictions |= cap.restrictions();

        if kind.is_leaf() {
            match src.kind_of(object) {
                Some(live) if live == kind => {}
                Some(live) => {
                    log::warn!("[walk] {object:?} is a {live:?} but is referenced as a {kind:?}");
                    break Some(FaultCode::MalformedSpace);
                }
                None => break Some(FaultCode::InvalidDataReference),
            }
            walk.entries.push(WalkEntry {
                guard_value: guard.value(),
                rem_addr: rem,
                object,
                kind,
                l2g: guard.l2g().min(PAGE_ADDR_BITS),
                restr: cap.restrictions(),
                slot,
                l2v: PAGE_ADDR_BITS,
            });
            if high_bits(rem, PAGE_ADDR_BITS) != 0 {
                break Some(FaultCode::InvalidDataReference);
            }
            break None;
        }

        let Some((l2v, effective_l2g, next)) = src.with_gpt(object, |gpt| {
            let index = shift_down(rem, gpt.l2v) as usize;
            let next = (index < gpt.addressable_slots()).then(|| (index, gpt.slots[index]));
            (gpt.l2v, gpt.effective_l2g(), next)
        }) else {
            break Some(FaultCode::InvalidDataReference);
        };

        if let Some(parent) = walk.entries.last() {
            if l2v >= parent.l2v {
                log::warn!(
                    "[walk] l2v {l2v} of {object:?} does not decrease below its parent's {}",
                    parent.l2v
                );
                break Some(FaultCode::MalformedSpace);
            }
        }
        if guard.l2g() < l2v {
            log::warn!(
                "[walk] guard {guard:?} is narrower than the slots of {object:?} (l2v {l2v})"
            );
            break Some(FaultCode::MalformedSpace);
        }

        walk.entries.push(WalkEntry {
            guard_value: guard.value(),
            rem_addr: rem,
            object,
            kind,
            l2g: guard.l2g().min(effective_l2g),
            restr: cap.restrictions(),
            slot,
            l2v,
        });

        let Some((index, next_cap)) = next else {
            break Some(FaultCode::InvalidDataReference);
        };
        cap = next_cap;
        rem = low_bits(rem, l2v);
        slot = Some(index);
    };

    walk.check_write(for_write);
    walk
}

/// Walk `space` towards `addr` but stop at the GPT whose slots span `2^l2stop` bytes.
///
/// The returned walk ends with the deepest GPT whose `l2v` is at least `l2stop` and which is reachable through
/// a reference spanning at least `2^l2stop` bytes. Faults that happened below that point are discarded since
/// they do not concern the stopping point.
pub fn extended_walk(
    src: &impl ObjectSource,
    space: Capability,
    addr: u64,
    l2stop: u8,
    for_write: bool,
) -> Walk {
    let mut walk = walk(src, space, addr, false);
    let mut keep = 0;
    let mut stopped_early = false;

    for (i, entry) in walk.entries.iter().enumerate() {
        if entry.l2g < l2stop {
            stopped_early = true;
            break;
        }
        if entry.kind != ObjectKind::Gpt || entry.l2v < l2stop {
            stopped_early = true;
            break;
        }
        keep = i + 1;
        if entry.l2v == l2stop {
            stopped_early = i + 1 < walk.entries.len() || walk.fault.is_some();
            break;
        }
    }

    if stopped_early {
        walk.fault = None;
    }
    walk.entries.truncate(keep);
    walk.restrictions = walk.restrictions_up_to(keep);
    walk.check_write(for_write);
    walk
}

/// Find the leaf `addr` resolves to within `space` along with the offset into it
pub fn resolve(
    src: &impl ObjectSource,
    space: Capability,
    addr: u64,
) -> Result<(ObjectKind, ObjectRef, u64), FaultCode> {
    let walk = walk(src, space, addr, false);
    if let Some(fault) = walk.fault {
        return Err(fault);
    }
    walk.leaf()
        .map(|leaf| (leaf.kind, leaf.object, leaf.rem_addr))
        .ok_or(FaultCode::InvalidDataReference)
}
