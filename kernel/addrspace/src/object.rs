//! The objects an address space is made of.

use crate::cap::Capability;
use crate::{CAPS_PER_PAGE, GPT_SLOT_INDEX_BITS, NUM_GPT_SLOTS, PAGE_ADDR_BITS, PAGE_SIZE};
use alloc::boxed::Box;
use core::fmt::{Debug, Formatter};

/// Index of an object slot in an object store
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(pub u32);

/// A reference to an object that is only valid as long as the object has not been released.
///
/// Every time an object slot is released its generation is bumped so that stale references to it stop
/// resolving, which is how capabilities to a destroyed object start reading as null.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub generation: u32,
}

impl ObjectRef {
    pub const fn new(id: u32, generation: u32) -> Self {
        Self {
            id: ObjectId(id),
            generation,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Gpt = 1,
    Page = 2,
    CapPage = 3,
}

impl ObjectKind {
    pub const fn is_leaf(self) -> bool {
        !matches!(self, ObjectKind::Gpt)
    }
}

/// A guarded page table
#[derive(Clone, Eq, PartialEq)]
pub struct Gpt {
    /// log2 of the number of bytes covered by one slot
    pub l2v: u8,
    /// Whether the handler slot holds a delegate instead of addressable space
    pub has_handler: bool,
    /// Whether the background slot holds a background space instead of addressable space
    pub has_background: bool,
    pub slots: [Capability; NUM_GPT_SLOTS],
}

impl Gpt {
    pub const fn new() -> Self {
        Self {
            l2v: PAGE_ADDR_BITS,
            has_handler: false,
            has_background: false,
            slots: [Capability::NULL; NUM_GPT_SLOTS],
        }
    }

    /// How many address bits select a slot.
    ///
    /// Reserving the handler or background slot halves the addressable range of the GPT.
    pub const fn slot_index_bits(&self) -> u8 {
        if self.has_handler || self.has_background {
            GPT_SLOT_INDEX_BITS - 1
        } else {
            GPT_SLOT_INDEX_BITS
        }
    }

    pub const fn addressable_slots(&self) -> usize {
        1 << self.slot_index_bits()
    }

    /// log2 of the number of bytes covered by the whole GPT
    pub fn effective_l2g(&self) -> u8 {
        (self.l2v + self.slot_index_bits()).min(crate::ADDR_BITS)
    }

    /// Reset the GPT to the state of a freshly allocated one
    pub fn erase(&mut self) {
        self.l2v = PAGE_ADDR_BITS;
        self.has_handler = false;
        self.has_background = false;
        self.slots = [Capability::NULL; NUM_GPT_SLOTS];
    }

    /// A copy of this GPT in which every slot has been weakened
    pub fn weakened(&self) -> Self {
        let mut result = self.clone();
        for slot in result.slots.iter_mut() {
            *slot = slot.weaken();
        }
        result
    }
}

impl Default for Gpt {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Gpt {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("Gpt");
        s.field("l2v", &self.l2v);
        s.field("has_handler", &self.has_handler);
        s.field("has_background", &self.has_background);
        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.is_null() {
                s.field(SLOT_NAMES[i], slot);
            }
        }
        s.finish()
    }
}

const SLOT_NAMES: [&str; NUM_GPT_SLOTS] = [
    "slot0", "slot1", "slot2", "slot3", "slot4", "slot5", "slot6", "slot7", "slot8", "slot9",
    "slot10", "slot11", "slot12", "slot13", "slot14", "slot15",
];

/// The content of an object slot
#[derive(Clone, Eq, PartialEq)]
pub enum Object {
    Gpt(Gpt),
    Page(Box<[u8; PAGE_SIZE]>),
    CapPage(Box<[Capability; CAPS_PER_PAGE]>),
}

impl Object {
    /// A freshly initialized object of the given kind
    pub fn new(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Gpt => Object::Gpt(Gpt::new()),
            ObjectKind::Page => Object::Page(Box::new([0; PAGE_SIZE])),
            ObjectKind::CapPage => Object::CapPage(Box::new([Capability::NULL; CAPS_PER_PAGE])),
        }
    }

    pub const fn kind(&self) -> ObjectKind {
        match self {
            Object::Gpt(_) => ObjectKind::Gpt,
            Object::Page(_) => ObjectKind::Page,
            Object::CapPage(_) => ObjectKind::CapPage,
        }
    }

    /// A copy of this object as seen through a weak reference
    pub fn weakened(&self) -> Self {
        match self {
            Object::Gpt(gpt) => Object::Gpt(gpt.weakened()),
            Object::Page(page) => Object::Page(page.clone()),
            Object::CapPage(caps) => {
                let mut result = caps.clone();
                for cap in result.iter_mut() {
                    *cap = cap.weaken();
                }
                Object::CapPage(result)
            }
        }
    }

    pub fn as_gpt(&self) -> Option<&Gpt> {
        match self {
            Object::Gpt(gpt) => Some(gpt),
            _ => None,
        }
    }

    pub fn as_gpt_mut(&mut self) -> Option<&mut Gpt> {
        match self {
            Object::Gpt(gpt) => Some(gpt),
            _ => None,
        }
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Object::Gpt(gpt) => Debug::fmt(gpt, f),
            Object::Page(_) => f.write_str("Page"),
            Object::CapPage(_) => f.write_str("CapPage"),
        }
    }
}

/// Anything that can resolve object references to GPTs.
///
/// Both the offline boot image and the live object store implement this so that the same walk is used for
/// building, populating, projecting and mutating address spaces.
pub trait ObjectSource {
    /// Run `f` on the GPT referenced by `obj`.
    ///
    /// Returns `None` if `obj` is stale or does not refer to a GPT.
    fn with_gpt<R>(&self, obj: ObjectRef, f: impl FnOnce(&Gpt) -> R) -> Option<R>;

    /// The kind of the object referenced by `obj` or `None` if `obj` is stale
    fn kind_of(&self, obj: ObjectRef) -> Option<ObjectKind>;

    /// A copy of the GPT referenced by `obj`
    fn gpt(&self, obj: ObjectRef) -> Option<Gpt> {
        self.with_gpt(obj, Gpt::clone)
    }
}
