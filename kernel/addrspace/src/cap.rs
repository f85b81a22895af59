//! Capabilities as they are stored in GPT slots and capability pages.

use crate::guard::Guard;
use crate::object::{ObjectKind, ObjectRef};
use bitflags::bitflags;
use core::fmt::{Debug, Formatter};

bitflags! {
    /// Restrictions that can be placed on a memory capability.
    ///
    /// Restrictions accumulate along a path: anything reached through a restricted reference is at least as
    /// restricted as the reference itself.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Restrictions: u16 {
        /// Everything fetched through this reference is weakened too
        const WEAK = 1 << 0;
        const READ_ONLY = 1 << 1;
        const NO_EXECUTE = 1 << 2;
        /// The content of the referenced space may not be inspected or modified through this reference
        const OPAQUE = 1 << 3;
        /// Faults in this space are not delivered to its handler
        const NO_CALL = 1 << 4;
        const NO_REMOVE = 1 << 5;
        const NO_DESTROY = 1 << 6;
        const CACHE_DISABLE = 1 << 7;
        const WRITE_THROUGH = 1 << 8;
    }
}

impl Restrictions {
    /// Restrictions that prevent writes
    pub const NO_WRITE: Restrictions = Restrictions::READ_ONLY.union(Restrictions::WEAK);
}

/// What a capability refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Target {
    Null,
    Gpt(ObjectRef),
    Page(ObjectRef),
    CapPage(ObjectRef),
    /// A non-memory capability (e.g. an entry to a fault handler) with an opaque payload
    Entry(u64),
}

/// A capability consisting of a target, its restrictions and a guard
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Capability {
    target: Target,
    restr: Restrictions,
    guard: Guard,
}

impl Capability {
    pub const NULL: Capability = Capability {
        target: Target::Null,
        restr: Restrictions::empty(),
        guard: Guard::FULL,
    };

    pub const fn memory(
        kind: ObjectKind,
        obj: ObjectRef,
        restr: Restrictions,
        guard: Guard,
    ) -> Self {
        let target = match kind {
            ObjectKind::Gpt => Target::Gpt(obj),
            ObjectKind::Page => Target::Page(obj),
            ObjectKind::CapPage => Target::CapPage(obj),
        };
        Self {
            target,
            restr,
            guard,
        }
    }

    pub const fn entry(payload: u64) -> Self {
        Self {
            target: Target::Entry(payload),
            restr: Restrictions::empty(),
            guard: Guard::FULL,
        }
    }

    pub const fn target(&self) -> Target {
        self.target
    }

    pub const fn restrictions(&self) -> Restrictions {
        self.restr
    }

    pub const fn guard(&self) -> Guard {
        self.guard
    }

    pub const fn is_null(&self) -> bool {
        matches!(self.target, Target::Null)
    }

    pub const fn is_memory(&self) -> bool {
        self.memory_object().is_some()
    }

    /// The kind and object of a memory capability
    pub const fn memory_object(&self) -> Option<(ObjectKind, ObjectRef)> {
        match self.target {
            Target::Gpt(obj) => Some((ObjectKind::Gpt, obj)),
            Target::Page(obj) => Some((ObjectKind::Page, obj)),
            Target::CapPage(obj) => Some((ObjectKind::CapPage, obj)),
            Target::Null | Target::Entry(_) => None,
        }
    }

    pub const fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub const fn with_restrictions(mut self, restr: Restrictions) -> Self {
        self.restr = restr;
        self
    }

    /// The capability as it is seen when fetched through a weak path.
    ///
    /// Memory capabilities become weak and read-only, everything else that is not memory becomes null.
    pub fn weaken(&self) -> Self {
        match self.target {
            Target::Null => *self,
            Target::Entry(_) => Capability::NULL,
            _ => self.with_restrictions(self.restr | Restrictions::WEAK | Restrictions::READ_ONLY),
        }
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::NULL
    }
}

impl Debug for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.target {
            Target::Null => f.write_str("Null"),
            Target::Entry(payload) => write!(f, "Entry({payload:#x})"),
            Target::Gpt(obj) | Target::Page(obj) | Target::CapPage(obj) => {
                let kind = match self.target {
                    Target::Gpt(_) => "Gpt",
                    Target::Page(_) => "Page",
                    _ => "CapPage",
                };
                write!(
                    f,
                    "{kind}(#{}.{} {:?} {:?})",
                    obj.id.0, obj.generation, self.guard, self.restr
                )
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_weaken_memory_capability() {
        let cap = Capability::memory(
            ObjectKind::Gpt,
            ObjectRef::new(3, 1),
            Restrictions::NO_EXECUTE,
            Guard::new(1, 20).unwrap(),
        );
        let weak = cap.weaken();
        assert_eq!(
            weak.restrictions(),
            Restrictions::NO_EXECUTE | Restrictions::WEAK | Restrictions::READ_ONLY
        );
        assert_eq!(weak.guard(), cap.guard());
        assert_eq!(weak.target(), cap.target());
    }

    #[test]
    fn test_weaken_non_memory_capability() {
        assert!(Capability::entry(1).weaken().is_null());
        assert!(Capability::NULL.weaken().is_null());
    }

    #[test]
    fn test_memory_object() {
        let obj = ObjectRef::new(5, 0);
        let cap = Capability::memory(ObjectKind::CapPage, obj, Restrictions::empty(), Guard::PAGE);
        assert_eq!(cap.memory_object(), Some((ObjectKind::CapPage, obj)));
        assert!(cap.is_memory());
        assert!(!Capability::entry(5).is_memory());
    }
}
