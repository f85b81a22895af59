use crate::cap::Capability;
use crate::config::{Config, ConfigError};
use crate::hwmap::tlb::TlbFlush;
use crate::hwmap::{Access, HardwareMap, Resolution};
use crate::image::Image;
use crate::object::{Gpt, ObjectRef};
use crate::store::ObjectStore;
use crate::walk::FaultCode;

/// Everything needed to serve the address spaces of a running system: the objects they are built from and
/// the hardware page tables projected from them.
///
/// All changes to GPTs of a live context go through the methods of this type, which invalidate the affected
/// part of the projection while the GPT is locked and before the change becomes visible.
pub struct MemoryContext<T: TlbFlush> {
    config: Config,
    store: ObjectStore,
    hwmap: HardwareMap<T>,
}

impl<T: TlbFlush> MemoryContext<T> {
    pub fn new(config: Config, tlb: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store: ObjectStore::new(&config),
            hwmap: HardwareMap::new(&config, tlb),
            config,
        })
    }

    /// Create a context whose object store starts out with every object of `image`
    pub fn from_image(image: &Image, config: Config, tlb: T) -> Result<Self, ConfigError> {
        config.validate()?;
        if image.len() > config.object_frames {
            return Err(ConfigError::ImageTooLarge {
                objects: image.len(),
                frames: config.object_frames,
            });
        }
        log::debug!("[context] loading {} objects from boot image", image.len());
        Ok(Self {
            store: ObjectStore::from_image(image, config.object_frames),
            hwmap: HardwareMap::new(&config, tlb),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn projection(&self) -> &HardwareMap<T> {
        &self.hwmap
    }

    /// Resolve a hardware fault at `va` in `space` by projecting the path to its leaf
    pub fn handle_fault(
        &self,
        space: Capability,
        va: u64,
        access: Access,
    ) -> Result<Resolution, FaultCode> {
        self.hwmap.handle_fault(&self.store, space, va, access)
    }

    /// Overwrite `slot` of `gpt` with `new` if it currently holds `expected` (or unconditionally if `expected`
    /// is `None`).
    ///
    /// Returns `None` if `gpt` is stale and otherwise whether the slot was written.
    pub(crate) fn replace_slot(
        &self,
        gpt: ObjectRef,
        slot: usize,
        expected: Option<Capability>,
        new: Capability,
    ) -> Option<bool> {
        self.store.with_gpt_mut(gpt, |g| {
            if expected.is_some_and(|expected| g.slots[slot] != expected) {
                return false;
            }
            self.hwmap.invalidate_slot(gpt.id, slot);
            g.slots[slot] = new;
            true
        })
    }

    /// Apply a change affecting the whole of `gpt` after everything projected from it was invalidated
    pub(crate) fn modify_gpt<R>(&self, gpt: ObjectRef, f: impl FnOnce(&mut Gpt) -> R) -> Option<R> {
        self.store.with_gpt_mut(gpt, |g| {
            self.hwmap.invalidate_object(gpt.id);
            f(g)
        })
    }
}
