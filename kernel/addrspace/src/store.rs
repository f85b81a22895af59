//! Runtime storage of objects and the banks that account for them.

use crate::cap::Capability;
use crate::config::Config;
use crate::image::Image;
use crate::object::{Gpt, Object, ObjectId, ObjectKind, ObjectRef, ObjectSource};
use crate::{CAPS_PER_PAGE, PAGE_SIZE};
use allocators::{AllocError, FreeList};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use ksync::SpinLock;

/// Identifier of the resource accounting unit that owns an object
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BankId(pub u32);

#[derive(Debug)]
struct Frame {
    generation: u32,
    owner: BankId,
    object: Option<Object>,
}

/// A fixed number of object frames, each protected by its own lock.
///
/// Objects are addressed through [`ObjectRef`]s whose generation must match the frame's, so a frame can be
/// reused after its object was released without old references being able to reach the new object.
pub struct ObjectStore {
    frames: Vec<SpinLock<Frame>>,
    free: SpinLock<FreeList>,
}

impl ObjectStore {
    pub fn new(config: &Config) -> Self {
        Self::with_capacity(config.object_frames)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_objects(capacity, Vec::new())
    }

    /// Load every object of a boot image so that object identifiers equal image positions
    pub fn from_image(image: &Image, capacity: usize) -> Self {
        let objects = image
            .objects()
            .map(|(bank, object)| (bank, object.clone()))
            .collect();
        Self::with_objects(capacity.max(image.len()), objects)
    }

    /// Create a store in which the frames `0..objects.len()` are already populated with generation 0
    fn with_objects(
        capacity: usize,
        objects: Vec<(BankId, Object)>,
    ) -> Self {
        let used = objects.len();
        let mut frames = Vec::with_capacity(capacity);
        for (owner, object) in objects {
            frames.push(SpinLock::new(Frame {
                generation: 0,
                owner,
                object: Some(object),
            }));
        }
        while frames.len() < capacity {
            frames.push(SpinLock::new(Frame {
                generation: 0,
                owner: BankId(0),
                object: None,
            }));
        }
        Self {
            frames,
            free: SpinLock::new(FreeList::with_prefix_used(capacity, used)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// How many frames are currently unused
    pub fn available(&self) -> usize {
        self.free.spin_lock().available()
    }

    /// Place a freshly initialized object of the given kind into a free frame
    pub fn allocate(&self, kind: ObjectKind, owner: BankId) -> Result<ObjectRef, AllocError> {
        let index = self.free.spin_lock().alloc()?;
        let mut frame = self.frames[index].spin_lock();
        frame.owner = owner;
        frame.object = Some(Object::new(kind));
        log::trace!("[store] allocated {kind:?} in frame {index} for {owner:?}");
        Ok(ObjectRef {
            id: ObjectId(index as u32),
            generation: frame.generation,
        })
    }

    /// Destroy the referenced object and return its frame to the pool.
    ///
    /// Returns `false` if the reference was already stale.
    pub fn release(&self, obj: ObjectRef) -> bool {
        self.release_with(obj, || {})
    }

    /// Like [`release`](Self::release) but runs `retire` first, while the frame is locked and the object can
    /// still be reached.
    ///
    /// `retire` must not access the frame of `obj` itself.
    pub fn release_with(&self, obj: ObjectRef, retire: impl FnOnce()) -> bool {
        let Some(lock) = self.frames.get(obj.id.0 as usize) else {
            return false;
        };
        let mut frame = lock.spin_lock();
        if frame.generation != obj.generation || frame.object.is_none() {
            return false;
        }
        retire();
        frame.object = None;
        frame.generation = frame.generation.wrapping_add(1);
        drop(frame);
        self.free.spin_lock().free(obj.id.0 as usize);
        true
    }

    fn frame(&self, obj: ObjectRef) -> Option<&SpinLock<Frame>> {
        self.frames.get(obj.id.0 as usize)
    }

    /// Run `f` on the referenced object while its frame is locked
    pub fn with_object<R>(&self, obj: ObjectRef, f: impl FnOnce(&Object) -> R) -> Option<R> {
        let frame = self.frame(obj)?.spin_lock();
        if frame.generation != obj.generation {
            return None;
        }
        frame.object.as_ref().map(f)
    }

    /// Run `f` on the referenced object while its frame is locked for modification
    pub fn with_object_mut<R>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&mut Object) -> R,
    ) -> Option<R> {
        let mut frame = self.frame(obj)?.spin_lock();
        if frame.generation != obj.generation {
            return None;
        }
        frame.object.as_mut().map(f)
    }

    pub fn with_gpt_mut<R>(&self, obj: ObjectRef, f: impl FnOnce(&mut Gpt) -> R) -> Option<R> {
        self.with_object_mut(obj, |object| object.as_gpt_mut().map(f))
            .flatten()
    }

    pub fn with_page_mut<R>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Option<R> {
        self.with_object_mut(obj, |object| match object {
            Object::Page(page) => Some(f(page)),
            _ => None,
        })
        .flatten()
    }

    pub fn with_cap_page_mut<R>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&mut [Capability; CAPS_PER_PAGE]) -> R,
    ) -> Option<R> {
        self.with_object_mut(obj, |object| match object {
            Object::CapPage(caps) => Some(f(caps)),
            _ => None,
        })
        .flatten()
    }

    pub fn kind_of(&self, obj: ObjectRef) -> Option<ObjectKind> {
        self.with_object(obj, Object::kind)
    }

    pub fn owner_of(&self, obj: ObjectRef) -> Option<BankId> {
        let frame = self.frame(obj)?.spin_lock();
        (frame.generation == obj.generation && frame.object.is_some()).then_some(frame.owner)
    }

    pub fn is_live(&self, obj: ObjectRef) -> bool {
        self.owner_of(obj).is_some()
    }
}

impl ObjectSource for ObjectStore {
    fn with_gpt<R>(&self, obj: ObjectRef, f: impl FnOnce(&Gpt) -> R) -> Option<R> {
        self.with_object(obj, |object| object.as_gpt().map(f))
            .flatten()
    }

    fn kind_of(&self, obj: ObjectRef) -> Option<ObjectKind> {
        ObjectStore::kind_of(self, obj)
    }
}

/// The resource accounting unit that supplies fresh objects and takes back destroyed ones
pub trait Bank {
    fn id(&self) -> BankId;

    fn allocate(&self, kind: ObjectKind) -> Result<ObjectRef, AllocError>;

    /// Return an object to the bank.
    ///
    /// Freeing an object that is stale or belongs to another bank has no effect.
    fn free(&self, obj: ObjectRef) {
        self.free_with(obj, || {})
    }

    /// Return an object to the bank after running `retire` while the object is locked but still live
    fn free_with(&self, obj: ObjectRef, retire: impl FnOnce());
}

/// A bank drawing objects from an [`ObjectStore`], optionally bounded by a quota
pub struct SpaceBank<'s> {
    id: BankId,
    store: &'s ObjectStore,
    limit: Option<usize>,
    live: AtomicUsize,
    allocations: AtomicUsize,
}

impl<'s> SpaceBank<'s> {
    pub fn new(id: BankId, store: &'s ObjectStore) -> Self {
        Self {
            id,
            store,
            limit: None,
            live: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    pub fn with_limit(id: BankId, store: &'s ObjectStore, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(id, store)
        }
    }

    /// How many objects obtained from this bank are currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// How many allocations this bank has served in total
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl Bank for SpaceBank<'_> {
    fn id(&self) -> BankId {
        self.id
    }

    fn allocate(&self, kind: ObjectKind) -> Result<ObjectRef, AllocError> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |live| {
                (live < limit).then_some(live + 1)
            })
            .map_err(|_| AllocError::InsufficientMemory)?;

        match self.store.allocate(kind, self.id) {
            Ok(obj) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(obj)
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn free_with(&self, obj: ObjectRef, retire: impl FnOnce()) {
        if self.store.owner_of(obj) != Some(self.id) {
            log::warn!("[bank] {:?} cannot free {obj:?} since it does not own it", self.id);
            return;
        }
        if self.store.release_with(obj, retire) {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
