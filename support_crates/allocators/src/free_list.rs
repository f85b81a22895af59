use crate::AllocError;
use alloc::vec::Vec;

/// A bounded pool of indices `0..capacity` which can be allocated and freed again.
///
/// Indices are handed out lowest-first from a fresh list and afterwards in LIFO order of freeing, which keeps
/// recently used (and thus probably cached) entries hot.
#[derive(Debug, Clone)]
pub struct FreeList {
    /// Stack of currently unused indices; the top of the stack is handed out next
    free: Vec<u32>,
    /// Allocation state of every index
    in_use: Vec<bool>,
}

impl FreeList {
    /// Create a list in which every index below `capacity` is free
    pub fn new(capacity: usize) -> Self {
        Self::with_prefix_used(capacity, 0)
    }

    /// Create a list in which the indices `0..used` are already allocated.
    ///
    /// This is how tables are set up that were populated wholesale before the list existed.
    ///
    /// # Panics
    /// Panics if `used > capacity` or if `capacity` does not fit into 32 bits.
    pub fn with_prefix_used(capacity: usize, used: usize) -> Self {
        assert!(used <= capacity, "cannot mark {used} of {capacity} entries as used");
        assert!(capacity <= u32::MAX as usize);
        let mut in_use = Vec::with_capacity(capacity);
        in_use.resize(capacity, false);
        in_use[..used].fill(true);
        Self {
            free: (used as u32..capacity as u32).rev().collect(),
            in_use,
        }
    }

    /// Take one index out of the pool
    pub fn alloc(&mut self) -> Result<usize, AllocError> {
        let index = self.free.pop().ok_or(AllocError::InsufficientMemory)? as usize;
        self.in_use[index] = true;
        Ok(index)
    }

    /// Return an index to the pool.
    ///
    /// # Panics
    /// Panics if the index is out of range or not currently allocated, since either means that some table
    /// handed out a handle twice.
    pub fn free(&mut self, index: usize) {
        assert!(
            index < self.in_use.len(),
            "index {index} is outside of the free list"
        );
        assert!(self.in_use[index], "double free of index {index}");
        log::trace!("[free_list] releasing index {index}");
        self.in_use[index] = false;
        self.free.push(index as u32);
    }

    /// Whether the given index is currently handed out
    pub fn is_allocated(&self, index: usize) -> bool {
        self.in_use.get(index).copied().unwrap_or(false)
    }

    /// How many indices can still be allocated
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// The total number of indices managed by this list
    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }
}
