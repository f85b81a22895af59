use core::cell::UnsafeCell;
use core::fmt::{Debug, Formatter};
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use thiserror_no_std::Error;

/// A mutual exclusion lock that busy-waits until it can be acquired.
///
/// Every kernel object that can be mutated concurrently lives behind one of these.
/// Holders must never keep a [`Guard`] alive across a point at which they might block on something else,
/// since other cores will simply spin on the lock until it is released.
pub struct SpinLock<T> {
    is_locked: AtomicBool,
    value: UnsafeCell<T>,
}

/// The error returned by [`SpinLock::try_lock`] when another holder currently owns the lock.
#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
#[error("the lock is currently held by someone else")]
pub struct WouldBlock;

/// A Guard protecting some data locked through a [`SpinLock`].
///
/// Use it via the implemented [`Deref`] and [`DerefMut`] traits.
/// The lock is released when the guard is dropped.
pub struct Guard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            is_locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Try to lock the lock once and return a [`Guard`] if successful
    pub fn try_lock(&self) -> Result<Guard<T>, WouldBlock> {
        match self
            .is_locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(Guard { lock: self }),
            Err(_) => Err(WouldBlock),
        }
    }

    /// Repeatedly try to lock the lock until it succeeds, returning the protected data via a [`Guard`]
    pub fn spin_lock(&self) -> Guard<T> {
        loop {
            if let Ok(guard) = self.try_lock() {
                return guard;
            }
            while self.is_locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Whether the lock is held right now.
    ///
    /// The answer may already be outdated when it is returned and is only useful for assertions.
    pub fn is_locked(&self) -> bool {
        self.is_locked.load(Ordering::Relaxed)
    }

    /// Access the protected value without locking.
    ///
    /// This is statically safe because the mutable borrow guarantees that nobody else can hold a guard.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consume the lock and return the protected value
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> Debug for SpinLock<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        // the value is deliberately not printed because reading it would require the lock
        f.debug_struct("SpinLock")
            .field("is_locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: The very existence of this Guard guarantees we've exclusively locked the lock
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: Debug> Debug for Guard<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Debug::fmt(self.deref(), f)
    }
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
