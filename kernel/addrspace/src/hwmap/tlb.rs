use core::sync::atomic::{AtomicUsize, Ordering};

/// Flushing of the local hart's address translation caches
pub trait TlbFlush {
    /// Drop every cached translation
    fn flush_all(&self);

    /// Drop cached translations of a single virtual address
    fn flush_va(&self, va: u64);
}

/// A TLB that only counts how often it was asked to flush.
///
/// Used on hosts where there is no MMU behind the projected tables.
#[derive(Debug, Default)]
pub struct CountingTlb {
    full_flushes: AtomicUsize,
    va_flushes: AtomicUsize,
}

impl CountingTlb {
    pub const fn new() -> Self {
        Self {
            full_flushes: AtomicUsize::new(0),
            va_flushes: AtomicUsize::new(0),
        }
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::Relaxed)
    }

    pub fn va_flushes(&self) -> usize {
        self.va_flushes.load(Ordering::Relaxed)
    }
}

impl TlbFlush for CountingTlb {
    fn flush_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_va(&self, _va: u64) {
        self.va_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// The TLB of the executing RISC-V hart
#[cfg(target_arch = "riscv64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct SfenceTlb;

#[cfg(target_arch = "riscv64")]
impl TlbFlush for SfenceTlb {
    fn flush_all(&self) {
        unsafe { core::arch::asm!("sfence.vma") };
    }

    fn flush_va(&self, va: u64) {
        unsafe { core::arch::asm!("sfence.vma {}, zero", in(reg) va) };
    }
}
