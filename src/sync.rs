//! Ticket spinlock guarding per-instance broker state.
//!
//! Each VirtIO instance carries one of these around its request arena and
//! both pending queues, so queue links and node payloads are only ever
//! mutated under the same lock. Contention is per-instance, never global.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

pub struct SpinLock<T> {
    tail: AtomicU32,
    owner: AtomicU32,
    value: UnsafeCell<T>,
}

impl<T> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("tail", &self.tail)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// SAFETY: the ticket discipline grants exclusive access to `value`
// between lock acquisition and guard drop.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            tail: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Take a ticket and spin until it comes up.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.fetch_add(1, Ordering::Release);
        // Wake cores waiting in WFE-based spin loops.
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("sev", options(nostack, nomem))
        };
    }
}
