//! # Spinlock
//!
//! Test-and-set byte lock. Interrupts stay masked for as long as the guard
//! lives, so an interrupt handler can never spin on a lock held by the
//! thread it preempted. Usable from any context.
//!
//! - [`SpinLock::lock`]: masks interrupts, re-enables them on release.
//! - [`SpinLock::lock_irqsave`]: restores the previous interrupt state on
//!   release, for callers that may already run with interrupts masked.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, IrqFlags};

pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`
unsafe impl<T: Send> Sync for SpinLock<T> {}

enum Release {
    Enable,
    Restore(IrqFlags),
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    release: Release,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        arch::irq_disable();
        self.acquire();
        SpinGuard {
            lock: self,
            release: Release::Enable,
        }
    }

    pub fn lock_irqsave(&self) -> SpinGuard<'_, T> {
        let flags = arch::irq_save_and_disable();
        self.acquire();
        SpinGuard {
            lock: self,
            release: Release::Restore(flags),
        }
    }

    /// Acquire without spinning. Leaves the interrupt state untouched on
    /// failure.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        let flags = arch::irq_save_and_disable();
        if self.locked.swap(true, Ordering::Acquire) {
            arch::irq_restore(flags);
            return None;
        }
        Some(SpinGuard {
            lock: self,
            release: Release::Restore(flags),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn acquire(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        match self.release {
            Release::Enable => arch::irq_enable(),
            Release::Restore(flags) => arch::irq_restore(flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_masks_and_unmasks() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 5;
            assert!(!arch::irqs_enabled());
            assert!(lock.is_locked());
        }
        assert!(arch::irqs_enabled());
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn test_irqsave_keeps_outer_mask() {
        let lock = SpinLock::new(());
        let flags = arch::irq_save_and_disable();
        drop(lock.lock_irqsave());
        assert!(!arch::irqs_enabled());
        arch::irq_restore(flags);
        assert!(arch::irqs_enabled());
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = SpinLock::new(1u8);
        let held = lock.try_lock();
        assert!(held.is_some());
        assert!(lock.try_lock().is_none());
        // the failed attempt must not unmask under the held guard
        assert!(!arch::irqs_enabled());
        drop(held);
        assert!(arch::irqs_enabled());
        assert!(lock.try_lock().is_some());
    }
}
