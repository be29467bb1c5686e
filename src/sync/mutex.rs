//! # Blocking Mutex
//!
//! Owner-tracking lock whose contenders sleep on a thread queue instead of
//! spinning. On unlock, ownership passes straight to the first waiter, so
//! a thread released from the queue already holds the lock when it runs.
//!
//! Thread context only. Interrupt handlers share data with threads
//! through [`SpinLock`](super::SpinLock) or [`IrqCell`].

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::config::EVENT_WAIT_INFINITE;
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::{Scheduler, ThreadId, ThreadQueue, WaitOutcome};

use super::IrqCell;

// ---------------------------------------------------------------------------
// Lock state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct MutexState {
    owner: Option<ThreadId>,
    queue: ThreadQueue,
}

impl MutexState {
    pub(crate) const fn new() -> Self {
        Self {
            owner: None,
            queue: ThreadQueue::new(),
        }
    }

    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Take the lock for the current thread or queue it. The owner taking
    /// it again is an immediate acquire.
    pub(crate) fn lock(
        &mut self,
        sched: &mut Scheduler,
        deadline: Option<u64>,
    ) -> KResult<WaitOutcome> {
        let cur = sched.current().ok_or(KernelError::NotInitialised)?;
        match self.owner {
            None => {
                self.owner = Some(cur);
                Ok(WaitOutcome::Acquired)
            }
            Some(owner) if owner == cur => Ok(WaitOutcome::Acquired),
            Some(_) => {
                sched.block_current(Some(self.queue.key()), deadline)?;
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    pub(crate) fn try_lock(&mut self, sched: &Scheduler) -> KResult<()> {
        let cur = sched.current().ok_or(KernelError::NotInitialised)?;
        match self.owner {
            None => {
                self.owner = Some(cur);
                Ok(())
            }
            Some(_) => Err(KernelError::WouldBlock),
        }
    }

    /// Release the lock, handing it to the first waiter.
    pub(crate) fn unlock(&mut self, sched: &mut Scheduler) -> KResult<()> {
        if self.owner.is_none() || self.owner != sched.current() {
            return Err(KernelError::InvalidArgument);
        }
        self.owner = sched.notify_one(self.queue.key());
        Ok(())
    }

    pub(crate) fn waiters(&self, sched: &Scheduler) -> usize {
        sched.waiters(self.queue.key())
    }
}

// ---------------------------------------------------------------------------
// Mutex<T>
// ---------------------------------------------------------------------------

pub struct Mutex<T> {
    raw: IrqCell<MutexState>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through a guard, and a guard exists only
// while its thread owns `raw`
unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    kernel: &'a Kernel,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: IrqCell::new(MutexState::new()),
            data: UnsafeCell::new(value),
        }
    }

    fn acquire(&self, kernel: &Kernel, timeout_ms: u32) -> KResult<()> {
        kernel.block_on("mutex_lock", &self.raw, timeout_ms, |m, s, d| {
            if m.owner.is_some() && m.owner == s.current() {
                return Err(KernelError::InvalidArgument);
            }
            m.lock(s, d)
        })
    }

    /// Lock, sleeping until the mutex is free.
    ///
    /// # Panics
    /// Relocking a mutex the caller already holds halts the kernel.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> MutexGuard<'a, T> {
        if let Err(e) = self.acquire(kernel, EVENT_WAIT_INFINITE) {
            kernel.panic(format_args!("mutex_lock: {}", e));
        }
        MutexGuard { mutex: self, kernel }
    }

    /// Lock, giving up after `timeout_ms` with `Err(Timeout)`.
    pub fn lock_timeout<'a>(
        &'a self,
        kernel: &'a Kernel,
        timeout_ms: u32,
    ) -> KResult<MutexGuard<'a, T>> {
        self.acquire(kernel, timeout_ms)?;
        Ok(MutexGuard { mutex: self, kernel })
    }

    pub fn try_lock<'a>(&'a self, kernel: &'a Kernel) -> KResult<MutexGuard<'a, T>> {
        kernel.enter(&self.raw, |m, s| m.try_lock(s))?;
        Ok(MutexGuard { mutex: self, kernel })
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.raw.lock(|m| m.owner())
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's thread owns the mutex
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard's thread owns the mutex
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.kernel.with_object(&self.mutex.raw, |m, s| m.unlock(s));
        if let Err(e) = released {
            self.kernel.panic(format_args!("mutex_unlock: {}", e));
        }
    }
}
