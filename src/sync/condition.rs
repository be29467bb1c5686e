//! Condition variables.
//!
//! A [`Condition`] owns its monitor lock. `wait` releases the lock and
//! suspends the caller inside one critical section, so a `signal` issued
//! right after the release cannot be lost. A woken waiter re-enters the
//! ordinary blocking acquire before `wait` returns.

use crate::config::EVENT_WAIT_INFINITE;
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::{Scheduler, ThreadQueue, WaitOutcome};

use super::mutex::MutexState;
use super::IrqCell;

pub(crate) struct CondState {
    mutex: MutexState,
    queue: ThreadQueue,
}

impl CondState {
    /// Release the monitor lock and block on the condition.
    fn wait(&mut self, sched: &mut Scheduler, deadline: Option<u64>) -> KResult<WaitOutcome> {
        if self.mutex.owner().is_none() || self.mutex.owner() != sched.current() {
            return Err(KernelError::InvalidArgument);
        }
        sched.block_current(Some(self.queue.key()), deadline)?;
        // the caller is blocked now; a hand-off only makes it runnable
        // later, never current
        self.mutex.unlock(sched)?;
        Ok(WaitOutcome::Blocked)
    }
}

pub struct Condition {
    state: IrqCell<CondState>,
}

impl Condition {
    pub const fn new() -> Self {
        Self {
            state: IrqCell::new(CondState {
                mutex: MutexState::new(),
                queue: ThreadQueue::new(),
            }),
        }
    }

    /// Acquire the monitor lock.
    pub fn lock(&self, kernel: &Kernel) {
        let locked = kernel.block_on("condition_lock", &self.state, EVENT_WAIT_INFINITE, |c, s, d| {
            c.mutex.lock(s, d)
        });
        if let Err(e) = locked {
            kernel.panic(format_args!("condition_lock: {}", e));
        }
    }

    /// Release the monitor lock. Fails if the caller does not hold it.
    pub fn unlock(&self, kernel: &Kernel) -> KResult<()> {
        kernel.with_object(&self.state, |c, s| c.mutex.unlock(s))
    }

    /// Wait for a signal. The monitor lock must be held; it is held again
    /// when this returns.
    pub fn wait(&self, kernel: &Kernel) -> KResult<()> {
        self.wait_for(kernel, EVENT_WAIT_INFINITE)
    }

    /// Like [`wait`](Self::wait), bounded by `timeout_ms`. The lock is
    /// re-acquired on timeout too.
    pub fn wait_for(&self, kernel: &Kernel, timeout_ms: u32) -> KResult<()> {
        let waited = kernel.block_on("condition_wait", &self.state, timeout_ms, |c, s, d| {
            c.wait(s, d)
        });
        self.resume(kernel, waited)
    }

    /// Re-take the monitor lock after a wait that got as far as blocking.
    fn resume(&self, kernel: &Kernel, waited: KResult<()>) -> KResult<()> {
        match waited {
            Ok(()) | Err(KernelError::Timeout) => {
                self.lock(kernel);
                waited
            }
            Err(e) => Err(e),
        }
    }

    /// Wake one waiter. Returns `false` if nobody was waiting.
    pub fn signal(&self, kernel: &Kernel) -> bool {
        kernel.with_object(&self.state, |c, s| s.notify_one(c.queue.key()).is_some())
    }

    /// Wake every waiter and return how many there were.
    pub fn bcast(&self, kernel: &Kernel) -> usize {
        kernel.with_object(&self.state, |c, s| {
            let mut woken = 0;
            while s.notify_one(c.queue.key()).is_some() {
                woken += 1;
            }
            woken
        })
    }

    pub fn waiters(&self, kernel: &Kernel) -> usize {
        kernel.enter(&self.state, |c, s| s.waiters(c.queue.key()))
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}
