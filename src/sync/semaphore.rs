//! Counting semaphore.
//!
//! A negative count is the number of threads blocked in `wait`. A waiter
//! removed by `kill` leaves the count low until the next `signal`, which
//! keeps the unit when nobody is left to take it.

use crate::config::EVENT_WAIT_INFINITE;
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::{Scheduler, ThreadQueue, WaitOutcome};

use super::IrqCell;

pub(crate) struct SemState {
    value: i32,
    queue: ThreadQueue,
}

impl SemState {
    fn wait(&mut self, sched: &mut Scheduler, deadline: Option<u64>) -> KResult<WaitOutcome> {
        self.value -= 1;
        if self.value >= 0 {
            return Ok(WaitOutcome::Acquired);
        }
        if let Err(e) = sched.block_current(Some(self.queue.key()), deadline) {
            self.value += 1;
            return Err(e);
        }
        Ok(WaitOutcome::Blocked)
    }

    fn try_wait(&mut self) -> KResult<()> {
        if self.value <= 0 {
            return Err(KernelError::WouldBlock);
        }
        self.value -= 1;
        Ok(())
    }

    fn signal(&mut self, sched: &mut Scheduler) {
        if self.value < 0 && sched.notify_one(self.queue.key()).is_some() {
            // unit handed straight to the woken waiter
            self.value += 1;
        } else {
            self.value = self.value.max(0) + 1;
        }
    }
}

pub struct Semaphore {
    state: IrqCell<SemState>,
}

impl Semaphore {
    pub const fn new(value: i32) -> Self {
        Self {
            state: IrqCell::new(SemState {
                value,
                queue: ThreadQueue::new(),
            }),
        }
    }

    /// Take one unit, suspending while none is available.
    pub fn wait(&self, kernel: &Kernel) {
        let taken = kernel.block_on("sem_wait", &self.state, EVENT_WAIT_INFINITE, |st, s, d| {
            st.wait(s, d)
        });
        if let Err(e) = taken {
            kernel.panic(format_args!("sem_wait: {}", e));
        }
    }

    /// Take one unit if available. Never blocks.
    pub fn try_wait(&self) -> KResult<()> {
        self.state.lock(|st| st.try_wait())
    }

    /// Return one unit, waking the first waiter if any. Interrupt-safe.
    pub fn signal(&self, kernel: &Kernel) {
        kernel.with_object(&self.state, |st, s| st.signal(s));
    }

    pub fn value(&self) -> i32 {
        self.state.lock(|st| st.value)
    }
}
