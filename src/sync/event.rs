//! Event queues.
//!
//! The basic wait/wake object: a thread queue with a one-shot latch. A
//! notify that finds nobody waiting is latched; [`EventQueue::wait`]
//! discards such a stale signal and always suspends, while
//! [`EventQueue::wait_pending`] consumes it and returns at once.

use crate::error::KResult;
use crate::kernel::Kernel;
use crate::sched::{Scheduler, ThreadQueue, WaitOutcome};

use super::IrqCell;

/// What a waiter does with a latched signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Latch {
    Discard,
    Consume,
}

pub(crate) fn wait(
    queue: &mut ThreadQueue,
    sched: &mut Scheduler,
    deadline: Option<u64>,
    latch: Latch,
) -> KResult<WaitOutcome> {
    match latch {
        Latch::Consume if queue.take_signal() => return Ok(WaitOutcome::Acquired),
        Latch::Consume => {}
        Latch::Discard => queue.clear(),
    }
    sched.block_current(Some(queue.key()), deadline)?;
    Ok(WaitOutcome::Blocked)
}

pub struct EventQueue {
    pub(crate) queue: IrqCell<ThreadQueue>,
}

impl EventQueue {
    pub const fn new() -> Self {
        Self {
            queue: IrqCell::new(ThreadQueue::new()),
        }
    }

    /// Suspend until notified or until `timeout_ms` elapses
    /// (`EVENT_WAIT_INFINITE`: no bound). Returns `Err(Timeout)` on expiry.
    pub fn wait(&self, kernel: &Kernel, timeout_ms: u32) -> KResult<()> {
        kernel.block_on("event_wait", &self.queue, timeout_ms, |q, s, d| {
            wait(q, s, d, Latch::Discard)
        })
    }

    /// Like [`wait`](Self::wait), but returns at once if a notify was
    /// latched since the last wait.
    pub fn wait_pending(&self, kernel: &Kernel, timeout_ms: u32) -> KResult<()> {
        kernel.block_on("event_wait", &self.queue, timeout_ms, |q, s, d| {
            wait(q, s, d, Latch::Consume)
        })
    }

    /// Wake the first waiter, or latch the signal. Interrupt-safe: only
    /// pends the context switch. Returns `true` if a thread was woken.
    pub fn notify(&self, kernel: &Kernel) -> bool {
        kernel.with_object(&self.queue, |q, s| s.notify(q))
    }

    /// Wake every waiter and return how many there were.
    pub fn broadcast(&self, kernel: &Kernel) -> usize {
        kernel.with_object(&self.queue, |q, s| s.broadcast(q))
    }

    pub fn waiters(&self, kernel: &Kernel) -> usize {
        kernel.enter(&self.queue, |q, s| s.waiters(q.key()))
    }

    pub fn is_signaled(&self) -> bool {
        self.queue.lock(|q| q.is_signaled())
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::error::KernelError;
    use crate::kernel::tests::booted;
    use crate::sched::{SchedPolicy, ThreadState};
    use crate::sysctl::SysCtl;
    use crate::time::Clocksource;

    #[test]
    fn test_timeout_removes_waiter() {
        static CLK: Clocksource = Clocksource::new("sys", 1000);
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        kernel.sysctl(SysCtl::SetSysClk(&CLK)).unwrap();
        let ev = Box::leak(Box::new(EventQueue::new()));

        ev.wait(kernel, 10).unwrap();
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Blocked));
        assert_eq!(ev.waiters(kernel), 1);
        kernel.context_switch(0);
        assert_eq!(kernel.current(), Some(ids[1]));

        for _ in 0..9 {
            kernel.tick();
        }
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Blocked));
        kernel.tick();
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Runnable));
        assert_eq!(ev.waiters(kernel), 0);

        while kernel.current() != Some(ids[0]) {
            kernel.yield_now();
            kernel.context_switch(0);
        }
        assert_eq!(kernel.sched.lock(|s| s.finish_wait()), Err(KernelError::Timeout));
        // a late notify finds nobody and is only latched
        assert!(!ev.notify(kernel));
        assert!(ev.is_signaled());
        kernel.sched.lock(|s| s.check_invariants()).unwrap();
    }

    #[test]
    fn test_notify_wakes_in_fifo_order() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 4);
        let ev = Box::leak(Box::new(EventQueue::new()));
        for _ in 0..3 {
            ev.wait(kernel, 0).unwrap();
            kernel.context_switch(0);
        }
        assert_eq!(kernel.current(), Some(ids[3]));
        assert_eq!(ev.waiters(kernel), 3);

        for expected in &ids[..3] {
            assert!(ev.notify(kernel));
            assert_eq!(kernel.thread_state(*expected), Ok(ThreadState::Runnable));
        }
        assert_eq!(ev.waiters(kernel), 0);
        assert!(!ev.is_signaled());
    }

    #[test]
    fn test_latched_signal_policy() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        let ev = Box::leak(Box::new(EventQueue::new()));
        assert!(!ev.notify(kernel));

        // wait_pending consumes the latch without blocking
        ev.wait_pending(kernel, 0).unwrap();
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Running));
        assert!(!ev.is_signaled());

        // wait drops a stale latch and blocks anyway
        assert!(!ev.notify(kernel));
        ev.wait(kernel, 0).unwrap();
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Blocked));
        assert!(!ev.is_signaled());
    }

    #[test]
    fn test_notify_from_interrupt_only_pends_switch() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        let ev = Box::leak(Box::new(EventQueue::new()));
        ev.wait(kernel, 0).unwrap();
        kernel.context_switch(0);

        let before = arch::host::switch_requests();
        arch::irq_enter();
        assert!(ev.notify(kernel));
        arch::irq_exit();
        assert_eq!(kernel.current(), Some(ids[1]), "no switch inside the handler");
        assert_eq!(arch::host::switch_requests(), before + 1);
        kernel.context_switch(0);
        assert_eq!(kernel.current(), Some(ids[0]));
    }

    #[test]
    fn test_broadcast_counts_waiters() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 3);
        let ev = Box::leak(Box::new(EventQueue::new()));
        ev.wait(kernel, 0).unwrap();
        kernel.context_switch(0);
        ev.wait(kernel, 0).unwrap();
        kernel.context_switch(0);
        assert_eq!(ev.broadcast(kernel), 2);
        assert_eq!(kernel.thread_state(ids[0]), Ok(ThreadState::Runnable));
        assert_eq!(kernel.thread_state(ids[1]), Ok(ThreadState::Runnable));
        assert_eq!(ev.broadcast(kernel), 0);
    }
}
