//! Inter-process messages.
//!
//! [`IpmQueue`] is a bounded ring of `Copy` messages. Any context may
//! post; threads block in `get` until a message arrives.

use crate::config::IPM_QUEUE_LEN;
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::{Scheduler, ThreadQueue};

use super::IrqCell;

pub(crate) struct IpmState<T: Copy, const N: usize> {
    ring: [Option<T>; N],
    head: usize,
    len: usize,
    queue: ThreadQueue,
}

impl<T: Copy, const N: usize> IpmState<T, N> {
    const fn new() -> Self {
        Self {
            ring: [None; N],
            head: 0,
            len: 0,
            queue: ThreadQueue::new(),
        }
    }

    fn push(&mut self, msg: T) -> KResult<()> {
        if self.len == N {
            return Err(KernelError::QueueFull);
        }
        self.ring[(self.head + self.len) % N] = Some(msg);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let msg = self.ring[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        msg
    }

    /// Take the oldest message, or block the caller until one is posted.
    fn take_or_block(&mut self, sched: &mut Scheduler) -> KResult<Option<T>> {
        if let Some(msg) = self.pop() {
            return Ok(Some(msg));
        }
        sched.block_current(Some(self.queue.key()), None)?;
        Ok(None)
    }
}

pub struct IpmQueue<T: Copy, const N: usize = IPM_QUEUE_LEN> {
    state: IrqCell<IpmState<T, N>>,
}

impl<T: Copy, const N: usize> IpmQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            state: IrqCell::new(IpmState::new()),
        }
    }

    /// Queue `msg` and wake one receiver. Interrupt-safe.
    pub fn post(&self, kernel: &Kernel, msg: T) -> KResult<()> {
        kernel.with_object(&self.state, |st, s| {
            st.push(msg)?;
            s.notify_one(st.queue.key());
            Ok(())
        })
    }

    /// Receive the oldest message, sleeping while the queue is empty.
    pub fn get(&self, kernel: &Kernel) -> T {
        loop {
            kernel.assert_thread_context("ipm_get");
            match kernel.enter(&self.state, |st, s| st.take_or_block(s)) {
                Ok(Some(msg)) => return msg,
                Ok(None) => kernel.switch_out(),
                Err(e) => kernel.panic(format_args!("ipm_get: {}", e)),
            }
        }
    }

    pub fn try_get(&self) -> KResult<T> {
        self.state.lock(|st| st.pop()).ok_or(KernelError::QueueEmpty)
    }

    /// Drop all queued messages. Refused (returns `false`) while a thread
    /// waits on the queue.
    pub fn reset(&self, kernel: &Kernel) -> bool {
        kernel.enter(&self.state, |st, s| {
            if s.waiters(st.queue.key()) > 0 {
                return false;
            }
            while st.pop().is_some() {}
            true
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock(|st| st.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Copy, const N: usize> Default for IpmQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
