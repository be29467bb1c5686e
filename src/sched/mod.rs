//! # Scheduler
//!
//! The run queue: a thread table, the active scheduling class (which owns
//! the run list), the current thread and the idle thread.
//!
//! The scheduler is a plain state machine. It never switches stacks
//! itself; it decides. The port's PendSV handler stores the outgoing
//! stack pointer, calls [`Scheduler::schedule`] and resumes whatever
//! thread is current afterwards. On the host port the tests play PendSV.
//!
//! ## Scheduling Points
//!
//! `schedule()` switches only when the current thread is no longer
//! running (blocked, terminated) or carries `NEED_RESCHED`. The flag is
//! set by:
//! - a wake-up of a thread at least as important as the current one
//! - `yield_now()` when another eligible thread is runnable
//! - the clock tick once the current slice is used up
//!
//! ## Idle
//!
//! The idle thread is never on the run list. It runs only when the class
//! has nothing runnable, and any wake-up flags it for preemption.

pub mod class;
pub mod list;
pub mod stack;
pub mod thread;

use log::{debug, info, trace};

use crate::config::{IDLE_PRIO, MAX_THREADS, TIME_SLICE};
use crate::error::{KResult, KernelError};

pub use class::{ActiveClass, SchedClass, SchedPolicy};
pub use list::{ThreadList, ThreadQueue};
pub use stack::{Stack, StackArena};
pub use thread::{
    QueueKey, StackRegion, Thread, ThreadEntry, ThreadFlags, ThreadId, ThreadState, WakeReason,
};

// ---------------------------------------------------------------------------
// Results of scheduler operations
// ---------------------------------------------------------------------------

/// A context switch decided by [`Scheduler::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub prev: ThreadId,
    pub next: ThreadId,
}

/// Outcome of an acquire-or-block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Satisfied immediately; the caller keeps running.
    Acquired,
    /// The current thread is now blocked; a switch must follow.
    Blocked,
}

/// Outcome of [`Scheduler::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// The target had terminated; its slot has been reclaimed.
    Exited(i32),
    /// The caller is blocked until the target terminates.
    Blocked,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    generation: u8,
    thread: Option<Thread>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        generation: 0,
        thread: None,
    };
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    slots: [Slot; MAX_THREADS],
    class: ActiveClass,
    current: Option<ThreadId>,
    idle: Option<ThreadId>,
    /// Arena stack of a thread that killed itself, freed after the switch.
    released: Option<StackRegion>,
    switches: u32,
    /// Clock ticks times 1000 not yet accounted as whole milliseconds.
    tick_frac: u64,
}

impl Scheduler {
    pub const fn new(policy: SchedPolicy) -> Self {
        Self {
            slots: [Slot::EMPTY; MAX_THREADS],
            class: ActiveClass::new(policy),
            current: None,
            idle: None,
            released: None,
            switches: 0,
            tick_frac: 0,
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.class.policy()
    }

    // -----------------------------------------------------------------------
    // Thread table
    // -----------------------------------------------------------------------

    pub fn thread(&self, tid: ThreadId) -> KResult<&Thread> {
        self.slots
            .get(tid.index())
            .filter(|s| s.generation == tid.generation())
            .and_then(|s| s.thread.as_ref())
            .ok_or(KernelError::NoSuchThread)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> KResult<&mut Thread> {
        self.slots
            .get_mut(tid.index())
            .filter(|s| s.generation == tid.generation())
            .and_then(|s| s.thread.as_mut())
            .ok_or(KernelError::NoSuchThread)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.slots.iter().filter_map(|s| s.thread.as_ref())
    }

    pub fn nr_threads(&self) -> usize {
        self.threads().count()
    }

    pub fn nr_running(&self) -> usize {
        self.class.nr_running()
    }

    pub fn thread_state(&self, tid: ThreadId) -> KResult<ThreadState> {
        self.thread(tid).map(|t| t.state)
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn current_thread(&self) -> Option<&Thread> {
        self.current.and_then(|c| self.thread(c).ok())
    }

    pub fn idle(&self) -> Option<ThreadId> {
        self.idle
    }

    pub fn switch_count(&self) -> u32 {
        self.switches
    }

    /// True when the current thread must be switched away from.
    pub fn need_resched(&self) -> bool {
        self.current_thread().is_some_and(|t| {
            t.flags.contains(ThreadFlags::NEED_RESCHED) || t.state != ThreadState::Running
        })
    }

    // -----------------------------------------------------------------------
    // Creation and start
    // -----------------------------------------------------------------------

    fn alloc_slot(
        &mut self,
        name: &'static str,
        prio: u8,
        stack: StackRegion,
        sp: usize,
    ) -> KResult<ThreadId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.thread.is_none())
            .ok_or(KernelError::NoMemory)?;
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let id = ThreadId::new(index as u8, slot.generation);
        slot.thread = Some(Thread::new(id, name, prio, stack, sp));
        Ok(id)
    }

    /// Register a new thread and make it runnable.
    pub fn create_thread(
        &mut self,
        name: &'static str,
        prio: u8,
        stack: StackRegion,
        sp: usize,
        flags: ThreadFlags,
    ) -> KResult<ThreadId> {
        if flags.contains(ThreadFlags::IDLE) {
            return Err(KernelError::InvalidArgument);
        }
        let id = self.alloc_slot(name, prio, stack, sp)?;
        if let Err(e) = self.class.add_thread(id, prio) {
            self.slots[id.index()].thread = None;
            return Err(e);
        }
        let thread = self.thread_mut(id)?;
        thread.flags = flags;
        thread.state = ThreadState::Runnable;
        debug!("thread {} created in slot {} (prio {})", name, id.index(), prio);
        self.check_preempt(id);
        Ok(id)
    }

    /// Register the idle thread. It is runnable but never queued.
    pub fn create_idle(&mut self, stack: StackRegion, sp: usize) -> KResult<ThreadId> {
        if self.idle.is_some() {
            return Err(KernelError::AlreadyInitialised);
        }
        let id = self.alloc_slot("idle", IDLE_PRIO, stack, sp)?;
        let thread = self.thread_mut(id)?;
        thread.flags = ThreadFlags::IDLE;
        thread.state = ThreadState::Runnable;
        self.idle = Some(id);
        Ok(id)
    }

    /// Make the first runnable thread (or idle) current.
    pub fn start(&mut self) -> KResult<ThreadId> {
        if self.current.is_some() {
            return Err(KernelError::AlreadyInitialised);
        }
        let idle = self.idle.ok_or(KernelError::NotInitialised)?;
        let first = match self.class.next_runnable() {
            Some(tid) => {
                self.class.rm_thread(tid)?;
                tid
            }
            None => idle,
        };
        let thread = self.thread_mut(first)?;
        thread.state = ThreadState::Running;
        thread.slice = TIME_SLICE;
        info!("scheduler started with {}", thread.name);
        self.current = Some(first);
        Ok(first)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Whether the thread at the head of the run list may take the CPU from
    /// a running thread of nice value `prio`.
    fn head_may_preempt(&self, prio: u8, idle: bool) -> bool {
        let Some(head) = self.class.next_runnable() else {
            return false;
        };
        idle || self.thread(head).is_ok_and(|h| self.class.preempts(head, h.prio, prio))
    }

    fn set_need_resched(&mut self) {
        if let Some(cur) = self.current {
            if let Ok(t) = self.thread_mut(cur) {
                t.flags.insert(ThreadFlags::NEED_RESCHED);
            }
        }
    }

    /// Flag the current thread if `woken` should run before it.
    fn check_preempt(&mut self, woken: ThreadId) {
        let Some(cur) = self.current_thread() else {
            return;
        };
        let (cur_prio, cur_idle) = (cur.prio, cur.is_idle());
        let preempts = self.thread(woken).is_ok_and(|w| {
            cur_idle || self.class.preempts(woken, w.prio, cur_prio)
        });
        if preempts {
            self.set_need_resched();
        }
    }

    /// Pick the next thread and make it current. Returns `None` when the
    /// current thread keeps the CPU.
    pub fn schedule(&mut self) -> Option<Switch> {
        let prev = self.current?;
        let (state, flagged, prio, idle) = {
            let t = self.thread_mut(prev).ok()?;
            let flagged = t.flags.contains(ThreadFlags::NEED_RESCHED);
            t.flags.remove(ThreadFlags::NEED_RESCHED);
            (t.state, flagged, t.prio, t.is_idle())
        };
        let running = state == ThreadState::Running;
        if running && !flagged {
            return None;
        }

        let next = match self.class.next_runnable() {
            Some(tid) => {
                self.class.rm_thread(tid).ok()?;
                tid
            }
            None if running => return None,
            None => self.idle?,
        };

        if running {
            if let Ok(t) = self.thread_mut(prev) {
                t.state = ThreadState::Runnable;
            }
            if !idle {
                // cannot fail: the slot of `next` was just freed up
                let _ = self.class.add_thread(prev, prio);
            }
        } else if state == ThreadState::Terminated {
            let stack = self.thread_mut(prev).ok().and_then(|t| {
                let owned = t.flags.contains(ThreadFlags::ARENA_STACK);
                t.flags.remove(ThreadFlags::ARENA_STACK);
                owned.then_some(t.stack)
            });
            if stack.is_some() {
                self.released = stack;
            }
        }

        let thread = self.thread_mut(next).ok()?;
        thread.state = ThreadState::Running;
        thread.flags.remove(ThreadFlags::NEED_RESCHED);
        trace!("switch {} -> {}", prev.index(), next.index());

        self.current = Some(next);
        self.switches = self.switches.wrapping_add(1);
        self.class.post_schedule(prev, next);
        Some(Switch { prev, next })
    }

    /// Give up the rest of the slice. Returns `true` if a switch is due.
    pub fn yield_now(&mut self) -> bool {
        let Some((prio, idle)) = self.current_thread().map(|t| (t.prio, t.is_idle())) else {
            return false;
        };
        let due = self.head_may_preempt(prio, idle);
        if let Some(cur) = self.current {
            if let Ok(t) = self.thread_mut(cur) {
                t.slice = TIME_SLICE;
                if due {
                    t.flags.insert(ThreadFlags::NEED_RESCHED);
                }
            }
        }
        due
    }

    /// Account `ms` of CPU to the current thread and preempt it once its
    /// slice is used up. Returns `true` if a switch is due.
    pub fn clock_tick(&mut self, ms: u16) -> bool {
        let Some(cur) = self.current else {
            return false;
        };
        let Some((prio, idle)) = self.current_thread().map(|t| (t.prio, t.is_idle())) else {
            return false;
        };
        let eligible = self.head_may_preempt(prio, idle);
        let Ok(t) = self.thread_mut(cur) else {
            return false;
        };
        t.cputime = t.cputime.wrapping_add(u32::from(ms));
        if t.state == ThreadState::Running {
            if idle {
                if eligible {
                    t.flags.insert(ThreadFlags::NEED_RESCHED);
                }
            } else {
                t.slice = t.slice.saturating_sub(ms);
                if t.slice == 0 {
                    t.slice = TIME_SLICE;
                    if eligible {
                        t.flags.insert(ThreadFlags::NEED_RESCHED);
                    }
                }
            }
        }
        self.need_resched()
    }

    /// Account `ticks` of a `hz` clock, carrying the sub-millisecond
    /// remainder to the next call. Returns `true` if a switch is due.
    pub fn account_ticks(&mut self, ticks: u64, hz: u32) -> bool {
        let hz = u64::from(hz.max(1));
        self.tick_frac = self.tick_frac.saturating_add(ticks.saturating_mul(1000));
        let ms = self.tick_frac / hz;
        self.tick_frac %= hz;
        if ms == 0 {
            return self.need_resched();
        }
        self.clock_tick(ms.min(u64::from(u16::MAX)) as u16)
    }

    pub fn save_sp(&mut self, sp: usize) {
        if let Some(cur) = self.current {
            if let Ok(t) = self.thread_mut(cur) {
                t.saved_sp = sp;
            }
        }
    }

    pub fn current_sp(&self) -> Option<usize> {
        self.current_thread().map(|t| t.saved_sp)
    }

    /// Arena stack freed by the last switch away from a terminated thread.
    pub fn take_released_stack(&mut self) -> Option<StackRegion> {
        self.released.take()
    }

    // -----------------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------------

    /// Move the current thread to `Blocked`, optionally linked into the
    /// wait queue `key` and bounded by the absolute tick `deadline`.
    pub fn block_current(
        &mut self,
        key: Option<QueueKey>,
        deadline: Option<u64>,
    ) -> KResult<ThreadId> {
        let cur = self.current.ok_or(KernelError::NotInitialised)?;
        let thread = self.slots[cur.index()]
            .thread
            .as_mut()
            .ok_or(KernelError::NoSuchThread)?;
        if thread.is_idle() || thread.state != ThreadState::Running {
            return Err(KernelError::InvalidArgument);
        }
        thread.state = ThreadState::Blocked;
        thread.wake = WakeReason::None;
        thread.wake_at = deadline;
        thread.flags.insert(ThreadFlags::NEED_RESCHED);
        if let Some(key) = key {
            self.class.queue_add(thread, key);
        }
        Ok(cur)
    }

    /// Result of the current thread's last wait.
    pub fn finish_wait(&self) -> KResult<()> {
        match self.current_thread().map(|t| t.wake) {
            Some(WakeReason::TimedOut) => Err(KernelError::Timeout),
            Some(_) => Ok(()),
            None => Err(KernelError::NotInitialised),
        }
    }

    /// Make a blocked thread runnable. Returns `false` if it was not
    /// blocked.
    pub fn wake(&mut self, tid: ThreadId, reason: WakeReason) -> bool {
        let current = self.current;
        let Ok(thread) = self.thread_mut(tid) else {
            return false;
        };
        if thread.state != ThreadState::Blocked {
            return false;
        }
        let prio = thread.prio;
        thread.wake = reason;
        thread.wake_at = None;
        if current == Some(tid) {
            // woken before the switch away happened
            thread.state = ThreadState::Running;
            thread.flags.remove(ThreadFlags::NEED_RESCHED);
            if let Some(t) = self.slots[tid.index()].thread.as_mut() {
                self.class.queue_rm(t);
            }
            return true;
        }
        thread.state = ThreadState::Runnable;
        if let Some(t) = self.slots[tid.index()].thread.as_mut() {
            self.class.queue_rm(t);
        }
        // cannot fail: a blocked thread is never on the run list
        let _ = self.class.add_thread(tid, prio);
        self.check_preempt(tid);
        true
    }

    /// First thread in wake order blocked on `key`.
    pub fn queue_head(&self, key: QueueKey) -> Option<ThreadId> {
        self.threads()
            .filter(|t| t.waits_on(key))
            .min_by_key(|t| t.wait.map_or((u64::MAX, u64::MAX), |w| w.order()))
            .map(|t| t.id)
    }

    pub fn waiters(&self, key: QueueKey) -> usize {
        self.threads().filter(|t| t.waits_on(key)).count()
    }

    /// Wake the head of `key` without latching anything.
    pub fn notify_one(&mut self, key: QueueKey) -> Option<ThreadId> {
        let head = self.queue_head(key)?;
        self.wake(head, WakeReason::Signaled);
        Some(head)
    }

    /// Wake the head of `queue`, or latch the signal if nobody waits.
    pub fn notify(&mut self, queue: &mut ThreadQueue) -> bool {
        if self.notify_one(queue.key()).is_some() {
            true
        } else {
            queue.latch();
            false
        }
    }

    /// Wake every waiter of `queue` and drop any latched signal.
    pub fn broadcast(&mut self, queue: &mut ThreadQueue) -> usize {
        let mut woken = 0;
        while self.notify_one(queue.key()).is_some() {
            woken += 1;
        }
        queue.clear();
        woken
    }

    /// Wake every blocked thread whose deadline is at or before `now`.
    pub fn process_timeouts(&mut self, now: u64) -> usize {
        self.class.set_clock(now);
        let mut woken = 0;
        for index in 0..MAX_THREADS {
            let id = match &self.slots[index].thread {
                Some(t) if t.state == ThreadState::Blocked => match t.wake_at {
                    Some(d) if d <= now => t.id,
                    _ => continue,
                },
                _ => continue,
            };
            if self.wake(id, WakeReason::TimedOut) {
                woken += 1;
            }
        }
        woken
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Terminate `tid` wherever it is queued and wake its joiners. Returns
    /// the arena stack to free now; a thread killing itself keeps its stack
    /// until the switch away.
    pub fn kill(&mut self, tid: ThreadId, code: i32) -> KResult<Option<StackRegion>> {
        let is_current = self.current == Some(tid);
        let thread = self.thread_mut(tid)?;
        if thread.is_idle() || thread.state == ThreadState::Terminated {
            return Err(KernelError::InvalidArgument);
        }
        let state = thread.state;
        thread.state = ThreadState::Terminated;
        thread.exit_code = code;
        thread.wake_at = None;
        let name = thread.name;
        let release = if is_current {
            thread.flags.insert(ThreadFlags::NEED_RESCHED);
            None
        } else if thread.flags.contains(ThreadFlags::ARENA_STACK) {
            thread.flags.remove(ThreadFlags::ARENA_STACK);
            Some(thread.stack)
        } else {
            None
        };

        match state {
            ThreadState::Runnable => {
                let _ = self.class.rm_thread(tid);
            }
            ThreadState::Blocked => {
                if let Some(t) = self.slots[tid.index()].thread.as_mut() {
                    self.class.queue_rm(t);
                }
            }
            _ => {}
        }
        info!("thread {} terminated ({})", name, code);

        while self.notify_one(QueueKey::Join(tid.index() as u8)).is_some() {}
        Ok(release)
    }

    /// Reap `target` if it has terminated, otherwise block the caller on it.
    pub fn join(&mut self, target: ThreadId) -> KResult<Join> {
        if self.current == Some(target) {
            return Err(KernelError::InvalidArgument);
        }
        let thread = self.thread(target)?;
        if thread.is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        if thread.state == ThreadState::Terminated {
            let code = thread.exit_code;
            self.slots[target.index()].thread = None;
            return Ok(Join::Exited(code));
        }
        self.block_current(Some(QueueKey::Join(target.index() as u8)), None)?;
        Ok(Join::Blocked)
    }

    /// Change the nice value of `tid`, re-sorting it if queued.
    pub fn set_prio(&mut self, tid: ThreadId, prio: u8) -> KResult<()> {
        let thread = self.thread_mut(tid)?;
        if thread.is_idle() {
            return Err(KernelError::InvalidArgument);
        }
        thread.prio = prio;
        let state = thread.state;
        match state {
            ThreadState::Runnable => {
                self.class.rm_thread(tid)?;
                self.class.add_thread(tid, prio)?;
                self.check_preempt(tid);
            }
            ThreadState::Running => {
                if self.head_may_preempt(prio, false) {
                    self.set_need_resched();
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Verify the run-queue invariants.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let run = self.class.run_list();
        for tid in run.iter() {
            if run.iter().filter(|t| *t == tid).count() != 1 {
                return Err("thread queued twice");
            }
            match self.thread(tid) {
                Ok(t) if t.state == ThreadState::Runnable && !t.is_idle() => {}
                Ok(_) => return Err("non-runnable thread on run list"),
                Err(_) => return Err("stale handle on run list"),
            }
        }

        let mut running = 0;
        for t in self.threads() {
            let queued = run.contains(t.id);
            match t.state {
                ThreadState::Running => {
                    running += 1;
                    if self.current != Some(t.id) {
                        return Err("running thread is not current");
                    }
                    if queued {
                        return Err("current thread on run list");
                    }
                }
                ThreadState::Runnable => {
                    if !t.is_idle() && !queued {
                        return Err("runnable thread missing from run list");
                    }
                }
                ThreadState::Blocked => {
                    if t.wait.is_none() && t.wake_at.is_none() {
                        return Err("blocked thread on no queue");
                    }
                }
                ThreadState::Created | ThreadState::Terminated => {}
            }
            if t.wait.is_some() && t.state != ThreadState::Blocked {
                return Err("wait link on a thread that is not blocked");
            }
        }

        match (self.current, running) {
            (None, 0) => Ok(()),
            (Some(_), 1) => Ok(()),
            _ => Err("exactly one thread must be current"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DEFAULT_PRIO;

    pub(crate) fn region() -> StackRegion {
        StackRegion::new(0x2000_0000, 1024)
    }

    /// Scheduler with an idle thread and `n` default-priority threads.
    pub(crate) fn boot(policy: SchedPolicy, n: usize) -> (Scheduler, Vec<ThreadId>) {
        let mut s = Scheduler::new(policy);
        s.create_idle(region(), 0).unwrap();
        let ids = (0..n)
            .map(|_| {
                s.create_thread("worker", DEFAULT_PRIO, region(), 0, ThreadFlags::empty())
                    .unwrap()
            })
            .collect();
        (s, ids)
    }

    #[test]
    fn test_start_requires_idle() {
        let mut s = Scheduler::new(SchedPolicy::Fifo);
        assert_eq!(s.start(), Err(KernelError::NotInitialised));
    }

    #[test]
    fn test_start_runs_first_then_idle() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        assert_eq!(s.start(), Ok(ids[0]));
        assert_eq!(s.thread_state(ids[0]), Ok(ThreadState::Running));
        assert_eq!(s.nr_running(), 1);
        assert_eq!(s.start(), Err(KernelError::AlreadyInitialised));

        let (mut empty, _) = boot(SchedPolicy::Fifo, 0);
        assert_eq!(empty.start(), empty.idle().ok_or(KernelError::NotInitialised));
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_yield_round_robin() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 3);
        s.start().unwrap();
        let mut order = vec![s.current().unwrap()];
        for _ in 0..5 {
            assert!(s.yield_now());
            let sw = s.schedule().unwrap();
            order.push(sw.next);
            s.check_invariants().unwrap();
        }
        assert_eq!(order, vec![ids[0], ids[1], ids[2], ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn test_no_switch_without_flag() {
        let (mut s, _) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        assert_eq!(s.schedule(), None);
        assert_eq!(s.switch_count(), 0);
    }

    #[test]
    fn test_block_and_wake() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        let q = ThreadQueue::new();
        s.block_current(Some(q.key()), None).unwrap();
        assert_eq!(s.schedule().unwrap().next, ids[1]);
        assert_eq!(s.thread_state(ids[0]), Ok(ThreadState::Blocked));
        assert_eq!(s.waiters(q.key()), 1);
        s.check_invariants().unwrap();

        assert_eq!(s.notify_one(q.key()), Some(ids[0]));
        assert_eq!(s.thread_state(ids[0]), Ok(ThreadState::Runnable));
        assert_eq!(s.waiters(q.key()), 0);
        // equal priority wakes preempt
        assert!(s.need_resched());
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_last_thread_blocks_into_idle() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 1);
        s.start().unwrap();
        s.block_current(None, Some(10)).unwrap();
        assert_eq!(s.schedule().unwrap().next, s.idle().unwrap());
        assert_eq!(s.process_timeouts(9), 0);
        assert_eq!(s.process_timeouts(10), 1);
        assert!(s.need_resched(), "wake-up must preempt idle");
        assert_eq!(s.schedule().unwrap().next, ids[0]);
        assert_eq!(s.finish_wait(), Err(KernelError::Timeout));
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_wake_before_switch_keeps_running() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        let mut q = ThreadQueue::new();
        s.block_current(Some(q.key()), None).unwrap();
        assert!(s.notify(&mut q));
        assert_eq!(s.thread_state(ids[0]), Ok(ThreadState::Running));
        assert_eq!(s.schedule(), None);
        assert_eq!(s.finish_wait(), Ok(()));
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_notify_latches_without_waiter() {
        let (mut s, _) = boot(SchedPolicy::Fifo, 1);
        s.start().unwrap();
        let mut q = ThreadQueue::new();
        assert!(!s.notify(&mut q));
        assert!(q.is_signaled());
        assert_eq!(s.broadcast(&mut q), 0);
        assert!(!q.is_signaled());
    }

    #[test]
    fn test_clock_tick_preempts_after_slice() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        for _ in 1..TIME_SLICE {
            assert!(!s.clock_tick(1));
        }
        assert!(s.clock_tick(1));
        assert_eq!(s.schedule().unwrap().next, ids[1]);
        assert_eq!(s.thread(ids[0]).unwrap().cputime, u32::from(TIME_SLICE));
        assert_eq!(s.thread(ids[0]).unwrap().slice, TIME_SLICE);
    }

    #[test]
    fn test_lone_thread_keeps_cpu() {
        let (mut s, _) = boot(SchedPolicy::Fifo, 1);
        s.start().unwrap();
        for _ in 0..3 * TIME_SLICE {
            assert!(!s.clock_tick(1));
        }
        assert!(!s.yield_now());
    }

    #[test]
    fn test_priority_wake_preempts_only_lower() {
        let mut s = Scheduler::new(SchedPolicy::Priority);
        s.create_idle(region(), 0).unwrap();
        let mid = s.create_thread("mid", 50, region(), 0, ThreadFlags::empty()).unwrap();
        let low = s.create_thread("low", 200, region(), 0, ThreadFlags::empty()).unwrap();
        let high = s.create_thread("high", 10, region(), 0, ThreadFlags::empty()).unwrap();
        assert_eq!(s.start(), Ok(high));

        // high blocks: mid runs next, not low
        s.block_current(None, Some(100)).unwrap();
        assert_eq!(s.schedule().unwrap().next, mid);
        // the slice expiring does not hand the CPU to a less important thread
        for _ in 0..TIME_SLICE {
            assert!(!s.clock_tick(1));
        }
        s.process_timeouts(100);
        assert!(s.need_resched());
        assert_eq!(s.schedule().unwrap().next, high);
        assert_eq!(s.class.run_list().iter().collect::<Vec<_>>(), vec![mid, low]);
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_set_prio_resorts() {
        let mut s = Scheduler::new(SchedPolicy::Priority);
        s.create_idle(region(), 0).unwrap();
        let a = s.create_thread("a", 10, region(), 0, ThreadFlags::empty()).unwrap();
        let b = s.create_thread("b", 20, region(), 0, ThreadFlags::empty()).unwrap();
        let c = s.create_thread("c", 30, region(), 0, ThreadFlags::empty()).unwrap();
        s.start().unwrap();
        s.set_prio(c, 5).unwrap();
        assert!(s.need_resched());
        assert_eq!(s.class.run_list().iter().collect::<Vec<_>>(), vec![c, b]);
        assert_eq!(s.schedule().unwrap(), Switch { prev: a, next: c });
        assert_eq!(s.set_prio(s.idle().unwrap(), 1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_kill_runnable_and_blocked() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 3);
        s.start().unwrap();
        let q = ThreadQueue::new();
        s.block_current(Some(q.key()), None).unwrap();
        s.schedule().unwrap();

        // ids[0] blocked on q, ids[1] current, ids[2] runnable
        assert_eq!(s.kill(ids[0], 3), Ok(None));
        assert_eq!(s.waiters(q.key()), 0);
        assert_eq!(s.kill(ids[2], 4), Ok(None));
        assert_eq!(s.nr_running(), 0);
        assert_eq!(s.kill(ids[2], 4), Err(KernelError::InvalidArgument));
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_kill_current_defers_stack_release() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.thread_mut(ids[0]).unwrap().flags.insert(ThreadFlags::ARENA_STACK);
        s.start().unwrap();
        assert_eq!(s.kill(ids[0], 0), Ok(None));
        assert_eq!(s.take_released_stack(), None);
        assert_eq!(s.schedule().unwrap().next, ids[1]);
        assert_eq!(s.take_released_stack(), Some(region()));
        assert_eq!(s.take_released_stack(), None);
    }

    #[test]
    fn test_join_reaps_and_invalidates_handle() {
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        assert_eq!(s.join(ids[0]), Err(KernelError::InvalidArgument));
        assert_eq!(s.join(ids[1]), Ok(Join::Blocked));
        assert_eq!(s.schedule().unwrap().next, ids[1]);

        s.kill(ids[1], 42).unwrap();
        assert_eq!(s.thread_state(ids[0]), Ok(ThreadState::Runnable));
        assert_eq!(s.schedule().unwrap().next, ids[0]);
        assert_eq!(s.join(ids[1]), Ok(Join::Exited(42)));
        assert_eq!(s.thread_state(ids[1]), Err(KernelError::NoSuchThread));

        // the slot is reused under a new generation
        let again = s
            .create_thread("again", DEFAULT_PRIO, region(), 0, ThreadFlags::empty())
            .unwrap();
        assert_eq!(again.index(), ids[1].index());
        assert_ne!(again, ids[1]);
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_table_full() {
        let (mut s, _) = boot(SchedPolicy::Fifo, MAX_THREADS - 1);
        assert_eq!(
            s.create_thread("extra", DEFAULT_PRIO, region(), 0, ThreadFlags::empty()),
            Err(KernelError::NoMemory)
        );
    }

    #[test]
    fn test_create_kill_sequences_keep_invariants() {
        // deterministic pseudo-random walk over create/kill/yield/block/wake
        let (mut s, _) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        let q = ThreadQueue::new();
        let mut seed: u32 = 0x1234_5678;
        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let live: Vec<ThreadId> = s
                .threads()
                .filter(|t| !t.is_idle() && t.state != ThreadState::Terminated)
                .map(|t| t.id)
                .collect();
            match (seed >> 16) % 6 {
                0 => {
                    let _ = s.create_thread("w", DEFAULT_PRIO, region(), 0, ThreadFlags::empty());
                }
                1 if !live.is_empty() => {
                    let victim = live[(seed as usize >> 8) % live.len()];
                    s.kill(victim, 0).unwrap();
                }
                2 => {
                    s.yield_now();
                }
                3 => {
                    let _ = s.block_current(Some(q.key()), None);
                }
                4 => {
                    s.notify_one(q.key());
                }
                _ => {
                    let dead: Vec<ThreadId> = s
                        .threads()
                        .filter(|t| t.state == ThreadState::Terminated && Some(t.id) != s.current())
                        .map(|t| t.id)
                        .collect();
                    for d in dead {
                        s.join(d).unwrap();
                    }
                }
            }
            s.schedule();
            s.check_invariants().unwrap();
            assert!(s.current().is_some());
        }
    }

    #[test]
    fn test_fast_clock_accounts_whole_milliseconds() {
        // 4 kHz tick: four ticks per millisecond of slice
        let (mut s, ids) = boot(SchedPolicy::Fifo, 2);
        s.start().unwrap();
        for _ in 1..4 * u32::from(TIME_SLICE) {
            assert!(!s.account_ticks(1, 4000));
        }
        assert_eq!(s.thread(ids[0]).unwrap().cputime, u32::from(TIME_SLICE) - 1);
        assert!(s.account_ticks(1, 4000));
        assert_eq!(s.schedule().unwrap().next, ids[1]);

        // a slow clock charges several milliseconds per tick
        assert!(!s.account_ticks(1, 250));
        assert_eq!(s.thread(ids[1]).unwrap().cputime, 4);
    }

    #[test]
    fn test_edf_runs_earliest_deadline_and_tracks_clock() {
        let mut s = Scheduler::new(SchedPolicy::Edf);
        s.create_idle(region(), 0).unwrap();
        let relaxed = s.create_thread("relaxed", 200, region(), 0, ThreadFlags::empty()).unwrap();
        let urgent = s.create_thread("urgent", 0, region(), 0, ThreadFlags::empty()).unwrap();
        assert_eq!(s.start(), Ok(urgent));

        // re-queued late, the urgent thread is now due after `relaxed`
        s.process_timeouts(500);
        assert!(s.yield_now());
        assert_eq!(s.schedule().unwrap().next, relaxed);
        assert_eq!(s.class.run_list().iter().collect::<Vec<_>>(), vec![urgent]);
        s.check_invariants().unwrap();
    }

    #[test]
    fn test_lottery_policy_keeps_invariants() {
        let (mut s, _) = boot(SchedPolicy::Lottery, 4);
        assert_eq!(s.policy(), SchedPolicy::Lottery);
        s.start().unwrap();
        for _ in 0..200 {
            s.yield_now();
            s.schedule();
            s.check_invariants().unwrap();
        }
        assert!(s.switch_count() > 0);
    }
}
