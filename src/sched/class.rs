//! # Scheduling Classes
//!
//! A scheduling class owns the run list and decides which runnable thread
//! goes next. Every change of run-list membership goes through the active
//! class; the scheduler never splices the list itself.
//!
//! | Class | Run list order | Wait queue order |
//! |-------|----------------|------------------|
//! | [`FifoClass`] | insertion | insertion |
//! | [`PrioClass`] | nice value, FIFO among equals | nice value, FIFO among equals |
//! | [`EdfClass`] | deadline, FIFO among equals | deadline, FIFO among equals |
//! | [`LotteryClass`] | nice value; next thread drawn by ticket | nice value, FIFO among equals |
//!
//! Exactly one class is active per run queue, chosen by [`SchedPolicy`].

use crate::config::MAX_THREADS;
use crate::error::{KResult, KernelError};

use super::list::ThreadList;
use super::thread::{QueueKey, Thread, ThreadId, WaitLink};

/// Policy plug-in interface of the run queue.
pub trait SchedClass {
    /// Append a runnable thread to the run list.
    fn add_thread(&mut self, tid: ThreadId, prio: u8) -> KResult<()>;

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()>;

    /// Thread that should run next, if any is runnable.
    fn next_runnable(&self) -> Option<ThreadId>;

    /// Whether the queued thread `head` (nice value `head_prio`) should
    /// take the CPU from a running thread of nice value `cur_prio`.
    fn preempts(&self, _head: ThreadId, head_prio: u8, cur_prio: u8) -> bool {
        head_prio <= cur_prio
    }

    /// Hook run after every completed switch.
    fn post_schedule(&mut self, _prev: ThreadId, _next: ThreadId) {}

    /// Current system tick, for classes that order by time.
    fn set_clock(&mut self, _now: u64) {}

    /// Link `thread` into the wait queue `key`, assigning its wake order.
    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey);

    fn queue_rm(&mut self, thread: &mut Thread) {
        thread.wait = None;
    }

    fn run_list(&self) -> &ThreadList;

    fn contains(&self, tid: ThreadId) -> bool {
        self.run_list().contains(tid)
    }

    fn nr_running(&self) -> usize {
        self.run_list().len()
    }
}

/// Scheduling policy selected when the kernel is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// First in, first out; priority is ignored for ordering.
    Fifo,
    /// Priority round-robin: lowest nice value first.
    Priority,
    /// Earliest deadline first; the deadline is derived from the nice
    /// value when the thread is queued.
    Edf,
    /// Proportional share: better nice values hold more tickets.
    Lottery,
}

fn insert_at(run: &mut ThreadList, pos: usize, tid: ThreadId) -> KResult<()> {
    if run.contains(tid) {
        return Err(KernelError::InvalidArgument);
    }
    if run.insert(pos, tid) {
        Ok(())
    } else {
        Err(KernelError::NoMemory)
    }
}

fn remove(run: &mut ThreadList, tid: ThreadId) -> KResult<()> {
    if run.remove(tid) {
        Ok(())
    } else {
        Err(KernelError::NoSuchThread)
    }
}

/// Wait link for `key` ranked by `rank`, stamped with the next sequence
/// number.
fn link(seq: &mut u64, key: QueueKey, rank: u64) -> WaitLink {
    let link = WaitLink { key, rank, seq: *seq };
    *seq = seq.wrapping_add(1);
    link
}

// ---------------------------------------------------------------------------
// FIFO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FifoClass {
    run: ThreadList,
    seq: u64,
}

impl FifoClass {
    pub const fn new() -> Self {
        Self {
            run: ThreadList::new(),
            seq: 0,
        }
    }
}

impl SchedClass for FifoClass {
    fn add_thread(&mut self, tid: ThreadId, _prio: u8) -> KResult<()> {
        let len = self.run.len();
        insert_at(&mut self.run, len, tid)
    }

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()> {
        remove(&mut self.run, tid)
    }

    fn next_runnable(&self) -> Option<ThreadId> {
        self.run.first()
    }

    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey) {
        thread.wait = Some(link(&mut self.seq, key, 0));
    }

    fn run_list(&self) -> &ThreadList {
        &self.run
    }
}

// ---------------------------------------------------------------------------
// Priority round-robin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PrioClass {
    run: ThreadList,
    /// Nice value each queued thread was added with, by slot.
    prios: [u8; MAX_THREADS],
    seq: u64,
}

impl PrioClass {
    pub const fn new() -> Self {
        Self {
            run: ThreadList::new(),
            prios: [0; MAX_THREADS],
            seq: 0,
        }
    }
}

impl SchedClass for PrioClass {
    fn add_thread(&mut self, tid: ThreadId, prio: u8) -> KResult<()> {
        if self.run.contains(tid) {
            return Err(KernelError::InvalidArgument);
        }
        self.prios[tid.index()] = prio;
        // after every thread of equal or better priority
        let prios = &self.prios;
        let pos = self.run.position(|t| prios[t.index()] > prio);
        insert_at(&mut self.run, pos, tid)
    }

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()> {
        remove(&mut self.run, tid)
    }

    fn next_runnable(&self) -> Option<ThreadId> {
        self.run.first()
    }

    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey) {
        thread.wait = Some(link(&mut self.seq, key, u64::from(thread.prio)));
    }

    fn run_list(&self) -> &ThreadList {
        &self.run
    }
}

// ---------------------------------------------------------------------------
// Earliest deadline first
// ---------------------------------------------------------------------------

/// Ticks from queueing to the deadline of a thread with nice value `prio`.
pub const fn edf_ratio(prio: u8) -> u64 {
    (13 * prio as u64) / 24 + 10
}

#[derive(Debug, Clone)]
pub struct EdfClass {
    run: ThreadList,
    /// Absolute deadline of each queued thread, by slot.
    deadlines: [u64; MAX_THREADS],
    now: u64,
    seq: u64,
}

impl EdfClass {
    pub const fn new() -> Self {
        Self {
            run: ThreadList::new(),
            deadlines: [0; MAX_THREADS],
            now: 0,
            seq: 0,
        }
    }

    fn deadline(&self, prio: u8) -> u64 {
        self.now.saturating_add(edf_ratio(prio))
    }

    /// Deadline `tid` was queued with.
    pub fn deadline_of(&self, tid: ThreadId) -> Option<u64> {
        self.run.contains(tid).then(|| self.deadlines[tid.index()])
    }
}

impl SchedClass for EdfClass {
    fn add_thread(&mut self, tid: ThreadId, prio: u8) -> KResult<()> {
        if self.run.contains(tid) {
            return Err(KernelError::InvalidArgument);
        }
        let deadline = self.deadline(prio);
        self.deadlines[tid.index()] = deadline;
        let deadlines = &self.deadlines;
        let pos = self.run.position(|t| deadlines[t.index()] > deadline);
        insert_at(&mut self.run, pos, tid)
    }

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()> {
        remove(&mut self.run, tid)
    }

    fn next_runnable(&self) -> Option<ThreadId> {
        self.run.first()
    }

    /// Compares deadlines, the running thread's as if it were queued now.
    fn preempts(&self, head: ThreadId, _head_prio: u8, cur_prio: u8) -> bool {
        self.deadlines[head.index()] <= self.deadline(cur_prio)
    }

    fn set_clock(&mut self, now: u64) {
        self.now = now;
    }

    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey) {
        let rank = self.deadline(thread.prio);
        thread.wait = Some(link(&mut self.seq, key, rank));
    }

    fn run_list(&self) -> &ThreadList {
        &self.run
    }
}

// ---------------------------------------------------------------------------
// Lottery
// ---------------------------------------------------------------------------

/// Tickets held by a thread with nice value `prio`: ten at nice 0, one
/// less per 25 steps, never fewer than one.
pub const fn lottery_tickets(prio: u8) -> u32 {
    if prio >= 250 {
        return 1;
    }
    // round(10 - 0.04 * prio)
    let hundredths = 1000 - 4 * prio as u32;
    let tickets = (hundredths + 50) / 100;
    if tickets == 0 {
        1
    } else {
        tickets
    }
}

const LOTTERY_SEED: u32 = 0x2545_F491;

#[derive(Debug, Clone)]
pub struct LotteryClass {
    run: ThreadList,
    prios: [u8; MAX_THREADS],
    /// xorshift32 state; the current draw. Advanced after every switch.
    draw: u32,
    seq: u64,
}

impl LotteryClass {
    pub const fn new() -> Self {
        Self {
            run: ThreadList::new(),
            prios: [0; MAX_THREADS],
            draw: LOTTERY_SEED,
            seq: 0,
        }
    }

    fn total_tickets(&self) -> u32 {
        self.run.iter().map(|t| lottery_tickets(self.prios[t.index()])).sum()
    }

    fn next_draw(&mut self) {
        let mut x = self.draw;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.draw = x;
    }
}

impl SchedClass for LotteryClass {
    fn add_thread(&mut self, tid: ThreadId, prio: u8) -> KResult<()> {
        if self.run.contains(tid) {
            return Err(KernelError::InvalidArgument);
        }
        self.prios[tid.index()] = prio;
        let prios = &self.prios;
        let pos = self.run.position(|t| prios[t.index()] > prio);
        insert_at(&mut self.run, pos, tid)
    }

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()> {
        remove(&mut self.run, tid)
    }

    /// Owner of the winning ticket of the current draw.
    fn next_runnable(&self) -> Option<ThreadId> {
        if self.run.len() <= 1 {
            return self.run.first();
        }
        let mut ticket = self.draw % self.total_tickets();
        for tid in self.run.iter() {
            let held = lottery_tickets(self.prios[tid.index()]);
            if ticket < held {
                return Some(tid);
            }
            ticket -= held;
        }
        self.run.first()
    }

    /// Any ticket holder may win the next draw.
    fn preempts(&self, _head: ThreadId, _head_prio: u8, _cur_prio: u8) -> bool {
        true
    }

    fn post_schedule(&mut self, _prev: ThreadId, _next: ThreadId) {
        self.next_draw();
    }

    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey) {
        thread.wait = Some(link(&mut self.seq, key, u64::from(thread.prio)));
    }

    fn run_list(&self) -> &ThreadList {
        &self.run
    }
}

// ---------------------------------------------------------------------------
// Active class
// ---------------------------------------------------------------------------

/// The class instance owned by a run queue.
#[derive(Debug, Clone)]
pub enum ActiveClass {
    Fifo(FifoClass),
    Priority(PrioClass),
    Edf(EdfClass),
    Lottery(LotteryClass),
}

impl ActiveClass {
    pub const fn new(policy: SchedPolicy) -> Self {
        match policy {
            SchedPolicy::Fifo => Self::Fifo(FifoClass::new()),
            SchedPolicy::Priority => Self::Priority(PrioClass::new()),
            SchedPolicy::Edf => Self::Edf(EdfClass::new()),
            SchedPolicy::Lottery => Self::Lottery(LotteryClass::new()),
        }
    }

    pub fn policy(&self) -> SchedPolicy {
        match self {
            Self::Fifo(_) => SchedPolicy::Fifo,
            Self::Priority(_) => SchedPolicy::Priority,
            Self::Edf(_) => SchedPolicy::Edf,
            Self::Lottery(_) => SchedPolicy::Lottery,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $class:ident => $call:expr) => {
        match $self {
            ActiveClass::Fifo($class) => $call,
            ActiveClass::Priority($class) => $call,
            ActiveClass::Edf($class) => $call,
            ActiveClass::Lottery($class) => $call,
        }
    };
}

impl SchedClass for ActiveClass {
    fn add_thread(&mut self, tid: ThreadId, prio: u8) -> KResult<()> {
        dispatch!(self, c => c.add_thread(tid, prio))
    }

    fn rm_thread(&mut self, tid: ThreadId) -> KResult<()> {
        dispatch!(self, c => c.rm_thread(tid))
    }

    fn next_runnable(&self) -> Option<ThreadId> {
        dispatch!(self, c => c.next_runnable())
    }

    fn preempts(&self, head: ThreadId, head_prio: u8, cur_prio: u8) -> bool {
        dispatch!(self, c => c.preempts(head, head_prio, cur_prio))
    }

    fn post_schedule(&mut self, prev: ThreadId, next: ThreadId) {
        dispatch!(self, c => c.post_schedule(prev, next))
    }

    fn set_clock(&mut self, now: u64) {
        dispatch!(self, c => c.set_clock(now))
    }

    fn queue_add(&mut self, thread: &mut Thread, key: QueueKey) {
        dispatch!(self, c => c.queue_add(thread, key))
    }

    fn queue_rm(&mut self, thread: &mut Thread) {
        dispatch!(self, c => c.queue_rm(thread))
    }

    fn run_list(&self) -> &ThreadList {
        dispatch!(self, c => c.run_list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::StackRegion;

    fn tid(i: u8) -> ThreadId {
        ThreadId::new(i, 0)
    }

    fn order(class: &impl SchedClass) -> Vec<usize> {
        class.run_list().iter().map(ThreadId::index).collect()
    }

    #[test]
    fn test_fifo_ignores_priority() {
        let mut c = FifoClass::new();
        c.add_thread(tid(0), 200).unwrap();
        c.add_thread(tid(1), 10).unwrap();
        c.add_thread(tid(2), 100).unwrap();
        assert_eq!(order(&c), vec![0, 1, 2]);
        assert_eq!(c.next_runnable(), Some(tid(0)));
    }

    #[test]
    fn test_priority_orders_by_nice_then_fifo() {
        let mut c = PrioClass::new();
        c.add_thread(tid(0), 120).unwrap();
        c.add_thread(tid(1), 10).unwrap();
        c.add_thread(tid(2), 120).unwrap();
        c.add_thread(tid(3), 10).unwrap();
        assert_eq!(order(&c), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut c = ActiveClass::new(SchedPolicy::Fifo);
        c.add_thread(tid(4), 1).unwrap();
        assert_eq!(c.add_thread(tid(4), 1), Err(KernelError::InvalidArgument));
        assert_eq!(c.nr_running(), 1);
        assert_eq!(c.rm_thread(tid(5)), Err(KernelError::NoSuchThread));
    }

    #[test]
    fn test_priority_wait_order() {
        let mut c = PrioClass::new();
        let key = QueueKey::Object(0x40);
        let mut low = Thread::new(tid(0), "low", 200, StackRegion::new(0, 0), 0);
        let mut high = Thread::new(tid(1), "high", 5, StackRegion::new(0, 0), 0);
        c.queue_add(&mut low, key);
        c.queue_add(&mut high, key);
        assert!(high.wait.unwrap().order() < low.wait.unwrap().order());
        c.queue_rm(&mut high);
        assert!(high.wait.is_none());
    }

    #[test]
    fn test_wait_order_is_fifo_across_sequence_wrap() {
        let key = QueueKey::Object(0x80);
        for start in [0x00FF_FFFF, u64::from(u32::MAX)] {
            let mut c = PrioClass::new();
            c.seq = start;
            let mut older = Thread::new(tid(0), "older", 120, StackRegion::new(0, 0), 0);
            let mut newer = Thread::new(tid(1), "newer", 120, StackRegion::new(0, 0), 0);
            c.queue_add(&mut older, key);
            c.queue_add(&mut newer, key);
            assert!(older.wait.unwrap().order() < newer.wait.unwrap().order());

            let mut f = FifoClass::new();
            f.seq = start;
            f.queue_add(&mut older, key);
            f.queue_add(&mut newer, key);
            assert!(older.wait.unwrap().order() < newer.wait.unwrap().order());
        }
    }

    #[test]
    fn test_edf_orders_by_deadline() {
        assert_eq!(edf_ratio(0), 10);
        assert_eq!(edf_ratio(120), 75);
        let mut c = EdfClass::new();
        c.set_clock(100);
        c.add_thread(tid(0), 120).unwrap(); // due at 175
        c.set_clock(150);
        c.add_thread(tid(1), 24).unwrap(); // due at 173
        c.add_thread(tid(2), 120).unwrap(); // due at 225
        c.add_thread(tid(3), 24).unwrap(); // due at 173, after tid(1)
        assert_eq!(order(&c), vec![1, 3, 0, 2]);
        assert_eq!(c.deadline_of(tid(0)), Some(175));
        c.rm_thread(tid(1)).unwrap();
        assert_eq!(c.deadline_of(tid(1)), None);
        assert_eq!(c.next_runnable(), Some(tid(3)));
    }

    #[test]
    fn test_edf_wait_order_uses_deadline() {
        let mut c = EdfClass::new();
        let key = QueueKey::Object(0x40);
        let mut late = Thread::new(tid(0), "late", 100, StackRegion::new(0, 0), 0);
        let mut early = Thread::new(tid(1), "early", 100, StackRegion::new(0, 0), 0);
        c.set_clock(50);
        c.queue_add(&mut late, key);
        c.set_clock(10);
        c.queue_add(&mut early, key);
        assert!(early.wait.unwrap().order() < late.wait.unwrap().order());
    }

    #[test]
    fn test_lottery_tickets() {
        assert_eq!(lottery_tickets(0), 10);
        assert_eq!(lottery_tickets(120), 5);
        assert_eq!(lottery_tickets(240), 1);
        assert_eq!(lottery_tickets(255), 1);
    }

    #[test]
    fn test_lottery_favours_ticket_holders() {
        let mut c = LotteryClass::new();
        c.add_thread(tid(0), 200).unwrap(); // 2 tickets
        assert_eq!(c.next_runnable(), Some(tid(0)));
        c.add_thread(tid(1), 0).unwrap(); // 10 tickets
        assert_eq!(order(&c), vec![1, 0]);

        let mut wins = [0u32; 2];
        for _ in 0..1200 {
            let winner = c.next_runnable().unwrap();
            assert_eq!(c.next_runnable(), Some(winner), "a draw is stable until the switch");
            wins[winner.index()] += 1;
            c.post_schedule(winner, winner);
        }
        assert!(wins[0] > 0 && wins[1] > 0, "{wins:?}");
        assert!(wins[1] > 2 * wins[0], "{wins:?}");
    }
}
