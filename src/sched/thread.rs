//! # Thread Control Block
//!
//! A thread is one preemptible execution context: a saved stack pointer,
//! a nice value, a state, and while blocked, a link naming the queue it
//! waits on.
//!
//! ## Queue Membership
//!
//! A thread is in exactly one place at a time:
//! - `Runnable`: on the scheduling class's run list
//! - `Running`: the run queue's current thread (not on the run list)
//! - `Blocked`: on one thread queue (`wait` is `Some`), or sleeping
//!   (`wait` is `None`, `wake_at` is set)
//!
//! Wait queues are intrusive: a queue owns no storage, its members are the
//! blocked threads whose [`WaitLink`] carries the queue's key.

use bitflags::bitflags;

use crate::config::TIME_SLICE;

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///   ┌─────────┐  add_thread  ┌──────────┐   schedule()   ┌─────────┐
///   │ Created │ ───────────► │ Runnable │ ─────────────► │ Running │
///   └─────────┘              └──────────┘ ◄───────────── └─────────┘
///                                 ▲          preempted      │    │
///                                 │ wake                    │    │ kill/exit
///                            ┌─────────┐       wait         │    ▼
///                            │ Blocked │ ◄──────────────────┘ ┌────────────┐
///                            └─────────┘                      │ Terminated │
///                                                             └────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Runnable,
    Running,
    Blocked,
    /// Absorbing. The slot stays reserved until `join` reaps it.
    Terminated,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Switch away at the next scheduling point.
        const NEED_RESCHED = 1 << 0;
        /// The idle thread. Never on the run list, never blocks.
        const IDLE = 1 << 1;
        /// Stack region belongs to the kernel arena.
        const ARENA_STACK = 1 << 2;
        /// Dedicated threaded-IRQ handler thread.
        const IRQ_THREAD = 1 << 3;
    }
}

/// Why a blocked thread became runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    None,
    Signaled,
    TimedOut,
}

/// Thread body. Returning from it terminates the thread with exit code 0.
pub type ThreadEntry = fn(usize);

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque handle to a thread. The generation changes every time a slot is
/// reused, so a handle to a reaped thread is detected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    index: u8,
    generation: u8,
}

impl ThreadId {
    pub(crate) const fn new(index: u8, generation: u8) -> Self {
        Self { index, generation }
    }

    /// Slot in the thread table.
    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u8 {
        self.generation
    }
}

/// Identity of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKey {
    /// A [`ThreadQueue`](crate::sched::ThreadQueue), by address.
    Object(usize),
    /// Threads joining the thread in the given slot.
    Join(u8),
}

/// Position of a blocked thread in a wait queue: lowest `rank` first,
/// then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitLink {
    pub key: QueueKey,
    /// Class-defined rank (nice value, deadline). Zero for FIFO.
    pub rank: u64,
    /// Insertion sequence number.
    pub seq: u64,
}

impl WaitLink {
    /// Sort key; the smaller one is woken first.
    pub fn order(&self) -> (u64, u64) {
        (self.rank, self.seq)
    }
}

/// A contiguous stack region, `base..base + len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub len: usize,
}

impl StackRegion {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    pub const fn top(&self) -> usize {
        self.base + self.len
    }
}

// ---------------------------------------------------------------------------
// Thread control block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    /// Nice value. Lower is more important.
    pub prio: u8,
    pub flags: ThreadFlags,
    pub stack: StackRegion,
    /// Stack pointer saved at the last switch away from this thread.
    pub saved_sp: usize,
    pub wait: Option<WaitLink>,
    pub wake: WakeReason,
    /// Absolute system tick at which a bounded wait or sleep expires.
    pub wake_at: Option<u64>,
    /// Milliseconds left of the current round-robin slice.
    pub slice: u16,
    /// Milliseconds of CPU consumed.
    pub cputime: u32,
    pub exit_code: i32,
}

impl Thread {
    pub fn new(id: ThreadId, name: &'static str, prio: u8, stack: StackRegion, sp: usize) -> Self {
        Self {
            id,
            name,
            state: ThreadState::Created,
            prio,
            flags: ThreadFlags::empty(),
            stack,
            saved_sp: sp,
            wait: None,
            wake: WakeReason::None,
            wake_at: None,
            slice: TIME_SLICE,
            cputime: 0,
            exit_code: 0,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    /// True if blocked on the queue identified by `key`.
    #[inline]
    pub fn waits_on(&self, key: QueueKey) -> bool {
        self.state == ThreadState::Blocked && self.wait.is_some_and(|w| w.key == key)
    }
}
