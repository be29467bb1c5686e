//! # Kernel
//!
//! The [`Kernel`] context object owns every process-wide singleton: the run
//! queue, the IRQ table, the sysctl registrations and the stack arena.
//! Subsystems receive it by reference. The only true global is the pointer
//! the interrupt vectors use to find the installed kernel.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► KERNEL.init()            ← install, create the idle thread
//!         ├─► KERNEL.sysctl(..)        ← console streams, system clock
//!         ├─► KERNEL.irq_chip_init()   ← interrupt controller
//!         ├─► KERNEL.irq_request(..)   ← system tick line
//!         ├─► KERNEL.thread_create(..) ← application threads (×N)
//!         └─► KERNEL.start()           ← first thread, no return
//! ```
//!
//! ## Blocking Protocol
//!
//! A blocking call changes its object and the calling thread's state in one
//! critical section, leaves it, and pends a context switch. On hardware the
//! switch happens immediately and the call resumes once the thread is woken;
//! it then reads its wake reason (signaled or timed out). Blocking calls
//! from interrupt context are a kernel invariant violation.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use log::{error, info, warn};

use crate::arch::{self, PowerMode};
use crate::config::{DEFAULT_PRIO, EVENT_WAIT_INFINITE};
use crate::error::{KResult, KernelError};
use crate::irq::IrqTable;
use crate::sched::{
    Join, SchedPolicy, Scheduler, Stack, StackArena, StackRegion, ThreadEntry, ThreadFlags,
    ThreadId, ThreadState, WaitOutcome,
};
use crate::sync::IrqCell;
use crate::sysctl::{StreamWriter, SysState};

/// Exit code reported by `join` for a thread removed with `kill`.
pub const EXIT_KILLED: i32 = -1;

/// Smallest stack a thread may be created with.
const MIN_STACK: usize = 128;

// ---------------------------------------------------------------------------
// Installed kernel
// ---------------------------------------------------------------------------

/// Kernel used by the exception handlers and the thread trampoline.
static INSTALLED: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

// ---------------------------------------------------------------------------
// Kernel context
// ---------------------------------------------------------------------------

pub struct Kernel {
    pub(crate) sched: IrqCell<Scheduler>,
    pub(crate) irqs: IrqCell<IrqTable>,
    pub(crate) sys: IrqCell<SysState>,
    stacks: StackArena,
}

impl Kernel {
    pub const fn new(policy: SchedPolicy) -> Self {
        Self {
            sched: IrqCell::new(Scheduler::new(policy)),
            irqs: IrqCell::new(IrqTable::new()),
            sys: IrqCell::new(SysState::new()),
            stacks: StackArena::new(),
        }
    }

    /// Install this kernel for the interrupt vectors and create the idle
    /// thread.
    pub fn init(&'static self) -> KResult<()> {
        let idle = self.stacks.idle_region();
        // SAFETY: the idle region is reserved for the idle thread
        let sp = unsafe {
            arch::init_stack(idle.top(), idle_main as ThreadEntry as usize, self.addr())
        };
        self.sched.lock(|s| s.create_idle(idle, sp))?;
        INSTALLED.store(self as *const Kernel as *mut Kernel, Ordering::Release);
        info!("kernel initialised ({:?} scheduling)", self.policy());
        Ok(())
    }

    /// The kernel installed by [`Kernel::init`].
    pub fn installed() -> Option<&'static Kernel> {
        let ptr = INSTALLED.load(Ordering::Acquire);
        // SAFETY: only ever set from a `&'static Kernel`
        unsafe { ptr.as_ref() }
    }

    pub fn policy(&self) -> SchedPolicy {
        self.sched.lock(|s| s.policy())
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const Kernel as usize
    }

    // -----------------------------------------------------------------------
    // Critical-section plumbing for the blocking objects
    // -----------------------------------------------------------------------

    /// Run `f` on an object and the run queue inside one critical section.
    pub(crate) fn enter<S, R>(
        &self,
        cell: &IrqCell<S>,
        f: impl FnOnce(&mut S, &mut Scheduler) -> R,
    ) -> R {
        critical_section::with(|cs| {
            let mut sched = self.sched.borrow_mut(cs);
            let mut state = cell.borrow_mut(cs);
            f(&mut state, &mut sched)
        })
    }

    /// Non-blocking object operation, safe from any context. Pends a switch
    /// if it woke a thread that should preempt the current one.
    pub(crate) fn with_object<S, R>(
        &self,
        cell: &IrqCell<S>,
        f: impl FnOnce(&mut S, &mut Scheduler) -> R,
    ) -> R {
        let (result, resched) = self.enter(cell, |state, sched| {
            let result = f(state, sched);
            (result, sched.need_resched())
        });
        if resched {
            arch::request_switch();
        }
        result
    }

    /// Acquire-or-block operation on an object, bounded by `ms`
    /// (`EVENT_WAIT_INFINITE` for no bound). Thread context only.
    pub(crate) fn block_on<S>(
        &self,
        op: &str,
        cell: &IrqCell<S>,
        ms: u32,
        f: impl FnOnce(&mut S, &mut Scheduler, Option<u64>) -> KResult<WaitOutcome>,
    ) -> KResult<()> {
        self.assert_thread_context(op);
        let deadline = self.deadline(ms)?;
        match self.enter(cell, |state, sched| f(state, sched, deadline))? {
            WaitOutcome::Acquired => Ok(()),
            WaitOutcome::Blocked => {
                self.switch_out();
                self.sched.lock(|s| s.finish_wait())
            }
        }
    }

    /// Absolute system tick `ms` from now.
    pub(crate) fn deadline(&self, ms: u32) -> KResult<Option<u64>> {
        if ms == EVENT_WAIT_INFINITE {
            return Ok(None);
        }
        let clk = self.sys_clk().ok_or(KernelError::NotInitialised)?;
        Ok(Some(clk.get_tick() + clk.ms_to_ticks(ms)))
    }

    /// Pend a switch away from the current thread. On hardware this returns
    /// once the thread runs again.
    pub(crate) fn switch_out(&self) {
        arch::request_switch();
    }

    pub(crate) fn assert_thread_context(&self, op: &str) {
        if arch::in_interrupt() {
            self.panic(format_args!("{} called from interrupt context", op));
        }
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Create a thread at the default priority.
    pub fn thread_create(
        &self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
    ) -> KResult<ThreadId> {
        self.thread_create_prio(name, entry, arg, stack, DEFAULT_PRIO)
    }

    pub fn thread_create_prio(
        &self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
        prio: u8,
    ) -> KResult<ThreadId> {
        self.spawn(name, entry, arg, stack, prio, ThreadFlags::empty())
    }

    pub(crate) fn spawn(
        &self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
        prio: u8,
        flags: ThreadFlags,
    ) -> KResult<ThreadId> {
        let (region, flags) = match stack {
            Stack::Auto => (self.stacks.alloc()?, flags | ThreadFlags::ARENA_STACK),
            Stack::Static(mem) => (StackRegion::new(mem.as_mut_ptr() as usize, mem.len()), flags),
        };
        if region.len < MIN_STACK {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: the region is not in use until the thread first runs
        let sp = unsafe { arch::init_stack(region.top(), entry as usize, arg) };

        match self.sched.lock(|s| s.create_thread(name, prio, region, sp, flags)) {
            Ok(tid) => {
                info!("created thread {} (prio {})", name, prio);
                self.schedule();
                Ok(tid)
            }
            Err(e) => {
                if flags.contains(ThreadFlags::ARENA_STACK) {
                    let _ = self.stacks.release(region);
                }
                warn!("cannot create thread {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Launch the first thread. Does not return.
    pub fn start(&self) -> ! {
        let first = self.sched.lock(|s| {
            s.start()?;
            s.current_sp().ok_or(KernelError::NotInitialised)
        });
        match first {
            // SAFETY: `sp` was built by `arch::init_stack` for this thread
            Ok(sp) => unsafe { arch::start_first_thread(sp) },
            Err(e) => self.panic(format_args!("cannot start scheduler: {}", e)),
        }
    }

    /// Switch away if the current thread has been flagged for it.
    pub fn schedule(&self) {
        if self.sched.lock(|s| s.need_resched()) {
            arch::request_switch();
        }
    }

    pub fn yield_now(&self) {
        if self.sched.lock(|s| s.yield_now()) {
            arch::request_switch();
        }
    }

    /// Block the calling thread for at least `ms` milliseconds.
    pub fn sleep(&self, ms: u32) -> KResult<()> {
        if ms == 0 {
            self.yield_now();
            return Ok(());
        }
        self.assert_thread_context("sleep");
        let deadline = self.deadline(ms)?;
        self.sched.lock(|s| s.block_current(None, deadline))?;
        self.switch_out();
        Ok(())
    }

    /// Terminate `tid` unconditionally. Locks it holds stay held.
    pub fn kill(&self, tid: ThreadId) -> KResult<()> {
        let (stack, own) = self.sched.lock(|s| {
            let own = s.current() == Some(tid);
            s.kill(tid, EXIT_KILLED).map(|stack| (stack, own))
        })?;
        if let Some(region) = stack {
            self.stacks.release(region)?;
        }
        if own {
            self.switch_out();
        } else {
            self.schedule();
        }
        Ok(())
    }

    /// Terminate the calling thread with `code`.
    pub fn exit(&self, code: i32) -> ! {
        self.assert_thread_context("exit");
        let killed = self.sched.lock(|s| {
            let cur = s.current().ok_or(KernelError::NotInitialised)?;
            s.kill(cur, code)
        });
        if let Err(e) = killed {
            self.panic(format_args!("exit: {}", e));
        }
        self.switch_out();
        // a terminated thread is never resumed
        arch::halt()
    }

    /// Wait for `tid` to terminate and return its exit code. Reclaims the
    /// thread's slot.
    pub fn join(&self, tid: ThreadId) -> KResult<i32> {
        loop {
            self.assert_thread_context("join");
            match self.sched.lock(|s| s.join(tid))? {
                Join::Exited(code) => return Ok(code),
                Join::Blocked => self.switch_out(),
            }
        }
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.sched.lock(|s| s.current())
    }

    pub fn thread_state(&self, tid: ThreadId) -> KResult<ThreadState> {
        self.sched.lock(|s| s.thread_state(tid))
    }

    pub fn set_prio(&self, tid: ThreadId, prio: u8) -> KResult<()> {
        self.sched.lock(|s| s.set_prio(tid, prio))?;
        self.schedule();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Port entry points
    // -----------------------------------------------------------------------

    /// PendSV body: store `sp` for the outgoing thread, pick the next one
    /// and return its stack pointer.
    pub fn context_switch(&self, sp: usize) -> usize {
        let (next_sp, released) = self.sched.lock(|s| {
            s.save_sp(sp);
            s.schedule();
            (s.current_sp().unwrap_or(sp), s.take_released_stack())
        });
        if let Some(region) = released {
            let _ = self.stacks.release(region);
        }
        next_sp
    }

    /// System tick: advance the system clock, fire its timers, expire
    /// bounded waits and account the slice of the current thread.
    pub fn tick(&self) {
        let clock = self.sys_clk().map(|clk| {
            clk.inc();
            let elapsed = clk.update();
            clk.process();
            (clk.get_tick(), elapsed, clk.freq())
        });
        let resched = self.sched.lock(|s| match clock {
            Some((now, elapsed, hz)) => {
                s.process_timeouts(now);
                s.account_ticks(elapsed, hz)
            }
            None => s.clock_tick(1),
        });
        if resched {
            arch::request_switch();
        }
    }

    // -----------------------------------------------------------------------
    // Panic
    // -----------------------------------------------------------------------

    /// Report an unrecoverable invariant violation and halt with
    /// interrupts masked.
    pub fn panic(&self, args: fmt::Arguments<'_>) -> ! {
        error!("kernel panic: {}", args);
        if let Some(err) = self.stderr() {
            let mut out = StreamWriter(err);
            let _ = fmt::Write::write_fmt(&mut out, format_args!("KERNEL PANIC: {}\r\n", args));
        }
        arch::halt()
    }
}

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

/// First code every thread runs. Returning from the entry function exits
/// the thread with code 0.
pub(crate) extern "C" fn thread_trampoline(entry: usize, arg: usize) -> ! {
    // SAFETY: `entry` was produced from a `ThreadEntry` by `Kernel::spawn`
    let entry = unsafe { core::mem::transmute::<usize, ThreadEntry>(entry) };
    entry(arg);
    match Kernel::installed() {
        Some(kernel) => kernel.exit(0),
        None => arch::halt(),
    }
}

fn idle_main(arg: usize) {
    // SAFETY: `arg` is the address of the 'static kernel passed by `init`
    let kernel = unsafe { &*(arg as *const Kernel) };
    loop {
        kernel.schedule();
        arch::set_power_mode(PowerMode::Idle);
        arch::hibernate();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sysctl::SysCtl;
    use crate::time::Clocksource;

    pub(crate) fn noop(_: usize) {}

    /// A leaked, initialised kernel with `n` started threads.
    pub(crate) fn booted(policy: SchedPolicy, n: usize) -> (&'static Kernel, Vec<ThreadId>) {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(policy)));
        kernel.init().unwrap();
        let ids = (0..n)
            .map(|_| kernel.thread_create("worker", noop, 0, Stack::Auto).unwrap())
            .collect();
        kernel.sched.lock(|s| s.start()).unwrap();
        (kernel, ids)
    }

    #[test]
    fn test_init_creates_idle_once() {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(SchedPolicy::Fifo)));
        kernel.init().unwrap();
        assert_eq!(kernel.init(), Err(KernelError::AlreadyInitialised));
        assert_eq!(kernel.sched.lock(|s| s.nr_threads()), 1);
    }

    #[test]
    fn test_thread_create_uses_arena() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 3);
        assert_eq!(kernel.stacks.in_use(), 3);
        assert_eq!(kernel.current(), Some(ids[0]));
        assert_eq!(kernel.thread_state(ids[1]), Ok(ThreadState::Runnable));
    }

    #[test]
    fn test_static_stack_must_fit_a_frame() {
        let kernel = Kernel::new(SchedPolicy::Fifo);
        let small: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
        assert_eq!(
            kernel.thread_create("tiny", noop, 0, Stack::Static(small)),
            Err(KernelError::InvalidArgument)
        );
        let ok: &'static mut [u8] = Box::leak(Box::new([0u8; 512]));
        assert!(kernel.thread_create("fits", noop, 0, Stack::Static(ok)).is_ok());
        assert_eq!(kernel.stacks.in_use(), 0);
    }

    #[test]
    fn test_kill_releases_arena_stack() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        kernel.kill(ids[1]).unwrap();
        assert_eq!(kernel.stacks.in_use(), 1);
        assert_eq!(kernel.thread_state(ids[1]), Ok(ThreadState::Terminated));

        // killing the current thread frees its stack at the switch
        kernel.kill(ids[0]).unwrap();
        assert_eq!(kernel.stacks.in_use(), 1);
        kernel.context_switch(0);
        assert_eq!(kernel.stacks.in_use(), 0);
        assert_eq!(kernel.current(), kernel.sched.lock(|s| s.idle()));
    }

    #[test]
    fn test_join_returns_kill_code() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        kernel.kill(ids[1]).unwrap();
        assert_eq!(kernel.join(ids[1]), Ok(EXIT_KILLED));
        assert_eq!(kernel.join(ids[1]), Err(KernelError::NoSuchThread));
    }

    #[test]
    fn test_context_switch_saves_and_restores_sp() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        let next_sp = kernel.sched.lock(|s| s.thread(ids[1]).unwrap().saved_sp);
        kernel.yield_now();
        assert_eq!(kernel.context_switch(0x2000_1234), next_sp);
        assert_eq!(kernel.sched.lock(|s| s.thread(ids[0]).unwrap().saved_sp), 0x2000_1234);
        assert_eq!(kernel.current(), Some(ids[1]));
    }

    #[test]
    fn test_sleep_needs_system_clock() {
        let (kernel, _) = booted(SchedPolicy::Fifo, 1);
        assert_eq!(kernel.sleep(10), Err(KernelError::NotInitialised));
    }

    #[test]
    fn test_tick_preempts_after_slice() {
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        let before = arch::host::switch_requests();
        for _ in 0..crate::config::TIME_SLICE {
            kernel.tick();
        }
        assert_eq!(arch::host::switch_requests(), before + 1);
        kernel.context_switch(0);
        assert_eq!(kernel.current(), Some(ids[1]));
    }

    #[test]
    fn test_fast_system_clock_charges_real_milliseconds() {
        static CLK: Clocksource = Clocksource::new("fast", 4000);
        let (kernel, ids) = booted(SchedPolicy::Fifo, 2);
        kernel.sysctl(SysCtl::SetSysClk(&CLK)).unwrap();
        let before = arch::host::switch_requests();
        for _ in 1..4 * crate::config::TIME_SLICE {
            kernel.tick();
        }
        assert_eq!(arch::host::switch_requests(), before);
        kernel.tick();
        assert_eq!(arch::host::switch_requests(), before + 1);
        kernel.context_switch(0);
        assert_eq!(kernel.current(), Some(ids[1]));
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn test_blocking_from_interrupt_panics() {
        let (kernel, _) = booted(SchedPolicy::Fifo, 1);
        arch::irq_enter();
        let _ = kernel.sleep(5);
    }
}
