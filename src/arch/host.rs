//! # Host Simulation Port
//!
//! Stands in for the processor on non-ARM targets. Interrupt masking is a
//! per-thread flag, "interrupt context" is a nesting counter maintained by
//! [`irq_enter`]/[`irq_exit`], and a requested context switch is only
//! counted: the test harness plays the role of PendSV by calling
//! `Scheduler::schedule()` itself.
//!
//! The test harness runs on several OS threads, so a critical section also
//! takes a process-wide reentrant lock; `IrqCell` relies on critical
//! sections being mutually exclusive.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::PowerMode;

static CS_OWNER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CS_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static IRQ_NESTING: Cell<u32> = const { Cell::new(0) };
    static SWITCH_REQUESTS: Cell<u32> = const { Cell::new(0) };
    static POWER_MODE: Cell<Option<PowerMode>> = const { Cell::new(None) };
}

// ---------------------------------------------------------------------------
// critical-section implementation
// ---------------------------------------------------------------------------

struct HostCriticalSection;
critical_section::set_impl!(HostCriticalSection);

/// Non-zero token unique to the calling OS thread.
fn thread_token() -> usize {
    CS_DEPTH.with(|d| d as *const Cell<u32> as usize)
}

unsafe impl critical_section::Impl for HostCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let enabled = irqs_enabled();
        irq_disable();
        if CS_DEPTH.with(Cell::get) == 0 {
            let me = thread_token();
            while CS_OWNER
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::thread::yield_now();
            }
        }
        CS_DEPTH.with(|d| d.set(d.get() + 1));
        enabled
    }

    unsafe fn release(enabled: critical_section::RawRestoreState) {
        let depth = CS_DEPTH.with(|d| {
            d.set(d.get() - 1);
            d.get()
        });
        if depth == 0 {
            CS_OWNER.store(0, Ordering::Release);
        }
        if enabled {
            irq_enable();
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupt primitives
// ---------------------------------------------------------------------------

#[inline]
pub fn irq_disable() {
    IRQ_ENABLED.with(|f| f.set(false));
}

#[inline]
pub fn irq_enable() {
    IRQ_ENABLED.with(|f| f.set(true));
}

#[inline]
pub fn irqs_enabled() -> bool {
    IRQ_ENABLED.with(Cell::get)
}

/// True between [`irq_enter`] and the matching [`irq_exit`].
#[inline]
pub fn in_interrupt() -> bool {
    IRQ_NESTING.with(Cell::get) > 0
}

pub fn irq_enter() {
    IRQ_NESTING.with(|n| n.set(n.get() + 1));
}

pub fn irq_exit() {
    IRQ_NESTING.with(|n| n.set(n.get().saturating_sub(1)));
}

/// Record a pended context switch.
pub fn request_switch() {
    SWITCH_REQUESTS.with(|n| n.set(n.get() + 1));
}

/// Number of context switches requested on this thread so far.
pub fn switch_requests() -> u32 {
    SWITCH_REQUESTS.with(Cell::get)
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Host threads never run on their kernel stack; the "initial frame" is
/// just the aligned top of the region.
///
/// # Safety
/// Always safe on the host; `unsafe` to match the hardware port.
pub unsafe fn init_stack(top: usize, _entry: usize, _arg: usize) -> usize {
    top & !0x07
}

/// # Safety
/// Never returns; the host port cannot leave the test harness.
pub unsafe fn start_first_thread(_sp: usize) -> ! {
    panic!("the host port cannot launch kernel threads");
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

pub fn set_power_mode(mode: PowerMode) {
    POWER_MODE.with(|m| m.set(Some(mode)));
}

/// Last mode passed to [`set_power_mode`].
pub fn power_mode() -> Option<PowerMode> {
    POWER_MODE.with(Cell::get)
}

pub fn hibernate() {}

/// Unwinds instead of spinning so tests can observe a kernel panic.
pub fn halt() -> ! {
    irq_disable();
    panic!("kernel halted");
}
