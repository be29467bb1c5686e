//! # EmberOS Configuration
//!
//! Compile-time constants governing the scheduler, timers and IRQ layer.
//! All limits are fixed at compile time; the kernel never allocates.

/// Maximum number of threads, including the idle thread and the IRQ
/// thread. Bounds the thread table, the run list and every wait queue.
pub const MAX_THREADS: usize = 8;

/// Size in bytes of one region of the stack arena. Must cover the
/// deepest call chain plus the 64-byte initial context frame.
pub const STACK_SIZE: usize = 1024;

/// Stack size for the idle thread. The idle loop only sleeps the core.
pub const IDLE_STACK_SIZE: usize = 256;

/// Round-robin time slice in milliseconds. A running thread is preempted
/// once it has consumed this much CPU and another thread is runnable.
pub const TIME_SLICE: u16 = 5;

/// Nice value given to threads created without an explicit priority.
/// Lower values are more important.
pub const DEFAULT_PRIO: u8 = 120;

/// Nice value of the idle thread. Never placed on the run list.
pub const IDLE_PRIO: u8 = 255;

/// Software timers per clocksource.
pub const MAX_TIMERS: usize = 16;

/// Number of IRQ descriptors. Lines `0..16` mirror the Cortex-M system
/// exceptions so the SysTick vector can be dispatched like any other line.
pub const IRQ_VECTORS: usize = 48;

/// System tick frequency in Hz. One tick per millisecond.
pub const TICK_HZ: u32 = 1000;

/// Core clock frequency in Hz (STM32F4 HSI default).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Frequency of the high-resolution timer source in Hz.
pub const HRTIMER_HZ: u32 = 1_000_000;

/// Default capacity of an [`IpmQueue`](crate::sync::IpmQueue).
pub const IPM_QUEUE_LEN: usize = 8;

/// Timeout value meaning "wait forever".
pub const EVENT_WAIT_INFINITE: u32 = 0;

/// Nice value of the thread running deferred (threaded) IRQ handlers.
pub const IRQ_THREAD_PRIO: u8 = 0;
