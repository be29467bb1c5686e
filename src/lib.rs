//! # EmberOS
//!
//! A small-footprint preemptive kernel for single-core microcontrollers
//! without an MMU: thread scheduler, interrupt-safe locking, blocking
//! synchronization objects, IRQ dispatch with threaded handlers, and
//! clock-driven timers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Application threads                     │
//! ├──────────────────────────────────────────────────────────┤
//! │              Kernel context object (kernel.rs)           │
//! │   init · thread_create · start · sleep · kill · join     │
//! ├────────────┬──────────────┬──────────────┬───────────────┤
//! │ Scheduler  │ Sync         │ IRQ          │ Time          │
//! │ sched/     │ sync/        │ irq/         │ time/         │
//! │ ─ classes  │ ─ spinlock   │ ─ chip       │ ─ clocksource │
//! │ ─ threads  │ ─ mutex      │ ─ dispatch   │ ─ timers      │
//! │ ─ stacks   │ ─ semaphore  │ ─ IRQ thread │ ─ hrtimer     │
//! │            │ ─ condition  │              │               │
//! │            │ ─ event, ipm │              │               │
//! ├────────────┴──────────────┴──────────────┴───────────────┤
//! │         sysctl (streams, clocks) · logger (log)          │
//! ├──────────────────────────────────────────────────────────┤
//! │   Arch port: cortex_m4 (PendSV, SysTick)  |  host (sim)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Control Flow
//!
//! hardware tick → `irq_handle` → clocksource update → timer expiry →
//! wait timeouts → scheduler tick → PendSV → `schedule()` → next thread.
//!
//! ## Memory Model
//!
//! - **No heap**: every table is fixed-size and statically allocated
//! - **Thread stacks**: an arena of `MAX_THREADS` regions, or a caller
//!   provided `&'static mut [u8]`
//! - **Shared state**: kernel structures touched from interrupts live in
//!   [`IrqCell`](sync::IrqCell)s, reachable only inside a critical section
//!
//! ## Host Port
//!
//! On non-ARM targets the arch layer is a simulation and the crate builds
//! with `std`, so the kernel state machines are unit tested on the host.
//! Context switches are stepped by calling
//! [`Kernel::context_switch`](kernel::Kernel::context_switch) the way the
//! PendSV handler would.

#![cfg_attr(target_arch = "arm", no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod irq;
pub mod kernel;
pub mod logger;
pub mod sched;
pub mod sync;
pub mod sysctl;
pub mod time;
