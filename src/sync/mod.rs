//! # Synchronization Primitives
//!
//! ## Lock Discipline
//!
//! | Primitive        | Interrupt context | Blocks |
//! |------------------|-------------------|--------|
//! | [`IrqCell`]      | yes               | no     |
//! | [`SpinLock`]     | yes               | no (spins, interrupts masked) |
//! | [`Mutex`]        | no                | yes    |
//! | [`Semaphore`]    | `signal` only     | `wait` |
//! | [`Condition`]    | no                | yes    |
//! | [`EventQueue`]   | `notify` only     | `wait` |
//! | [`IpmQueue`]     | `post` only       | `get`  |
//!
//! Interrupt handlers reach the non-blocking halves through
//! [`IrqContext`](crate::irq::IrqContext). A blocking call made while
//! servicing an interrupt panics the kernel.

mod cell;
mod condition;
pub(crate) mod event;
mod ipm;
mod mutex;
mod semaphore;
mod spinlock;

pub use cell::IrqCell;
pub use condition::Condition;
pub use event::EventQueue;
pub use ipm::IpmQueue;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinGuard, SpinLock};

/// Execute a closure with interrupts masked.
///
/// For one-off accesses to several [`IrqCell`]s at once; keep the body
/// short, the whole closure runs with interrupts disabled.
#[inline]
pub fn interrupt_free<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
