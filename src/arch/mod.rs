//! # Architecture Abstraction Layer
//!
//! The kernel core only sees the opaque primitives re-exported here:
//! interrupt masking, "am I in an interrupt", pending a context switch,
//! building a thread's first frame, and the power-mode hooks.
//!
//! - `target_arch = "arm"`: the Cortex-M4 port ([`cortex_m4`]).
//! - everything else: the host simulation port ([`host`]), used by the
//!   unit tests.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;
#[cfg(target_arch = "arm")]
use cortex_m4 as port;

#[cfg(not(target_arch = "arm"))]
pub mod host;
#[cfg(not(target_arch = "arm"))]
use host as port;

pub use port::{
    halt, hibernate, in_interrupt, init_stack, irq_disable, irq_enable, irq_enter, irq_exit,
    irqs_enabled, request_switch, set_power_mode, start_first_thread,
};

// ---------------------------------------------------------------------------
// Interrupt state save / restore
// ---------------------------------------------------------------------------

/// Interrupt-enable state captured by [`irq_save_and_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct IrqFlags(bool);

impl IrqFlags {
    /// Whether interrupts were enabled when the flags were saved.
    pub const fn were_enabled(self) -> bool {
        self.0
    }
}

/// Mask interrupts and return the previous enable state.
#[inline]
pub fn irq_save_and_disable() -> IrqFlags {
    let enabled = irqs_enabled();
    irq_disable();
    IrqFlags(enabled)
}

/// Restore the state saved by [`irq_save_and_disable`]. Only re-enables
/// interrupts if they were enabled at save time, so nested users compose.
#[inline]
pub fn irq_restore(flags: IrqFlags) {
    if flags.0 {
        irq_enable();
    }
}

/// Low-power state entered by [`hibernate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    /// Core clock gated, peripherals running. Any interrupt wakes the core.
    Idle,
    /// Deep sleep. Only wake-up capable lines resume execution.
    PowerDown,
}
