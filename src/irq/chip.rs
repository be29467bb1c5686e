//! Interrupt controller description.
//!
//! The chip records which lines are routed through it and carries the
//! hooks run around power-mode transitions.

use core::fmt;

use crate::config::IRQ_VECTORS;
use crate::error::{KResult, KernelError};

/// Power transition hook.
pub type ChipHook = fn(&IrqChip);

#[derive(Clone, Copy)]
pub struct IrqChip {
    name: &'static str,
    lines: u64,
    sleep: Option<ChipHook>,
    resume: Option<ChipHook>,
}

impl IrqChip {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            lines: 0,
            sleep: None,
            resume: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add_irq(&mut self, irq: u8) -> KResult<()> {
        if usize::from(irq) >= IRQ_VECTORS {
            return Err(KernelError::InvalidArgument);
        }
        self.lines |= 1 << irq;
        Ok(())
    }

    pub fn remove_irq(&mut self, irq: u8) {
        if usize::from(irq) < IRQ_VECTORS {
            self.lines &= !(1 << irq);
        }
    }

    pub fn contains(&self, irq: u8) -> bool {
        usize::from(irq) < IRQ_VECTORS && self.lines & (1 << irq) != 0
    }

    /// Lines routed through this chip, ascending.
    pub fn irqs(&self) -> impl Iterator<Item = u8> + '_ {
        (0..IRQ_VECTORS as u8).filter(move |irq| self.contains(*irq))
    }

    pub fn set_sleep(&mut self, hook: ChipHook) {
        self.sleep = Some(hook);
    }

    pub fn set_resume(&mut self, hook: ChipHook) {
        self.resume = Some(hook);
    }

    pub fn sleep(&self) {
        if let Some(hook) = self.sleep {
            hook(self);
        }
    }

    pub fn resume(&self) {
        if let Some(hook) = self.resume {
            hook(self);
        }
    }
}

impl fmt::Debug for IrqChip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqChip")
            .field("name", &self.name)
            .field("lines", &format_args!("{:#x}", self.lines))
            .finish_non_exhaustive()
    }
}
