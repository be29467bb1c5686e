//! High-resolution timers.
//!
//! A clocksource driven by a fast hardware timer (microsecond ticks by
//! default) whose interrupt runs [`hrtimer_irq`]. Durations are given in
//! nanoseconds and rounded up to whole ticks.

use crate::error::KResult;
use crate::irq::{IrqContext, IrqData, IrqReturn};

use super::clocksource::Clocksource;
use super::timer::{TimerCallback, TimerFlags, TimerId};

pub struct HrTimerSource {
    base: Clocksource,
}

impl HrTimerSource {
    pub const fn new(name: &'static str, freq: u32) -> Self {
        Self {
            base: Clocksource::new(name, freq),
        }
    }

    /// The underlying clocksource.
    pub fn clock(&self) -> &Clocksource {
        &self.base
    }

    /// Nanoseconds per tick.
    pub fn resolution_ns(&self) -> u64 {
        match self.base.freq() {
            0 => 0,
            f => 1_000_000_000 / u64::from(f),
        }
    }

    pub fn ns_to_ticks(&self, ns: u64) -> u64 {
        let freq = u128::from(self.base.freq());
        let ticks = (u128::from(ns) * freq).div_ceil(1_000_000_000);
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        if ns > 0 {
            ticks.max(1)
        } else {
            0
        }
    }

    /// Arm a timer `ns` nanoseconds from now.
    pub fn create_ns(
        &self,
        ns: u64,
        flags: TimerFlags,
        handle: TimerCallback,
        arg: usize,
    ) -> KResult<TimerId> {
        self.base.create_timer_ticks(self.ns_to_ticks(ns), flags, handle, arg)
    }

    pub fn stop(&self, id: TimerId) -> KResult<()> {
        self.base.stop_timer(id)
    }

    /// Interrupt body: one tick of the fast clock.
    pub fn tick(&self) -> IrqReturn {
        self.base.inc();
        self.base.update();
        self.base.process();
        IrqReturn::Handled
    }
}

/// Handler for the line driving the registered hrtimer source.
pub fn hrtimer_irq(_data: &IrqData, ctx: &IrqContext<'_>) -> IrqReturn {
    ctx.hrtimer_tick()
}
