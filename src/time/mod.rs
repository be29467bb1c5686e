//! # Time
//!
//! Clock sources, the software timers expiring against them, and
//! high-resolution timers. The kernel's system clock is whichever
//! [`Clocksource`] was registered with `SysCtl::SetSysClk`; its interrupt
//! also drives the scheduler tick.

mod clocksource;
mod hrtimer;
mod timer;

pub use clocksource::Clocksource;
pub use hrtimer::{hrtimer_irq, HrTimerSource};
pub use timer::{Expired, TimerCallback, TimerFlags, TimerId, TimerList};

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;

impl Kernel {
    /// Busy-wait for `ms` milliseconds of system clock. Does not yield;
    /// use `sleep` to give up the CPU.
    pub fn delay(&self, ms: u32) -> KResult<()> {
        let clk = self.sys_clk().ok_or(KernelError::NotInitialised)?;
        let until = clk.get_tick() + clk.ms_to_ticks(ms);
        while clk.get_tick() < until {
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Milliseconds since the system clock started.
    pub fn uptime_ms(&self) -> KResult<u64> {
        let clk = self.sys_clk().ok_or(KernelError::NotInitialised)?;
        Ok(clk.get_tick() * 1000 / u64::from(clk.freq().max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedPolicy;
    use crate::sysctl::SysCtl;

    #[test]
    fn test_delay_and_uptime() {
        static CLK: Clocksource = Clocksource::new("sys", 1000);
        let kernel = Kernel::new(SchedPolicy::Fifo);
        assert_eq!(kernel.delay(1), Err(KernelError::NotInitialised));
        kernel.sysctl(SysCtl::SetSysClk(&CLK)).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..20 {
                    CLK.inc();
                    std::thread::yield_now();
                }
            });
            kernel.delay(5).unwrap();
        });
        assert!(kernel.uptime_ms().unwrap() >= 5);
        assert_eq!(kernel.delay(0), Ok(()));
    }
}
