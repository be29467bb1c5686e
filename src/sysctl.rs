//! # System Control
//!
//! Registration of the platform pieces the kernel does not own: console
//! streams and the two clock sources. Drivers hand them over once during
//! bring-up; the kernel only keeps `'static` references.

use core::fmt;

use log::info;

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::time::{Clocksource, HrTimerSource};

/// A byte stream used as a console.
pub trait Stream: Sync {
    fn write_str(&self, s: &str);

    /// Next received byte, if any.
    fn read_byte(&self) -> Option<u8> {
        None
    }
}

/// Adapter to use a [`Stream`] with `write!`.
pub struct StreamWriter<'a>(pub &'a dyn Stream);

impl fmt::Write for StreamWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// A sysctl request.
pub enum SysCtl {
    SetStdout(&'static dyn Stream),
    SetStderr(&'static dyn Stream),
    SetStdin(&'static dyn Stream),
    /// The clock driven by the system tick.
    SetSysClk(&'static Clocksource),
    /// The high-resolution timer source.
    SetHrClk(&'static HrTimerSource),
}

#[derive(Clone, Copy)]
pub(crate) struct SysState {
    stdout: Option<&'static dyn Stream>,
    stderr: Option<&'static dyn Stream>,
    stdin: Option<&'static dyn Stream>,
    sys_clk: Option<&'static Clocksource>,
    hr_clk: Option<&'static HrTimerSource>,
}

impl SysState {
    pub(crate) const fn new() -> Self {
        Self {
            stdout: None,
            stderr: None,
            stdin: None,
            sys_clk: None,
            hr_clk: None,
        }
    }
}

impl Kernel {
    /// Apply a sysctl request. A later registration replaces an earlier
    /// one.
    pub fn sysctl(&self, req: SysCtl) -> KResult<()> {
        match req {
            SysCtl::SetStdout(s) => self.sys.lock(|sys| sys.stdout = Some(s)),
            SysCtl::SetStderr(s) => self.sys.lock(|sys| sys.stderr = Some(s)),
            SysCtl::SetStdin(s) => self.sys.lock(|sys| sys.stdin = Some(s)),
            SysCtl::SetSysClk(clk) => {
                if clk.freq() == 0 {
                    return Err(KernelError::InvalidArgument);
                }
                self.sys.lock(|sys| sys.sys_clk = Some(clk));
                info!("system clock {} at {} Hz", clk.name(), clk.freq());
            }
            SysCtl::SetHrClk(hr) => {
                if hr.clock().freq() == 0 {
                    return Err(KernelError::InvalidArgument);
                }
                self.sys.lock(|sys| sys.hr_clk = Some(hr));
                info!("hrtimer {} at {} Hz", hr.clock().name(), hr.clock().freq());
            }
        }
        Ok(())
    }

    pub fn stdout(&self) -> Option<&'static dyn Stream> {
        self.sys.lock(|sys| sys.stdout)
    }

    pub fn stderr(&self) -> Option<&'static dyn Stream> {
        self.sys.lock(|sys| sys.stderr)
    }

    pub fn stdin(&self) -> Option<&'static dyn Stream> {
        self.sys.lock(|sys| sys.stdin)
    }

    pub fn sys_clk(&self) -> Option<&'static Clocksource> {
        self.sys.lock(|sys| sys.sys_clk)
    }

    pub fn hr_clk(&self) -> Option<&'static HrTimerSource> {
        self.sys.lock(|sys| sys.hr_clk)
    }

    /// Write formatted text to the registered stdout, if any.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        if let Some(out) = self.stdout() {
            let _ = fmt::Write::write_fmt(&mut StreamWriter(out), args);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sched::SchedPolicy;
    use std::string::String;
    use std::sync::Mutex;

    /// Stream capturing everything written to it.
    pub(crate) struct Capture(pub Mutex<String>);

    impl Capture {
        pub(crate) fn leak() -> &'static Capture {
            Box::leak(Box::new(Capture(Mutex::new(String::new()))))
        }

        pub(crate) fn text(&self) -> String {
            self.0.lock().unwrap().clone()
        }
    }

    impl Stream for Capture {
        fn write_str(&self, s: &str) {
            self.0.lock().unwrap().push_str(s);
        }
    }

    #[test]
    fn test_streams_register_and_replace() {
        let kernel = Kernel::new(SchedPolicy::Fifo);
        assert!(kernel.stdout().is_none());
        kernel.print(format_args!("dropped"));

        let first = Capture::leak();
        let second = Capture::leak();
        kernel.sysctl(SysCtl::SetStdout(first)).unwrap();
        kernel.print(format_args!("a={}", 1));
        kernel.sysctl(SysCtl::SetStdout(second)).unwrap();
        kernel.print(format_args!("b"));
        assert_eq!(first.text(), "a=1");
        assert_eq!(second.text(), "b");
        assert!(kernel.stderr().is_none());
    }

    #[test]
    fn test_clock_requires_frequency() {
        static DEAD: Clocksource = Clocksource::new("dead", 0);
        static SYS: Clocksource = Clocksource::new("systick", 1000);
        let kernel = Kernel::new(SchedPolicy::Fifo);
        assert_eq!(kernel.sysctl(SysCtl::SetSysClk(&DEAD)), Err(KernelError::InvalidArgument));
        assert!(kernel.sys_clk().is_none());
        kernel.sysctl(SysCtl::SetSysClk(&SYS)).unwrap();
        assert_eq!(kernel.sys_clk().map(|c| c.name()), Some("systick"));
    }
}
