//! Kernel Logging
//!
//! Backend for the `log` facade. Records go to the stdout stream
//! registered through sysctl, stamped with the system clock uptime.
//! Until a stream is registered records are dropped.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicPtr, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sysctl::StreamWriter;

struct KernelLogger {
    kernel: AtomicPtr<Kernel>,
}

impl KernelLogger {
    fn kernel(&self) -> Option<&'static Kernel> {
        // SAFETY: only ever set from a `&'static Kernel` in `init`
        unsafe { self.kernel.load(Ordering::Acquire).as_ref() }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(kernel) = self.kernel() else {
            return;
        };
        let Some(out) = kernel.stdout() else {
            return;
        };
        let uptime_ms = kernel.uptime_ms().unwrap_or(0);
        let _ = format_record(&mut StreamWriter(out), uptime_ms, record);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger {
    kernel: AtomicPtr::new(core::ptr::null_mut()),
};

/// Route `log` records to `kernel`'s stdout.
pub fn init(kernel: &'static Kernel, level: LevelFilter) -> KResult<()> {
    LOGGER
        .kernel
        .store(kernel as *const Kernel as *mut Kernel, Ordering::Release);
    log::set_logger(&LOGGER).map_err(|_| KernelError::AlreadyInitialised)?;
    log::set_max_level(level);
    Ok(())
}

/// `[    secs.mss] LEVEL target: message`
fn format_record(w: &mut impl Write, uptime_ms: u64, record: &Record) -> fmt::Result {
    write!(
        w,
        "[{:>8}.{:03}] {:<5} {}: {}\r\n",
        uptime_ms / 1000,
        uptime_ms % 1000,
        record.level(),
        record.target(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedPolicy;
    use crate::sysctl::tests::Capture;
    use crate::sysctl::SysCtl;
    use crate::time::Clocksource;
    use log::Level;
    use std::string::String;

    #[test]
    fn test_format_record() {
        let mut out = String::new();
        format_record(
            &mut out,
            12_345,
            &Record::builder()
                .level(Level::Warn)
                .target("emberos::irq")
                .args(format_args!("line {} spurious", 7))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[      12.345] WARN  emberos::irq: line 7 spurious\r\n");
    }

    #[test]
    fn test_records_reach_stdout() {
        static CLK: Clocksource = Clocksource::new("sys", 1000);
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(SchedPolicy::Fifo)));
        let out = Capture::leak();
        kernel.sysctl(SysCtl::SetStdout(out)).unwrap();
        kernel.sysctl(SysCtl::SetSysClk(&CLK)).unwrap();
        init(kernel, LevelFilter::Info).unwrap();
        assert_eq!(init(kernel, LevelFilter::Info), Err(KernelError::AlreadyInitialised));

        log::info!(target: "boot", "hello {}", "kernel");
        log::debug!(target: "boot", "filtered");
        let text = out.text();
        assert!(text.contains("INFO  boot: hello kernel\r\n"), "{text}");
        assert!(!text.contains("filtered"));
    }
}
