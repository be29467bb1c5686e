//! # EmberOS Example Firmware
//!
//! Brings the kernel up on an STM32F4 and runs a small sampling pipeline
//! exercising the synchronization primitives:
//!
//! | Thread     | Prio | Behavior |
//! |------------|------|----------|
//! | `sampler`  | 100  | Posts a sample every 10 ms, signals `READY` |
//! | `filter`   | 110  | Waits on `READY`, takes the sample, folds it into `TOTAL` |
//! | `reporter` | 150  | Waits on `REPORT` (1 s bound), logs the running total |
//!
//! Log output goes to ITM stimulus port 0.

#![cfg_attr(target_arch = "arm", no_std, no_main)]

#[cfg(target_arch = "arm")]
mod firmware {
    use cortex_m::peripheral::ITM;
    use cortex_m_rt::entry;
    use log::{info, warn, LevelFilter};
    use panic_halt as _;

    use emberos::arch::cortex_m4::{self, SYSTICK_IRQ};
    use emberos::config::TICK_HZ;
    use emberos::error::KResult;
    use emberos::irq::{system_tick_irq, LineFlags};
    use emberos::kernel::Kernel;
    use emberos::logger;
    use emberos::sched::{SchedPolicy, Stack};
    use emberos::sync::{interrupt_free, Condition, IpmQueue, Mutex, Semaphore};
    use emberos::sysctl::{Stream, SysCtl};
    use emberos::time::Clocksource;

    static KERNEL: Kernel = Kernel::new(SchedPolicy::Priority);
    static SYS_CLK: Clocksource = Clocksource::new("systick", TICK_HZ);
    static CONSOLE: ItmConsole = ItmConsole;

    static SAMPLES: IpmQueue<u32> = IpmQueue::new();
    static READY: Semaphore = Semaphore::new(0);
    static TOTAL: Mutex<u64> = Mutex::new(0);
    static REPORT: Condition = Condition::new();

    struct ItmConsole;

    impl Stream for ItmConsole {
        fn write_str(&self, s: &str) {
            interrupt_free(|_| {
                // SAFETY: stimulus port 0 is only written here, with
                // interrupts masked
                let stim = unsafe { &mut (*ITM::PTR).stim[0] };
                cortex_m::itm::write_str(stim, s);
            });
        }
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    fn sampler(_: usize) {
        let mut sample: u32 = 0;
        loop {
            sample = sample.wrapping_add(7);
            match SAMPLES.post(&KERNEL, sample) {
                Ok(()) => READY.signal(&KERNEL),
                Err(e) => warn!("sample dropped: {}", e),
            }
            let _ = KERNEL.sleep(10);
        }
    }

    fn filter(_: usize) {
        let mut seen: u32 = 0;
        loop {
            READY.wait(&KERNEL);
            let Ok(sample) = SAMPLES.try_get() else {
                continue;
            };
            *TOTAL.lock(&KERNEL) += u64::from(sample);
            seen += 1;
            if seen % 100 == 0 {
                REPORT.lock(&KERNEL);
                REPORT.signal(&KERNEL);
                let _ = REPORT.unlock(&KERNEL);
            }
        }
    }

    fn reporter(_: usize) {
        loop {
            REPORT.lock(&KERNEL);
            let woke = REPORT.wait_for(&KERNEL, 1000);
            let _ = REPORT.unlock(&KERNEL);
            let total = *TOTAL.lock(&KERNEL);
            match woke {
                Ok(()) => info!("total {}", total),
                Err(e) => warn!("no report ({}), total {}", e, total),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    fn boot() -> KResult<()> {
        KERNEL.init()?;
        KERNEL.sysctl(SysCtl::SetStdout(&CONSOLE))?;
        KERNEL.sysctl(SysCtl::SetStderr(&CONSOLE))?;
        KERNEL.sysctl(SysCtl::SetSysClk(&SYS_CLK))?;
        logger::init(&KERNEL, LevelFilter::Info)?;

        KERNEL.irq_chip_init("nvic")?;
        KERNEL.irq_request(SYSTICK_IRQ, system_tick_irq, LineFlags::empty(), 0)?;

        KERNEL.thread_create_prio("sampler", sampler, 0, Stack::Auto, 100)?;
        KERNEL.thread_create_prio("filter", filter, 0, Stack::Auto, 110)?;
        KERNEL.thread_create_prio("reporter", reporter, 0, Stack::Auto, 150)?;
        Ok(())
    }

    #[entry]
    fn main() -> ! {
        let Some(mut cp) = cortex_m::Peripherals::take() else {
            cortex_m4::halt()
        };
        if let Err(e) = boot() {
            KERNEL.panic(format_args!("boot failed: {}", e));
        }
        info!("starting scheduler");
        cortex_m4::set_interrupt_priorities();
        cortex_m4::configure_systick(&mut cp.SYST);
        KERNEL.start()
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {
    eprintln!(
        "emberos: the firmware image only builds for thumbv7em targets; \
         run `cargo test` for the host port"
    );
}
