//! # IRQ Subsystem
//!
//! Per-line descriptors, dispatch from the interrupt vectors, and the
//! deferral of handler work to a dedicated IRQ thread.
//!
//! ## Dispatch
//!
//! ```text
//! vector ──► Kernel::irq_handle(irq)
//!              ├─ no descriptor / line disabled ─► nothing
//!              ├─ THREADED line ─► pending += 1 ─► notify IRQ thread
//!              └─ hard handler(data, ctx)
//!                    ├─ None / Handled
//!                    └─ WakeOwner ─► pending += 1 ─► notify IRQ thread
//!
//! IRQ thread: wait on inbox ─► run thread_fn once per pending count
//! ```
//!
//! The IRQ thread is created on the first threaded request, at
//! `IRQ_THREAD_PRIO`. Interrupt context only ever wakes it through the
//! interrupt-safe notify path.

mod chip;

use core::fmt;

use bitflags::bitflags;
use log::{debug, info, trace};

use crate::arch::{self, PowerMode};
use crate::config::{EVENT_WAIT_INFINITE, IRQ_THREAD_PRIO, IRQ_VECTORS};
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::{Stack, ThreadFlags, ThreadId, ThreadQueue};
use crate::sync::event::{self, Latch};
use crate::sync::{EventQueue, IpmQueue, Semaphore};

pub use chip::{ChipHook, IrqChip};

bitflags! {
    /// Line configuration and state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u8 {
        const ENABLED  = 1 << 0;
        const RISING   = 1 << 1;
        const FALLING  = 1 << 2;
        /// The handler runs in the IRQ thread, never in interrupt context.
        const THREADED = 1 << 3;
        /// The line may resume the core from `PowerMode::PowerDown`.
        const WAKE_UP  = 1 << 4;
    }
}

/// Result of an IRQ handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not for this handler. Not an error.
    None,
    Handled,
    /// Run the line's thread function in the IRQ thread.
    WakeOwner,
}

pub type IrqHandler = fn(&IrqData, &IrqContext<'_>) -> IrqReturn;

// ---------------------------------------------------------------------------
// Line descriptor
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct IrqData {
    irq: u8,
    flags: LineFlags,
    handler: Option<IrqHandler>,
    thread_fn: Option<IrqHandler>,
    private: usize,
    count: u32,
    pending: u16,
}

impl IrqData {
    fn new(
        irq: u8,
        handler: Option<IrqHandler>,
        thread_fn: Option<IrqHandler>,
        flags: LineFlags,
        private: usize,
    ) -> Self {
        Self {
            irq,
            flags,
            handler,
            thread_fn,
            private,
            count: 0,
            pending: 0,
        }
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    pub fn flags(&self) -> LineFlags {
        self.flags
    }

    /// Driver data given at registration.
    pub fn private(&self) -> usize {
        self.private
    }

    /// Handled interrupts so far, hard and deferred.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Deferred runs not yet executed by the IRQ thread.
    pub fn pending(&self) -> u16 {
        self.pending
    }

    /// Function the IRQ thread runs for this line.
    fn deferred_fn(&self) -> Option<IrqHandler> {
        self.thread_fn.or(self.handler)
    }
}

impl fmt::Debug for IrqData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqData")
            .field("irq", &self.irq)
            .field("flags", &self.flags)
            .field("private", &self.private)
            .field("count", &self.count)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

/// What `irq_handle` must do for a line.
enum Dispatch {
    Ignored,
    Hard(IrqData, IrqHandler),
    Deferred,
}

pub(crate) struct IrqTable {
    lines: [Option<IrqData>; IRQ_VECTORS],
    chip: Option<IrqChip>,
    /// Wakes the IRQ thread.
    inbox: ThreadQueue,
    thread: Option<ThreadId>,
}

impl IrqTable {
    pub(crate) const fn new() -> Self {
        Self {
            lines: [None; IRQ_VECTORS],
            chip: None,
            inbox: ThreadQueue::new(),
            thread: None,
        }
    }

    pub(crate) fn chip(&self) -> Option<IrqChip> {
        self.chip
    }

    fn chip_mut(&mut self) -> KResult<&mut IrqChip> {
        self.chip.as_mut().ok_or(KernelError::NotInitialised)
    }

    fn line(&self, irq: u8) -> KResult<&IrqData> {
        self.lines
            .get(usize::from(irq))
            .and_then(Option::as_ref)
            .ok_or(KernelError::InvalidArgument)
    }

    fn line_mut(&mut self, irq: u8) -> KResult<&mut IrqData> {
        self.lines
            .get_mut(usize::from(irq))
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidArgument)
    }

    /// Install a descriptor for `irq`, enabled, and route it through the
    /// chip.
    fn request(&mut self, data: IrqData) -> KResult<()> {
        let chip = self.chip.as_mut().ok_or(KernelError::NotInitialised)?;
        let slot = self
            .lines
            .get_mut(usize::from(data.irq))
            .ok_or(KernelError::InvalidArgument)?;
        if slot.is_some() {
            return Err(KernelError::AlreadyInitialised);
        }
        chip.add_irq(data.irq)?;
        let mut data = data;
        data.flags.insert(LineFlags::ENABLED);
        *slot = Some(data);
        Ok(())
    }

    fn begin(&mut self, irq: u8) -> Dispatch {
        let Ok(line) = self.line_mut(irq) else {
            return Dispatch::Ignored;
        };
        if !line.flags.contains(LineFlags::ENABLED) {
            return Dispatch::Ignored;
        }
        if line.flags.contains(LineFlags::THREADED) {
            line.pending = line.pending.saturating_add(1);
            return Dispatch::Deferred;
        }
        match line.handler {
            Some(handler) => Dispatch::Hard(*line, handler),
            None => Dispatch::Ignored,
        }
    }

    /// Account a hard handler run; `IrqReturn::None` is not counted.
    /// Returns `true` if the IRQ thread must be woken.
    fn finish(&mut self, irq: u8, ret: IrqReturn) -> bool {
        let Ok(line) = self.line_mut(irq) else {
            return false;
        };
        if ret == IrqReturn::None {
            return false;
        }
        line.count = line.count.wrapping_add(1);
        if ret == IrqReturn::WakeOwner && line.thread_fn.is_some() {
            line.pending = line.pending.saturating_add(1);
            return true;
        }
        false
    }

    /// Claim one deferred run, lowest line first.
    fn take_pending(&mut self) -> Option<(IrqData, IrqHandler)> {
        self.lines.iter_mut().flatten().find_map(|line| {
            if line.pending == 0 {
                return None;
            }
            line.pending -= 1;
            line.count = line.count.wrapping_add(1);
            line.deferred_fn().map(|f| (*line, f))
        })
    }
}

// ---------------------------------------------------------------------------
// Handler context
// ---------------------------------------------------------------------------

/// What an IRQ handler may do. Only interrupt-safe operations are
/// exposed; nothing here blocks.
pub struct IrqContext<'k> {
    kernel: &'k Kernel,
    irq: u8,
}

impl IrqContext<'_> {
    pub fn irq(&self) -> u8 {
        self.irq
    }

    /// Wake the first waiter of `queue`, or latch the signal.
    pub fn notify(&self, queue: &EventQueue) -> bool {
        queue.notify(self.kernel)
    }

    pub fn signal(&self, sem: &Semaphore) {
        sem.signal(self.kernel);
    }

    pub fn post<T: Copy, const N: usize>(&self, queue: &IpmQueue<T, N>, msg: T) -> KResult<()> {
        queue.post(self.kernel, msg)
    }

    /// Run the scheduler clock tick.
    pub fn system_tick(&self) {
        self.kernel.tick();
    }

    /// Advance the registered high-resolution timer source.
    pub fn hrtimer_tick(&self) -> IrqReturn {
        self.kernel.hr_clk().map_or(IrqReturn::None, |hr| hr.tick())
    }
}

/// Handler for the system tick line.
pub fn system_tick_irq(_data: &IrqData, ctx: &IrqContext<'_>) -> IrqReturn {
    ctx.system_tick();
    IrqReturn::Handled
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl Kernel {
    /// Register the interrupt controller.
    pub fn irq_chip_init(&self, name: &'static str) -> KResult<()> {
        self.irqs.lock(|t| {
            if t.chip.is_some() {
                return Err(KernelError::AlreadyInitialised);
            }
            t.chip = Some(IrqChip::new(name));
            Ok(())
        })?;
        info!("irq chip {} registered", name);
        Ok(())
    }

    pub fn irq_chip_add_irq(&self, irq: u8) -> KResult<()> {
        self.irqs.lock(|t| t.chip_mut()?.add_irq(irq))
    }

    pub fn irq_chip_set_sleep(&self, hook: ChipHook) -> KResult<()> {
        self.irqs.lock(|t| t.chip_mut().map(|c| c.set_sleep(hook)))
    }

    pub fn irq_chip_set_resume(&self, hook: ChipHook) -> KResult<()> {
        self.irqs.lock(|t| t.chip_mut().map(|c| c.set_resume(hook)))
    }

    /// Register `handler` for `irq`. The line starts enabled. With
    /// `LineFlags::THREADED` the handler runs in the IRQ thread.
    pub fn irq_request(
        &'static self,
        irq: u8,
        handler: IrqHandler,
        flags: LineFlags,
        private: usize,
    ) -> KResult<()> {
        if flags.contains(LineFlags::THREADED) {
            return self.irq_request_threaded(irq, None, handler, flags, private);
        }
        self.irqs
            .lock(|t| t.request(IrqData::new(irq, Some(handler), None, flags, private)))?;
        info!("irq {} requested", irq);
        Ok(())
    }

    /// Register a line whose work runs in the IRQ thread: `thread_fn`
    /// runs there whenever `hard` returns `WakeOwner`, or on every
    /// interrupt when there is no `hard` handler.
    pub fn irq_request_threaded(
        &'static self,
        irq: u8,
        hard: Option<IrqHandler>,
        thread_fn: IrqHandler,
        flags: LineFlags,
        private: usize,
    ) -> KResult<()> {
        let mut flags = flags;
        flags.set(LineFlags::THREADED, hard.is_none());
        self.irq_thread()?;
        self.irqs
            .lock(|t| t.request(IrqData::new(irq, hard, Some(thread_fn), flags, private)))?;
        info!("threaded irq {} requested", irq);
        Ok(())
    }

    /// The IRQ thread, created on first use.
    fn irq_thread(&'static self) -> KResult<ThreadId> {
        if let Some(tid) = self.irqs.lock(|t| t.thread) {
            return Ok(tid);
        }
        let tid = self.spawn(
            "irq",
            irq_thread_main,
            self.addr(),
            Stack::Auto,
            IRQ_THREAD_PRIO,
            ThreadFlags::IRQ_THREAD,
        )?;
        self.irqs.lock(|t| t.thread = Some(tid));
        Ok(tid)
    }

    pub fn irq_set_handle(&self, irq: u8, handler: IrqHandler) -> KResult<()> {
        self.irqs.lock(|t| t.line_mut(irq).map(|l| l.handler = Some(handler)))
    }

    pub fn irq_enable(&self, irq: u8) -> KResult<()> {
        self.irqs
            .lock(|t| t.line_mut(irq).map(|l| l.flags.insert(LineFlags::ENABLED)))
    }

    pub fn irq_disable(&self, irq: u8) -> KResult<()> {
        self.irqs
            .lock(|t| t.line_mut(irq).map(|l| l.flags.remove(LineFlags::ENABLED)))
    }

    pub fn irq_count(&self, irq: u8) -> KResult<u32> {
        self.irqs.lock(|t| t.line(irq).map(|l| l.count))
    }

    pub fn irq_data(&self, irq: u8) -> KResult<IrqData> {
        self.irqs.lock(|t| t.line(irq).copied())
    }

    /// Service interrupt line `irq`. Called from the vectors.
    pub fn irq_handle(&self, irq: u8) {
        arch::irq_enter();
        match self.irqs.lock(|t| t.begin(irq)) {
            Dispatch::Ignored => trace!("irq {} ignored", irq),
            Dispatch::Deferred => self.irq_wake_thread(),
            Dispatch::Hard(data, handler) => {
                let ret = handler(&data, &IrqContext { kernel: self, irq });
                if self.irqs.lock(|t| t.finish(irq, ret)) {
                    self.irq_wake_thread();
                }
            }
        }
        arch::irq_exit();
    }

    fn irq_wake_thread(&self) {
        self.with_object(&self.irqs, |t, s| s.notify(&mut t.inbox));
    }

    /// Run every deferred handler invocation outstanding. Returns how many
    /// ran.
    pub(crate) fn irq_thread_run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some((data, f)) = self.irqs.lock(|t| t.take_pending()) {
            f(&data, &IrqContext { kernel: self, irq: data.irq });
            ran += 1;
        }
        if ran > 0 {
            debug!("irq thread ran {} deferred handlers", ran);
        }
        ran
    }

    /// Block the IRQ thread until the next deferral.
    fn irq_thread_wait(&self) -> KResult<()> {
        self.block_on("irq_thread", &self.irqs, EVENT_WAIT_INFINITE, |t, s, d| {
            event::wait(&mut t.inbox, s, d, Latch::Consume)
        })
    }

    /// Enter `mode` until the next wake-up interrupt, running the IRQ
    /// chip's sleep and resume hooks around it.
    pub fn suspend(&self, mode: PowerMode) -> KResult<()> {
        let chip = self.irqs.lock(|t| t.chip()).ok_or(KernelError::NotInitialised)?;
        debug!("suspend to {:?}", mode);
        chip.sleep();
        arch::set_power_mode(mode);
        arch::hibernate();
        arch::set_power_mode(PowerMode::Idle);
        chip.resume();
        Ok(())
    }
}

fn irq_thread_main(arg: usize) {
    // SAFETY: `arg` is the address of the 'static kernel that spawned us
    let kernel = unsafe { &*(arg as *const Kernel) };
    loop {
        kernel.irq_thread_run_pending();
        if let Err(e) = kernel.irq_thread_wait() {
            kernel.panic(format_args!("irq thread: {}", e));
        }
    }
}
