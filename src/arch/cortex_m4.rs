//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick configuration,
//! interrupt masking and the sleep modes.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack. PendSV saves and restores R4–R11, completing the
//! context. The handler masks interrupts for the pointer swap and unmasks
//! them right before the exception return.
//!
//! ## Interrupt Dispatch
//!
//! SysTick and every device vector funnel into `Kernel::irq_handle` with the
//! exception number as the line, so the SysTick tick is an ordinary IRQ line
//! ([`SYSTICK_IRQ`]) with a registered handler.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: priority 0xFF (lowest)
//! - PendSV: priority 0xFF (lowest), runs only when no other ISR is active

use core::arch::{asm, global_asm};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;
use cortex_m_rt::exception;

use super::PowerMode;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::{thread_trampoline, Kernel};

/// IRQ line of the SysTick exception.
pub const SYSTICK_IRQ: u8 = 15;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // SHPR3 (0xE000_ED20): [23:16] PendSV, [31:24] SysTick
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        core::ptr::write_volatile(shpr3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Interrupt primitives
// ---------------------------------------------------------------------------

#[inline]
pub fn irq_disable() {
    cortex_m::interrupt::disable();
}

#[inline]
pub fn irq_enable() {
    // SAFETY: only called to undo a matching disable
    unsafe { cortex_m::interrupt::enable() }
}

#[inline]
pub fn irqs_enabled() -> bool {
    primask::read().is_inactive()
}

#[inline]
pub fn in_interrupt() -> bool {
    SCB::vect_active() != VectActive::ThreadMode
}

/// The NVIC tracks nesting itself.
#[inline]
pub fn irq_enter() {}

#[inline]
pub fn irq_exit() {}

/// Pend a context switch. PendSV fires once no other handler is active.
#[inline]
pub fn request_switch() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Thread stacks
// ---------------------------------------------------------------------------

/// Build the initial 16-word context frame below `top` and return the
/// resulting stack pointer. The thread starts in `thread_trampoline` with
/// `entry` in R0 and `arg` in R1.
///
/// # Safety
/// `top` must be the end of a writable region of at least 64 bytes that
/// no running thread uses.
pub unsafe fn init_stack(top: usize, entry: usize, arg: usize) -> usize {
    // AAPCS: 8-byte aligned
    let aligned_top = top & !0x07;
    let frame = (aligned_top - 16 * 4) as *mut u32;

    // R4–R11
    for i in 0..8 {
        *frame.add(i) = 0;
    }
    *frame.add(8) = entry as u32; // R0
    *frame.add(9) = arg as u32; // R1
    *frame.add(10) = 0; // R2
    *frame.add(11) = 0; // R3
    *frame.add(12) = 0; // R12
    *frame.add(13) = thread_return as usize as u32; // LR
    *frame.add(14) = (thread_trampoline as usize as u32) & !1; // PC
    *frame.add(15) = 0x0100_0000; // xPSR, Thumb bit

    frame as usize
}

/// The trampoline never returns; land somewhere harmless if it does.
extern "C" fn thread_return() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Switch Thread mode to PSP and branch into the first thread.
///
/// # Safety
/// Called once from `Kernel::start`, with a frame built by [`init_stack`].
pub unsafe fn start_first_thread(sp: usize) -> ! {
    asm!(
        // Skip the software frame (R4–R11)
        "adds r0, #32",
        "msr psp, r0",

        // CONTROL.SPSEL = 1
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unstack the hardware frame by hand
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR
        "pop {{r5}}",          // PC
        "pop {{r6}}",          // xPSR

        "orr r5, r5, #1",      // bx needs the Thumb bit
        "cpsie i",
        "bx r5",

        in("r0") sp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

// 1. mask interrupts and push R4–R11 onto the outgoing PSP
// 2. emberos_switch_context(psp) stores it and returns the next PSP
// 3. pop R4–R11, install the PSP, unmask and return to Thread mode
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    cpsid i",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11}}",
    "    bl emberos_switch_context",
    "    ldmia r0!, {{r4-r11}}",
    "    msr psp, r0",
    "    cpsie i",
    "    ldr r0, =0xFFFFFFFD",
    "    bx r0",
    "    .ltorg",
);

/// Store the outgoing stack pointer, run the scheduler and return the
/// incoming one. Called from PendSV with interrupts masked.
#[no_mangle]
extern "C" fn emberos_switch_context(psp: usize) -> usize {
    match Kernel::installed() {
        Some(kernel) => kernel.context_switch(psp),
        None => psp,
    }
}

// ---------------------------------------------------------------------------
// Exception entry points
// ---------------------------------------------------------------------------

/// SysTick exception handler: the system tick line.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    if let Some(kernel) = Kernel::installed() {
        kernel.irq_handle(SYSTICK_IRQ);
    }
}

/// Every device interrupt without a dedicated handler.
#[exception]
unsafe fn DefaultHandler(irqn: i16) {
    if let Some(kernel) = Kernel::installed() {
        kernel.irq_handle((irqn + 16) as u8);
    }
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

/// Select the sleep depth used by the next `wfi`.
pub fn set_power_mode(mode: PowerMode) {
    // SCR (0xE000_ED10), SLEEPDEEP = bit 2
    const SCR: *mut u32 = 0xE000_ED10 as *mut u32;
    unsafe {
        let val = core::ptr::read_volatile(SCR);
        let val = match mode {
            PowerMode::Idle => val & !(1 << 2),
            PowerMode::PowerDown => val | (1 << 2),
        };
        core::ptr::write_volatile(SCR, val);
    }
}

#[inline]
pub fn hibernate() {
    cortex_m::asm::wfi();
}

/// Mask interrupts and stop for good.
pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}
