//! # Cortex-M7 Port Layer
//!
//! Processor-specific half of fault capture for ARMv7E-M cores.
//!
//! ## Fault entry
//!
//! The HardFault, MemoryManagement, BusFault and UsageFault symbols are
//! defined here in assembly, so they override the weak defaults of
//! `cortex-m-rt`. The entry never uses the stack and only touches r0-r3,
//! whose fault-time values are already in the hardware-stacked frame:
//!
//! ```text
//! cpsid i                          mask everything
//! tst lr, #4 ; mrs r3, msp|psp     r3 = stack that holds the fault frame
//! WDT_CR <- restart key            keep the watchdog off our back
//! report.exception_id <- IPSR
//! report.r0-r3, r12, lr, pc, psr <- [r3 + 0..28]
//! report.r4-r11 <- r4-r11          saved before anything can clobber them
//! report.msp, psp, primask, faultmask, basepri, control <- mrs
//! report.cfsr, hfsr, mmar, bfar <- SCB
//! report.stack_trace_pointer <- r3
//! sp <- top of FAULT_STACK ; b fault_tail
//! ```
//!
//! The tail runs on its own small, 8-byte aligned stack, so a fault caused
//! by a blown main or process stack does not fault again while the report
//! is finished. It drives a [`FaultCapture`](crate::fault::FaultCapture):
//! copies the stack window, seals the report, cleans the data cache so the
//! report reaches SRAM, and resets through the reset controller.

use cortex_m::peripheral::SCB;

/// SHCSR: MEMFAULTENA, BUSFAULTENA, USGFAULTENA.
const SHCSR_FAULT_ENABLES: u32 = 0b111 << 16;

/// CCR: trap on integer division by zero.
const CCR_DIV_0_TRP: u32 = 1 << 4;

/// Give MemManage, BusFault and UsageFault their own vectors instead of
/// escalating to HardFault, and make division by zero fault.
pub fn enable_fault_traps(scb: &mut SCB) {
    // SAFETY: read-modify-write of enable bits only; no priority changes.
    unsafe {
        scb.shcsr.modify(|x| x | SHCSR_FAULT_ENABLES);
        scb.ccr.modify(|x| x | CCR_DIV_0_TRP);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

#[cfg(feature = "samv71")]
mod entry {
    use core::arch::global_asm;

    use crate::board::samv71::{Samv71Reset, Samv71Watchdog};
    use crate::config::{WATCHDOG_CONTROL_ADDRESS, WATCHDOG_RESTART_KEY};
    use crate::death_report::{offsets, DeathReport, DEATH_REPORT_ADDRESS};
    use crate::fault::{self, FaultCapture};

    const FAULT_STACK_WORDS: usize = 256;

    /// Stack for the capture tail. The AAPCS wants 8-byte alignment at
    /// every public call boundary, and the tail is entered with its top.
    #[repr(C, align(8))]
    struct FaultStack([u32; FAULT_STACK_WORDS]);

    static mut FAULT_STACK: FaultStack = FaultStack([0; FAULT_STACK_WORDS]);

    const _: () = assert!(core::mem::align_of::<FaultStack>() == 8);
    const _: () = assert!(core::mem::size_of::<FaultStack>() % 8 == 0);

    /// CFSR; HFSR, MMAR and BFAR follow at +4, +0xC and +0x10.
    const CFSR_ADDRESS: usize = 0xE000_ED28;

    global_asm!(
        ".section .text.kairos_fault_entry,\"ax\",%progbits",
        ".syntax unified",
        ".thumb",
        ".p2align 3",
        ".globl HardFault",
        ".type HardFault,%function",
        ".thumb_func",
        "HardFault:",
        ".globl MemoryManagement",
        ".type MemoryManagement,%function",
        ".thumb_func",
        "MemoryManagement:",
        ".globl BusFault",
        ".type BusFault,%function",
        ".thumb_func",
        "BusFault:",
        ".globl UsageFault",
        ".type UsageFault,%function",
        ".thumb_func",
        "UsageFault:",
        "    cpsid i",
        "    tst lr, #4",
        "    ite eq",
        "    mrseq r3, msp",
        "    mrsne r3, psp",
        "    ldr r0, ={wdt_key}",
        "    ldr r1, ={wdt_cr}",
        "    str r0, [r1]",
        "    ldr r0, ={report}",
        "    mrs r1, ipsr",
        "    ubfx r1, r1, #0, #9",
        "    str r1, [r0, #{off_exception_id}]",
        "    ldr r1, [r3, #0]",
        "    str r1, [r0, #{off_r0}]",
        "    ldr r1, [r3, #4]",
        "    str r1, [r0, #{off_r1}]",
        "    ldr r1, [r3, #8]",
        "    str r1, [r0, #{off_r2}]",
        "    ldr r1, [r3, #12]",
        "    str r1, [r0, #{off_r3}]",
        "    str r4, [r0, #{off_r4}]",
        "    str r5, [r0, #{off_r5}]",
        "    str r6, [r0, #{off_r6}]",
        "    str r7, [r0, #{off_r7}]",
        "    str r8, [r0, #{off_r8}]",
        "    str r9, [r0, #{off_r9}]",
        "    str r10, [r0, #{off_r10}]",
        "    str r11, [r0, #{off_r11}]",
        "    ldr r1, [r3, #16]",
        "    str r1, [r0, #{off_r12}]",
        "    mrs r1, msp",
        "    str r1, [r0, #{off_msp}]",
        "    mrs r1, psp",
        "    str r1, [r0, #{off_psp}]",
        "    ldr r1, [r3, #20]",
        "    str r1, [r0, #{off_lr}]",
        "    ldr r1, [r3, #24]",
        "    str r1, [r0, #{off_pc}]",
        "    ldr r1, [r3, #28]",
        "    str r1, [r0, #{off_psr}]",
        "    mrs r1, primask",
        "    str r1, [r0, #{off_primask}]",
        "    mrs r1, faultmask",
        "    str r1, [r0, #{off_faultmask}]",
        "    mrs r1, basepri",
        "    str r1, [r0, #{off_basepri}]",
        "    mrs r1, control",
        "    str r1, [r0, #{off_control}]",
        "    ldr r1, ={cfsr_address}",
        "    ldr r2, [r1, #0]",
        "    str r2, [r0, #{off_cfsr}]",
        "    ldr r2, [r1, #4]",
        "    str r2, [r0, #{off_hfsr}]",
        "    ldr r2, [r1, #12]",
        "    str r2, [r0, #{off_mmar}]",
        "    ldr r2, [r1, #16]",
        "    str r2, [r0, #{off_bfar}]",
        "    str r3, [r0, #{off_stack_trace_pointer}]",
        "    ldr r1, ={fault_stack}+{fault_stack_bytes}",
        "    mov sp, r1",
        "    b.w {tail}",
        "    .ltorg",
        ".size HardFault, . - HardFault",
        wdt_key = const WATCHDOG_RESTART_KEY,
        wdt_cr = const WATCHDOG_CONTROL_ADDRESS,
        report = const DEATH_REPORT_ADDRESS,
        off_exception_id = const offsets::EXCEPTION_ID,
        off_r0 = const offsets::R0,
        off_r1 = const offsets::R1,
        off_r2 = const offsets::R2,
        off_r3 = const offsets::R3,
        off_r4 = const offsets::R4,
        off_r5 = const offsets::R5,
        off_r6 = const offsets::R6,
        off_r7 = const offsets::R7,
        off_r8 = const offsets::R8,
        off_r9 = const offsets::R9,
        off_r10 = const offsets::R10,
        off_r11 = const offsets::R11,
        off_r12 = const offsets::R12,
        off_msp = const offsets::MSP,
        off_psp = const offsets::PSP,
        off_lr = const offsets::LR,
        off_pc = const offsets::PC,
        off_psr = const offsets::PSR,
        off_primask = const offsets::PRIMASK,
        off_faultmask = const offsets::FAULTMASK,
        off_basepri = const offsets::BASEPRI,
        off_control = const offsets::CONTROL,
        cfsr_address = const CFSR_ADDRESS,
        off_cfsr = const offsets::CFSR,
        off_hfsr = const offsets::HFSR,
        off_mmar = const offsets::MMAR,
        off_bfar = const offsets::BFAR,
        off_stack_trace_pointer = const offsets::STACK_TRACE_POINTER,
        fault_stack = sym FAULT_STACK,
        fault_stack_bytes = const FAULT_STACK_WORDS * 4,
        tail = sym fault_tail,
    );

    /// Second half of the capture. Entered by branch from the assembly
    /// entry with every live register already in the report.
    unsafe extern "C" fn fault_tail() -> ! {
        // SAFETY: interrupts are masked and nothing else runs any more;
        // this is the only reference to the retained report.
        let report = unsafe { &mut *(DEATH_REPORT_ADDRESS as *mut DeathReport) };
        let mut capture = FaultCapture::trapped(report, Samv71Watchdog, Samv71Reset);

        let sp = capture.stack_pointer();
        let words = fault::stack_window_words(sp);
        // SAFETY: stack_window_words only admits aligned windows that lie
        // entirely inside program RAM, which ends below the report.
        let window = unsafe { core::slice::from_raw_parts(sp as usize as *const u32, words) };
        capture.seal(window);

        // SAFETY: sole owner of the core from here on.
        let mut core = unsafe { cortex_m::Peripherals::steal() };
        core.SCB.clean_invalidate_dcache(&mut core.CPUID);

        capture.reset()
    }
}
