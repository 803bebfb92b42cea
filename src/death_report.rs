//! # Death Report
//!
//! Fixed-layout record of the processor state at the moment of an
//! unrecoverable fault. The fault entry writes it into retained RAM just
//! before forcing a reset; boot-time diagnostics read it back afterwards.
//!
//! ## Layout
//!
//! Post-mortem tools parse this record byte for byte, so the layout is part
//! of the interface (little-endian, 4-byte aligned, no implicit padding):
//!
//! ```text
//! offset  size  field
//! ------  ----  --------------------------------------------------
//!      0     2  checksum            CRC-16/CCITT-FALSE of bytes 2..
//!      2     1  was_seen            0 = unread, 1 = acknowledged
//!      3     1  padding             always 0
//!      4     4  exception_id        IPSR exception number
//!      8    88  registers           r0..r12 msp psp lr pc psr
//!                                   primask faultmask basepri control
//!     96    16  fault_status        CFSR HFSR MMAR BFAR
//!    112     4  stack_trace_pointer faulting SP
//!    116     4  stack_trace_length  words valid in stack_trace
//!    120   512  stack_trace         128 words from the faulting SP up
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!  fault ──► overwrite + seal (was_seen = 0) ──► reset
//!                                                  │
//!  boot  ◄─────────────────────────────────────────┘
//!   └─► inspect: checksum ok & !was_seen ──► log ──► acknowledge (was_seen = 1, reseal)
//! ```
//!
//! The record is never erased. A later fault simply overwrites it.

use core::mem::{offset_of, size_of};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{BOOT_REPORT_BASE, BOOT_REPORT_SIZE, DEATH_REPORT_OFFSET, STACK_TRACE_WORDS};
use crate::crc::crc16;
use crate::error::ReportError;

/// Absolute address of the death report in retained RAM.
pub const DEATH_REPORT_ADDRESS: usize = BOOT_REPORT_BASE + DEATH_REPORT_OFFSET;

/// Core registers as they were when the fault was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Registers {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub msp: u32,
    pub psp: u32,
    pub lr: u32,
    pub pc: u32,
    pub psr: u32,
    pub primask: u32,
    pub faultmask: u32,
    pub basepri: u32,
    pub control: u32,
}

/// System control block fault status and address registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FaultStatus {
    pub cfsr: u32,
    pub hfsr: u32,
    pub mmar: u32,
    pub bfar: u32,
}

/// The persisted report.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DeathReport {
    pub checksum: u16,
    pub was_seen: u8,
    pub padding: u8,
    pub exception_id: u32,
    pub registers: Registers,
    pub fault_status: FaultStatus,
    pub stack_trace_pointer: u32,
    pub stack_trace_length: u32,
    pub stack_trace: [u32; STACK_TRACE_WORDS],
}

const _: () = {
    assert!(offset_of!(DeathReport, was_seen) == 2);
    assert!(offset_of!(DeathReport, exception_id) == 4);
    assert!(offset_of!(DeathReport, registers) == 8);
    assert!(offset_of!(DeathReport, fault_status) == 96);
    assert!(offset_of!(DeathReport, stack_trace_pointer) == 112);
    assert!(offset_of!(DeathReport, stack_trace_length) == 116);
    assert!(offset_of!(DeathReport, stack_trace) == 120);
    assert!(size_of::<DeathReport>() == 120 + 4 * STACK_TRACE_WORDS);
    assert!(DEATH_REPORT_OFFSET + size_of::<DeathReport>() <= BOOT_REPORT_SIZE);
    assert!(DEATH_REPORT_ADDRESS % 4 == 0);
};

/// Byte offsets used by the fault entry, which stores fields by address.
pub mod offsets {
    use super::{DeathReport, FaultStatus, Registers};
    use core::mem::offset_of;

    const REGS: usize = offset_of!(DeathReport, registers);
    const STATUS: usize = offset_of!(DeathReport, fault_status);

    pub const EXCEPTION_ID: usize = offset_of!(DeathReport, exception_id);
    pub const R0: usize = REGS + offset_of!(Registers, r0);
    pub const R1: usize = REGS + offset_of!(Registers, r1);
    pub const R2: usize = REGS + offset_of!(Registers, r2);
    pub const R3: usize = REGS + offset_of!(Registers, r3);
    pub const R4: usize = REGS + offset_of!(Registers, r4);
    pub const R5: usize = REGS + offset_of!(Registers, r5);
    pub const R6: usize = REGS + offset_of!(Registers, r6);
    pub const R7: usize = REGS + offset_of!(Registers, r7);
    pub const R8: usize = REGS + offset_of!(Registers, r8);
    pub const R9: usize = REGS + offset_of!(Registers, r9);
    pub const R10: usize = REGS + offset_of!(Registers, r10);
    pub const R11: usize = REGS + offset_of!(Registers, r11);
    pub const R12: usize = REGS + offset_of!(Registers, r12);
    pub const MSP: usize = REGS + offset_of!(Registers, msp);
    pub const PSP: usize = REGS + offset_of!(Registers, psp);
    pub const LR: usize = REGS + offset_of!(Registers, lr);
    pub const PC: usize = REGS + offset_of!(Registers, pc);
    pub const PSR: usize = REGS + offset_of!(Registers, psr);
    pub const PRIMASK: usize = REGS + offset_of!(Registers, primask);
    pub const FAULTMASK: usize = REGS + offset_of!(Registers, faultmask);
    pub const BASEPRI: usize = REGS + offset_of!(Registers, basepri);
    pub const CONTROL: usize = REGS + offset_of!(Registers, control);
    pub const CFSR: usize = STATUS + offset_of!(FaultStatus, cfsr);
    pub const HFSR: usize = STATUS + offset_of!(FaultStatus, hfsr);
    pub const MMAR: usize = STATUS + offset_of!(FaultStatus, mmar);
    pub const BFAR: usize = STATUS + offset_of!(FaultStatus, bfar);
    pub const STACK_TRACE_POINTER: usize = offset_of!(DeathReport, stack_trace_pointer);
}

impl DeathReport {
    /// An all-zero report.
    pub fn zeroed() -> Self {
        <Self as FromZeros>::new_zeroed()
    }

    /// CRC over every byte of the report except the checksum itself.
    pub fn compute_checksum(&self) -> u16 {
        crc16(&self.as_bytes()[size_of::<u16>()..])
    }

    /// Mark the report unread and store its checksum. The flag and padding
    /// are cleared first so the checksum covers the bytes actually stored.
    pub fn seal(&mut self) {
        self.was_seen = 0;
        self.padding = 0;
        self.checksum = self.compute_checksum();
    }

    /// Check the stored checksum against the contents.
    pub fn verify(&self) -> Result<(), ReportError> {
        let computed = self.compute_checksum();
        if computed == self.checksum {
            Ok(())
        } else {
            Err(ReportError::ChecksumMismatch {
                stored: self.checksum,
                computed,
            })
        }
    }

    pub fn was_seen(&self) -> bool {
        self.was_seen != 0
    }

    /// The valid part of the stack trace.
    pub fn stack_trace(&self) -> &[u32] {
        let len = (self.stack_trace_length as usize).min(STACK_TRACE_WORDS);
        &self.stack_trace[..len]
    }

    pub fn exception(&self) -> Exception {
        Exception::from_id(self.exception_id)
    }
}

/// Exception that ended the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Nmi,
    HardFault,
    MemoryManagement,
    BusFault,
    UsageFault,
    /// External interrupt routed to the fault entry.
    Interrupt(u32),
    Other(u32),
}

impl Exception {
    pub fn from_id(id: u32) -> Self {
        match id {
            2 => Exception::Nmi,
            3 => Exception::HardFault,
            4 => Exception::MemoryManagement,
            5 => Exception::BusFault,
            6 => Exception::UsageFault,
            16.. => Exception::Interrupt(id - 16),
            other => Exception::Other(other),
        }
    }
}

/// The parts of an unseen report worth logging at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeathSummary {
    pub exception: Exception,
    pub pc: u32,
    pub lr: u32,
    pub psr: u32,
    pub fault_status: FaultStatus,
    pub stack_trace_pointer: u32,
    pub stack_trace_length: u32,
}

/// Boot-time access to the death report left by the previous run.
pub struct DeathReportReader<'a> {
    report: &'a mut DeathReport,
}

impl<'a> DeathReportReader<'a> {
    pub fn new(report: &'a mut DeathReport) -> Self {
        Self { report }
    }

    /// Reader over the report in retained RAM.
    ///
    /// # Safety
    /// No other reference to the retained report may exist for `'a`, and
    /// the fault entry must not be able to run concurrently (i.e. call this
    /// before any task or interrupt that could fault is started).
    pub unsafe fn retained() -> DeathReportReader<'static> {
        // SAFETY: the address lies in the reserved BOOT_REPORT region, is
        // 4-byte aligned and every bit pattern is a valid DeathReport.
        let report = unsafe { &mut *(DEATH_REPORT_ADDRESS as *mut DeathReport) };
        DeathReportReader { report }
    }

    /// Validate the report and summarize it if it has not been seen yet.
    ///
    /// A checksum mismatch means the region holds no trustworthy report
    /// (first power-up, or a capture interrupted half-way); nothing in it
    /// may be treated as fact.
    pub fn inspect(&self) -> Result<Option<DeathSummary>, ReportError> {
        if let Err(err) = self.report.verify() {
            log::error!("death report unusable: {}", err);
            return Err(err);
        }
        if self.report.was_seen() {
            log::debug!("death report already acknowledged");
            return Ok(None);
        }

        let summary = DeathSummary {
            exception: self.report.exception(),
            pc: self.report.registers.pc,
            lr: self.report.registers.lr,
            psr: self.report.registers.psr,
            fault_status: self.report.fault_status,
            stack_trace_pointer: self.report.stack_trace_pointer,
            stack_trace_length: self.report.stack_trace_length,
        };
        log::info!(
            "previous run died: {:?} at pc={:#010x} lr={:#010x} cfsr={:#010x} hfsr={:#010x}",
            summary.exception,
            summary.pc,
            summary.lr,
            summary.fault_status.cfsr,
            summary.fault_status.hfsr
        );
        Ok(Some(summary))
    }

    /// Mark the report as consumed. The checksum is recomputed so the
    /// acknowledged report still verifies on later boots.
    pub fn acknowledge(&mut self) {
        self.report.was_seen = 1;
        self.report.checksum = self.report.compute_checksum();
    }

    pub fn report(&self) -> &DeathReport {
        self.report
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> DeathReport {
        let mut report = DeathReport::zeroed();
        report.exception_id = 3;
        report.registers.pc = 0x0040_1234;
        report.registers.lr = 0xFFFF_FFFD;
        report.registers.psr = 0x0100_0000;
        report.fault_status.cfsr = 1 << 25;
        report.fault_status.hfsr = 1 << 30;
        report.stack_trace_pointer = 0x2045_0000;
        report.stack_trace_length = 4;
        report.stack_trace[..4].copy_from_slice(&[1, 2, 3, 4]);
        report.was_seen = 1;
        report
    }

    #[test]
    fn test_layout_size() {
        assert_eq!(size_of::<DeathReport>(), 632);
        assert_eq!(offsets::R4, 8 + 16);
        assert_eq!(offsets::CONTROL, 8 + 21 * 4);
        assert_eq!(offsets::BFAR, 108);
    }

    #[test]
    fn test_seal_then_verify() {
        let mut report = sample_report();
        report.seal();
        assert!(!report.was_seen());
        assert_eq!(report.padding, 0);
        assert_eq!(report.verify(), Ok(()));
        assert_eq!(report.checksum, crc16(&report.as_bytes()[2..]));
    }

    #[test]
    fn test_any_single_byte_flip_is_detected() {
        let mut report = sample_report();
        report.seal();
        let sealed = report.as_bytes().to_vec();

        for i in 2..sealed.len() {
            let mut bytes = sealed.clone();
            bytes[i] ^= 0x01;
            let corrupted = DeathReport::read_from_bytes(&bytes[..]).unwrap();
            assert!(
                matches!(corrupted.verify(), Err(ReportError::ChecksumMismatch { .. })),
                "flip at byte {i} went unnoticed"
            );
        }
    }

    #[test]
    fn test_inspect_then_acknowledge() {
        let mut report = sample_report();
        report.seal();

        let mut reader = DeathReportReader::new(&mut report);
        let summary = reader.inspect().unwrap().unwrap();
        assert_eq!(summary.exception, Exception::HardFault);
        assert_eq!(summary.pc, 0x0040_1234);
        assert_eq!(summary.fault_status.cfsr, 1 << 25);

        reader.acknowledge();
        assert!(reader.report().was_seen());
        assert_eq!(reader.inspect(), Ok(None));
        assert_eq!(reader.report().verify(), Ok(()));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        let mut report = DeathReport::zeroed();
        report.checksum = 0x1234;
        let reader = DeathReportReader::new(&mut report);
        assert!(matches!(
            reader.inspect(),
            Err(ReportError::ChecksumMismatch { stored: 0x1234, .. })
        ));
    }

    #[test]
    fn test_stack_trace_length_is_clamped() {
        let mut report = sample_report();
        report.stack_trace_length = 10_000;
        assert_eq!(report.stack_trace().len(), STACK_TRACE_WORDS);
    }

    #[test]
    fn test_exception_decoding() {
        assert_eq!(Exception::from_id(4), Exception::MemoryManagement);
        assert_eq!(Exception::from_id(6), Exception::UsageFault);
        assert_eq!(Exception::from_id(23 + 16), Exception::Interrupt(23));
        assert_eq!(Exception::from_id(11), Exception::Other(11));
    }
}
