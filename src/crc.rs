//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, MSB first, no final XOR).
//!
//! Bitwise on purpose: it runs from the fault path, where a 512-byte lookup
//! table in flash buys nothing and the input is a few hundred bytes.

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

/// Running checksum state.
#[derive(Debug, Clone, Copy)]
pub struct Crc16 {
    crc: u16,
}

impl Crc16 {
    pub const fn new() -> Self {
        Self { crc: INIT }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.crc ^= u16::from(byte) << 8;
            for _ in 0..8 {
                self.crc = if self.crc & 0x8000 != 0 {
                    (self.crc << 1) ^ POLY
                } else {
                    self.crc << 1
                };
            }
        }
    }

    pub const fn finish(self) -> u16 {
        self.crc
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a single buffer.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(bytes);
    crc.finish()
}
