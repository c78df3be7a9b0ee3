//! Transceiver drivers.
//!
//! Two chip flavors implement [`RadioOps`]: a CC1101 ([`cc1101::Cc1101`]) and an
//! RFM69HCW ([`rfm69::Rfm69`]). Both run the chip in infinite-length packet mode
//! and use a zero byte as the end-of-packet marker, so frames longer than the
//! hardware FIFO are streamed in and out while the chip is active.
//!
//! A [`Flavor`] descriptor captures what differs between the chips at the
//! register-access and timing level; everything else is driver code.

pub mod any;
pub mod cc1101;
pub mod rfm69;

pub use any::{AnyRadio, Chip};

use crate::error::MdtError;
use std::time::Duration;

/// Over-the-air bit rate used by the pumps.
pub const BIT_RATE: u32 = 16_384;

/// Default carrier frequency (US pumps).
pub const DEFAULT_FREQUENCY: u32 = 916_600_000;

/// RSSI reported before any frame has been received, and for probes that get no reply.
pub const NO_SIGNAL_DBM: i32 = -128;

/// Polls of a status register before a mode change is declared failed.
pub(crate) const MODE_SPIN_LIMIT: usize = 1_000;

/// How the chip reports that a commanded mode has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeReady {
    /// A state-machine register (CC1101 `MARCSTATE`) reports the current state.
    StateRegister,
    /// A flag (RFM69 `RegIrqFlags1.ModeReady`) is set once the new mode is active.
    ReadyFlag,
}

/// Chip-specific constants shared by the register-access and timing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flavor {
    pub name: &'static str,
    /// Crystal frequency in Hz.
    pub fxosc: u32,
    /// Power of two in the carrier-frequency register formula.
    pub freq_shift: u32,
    pub fifo_size: usize,
    /// FIFO level at or below which the transmitter is refilled.
    pub fifo_threshold: usize,
    /// Largest encoded frame the driver accepts, terminator excluded.
    pub max_packet_size: usize,
    /// Zero bytes appended on transmit.
    pub terminator_len: usize,
    /// Bit OR-ed into the address byte to read.
    pub read_flag: u8,
    /// Bit OR-ed into the address byte to write.
    pub write_flag: u8,
    /// Bit OR-ed into the address byte for burst access (0 when every access may burst).
    pub burst_flag: u8,
    pub mode_ready: ModeReady,
    /// Expected hardware version word.
    pub version: u16,
}

/// Packet counters kept by each driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RadioStats {
    pub packets_sent: u32,
    pub bytes_sent: u32,
    pub packets_received: u32,
    pub bytes_received: u32,
    pub rx_overflows: u32,
    pub tx_underflows: u32,
}

/// Common capability set of both transceivers.
///
/// The radio is single-owner: send and receive are serialized through `&mut self`.
/// The only blocking points are the pacing sleeps inside send/receive and the
/// interrupt wait bounded by the caller's timeout.
#[allow(async_fn_in_trait)]
pub trait RadioOps {
    fn flavor(&self) -> &'static Flavor;

    /// Carrier frequency currently programmed into the chip.
    fn frequency(&mut self) -> Result<u32, MdtError>;

    fn set_frequency(&mut self, hz: u32) -> Result<(), MdtError>;

    /// RSSI in dBm of the most recently received frame.
    fn last_rssi(&self) -> i32;

    fn statistics(&self) -> RadioStats;

    /// `(address, value)` pairs of the chip's configuration registers.
    fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>, MdtError>;

    /// Transmit an encoded frame followed by the zero terminator.
    async fn send(&mut self, data: &[u8]) -> Result<(), MdtError>;

    /// Receive one frame. On timeout returns an empty frame and the previous RSSI.
    async fn receive(&mut self, timeout: Duration) -> Result<(Vec<u8>, i32), MdtError>;

    /// Idle the chip. Further use is a caller error.
    fn close(&mut self) -> Result<(), MdtError>;
}

/// `round(hz * 2^k / FXOSC)`, split into three register bytes (MSB first).
pub fn frequency_to_registers(flavor: &Flavor, hz: u32) -> [u8; 3] {
    let fxosc = u64::from(flavor.fxosc);
    let f = ((u64::from(hz) << flavor.freq_shift) + fxosc / 2) / fxosc;
    [(f >> 16) as u8, (f >> 8) as u8, f as u8]
}

/// Inverse of [`frequency_to_registers`], truncating to whole Hz.
pub fn registers_to_frequency(flavor: &Flavor, regs: [u8; 3]) -> u32 {
    let f = u64::from(regs[0]) << 16 | u64::from(regs[1]) << 8 | u64::from(regs[2]);
    ((f * u64::from(flavor.fxosc)) >> flavor.freq_shift) as u32
}

/// Frequency step of one register LSB, rounded up to whole Hz.
pub fn frequency_resolution(flavor: &Flavor) -> u32 {
    flavor.fxosc.div_ceil(1 << flavor.freq_shift)
}

/// Air time of one byte at `bit_rate`.
pub fn byte_duration(bit_rate: u32) -> Duration {
    Duration::from_nanos(8_000_000_000 / u64::from(bit_rate))
}

/// Time to wait for a mode the chip reaches on its own (end of TX, end of RX).
pub(crate) fn transfer_budget(bytes: usize) -> Duration {
    byte_duration(BIT_RATE) * (bytes as u32 + 64) * 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn cc1101_frequency_registers() {
        let regs = frequency_to_registers(&cc1101::FLAVOR, 916_600_000);
        assert_eq!(regs, [0x26, 0x31, 0x11]);
        assert_eq!(registers_to_frequency(&cc1101::FLAVOR, regs), 916_599_975);
    }

    #[test]
    fn rfm69_frequency_registers() {
        let regs = frequency_to_registers(&rfm69::FLAVOR, 916_600_000);
        assert_eq!(regs, [0xE5, 0x26, 0x66]);
        assert_eq!(registers_to_frequency(&rfm69::FLAVOR, regs), 916_599_975);
    }

    #[test]
    fn resolution() {
        assert_eq!(frequency_resolution(&cc1101::FLAVOR), 367);
        assert_eq!(frequency_resolution(&rfm69::FLAVOR), 62);
    }

    #[test]
    fn byte_time_at_pump_rate() {
        assert_eq!(byte_duration(BIT_RATE), Duration::from_nanos(488_281));
    }

    fn in_band(f: u32) -> u32 {
        860_000_000 + f % 60_000_001
    }

    quickcheck! {
        fn cc1101_frequency_round_trip(f: u32) -> bool {
            let f = in_band(f);
            let back = registers_to_frequency(&cc1101::FLAVOR, frequency_to_registers(&cc1101::FLAVOR, f));
            back.abs_diff(f) < frequency_resolution(&cc1101::FLAVOR)
        }

        fn rfm69_frequency_round_trip(f: u32) -> bool {
            let f = in_band(f);
            let back = registers_to_frequency(&rfm69::FLAVOR, frequency_to_registers(&rfm69::FLAVOR, f));
            back.abs_diff(f) < frequency_resolution(&rfm69::FLAVOR)
        }
    }
}
