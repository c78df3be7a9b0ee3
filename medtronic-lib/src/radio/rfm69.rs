//! HopeRF RFM69HCW (SX1231) driver.
//!
//! Packet mode with `PayloadLength = 0` gives unlimited-length frames in both
//! directions; the zero terminator ends a received frame, and a transmission
//! ends once the FIFO has drained.

use super::{
    BIT_RATE, Flavor, MODE_SPIN_LIMIT, ModeReady, NO_SIGNAL_DBM, RadioOps, RadioStats, byte_duration,
    frequency_to_registers, registers_to_frequency, transfer_budget,
};
use crate::error::MdtError;
use crate::hw::{InterruptPin, NoPin, SpiPort};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace, warn};

pub const FLAVOR: Flavor = Flavor {
    name: "RFM69HCW",
    fxosc: 32_000_000,
    freq_shift: 19,
    fifo_size: 66,
    fifo_threshold: 20,
    max_packet_size: 150,
    terminator_len: 1,
    read_flag: 0x00,
    write_flag: 0x80,
    burst_flag: 0x00,
    mode_ready: ModeReady::ReadyFlag,
    version: 0x0024,
};

pub const REG_FIFO: u8 = 0x00;
pub const REG_OP_MODE: u8 = 0x01;
pub const REG_DATA_MODUL: u8 = 0x02;
pub const REG_BITRATE_MSB: u8 = 0x03;
pub const REG_BITRATE_LSB: u8 = 0x04;
pub const REG_FDEV_MSB: u8 = 0x05;
pub const REG_FDEV_LSB: u8 = 0x06;
pub const REG_FRF_MSB: u8 = 0x07;
pub const REG_VERSION: u8 = 0x10;
pub const REG_PA_LEVEL: u8 = 0x11;
pub const REG_LNA: u8 = 0x18;
pub const REG_RX_BW: u8 = 0x19;
pub const REG_AFC_BW: u8 = 0x1A;
pub const REG_OOK_PEAK: u8 = 0x1B;
pub const REG_RSSI_VALUE: u8 = 0x24;
pub const REG_DIO_MAPPING1: u8 = 0x25;
pub const REG_DIO_MAPPING2: u8 = 0x26;
pub const REG_IRQ_FLAGS1: u8 = 0x27;
pub const REG_IRQ_FLAGS2: u8 = 0x28;
pub const REG_RSSI_THRESH: u8 = 0x29;
pub const REG_PREAMBLE_MSB: u8 = 0x2C;
pub const REG_PREAMBLE_LSB: u8 = 0x2D;
pub const REG_SYNC_CONFIG: u8 = 0x2E;
pub const REG_SYNC_VALUE1: u8 = 0x2F;
pub const REG_PACKET_CONFIG1: u8 = 0x37;
pub const REG_PAYLOAD_LENGTH: u8 = 0x38;
pub const REG_FIFO_THRESH: u8 = 0x3C;
pub const REG_PACKET_CONFIG2: u8 = 0x3D;
pub const REG_TEST_DAGC: u8 = 0x6F;

/// Last register included in a dump.
pub const LAST_CONFIG_REGISTER: u8 = 0x4F;

// RegIrqFlags1
pub const IRQ1_MODE_READY: u8 = 0x80;
pub const IRQ1_SYNC_ADDRESS_MATCH: u8 = 0x01;

// RegIrqFlags2
pub const IRQ2_FIFO_FULL: u8 = 0x80;
pub const IRQ2_FIFO_NOT_EMPTY: u8 = 0x40;
pub const IRQ2_FIFO_LEVEL: u8 = 0x20;
pub const IRQ2_FIFO_OVERRUN: u8 = 0x10;
pub const IRQ2_PACKET_SENT: u8 = 0x08;

const RESTART_RX: u8 = 0x04;

/// Operating modes, bits 4..2 of RegOpMode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Sleep = 0,
    Standby = 1,
    FrequencySynth = 2,
    Transmit = 3,
    Receive = 4,
}

/// Receive filter bandwidth in Hz.
pub const CHANNEL_BANDWIDTH: u32 = 250_000;

const DCC_FREQ_RX: u8 = 2;
const DCC_FREQ_AFC: u8 = 4;

const QUIET_POLLS: usize = 64;

/// Signal strength in dBm from RegRssiValue.
pub fn rssi_dbm(raw: u8) -> i32 {
    -i32::from(raw) / 2
}

/// RegBitrate value for `rate` bits/s, rounded up.
pub fn bitrate_register(rate: u32) -> u16 {
    FLAVOR.fxosc.div_ceil(rate) as u16
}

/// OOK receiver bandwidth for a mantissa code (0 = 16, 1 = 20, 2 = 24) and exponent.
pub fn rx_bandwidth(mant_code: u8, exp: u8) -> u32 {
    let mant = 16 + 4 * u32::from(mant_code);
    FLAVOR.fxosc / (mant << (exp + 3))
}

/// `RxBwMant << 3 | RxBwExp` closest to `bandwidth` Hz.
pub fn rx_bandwidth_bits(bandwidth: u32) -> u8 {
    let mut best = 0;
    let mut best_error = u32::MAX;
    for exp in 0..8u8 {
        for mant_code in 0..3u8 {
            let error = rx_bandwidth(mant_code, exp).abs_diff(bandwidth);
            if error < best_error {
                best = mant_code << 3 | exp;
                best_error = error;
            }
        }
    }
    best
}

/// `(register, value)` pairs written at open, before the carrier frequency.
pub fn config_writes() -> Vec<(u8, u8)> {
    let bitrate = bitrate_register(BIT_RATE);
    let bw = rx_bandwidth_bits(CHANNEL_BANDWIDTH);
    let mut writes = vec![
        (REG_OP_MODE, (Mode::Standby as u8) << 2),
        // Packet mode, OOK, no shaping
        (REG_DATA_MODUL, 0x08),
        (REG_BITRATE_MSB, (bitrate >> 8) as u8),
        (REG_BITRATE_LSB, bitrate as u8),
        (REG_FDEV_MSB, 0x00),
        (REG_FDEV_LSB, 0x00),
        // PA1 on, full power
        (REG_PA_LEVEL, 0x40 | 0x1F),
        (REG_LNA, 0x88),
        (REG_RX_BW, DCC_FREQ_RX << 5 | bw),
        (REG_AFC_BW, DCC_FREQ_AFC << 5 | bw),
        (REG_OOK_PEAK, 0x40),
        (REG_RSSI_THRESH, 0xE4),
        // DIO0 = SyncAddress in RX
        (REG_DIO_MAPPING1, 0x80),
        (REG_DIO_MAPPING2, 0x07),
        (REG_PREAMBLE_MSB, 0x00),
        (REG_PREAMBLE_LSB, 0x18),
        // Sync on, 4 sync bytes
        (REG_SYNC_CONFIG, 0x80 | 3 << 3),
        (REG_PACKET_CONFIG1, 0x00),
        (REG_PAYLOAD_LENGTH, 0x00),
        // TX starts on FIFO not empty, FifoLevel threshold
        (REG_FIFO_THRESH, 0x80 | FLAVOR.fifo_threshold as u8),
        // AutoRxRestart off
        (REG_PACKET_CONFIG2, 0x00),
        (REG_TEST_DAGC, 0x30),
    ];
    for (i, value) in [0xFF, 0x00, 0xFF, 0x00].into_iter().enumerate() {
        writes.push((REG_SYNC_VALUE1 + i as u8, value));
    }
    writes
}

/// RFM69HCW on an SPI port, with an optional DIO0 interrupt line.
pub struct Rfm69<S: SpiPort, P: InterruptPin = NoPin> {
    spi: S,
    irq: Option<P>,
    rssi: i32,
    stats: RadioStats,
    closed: bool,
}

impl<S: SpiPort> Rfm69<S, NoPin> {
    /// Open without an interrupt line; sync matches are detected by polling RegIrqFlags1.
    pub async fn open_polled(spi: S, frequency: u32) -> Result<Self, MdtError> {
        Self::open_with(spi, None, frequency).await
    }
}

impl<S: SpiPort, P: InterruptPin> Rfm69<S, P> {
    pub async fn open(spi: S, irq: P, frequency: u32) -> Result<Self, MdtError> {
        Self::open_with(spi, Some(irq), frequency).await
    }

    async fn open_with(spi: S, irq: Option<P>, frequency: u32) -> Result<Self, MdtError> {
        let mut radio = Self {
            spi,
            irq,
            rssi: NO_SIGNAL_DBM,
            stats: RadioStats::default(),
            closed: false,
        };
        let version = u16::from(radio.read_register(REG_VERSION)?);
        if version != FLAVOR.version {
            return Err(MdtError::HardwareVersionMismatch {
                expected: FLAVOR.version,
                actual: version,
            });
        }
        for (addr, value) in config_writes() {
            radio.write_register(addr, value)?;
        }
        radio.set_frequency(frequency)?;
        info!(frequency, polled = radio.irq.is_none(), "RFM69 ready");
        Ok(radio)
    }

    pub fn read_register(&mut self, addr: u8) -> Result<u8, MdtError> {
        let mut buf = [addr & 0x7F | FLAVOR.read_flag, 0];
        self.spi.transfer("read register", &mut buf)?;
        Ok(buf[1])
    }

    pub fn write_register(&mut self, addr: u8, value: u8) -> Result<(), MdtError> {
        trace!(addr = format_args!("{addr:#04x}"), value = format_args!("{value:#04x}"), "RFM69 write");
        let mut buf = [addr | FLAVOR.write_flag, value];
        self.spi.transfer("write register", &mut buf)
    }

    fn read_burst(&mut self, addr: u8, n: usize) -> Result<Vec<u8>, MdtError> {
        let mut buf = vec![0u8; n + 1];
        buf[0] = addr & 0x7F | FLAVOR.read_flag;
        self.spi.transfer("read burst", &mut buf)?;
        buf.remove(0);
        Ok(buf)
    }

    fn write_burst(&mut self, addr: u8, data: &[u8]) -> Result<(), MdtError> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(addr | FLAVOR.write_flag);
        buf.extend_from_slice(data);
        self.spi.transfer("write burst", &mut buf)
    }

    /// Switch operating mode and spin until ModeReady.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), MdtError> {
        let op_mode = self.read_register(REG_OP_MODE)?;
        self.write_register(REG_OP_MODE, op_mode & 0xE3 | (mode as u8) << 2)?;
        for _ in 0..MODE_SPIN_LIMIT {
            if self.read_register(REG_IRQ_FLAGS1)? & IRQ1_MODE_READY != 0 {
                return Ok(());
            }
        }
        Err(MdtError::ModeChangeTimeout {
            target: format!("{mode:?}"),
        })
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), MdtError> {
        let fifo = FLAVOR.fifo_size;
        let threshold = FLAVOR.fifo_threshold;
        let byte_time = byte_duration(BIT_RATE);

        if frame.len() <= fifo {
            self.write_burst(REG_FIFO, frame)?;
            self.set_mode(Mode::Transmit)?;
            return self.wait_fifo_drained(frame.len()).await;
        }

        self.set_mode(Mode::Transmit)?;
        self.write_burst(REG_FIFO, &frame[..fifo])?;
        sleep(byte_time * (fifo / 4) as u32).await;
        let mut sent = fifo;
        let mut stalls = 0;
        while sent < frame.len() {
            let flags = self.read_register(REG_IRQ_FLAGS2)?;
            if flags & IRQ2_FIFO_NOT_EMPTY == 0 {
                return Err(MdtError::TxFifoUnderflow);
            }
            if flags & IRQ2_FIFO_LEVEL == 0 {
                let n = (frame.len() - sent).min(fifo - threshold);
                self.write_burst(REG_FIFO, &frame[sent..sent + n])?;
                sent += n;
                stalls = 0;
            } else {
                stalls += 1;
                if stalls > MODE_SPIN_LIMIT {
                    return Err(MdtError::ModeChangeTimeout {
                        target: "tx refill".to_string(),
                    });
                }
                sleep(byte_time * 4).await;
            }
        }
        self.wait_fifo_drained(fifo).await
    }

    async fn wait_fifo_drained(&mut self, pending: usize) -> Result<(), MdtError> {
        let byte_time = byte_duration(BIT_RATE);
        let deadline = Instant::now() + transfer_budget(pending);
        while self.read_register(REG_IRQ_FLAGS2)? & IRQ2_FIFO_NOT_EMPTY != 0 {
            if Instant::now() >= deadline {
                return Err(MdtError::ModeChangeTimeout {
                    target: "fifo drained".to_string(),
                });
            }
            sleep(byte_time * 4).await;
        }
        // Last byte is still in the shift register.
        sleep(byte_time * 2).await;
        Ok(())
    }

    async fn poll_sync(&mut self, timeout: Duration) -> Result<bool, MdtError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_register(REG_IRQ_FLAGS1)? & IRQ1_SYNC_ADDRESS_MATCH != 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(byte_duration(BIT_RATE) * 4).await;
        }
    }

    async fn drain_rx(&mut self) -> Result<Vec<u8>, MdtError> {
        let byte_time = byte_duration(BIT_RATE);
        let mut packet = Vec::new();
        let mut quiet = 0;
        loop {
            let flags = self.read_register(REG_IRQ_FLAGS2)?;
            if flags & IRQ2_FIFO_OVERRUN != 0 {
                self.stats.rx_overflows += 1;
                // Writing the flag clears the FIFO.
                self.write_register(REG_IRQ_FLAGS2, IRQ2_FIFO_OVERRUN)?;
                let config = self.read_register(REG_PACKET_CONFIG2)?;
                self.write_register(REG_PACKET_CONFIG2, config | RESTART_RX)?;
                if packet.is_empty() {
                    return Err(MdtError::RxFifoOverflow);
                }
                warn!(bytes = packet.len(), "RX FIFO overrun, keeping partial frame");
                return Ok(packet);
            }
            if flags & IRQ2_FIFO_NOT_EMPTY == 0 {
                quiet += 1;
                if quiet > QUIET_POLLS {
                    debug!(bytes = packet.len(), "no terminator before the line went quiet");
                    return Ok(packet);
                }
                sleep(byte_time).await;
                continue;
            }
            quiet = 0;
            let b = self.read_register(REG_FIFO)?;
            if b == 0 {
                return Ok(packet);
            }
            packet.push(b);
            if packet.len() > FLAVOR.max_packet_size {
                warn!(bytes = packet.len(), "frame exceeds maximum size, truncating");
                return Ok(packet);
            }
        }
    }
}

impl<S: SpiPort, P: InterruptPin> RadioOps for Rfm69<S, P> {
    fn flavor(&self) -> &'static Flavor {
        &FLAVOR
    }

    fn frequency(&mut self) -> Result<u32, MdtError> {
        let regs = self.read_burst(REG_FRF_MSB, 3)?;
        Ok(registers_to_frequency(&FLAVOR, [regs[0], regs[1], regs[2]]))
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), MdtError> {
        self.set_mode(Mode::Standby)?;
        self.write_burst(REG_FRF_MSB, &frequency_to_registers(&FLAVOR, hz))
    }

    fn last_rssi(&self) -> i32 {
        self.rssi
    }

    fn statistics(&self) -> RadioStats {
        self.stats
    }

    fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>, MdtError> {
        let values = self.read_burst(REG_OP_MODE, usize::from(LAST_CONFIG_REGISTER))?;
        Ok((REG_OP_MODE..).zip(values).collect())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), MdtError> {
        let max = FLAVOR.max_packet_size;
        if data.len() > max {
            return Err(MdtError::PacketTooLarge { n: data.len(), max });
        }
        let mut frame = data.to_vec();
        frame.resize(data.len() + FLAVOR.terminator_len, 0);
        debug!(frame = hex::encode(data), "RFM69 send");

        self.set_mode(Mode::Standby)?;
        let result = self.transmit(&frame).await;
        if matches!(result, Err(MdtError::TxFifoUnderflow)) {
            self.stats.tx_underflows += 1;
        }
        self.set_mode(Mode::Standby)?;
        result?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u32;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<(Vec<u8>, i32), MdtError> {
        self.set_mode(Mode::Receive)?;
        let started = match self.irq.as_mut() {
            Some(pin) => pin.await_rising_edge(timeout).await?,
            None => self.poll_sync(timeout).await?,
        };
        if !started {
            self.set_mode(Mode::Standby)?;
            return Ok((Vec::new(), self.rssi));
        }
        self.rssi = rssi_dbm(self.read_register(REG_RSSI_VALUE)?);
        let packet = self.drain_rx().await;
        self.set_mode(Mode::Standby)?;
        let packet = packet?;
        if !packet.is_empty() {
            self.stats.packets_received += 1;
            self.stats.bytes_received += packet.len() as u32;
            debug!(frame = hex::encode(&packet), rssi = self.rssi, "RFM69 receive");
        }
        Ok((packet, self.rssi))
    }

    fn close(&mut self) -> Result<(), MdtError> {
        self.closed = true;
        self.set_mode(Mode::Sleep)
    }
}

impl<S: SpiPort, P: InterruptPin> Drop for Rfm69<S, P> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.set_mode(Mode::Sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_bitrate() {
        assert_eq!(bitrate_register(BIT_RATE), 0x07A2);
    }

    #[test]
    fn pump_bandwidth() {
        assert_eq!(rx_bandwidth_bits(CHANNEL_BANDWIDTH), 0x00);
        assert_eq!(rx_bandwidth(0, 0), 250_000);
        let writes = config_writes();
        assert!(writes.contains(&(REG_RX_BW, 0x40)));
        assert!(writes.contains(&(REG_AFC_BW, 0x80)));
        assert!(writes.contains(&(REG_SYNC_CONFIG, 0x98)));
        assert!(writes.contains(&(REG_FIFO_THRESH, 0x94)));
        assert!(writes.contains(&(REG_PA_LEVEL, 0x5F)));
    }

    #[test]
    fn rssi_conversion() {
        assert_eq!(rssi_dbm(0), 0);
        assert_eq!(rssi_dbm(180), -90);
    }
}
