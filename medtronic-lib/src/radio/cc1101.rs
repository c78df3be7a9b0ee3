//! TI CC1101 driver.
//!
//! Receive runs in infinite-length packet mode and stops at the first zero byte.
//! Transmit switches to fixed-length mode for the duration of one frame so the
//! chip drops back to IDLE on its own once the last byte is on the air.

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
    name: "CC1101",
    fxosc: 24_000_000,
    freq_shift: 16,
    fifo_size: 64,
    fifo_threshold: 20,
    max_packet_size: 150,
    terminator_len: 2,
    read_flag: 0x80,
    write_flag: 0x00,
    burst_flag: 0x40,
    mode_ready: ModeReady::StateRegister,
    version: 0x0014,
};

// Configuration registers
pub const IOCFG2: u8 = 0x00;
pub const IOCFG1: u8 = 0x01;
pub const IOCFG0: u8 = 0x02;
pub const FIFOTHR: u8 = 0x03;
pub const SYNC1: u8 = 0x04;
pub const SYNC0: u8 = 0x05;
pub const PKTLEN: u8 = 0x06;
pub const PKTCTRL1: u8 = 0x07;
pub const PKTCTRL0: u8 = 0x08;
pub const ADDR: u8 = 0x09;
pub const CHANNR: u8 = 0x0A;
pub const FSCTRL1: u8 = 0x0B;
pub const FSCTRL0: u8 = 0x0C;
pub const FREQ2: u8 = 0x0D;
pub const FREQ1: u8 = 0x0E;
pub const FREQ0: u8 = 0x0F;
pub const MDMCFG4: u8 = 0x10;
pub const MDMCFG3: u8 = 0x11;
pub const MDMCFG2: u8 = 0x12;
pub const MDMCFG1: u8 = 0x13;
pub const MDMCFG0: u8 = 0x14;
pub const DEVIATN: u8 = 0x15;
pub const MCSM2: u8 = 0x16;
pub const MCSM1: u8 = 0x17;
pub const MCSM0: u8 = 0x18;
pub const FOCCFG: u8 = 0x19;
pub const BSCFG: u8 = 0x1A;
pub const AGCCTRL2: u8 = 0x1B;
pub const AGCCTRL1: u8 = 0x1C;
pub const AGCCTRL0: u8 = 0x1D;
pub const WOREVT1: u8 = 0x1E;
pub const WOREVT0: u8 = 0x1F;
pub const WORCTRL: u8 = 0x20;
pub const FREND1: u8 = 0x21;
pub const FREND0: u8 = 0x22;
pub const FSCAL3: u8 = 0x23;
pub const FSCAL2: u8 = 0x24;
pub const FSCAL1: u8 = 0x25;
pub const FSCAL0: u8 = 0x26;
pub const RCCTRL1: u8 = 0x27;
pub const RCCTRL0: u8 = 0x28;
pub const FSTEST: u8 = 0x29;
pub const PTEST: u8 = 0x2A;
pub const AGCTEST: u8 = 0x2B;
pub const TEST2: u8 = 0x2C;
pub const TEST1: u8 = 0x2D;
pub const TEST0: u8 = 0x2E;
pub const CONFIG_LEN: usize = 0x2F;

// Command strobes
pub const SRES: u8 = 0x30;
pub const SFSTXON: u8 = 0x31;
pub const SCAL: u8 = 0x33;
pub const SRX: u8 = 0x34;
pub const STX: u8 = 0x35;
pub const SIDLE: u8 = 0x36;
pub const SFRX: u8 = 0x3A;
pub const SFTX: u8 = 0x3B;
pub const SNOP: u8 = 0x3D;

// Status registers (read with the burst bit set)
pub const PARTNUM: u8 = 0x30;
pub const VERSION: u8 = 0x31;
pub const RSSI: u8 = 0x34;
pub const MARCSTATE: u8 = 0x35;
pub const TXBYTES: u8 = 0x3A;
pub const RXBYTES: u8 = 0x3B;

pub const PATABLE: u8 = 0x3E;
pub const FIFO: u8 = 0x3F;

// MARCSTATE values
pub const MARC_IDLE: u8 = 0x01;
pub const MARC_RX: u8 = 0x0D;
pub const MARC_RXFIFO_OVERFLOW: u8 = 0x11;
pub const MARC_TX: u8 = 0x13;
pub const MARC_TXFIFO_UNDERFLOW: u8 = 0x16;

/// Overflow/underflow flag in RXBYTES/TXBYTES.
pub const FIFO_ERROR: u8 = 0x80;

const PKT_FIXED_LENGTH: u8 = 0x00;
const PKT_INFINITE_LENGTH: u8 = 0x02;

/// Index 0 is used for OOK "off", index 1 for "on".
pub const PA_TABLE: [u8; 2] = [0x00, 0xC0];

/// Receive filter bandwidth in Hz.
pub const CHANNEL_BANDWIDTH: u32 = 300_000;

/// Byte times without FIFO progress before a frame is considered finished.
const QUIET_POLLS: usize = 64;

/// Signal strength in dBm from the RSSI status register.
pub fn rssi_dbm(raw: u8) -> i32 {
    i32::from(raw as i8) / 2 - 74
}

/// `(DRATE_E, DRATE_M)` for `rate` bits/s.
///
/// `rate = (256 + M) * 2^E * FXOSC / 2^28`.
pub fn data_rate_registers(rate: u32) -> (u8, u8) {
    let fxosc = u64::from(FLAVOR.fxosc);
    let target = u64::from(rate) << 28;
    let mut e = 0;
    while e < 15 && (256u64 << (e + 1)) * fxosc <= target {
        e += 1;
    }
    let step = fxosc << e;
    let m = ((target + step / 2) / step).saturating_sub(256);
    if m > 255 { (e as u8 + 1, 0) } else { (e as u8, m as u8) }
}

/// Bit rate produced by a `(DRATE_E, DRATE_M)` pair.
pub fn data_rate(e: u8, m: u8) -> u32 {
    (((256 + u64::from(m)) << e) * u64::from(FLAVOR.fxosc) >> 28) as u32
}

/// `(CHANBW_E, CHANBW_M)` closest to `bandwidth` Hz.
///
/// `BW = FXOSC / (8 * (4 + M) * 2^E)`.
pub fn channel_bandwidth_registers(bandwidth: u32) -> (u8, u8) {
    let mut best = (0, 0);
    let mut best_error = u32::MAX;
    for e in 0..4u8 {
        for m in 0..4u8 {
            let error = channel_bandwidth(e, m).abs_diff(bandwidth);
            if error < best_error {
                best = (e, m);
                best_error = error;
            }
        }
    }
    best
}

pub fn channel_bandwidth(e: u8, m: u8) -> u32 {
    FLAVOR.fxosc / (8 * (4 + u32::from(m)) << e)
}

/// Register image written at open, addresses `0x00..CONFIG_LEN`.
///
/// The frequency registers are left zero here and programmed separately.
pub fn config_block() -> [u8; CONFIG_LEN] {
    let (drate_e, drate_m) = data_rate_registers(BIT_RATE);
    let (bw_e, bw_m) = channel_bandwidth_registers(CHANNEL_BANDWIDTH);
    let values = [
        (IOCFG2, 0x2E),
        (IOCFG1, 0x2E),
        // GDO0 asserts on sync word
        (IOCFG0, 0x06),
        (FIFOTHR, 0x07),
        (SYNC1, 0xFF),
        (SYNC0, 0x00),
        (PKTLEN, 0xFF),
        (PKTCTRL1, 0x00),
        (PKTCTRL0, PKT_INFINITE_LENGTH),
        (ADDR, 0x00),
        (CHANNR, 0x00),
        (FSCTRL1, 0x06),
        (FSCTRL0, 0x00),
        (MDMCFG4, bw_e << 6 | bw_m << 4 | drate_e),
        (MDMCFG3, drate_m),
        // DC filter on, ASK/OOK, 30/32 sync bits with carrier sense
        (MDMCFG2, 0x37),
        // FEC off, 24 preamble bytes
        (MDMCFG1, 0x72),
        (MDMCFG0, 0xF8),
        (DEVIATN, 0x15),
        (MCSM2, 0x07),
        // CCA unless receiving, RX and TX both return to IDLE
        (MCSM1, 0x30),
        // Calibrate when leaving IDLE
        (MCSM0, 0x18),
        (FOCCFG, 0x17),
        (BSCFG, 0x6C),
        (AGCCTRL2, 0x07),
        (AGCCTRL1, 0x00),
        (AGCCTRL0, 0x91),
        (WOREVT1, 0x87),
        (WOREVT0, 0x6B),
        (WORCTRL, 0xF8),
        (FREND1, 0x56),
        (FREND0, 0x11),
        (FSCAL3, 0xE9),
        (FSCAL2, 0x2A),
        (FSCAL1, 0x00),
        (FSCAL0, 0x1F),
        (RCCTRL1, 0x41),
        (RCCTRL0, 0x00),
        (FSTEST, 0x59),
        (PTEST, 0x7F),
        (AGCTEST, 0x3F),
        (TEST2, 0x81),
        (TEST1, 0x35),
        (TEST0, 0x09),
    ];
    let mut block = [0u8; CONFIG_LEN];
    for (addr, value) in values {
        block[addr as usize] = value;
    }
    block
}

/// CC1101 on an SPI port, with an optional GDO0 interrupt line.
pub struct Cc1101<S: SpiPort, P: InterruptPin = NoPin> {
    spi: S,
    irq: Option<P>,
    rssi: i32,
    stats: RadioStats,
    closed: bool,
}

impl<S: SpiPort> Cc1101<S, NoPin> {
    /// Open without an interrupt line; packet starts are detected by polling RXBYTES.
    pub async fn open_polled(spi: S, frequency: u32) -> Result<Self, MdtError> {
        Self::open_with(spi, None, frequency).await
    }
}

impl<S: SpiPort, P: InterruptPin> Cc1101<S, P> {
    /// Reset, verify the chip version, and load the configuration.
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
        radio.strobe(SRES)?;
        sleep(Duration::from_millis(1)).await;
        radio.check_version()?;
        radio.write_burst(IOCFG2, &config_block())?;
        radio.write_burst(PATABLE, &PA_TABLE)?;
        radio.set_frequency(frequency)?;
        info!(frequency, polled = radio.irq.is_none(), "CC1101 ready");
        Ok(radio)
    }

    fn check_version(&mut self) -> Result<(), MdtError> {
        let partnum = self.read_status(PARTNUM)?;
        let version = self.read_status(VERSION)?;
        let actual = u16::from(partnum) << 8 | u16::from(version);
        if actual != FLAVOR.version {
            return Err(MdtError::HardwareVersionMismatch {
                expected: FLAVOR.version,
                actual,
            });
        }
        Ok(())
    }

    fn strobe(&mut self, command: u8) -> Result<u8, MdtError> {
        trace!(command = format_args!("{command:#04x}"), "CC1101 strobe");
        self.spi.transfer_byte("strobe", command)
    }

    pub fn read_register(&mut self, addr: u8) -> Result<u8, MdtError> {
        let mut buf = [addr | FLAVOR.read_flag, 0];
        self.spi.transfer("read register", &mut buf)?;
        Ok(buf[1])
    }

    /// Status registers share addresses with strobes and need the burst bit.
    pub fn read_status(&mut self, addr: u8) -> Result<u8, MdtError> {
        let mut buf = [addr | FLAVOR.read_flag | FLAVOR.burst_flag, 0];
        self.spi.transfer("read status", &mut buf)?;
        Ok(buf[1])
    }

    pub fn write_register(&mut self, addr: u8, value: u8) -> Result<(), MdtError> {
        let mut buf = [addr | FLAVOR.write_flag, value];
        self.spi.transfer("write register", &mut buf)
    }

    fn read_burst(&mut self, addr: u8, n: usize) -> Result<Vec<u8>, MdtError> {
        let mut buf = vec![0u8; n + 1];
        buf[0] = addr | FLAVOR.read_flag | FLAVOR.burst_flag;
        self.spi.transfer("read burst", &mut buf)?;
        buf.remove(0);
        Ok(buf)
    }

    fn write_burst(&mut self, addr: u8, data: &[u8]) -> Result<(), MdtError> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(addr | FLAVOR.write_flag | FLAVOR.burst_flag);
        buf.extend_from_slice(data);
        self.spi.transfer("write burst", &mut buf)
    }

    fn marc_state(&mut self) -> Result<u8, MdtError> {
        Ok(self.read_status(MARCSTATE)? & 0x1F)
    }

    /// Issue `command` and spin until MARCSTATE reports `target`.
    fn enter(&mut self, command: u8, target: u8, name: &str) -> Result<(), MdtError> {
        self.strobe(command)?;
        for _ in 0..MODE_SPIN_LIMIT {
            if self.marc_state()? == target {
                return Ok(());
            }
        }
        Err(MdtError::ModeChangeTimeout {
            target: name.to_string(),
        })
    }

    fn idle(&mut self) -> Result<(), MdtError> {
        self.enter(SIDLE, MARC_IDLE, "idle")
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), MdtError> {
        let fifo = FLAVOR.fifo_size;
        let threshold = FLAVOR.fifo_threshold;
        let byte_time = byte_duration(BIT_RATE);

        if frame.len() <= fifo {
            self.write_burst(FIFO, frame)?;
            self.strobe(STX)?;
            return self.wait_tx_done(frame.len()).await;
        }

        self.write_burst(FIFO, &frame[..fifo])?;
        self.strobe(STX)?;
        sleep(byte_time * (fifo / 4) as u32).await;
        let mut sent = fifo;
        let mut stalls = 0;
        while sent < frame.len() {
            let status = self.read_status(TXBYTES)?;
            if status & FIFO_ERROR != 0 {
                return Err(MdtError::TxFifoUnderflow);
            }
            let level = usize::from(status & 0x7F);
            if level <= threshold {
                let n = (frame.len() - sent).min(fifo - threshold);
                self.write_burst(FIFO, &frame[sent..sent + n])?;
                sent += n;
                stalls = 0;
            } else {
                stalls += 1;
                if stalls > MODE_SPIN_LIMIT {
                    return Err(MdtError::ModeChangeTimeout {
                        target: "tx refill".to_string(),
                    });
                }
                sleep(byte_time * (level - threshold) as u32).await;
            }
        }
        self.wait_tx_done(fifo).await
    }

    /// Wait for the chip to leave TX after the last byte went out.
    async fn wait_tx_done(&mut self, pending: usize) -> Result<(), MdtError> {
        let deadline = Instant::now() + transfer_budget(pending);
        loop {
            match self.marc_state()? {
                MARC_IDLE => return Ok(()),
                MARC_TXFIFO_UNDERFLOW => return Err(MdtError::TxFifoUnderflow),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(MdtError::ModeChangeTimeout {
                    target: "idle after tx".to_string(),
                });
            }
            let queued = u32::from(self.read_status(TXBYTES)? & 0x7F);
            sleep(byte_duration(BIT_RATE) * queued.max(1)).await;
        }
    }

    async fn poll_rx_start(&mut self, timeout: Duration) -> Result<bool, MdtError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_status(RXBYTES)? != 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(byte_duration(BIT_RATE) * 4).await;
        }
    }

    /// Read bytes until the zero terminator, a quiet FIFO, or the size limit.
    async fn drain_rx(&mut self) -> Result<Vec<u8>, MdtError> {
        let byte_time = byte_duration(BIT_RATE);
        let mut packet = Vec::new();
        let mut quiet = 0;
        loop {
            let status = self.read_status(RXBYTES)?;
            if status & FIFO_ERROR != 0 {
                self.stats.rx_overflows += 1;
                self.strobe(SIDLE)?;
                self.strobe(SFRX)?;
                if packet.is_empty() {
                    return Err(MdtError::RxFifoOverflow);
                }
                warn!(bytes = packet.len(), "RX FIFO overflow, keeping partial frame");
                return Ok(packet);
            }
            // The newest byte may still be in flight; leave it unless the line went quiet.
            let take = match usize::from(status & 0x7F) {
                0 => 0,
                1 if quiet < 2 => 0,
                1 => 1,
                n => n - 1,
            };
            if take == 0 {
                quiet += 1;
                if quiet > QUIET_POLLS {
                    debug!(bytes = packet.len(), "no terminator before the line went quiet");
                    return Ok(packet);
                }
                sleep(byte_time).await;
                continue;
            }
            quiet = 0;
            for b in self.read_burst(FIFO, take)? {
                if b == 0 {
                    return Ok(packet);
                }
                packet.push(b);
            }
            if packet.len() > FLAVOR.max_packet_size {
                warn!(bytes = packet.len(), "frame exceeds maximum size, truncating");
                return Ok(packet);
            }
        }
    }
}

impl<S: SpiPort, P: InterruptPin> RadioOps for Cc1101<S, P> {
    fn flavor(&self) -> &'static Flavor {
        &FLAVOR
    }

    fn frequency(&mut self) -> Result<u32, MdtError> {
        let regs = self.read_burst(FREQ2, 3)?;
        Ok(registers_to_frequency(&FLAVOR, [regs[0], regs[1], regs[2]]))
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), MdtError> {
        self.idle()?;
        self.write_burst(FREQ2, &frequency_to_registers(&FLAVOR, hz))
    }

    fn last_rssi(&self) -> i32 {
        self.rssi
    }

    fn statistics(&self) -> RadioStats {
        self.stats
    }

    fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>, MdtError> {
        let values = self.read_burst(IOCFG2, CONFIG_LEN)?;
        Ok((0u8..).zip(values).collect())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), MdtError> {
        let max = FLAVOR.max_packet_size;
        if data.len() > max {
            return Err(MdtError::PacketTooLarge { n: data.len(), max });
        }
        let mut frame = data.to_vec();
        frame.resize(data.len() + FLAVOR.terminator_len, 0);
        debug!(frame = hex::encode(data), "CC1101 send");

        self.idle()?;
        self.strobe(SFTX)?;
        self.write_register(PKTLEN, frame.len() as u8)?;
        self.write_register(PKTCTRL0, PKT_FIXED_LENGTH)?;
        let result = self.transmit(&frame).await;
        if matches!(result, Err(MdtError::TxFifoUnderflow)) {
            self.stats.tx_underflows += 1;
        }
        if result.is_err() {
            self.strobe(SIDLE)?;
            self.strobe(SFTX)?;
        }
        self.write_register(PKTCTRL0, PKT_INFINITE_LENGTH)?;
        result?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u32;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<(Vec<u8>, i32), MdtError> {
        self.enter(SRX, MARC_RX, "rx")?;
        let started = match self.irq.as_mut() {
            Some(pin) => pin.await_rising_edge(timeout).await?,
            None => self.poll_rx_start(timeout).await?,
        };
        if !started {
            self.idle()?;
            return Ok((Vec::new(), self.rssi));
        }
        self.rssi = rssi_dbm(self.read_status(RSSI)?);
        let packet = self.drain_rx().await;
        self.idle()?;
        self.strobe(SFRX)?;
        let packet = packet?;
        if !packet.is_empty() {
            self.stats.packets_received += 1;
            self.stats.bytes_received += packet.len() as u32;
            debug!(frame = hex::encode(&packet), rssi = self.rssi, "CC1101 receive");
        }
        Ok((packet, self.rssi))
    }

    fn close(&mut self) -> Result<(), MdtError> {
        self.closed = true;
        self.idle()
    }
}

impl<S: SpiPort, P: InterruptPin> Drop for Cc1101<S, P> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.strobe(SIDLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_data_rate() {
        assert_eq!(data_rate_registers(BIT_RATE), (9, 0x66));
        let rate = data_rate(9, 0x66);
        assert!(rate.abs_diff(BIT_RATE) < 50, "{rate}");
    }

    #[test]
    fn pump_channel_bandwidth() {
        assert_eq!(channel_bandwidth_registers(CHANNEL_BANDWIDTH), (1, 1));
        assert_eq!(channel_bandwidth(1, 1), 300_000);
    }

    #[test]
    fn modem_config_registers() {
        let block = config_block();
        assert_eq!(block[MDMCFG4 as usize], 0x59);
        assert_eq!(block[MDMCFG3 as usize], 0x66);
        assert_eq!(block[PKTCTRL0 as usize], PKT_INFINITE_LENGTH);
        assert_eq!(block[MCSM1 as usize], 0x30);
    }

    #[test]
    fn rssi_conversion() {
        assert_eq!(rssi_dbm(0x00), -74);
        assert_eq!(rssi_dbm(0x40), -42);
        assert_eq!(rssi_dbm(0x80), -138);
    }
}
