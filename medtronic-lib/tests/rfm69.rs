//! RFM69HCW driver against a register-level model of the chip.

mod common;
use common::*;

use embedded_hal::spi::{ErrorKind, ErrorType, Operation, SpiDevice};
use medtronic_lib::radio::rfm69::{
    IRQ1_MODE_READY, IRQ1_SYNC_ADDRESS_MATCH, IRQ2_FIFO_LEVEL, IRQ2_FIFO_NOT_EMPTY, Mode, REG_FIFO, REG_FRF_MSB,
    REG_IRQ_FLAGS1, REG_IRQ_FLAGS2, REG_OP_MODE, REG_RSSI_VALUE, REG_VERSION, Rfm69, config_writes,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Bytes the modem takes out of the TX FIFO between two status reads.
const DRAIN_PER_POLL: usize = 20;

struct Chip {
    regs: [u8; 0x80],
    tx: Vec<u8>,
    tx_pending: usize,
    rx: VecDeque<u8>,
}

impl Chip {
    fn new() -> Self {
        let mut regs = [0; 0x80];
        regs[usize::from(REG_VERSION)] = 0x24;
        regs[usize::from(REG_RSSI_VALUE)] = 84;
        Self {
            regs,
            tx: Vec::new(),
            tx_pending: 0,
            rx: VecDeque::new(),
        }
    }

    fn mode(&self) -> u8 {
        self.regs[usize::from(REG_OP_MODE)] >> 2 & 0x07
    }

    fn read(&mut self, addr: u8) -> u8 {
        let receiving = self.mode() == Mode::Receive as u8 && !self.rx.is_empty();
        match addr {
            REG_FIFO => self.rx.pop_front().unwrap_or(0),
            REG_IRQ_FLAGS1 => IRQ1_MODE_READY | if receiving { IRQ1_SYNC_ADDRESS_MATCH } else { 0 },
            REG_IRQ_FLAGS2 => {
                let mut flags = 0;
                if receiving || self.tx_pending > 0 {
                    flags |= IRQ2_FIFO_NOT_EMPTY;
                }
                if self.tx_pending > 20 {
                    flags |= IRQ2_FIFO_LEVEL;
                }
                if self.mode() == Mode::Transmit as u8 {
                    self.tx_pending = self.tx_pending.saturating_sub(DRAIN_PER_POLL);
                }
                flags
            }
            _ => self.regs[usize::from(addr)],
        }
    }

    fn exchange(&mut self, buf: &mut [u8]) {
        let header = buf[0];
        let addr = header & 0x7F;
        if header & 0x80 == 0 {
            for (i, b) in buf[1..].iter_mut().enumerate() {
                let reg = if addr == REG_FIFO { addr } else { addr + i as u8 };
                *b = self.read(reg);
            }
        } else if addr == REG_FIFO {
            self.tx.extend_from_slice(&buf[1..]);
            self.tx_pending += buf.len() - 1;
        } else {
            for (i, &value) in buf[1..].iter().enumerate() {
                self.regs[usize::from(addr) + i] = value;
            }
        }
    }
}

struct FakeSpi(Rc<RefCell<Chip>>);

impl ErrorType for FakeSpi {
    type Error = ErrorKind;
}

impl SpiDevice for FakeSpi {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        let mut chip = self.0.borrow_mut();
        for op in operations.iter_mut() {
            match op {
                Operation::TransferInPlace(buf) => chip.exchange(buf),
                _ => return Err(ErrorKind::Other),
            }
        }
        Ok(())
    }
}

fn chip() -> (Rc<RefCell<Chip>>, FakeSpi) {
    let chip = Rc::new(RefCell::new(Chip::new()));
    (chip.clone(), FakeSpi(chip))
}

#[tokio::test(start_paused = true)]
async fn open_writes_configuration() {
    let (chip, spi) = chip();
    let mut radio = Rfm69::open_polled(spi, 916_600_000).await.unwrap();
    {
        let chip = chip.borrow();
        for (addr, value) in config_writes().into_iter().skip(1) {
            assert_eq!(chip.regs[usize::from(addr)], value, "register {addr:#04x}");
        }
        let frf = usize::from(REG_FRF_MSB);
        assert_eq!(chip.regs[frf..frf + 3], [0xE5, 0x26, 0x66]);
        assert_eq!(chip.mode(), Mode::Standby as u8);
    }
    assert_eq!(radio.frequency().unwrap(), 916_599_975);
}

#[tokio::test(start_paused = true)]
async fn rejects_other_chips() {
    let (chip, spi) = chip();
    chip.borrow_mut().regs[usize::from(REG_VERSION)] = 0x22;
    let err = Rfm69::open_polled(spi, 916_600_000).await.err().unwrap();
    assert_eq!(
        err,
        MdtError::HardwareVersionMismatch {
            expected: 0x0024,
            actual: 0x0022
        }
    );
}

#[tokio::test(start_paused = true)]
async fn send_appends_one_terminator() {
    let (chip, spi) = chip();
    let mut radio = Rfm69::open_polled(spi, 916_600_000).await.unwrap();
    let encoded = packet::encode(&[0xA7, 0x12, 0x89, 0x86, 0x8D, 0x00]);
    radio.send(&encoded).await.unwrap();

    let chip = chip.borrow();
    let mut on_air = encoded.clone();
    on_air.push(0);
    assert_eq!(chip.tx, on_air);
    assert_eq!(chip.mode(), Mode::Standby as u8);
}

#[tokio::test(start_paused = true)]
async fn long_frames_are_refilled() {
    let (chip, spi) = chip();
    let mut radio = Rfm69::open_polled(spi, 916_600_000).await.unwrap();
    let data: Vec<u8> = (1..=150).collect();
    radio.send(&data).await.unwrap();
    let tx = chip.borrow().tx.clone();
    assert_eq!(tx.len(), 151);
    assert_eq!(tx[..150], data[..]);
    assert_eq!(radio.statistics().packets_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn receive_reads_until_terminator() {
    let (chip, spi) = chip();
    let mut radio = Rfm69::open_polled(spi, 916_600_000).await.unwrap();
    let encoded = packet::encode(&[0xA7, 0x12, 0x89, 0x86, 0x72, 0x03, 0x00, 0x00, 0x96]);
    chip.borrow_mut().rx.extend(encoded.iter().copied().chain([0x00]));

    let (frame, rssi) = radio.receive(Duration::from_millis(500)).await.unwrap();
    assert_eq!(frame, encoded);
    assert_eq!(rssi, -42);
    assert_eq!(radio.statistics().bytes_received, encoded.len() as u32);
}

#[tokio::test(start_paused = true)]
async fn receive_timeout_returns_empty() {
    let (_chip, spi) = chip();
    let mut radio = Rfm69::open_polled(spi, 916_600_000).await.unwrap();
    let (frame, _) = radio.receive(Duration::from_millis(50)).await.unwrap();
    assert!(frame.is_empty());
}
