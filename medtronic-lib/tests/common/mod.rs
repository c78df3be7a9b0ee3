//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use chrono::{NaiveDate, NaiveDateTime};
#[allow(unused_imports)]
pub use medtronic_lib::command::{DeviceId, Opcode};
#[allow(unused_imports)]
pub use medtronic_lib::config::SessionConfig;
#[allow(unused_imports)]
pub use medtronic_lib::crc::crc16;
#[allow(unused_imports)]
pub use medtronic_lib::error::{MdtError, PartialDecode};
#[allow(unused_imports)]
pub use medtronic_lib::packet;
#[allow(unused_imports)]
pub use medtronic_lib::radio::{Flavor, NO_SIGNAL_DBM, RadioOps, RadioStats, cc1101};
#[allow(unused_imports)]
pub use medtronic_lib::session::Session;
#[allow(unused_imports)]
pub use medtronic_lib::time::PumpTimestamp;
#[allow(unused_imports)]
pub use medtronic_lib::units::{Family, Insulin};
#[allow(unused_imports)]
pub use std::collections::VecDeque;
#[allow(unused_imports)]
pub use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// Route library logs to the test harness; `RUST_LOG=debug` shows wire frames.
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pump used throughout the tests; every frame to or from it starts with `A7 12 89 86`.
#[allow(dead_code)]
pub const PUMP: &str = "128986";

/// RSSI the scripted radio reports for queued replies.
#[allow(dead_code)]
pub const REPLY_RSSI: i32 = -60;

/// One scripted outcome of a `receive` call.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Reply {
    /// Decoded frame; CRC and line code are applied before delivery.
    Frame(Vec<u8>),
    /// Bytes delivered exactly as given.
    Raw(Vec<u8>),
    /// Nothing arrives before the timeout.
    Silence,
}

/// Answers the last sent frame at a given carrier frequency with `(frame, rssi)`.
type Responder = Box<dyn FnMut(u32, &[u8]) -> Option<(Vec<u8>, i32)>>;

/// A radio that records what the host sends and plays back scripted replies.
#[allow(dead_code)]
pub struct ScriptedRadio {
    replies: VecDeque<Reply>,
    responder: Option<Responder>,
    /// Decoded frames, in the order they were sent.
    pub sent: Vec<Vec<u8>>,
    pub frequency: u32,
    pub rssi: i32,
    pub closed: bool,
}

#[allow(dead_code)]
impl ScriptedRadio {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            responder: None,
            sent: Vec::new(),
            frequency: 0,
            rssi: NO_SIGNAL_DBM,
            closed: false,
        }
    }

    /// A radio whose replies are computed from the carrier and the last sent frame.
    pub fn responding(responder: impl FnMut(u32, &[u8]) -> Option<(Vec<u8>, i32)> + 'static) -> Self {
        let mut radio = Self::new([]);
        radio.responder = Some(Box::new(responder));
        radio
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    pub fn pending(&self) -> usize {
        self.replies.len()
    }
}

impl RadioOps for ScriptedRadio {
    fn flavor(&self) -> &'static Flavor {
        &cc1101::FLAVOR
    }

    fn frequency(&mut self) -> Result<u32, MdtError> {
        Ok(self.frequency)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), MdtError> {
        self.frequency = hz;
        Ok(())
    }

    fn last_rssi(&self) -> i32 {
        self.rssi
    }

    fn statistics(&self) -> RadioStats {
        RadioStats::default()
    }

    fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>, MdtError> {
        Ok(Vec::new())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), MdtError> {
        self.sent.push(packet::decode(data).expect("host frames always decode"));
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<(Vec<u8>, i32), MdtError> {
        if let Some(responder) = self.responder.as_mut() {
            let last = self.sent.last().cloned().unwrap_or_default();
            if let Some((frame, rssi)) = responder(self.frequency, &last) {
                self.rssi = rssi;
                return Ok((packet::encode(&frame), rssi));
            }
            sleep(timeout).await;
            return Ok((Vec::new(), self.rssi));
        }
        match self.replies.pop_front() {
            Some(Reply::Frame(frame)) => {
                self.rssi = REPLY_RSSI;
                Ok((packet::encode(&frame), REPLY_RSSI))
            }
            Some(Reply::Raw(bytes)) => Ok((bytes, self.rssi)),
            Some(Reply::Silence) | None => {
                sleep(timeout).await;
                Ok((Vec::new(), self.rssi))
            }
        }
    }

    fn close(&mut self) -> Result<(), MdtError> {
        self.closed = true;
        Ok(())
    }
}

#[allow(dead_code)]
pub fn pump_id() -> DeviceId {
    PUMP.parse().unwrap()
}

/// Session with default timing against [`PUMP`].
#[allow(dead_code)]
pub fn session(replies: impl IntoIterator<Item = Reply>) -> Session<ScriptedRadio> {
    Session::new(ScriptedRadio::new(replies), SessionConfig::new(pump_id())).unwrap()
}

/// Decoded reply frame from [`PUMP`]: `A7 12 89 86 opcode payload`.
#[allow(dead_code)]
pub fn pump_reply(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xA7, 0x12, 0x89, 0x86, opcode.into()];
    frame.extend_from_slice(payload);
    frame
}

#[allow(dead_code)]
pub fn frame(opcode: Opcode, payload: &[u8]) -> Reply {
    Reply::Frame(pump_reply(opcode, payload))
}

#[allow(dead_code)]
pub fn ack() -> Reply {
    frame(Opcode::Ack, &[0x00])
}

/// Model reply for a pump of the given family, e.g. `"522"`.
#[allow(dead_code)]
pub fn model(name: &str) -> Reply {
    let mut payload = vec![name.len() as u8];
    payload.extend_from_slice(name.as_bytes());
    frame(Opcode::GetModel, &payload)
}

/// History timestamp on 2016-06-06.
#[allow(dead_code)]
pub fn pump_time(hour: u8, minute: u8, second: u8) -> [u8; 5] {
    PumpTimestamp::new()
        .with_second(second)
        .with_month_hi(1)
        .with_minute(minute)
        .with_month_lo(2)
        .with_hour(hour)
        .with_day(6)
        .with_year(16)
        .into_bytes()
}

#[allow(dead_code)]
pub fn on_test_day(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2016, 6, 6)
        .unwrap()
        .and_hms_opt(hour, minute, second)
        .unwrap()
}

/// Seven-byte history record `kind value timestamp`.
#[allow(dead_code)]
pub fn base_record(kind: u8, value: u8, time: [u8; 5]) -> Vec<u8> {
    let mut record = vec![kind, value];
    record.extend_from_slice(&time);
    record
}

/// Zero-pad `payload` to 1022 bytes and append its big-endian CRC-16.
#[allow(dead_code)]
pub fn sealed_page(payload: &[u8]) -> Vec<u8> {
    let mut page = payload.to_vec();
    page.resize(1022, 0);
    let crc = crc16(&page);
    page.extend_from_slice(&crc.to_be_bytes());
    page
}

/// Split `body` into reply frames of 64 data bytes, numbered from 1, the
/// last one flagged.
#[allow(dead_code)]
pub fn multi_frame(opcode: Opcode, body: &[u8]) -> Vec<Reply> {
    let chunks: Vec<&[u8]> = body.chunks(64).collect();
    let last = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut seq = (i + 1) as u8;
            if i + 1 == last {
                seq |= 0x80;
            }
            let mut payload = vec![seq];
            payload.extend_from_slice(chunk);
            frame(opcode, &payload)
        })
        .collect()
}
