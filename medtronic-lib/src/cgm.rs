//! CGM (sensor) history pages.
//!
//! The sensor writes its page forward with the type byte last, so the page is
//! decoded back to front: the reversed stream reads type byte first and
//! newest record first. Glucose readings and a few other kinds carry no time
//! and are placed on a five-minute grid relative to a timestamp record.

use crate::error::{MdtError, PartialDecode};
use crate::time::{CgmTimestamp, CgmTimestampKind};
use chrono::{Duration, NaiveDateTime};
use strum_macros::Display;
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Spacing between consecutive sensor readings.
pub const READING_INTERVAL_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CgmRecordType {
    DataEnd,
    WeakSignal,
    Cal,
    Packet,
    Error,
    DataLow,
    DataHigh,
    Timestamp,
    BatteryChange,
    Status,
    TimeChange,
    Sync,
    CalBg,
    CalFactor,
    Event10,
    Event13,
    /// Any byte from 0x20 up; the reading is twice the byte.
    Glucose,
    Unknown(u8),
}

impl From<u8> for CgmRecordType {
    fn from(b: u8) -> Self {
        use CgmRecordType::*;
        match b {
            0x01 => DataEnd,
            0x02 => WeakSignal,
            0x03 => Cal,
            0x04 => Packet,
            0x05 => Error,
            0x06 => DataLow,
            0x07 => DataHigh,
            0x08 => Timestamp,
            0x0A => BatteryChange,
            0x0B => Status,
            0x0C => TimeChange,
            0x0D => Sync,
            0x0E => CalBg,
            0x0F => CalFactor,
            0x10 => Event10,
            0x13 => Event13,
            0x20.. => Glucose,
            other => Unknown(other),
        }
    }
}

impl CgmRecordType {
    /// Length in bytes, type byte included.
    pub fn length(self) -> Option<usize> {
        use CgmRecordType::*;
        match self {
            DataEnd | WeakSignal | DataLow | Event13 | Glucose => Some(1),
            Cal | Packet | Error | DataHigh => Some(2),
            Timestamp | BatteryChange | Status | TimeChange | Sync | Event10 => Some(5),
            CalBg => Some(6),
            CalFactor => Some(7),
            Unknown(_) => None,
        }
    }

    /// Kinds without their own timestamp.
    pub fn is_relative(self) -> bool {
        use CgmRecordType::*;
        matches!(
            self,
            Glucose | DataEnd | WeakSignal | Cal | Packet | Error | DataLow | DataHigh | Event13
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CgmInfo {
    Empty,
    /// mg/dL.
    Glucose(u16),
    Value(u8),
    Timestamp(CgmTimestampKind),
    /// Meter glucose entered for calibration, mg/dL.
    CalBg(u8),
    /// Thousandths.
    CalFactor(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CgmRecord {
    pub kind: CgmRecordType,
    pub time: Option<NaiveDateTime>,
    pub info: CgmInfo,
    /// Record bytes in page (forward) order; the type byte is last.
    pub raw: Vec<u8>,
}

fn decode_record(rev: &[u8]) -> Result<CgmRecord, MdtError> {
    let kind = CgmRecordType::from(rev[0]);
    let len = kind
        .length()
        .ok_or_else(|| MdtError::UnknownRecordType { data: rev.iter().rev().copied().collect() })?;
    if rev.len() < len {
        return Err(MdtError::TruncatedRecord { have: rev.len(), need: len });
    }
    let raw: Vec<u8> = rev[..len].iter().rev().copied().collect();
    let stamp = (!kind.is_relative())
        .then(|| <[u8; 4]>::try_from(&raw[len - 5..len - 1]).ok())
        .flatten()
        .map(CgmTimestamp::from_bytes);

    use CgmRecordType::*;
    let info = match kind {
        Glucose => CgmInfo::Glucose(u16::from(rev[0]) * 2),
        DataHigh => CgmInfo::Glucose(u16::from(rev[1]) * 2),
        Cal | Packet | Error => CgmInfo::Value(rev[1]),
        Timestamp => CgmInfo::Timestamp(stamp.map_or(CgmTimestampKind::Other, |s| s.timestamp_kind())),
        CalBg => CgmInfo::CalBg(raw[0]),
        CalFactor => CgmInfo::CalFactor(u16::from_be_bytes([raw[0], raw[1]])),
        _ => CgmInfo::Empty,
    };
    Ok(CgmRecord {
        kind,
        time: stamp.and_then(|s| s.to_naive()),
        info,
        raw,
    })
}

/// Decode one CGM page payload (CRC already stripped), newest record first.
pub fn decode_page(page: &[u8]) -> Result<Vec<CgmRecord>, PartialDecode<CgmRecord>> {
    let rev: Vec<u8> = page.iter().rev().copied().collect();
    let mut pos = rev.iter().position(|&b| b != 0).unwrap_or(rev.len());
    let mut records = Vec::new();
    let mut failure = None;
    while pos < rev.len() {
        match decode_record(&rev[pos..]) {
            Ok(record) => {
                pos += record.raw.len();
                records.push(record);
            }
            Err(error) => {
                warn!(offset = page.len() - pos, %error, "CGM decode stopped");
                failure = Some(error);
                break;
            }
        }
    }
    if let Err(error) = assign_times(&mut records) {
        // Keep what could be placed in time: everything after the unanchored run.
        let leading = records.iter().take_while(|r| r.kind.is_relative()).count();
        records.drain(..leading);
        return Err(PartialDecode::new(records, failure.unwrap_or(error)));
    }
    debug!(records = records.len(), "decoded CGM page");
    match failure {
        Some(error) => Err(PartialDecode::new(records, error)),
        None => Ok(records),
    }
}

/// Place relative records on the five-minute grid.
///
/// Relatives ahead of the first timestamp need an anchor: a timestamp that
/// either has no relatives before it or marks the last RF contact or the
/// page end. Records after the leading run are timed even when that anchor
/// is missing.
fn assign_times(records: &mut [CgmRecord]) -> Result<(), MdtError> {
    let step = Duration::minutes(READING_INTERVAL_MINUTES);
    let leading = records.iter().take_while(|r| r.kind.is_relative()).count();
    let mut anchored = Ok(());
    if leading > 0 {
        let anchor = records.get(leading).filter(|r| {
            r.kind == CgmRecordType::Timestamp
                && matches!(
                    r.info,
                    CgmInfo::Timestamp(CgmTimestampKind::LastRf | CgmTimestampKind::PageEnd)
                )
        });
        match anchor.and_then(|r| r.time) {
            Some(t) => {
                for (k, record) in records[..leading].iter_mut().enumerate() {
                    record.time = Some(t + step * (leading - k) as i32);
                }
            }
            None => anchored = Err(MdtError::NeedsTimestamp),
        }
    }

    let mut clock: Option<NaiveDateTime> = None;
    for record in &mut records[leading..] {
        if record.kind == CgmRecordType::Timestamp {
            clock = record.time;
        } else if record.kind.is_relative() {
            record.time = clock;
            clock = clock.map(|t| t - step);
        }
    }
    anchored
}

/// Keep the newest-first records up to the first one older than `since`.
/// Returns whether the cutoff was reached.
pub fn take_since(records: &mut Vec<CgmRecord>, since: NaiveDateTime) -> bool {
    match records.iter().position(|r| r.time.is_some_and(|t| t < since)) {
        Some(at) => {
            records.truncate(at);
            true
        }
        None => false,
    }
}
