//! Packed timestamp formats.
//!
//! All pump times are local wall-clock times with no zone information. They
//! decode to [`NaiveDateTime`]; use [`in_zone`] to attach the pump's zone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Five-byte history timestamp. Month is split over the top bits of bytes 0 and 1.
#[bitfield(bytes = 5)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpTimestamp {
    pub second: B6,
    pub month_hi: B2,
    pub minute: B6,
    pub month_lo: B2,
    pub hour: B5,
    #[skip]
    unused_hour: B3,
    pub day: B5,
    #[skip]
    unused_day: B3,
    pub year: B7,
    #[skip]
    unused_year: B1,
}

impl PumpTimestamp {
    pub fn month(&self) -> u8 {
        self.month_hi() << 2 | self.month_lo()
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2000 + i32::from(self.year()), u32::from(self.month()), u32::from(self.day()))?
            .and_hms_opt(u32::from(self.hour()), u32::from(self.minute()), u32::from(self.second()))
    }
}

/// Four-byte CGM timestamp; seconds are implicitly zero.
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgmTimestamp {
    pub hour: B5,
    #[skip]
    unused_hour: B1,
    pub month_hi: B2,
    pub minute: B6,
    pub month_lo: B2,
    pub day: B5,
    pub kind: B2,
    #[skip]
    unused_day: B1,
    pub year: B7,
    #[skip]
    unused_year: B1,
}

impl CgmTimestamp {
    pub fn month(&self) -> u8 {
        self.month_hi() << 2 | self.month_lo()
    }

    pub fn timestamp_kind(&self) -> CgmTimestampKind {
        CgmTimestampKind::from(self.kind())
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2000 + i32::from(self.year()), u32::from(self.month()), u32::from(self.day()))?
            .and_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
    }
}

/// Why the sensor wrote a timestamp record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum CgmTimestampKind {
    LastRf = 0,
    PageEnd = 1,
    Gap = 2,
    #[num_enum(default)]
    Other = 3,
}

/// Two-byte date used by daily-total records.
#[bitfield(bytes = 2)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpDate {
    pub day: B5,
    pub month_hi: B3,
    pub year: B7,
    pub month_lo: B1,
}

impl PumpDate {
    pub fn month(&self) -> u8 {
        self.month_hi() << 1 | self.month_lo()
    }

    pub fn to_naive(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2000 + i32::from(self.year()), u32::from(self.month()), u32::from(self.day()))
    }
}

/// Decode a five-byte history timestamp. All-zero and out-of-range fields give `None`.
pub fn pump_time(bytes: [u8; 5]) -> Option<NaiveDateTime> {
    PumpTimestamp::from_bytes(bytes).to_naive()
}

pub fn cgm_time(bytes: [u8; 4]) -> Option<NaiveDateTime> {
    CgmTimestamp::from_bytes(bytes).to_naive()
}

pub fn pump_date(bytes: [u8; 2]) -> Option<NaiveDate> {
    PumpDate::from_bytes(bytes).to_naive()
}

/// Attach the pump's zone. Ambiguous local times resolve to the earlier instant.
pub fn in_zone<Tz: TimeZone>(local: NaiveDateTime, zone: &Tz) -> Option<DateTime<Tz>> {
    zone.from_local_datetime(&local).earliest()
}
