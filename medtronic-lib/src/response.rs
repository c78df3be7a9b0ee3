//! Decoders for single-frame query responses.
//!
//! Every body starts with a byte count; fixed layouts are read through
//! zerocopy views of the body.

use crate::command::Opcode;
use crate::error::MdtError;
use crate::units::{CarbUnits, Family, GlucoseUnits, Insulin};
use chrono::{NaiveDate, NaiveDateTime};
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[cfg(feature = "serde")]
use serde::Serialize;

/// History pages the pump keeps.
pub const MAX_HISTORY_PAGES: u32 = 36;

fn view<'a, T>(opcode: Opcode, data: &'a [u8]) -> Result<&'a T, MdtError>
where
    T: FromBytes + KnownLayout + Immutable + Unaligned,
{
    T::ref_from_prefix(data)
        .map(|(view, _)| view)
        .map_err(|_| MdtError::bad_response(opcode, format!("{} bytes is too short", data.len())))
}

/// Body after the count byte, clamped to what was received.
fn counted(opcode: Opcode, data: &[u8]) -> Result<&[u8], MdtError> {
    match data.split_first() {
        Some((&n, rest)) => Ok(&rest[..usize::from(n).min(rest.len())]),
        None => Err(MdtError::bad_response(opcode, "empty body")),
    }
}

fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BatteryRaw {
    pub len: u8,
    pub low: u8,
    /// Hundredths of a volt.
    pub voltage: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BatteryStatus {
    pub low: bool,
    pub millivolts: u32,
}

impl From<&BatteryRaw> for BatteryStatus {
    fn from(raw: &BatteryRaw) -> Self {
        Self {
            low: raw.low != 0,
            millivolts: u32::from(raw.voltage.get()) * 10,
        }
    }
}

/// `03 low vH vL`. Anything shorter or with another count is rejected.
pub fn decode_battery(data: &[u8]) -> Result<BatteryStatus, MdtError> {
    if data.len() < 4 || data[0] != 3 {
        return Err(MdtError::bad_response(
            Opcode::GetBattery,
            format!("unexpected battery body {}", hex::encode(data)),
        ));
    }
    Ok(view::<BatteryRaw>(Opcode::GetBattery, data)?.into())
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ClockRaw {
    pub len: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub year: U16,
    pub month: u8,
    pub day: u8,
}

impl ClockRaw {
    pub fn from_naive(t: NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            len: 7,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
            year: U16::new(t.year() as u16),
            month: t.month() as u8,
            day: t.day() as u8,
        }
    }

    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(i32::from(self.year.get()), u32::from(self.month), u32::from(self.day))?.and_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
    }
}

/// `07 h m s yH yL mo d`, pump-local time.
pub fn decode_clock(data: &[u8]) -> Result<NaiveDateTime, MdtError> {
    let raw = view::<ClockRaw>(Opcode::GetClock, data)?;
    raw.to_naive()
        .ok_or_else(|| MdtError::bad_response(Opcode::GetClock, format!("invalid clock {}", hex::encode(data))))
}

/// `n ascii…`, e.g. `"523"`.
pub fn decode_model(data: &[u8]) -> Result<String, MdtError> {
    let model = ascii(counted(Opcode::GetModel, data)?);
    if model.is_empty() {
        return Err(MdtError::bad_response(Opcode::GetModel, "empty model"));
    }
    Ok(model)
}

/// `06 ascii×6`.
pub fn decode_pump_id(data: &[u8]) -> Result<String, MdtError> {
    let body = counted(Opcode::GetId, data)?;
    if body.len() != 6 {
        return Err(MdtError::bad_response(Opcode::GetId, format!("{} id digits", body.len())));
    }
    Ok(ascii(body))
}

pub fn decode_firmware_version(data: &[u8]) -> Result<String, MdtError> {
    Ok(ascii(counted(Opcode::FirmwareVersion, data)?))
}

/// `02 hi lo` in tenths of a unit before family 23; `04 _ _ hi lo` in strokes after.
pub fn decode_reservoir(data: &[u8], family: Family) -> Result<Insulin, MdtError> {
    let body = counted(Opcode::Reservoir, data)?;
    let (amount, step) = match (family.has_fine_strokes(), body) {
        (false, [hi, lo, ..]) => (u16::from_be_bytes([*hi, *lo]), 100),
        (true, [_, _, hi, lo, ..]) => (u16::from_be_bytes([*hi, *lo]), 25),
        _ => {
            return Err(MdtError::bad_response(
                Opcode::Reservoir,
                format!("{} bytes for family {family}", body.len()),
            ));
        }
    };
    Ok(Insulin(i32::from(amount) * step))
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct StatusRaw {
    pub len: u8,
    pub code: u8,
    pub bolusing: u8,
    pub suspended: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PumpStatus {
    /// 0x03 is normal operation.
    pub code: u8,
    pub bolusing: bool,
    pub suspended: bool,
}

impl From<&StatusRaw> for PumpStatus {
    fn from(raw: &StatusRaw) -> Self {
        Self {
            code: raw.code,
            bolusing: raw.bolusing != 0,
            suspended: raw.suspended != 0,
        }
    }
}

/// `03 code bolusing suspended`.
pub fn decode_status(data: &[u8]) -> Result<PumpStatus, MdtError> {
    Ok(view::<StatusRaw>(Opcode::Status, data)?.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum TempBasalType {
    Absolute = 0,
    Percent = 1,
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TempBasalRaw {
    pub len: u8,
    pub kind: u8,
    pub percent: u8,
    /// 25 mU strokes per hour.
    pub rate: U16,
    /// Minutes remaining.
    pub duration: U16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum TempBasal {
    Absolute { rate: Insulin, minutes: u16 },
    Percent { percent: u8, minutes: u16 },
}

impl TempBasal {
    pub fn minutes(&self) -> u16 {
        match self {
            TempBasal::Absolute { minutes, .. } | TempBasal::Percent { minutes, .. } => *minutes,
        }
    }
}

/// `06 type percent rH rL dH dL`.
pub fn decode_temp_basal(data: &[u8]) -> Result<TempBasal, MdtError> {
    let raw = view::<TempBasalRaw>(Opcode::TempBasalRead, data)?;
    let minutes = raw.duration.get();
    match TempBasalType::from(raw.kind) {
        TempBasalType::Absolute => Ok(TempBasal::Absolute {
            rate: Insulin::from_basal_strokes(u32::from(raw.rate.get())),
            minutes,
        }),
        TempBasalType::Percent => Ok(TempBasal::Percent {
            percent: raw.percent,
            minutes,
        }),
        TempBasalType::Unknown(kind) => Err(MdtError::bad_response(
            Opcode::TempBasalRead,
            format!("temp basal type {kind}"),
        )),
    }
}

/// `01 units`.
pub fn decode_glucose_units(data: &[u8]) -> Result<GlucoseUnits, MdtError> {
    match counted(Opcode::GlucoseUnits, data)? {
        [units, ..] => Ok(GlucoseUnits::from(*units)),
        [] => Err(MdtError::bad_response(Opcode::GlucoseUnits, "no units byte")),
    }
}

pub fn decode_carb_units(data: &[u8]) -> Result<CarbUnits, MdtError> {
    match counted(Opcode::CarbUnits, data)? {
        [units, ..] => Ok(CarbUnits::from(*units)),
        [] => Err(MdtError::bad_response(Opcode::CarbUnits, "no units byte")),
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PageNumberRaw {
    pub len: u8,
    pub page: U32,
}

/// Number of history pages to read: the last page index plus one, at most 36.
pub fn decode_history_page_count(data: &[u8]) -> Result<u32, MdtError> {
    let raw = view::<PageNumberRaw>(Opcode::LastHistoryPage, data)?;
    Ok(raw.page.get().saturating_add(1).min(MAX_HISTORY_PAGES))
}

/// Current CGM page number.
pub fn decode_cgm_page_number(data: &[u8]) -> Result<u32, MdtError> {
    Ok(view::<PageNumberRaw>(Opcode::CgmPageCount, data)?.page.get())
}

/// Pump settings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Settings {
    pub auto_off_hours: u8,
    pub audio_bolus_step: Option<Insulin>,
    pub variable_bolus: bool,
    pub max_bolus: Insulin,
    /// Per hour.
    pub max_basal: Insulin,
    pub time_format_24h: bool,
    /// U-100 or U-50.
    pub insulin_concentration: u8,
    pub patterns_enabled: bool,
    pub selected_pattern: u8,
    pub rf_enabled: bool,
    pub block_enabled: bool,
    pub temp_basal_type: TempBasalType,
    pub temp_basal_percent: u8,
    pub insulin_action_hours: u8,
}

/// Settings body after the count byte. Family 23+ inserts one byte before the
/// maximum bolus and widens nothing else.
pub fn decode_settings(data: &[u8], family: Family) -> Result<Settings, MdtError> {
    let body = counted(Opcode::Settings, data)?;
    let shift = usize::from(family.has_fine_strokes());
    let need = 18 + shift;
    if body.len() < need {
        return Err(MdtError::bad_response(
            Opcode::Settings,
            format!("{} bytes, need {need}", body.len()),
        ));
    }
    let b = |i: usize| body[i + shift];
    Ok(Settings {
        auto_off_hours: body[0],
        audio_bolus_step: (body[2] == 1).then(|| Insulin(i32::from(body[3]) * 100)),
        variable_bolus: body[4] == 1,
        max_bolus: Insulin(i32::from(b(5)) * 100),
        max_basal: Insulin::from_basal_strokes(u32::from(u16::from_be_bytes([b(6), b(7)]))),
        time_format_24h: b(8) != 0,
        insulin_concentration: if b(9) == 0 { 100 } else { 50 },
        patterns_enabled: b(10) == 1,
        selected_pattern: b(11),
        rf_enabled: b(12) == 1,
        block_enabled: b(13) == 1,
        temp_basal_type: TempBasalType::from(b(14)),
        temp_basal_percent: b(15),
        insulin_action_hours: b(17),
    })
}
