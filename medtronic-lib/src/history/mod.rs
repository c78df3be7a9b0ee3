//! Pump history pages.
//!
//! A page is an append log of variable-length records, oldest first. Each
//! record opens with its type byte; the length comes from a static table and
//! may depend on the pump family. Decoding runs front to back and the result
//! is handed out newest first.

mod fields;

pub use fields::{BolusInfo, BolusWizardInfo, TempRate, UnabsorbedBolus, WizardConfig, WizardSetup};

use crate::error::{MdtError, PartialDecode};
use crate::schedule::ScheduleEntry;
use crate::time::{pump_date, pump_time};
use crate::units::{Family, Insulin};
use crate::command::DeviceId;
use chrono::NaiveDateTime;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum RecordType {
    Bolus = 0x01,
    Prime = 0x03,
    Alarm = 0x06,
    DailyTotal = 0x07,
    BasalProfileBefore = 0x08,
    BasalProfileAfter = 0x09,
    BgCapture = 0x0A,
    SensorAlarm = 0x0B,
    ClearAlarm = 0x0C,
    ChangeBasalPattern = 0x14,
    TempBasalDuration = 0x16,
    ChangeTime = 0x17,
    NewTime = 0x18,
    LowBattery = 0x19,
    BatteryChange = 0x1A,
    SetAutoOff = 0x1B,
    SuspendPump = 0x1E,
    ResumePump = 0x1F,
    SelfTest = 0x20,
    Rewind = 0x21,
    ClearSettings = 0x22,
    EnableChildBlock = 0x23,
    ChangeMaxBolus = 0x24,
    EnableRemote = 0x26,
    ChangeMaxBasal = 0x2C,
    EnableBolusWizard = 0x2D,
    ChangeBgReminder = 0x31,
    SetAlarmClockTime = 0x32,
    TempBasalRate = 0x33,
    LowReservoir = 0x34,
    ChangeMeterId = 0x36,
    ChangeParadigmId = 0x3C,
    BgReceived = 0x3F,
    JournalMealMarker = 0x40,
    JournalExerciseMarker = 0x41,
    JournalInsulinMarker = 0x42,
    JournalOtherMarker = 0x43,
    ChangeSensorSetup = 0x50,
    ChangeSensorRateOfChange = 0x56,
    ChangeBolusScrollStep = 0x57,
    BolusWizardSetup = 0x5A,
    BolusWizard = 0x5B,
    UnabsorbedInsulin = 0x5C,
    SaveSettings = 0x5D,
    EnableVariableBolus = 0x5E,
    ChangeEasyBolus = 0x5F,
    EnableBgReminder = 0x60,
    EnableAlarmClock = 0x61,
    ChangeTempBasalType = 0x62,
    ChangeAlarmType = 0x63,
    ChangeTimeFormat = 0x64,
    ChangeReservoirWarning = 0x65,
    EnableBolusReminder = 0x66,
    SetBolusReminderTime = 0x67,
    DeleteBolusReminderTime = 0x68,
    BolusReminder = 0x69,
    DeleteAlarmClockTime = 0x6A,
    DailyTotal515 = 0x6C,
    DailyTotal522 = 0x6D,
    DailyTotal523 = 0x6E,
    ChangeCarbUnits = 0x6F,
    BasalProfileStart = 0x7B,
    ConnectOtherDevice = 0x7C,
    ChangeOtherDevice = 0x7D,
    ChangeMarriage = 0x81,
    DeleteOtherDevice = 0x82,
    EnableCaptureEvent = 0x83,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Type byte, value byte and a five-byte timestamp.
const BASE: usize = 7;

impl RecordType {
    /// Total record length including the type byte. `data` starts at the
    /// type byte and is only consulted by self-describing records.
    pub fn length(self, family: Family, data: &[u8]) -> Result<usize, MdtError> {
        use RecordType::*;
        let fine = family.has_fine_strokes();
        let len = match self {
            Bolus => {
                if fine {
                    13
                } else {
                    9
                }
            }
            Prime => 10,
            Alarm => 9,
            DailyTotal => {
                if fine {
                    10
                } else {
                    BASE
                }
            }
            BasalProfileBefore | BasalProfileAfter => 152,
            SensorAlarm | TempBasalRate => 8,
            EnableRemote | ChangeMeterId | ChangeParadigmId => 21,
            SetAlarmClockTime | DeleteAlarmClockTime => 14,
            BgReceived | BasalProfileStart => 10,
            JournalMealMarker | SetBolusReminderTime | DeleteBolusReminderTime | BolusReminder => 9,
            JournalExerciseMarker | JournalInsulinMarker => 8,
            ChangeSensorSetup => {
                if fine {
                    41
                } else {
                    37
                }
            }
            ChangeSensorRateOfChange | ChangeMarriage | DeleteOtherDevice => 12,
            BolusWizardSetup => {
                if fine {
                    144
                } else {
                    124
                }
            }
            BolusWizard => {
                if fine {
                    22
                } else {
                    20
                }
            }
            UnabsorbedInsulin => match data.get(1) {
                Some(&n) => usize::from(n).max(2),
                None => return Err(MdtError::TruncatedRecord { have: data.len(), need: 2 }),
            },
            DailyTotal515 => 38,
            DailyTotal522 => 44,
            DailyTotal523 => 52,
            ChangeOtherDevice => 37,
            Unknown(_) => return Err(MdtError::UnknownRecordType { data: data.to_vec() }),
            _ => BASE,
        };
        Ok(len)
    }

    /// Daily summaries are written at day boundaries, out of order with
    /// the surrounding records.
    pub fn is_daily_total(self) -> bool {
        matches!(
            self,
            RecordType::DailyTotal | RecordType::DailyTotal515 | RecordType::DailyTotal522 | RecordType::DailyTotal523
        )
    }

    fn time_offset(self, family: Family) -> Option<usize> {
        use RecordType::*;
        match self {
            Bolus => Some(if family.has_fine_strokes() { 8 } else { 4 }),
            Prime => Some(5),
            Alarm => Some(4),
            SensorAlarm => Some(3),
            UnabsorbedInsulin | DailyTotal | DailyTotal515 | DailyTotal522 | DailyTotal523 => None,
            _ => Some(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum RecordInfo {
    Empty,
    /// One-byte setting or code carried at offset 1.
    Value(u8),
    Enabled(bool),
    Prime { amount: Insulin, manual: bool },
    Glucose { glucose: u16, meter: Option<DeviceId> },
    Bolus(BolusInfo),
    TempBasal(TempRate),
    Duration { minutes: u16 },
    BasalProfile { pattern: u8, rates: Vec<ScheduleEntry<Insulin>> },
    BasalRate { pattern: u8, rate: ScheduleEntry<Insulin> },
    BolusWizardSetup(Box<WizardSetup>),
    BolusWizard(BolusWizardInfo),
    Unabsorbed(Vec<UnabsorbedBolus>),
    DailyTotal { total: Option<Insulin> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct HistoryRecord {
    pub kind: RecordType,
    /// Pump-local time; daily summaries carry midnight of their day.
    pub time: Option<NaiveDateTime>,
    pub info: RecordInfo,
    /// The record exactly as it appears in the page.
    pub raw: Vec<u8>,
}

impl HistoryRecord {
    /// Whether this record lies strictly before `since`. Daily summaries never do.
    pub fn is_before(&self, since: NaiveDateTime) -> bool {
        !self.kind.is_daily_total() && self.time.is_some_and(|t| t < since)
    }
}

/// Decode the record starting at `data[0]`.
pub fn decode_record(data: &[u8], family: Family) -> Result<HistoryRecord, MdtError> {
    let kind = RecordType::from(data.first().copied().ok_or(MdtError::Empty)?);
    let len = kind.length(family, data)?;
    if data.len() < len {
        return Err(MdtError::TruncatedRecord { have: data.len(), need: len });
    }
    let raw = &data[..len];
    let time = match kind.time_offset(family) {
        Some(at) => raw
            .get(at..at + 5)
            .and_then(|b| <[u8; 5]>::try_from(b).ok())
            .and_then(pump_time),
        None => daily_date(kind, raw),
    };
    let info = fields::decode(kind, raw, family)?;
    Ok(HistoryRecord {
        kind,
        time,
        info,
        raw: raw.to_vec(),
    })
}

fn daily_date(kind: RecordType, raw: &[u8]) -> Option<NaiveDateTime> {
    let at = match kind {
        RecordType::DailyTotal => 5,
        RecordType::DailyTotal515 | RecordType::DailyTotal522 | RecordType::DailyTotal523 => 1,
        _ => return None,
    };
    let bytes = <[u8; 2]>::try_from(raw.get(at..at + 2)?).ok()?;
    pump_date(bytes)?.and_hms_opt(0, 0, 0)
}

/// Decode one page payload (CRC already stripped). Records come back newest
/// first; on failure the records decoded so far come back with the error.
pub fn decode_page(page: &[u8], family: Family) -> Result<Vec<HistoryRecord>, PartialDecode<HistoryRecord>> {
    let mut records = Vec::new();
    let mut rest = page;
    while let Some(&kind) = rest.first() {
        if kind == 0 {
            break;
        }
        match decode_record(rest, family) {
            Ok(record) => {
                rest = &rest[record.raw.len()..];
                records.push(record);
            }
            Err(error) => {
                warn!(offset = page.len() - rest.len(), %error, "history decode stopped");
                records.reverse();
                return Err(PartialDecode::new(records, error));
            }
        }
    }
    debug!(records = records.len(), "decoded history page");
    records.reverse();
    Ok(records)
}

/// Keep the newest-first records up to the first one older than `since`.
/// Returns whether the cutoff was reached.
pub fn take_since(records: &mut Vec<HistoryRecord>, since: NaiveDateTime) -> bool {
    match records.iter().position(|r| r.is_before(since)) {
        Some(at) => {
            records.truncate(at);
            true
        }
        None => false,
    }
}
