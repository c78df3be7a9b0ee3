use super::{RecordInfo, RecordType};
use crate::command::DeviceId;
use crate::error::MdtError;
use crate::schedule::{
    GlucoseTarget, ScheduleEntry, carb_ratio_entries, half_hours, sensitivity_entries, target_entries,
};
use crate::units::{CarbUnits, Family, GlucoseUnits, Insulin};

#[cfg(feature = "serde")]
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BolusInfo {
    pub programmed: Insulin,
    pub amount: Insulin,
    /// Only recorded by 23+ pumps.
    pub unabsorbed: Option<Insulin>,
    /// Zero for a normal bolus, otherwise a square-wave bolus.
    pub duration_minutes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum TempRate {
    /// Per hour.
    Absolute(Insulin),
    Percent(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UnabsorbedBolus {
    pub amount: Insulin,
    pub age_minutes: u16,
}

/// Bolus wizard calculation snapshot. Glucose values are in the pump's
/// configured units as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BolusWizardInfo {
    pub glucose: i32,
    pub carbs: i32,
    pub target: GlucoseTarget,
    pub sensitivity: i32,
    pub carb_ratio: i32,
    pub correction: Insulin,
    pub food: Insulin,
    pub unabsorbed: Insulin,
    pub bolus: Insulin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct WizardConfig {
    pub carb_units: CarbUnits,
    pub glucose_units: GlucoseUnits,
    pub carb_ratios: Vec<ScheduleEntry<i32>>,
    pub sensitivities: Vec<ScheduleEntry<i32>>,
    pub targets: Vec<ScheduleEntry<GlucoseTarget>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct WizardSetup {
    pub before: WizardConfig,
    pub after: WizardConfig,
    pub action_hours_before: u8,
    pub action_hours_after: u8,
}

const SETUP_ENTRIES: usize = 8;

pub(super) fn decode(kind: RecordType, raw: &[u8], family: Family) -> Result<RecordInfo, MdtError> {
    use RecordType::*;
    let info = match kind {
        Bolus => RecordInfo::Bolus(bolus(raw, family)),
        Prime => RecordInfo::Prime {
            amount: Insulin(i32::from(raw[4]) * 100),
            manual: raw[2] == 0,
        },
        Alarm | SensorAlarm | ChangeBasalPattern | SetAutoOff | ChangeMaxBolus | ChangeMaxBasal
        | ChangeBolusScrollStep | ChangeEasyBolus | ChangeTempBasalType | ChangeAlarmType | ChangeTimeFormat
        | ChangeReservoirWarning | ChangeCarbUnits => RecordInfo::Value(raw[1]),
        EnableChildBlock | EnableRemote | EnableBolusWizard | EnableVariableBolus | EnableBgReminder
        | EnableAlarmClock | EnableBolusReminder | EnableCaptureEvent => RecordInfo::Enabled(raw[1] != 0),
        TempBasalDuration => RecordInfo::Duration {
            minutes: u16::from(raw[1]) * 30,
        },
        TempBasalRate => RecordInfo::TempBasal(temp_rate(raw)),
        BgCapture => RecordInfo::Glucose {
            glucose: u16::from(raw[1]) | u16::from(raw[4] & 0x80) << 1 | u16::from(raw[6] & 0x80) << 2,
            meter: None,
        },
        BgReceived => RecordInfo::Glucose {
            glucose: u16::from(raw[1]) << 3 | u16::from(raw[4] >> 5),
            meter: Some(DeviceId::new([raw[7], raw[8], raw[9]])),
        },
        BasalProfileBefore | BasalProfileAfter => RecordInfo::BasalProfile {
            pattern: raw[1],
            rates: basal_profile(&raw[7..])?,
        },
        BasalProfileStart => {
            let start = half_hours(raw[7])
                .ok_or_else(|| MdtError::InvalidSchedule(format!("basal start slot {}", raw[7])))?;
            RecordInfo::BasalRate {
                pattern: raw[1],
                rate: ScheduleEntry {
                    start,
                    value: Insulin::from_basal_strokes(u32::from(u16::from_le_bytes([raw[8], raw[9]]))),
                },
            }
        }
        BolusWizardSetup => RecordInfo::BolusWizardSetup(Box::new(wizard_setup(raw, family)?)),
        BolusWizard => RecordInfo::BolusWizard(wizard(raw, family)),
        UnabsorbedInsulin => RecordInfo::Unabsorbed(unabsorbed(&raw[2..])),
        DailyTotal => RecordInfo::DailyTotal {
            total: Some(Insulin::from_basal_strokes(u32::from(u16::from_be_bytes([raw[3], raw[4]])))),
        },
        DailyTotal515 | DailyTotal522 | DailyTotal523 => RecordInfo::DailyTotal { total: None },
        _ => RecordInfo::Empty,
    };
    Ok(info)
}

fn bolus(raw: &[u8], family: Family) -> BolusInfo {
    if family.has_fine_strokes() {
        let strokes = |at: usize| Insulin::from_basal_strokes(u32::from(u16::from_be_bytes([raw[at], raw[at + 1]])));
        BolusInfo {
            programmed: strokes(1),
            amount: strokes(3),
            unabsorbed: Some(strokes(5)),
            duration_minutes: u16::from(raw[7]) * 30,
        }
    } else {
        BolusInfo {
            programmed: Insulin::from_bolus_counts(u32::from(raw[1]), family),
            amount: Insulin::from_bolus_counts(u32::from(raw[2]), family),
            unabsorbed: None,
            duration_minutes: u16::from(raw[3]) * 30,
        }
    }
}

/// Bits 3..=7 of the last byte select the kind; the low three bits extend an
/// absolute rate.
fn temp_rate(raw: &[u8]) -> TempRate {
    if raw[7] >> 3 == 1 {
        TempRate::Percent(raw[1])
    } else {
        let strokes = u32::from(raw[7] & 0x07) << 8 | u32::from(raw[1]);
        TempRate::Absolute(Insulin::from_basal_strokes(strokes))
    }
}

/// `(slot, strokes, _)` triples; a zero pair after the first entry ends the list.
fn basal_profile(body: &[u8]) -> Result<Vec<ScheduleEntry<Insulin>>, MdtError> {
    let mut rates = Vec::new();
    for (i, entry) in body.chunks_exact(3).take(48).enumerate() {
        if i > 0 && entry[0] == 0 && entry[1] == 0 {
            break;
        }
        let start =
            half_hours(entry[0]).ok_or_else(|| MdtError::InvalidSchedule(format!("basal slot {}", entry[0])))?;
        rates.push(ScheduleEntry {
            start,
            value: Insulin::from_basal_strokes(u32::from(entry[1])),
        });
    }
    Ok(rates)
}

fn wizard(raw: &[u8], family: Family) -> BolusWizardInfo {
    let be = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let strokes = |n: u32| Insulin::from_basal_strokes(n);
    let tenths = |n: u8| Insulin(i32::from(n) * 100);
    if family.has_fine_strokes() {
        BolusWizardInfo {
            glucose: i32::from(raw[8] & 0x03) << 8 | i32::from(raw[1]),
            carbs: i32::from(raw[8] & 0x0C) << 6 | i32::from(raw[7]),
            carb_ratio: (i32::from(raw[9] & 0x07) << 8 | i32::from(raw[10])) / 10,
            sensitivity: i32::from(raw[11]),
            target: GlucoseTarget {
                low: i32::from(raw[12]),
                high: i32::from(raw[21]),
            },
            correction: strokes(u32::from(raw[16] & 0x38) << 5 | u32::from(raw[13])),
            food: strokes(u32::from(be(14))),
            unabsorbed: strokes(u32::from(be(17))),
            bolus: strokes(u32::from(be(19))),
        }
    } else {
        BolusWizardInfo {
            glucose: i32::from(raw[8] & 0x0F) << 8 | i32::from(raw[1]),
            carbs: i32::from(raw[7]),
            carb_ratio: i32::from(raw[9]),
            sensitivity: i32::from(raw[10]),
            target: GlucoseTarget {
                low: i32::from(raw[11]),
                high: i32::from(raw[19]),
            },
            correction: Insulin((i32::from(raw[12] & 0x0F) << 8 | i32::from(raw[14])) * 100),
            food: tenths(raw[13]),
            unabsorbed: tenths(raw[16]),
            bolus: tenths(raw[18]),
        }
    }
}

/// Two configuration halves followed by the insulin action durations.
fn wizard_setup(raw: &[u8], family: Family) -> Result<WizardSetup, MdtError> {
    let half = if family.has_fine_strokes() { 68 } else { 58 };
    let body = &raw[7..];
    let hours = raw[raw.len() - 1];
    Ok(WizardSetup {
        before: wizard_config(&body[..half], family)?,
        after: wizard_config(&body[half..2 * half], family)?,
        action_hours_before: hours >> 4,
        action_hours_after: hours & 0x0F,
    })
}

fn wizard_config(half: &[u8], family: Family) -> Result<WizardConfig, MdtError> {
    let carb_units = CarbUnits::from(half[0]);
    let glucose_units = GlucoseUnits::from(half[1]);
    let ratio_width = if family.has_fine_strokes() { 3 } else { 2 };
    let (ratios, rest) = half[2..].split_at(SETUP_ENTRIES * ratio_width);
    let (sensitivities, rest) = rest.split_at(SETUP_ENTRIES * 2);
    let targets = &rest[..SETUP_ENTRIES * 3];
    Ok(WizardConfig {
        carb_units,
        glucose_units,
        carb_ratios: carb_ratio_entries(ratios, family, carb_units)?,
        sensitivities: sensitivity_entries(sensitivities, glucose_units)?,
        targets: target_entries(targets, glucose_units)?,
    })
}

/// `(amount, age_lo, age_hi)` triples; bits 4..=5 of the third byte are age bits 8..=9.
fn unabsorbed(body: &[u8]) -> Vec<UnabsorbedBolus> {
    body.chunks_exact(3)
        .map(|e| UnabsorbedBolus {
            amount: Insulin::from_basal_strokes(u32::from(e[0])),
            age_minutes: u16::from(e[1]) | u16::from(e[2] & 0x30) << 4,
        })
        .collect()
}
