//! Time-of-day schedules: basal rates, carb ratios, insulin sensitivities and
//! glucose targets.
//!
//! On the wire every entry starts with a half-hour index. A non-initial entry
//! with index 0 ends the list.

use crate::error::MdtError;
use crate::units::{CarbUnits, Family, GlucoseUnits, Insulin, glucose_from_wire};
use chrono::{NaiveDateTime, NaiveTime, Timelike};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Half-hour slots in a day.
pub const SLOTS_PER_DAY: u8 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ScheduleEntry<T> {
    pub start: NaiveTime,
    pub value: T,
}

/// Entries ordered by start time, the first one starting at midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Schedule<T> {
    entries: Vec<ScheduleEntry<T>>,
}

impl<T> Schedule<T> {
    pub fn new(entries: Vec<ScheduleEntry<T>>) -> Result<Self, MdtError> {
        let Some(first) = entries.first() else {
            return Err(MdtError::InvalidSchedule("no entries".to_string()));
        };
        if first.start.num_seconds_from_midnight() != 0 {
            return Err(MdtError::InvalidSchedule(format!("first entry starts at {}", first.start)));
        }
        for entry in &entries {
            if entry.start.minute() % 30 != 0 || entry.start.second() != 0 {
                return Err(MdtError::InvalidSchedule(format!(
                    "{} is not on a half-hour boundary",
                    entry.start
                )));
            }
        }
        if entries.windows(2).any(|w| w[0].start >= w[1].start) {
            return Err(MdtError::InvalidSchedule("entries out of order".to_string()));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ScheduleEntry<T>] {
        &self.entries
    }

    /// Value in effect at `time`: the latest entry starting at or before it.
    pub fn lookup(&self, time: NaiveTime) -> &T {
        let idx = self.entries.partition_point(|e| e.start <= time);
        &self.entries[idx.saturating_sub(1)].value
    }

    pub fn at(&self, t: NaiveDateTime) -> &T {
        self.lookup(t.time())
    }
}

/// Time of day for a half-hour slot index.
pub fn half_hours(slot: u8) -> Option<NaiveTime> {
    if slot >= SLOTS_PER_DAY {
        return None;
    }
    NaiveTime::from_hms_opt(u32::from(slot / 2), u32::from(slot % 2) * 30, 0)
}

/// Walk fixed-width entries until the end of `bytes` or the midnight sentinel.
///
/// `decode` returns the slot index and value of one entry.
pub(crate) fn decode_entries<T>(
    bytes: &[u8],
    width: usize,
    decode: impl Fn(&[u8]) -> (u8, T),
) -> Result<Vec<ScheduleEntry<T>>, MdtError> {
    let mut entries = Vec::new();
    for chunk in bytes.chunks_exact(width) {
        let (slot, value) = decode(chunk);
        if slot == 0 && !entries.is_empty() {
            break;
        }
        let start =
            half_hours(slot).ok_or_else(|| MdtError::InvalidSchedule(format!("slot {slot} is past midnight")))?;
        entries.push(ScheduleEntry { start, value });
    }
    Ok(entries)
}

/// Strip the leading byte count of a response body.
pub(crate) fn counted(data: &[u8]) -> Result<&[u8], MdtError> {
    let (&n, rest) = data
        .split_first()
        .ok_or_else(|| MdtError::InvalidSchedule("empty body".to_string()))?;
    Ok(&rest[..usize::from(n).min(rest.len())])
}

pub type BasalSchedule = Schedule<Insulin>;

/// Basal rates (per hour): `count | (strokes_lo, strokes_hi, slot)*`.
pub fn decode_basal_schedule(data: &[u8]) -> Result<BasalSchedule, MdtError> {
    basal_schedule_from_triples(counted(data)?)
}

pub(crate) fn basal_schedule_from_triples(triples: &[u8]) -> Result<BasalSchedule, MdtError> {
    let entries = decode_entries(triples, 3, |e| {
        let strokes = u16::from_le_bytes([e[0], e[1]]);
        (e[2], Insulin::from_basal_strokes(u32::from(strokes)))
    })?;
    Schedule::new(entries)
}

/// Encode a basal schedule in the wire triple layout (without the count byte).
pub fn encode_basal_schedule(schedule: &BasalSchedule) -> Result<Vec<u8>, MdtError> {
    let mut out = Vec::with_capacity(schedule.entries().len() * 3);
    for entry in schedule.entries() {
        let strokes = u16::try_from(entry.value.to_basal_strokes()?)
            .map_err(|_| MdtError::InvalidParameter(format!("basal rate {} U/h too large", entry.value)))?;
        let slot = (entry.start.hour() * 2 + entry.start.minute() / 30) as u8;
        out.extend_from_slice(&strokes.to_le_bytes());
        out.push(slot);
    }
    Ok(out)
}

/// Carb ratios: grams per unit, or tenths of an exchange per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CarbRatios {
    pub units: CarbUnits,
    pub schedule: Schedule<i32>,
}

/// Pairs `(slot, ratio)` before family 23; triples `(slot, hi, lo)` after,
/// carrying tenths of a gram or thousandths of an exchange.
pub(crate) fn carb_ratio_entries(
    bytes: &[u8],
    family: Family,
    units: CarbUnits,
) -> Result<Vec<ScheduleEntry<i32>>, MdtError> {
    if family.has_fine_strokes() {
        let scale = if units == CarbUnits::Exchanges { 100 } else { 10 };
        decode_entries(bytes, 3, |e| (e[0], i32::from(u16::from_be_bytes([e[1], e[2]])) / scale))
    } else {
        decode_entries(bytes, 2, |e| (e[0], i32::from(e[1])))
    }
}

/// `count | units | entries`.
pub fn decode_carb_ratios(data: &[u8], family: Family) -> Result<CarbRatios, MdtError> {
    let body = counted(data)?;
    let (&units, entries) = body
        .split_first()
        .ok_or_else(|| MdtError::InvalidSchedule("carb ratios without units".to_string()))?;
    let units = CarbUnits::from(units);
    Ok(CarbRatios {
        units,
        schedule: Schedule::new(carb_ratio_entries(entries, family, units)?)?,
    })
}

/// Insulin sensitivity: glucose drop per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Sensitivities {
    pub units: GlucoseUnits,
    pub schedule: Schedule<i32>,
}

/// Pairs; bit 6 of the slot byte is bit 8 of the value.
pub(crate) fn sensitivity_entries(bytes: &[u8], units: GlucoseUnits) -> Result<Vec<ScheduleEntry<i32>>, MdtError> {
    decode_entries(bytes, 2, |e| {
        let raw = u32::from(e[0] & 0x40) << 2 | u32::from(e[1]);
        (e[0] & 0x3F, glucose_from_wire(raw, units))
    })
}

pub fn decode_sensitivities(data: &[u8]) -> Result<Sensitivities, MdtError> {
    let body = counted(data)?;
    let (&units, entries) = body
        .split_first()
        .ok_or_else(|| MdtError::InvalidSchedule("sensitivities without units".to_string()))?;
    let units = GlucoseUnits::from(units);
    Ok(Sensitivities {
        units,
        schedule: Schedule::new(sensitivity_entries(entries, units)?)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct GlucoseTarget {
    pub low: i32,
    pub high: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct GlucoseTargets {
    pub units: GlucoseUnits,
    pub schedule: Schedule<GlucoseTarget>,
}

/// Triples `(slot, low, high)`.
pub(crate) fn target_entries(
    bytes: &[u8],
    units: GlucoseUnits,
) -> Result<Vec<ScheduleEntry<GlucoseTarget>>, MdtError> {
    decode_entries(bytes, 3, |e| {
        let target = GlucoseTarget {
            low: glucose_from_wire(u32::from(e[1]), units),
            high: glucose_from_wire(u32::from(e[2]), units),
        };
        (e[0], target)
    })
}

pub fn decode_targets(data: &[u8]) -> Result<GlucoseTargets, MdtError> {
    let body = counted(data)?;
    let (&units, entries) = body
        .split_first()
        .ok_or_else(|| MdtError::InvalidSchedule("targets without units".to_string()))?;
    let units = GlucoseUnits::from(units);
    Ok(GlucoseTargets {
        units,
        schedule: Schedule::new(target_entries(entries, units)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{TestResult, quickcheck};

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn decodes_basal_rates() {
        let schedule = decode_basal_schedule(&[0x06, 0x28, 0x00, 0x00, 0x30, 0x00, 0x12]).unwrap();
        assert_eq!(
            schedule.entries(),
            [
                ScheduleEntry { start: hm(0, 0), value: Insulin(1000) },
                ScheduleEntry { start: hm(9, 0), value: Insulin(1200) },
            ]
        );
        assert_eq!(*schedule.lookup(hm(8, 59)), Insulin(1000));
        assert_eq!(*schedule.lookup(hm(9, 0)), Insulin(1200));
        assert_eq!(*schedule.lookup(hm(23, 30)), Insulin(1200));
    }

    #[test]
    fn basal_stops_at_midnight_sentinel() {
        let data = [0x09, 0x28, 0x00, 0x00, 0x30, 0x00, 0x12, 0x00, 0x00, 0x00];
        assert_eq!(decode_basal_schedule(&data).unwrap().entries().len(), 2);
    }

    #[test]
    fn basal_encode_matches_wire() {
        let schedule = decode_basal_schedule(&[0x06, 0x28, 0x00, 0x00, 0x30, 0x00, 0x12]).unwrap();
        assert_eq!(encode_basal_schedule(&schedule).unwrap(), [0x28, 0x00, 0x00, 0x30, 0x00, 0x12]);
    }

    #[test]
    fn rejects_schedule_not_starting_at_midnight() {
        let err = decode_basal_schedule(&[0x03, 0x28, 0x00, 0x02]).unwrap_err();
        assert!(matches!(err, MdtError::InvalidSchedule(_)));
        assert!(decode_basal_schedule(&[]).is_err());
    }

    #[test]
    fn carb_ratios_by_family() {
        let old = decode_carb_ratios(&[0x05, 0x01, 0x00, 0x0F, 0x10, 0x0C], Family(22)).unwrap();
        assert_eq!(old.units, CarbUnits::Grams);
        assert_eq!(*old.schedule.lookup(hm(7, 0)), 15);
        assert_eq!(*old.schedule.lookup(hm(8, 0)), 12);

        let new = decode_carb_ratios(&[0x04, 0x01, 0x00, 0x00, 0x96], Family(23)).unwrap();
        assert_eq!(*new.schedule.lookup(hm(12, 0)), 15);
    }

    #[test]
    fn sensitivity_high_bit() {
        // 0x40 in the slot byte adds 256
        let s = decode_sensitivities(&[0x03, 0x01, 0x40, 0x2C]).unwrap();
        assert_eq!(*s.schedule.lookup(hm(0, 0)), 300);
    }

    #[test]
    fn targets_in_mmol() {
        let t = decode_targets(&[0x04, 0x02, 0x00, 0x37, 0x46]).unwrap();
        assert_eq!(t.units, GlucoseUnits::MmolPerLiter);
        assert_eq!(*t.schedule.lookup(hm(3, 0)), GlucoseTarget { low: 5500, high: 7000 });
    }

    quickcheck! {
        fn lookup_finds_latest_start(slots: Vec<u8>, minute: u16) -> TestResult {
            let mut slots: Vec<u8> = slots.into_iter().map(|s| s % SLOTS_PER_DAY).filter(|&s| s != 0).collect();
            slots.push(0);
            slots.sort_unstable();
            slots.dedup();
            let entries = slots
                .iter()
                .map(|&s| ScheduleEntry { start: half_hours(s).unwrap(), value: s })
                .collect();
            let schedule = Schedule::new(entries).unwrap();
            let minute = u32::from(minute) % (24 * 60);
            let t = hm(minute / 60, minute % 60);
            let expected = slots.iter().rev().find(|&&s| half_hours(s).unwrap() <= t).copied();
            TestResult::from_bool(Some(*schedule.lookup(t)) == expected)
        }
    }
}
