use crate::error::MdtError;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Milliunits per basal stroke, on every family.
pub const BASAL_STROKE: i32 = 25;

/// Pump family: the last two digits of the model number (`523` is family 23).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Family(pub u8);

impl Family {
    /// Parse the family out of a model string such as `"523"` or `"722"`.
    pub fn from_model(model: &str) -> Result<Self, MdtError> {
        let model = model.trim();
        let digits = model.len().checked_sub(2).and_then(|start| model.get(start..));
        match digits.and_then(|d| d.parse::<u8>().ok()) {
            Some(family) if model.bytes().all(|c| c.is_ascii_digit()) => Ok(Family(family)),
            _ => Err(MdtError::BadResponse {
                opcode: crate::command::Opcode::GetModel,
                reason: format!("model {model:?} has no family digits"),
            }),
        }
    }

    /// 23+ pumps report bolus-type amounts as two-byte 25 mU stroke counts.
    pub fn has_fine_strokes(self) -> bool {
        self.0 >= 23
    }

    /// Milliunits per count of a bolus-type amount.
    pub fn bolus_step(self) -> i32 {
        if self.has_fine_strokes() { 25 } else { 100 }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{:02}", self.0)
    }
}

/// An amount of insulin in milliunits (1000 = 1 U).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Insulin(pub i32);

impl Insulin {
    pub const ZERO: Insulin = Insulin(0);

    pub const fn milliunits(self) -> i32 {
        self.0
    }

    /// Basal amounts and rates: 25 mU strokes.
    pub fn from_basal_strokes(strokes: u32) -> Self {
        Insulin(strokes as i32 * BASAL_STROKE)
    }

    /// Bolus-type amounts in the family's step.
    pub fn from_bolus_counts(counts: u32, family: Family) -> Self {
        Insulin(counts as i32 * family.bolus_step())
    }

    /// Whole 25 mU strokes, rejecting amounts that fall between strokes.
    pub fn to_basal_strokes(self) -> Result<u32, MdtError> {
        self.counts(BASAL_STROKE)
    }

    pub fn to_bolus_counts(self, family: Family) -> Result<u32, MdtError> {
        self.counts(family.bolus_step())
    }

    fn counts(self, step: i32) -> Result<u32, MdtError> {
        if self.0 < 0 || self.0 % step != 0 {
            return Err(MdtError::InvalidParameter(format!(
                "{self} U is not a whole number of {step} mU steps"
            )));
        }
        Ok((self.0 / step) as u32)
    }
}

impl fmt::Display for Insulin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:03}", abs / 1000, abs % 1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum GlucoseUnits {
    #[strum(to_string = "mg/dL")]
    MgPerDeciliter = 1,
    #[strum(to_string = "mmol/L")]
    MmolPerLiter = 2,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Glucose as stored: mg/dL, or µmol/L when the pump is set to mmol/L.
///
/// mmol/L values travel in tenths, so they are scaled by 100.
pub fn glucose_from_wire(raw: u32, units: GlucoseUnits) -> i32 {
    match units {
        GlucoseUnits::MmolPerLiter => raw as i32 * 100,
        _ => raw as i32,
    }
}

/// Carbs as stored: grams, or tenths of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum CarbUnits {
    #[strum(to_string = "g")]
    Grams = 1,
    #[strum(to_string = "exchanges")]
    Exchanges = 2,

    #[num_enum(catch_all)]
    Unknown(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_model() {
        assert_eq!(Family::from_model("523").unwrap(), Family(23));
        assert_eq!(Family::from_model("722").unwrap(), Family(22));
        assert!(Family::from_model("5").is_err());
        assert!(Family::from_model("5x3").is_err());
    }

    #[test]
    fn bolus_steps_by_family() {
        assert_eq!(Insulin::from_bolus_counts(15, Family(22)), Insulin(1500));
        assert_eq!(Insulin::from_bolus_counts(60, Family(23)), Insulin(1500));
        assert_eq!(Insulin(1500).to_bolus_counts(Family(22)).unwrap(), 15);
        assert_eq!(Insulin(1525).to_bolus_counts(Family(23)).unwrap(), 61);
        assert!(Insulin(1525).to_bolus_counts(Family(22)).is_err());
        assert!(Insulin(-100).to_bolus_counts(Family(22)).is_err());
    }

    #[test]
    fn basal_strokes() {
        assert_eq!(Insulin::from_basal_strokes(40), Insulin(1000));
        assert_eq!(Insulin(1200).to_basal_strokes().unwrap(), 48);
        assert!(Insulin(1010).to_basal_strokes().is_err());
    }

    #[test]
    fn insulin_display() {
        assert_eq!(Insulin(1000).to_string(), "1.000");
        assert_eq!(Insulin(25).to_string(), "0.025");
        assert_eq!(Insulin(-1500).to_string(), "-1.500");
    }

    #[test]
    fn glucose_scaling() {
        assert_eq!(glucose_from_wire(120, GlucoseUnits::MgPerDeciliter), 120);
        assert_eq!(glucose_from_wire(55, GlucoseUnits::MmolPerLiter), 5500);
    }

    #[test]
    fn unit_codes() {
        assert_eq!(GlucoseUnits::from(1), GlucoseUnits::MgPerDeciliter);
        assert_eq!(CarbUnits::from(2).to_string(), "exchanges");
        assert_eq!(CarbUnits::from(9), CarbUnits::Unknown(9));
    }
}
