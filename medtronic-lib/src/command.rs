use crate::error::MdtError;
use bytes::{BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use std::str::FromStr;
use strum_macros::Display;

/// Device-type byte that opens every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum DeviceType {
    MySentry = 0xA2,
    Meter = 0xA5,
    Remote = 0xA6,
    Pump = 0xA7,
    Sensor = 0xA8,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Pump opcodes. Unrecognized bytes are preserved in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum Opcode {
    Ack = 0x06,
    Nak = 0x15,
    SetBasalPatternA = 0x30,
    SetBasalPatternB = 0x31,
    SetClock = 0x40,
    SetMaxBolus = 0x41,
    Bolus = 0x42,
    SelectBasalPattern = 0x4A,
    SetAbsoluteTempBasal = 0x4C,
    Suspend = 0x4D,
    Button = 0x5B,
    PowerControl = 0x5D,
    SetPercentTempBasal = 0x69,
    SetMaxBasal = 0x6E,
    GetClock = 0x70,
    GetId = 0x71,
    GetBattery = 0x72,
    Reservoir = 0x73,
    FirmwareVersion = 0x74,
    ErrorStatus = 0x75,
    HistoryPage = 0x80,
    CarbUnits = 0x88,
    GlucoseUnits = 0x89,
    CarbRatios = 0x8A,
    InsulinSensitivities = 0x8B,
    GetModel = 0x8D,
    BasalRates = 0x92,
    BasalPatternA = 0x93,
    BasalPatternB = 0x94,
    TempBasalRead = 0x98,
    GlucosePage = 0x9A,
    CalibrationFactor = 0x9C,
    LastHistoryPage = 0x9D,
    Targets = 0x9F,
    Settings = 0xC0,
    CgmPageCount = 0xCD,
    Status = 0xCE,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Opcode {
    /// Opcodes that change pump state. The pump acknowledges them with ACK
    /// instead of echoing the opcode, and they are never retried on the wire.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Opcode::PowerControl
                | Opcode::SetClock
                | Opcode::SetMaxBolus
                | Opcode::Bolus
                | Opcode::SelectBasalPattern
                | Opcode::SetAbsoluteTempBasal
                | Opcode::SetPercentTempBasal
                | Opcode::SetMaxBasal
                | Opcode::SetBasalPatternA
                | Opcode::SetBasalPatternB
                | Opcode::Suspend
                | Opcode::Button
        )
    }

    /// Opcode byte a valid reply carries at offset 4.
    pub fn expected_reply(&self) -> Opcode {
        if self.is_state_changing() { Opcode::Ack } else { *self }
    }
}

/// Three-byte device address written as six decimal digits, one per nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceId([u8; 3]);

impl DeviceId {
    pub const fn new(bytes: [u8; 3]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 3] {
        self.0
    }
}

impl FromStr for DeviceId {
    type Err = MdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|c| c.is_ascii_digit()) {
            return Err(MdtError::Config(format!("device id {s:?} must be 6 digits")));
        }
        let digits: Vec<u8> = s.bytes().map(|c| c - b'0').collect();
        Ok(Self([
            digits[0] << 4 | digits[1],
            digits[2] << 4 | digits[3],
            digits[4] << 4 | digits[5],
        ]))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Largest parameter block a single command frame carries.
pub const MAX_PARAMS: usize = 64;

/// Decoded (pre-CRC) command frame:
/// `device_type | id(3) | opcode | param_len | params`.
pub fn command_frame(pump: DeviceId, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, MdtError> {
    if params.len() > MAX_PARAMS {
        return Err(MdtError::InvalidParameter(format!(
            "{} parameter bytes for {opcode} (maximum {MAX_PARAMS})",
            params.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(6 + params.len());
    frame.put_u8(DeviceType::Pump.into());
    frame.put_slice(&pump.bytes());
    frame.put_u8(opcode.into());
    frame.put_u8(params.len() as u8);
    frame.put_slice(params);
    Ok(frame.to_vec())
}

/// Whether `reply` answers a command sent to `pump` with `expected` at offset 4.
pub fn is_reply_to(reply: &[u8], pump: DeviceId, expected: Opcode) -> bool {
    reply.len() >= 5
        && reply[0] == u8::from(DeviceType::Pump)
        && reply[1..4] == pump.bytes()
        && reply[4] == u8::from(expected)
}
