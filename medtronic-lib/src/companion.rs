//! Frames of the other devices sharing the pump's channel: the RF remote, the
//! linked glucose meter, the CGM sensor and the MySentry monitor.
//!
//! All frames here are in decoded form (before CRC-8 and 4b/6b); use
//! [`packet::encode`](crate::packet::encode) to put them on the air.

use crate::command::{DeviceId, DeviceType, Opcode};
use crate::error::MdtError;
use crate::packet;
use crate::radio::RadioOps;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::time::Duration;
use strum_macros::Display;
use tokio::time::sleep;
use tracing::{debug, info};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Copies of a remote button frame sent per press.
pub const REMOTE_REPEATS: usize = 10;
pub const REMOTE_SPACING: Duration = Duration::from_millis(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum RemoteButton {
    Suspend = 0x81,
    Bolus = 0x86,
    Act = 0x88,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// `A6 id×3 button seq`.
pub fn remote_frame(remote: DeviceId, button: RemoteButton, seq: u8) -> Vec<u8> {
    let id = remote.bytes();
    vec![DeviceType::Remote.into(), id[0], id[1], id[2], button.into(), seq]
}

/// An emulated RF remote. The sequence byte advances once per press.
#[derive(Debug, Clone)]
pub struct Remote {
    id: DeviceId,
    seq: u8,
}

impl Remote {
    pub fn new(id: DeviceId) -> Self {
        Self { id, seq: 0 }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Transmit one button press as a burst of identical frames.
    pub async fn press<R: RadioOps>(&mut self, radio: &mut R, button: RemoteButton) -> Result<(), MdtError> {
        let frame = remote_frame(self.id, button, self.seq);
        self.seq = self.seq.wrapping_add(1);
        info!("Remote {} pressing {}", self.id, button);
        debug!(frame = %hex::encode(&frame), "remote frame");
        let encoded = packet::encode(&frame);
        for i in 0..REMOTE_REPEATS {
            radio.send(&encoded).await?;
            if i + 1 < REMOTE_REPEATS {
                sleep(REMOTE_SPACING).await;
            }
        }
        Ok(())
    }
}

/// A glucose reading broadcast by a linked meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct MeterReading {
    pub meter: DeviceId,
    /// mg/dL, nine bits.
    pub glucose: u16,
}

impl MeterReading {
    /// `A5 id×3 flags glucose_lo`, bit 0 of `flags` carrying glucose bit 8.
    pub fn to_frame(&self) -> Result<Vec<u8>, MdtError> {
        if self.glucose > 0x1FF {
            return Err(MdtError::InvalidParameter(format!("meter glucose {}", self.glucose)));
        }
        let id = self.meter.bytes();
        Ok(vec![
            DeviceType::Meter.into(),
            id[0],
            id[1],
            id[2],
            (self.glucose >> 8) as u8,
            self.glucose as u8,
        ])
    }

    pub fn parse(frame: &[u8]) -> Result<Self, MdtError> {
        match frame {
            [0xA5, a, b, c, flags, lo, ..] => Ok(Self {
                meter: DeviceId::new([*a, *b, *c]),
                glucose: u16::from(flags & 0x01) << 8 | u16::from(*lo),
            }),
            _ => Err(short(frame, DeviceType::Meter)),
        }
    }
}

/// Header of a CGM sensor transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SensorPacket {
    pub sensor: DeviceId,
    pub opcode: u8,
    pub body: Vec<u8>,
}

impl SensorPacket {
    pub fn parse(frame: &[u8]) -> Result<Self, MdtError> {
        match frame {
            [0xA8, a, b, c, opcode, body @ ..] => Ok(Self {
                sensor: DeviceId::new([*a, *b, *c]),
                opcode: *opcode,
                body: body.to_vec(),
            }),
            _ => Err(short(frame, DeviceType::Sensor)),
        }
    }
}

/// Header of a MySentry status broadcast from the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct MySentryPacket {
    pub pump: DeviceId,
    pub opcode: u8,
    pub seq: u8,
    pub body: Vec<u8>,
}

impl MySentryPacket {
    pub fn parse(frame: &[u8]) -> Result<Self, MdtError> {
        match frame {
            [0xA2, a, b, c, opcode, seq, body @ ..] => Ok(Self {
                pump: DeviceId::new([*a, *b, *c]),
                opcode: *opcode,
                seq: *seq,
                body: body.to_vec(),
            }),
            _ => Err(short(frame, DeviceType::MySentry)),
        }
    }

    /// `A2 id×3 06 seq`; the pump repeats a broadcast until this arrives.
    pub fn ack(&self) -> Vec<u8> {
        let id = self.pump.bytes();
        vec![DeviceType::MySentry.into(), id[0], id[1], id[2], Opcode::Ack.into(), self.seq]
    }
}

/// Any decoded frame, classified by its device-type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CompanionPacket {
    Pump { pump: DeviceId, opcode: Opcode, payload: Vec<u8> },
    Remote { remote: DeviceId, button: RemoteButton, seq: u8 },
    Meter(MeterReading),
    Sensor(SensorPacket),
    MySentry(MySentryPacket),
    Unknown(Vec<u8>),
}

impl CompanionPacket {
    pub fn parse(frame: &[u8]) -> Result<Self, MdtError> {
        let Some(&kind) = frame.first() else {
            return Err(MdtError::Empty);
        };
        let packet = match DeviceType::from(kind) {
            DeviceType::Pump => match frame {
                [_, a, b, c, opcode, payload @ ..] => CompanionPacket::Pump {
                    pump: DeviceId::new([*a, *b, *c]),
                    opcode: Opcode::from(*opcode),
                    payload: payload.to_vec(),
                },
                _ => return Err(short(frame, DeviceType::Pump)),
            },
            DeviceType::Remote => match frame {
                [_, a, b, c, button, seq, ..] => CompanionPacket::Remote {
                    remote: DeviceId::new([*a, *b, *c]),
                    button: RemoteButton::from(*button),
                    seq: *seq,
                },
                _ => return Err(short(frame, DeviceType::Remote)),
            },
            DeviceType::Meter => CompanionPacket::Meter(MeterReading::parse(frame)?),
            DeviceType::Sensor => CompanionPacket::Sensor(SensorPacket::parse(frame)?),
            DeviceType::MySentry => CompanionPacket::MySentry(MySentryPacket::parse(frame)?),
            DeviceType::Unknown(_) => CompanionPacket::Unknown(frame.to_vec()),
        };
        Ok(packet)
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        match self {
            CompanionPacket::Pump { .. } => Some(DeviceType::Pump),
            CompanionPacket::Remote { .. } => Some(DeviceType::Remote),
            CompanionPacket::Meter(_) => Some(DeviceType::Meter),
            CompanionPacket::Sensor(_) => Some(DeviceType::Sensor),
            CompanionPacket::MySentry(_) => Some(DeviceType::MySentry),
            CompanionPacket::Unknown(_) => None,
        }
    }
}

fn short(frame: &[u8], kind: DeviceType) -> MdtError {
    MdtError::InvalidParameter(format!("{kind} frame too short: {}", hex::encode(frame)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DeviceId {
        "111111".parse().unwrap()
    }

    #[test]
    fn remote_frames() {
        let frame = remote_frame(id(), RemoteButton::Bolus, 3);
        assert_eq!(frame, [0xA6, 0x11, 0x11, 0x11, 0x86, 0x03]);
        assert_eq!(
            CompanionPacket::parse(&frame).unwrap(),
            CompanionPacket::Remote {
                remote: id(),
                button: RemoteButton::Bolus,
                seq: 3
            }
        );
    }

    #[test]
    fn meter_ninth_bit() {
        let reading = MeterReading {
            meter: id(),
            glucose: 300,
        };
        let frame = reading.to_frame().unwrap();
        assert_eq!(frame, [0xA5, 0x11, 0x11, 0x11, 0x01, 0x2C]);
        assert_eq!(MeterReading::parse(&frame).unwrap(), reading);
        assert!(
            MeterReading {
                meter: id(),
                glucose: 600
            }
            .to_frame()
            .is_err()
        );
    }

    #[test]
    fn mysentry_ack() {
        let frame = [0xA2, 0x12, 0x89, 0x86, 0x04, 0x07, 0xAA];
        let CompanionPacket::MySentry(status) = CompanionPacket::parse(&frame).unwrap() else {
            panic!("not a MySentry frame");
        };
        assert_eq!(status.seq, 7);
        assert_eq!(status.body, [0xAA]);
        assert_eq!(status.ack(), [0xA2, 0x12, 0x89, 0x86, 0x06, 0x07]);
    }

    #[test]
    fn classifies_pump_and_sensor() {
        let pump = CompanionPacket::parse(&[0xA7, 0x12, 0x89, 0x86, 0x8D, 0x03]).unwrap();
        assert_eq!(pump.device_type(), Some(DeviceType::Pump));
        let sensor = CompanionPacket::parse(&[0xA8, 0x01, 0x02, 0x03, 0x0F]).unwrap();
        assert!(matches!(sensor, CompanionPacket::Sensor(SensorPacket { opcode: 0x0F, .. })));
        assert!(CompanionPacket::parse(&[0xA8, 0x01]).is_err());
        assert_eq!(
            CompanionPacket::parse(&[0x42, 0x00]).unwrap(),
            CompanionPacket::Unknown(vec![0x42, 0x00])
        );
    }
}
