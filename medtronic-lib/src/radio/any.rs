//! Run-time choice between the two transceivers.

use super::cc1101::Cc1101;
use super::rfm69::Rfm69;
use super::{Flavor, RadioOps, RadioStats};
use crate::error::MdtError;
use crate::hw::SpiPort;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    Cc1101,
    Rfm69,
}

impl FromStr for Chip {
    type Err = MdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cc1101" | "cc1110" | "cc111x" => Ok(Chip::Cc1101),
            "rfm69" | "rfm69hcw" | "sx1231" => Ok(Chip::Rfm69),
            other => Err(MdtError::Config(format!("unknown radio chip {other:?}"))),
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chip::Cc1101 => write!(f, "cc1101"),
            Chip::Rfm69 => write!(f, "rfm69"),
        }
    }
}

/// Either driver, polled (no interrupt line).
pub enum AnyRadio<S: SpiPort> {
    Cc1101(Cc1101<S>),
    Rfm69(Rfm69<S>),
}

impl<S: SpiPort> AnyRadio<S> {
    pub async fn open_polled(chip: Chip, spi: S, frequency: u32) -> Result<Self, MdtError> {
        Ok(match chip {
            Chip::Cc1101 => AnyRadio::Cc1101(Cc1101::open_polled(spi, frequency).await?),
            Chip::Rfm69 => AnyRadio::Rfm69(Rfm69::open_polled(spi, frequency).await?),
        })
    }

    pub fn chip(&self) -> Chip {
        match self {
            AnyRadio::Cc1101(_) => Chip::Cc1101,
            AnyRadio::Rfm69(_) => Chip::Rfm69,
        }
    }
}

macro_rules! delegate {
    ($self:ident, $radio:ident => $call:expr) => {
        match $self {
            AnyRadio::Cc1101($radio) => $call,
            AnyRadio::Rfm69($radio) => $call,
        }
    };
}

impl<S: SpiPort> RadioOps for AnyRadio<S> {
    fn flavor(&self) -> &'static Flavor {
        delegate!(self, r => r.flavor())
    }

    fn frequency(&mut self) -> Result<u32, MdtError> {
        delegate!(self, r => r.frequency())
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), MdtError> {
        delegate!(self, r => r.set_frequency(hz))
    }

    fn last_rssi(&self) -> i32 {
        delegate!(self, r => r.last_rssi())
    }

    fn statistics(&self) -> RadioStats {
        delegate!(self, r => r.statistics())
    }

    fn dump_registers(&mut self) -> Result<Vec<(u8, u8)>, MdtError> {
        delegate!(self, r => r.dump_registers())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), MdtError> {
        delegate!(self, r => r.send(data).await)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<(Vec<u8>, i32), MdtError> {
        delegate!(self, r => r.receive(timeout).await)
    }

    fn close(&mut self) -> Result<(), MdtError> {
        delegate!(self, r => r.close())
    }
}
