use crate::command::Opcode;
use std::fmt;
use thiserror::Error;

/// The primary error type for the `medtronic-lib` library.
///
/// Every variant carries just enough context to reconstruct what went wrong.
/// The type is `Clone` because the pump session keeps the last failure as a
/// sticky value and hands copies back to later calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MdtError {
    #[error("Radio hardware version mismatch: expected {expected:#06x}, found {actual:#06x}")]
    HardwareVersionMismatch { expected: u16, actual: u16 },

    #[error("SPI failure during {operation}: {detail}")]
    SpiFailure { operation: &'static str, detail: String },

    #[error("GPIO failure during {operation}: {detail}")]
    GpioFailure { operation: &'static str, detail: String },

    #[error("Radio did not reach {target} mode")]
    ModeChangeTimeout { target: String },

    #[error("TX FIFO underflow")]
    TxFifoUnderflow,

    #[error("RX FIFO overflow")]
    RxFifoOverflow,

    #[error("Packet too large: {n} bytes (maximum {max})")]
    PacketTooLarge { n: usize, max: usize },

    #[error("Invalid 4b/6b symbol at octet {index}")]
    InvalidSymbol { index: usize },

    #[error("Bad CRC: expected {expected:#04x}, got {actual:#04x}")]
    BadCrc { expected: u8, actual: u8 },

    #[error("Empty packet")]
    Empty,

    #[error("Unexpected response to {opcode}: {}", hex::encode(.bytes))]
    UnexpectedResponse { opcode: Opcode, bytes: Vec<u8> },

    #[error("Invalid {opcode} response: {reason}")]
    BadResponse { opcode: Opcode, reason: String },

    #[error("No response to {opcode}")]
    NoResponse { opcode: Opcode },

    #[error("Page checksum mismatch: computed {expected:#06x}, page carries {actual:#06x}")]
    PageChecksum { expected: u16, actual: u16 },

    #[error("Page has {n} bytes instead of 1024")]
    PageSize { n: usize },

    #[error("Unknown record type {:#04x}: {}", .data.first().copied().unwrap_or_default(), hex::encode(.data))]
    UnknownRecordType { data: Vec<u8> },

    #[error("Truncated record: have {have} bytes, need {need}")]
    TruncatedRecord { have: usize, need: usize },

    #[error("CGM records need a timestamp anchor")]
    NeedsTimestamp,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MdtError {
    /// Codec-level failures consume one retry inside the session instead of
    /// aborting the exchange.
    pub fn is_codec(&self) -> bool {
        matches!(
            self,
            MdtError::InvalidSymbol { .. } | MdtError::BadCrc { .. } | MdtError::Empty
        )
    }

    pub(crate) fn bad_response(opcode: Opcode, reason: impl Into<String>) -> Self {
        MdtError::BadResponse {
            opcode,
            reason: reason.into(),
        }
    }
}

/// Records decoded before a decoder failure, returned together with the failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error} (after {} decoded records)", .records.len())]
pub struct PartialDecode<T: fmt::Debug> {
    pub records: Vec<T>,
    pub error: MdtError,
}

impl<T: fmt::Debug> PartialDecode<T> {
    pub fn new(records: Vec<T>, error: MdtError) -> Self {
        Self { records, error }
    }
}

impl<T: fmt::Debug> From<MdtError> for PartialDecode<T> {
    fn from(error: MdtError) -> Self {
        Self {
            records: Vec::new(),
            error,
        }
    }
}
