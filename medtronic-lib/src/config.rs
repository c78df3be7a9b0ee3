//! Session configuration and the `MEDTRONIC_*` environment knobs.

use crate::command::DeviceId;
use crate::error::MdtError;
use crate::radio::DEFAULT_FREQUENCY;
use std::time::Duration;

pub const ENV_PUMP_ID: &str = "MEDTRONIC_PUMP_ID";
pub const ENV_FREQUENCY: &str = "MEDTRONIC_FREQUENCY";
pub const ENV_REMOTE_ID: &str = "MEDTRONIC_REMOTE_ID";

/// Accepted carrier range in Hz.
pub const FREQUENCY_RANGE: std::ops::RangeInclusive<u32> = 860_000_000..=920_000_000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub pump_id: DeviceId,
    /// Carrier frequency in Hz.
    pub frequency: u32,
    /// Per-attempt receive timeout.
    pub timeout: Duration,
    /// Attempts per query command. State-changing commands always use one.
    pub retries: usize,
    pub remote_id: Option<DeviceId>,
}

impl SessionConfig {
    pub fn new(pump_id: DeviceId) -> Self {
        Self {
            pump_id,
            frequency: DEFAULT_FREQUENCY,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            remote_id: None,
        }
    }

    /// Read the `MEDTRONIC_*` variables from the process environment.
    pub fn from_env() -> Result<Self, MdtError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from a variable lookup.
    ///
    /// The pump id is required; frequency and remote id are optional.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MdtError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pump_id = lookup(ENV_PUMP_ID)
            .ok_or_else(|| MdtError::Config(format!("{ENV_PUMP_ID} is not set")))?
            .parse()?;
        let mut config = Self::new(pump_id);
        if let Some(value) = lookup(ENV_FREQUENCY) {
            config.frequency = parse_frequency(&value)?;
        }
        if let Some(value) = lookup(ENV_REMOTE_ID) {
            config.remote_id = Some(value.parse()?);
        }
        Ok(config)
    }

    pub fn with_frequency(mut self, frequency: u32) -> Result<Self, MdtError> {
        if !FREQUENCY_RANGE.contains(&frequency) {
            return Err(MdtError::Config(format!("frequency {frequency} Hz out of range")));
        }
        self.frequency = frequency;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, MdtError> {
        if timeout.is_zero() {
            return Err(MdtError::InvalidParameter("reply timeout must be non-zero".to_string()));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }
}

/// Parse a frequency given either as integer Hz (`916600000`) or decimal MHz (`916.6`).
pub fn parse_frequency(value: &str) -> Result<u32, MdtError> {
    let value = value.trim();
    let hz = if let Ok(hz) = value.parse::<u32>() {
        if FREQUENCY_RANGE.contains(&hz) {
            Some(hz)
        } else if (860..=920).contains(&hz) {
            Some(hz * 1_000_000)
        } else {
            None
        }
    } else {
        value
            .parse::<f64>()
            .ok()
            .filter(|mhz| (860.0..=920.0).contains(mhz))
            .map(|mhz| (mhz * 1e6).round() as u32)
    };
    hz.ok_or_else(|| MdtError::Config(format!("invalid frequency {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::from_lookup(lookup(&[(ENV_PUMP_ID, "128986")])).unwrap();
        assert_eq!(config.pump_id.bytes(), [0x12, 0x89, 0x86]);
        assert_eq!(config.frequency, 916_600_000);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.retries, 3);
        assert_eq!(config.remote_id, None);
    }

    #[test]
    fn all_knobs() {
        let config = SessionConfig::from_lookup(lookup(&[
            (ENV_PUMP_ID, "128986"),
            (ENV_FREQUENCY, "868.35"),
            (ENV_REMOTE_ID, "111111"),
        ]))
        .unwrap();
        assert_eq!(config.frequency, 868_350_000);
        assert_eq!(config.remote_id.unwrap().bytes(), [0x11, 0x11, 0x11]);
    }

    #[test]
    fn missing_pump_id() {
        let err = SessionConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, MdtError::Config(_)));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SessionConfig::new("128986".parse().unwrap());
        let err = config.clone().with_timeout(Duration::ZERO).unwrap_err();
        assert!(matches!(err, MdtError::InvalidParameter(_)));
        let config = config.with_timeout(Duration::from_millis(250)).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn frequency_formats() {
        assert_eq!(parse_frequency("916600000").unwrap(), 916_600_000);
        assert_eq!(parse_frequency("916.6").unwrap(), 916_600_000);
        assert_eq!(parse_frequency("916").unwrap(), 916_000_000);
        assert!(parse_frequency("433.92").is_err());
        assert!(parse_frequency("950000000").is_err());
        assert!(parse_frequency("fast").is_err());
    }
}
