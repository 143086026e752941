//! Timing and network settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};

use crate::errors::Error;

/// Tunables shared by discovery, sessions and coordinators.
///
/// Durations are (de)serialized as fractional seconds. Missing keys fall
/// back to the defaults.
///
/// ```
/// use std::time::Duration;
/// use pixelair_rs::Settings;
///
/// let settings = Settings::from_json(r#"{"poll_interval": 1.5}"#).unwrap();
/// assert_eq!(settings.poll_interval, Duration::from_millis(1500));
/// assert_eq!(settings.connection_timeout, Duration::from_secs(10));
/// ```
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long a broadcast discovery round listens for answers, and the
    /// per-device budget for fetching full info afterwards.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub discovery_timeout: Duration,
    /// Deadline for locating a device, fetching its state and commands.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub connection_timeout: Duration,
    /// Delay between two counter checks.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_interval: Duration,
    /// Deadline for one poll tick: the counter check plus the address
    /// re-resolution or fetch that follows it.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_timeout: Duration,
    /// Deadline for probing a host reported by DHCP.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub verify_timeout: Duration,
    /// Queries without an answer are re-sent at this interval.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub query_retry_interval: Duration,
    /// UDP port devices listen on.
    pub port: u16,
    /// Local port of the shared socket; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Consecutive failed poll ticks before a device is reported unavailable.
    pub max_missed_polls: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            discovery_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(2500),
            poll_timeout: Duration::from_secs(2),
            verify_timeout: Duration::from_secs(5),
            query_retry_interval: Duration::from_millis(750),
            port: 9000,
            listen_port: 0,
            max_missed_polls: 3,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::JsonLoad)
    }
}
