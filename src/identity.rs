//! Durable device identity.

use serde::{Deserialize, Serialize};

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// Canonical form of a MAC address: lower-case hex without separators.
///
/// ```
/// use pixelair_rs::normalize_mac;
///
/// assert_eq!(normalize_mac("AA:BB:CC:00:11:22").unwrap(), "aabbcc001122");
/// assert_eq!(normalize_mac("aa-bb-cc-00-11-22").unwrap(), "aabbcc001122");
/// assert!(normalize_mac("not a mac").is_err());
/// ```
pub fn normalize_mac(mac: &str) -> Result<String> {
    let normalized: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if normalized.len() == 12 && normalized.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(normalized)
    } else {
        Err(Error::InvalidMac(mac.to_string()))
    }
}

/// The `(mac, serial)` pair that re-finds a device across address changes.
///
/// The MAC address is the identity; the serial number is carried for
/// display and disambiguation only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    mac_address: String,
    serial_number: String,
}

impl DeviceIdentity {
    pub fn new(mac_address: &str, serial_number: &str) -> Result<Self> {
        Ok(DeviceIdentity {
            mac_address: normalize_mac(mac_address)?,
            serial_number: serial_number.to_string(),
        })
    }

    /// For MACs that already went through [`normalize_mac`].
    pub(crate) fn from_normalized(mac_address: &str, serial_number: &str) -> Self {
        DeviceIdentity {
            mac_address: mac_address.to_string(),
            serial_number: serial_number.to_string(),
        }
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }
}

/// The record a host stores to re-attach a device after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "name")]
    pub display_name: String,
    pub mac_address: String,
    pub serial_number: String,
}

impl IdentityRecord {
    pub fn identity(&self) -> Result<DeviceIdentity> {
        DeviceIdentity::new(&self.mac_address, &self.serial_number)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::JsonLoad)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::JsonDump)
    }
}
