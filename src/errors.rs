use std::{net::Ipv4Addr, string::FromUtf8Error};

/// All error types that can occur when talking to PixelAir devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(serde_json::Error),

    /// Failed to deserialize JSON data.
    #[error("failed to load json: {0:?}")]
    JsonLoad(serde_json::Error),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },

    /// A datagram from a device contained invalid UTF-8.
    #[error("utf8 decoding error: {0:?}")]
    Utf8Decode(FromUtf8Error),

    /// A network operation did not complete before its deadline.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// The responder does not speak the PixelAir protocol.
    #[error("device at {ip} is not a pixelair device: {reason}")]
    ProtocolMismatch { ip: Ipv4Addr, reason: String },

    /// The device answered a command with an error.
    #[error("device at {ip} rejected {method}: {reason}")]
    CommandRejected {
        ip: Ipv4Addr,
        method: String,
        reason: String,
    },

    /// No device with the given MAC address answered.
    #[error("device {0} not found on the network")]
    DeviceNotFound(String),

    /// The initial state of a device could not be read.
    #[error("device {mac} unreachable: {reason}")]
    DeviceUnreachable { mac: String, reason: String },

    /// A normalized value was outside of `0.0..=1.0`.
    #[error("invalid {name} value {value}; expected 0.0..=1.0")]
    InvalidLevel { name: &'static str, value: f32 },

    /// A string could not be parsed as an effect id.
    #[error("invalid effect id: {0}")]
    InvalidEffectId(String),

    /// A string could not be parsed as a MAC address.
    #[error("invalid mac address: {0}")]
    InvalidMac(String),

    /// The shared transport was closed while an operation was using it.
    #[error("transport closed")]
    TransportClosed,

    /// A device is already attached under this MAC address.
    #[error("device {0} is already attached")]
    AlreadyAttached(String),

    /// No device is attached under this MAC address.
    #[error("device {0} is not attached")]
    NotAttached(String),

    /// A setup selection referenced a serial number that was not offered.
    #[error("no discovered device with serial {0}")]
    UnknownSerial(String),

    /// A setup flow step was called out of order.
    #[error("setup flow has no device awaiting {0}")]
    NothingPending(&'static str),
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new timeout error
    pub fn timeout(operation: &str) -> Self {
        Error::Timeout {
            operation: operation.to_string(),
        }
    }

    /// Create a new protocol mismatch error
    pub fn protocol_mismatch(ip: Ipv4Addr, reason: &str) -> Self {
        Error::ProtocolMismatch {
            ip,
            reason: reason.to_string(),
        }
    }

    /// Create a new device unreachable error
    pub fn unreachable(mac: &str, reason: impl ToString) -> Self {
        Error::DeviceUnreachable {
            mac: mac.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means "nobody of our kind answered" rather than a
    /// local fault. Discovery turns these into absent results.
    pub fn is_no_response(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ProtocolMismatch { .. })
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
