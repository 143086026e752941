//! The boundary between the sync layer and the device wire protocol.
//!
//! Everything above this module talks to devices through [`Link`]; the
//! byte-level encoding lives behind it. [`crate::UdpLink`] is the UDP
//! implementation used in production.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::errors::Error;
use crate::runtime::BoxFuture;
use crate::state::DeviceState;

type Result<T> = std::result::Result<T, Error>;

/// Answer to a discovery probe.
///
/// Probes are cheap: besides the identifiers they only carry the device's
/// current state counter, which is what the poll loop compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    /// Normalized MAC address, see [`crate::normalize_mac`].
    pub mac_address: String,
    pub serial_number: String,
    pub ip: Ipv4Addr,
    pub state_counter: u64,
}

/// Something a device reported without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The device pushed its full state.
    State(DeviceState),
    /// The device only announced a new counter; the state must be fetched.
    Counter(u64),
}

impl Notification {
    pub fn state_counter(&self) -> u64 {
        match self {
            Notification::State(state) => state.state_counter(),
            Notification::Counter(counter) => *counter,
        }
    }
}

/// Callback invoked for notifications of one device.
pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync + 'static>;

/// Request/response access to devices over a shared endpoint.
///
/// All methods honor the deadline they are given and fail with
/// [`Error::Timeout`] when it passes. A responder that is not a PixelAir
/// device yields [`Error::ProtocolMismatch`].
pub trait Link: Send + Sync {
    /// Broadcast a probe and collect every answer that arrives within
    /// `window`, one per MAC address.
    fn broadcast_probe(&self, window: Duration) -> BoxFuture<'_, Result<Vec<ProbeReply>>>;

    /// Find the device with the given normalized MAC, returning as soon as it
    /// answers a broadcast probe.
    fn locate<'a>(&'a self, mac: &'a str, timeout: Duration)
    -> BoxFuture<'a, Result<ProbeReply>>;

    /// Probe one address. Doubles as the counter-only query.
    fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> BoxFuture<'_, Result<ProbeReply>>;

    /// Fetch the full state of the device at `ip`.
    fn fetch_state(&self, ip: Ipv4Addr, timeout: Duration)
    -> BoxFuture<'_, Result<DeviceState>>;

    /// Send one command and wait for its acknowledgement. Never retried.
    fn send_command<'a>(
        &'a self,
        ip: Ipv4Addr,
        command: &'a Command,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>>;

    /// Route notifications from the device with this MAC to `callback`,
    /// replacing any previous subscription for it.
    fn subscribe(&self, mac: &str, callback: NotificationCallback);

    fn unsubscribe(&self, mac: &str);

    /// Close the endpoint. Pending requests fail with
    /// [`Error::TransportClosed`].
    fn close(&self);
}
