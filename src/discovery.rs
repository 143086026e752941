//! Device discovery over the shared transport.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};

use crate::errors::Error;
use crate::identity::{DeviceIdentity, IdentityRecord};
use crate::link::ProbeReply;
use crate::runtime::Instant;
use crate::state::DeviceState;
use crate::transport::TransportHandle;

type Result<T> = std::result::Result<T, Error>;

/// A PixelAir device found on the network.
///
/// Only lives for the duration of one setup flow; store its
/// [`record`](Self::record) to re-attach it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub mac_address: String,
    pub serial_number: String,
    pub ip_address: Ipv4Addr,
    pub display_name: String,
    pub model: Option<String>,
}

impl DiscoveredDevice {
    fn new(reply: ProbeReply, state: &DeviceState) -> Self {
        let display_name = state
            .nickname()
            .or(state.model())
            .map(String::from)
            .unwrap_or_else(|| format!("PixelAir {}", reply.serial_number));

        DiscoveredDevice {
            mac_address: reply.mac_address,
            serial_number: reply.serial_number,
            ip_address: reply.ip,
            display_name,
            model: state.model().map(String::from),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::from_normalized(&self.mac_address, &self.serial_number)
    }

    /// The durable record a host stores for this device.
    pub fn record(&self) -> IdentityRecord {
        IdentityRecord {
            display_name: self.display_name.clone(),
            mac_address: self.mac_address.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}

/// Finds devices through a [`TransportHandle`].
///
/// The service does not own a reference: whoever acquired the handle
/// releases it.
pub struct DiscoveryService {
    transport: TransportHandle,
}

impl DiscoveryService {
    pub fn new(transport: TransportHandle) -> Self {
        DiscoveryService { transport }
    }

    /// Broadcast a probe, listen for `timeout`, then fetch the full info of
    /// every responder within `state_timeout` each.
    ///
    /// Responders whose info cannot be fetched are dropped. Silence is an
    /// empty list, not an error. Results are ordered by MAC address.
    pub async fn discover_all(
        &self,
        timeout: Duration,
        state_timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        let replies = match self.transport.link().broadcast_probe(timeout).await {
            Ok(replies) => replies,
            Err(e) if e.is_no_response() => {
                debug!("discovery round got no answers: {e}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        debug!("{} device(s) answered the broadcast", replies.len());

        let lookups = replies
            .into_iter()
            .map(|reply| self.describe(reply, state_timeout));
        let mut devices: Vec<DiscoveredDevice> =
            join_all(lookups).await.into_iter().flatten().collect();
        devices.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));

        info!("discovered {} device(s)", devices.len());
        Ok(devices)
    }

    async fn describe(&self, reply: ProbeReply, state_timeout: Duration) -> Option<DiscoveredDevice> {
        match self.transport.link().fetch_state(reply.ip, state_timeout).await {
            Ok(state) => Some(DiscoveredDevice::new(reply, &state)),
            Err(e) => {
                warn!(
                    "dropping {} at {}: info fetch failed: {e}",
                    reply.mac_address, reply.ip
                );
                None
            }
        }
    }

    /// Probe a single address, e.g. a host that just got a DHCP lease.
    ///
    /// `Ok(None)` means nothing of our kind answered within `timeout`; that
    /// is the common outcome and not an error.
    pub async fn verify_address(
        &self,
        ip: Ipv4Addr,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>> {
        match self.get_device_info(ip, timeout).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_no_response() => {
                debug!("{ip} is not a pixelair device: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Probe `ip` and fetch its full info, all within `timeout`.
    pub async fn get_device_info(&self, ip: Ipv4Addr, timeout: Duration) -> Result<DiscoveredDevice> {
        let started = Instant::now();
        let link = self.transport.link();

        let reply = link.probe(ip, timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        let state = link.fetch_state(ip, remaining).await?;
        Ok(DiscoveredDevice::new(reply, &state))
    }
}
