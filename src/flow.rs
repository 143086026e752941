//! Guided setup: pick a new device and produce its identity record.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, info};

use crate::discovery::{DiscoveredDevice, DiscoveryService};
use crate::errors::Error;
use crate::identity::{IdentityRecord, normalize_mac};

type Result<T> = std::result::Result<T, Error>;

/// One entry of a device selection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub serial_number: String,
    /// `"<display name> (<ip>)"`
    pub label: String,
}

impl From<&DiscoveredDevice> for SelectOption {
    fn from(device: &DiscoveredDevice) -> Self {
        SelectOption {
            serial_number: device.serial_number.clone(),
            label: format!("{} ({})", device.display_name, device.ip_address),
        }
    }
}

/// Where a setup flow stands after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    /// Nothing answered the broadcast.
    NoDevicesFound,
    /// Devices answered, but every one is already registered.
    AllDevicesConfigured,
    /// The DHCP-reported device is already registered.
    AlreadyConfigured,
    /// The probed host is not a PixelAir device, or not the one DHCP named.
    NotADevice,
    /// Exactly one candidate; waiting for [`SetupFlow::confirm`].
    Confirm(DiscoveredDevice),
    /// Several candidates; pick one with [`SetupFlow::select`].
    Select(Vec<SelectOption>),
}

/// Decides which discovered device to set up.
///
/// Identity is always the normalized MAC; serial numbers only key the
/// selection list.
#[derive(Debug, Default)]
pub struct SetupFlow {
    registered: HashSet<String>,
    candidates: Vec<DiscoveredDevice>,
    pending: Option<DiscoveredDevice>,
}

impl SetupFlow {
    /// Start a flow that skips the given MAC addresses. Malformed entries
    /// cannot match anything and are ignored.
    pub fn new<I, S>(registered: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        SetupFlow {
            registered: registered
                .into_iter()
                .filter_map(|mac| normalize_mac(mac.as_ref()).ok())
                .collect(),
            ..SetupFlow::default()
        }
    }

    pub fn is_registered(&self, mac: &str) -> bool {
        normalize_mac(mac).is_ok_and(|mac| self.registered.contains(&mac))
    }

    /// The device awaiting confirmation, if any.
    pub fn pending(&self) -> Option<&DiscoveredDevice> {
        self.pending.as_ref()
    }

    /// Apply the disambiguation rule to one discovery round.
    pub fn evaluate(&mut self, devices: Vec<DiscoveredDevice>) -> SetupStep {
        self.candidates.clear();
        self.pending = None;

        if devices.is_empty() {
            return SetupStep::NoDevicesFound;
        }

        let mut fresh: Vec<DiscoveredDevice> = devices
            .into_iter()
            .filter(|device| !self.registered.contains(&device.mac_address))
            .collect();

        match fresh.len() {
            0 => SetupStep::AllDevicesConfigured,
            1 => {
                let device = fresh.remove(0);
                self.pending = Some(device.clone());
                SetupStep::Confirm(device)
            }
            _ => {
                let options = fresh.iter().map(SelectOption::from).collect();
                self.candidates = fresh;
                SetupStep::Select(options)
            }
        }
    }

    /// Run one discovery round and evaluate it.
    pub async fn discover(
        &mut self,
        service: &DiscoveryService,
        timeout: Duration,
        state_timeout: Duration,
    ) -> Result<SetupStep> {
        let devices = service.discover_all(timeout, state_timeout).await?;
        Ok(self.evaluate(devices))
    }

    /// Choose among the candidates of the last round by serial number.
    pub fn select(&mut self, serial_number: &str) -> Result<SetupStep> {
        let device = self
            .candidates
            .iter()
            .find(|device| device.serial_number == serial_number)
            .cloned()
            .ok_or_else(|| Error::UnknownSerial(serial_number.to_string()))?;

        self.pending = Some(device.clone());
        Ok(SetupStep::Confirm(device))
    }

    /// Check a host reported by DHCP.
    ///
    /// The device must answer at `ip` and report the MAC DHCP saw.
    pub async fn verify_dhcp(
        &mut self,
        service: &DiscoveryService,
        ip: Ipv4Addr,
        mac: &str,
        timeout: Duration,
    ) -> Result<SetupStep> {
        let mac = normalize_mac(mac)?;
        self.candidates.clear();
        self.pending = None;

        if self.registered.contains(&mac) {
            return Ok(SetupStep::AlreadyConfigured);
        }

        match service.verify_address(ip, timeout).await? {
            Some(device) if device.mac_address == mac => {
                info!("dhcp host {ip} is {}", device.display_name);
                self.pending = Some(device.clone());
                Ok(SetupStep::Confirm(device))
            }
            Some(device) => {
                debug!("mac mismatch at {ip}: expected {mac}, got {}", device.mac_address);
                Ok(SetupStep::NotADevice)
            }
            None => Ok(SetupStep::NotADevice),
        }
    }

    /// Accept the pending device and return the record to persist.
    pub fn confirm(&mut self) -> Result<IdentityRecord> {
        let device = self.pending.take().ok_or(Error::NothingPending("confirmation"))?;
        if !self.registered.insert(device.mac_address.clone()) {
            return Err(Error::AlreadyAttached(device.mac_address));
        }
        self.candidates.clear();
        Ok(device.record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use crate::state::sample_state;
    use crate::transport::mock_manager;
    use std::sync::Arc;

    const SECOND: Duration = Duration::from_secs(1);

    fn device(mac: &str, serial: &str, last_octet: u8) -> DiscoveredDevice {
        DiscoveredDevice {
            mac_address: mac.to_string(),
            serial_number: serial.to_string(),
            ip_address: Ipv4Addr::new(10, 0, 0, last_octet),
            display_name: "Fluora".to_string(),
            model: Some("Fluora".to_string()),
        }
    }

    async fn service(link: &Arc<MockLink>) -> DiscoveryService {
        DiscoveryService::new(mock_manager(link.clone()).acquire().await.unwrap())
    }

    #[test]
    fn test_evaluate_outcomes() {
        let mut flow = SetupFlow::new(["AA:AA:AA:AA:AA:AA"]);

        assert_eq!(flow.evaluate(vec![]), SetupStep::NoDevicesFound);
        assert_eq!(
            flow.evaluate(vec![device("aaaaaaaaaaaa", "SN-001", 11)]),
            SetupStep::AllDevicesConfigured
        );
        assert_eq!(
            flow.evaluate(vec![
                device("aaaaaaaaaaaa", "SN-001", 11),
                device("bbbbbbbbbbbb", "SN-002", 12),
            ]),
            SetupStep::Confirm(device("bbbbbbbbbbbb", "SN-002", 12))
        );
    }

    #[test]
    fn test_select_by_serial() {
        let mut flow = SetupFlow::new(Vec::<String>::new());
        let step = flow.evaluate(vec![
            device("aaaaaaaaaaaa", "SN-001", 11),
            device("bbbbbbbbbbbb", "SN-002", 12),
        ]);
        let SetupStep::Select(options) = step else {
            panic!("expected a selection, got {step:?}");
        };
        assert_eq!(options[1].label, "Fluora (10.0.0.12)");

        let record = match flow.select("SN-002").unwrap() {
            SetupStep::Confirm(_) => flow.confirm().unwrap(),
            other => panic!("expected confirmation, got {other:?}"),
        };
        assert_eq!(record.serial_number, "SN-002");
        assert_eq!(record.mac_address, "bbbbbbbbbbbb");
        assert!(flow.is_registered("BB:BB:BB:BB:BB:BB"));
    }

    #[test]
    fn test_select_unknown_serial() {
        let mut flow = SetupFlow::new(Vec::<String>::new());
        flow.evaluate(vec![
            device("aaaaaaaaaaaa", "SN-001", 11),
            device("bbbbbbbbbbbb", "SN-002", 12),
        ]);
        assert_eq!(
            flow.select("SN-404").unwrap_err(),
            Error::UnknownSerial("SN-404".to_string())
        );
        assert_eq!(
            flow.confirm().unwrap_err(),
            Error::NothingPending("confirmation")
        );
    }

    #[tokio::test]
    async fn test_discover_then_confirm() {
        let link = MockLink::new();
        link.add_device("aaaaaaaaaaaa", "SN-001", Ipv4Addr::new(10, 0, 0, 11), sample_state(1));
        let service = service(&link).await;

        let mut flow = SetupFlow::new(Vec::<String>::new());
        let step = flow.discover(&service, SECOND, SECOND).await.unwrap();
        assert!(matches!(step, SetupStep::Confirm(ref d) if d.serial_number == "SN-001"));
        assert_eq!(flow.confirm().unwrap().display_name, "Living Room Tree");
    }

    #[tokio::test]
    async fn test_verify_dhcp() {
        let link = MockLink::new();
        link.add_device("aaaaaaaaaaaa", "SN-001", Ipv4Addr::new(10, 0, 0, 11), sample_state(1));
        link.add_foreign(Ipv4Addr::new(10, 0, 0, 40));
        let service = service(&link).await;
        let mut flow = SetupFlow::new(["cccccccccccc"]);

        let step = flow
            .verify_dhcp(&service, Ipv4Addr::new(10, 0, 0, 11), "AA:AA:AA:AA:AA:AA", SECOND)
            .await
            .unwrap();
        assert!(matches!(step, SetupStep::Confirm(_)));

        // Right address, wrong mac.
        let step = flow
            .verify_dhcp(&service, Ipv4Addr::new(10, 0, 0, 11), "dddddddddddd", SECOND)
            .await
            .unwrap();
        assert_eq!(step, SetupStep::NotADevice);
        assert!(flow.pending().is_none());

        let step = flow
            .verify_dhcp(&service, Ipv4Addr::new(10, 0, 0, 40), "eeeeeeeeeeee", SECOND)
            .await
            .unwrap();
        assert_eq!(step, SetupStep::NotADevice);

        let step = flow
            .verify_dhcp(&service, Ipv4Addr::new(10, 0, 0, 77), "CC:CC:CC:CC:CC:CC", SECOND)
            .await
            .unwrap();
        assert_eq!(step, SetupStep::AlreadyConfigured);
        assert_eq!(link.probes(), 3);
    }
}
