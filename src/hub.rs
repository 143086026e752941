//! Host-facing entry point: attached devices keyed by MAC address.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::config::Settings;
use crate::coordinator::{Coordinator, CoordinatorView, SubscriptionId};
use crate::discovery::{DiscoveredDevice, DiscoveryService};
use crate::errors::Error;
use crate::flow::{SetupFlow, SetupStep};
use crate::identity::{IdentityRecord, normalize_mac};
use crate::runtime::lock;
use crate::session::DeviceSession;
use crate::transport::TransportManager;

type Result<T> = std::result::Result<T, Error>;

struct Attached {
    record: IdentityRecord,
    coordinator: Arc<Coordinator>,
}

/// All devices a host has attached, sharing one transport.
///
/// # Example
///
/// ```no_run
/// # async fn run() -> Result<(), pixelair_rs::Error> {
/// use pixelair_rs::{Hub, IdentityRecord, Settings};
///
/// let hub = Hub::new(Settings::default());
/// let record = IdentityRecord::from_json(
///     r#"{"name": "Tree", "mac_address": "aabbccddeeff", "serial_number": "SN-001"}"#,
/// )?;
/// let tree = hub.attach(&record).await?;
/// tree.set_brightness(0.5).await?;
/// hub.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Hub {
    settings: Settings,
    transport: TransportManager,
    devices: Mutex<HashMap<String, Attached>>,
}

impl Hub {
    /// A hub talking UDP with `settings`.
    pub fn new(settings: Settings) -> Self {
        let transport = TransportManager::udp(&settings);
        Hub::with_transport(settings, transport)
    }

    pub fn with_transport(settings: Settings, transport: TransportManager) -> Self {
        Hub {
            settings,
            transport,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    /// Attach a stored device: locate it, read its state and start polling.
    ///
    /// Nothing is kept when the device cannot be reached; the session and
    /// its transport reference are torn down again.
    pub async fn attach(&self, record: &IdentityRecord) -> Result<Arc<Coordinator>> {
        let identity = record.identity()?;
        let mac = identity.mac_address().to_string();
        if lock(&self.devices).contains_key(&mac) {
            return Err(Error::AlreadyAttached(mac));
        }

        let session = DeviceSession::attach(identity, &self.transport, &self.settings).await?;
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&session)));
        if let Err(e) = coordinator.first_refresh().await {
            session.detach().await;
            return Err(e);
        }

        // Another attach for the same device may have finished meanwhile.
        let duplicate = {
            let mut devices = lock(&self.devices);
            if devices.contains_key(&mac) {
                true
            } else {
                devices.insert(
                    mac.clone(),
                    Attached {
                        record: IdentityRecord {
                            mac_address: mac.clone(),
                            ..record.clone()
                        },
                        coordinator: Arc::clone(&coordinator),
                    },
                );
                false
            }
        };
        if duplicate {
            session.detach().await;
            return Err(Error::AlreadyAttached(mac));
        }

        coordinator.start_polling(self.settings.poll_interval);
        info!("{} ({mac}) ready", record.display_name);
        Ok(coordinator)
    }

    /// Stop polling, detach the session and release its transport reference.
    pub async fn detach(&self, mac: &str) -> Result<()> {
        let mac = normalize_mac(mac)?;
        let attached = lock(&self.devices)
            .remove(&mac)
            .ok_or_else(|| Error::NotAttached(mac.clone()))?;

        attached.coordinator.stop_polling();
        attached.coordinator.session().detach().await;
        Ok(())
    }

    pub fn device(&self, mac: &str) -> Option<Arc<Coordinator>> {
        let mac = normalize_mac(mac).ok()?;
        lock(&self.devices)
            .get(&mac)
            .map(|attached| Arc::clone(&attached.coordinator))
    }

    /// Records of all attached devices, ordered by MAC address.
    pub fn registered(&self) -> Vec<IdentityRecord> {
        let mut records: Vec<IdentityRecord> = lock(&self.devices)
            .values()
            .map(|attached| attached.record.clone())
            .collect();
        records.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        records
    }

    pub fn subscribe<F>(&self, mac: &str, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&CoordinatorView) + Send + Sync + 'static,
    {
        self.device(mac)
            .map(|coordinator| coordinator.subscribe(callback))
            .ok_or_else(|| Error::NotAttached(mac.to_string()))
    }

    /// One broadcast round with full device info.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let transport = self.transport.acquire().await?;
        let outcome = DiscoveryService::new(transport.clone())
            .discover_all(self.settings.discovery_timeout, self.settings.discovery_timeout)
            .await;
        self.transport.release(&transport).await;
        outcome
    }

    /// A setup flow that skips every attached device.
    pub fn setup_flow(&self) -> SetupFlow {
        SetupFlow::new(lock(&self.devices).keys())
    }

    pub async fn run_discovery_flow(&self, flow: &mut SetupFlow) -> Result<SetupStep> {
        let transport = self.transport.acquire().await?;
        let timeout = self.settings.discovery_timeout;
        let outcome = flow
            .discover(&DiscoveryService::new(transport.clone()), timeout, timeout)
            .await;
        self.transport.release(&transport).await;
        outcome
    }

    /// Check a host the DHCP server just handed an address to.
    pub async fn run_dhcp_flow(
        &self,
        flow: &mut SetupFlow,
        ip: Ipv4Addr,
        mac: &str,
    ) -> Result<SetupStep> {
        let transport = self.transport.acquire().await?;
        let outcome = flow
            .verify_dhcp(
                &DiscoveryService::new(transport.clone()),
                ip,
                mac,
                self.settings.verify_timeout,
            )
            .await;
        self.transport.release(&transport).await;
        outcome
    }

    /// Detach every device.
    pub async fn shutdown(&self) {
        let macs: Vec<String> = lock(&self.devices).keys().cloned().collect();
        for mac in macs {
            if let Err(e) = self.detach(&mac).await {
                warn!("failed to detach {mac}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use crate::state::sample_state;
    use crate::transport::mock_manager;

    fn record(mac: &str, serial: &str) -> IdentityRecord {
        IdentityRecord {
            display_name: "Tree".to_string(),
            mac_address: mac.to_string(),
            serial_number: serial.to_string(),
        }
    }

    fn network() -> (Arc<MockLink>, Hub) {
        let link = MockLink::new();
        link.add_device("aaaaaaaaaaaa", "SN-001", Ipv4Addr::new(10, 0, 0, 11), sample_state(1));
        link.add_device("bbbbbbbbbbbb", "SN-002", Ipv4Addr::new(10, 0, 0, 12), sample_state(1));
        let hub = Hub::with_transport(Settings::default(), mock_manager(link.clone()));
        (link, hub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_and_detach() {
        let (link, hub) = network();

        let coordinator = hub.attach(&record("AA:AA:AA:AA:AA:AA", "SN-001")).await.unwrap();
        assert!(coordinator.view().available());
        assert_eq!(hub.registered()[0].mac_address, "aaaaaaaaaaaa");
        assert_eq!(hub.transport().ref_count().await, 1);

        assert!(matches!(
            hub.attach(&record("aaaaaaaaaaaa", "SN-001")).await,
            Err(Error::AlreadyAttached(_))
        ));
        assert_eq!(hub.transport().ref_count().await, 1);

        hub.detach("aa:aa:aa:aa:aa:aa").await.unwrap();
        assert!(hub.device("aaaaaaaaaaaa").is_none());
        assert_eq!(hub.transport().ref_count().await, 0);
        assert!(link.is_closed());
        assert_eq!(
            hub.detach("aaaaaaaaaaaa").await.unwrap_err(),
            Error::NotAttached("aaaaaaaaaaaa".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_attach_leaves_nothing_behind() {
        let (link, hub) = network();
        link.fail_state_queries("aaaaaaaaaaaa", true);

        let err = hub.attach(&record("aaaaaaaaaaaa", "SN-001")).await.err().unwrap();
        assert!(matches!(err, Error::DeviceUnreachable { .. }));
        assert!(hub.registered().is_empty());
        assert_eq!(hub.transport().ref_count().await, 0);
        assert!(!link.is_subscribed("aaaaaaaaaaaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_second_device_by_serial() {
        let (_, hub) = network();
        let mut flow = hub.setup_flow();

        let step = hub.run_discovery_flow(&mut flow).await.unwrap();
        assert!(matches!(step, SetupStep::Select(ref options) if options.len() == 2));
        assert_eq!(hub.transport().ref_count().await, 0);

        flow.select("SN-002").unwrap();
        let chosen = flow.confirm().unwrap();
        let coordinator = hub.attach(&chosen).await.unwrap();
        assert_eq!(coordinator.identity().serial_number(), "SN-002");
        assert_eq!(coordinator.identity().mac_address(), "bbbbbbbbbbbb");
        assert!(hub.device("aaaaaaaaaaaa").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flows_skip_attached_devices() {
        let (_, hub) = network();
        hub.attach(&record("aaaaaaaaaaaa", "SN-001")).await.unwrap();

        let mut flow = hub.setup_flow();
        let step = hub.run_discovery_flow(&mut flow).await.unwrap();
        assert!(matches!(step, SetupStep::Confirm(ref d) if d.serial_number == "SN-002"));

        let mut flow = hub.setup_flow();
        let step = hub
            .run_dhcp_flow(&mut flow, Ipv4Addr::new(10, 0, 0, 11), "aaaaaaaaaaaa")
            .await
            .unwrap();
        assert_eq!(step, SetupStep::AlreadyConfigured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_shutdown() {
        let (_, hub) = network();
        assert!(hub.subscribe("aaaaaaaaaaaa", |_| {}).is_err());

        hub.attach(&record("aaaaaaaaaaaa", "SN-001")).await.unwrap();
        hub.attach(&record("bbbbbbbbbbbb", "SN-002")).await.unwrap();
        assert!(hub.subscribe("AA-AA-AA-AA-AA-AA", |_| {}).is_ok());
        assert_eq!(hub.discover().await.unwrap().len(), 2);
        assert_eq!(hub.transport().ref_count().await, 2);

        hub.shutdown().await;
        assert!(hub.registered().is_empty());
        assert!(!hub.transport().is_open().await);
    }
}
