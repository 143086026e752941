//! In-memory [`Link`] for tests.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::Command;
use crate::errors::Error;
use crate::link::{Link, Notification, NotificationCallback, ProbeReply};
use crate::runtime::{self, BoxFuture, lock};
use crate::state::DeviceState;

type Result<T> = std::result::Result<T, Error>;

struct MockDevice {
    serial_number: String,
    ip: Ipv4Addr,
    state: DeviceState,
    reachable: bool,
    state_queries_fail: bool,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, MockDevice>,
    foreign: HashSet<Ipv4Addr>,
    subscriptions: HashMap<String, NotificationCallback>,
    commands: Vec<(String, Command)>,
    reject_commands: bool,
    probes: usize,
    fetches: usize,
    fetch_timeouts: Vec<Duration>,
    probe_delay: Duration,
    closed: bool,
}

impl Inner {
    fn at(&mut self, ip: Ipv4Addr, operation: &str) -> Result<(&String, &mut MockDevice)> {
        if self.closed {
            return Err(Error::TransportClosed);
        }
        if self.foreign.contains(&ip) {
            return Err(Error::protocol_mismatch(ip, "unexpected reply"));
        }
        self.devices
            .iter_mut()
            .find(|(_, device)| device.ip == ip && device.reachable)
            .ok_or_else(|| Error::timeout(operation))
    }
}

fn reply(mac: &str, device: &MockDevice) -> ProbeReply {
    ProbeReply {
        mac_address: mac.to_string(),
        serial_number: device.serial_number.clone(),
        ip: device.ip,
        state_counter: device.state.state_counter,
    }
}

/// Simulated network of devices. Commands mutate the simulated state and
/// advance its counter the way real firmware does.
#[derive(Default)]
pub(crate) struct MockLink {
    inner: Mutex<Inner>,
}

impl MockLink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockLink::default())
    }

    pub(crate) fn add_device(&self, mac: &str, serial: &str, ip: Ipv4Addr, state: DeviceState) {
        lock(&self.inner).devices.insert(
            mac.to_string(),
            MockDevice {
                serial_number: serial.to_string(),
                ip,
                state,
                reachable: true,
                state_queries_fail: false,
            },
        );
    }

    /// Something that answers probes but is not a PixelAir device.
    pub(crate) fn add_foreign(&self, ip: Ipv4Addr) {
        lock(&self.inner).foreign.insert(ip);
    }

    pub(crate) fn set_reachable(&self, mac: &str, reachable: bool) {
        if let Some(device) = lock(&self.inner).devices.get_mut(mac) {
            device.reachable = reachable;
        }
    }

    pub(crate) fn fail_state_queries(&self, mac: &str, fail: bool) {
        if let Some(device) = lock(&self.inner).devices.get_mut(mac) {
            device.state_queries_fail = fail;
        }
    }

    pub(crate) fn move_device(&self, mac: &str, ip: Ipv4Addr) {
        if let Some(device) = lock(&self.inner).devices.get_mut(mac) {
            device.ip = ip;
        }
    }

    /// Change the device-side state without notifying anyone.
    pub(crate) fn set_state(&self, mac: &str, state: DeviceState) {
        if let Some(device) = lock(&self.inner).devices.get_mut(mac) {
            device.state = state;
        }
    }

    /// Probes answer only after `delay`.
    pub(crate) fn delay_probes(&self, delay: Duration) {
        lock(&self.inner).probe_delay = delay;
    }

    /// Deadlines passed to `fetch_state`, in call order.
    pub(crate) fn fetch_timeouts(&self) -> Vec<Duration> {
        lock(&self.inner).fetch_timeouts.clone()
    }

    pub(crate) fn reject_commands(&self, reject: bool) {
        lock(&self.inner).reject_commands = reject;
    }

    /// Deliver a notification as if the device had sent it. Returns whether
    /// anyone was subscribed.
    pub(crate) fn push(&self, mac: &str, notification: Notification) -> bool {
        let callback = lock(&self.inner).subscriptions.get(mac).cloned();
        match callback {
            Some(callback) => {
                callback(notification);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_subscribed(&self, mac: &str) -> bool {
        lock(&self.inner).subscriptions.contains_key(mac)
    }

    pub(crate) fn commands(&self) -> Vec<(String, Command)> {
        lock(&self.inner).commands.clone()
    }

    pub(crate) fn probes(&self) -> usize {
        lock(&self.inner).probes
    }

    pub(crate) fn fetches(&self) -> usize {
        lock(&self.inner).fetches
    }

    /// Make a closed link usable again, as a fresh socket would be.
    pub(crate) fn reopen(&self) {
        lock(&self.inner).closed = false;
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

impl Link for MockLink {
    fn broadcast_probe(&self, _window: Duration) -> BoxFuture<'_, Result<Vec<ProbeReply>>> {
        let inner = lock(&self.inner);
        let result = if inner.closed {
            Err(Error::TransportClosed)
        } else {
            let mut replies: Vec<ProbeReply> = inner
                .devices
                .iter()
                .filter(|(_, device)| device.reachable)
                .map(|(mac, device)| reply(mac, device))
                .collect();
            replies.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
            Ok(replies)
        };
        Box::pin(async move { result })
    }

    fn locate<'a>(
        &'a self,
        mac: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<ProbeReply>> {
        let inner = lock(&self.inner);
        let result = if inner.closed {
            Err(Error::TransportClosed)
        } else {
            inner
                .devices
                .get(mac)
                .filter(|device| device.reachable)
                .map(|device| reply(mac, device))
                .ok_or_else(|| Error::DeviceNotFound(mac.to_string()))
        };
        Box::pin(async move { result })
    }

    fn probe(&self, ip: Ipv4Addr, _timeout: Duration) -> BoxFuture<'_, Result<ProbeReply>> {
        let mut inner = lock(&self.inner);
        inner.probes += 1;
        let delay = inner.probe_delay;
        let result = inner
            .at(ip, "discover")
            .map(|(mac, device)| reply(mac, device));
        Box::pin(async move {
            if !delay.is_zero() {
                runtime::sleep(delay).await;
            }
            result
        })
    }

    fn fetch_state(
        &self,
        ip: Ipv4Addr,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<DeviceState>> {
        let mut inner = lock(&self.inner);
        inner.fetches += 1;
        inner.fetch_timeouts.push(timeout);
        let result = inner.at(ip, "getState").and_then(|(_, device)| {
            if device.state_queries_fail {
                Err(Error::timeout("getState"))
            } else {
                Ok(device.state.clone())
            }
        });
        Box::pin(async move { result })
    }

    fn send_command<'a>(
        &'a self,
        ip: Ipv4Addr,
        command: &'a Command,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        let mut inner = lock(&self.inner);
        let rejected = inner.reject_commands;
        let applied = inner.at(ip, command.method()).and_then(|(mac, device)| {
            if rejected {
                return Err(Error::CommandRejected {
                    ip,
                    method: command.method().to_string(),
                    reason: "rejected".to_string(),
                });
            }
            device.state.apply_command(command);
            device.state.state_counter += 1;
            Ok(mac.clone())
        });
        let result = match applied {
            Ok(mac) => {
                inner.commands.push((mac, command.clone()));
                Ok(())
            }
            Err(e) => Err(e),
        };
        Box::pin(async move { result })
    }

    fn subscribe(&self, mac: &str, callback: NotificationCallback) {
        lock(&self.inner)
            .subscriptions
            .insert(mac.to_string(), callback);
    }

    fn unsubscribe(&self, mac: &str) {
        lock(&self.inner).subscriptions.remove(mac);
    }

    fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.subscriptions.clear();
    }
}
