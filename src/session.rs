//! One attached device.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::Settings;
use crate::errors::Error;
use crate::identity::DeviceIdentity;
use crate::link::{Notification, NotificationCallback};
use crate::runtime::{Instant, lock};
use crate::state::DeviceState;
use crate::transport::{TransportHandle, TransportManager};
use crate::types::{DeviceMode, EffectId, Level};

type Result<T> = std::result::Result<T, Error>;

/// Observer of a session's last-known state.
pub type StateCallback = Arc<dyn Fn(&DeviceState) + Send + Sync + 'static>;

/// Returned by [`DeviceSession::add_state_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(Uuid);

struct Inner {
    ip: Ipv4Addr,
    state: Option<DeviceState>,
    observers: Vec<(CallbackId, StateCallback)>,
}

/// State shared with the notification dispatcher registered on the link.
struct Shared {
    // Held while observers run so every update reaches them whole and in order.
    publish: Mutex<()>,
    inner: Mutex<Inner>,
    push_callback: Mutex<Option<NotificationCallback>>,
}

impl Shared {
    fn observers(inner: &Inner) -> Vec<StateCallback> {
        inner.observers.iter().map(|(_, cb)| cb.clone()).collect()
    }

    /// Keep `state` unless a newer snapshot is already held.
    fn record(&self, state: &DeviceState) -> bool {
        let _publishing = lock(&self.publish);
        let observers = {
            let mut inner = lock(&self.inner);
            let older = inner
                .state
                .as_ref()
                .is_some_and(|held| state.state_counter() < held.state_counter());
            if older {
                return false;
            }
            inner.state = Some(state.clone());
            Shared::observers(&inner)
        };
        for observer in observers {
            observer(state);
        }
        true
    }

    fn predict(&self, command: &Command) -> Option<DeviceState> {
        let _publishing = lock(&self.publish);
        let (state, observers) = {
            let mut inner = lock(&self.inner);
            let state = inner.state.as_mut()?;
            state.apply_command(command);
            let state = state.clone();
            (state, Shared::observers(&inner))
        };
        for observer in observers {
            observer(&state);
        }
        Some(state)
    }

    fn dispatch(&self, notification: Notification) {
        if let Notification::State(state) = &notification {
            self.record(state);
        }
        let push_callback = lock(&self.push_callback).clone();
        if let Some(callback) = push_callback {
            callback(notification);
        }
    }
}

/// A device bound to its current address and the shared transport.
///
/// The session holds one transport reference from [`attach`](Self::attach)
/// until [`detach`](Self::detach).
pub struct DeviceSession {
    identity: DeviceIdentity,
    settings: Settings,
    manager: TransportManager,
    transport: TransportHandle,
    shared: Arc<Shared>,
    detached: AtomicBool,
}

impl DeviceSession {
    /// Find the device on the network and bind a session to it.
    ///
    /// Fails when the device does not answer within
    /// `settings.connection_timeout`; the transport reference taken here is
    /// released again on every failure path.
    pub async fn attach(
        identity: DeviceIdentity,
        manager: &TransportManager,
        settings: &Settings,
    ) -> Result<Arc<DeviceSession>> {
        let transport = manager.acquire().await?;

        let reply = match transport
            .link()
            .locate(identity.mac_address(), settings.connection_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                manager.release(&transport).await;
                return Err(e);
            }
        };
        if reply.serial_number != identity.serial_number() {
            warn!(
                "{} reports serial {} instead of {}",
                identity.mac_address(),
                reply.serial_number,
                identity.serial_number()
            );
        }

        let shared = Arc::new(Shared {
            publish: Mutex::new(()),
            inner: Mutex::new(Inner {
                ip: reply.ip,
                state: None,
                observers: Vec::new(),
            }),
            push_callback: Mutex::new(None),
        });

        let dispatcher = Arc::clone(&shared);
        transport.link().subscribe(
            identity.mac_address(),
            Arc::new(move |notification| dispatcher.dispatch(notification)),
        );

        info!("attached {} at {}", identity.mac_address(), reply.ip);
        Ok(Arc::new(DeviceSession {
            identity,
            settings: settings.clone(),
            manager: manager.clone(),
            transport,
            shared,
            detached: AtomicBool::new(false),
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The last address the device answered on.
    pub fn ip(&self) -> Ipv4Addr {
        lock(&self.shared.inner).ip
    }

    /// Last known state, confirmed or optimistic.
    pub fn state(&self) -> Option<DeviceState> {
        lock(&self.shared.inner).state.clone()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.is_detached() {
            Err(Error::NotAttached(self.identity.mac_address().to_string()))
        } else {
            Ok(())
        }
    }

    /// Re-check where the device lives, e.g. after a DHCP renewal.
    ///
    /// Never fails: when the device cannot be found the previous address is
    /// kept and returned.
    pub async fn resolve_ip(&self, timeout: Duration) -> Ipv4Addr {
        let current = self.ip();
        if self.is_detached() {
            return current;
        }

        let started = Instant::now();
        let mac = self.identity.mac_address();
        let link = self.transport.link();

        match link.probe(current, timeout).await {
            Ok(reply) if reply.mac_address == mac => return current,
            Ok(reply) => debug!("{current} now answers as {}", reply.mac_address),
            Err(e) => debug!("{mac} silent at {current}: {e}"),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match link.locate(mac, remaining).await {
            Ok(reply) => {
                if reply.ip != current {
                    info!("{mac} moved from {current} to {}", reply.ip);
                    lock(&self.shared.inner).ip = reply.ip;
                }
                reply.ip
            }
            Err(e) => {
                warn!("could not re-resolve {mac}, keeping {current}: {e}");
                current
            }
        }
    }

    /// The cheap counter-only query.
    pub async fn query_counter(&self, timeout: Duration) -> Result<u64> {
        self.ensure_attached()?;
        let ip = self.ip();
        let reply = self.transport.link().probe(ip, timeout).await?;
        if reply.mac_address != self.identity.mac_address() {
            return Err(Error::protocol_mismatch(ip, "answered with another mac"));
        }
        Ok(reply.state_counter)
    }

    /// Fetch the full state. It is remembered unless a snapshot with a
    /// higher counter is already held.
    pub async fn get_state(&self, timeout: Duration) -> Result<DeviceState> {
        self.ensure_attached()?;
        let state = self.transport.link().fetch_state(self.ip(), timeout).await?;
        if !self.shared.record(&state) {
            debug!(
                "{}: keeping held state over older counter {}",
                self.identity.mac_address(),
                state.state_counter()
            );
        }
        Ok(state)
    }

    /// Drop the held snapshot so the next fetch is kept whatever its
    /// counter. Used when the device restarted its counter.
    pub(crate) fn forget_state(&self) {
        lock(&self.shared.inner).state = None;
    }

    /// Send `command` and, once acknowledged, apply its expected effect to
    /// the held state. Returns the predicted state, if a state was known.
    pub(crate) async fn execute(&self, command: Command) -> Result<Option<DeviceState>> {
        self.ensure_attached()?;
        let ip = self.ip();
        self.transport
            .link()
            .send_command(ip, &command, self.settings.connection_timeout)
            .await?;
        debug!("{} -> {ip}: {:?}", self.identity.mac_address(), command);
        Ok(self.shared.predict(&command))
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.execute(Command::Power(true)).await.map(drop)
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.execute(Command::Power(false)).await.map(drop)
    }

    /// `value` must lie in `0.0..=1.0`.
    pub async fn set_brightness(&self, value: f32) -> Result<()> {
        let level = Level::checked("brightness", value)?;
        self.execute(Command::Brightness(level)).await.map(drop)
    }

    pub async fn set_hue(&self, value: f32) -> Result<()> {
        let level = Level::checked("hue", value)?;
        self.execute(Command::Hue(level)).await.map(drop)
    }

    pub async fn set_saturation(&self, value: f32) -> Result<()> {
        let level = Level::checked("saturation", value)?;
        self.execute(Command::Saturation(level)).await.map(drop)
    }

    pub async fn set_effect(&self, id: EffectId) -> Result<()> {
        self.execute(Command::Effect(id)).await.map(drop)
    }

    pub async fn set_mode(&self, mode: DeviceMode) -> Result<()> {
        self.execute(Command::Mode(mode)).await.map(drop)
    }

    pub fn add_state_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&DeviceState) + Send + Sync + 'static,
    {
        let id = CallbackId(Uuid::new_v4());
        lock(&self.shared.inner)
            .observers
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether the callback was registered.
    pub fn remove_state_callback(&self, id: CallbackId) -> bool {
        let mut inner = lock(&self.shared.inner);
        let before = inner.observers.len();
        inner.observers.retain(|(registered, _)| *registered != id);
        inner.observers.len() != before
    }

    /// Route device-initiated notifications to `callback`, replacing any
    /// previous one. Full-state pushes are recorded before it runs.
    pub fn set_push_callback(&self, callback: NotificationCallback) {
        *lock(&self.shared.push_callback) = Some(callback);
    }

    pub fn clear_push_callback(&self) {
        *lock(&self.shared.push_callback) = None;
    }

    /// Stop receiving notifications, drop all observers and release the
    /// transport reference. Later calls do nothing.
    pub async fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let mac = self.identity.mac_address();
        self.transport.link().unsubscribe(mac);
        self.clear_push_callback();
        lock(&self.shared.inner).observers.clear();
        self.manager.release(&self.transport).await;
        info!("detached {mac}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use crate::state::sample_state;
    use crate::transport::mock_manager;

    const MAC: &str = "aabbccddeeff";
    const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 20);

    async fn attached() -> (Arc<MockLink>, TransportManager, Arc<DeviceSession>) {
        let link = MockLink::new();
        link.add_device(MAC, "SN-001", IP, sample_state(3));
        let manager = mock_manager(link.clone());
        let identity = DeviceIdentity::new(MAC, "SN-001").unwrap();
        let session = DeviceSession::attach(identity, &manager, &Settings::default())
            .await
            .unwrap();
        (link, manager, session)
    }

    #[tokio::test]
    async fn test_attach_resolves_address() {
        let (link, manager, session) = attached().await;
        assert_eq!(session.ip(), IP);
        assert!(session.state().is_none());
        assert!(link.is_subscribed(MAC));
        assert_eq!(manager.ref_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_attach_releases_transport() {
        let link = MockLink::new();
        let manager = mock_manager(link.clone());
        let identity = DeviceIdentity::new(MAC, "SN-001").unwrap();

        let err = DeviceSession::attach(identity, &manager, &Settings::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::DeviceNotFound(MAC.to_string()));
        assert_eq!(manager.ref_count().await, 0);
        assert!(!manager.is_open().await);
    }

    #[tokio::test]
    async fn test_resolve_ip_follows_moves() {
        let (link, _, session) = attached().await;
        let moved = Ipv4Addr::new(10, 0, 0, 21);

        link.move_device(MAC, moved);
        assert_eq!(session.resolve_ip(Duration::from_secs(1)).await, moved);
        assert_eq!(session.ip(), moved);

        link.set_reachable(MAC, false);
        assert_eq!(session.resolve_ip(Duration::from_secs(1)).await, moved);
    }

    #[tokio::test]
    async fn test_optimistic_update_after_command() {
        let (link, _, session) = attached().await;
        session.get_state(Duration::from_secs(1)).await.unwrap();

        session.set_brightness(0.7).await.unwrap();
        let state = session.state().unwrap();
        assert_eq!(state.brightness().value(), 0.7);
        assert_eq!(state.state_counter(), 3);
        assert_eq!(
            link.commands(),
            vec![(
                MAC.to_string(),
                Command::Brightness(Level::create(0.7).unwrap())
            )]
        );
    }

    #[tokio::test]
    async fn test_failed_command_keeps_state() {
        let (link, _, session) = attached().await;
        session.get_state(Duration::from_secs(1)).await.unwrap();
        link.reject_commands(true);

        assert!(matches!(
            session.turn_off().await,
            Err(Error::CommandRejected { .. })
        ));
        assert!(session.state().unwrap().is_on());
    }

    #[tokio::test]
    async fn test_invalid_level_is_not_sent() {
        let (link, _, session) = attached().await;
        assert_eq!(
            session.set_hue(1.5).await.unwrap_err(),
            Error::InvalidLevel {
                name: "hue",
                value: 1.5
            }
        );
        assert!(link.commands().is_empty());
    }

    #[tokio::test]
    async fn test_push_reaches_observers_and_callback() {
        let (link, _, session) = attached().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pushed = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        session.add_state_callback(move |state| s.lock().unwrap().push(state.state_counter()));
        let p = pushed.clone();
        session.set_push_callback(Arc::new(move |n: Notification| {
            p.lock().unwrap().push(n.state_counter())
        }));

        link.push(MAC, Notification::State(sample_state(8)));
        link.push(MAC, Notification::Counter(9));

        assert_eq!(*seen.lock().unwrap(), vec![8]);
        assert_eq!(*pushed.lock().unwrap(), vec![8, 9]);
        assert_eq!(session.state().unwrap().state_counter(), 8);
    }

    #[tokio::test]
    async fn test_older_fetch_does_not_replace_held_state() {
        let (link, _, session) = attached().await;
        let mut pushed = sample_state(7);
        pushed.brightness = Level::create(0.9).unwrap();
        link.push(MAC, Notification::State(pushed));

        link.set_state(MAC, sample_state(5));
        let fetched = session.get_state(Duration::from_secs(1)).await.unwrap();
        assert_eq!(fetched.state_counter(), 5);
        assert_eq!(session.state().unwrap().state_counter(), 7);

        // Predictions build on the newest snapshot.
        session.set_hue(0.1).await.unwrap();
        let state = session.state().unwrap();
        assert_eq!(state.state_counter(), 7);
        assert_eq!(state.brightness().value(), 0.9);
        assert_eq!(state.hue, Level::create(0.1).unwrap());

        session.forget_state();
        session.get_state(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.state().unwrap().state_counter(), 6);
    }

    #[tokio::test]
    async fn test_remove_state_callback() {
        let (_, _, session) = attached().await;
        let id = session.add_state_callback(|_| {});
        assert!(session.remove_state_callback(id));
        assert!(!session.remove_state_callback(id));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (link, manager, session) = attached().await;
        session.add_state_callback(|_| panic!("observer survived detach"));

        session.detach().await;
        session.detach().await;

        assert!(!link.is_subscribed(MAC));
        assert_eq!(manager.ref_count().await, 0);
        assert!(link.is_closed());
        assert_eq!(
            session.turn_on().await.unwrap_err(),
            Error::NotAttached(MAC.to_string())
        );
    }
}
