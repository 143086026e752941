//! Merges polling, push notifications and optimistic updates into one view.
//!
//! Every writer goes through [`Core::apply`], which holds the publish lock
//! while it decides and notifies subscribers. The rules:
//!
//! - an authoritative state (fetched or pushed) is dropped when its counter
//!   is below the last confirmed one;
//! - an optimistic state always replaces the view and is itself replaced by
//!   the next authoritative one, fetched by the next poll tick even when the
//!   counter did not move;
//! - a view equal to the current one is not published again;
//! - poll and push updates carry the epoch of the polling run that produced
//!   them and are discarded once that run is stopped.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use strum_macros::Display;
use uuid::Uuid;

use crate::command::Command;
use crate::errors::Error;
use crate::identity::DeviceIdentity;
use crate::link::Notification;
use crate::runtime::{self, Instant, JoinHandle, lock};
use crate::session::DeviceSession;
use crate::state::DeviceState;
use crate::types::{DeviceMode, EffectId, Level};

type Result<T> = std::result::Result<T, Error>;

pub const MANUFACTURER: &str = "Light+Color";

/// What consumers observe: the last state and whether it is current.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CoordinatorView {
    state: Option<DeviceState>,
    last_update_succeeded: bool,
    optimistic: bool,
}

impl CoordinatorView {
    pub fn state(&self) -> Option<&DeviceState> {
        self.state.as_ref()
    }

    pub fn last_update_succeeded(&self) -> bool {
        self.last_update_succeeded
    }

    /// True while the state is a local prediction not yet confirmed.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic
    }

    /// Data is present and the last update reached the device.
    pub fn available(&self) -> bool {
        self.last_update_succeeded && self.state.is_some()
    }

    /// Observing both views is one change, not two.
    pub fn is_redundant_with(&self, other: &Self) -> bool {
        let same_state = match (&self.state, &other.state) {
            (Some(a), Some(b)) => a.is_redundant_with(b),
            (None, None) => true,
            _ => false,
        };
        same_state
            && self.last_update_succeeded == other.last_update_succeeded
            && self.optimistic == other.optimistic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PollingState {
    Idle,
    Polling,
    Stopped,
}

/// Consumer of published views.
pub type ViewCallback = Arc<dyn Fn(&CoordinatorView) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Registry data for a host's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: String,
    pub firmware_version: Option<String>,
    pub serial_number: String,
    pub mac_address: String,
}

enum Update {
    Optimistic(DeviceState),
    Confirmed(DeviceState),
    /// A poll reached the device and nothing changed.
    Reachable,
    /// A poll or refresh could not reach the device.
    Missed,
}

struct Shared {
    view: CoordinatorView,
    confirmed_counter: Option<u64>,
    epoch: u64,
    polling: PollingState,
    missed_polls: u32,
    subscribers: Vec<(SubscriptionId, ViewCallback)>,
    last_push: Option<Instant>,
    poller: Option<JoinHandle<()>>,
}

struct Core {
    session: Arc<DeviceSession>,
    // Held across decide-and-notify; see the module docs.
    publish: Mutex<()>,
    shared: Mutex<Shared>,
}

impl Core {
    fn apply(&self, update: Update, epoch: Option<u64>) -> bool {
        let _publishing = lock(&self.publish);
        let (view, subscribers) = {
            let mut shared = lock(&self.shared);
            if let Some(epoch) = epoch {
                if epoch != shared.epoch || shared.polling != PollingState::Polling {
                    return false;
                }
            }

            let mut next = shared.view.clone();
            match update {
                Update::Optimistic(state) => {
                    next.state = Some(state);
                    next.optimistic = true;
                }
                Update::Confirmed(state) => {
                    let counter = state.state_counter();
                    if shared.confirmed_counter.is_some_and(|known| counter < known) {
                        debug!(
                            "{}: dropping stale state {counter}",
                            self.session.identity().mac_address()
                        );
                        return false;
                    }
                    shared.confirmed_counter = Some(counter);
                    shared.missed_polls = 0;
                    next.state = Some(state);
                    next.optimistic = false;
                    next.last_update_succeeded = true;
                }
                Update::Reachable => {
                    shared.missed_polls = 0;
                    next.last_update_succeeded = true;
                }
                Update::Missed => {
                    shared.missed_polls = shared.missed_polls.saturating_add(1);
                    if shared.missed_polls >= self.session.settings().max_missed_polls {
                        next.last_update_succeeded = false;
                    }
                }
            }

            if next.is_redundant_with(&shared.view) {
                return false;
            }
            shared.view = next.clone();
            let subscribers: Vec<ViewCallback> =
                shared.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
            (next, subscribers)
        };

        for subscriber in subscribers {
            subscriber(&view);
        }
        true
    }

    fn confirmed_counter(&self) -> Option<u64> {
        lock(&self.shared).confirmed_counter
    }

    fn is_current(&self, epoch: u64) -> bool {
        let shared = lock(&self.shared);
        shared.epoch == epoch && shared.polling == PollingState::Polling
    }

    fn is_optimistic(&self) -> bool {
        lock(&self.shared).view.optimistic
    }

    /// One poll: compare counters, fetch only on change or to settle an
    /// optimistic view. The whole tick shares one `poll_timeout`.
    async fn tick(&self, epoch: u64) {
        let mac = self.session.identity().mac_address();
        let timeout = self.session.settings().poll_timeout;
        let started = Instant::now();

        let counter = match self.session.query_counter(timeout).await {
            Ok(counter) => counter,
            Err(e) => {
                debug!("{mac}: poll failed: {e}");
                self.session
                    .resolve_ip(timeout.saturating_sub(started.elapsed()))
                    .await;
                self.apply(Update::Missed, Some(epoch));
                return;
            }
        };

        let known = self.confirmed_counter();
        if known == Some(counter) {
            if !self.is_optimistic() {
                self.apply(Update::Reachable, Some(epoch));
                return;
            }
            // The command was acknowledged without the counter moving.
            debug!("{mac}: counter still {counter}, replacing prediction");
        }
        if known.is_some_and(|known| counter < known) {
            // Counters restart when the device reboots.
            warn!("{mac}: state counter went back from {known:?} to {counter}");
            lock(&self.shared).confirmed_counter = None;
            self.session.forget_state();
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match self.session.get_state(remaining).await {
            Ok(state) => {
                self.apply(Update::Confirmed(state), Some(epoch));
            }
            Err(e) => {
                debug!("{mac}: state fetch after counter {counter} failed: {e}");
                self.apply(Update::Missed, Some(epoch));
            }
        }
    }

    fn on_push(self: &Arc<Self>, notification: Notification, epoch: u64) {
        lock(&self.shared).last_push = Some(Instant::now());

        match notification {
            Notification::State(state) => {
                self.apply(Update::Confirmed(state), Some(epoch));
            }
            Notification::Counter(counter) => {
                if self.confirmed_counter().is_some_and(|known| counter <= known) {
                    return;
                }
                let core = Arc::clone(self);
                runtime::spawn(async move {
                    let timeout = core.session.settings().poll_timeout;
                    match core.session.get_state(timeout).await {
                        Ok(state) => {
                            core.apply(Update::Confirmed(state), Some(epoch));
                        }
                        Err(e) => debug!(
                            "{}: fetch after push {counter} failed: {e}",
                            core.session.identity().mac_address()
                        ),
                    }
                })
                .detach();
            }
        }
    }
}

async fn poll_loop(core: Weak<Core>, epoch: u64, interval: Duration) {
    loop {
        runtime::sleep(interval).await;
        let Some(core) = core.upgrade() else {
            return;
        };
        if !core.is_current(epoch) {
            return;
        }
        core.tick(epoch).await;
    }
}

/// The single source of truth for one device.
///
/// Subscribers run while the publish lock is held: they see every update
/// whole and in order, and must not call [`stop_polling`](Self::stop_polling)
/// themselves.
pub struct Coordinator {
    core: Arc<Core>,
}

impl Coordinator {
    pub fn new(session: Arc<DeviceSession>) -> Self {
        Coordinator {
            core: Arc::new(Core {
                session,
                publish: Mutex::new(()),
                shared: Mutex::new(Shared {
                    view: CoordinatorView::default(),
                    confirmed_counter: None,
                    epoch: 0,
                    polling: PollingState::Idle,
                    missed_polls: 0,
                    subscribers: Vec::new(),
                    last_push: None,
                    poller: None,
                }),
            }),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.core.session
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.core.session.identity()
    }

    pub fn view(&self) -> CoordinatorView {
        lock(&self.core.shared).view.clone()
    }

    pub fn polling_state(&self) -> PollingState {
        lock(&self.core.shared).polling
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&CoordinatorView) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        lock(&self.core.shared)
            .subscribers
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut shared = lock(&self.core.shared);
        let before = shared.subscribers.len();
        shared.subscribers.retain(|(registered, _)| *registered != id);
        shared.subscribers.len() != before
    }

    /// Initial state acquisition, before polling starts.
    ///
    /// Re-resolving the address may fail silently; failing to read the state
    /// is reported as [`Error::DeviceUnreachable`].
    pub async fn first_refresh(&self) -> Result<()> {
        let session = &self.core.session;
        let timeout = session.settings().connection_timeout;

        session.resolve_ip(timeout).await;
        match session.get_state(timeout).await {
            Ok(state) => {
                self.core.apply(Update::Confirmed(state), None);
                Ok(())
            }
            Err(e) => Err(Error::unreachable(session.identity().mac_address(), e)),
        }
    }

    /// Fetch the full state now, outside the poll schedule.
    pub async fn refresh(&self) -> Result<()> {
        let session = &self.core.session;
        match session.get_state(session.settings().poll_timeout).await {
            Ok(state) => {
                self.core.apply(Update::Confirmed(state), None);
                Ok(())
            }
            Err(e) => {
                self.core.apply(Update::Missed, None);
                Err(e)
            }
        }
    }

    /// Start the counter poll and route pushes into the view. A running poll
    /// is replaced.
    pub fn start_polling(&self, interval: Duration) {
        let _publishing = lock(&self.core.publish);
        let mut shared = lock(&self.core.shared);
        if let Some(previous) = shared.poller.take() {
            previous.abort();
        }

        shared.epoch += 1;
        shared.polling = PollingState::Polling;
        shared.missed_polls = 0;
        let epoch = shared.epoch;

        let weak = Arc::downgrade(&self.core);
        self.core.session.set_push_callback(Arc::new(move |notification| {
            if let Some(core) = weak.upgrade() {
                core.on_push(notification, epoch);
            }
        }));
        shared.poller = Some(runtime::spawn(poll_loop(
            Arc::downgrade(&self.core),
            epoch,
            interval,
        )));

        info!(
            "{}: polling every {interval:?}",
            self.core.session.identity().mac_address()
        );
    }

    /// Stop polling and ignore pushes. Nothing is published for the stopped
    /// run once this returns. Does nothing unless polling.
    pub fn stop_polling(&self) {
        let _publishing = lock(&self.core.publish);
        let poller = {
            let mut shared = lock(&self.core.shared);
            if shared.polling != PollingState::Polling {
                return;
            }
            shared.epoch += 1;
            shared.polling = PollingState::Stopped;
            shared.poller.take()
        };

        self.core.session.clear_push_callback();
        if let Some(poller) = poller {
            poller.abort();
        }
        info!(
            "{}: polling stopped",
            self.core.session.identity().mac_address()
        );
    }

    async fn execute(&self, command: Command) -> Result<()> {
        if let Some(state) = self.core.session.execute(command).await? {
            self.core.apply(Update::Optimistic(state), None);
        }
        Ok(())
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.execute(Command::Power(true)).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.execute(Command::Power(false)).await
    }

    pub async fn set_brightness(&self, value: f32) -> Result<()> {
        self.execute(Command::Brightness(Level::checked("brightness", value)?))
            .await
    }

    pub async fn set_hue(&self, value: f32) -> Result<()> {
        self.execute(Command::Hue(Level::checked("hue", value)?))
            .await
    }

    pub async fn set_saturation(&self, value: f32) -> Result<()> {
        self.execute(Command::Saturation(Level::checked("saturation", value)?))
            .await
    }

    pub async fn set_effect(&self, id: EffectId) -> Result<()> {
        self.execute(Command::Effect(id)).await
    }

    pub async fn set_mode(&self, mode: DeviceMode) -> Result<()> {
        self.execute(Command::Mode(mode)).await
    }

    /// Registry entry; `configured_name` is used until the device reports a
    /// nickname.
    pub fn device_info(&self, configured_name: &str) -> DeviceInfo {
        let view = self.view();
        let state = view.state();
        let identity = self.identity();

        DeviceInfo {
            identifier: identity.mac_address().to_string(),
            name: state
                .and_then(DeviceState::nickname)
                .unwrap_or(configured_name)
                .to_string(),
            manufacturer: MANUFACTURER,
            model: state
                .and_then(DeviceState::model)
                .unwrap_or("PixelAir")
                .to_string(),
            firmware_version: state
                .and_then(DeviceState::firmware_version)
                .map(String::from),
            serial_number: identity.serial_number().to_string(),
            mac_address: identity.mac_address().to_string(),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.core.session.ip()
    }

    pub fn diagnostics(&self) -> Value {
        let shared = lock(&self.core.shared);
        let identity = self.identity();
        json!({
            "identity": {
                "mac_address": identity.mac_address(),
                "serial_number": identity.serial_number(),
            },
            "ip": self.core.session.ip().to_string(),
            "polling": shared.polling.to_string(),
            "state_counter": shared.confirmed_counter,
            "missed_polls": shared.missed_polls,
            "seconds_since_last_push": shared.last_push.map(|at| at.elapsed().as_secs_f64()),
            "available": shared.view.available(),
            "optimistic": shared.view.is_optimistic(),
            "state": shared.view.state(),
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
