//! JSON-over-UDP implementation of [`Link`].
//!
//! One socket serves every device. A listener task reads all datagrams and
//! routes them:
//!
//! - replies (`result` or `error` present) go to the request waiting on the
//!   same source address and method, and discovery replies additionally to
//!   every running broadcast scan;
//! - `syncState` messages go to the subscriber registered for the device MAC.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use futures::channel::{mpsc, oneshot};
use log::{debug, warn};
use serde_json::{Value, json};

use crate::command::Command;
use crate::config::Settings;
use crate::errors::Error;
use crate::identity::normalize_mac;
use crate::link::{Link, Notification, NotificationCallback, ProbeReply};
use crate::runtime::{self, AsyncUdpSocket, BoxFuture, Instant, JoinHandle, UdpSocket, lock};
use crate::state::DeviceState;

type Result<T> = std::result::Result<T, Error>;

const DISCOVER: &str = "discover";
const GET_STATE: &str = "getState";
const SYNC_STATE: &str = "syncState";

type Waiters = HashMap<(Ipv4Addr, String), Vec<oneshot::Sender<Value>>>;

#[derive(Default)]
struct Routes {
    pending: Mutex<Waiters>,
    scans: Mutex<Vec<mpsc::UnboundedSender<(Ipv4Addr, Value)>>>,
    subscriptions: Mutex<HashMap<String, NotificationCallback>>,
}

impl Routes {
    fn dispatch(&self, ip: Ipv4Addr, datagram: &[u8]) {
        let message = match decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping datagram from {ip}: {e}");
                return;
            }
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            debug!("dropping datagram without method from {ip}");
            return;
        };

        if message.get("result").is_some() || message.get("error").is_some() {
            if method == DISCOVER {
                lock(&self.scans).retain(|scan| scan.unbounded_send((ip, message.clone())).is_ok());
            }
            let waiters = lock(&self.pending).remove(&(ip, method.to_string()));
            for waiter in waiters.into_iter().flatten() {
                let _ = waiter.send(message.clone());
            }
        } else if method == SYNC_STATE {
            self.notify(ip, &message);
        } else {
            debug!("unhandled {method} from {ip}");
        }
    }

    fn notify(&self, ip: Ipv4Addr, message: &Value) {
        let params = message.get("params").unwrap_or(&Value::Null);
        let Some(mac) = params
            .get("mac")
            .and_then(Value::as_str)
            .and_then(|mac| normalize_mac(mac).ok())
        else {
            debug!("push from {ip} without a usable mac");
            return;
        };
        let Some(notification) = parse_notification(params) else {
            debug!("undecodable push from {mac} at {ip}");
            return;
        };

        // Clone out of the lock so the callback may (un)subscribe.
        let callback = lock(&self.subscriptions).get(&mac).cloned();
        match callback {
            Some(callback) => callback(notification),
            None => debug!("push from unsubscribed device {mac}"),
        }
    }

    fn prune(&self, key: &(Ipv4Addr, String)) {
        let mut pending = lock(&self.pending);
        if let Some(waiters) = pending.get_mut(key) {
            waiters.retain(|waiter| !waiter.is_canceled());
            if waiters.is_empty() {
                pending.remove(key);
            }
        }
    }
}

/// The production [`Link`]: a single broadcast-capable UDP socket.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    routes: Arc<Routes>,
    port: u16,
    retry_interval: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpLink {
    /// Bind the shared socket and start routing incoming datagrams.
    ///
    /// Fails when the port is taken or broadcast is not permitted.
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let socket = UdpSocket::bind(&format!("0.0.0.0:{}", settings.listen_port))
            .await
            .map_err(|e| Error::socket("bind", e))?;

        socket
            .set_broadcast(true)
            .map_err(|e| Error::socket("set_broadcast", e))?;

        if let Ok(addr) = socket.local_addr() {
            debug!("shared socket bound to {addr}");
        }

        let socket = Arc::new(socket);
        let routes = Arc::new(Routes::default());
        let listener = runtime::spawn(listen(Arc::clone(&socket), Arc::clone(&routes)));

        Ok(UdpLink {
            socket,
            routes,
            port: settings.port,
            retry_interval: settings.query_retry_interval,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::socket("local_addr", e))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request to `ip` and wait for the reply carrying the same
    /// method. With `resend` the request is repeated every retry interval
    /// until answered.
    async fn request(
        &self,
        ip: Ipv4Addr,
        method: &str,
        params: Value,
        timeout: Duration,
        resend: bool,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let bytes = serde_json::to_vec(&json!({ "method": method, "params": params }))
            .map_err(Error::JsonDump)?;
        let addr = format!("{ip}:{}", self.port);
        let key = (ip, method.to_string());

        let (waiter, mut reply) = oneshot::channel();
        lock(&self.routes.pending)
            .entry(key.clone())
            .or_default()
            .push(waiter);

        let exchange = async move {
            loop {
                if let Err(e) = self.socket.send_to(&bytes, &addr).await {
                    return Err(Error::socket("send_to", e));
                }
                if !resend {
                    return (&mut reply).await.map_err(|_| Error::TransportClosed);
                }
                if let Ok(outcome) = runtime::timeout(self.retry_interval, &mut reply).await {
                    return outcome.map_err(|_| Error::TransportClosed);
                }
                debug!("no {method} reply from {ip}, resending");
            }
        };

        let outcome = runtime::timeout(timeout, exchange).await;
        self.routes.prune(&key);
        let message = outcome.map_err(|_| Error::timeout(method))??;
        into_result(ip, method, message)
    }

    /// Broadcast probes for `window`, re-sending every retry interval.
    /// Stops early once `wanted` answers.
    async fn scan(&self, window: Duration, wanted: Option<&str>) -> Result<Vec<ProbeReply>> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let bytes = serde_json::to_vec(&json!({ "method": DISCOVER, "params": {} }))
            .map_err(Error::JsonDump)?;
        let addr = format!("{}:{}", Ipv4Addr::BROADCAST, self.port);

        let (scan, mut answers) = mpsc::unbounded();
        lock(&self.routes.scans).push(scan);

        let started = Instant::now();
        let mut last_send: Option<Instant> = None;
        let mut found: HashMap<String, ProbeReply> = HashMap::new();

        let outcome = loop {
            let elapsed = started.elapsed();
            if elapsed >= window {
                break Ok(());
            }
            if last_send.is_none_or(|sent| sent.elapsed() >= self.retry_interval) {
                if let Err(e) = self.socket.send_to(&bytes, &addr).await {
                    break Err(Error::socket("send_to", e));
                }
                last_send = Some(Instant::now());
            }

            let wait = (window - elapsed).min(self.retry_interval);
            match runtime::timeout(wait, answers.next()).await {
                Ok(Some((ip, message))) => match parse_probe(ip, &message["result"]) {
                    Ok(reply) => {
                        let hit = wanted == Some(reply.mac_address.as_str());
                        found.insert(reply.mac_address.clone(), reply);
                        if hit {
                            break Ok(());
                        }
                    }
                    Err(e) => debug!("ignoring discovery answer: {e}"),
                },
                Ok(None) => break Err(Error::TransportClosed),
                Err(_) => {}
            }
        };

        drop(answers);
        lock(&self.routes.scans).retain(|scan| !scan.is_closed());
        outcome?;

        let mut replies: Vec<ProbeReply> = found.into_values().collect();
        replies.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        Ok(replies)
    }
}

impl Link for UdpLink {
    fn broadcast_probe(&self, window: Duration) -> BoxFuture<'_, Result<Vec<ProbeReply>>> {
        Box::pin(self.scan(window, None))
    }

    fn locate<'a>(
        &'a self,
        mac: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ProbeReply>> {
        Box::pin(async move {
            self.scan(timeout, Some(mac))
                .await?
                .into_iter()
                .find(|reply| reply.mac_address == mac)
                .ok_or_else(|| Error::DeviceNotFound(mac.to_string()))
        })
    }

    fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> BoxFuture<'_, Result<ProbeReply>> {
        Box::pin(async move {
            let result = self
                .request(ip, DISCOVER, json!({}), timeout, true)
                .await
                .map_err(|e| query_error(ip, e))?;
            parse_probe(ip, &result)
        })
    }

    fn fetch_state(
        &self,
        ip: Ipv4Addr,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<DeviceState>> {
        Box::pin(async move {
            let result = self
                .request(ip, GET_STATE, json!({}), timeout, true)
                .await
                .map_err(|e| query_error(ip, e))?;
            serde_json::from_value(result)
                .map_err(|e| Error::protocol_mismatch(ip, &format!("undecodable state: {e}")))
        })
    }

    fn send_command<'a>(
        &'a self,
        ip: Ipv4Addr,
        command: &'a Command,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .request(ip, command.method(), command.params(), timeout, false)
                .await?;
            debug!("{} acknowledged by {ip}: {response}", command.method());
            Ok(())
        })
    }

    fn subscribe(&self, mac: &str, callback: NotificationCallback) {
        lock(&self.routes.subscriptions).insert(mac.to_string(), callback);
    }

    fn unsubscribe(&self, mac: &str) {
        lock(&self.routes.subscriptions).remove(mac);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        // Dropping the senders wakes every waiter with TransportClosed.
        lock(&self.routes.pending).clear();
        lock(&self.routes.scans).clear();
        lock(&self.routes.subscriptions).clear();
        debug!("shared socket closed");
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen(socket: Arc<UdpSocket>, routes: Arc<Routes>) {
    let mut buffer = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((size, SocketAddr::V4(addr))) => routes.dispatch(*addr.ip(), &buffer[..size]),
            Ok((_, addr)) => debug!("ignoring datagram from {addr}"),
            Err(e) => {
                warn!("shared socket receive error: {e}");
                runtime::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn decode(datagram: &[u8]) -> Result<Value> {
    let text = String::from_utf8(datagram.to_vec()).map_err(Error::Utf8Decode)?;
    serde_json::from_str(&text).map_err(Error::JsonLoad)
}

fn into_result(ip: Ipv4Addr, method: &str, message: Value) -> Result<Value> {
    if let Some(error) = message.get("error") {
        let reason = error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::CommandRejected {
            ip,
            method: method.to_string(),
            reason,
        });
    }
    message
        .get("result")
        .cloned()
        .ok_or_else(|| Error::protocol_mismatch(ip, "reply without result"))
}

/// Devices never refuse a query; an error reply means the responder speaks
/// something else.
fn query_error(ip: Ipv4Addr, error: Error) -> Error {
    match error {
        Error::CommandRejected { reason, .. } => Error::protocol_mismatch(ip, &reason),
        other => other,
    }
}

fn parse_probe(ip: Ipv4Addr, result: &Value) -> Result<ProbeReply> {
    let mac = result
        .get("mac")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol_mismatch(ip, "probe answer without mac"))?;
    let mac_address =
        normalize_mac(mac).map_err(|_| Error::protocol_mismatch(ip, "malformed mac"))?;
    let serial_number = result
        .get("serial")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol_mismatch(ip, "probe answer without serial"))?;
    let state_counter = result
        .get("stateCounter")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::protocol_mismatch(ip, "probe answer without counter"))?;

    Ok(ProbeReply {
        mac_address,
        serial_number: serial_number.to_string(),
        ip,
        state_counter,
    })
}

fn parse_notification(params: &Value) -> Option<Notification> {
    if let Some(state) = params.get("state") {
        return serde_json::from_value::<DeviceState>(state.clone())
            .ok()
            .map(Notification::State);
    }
    params
        .get("stateCounter")
        .and_then(Value::as_u64)
        .map(Notification::Counter)
}
