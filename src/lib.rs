//! # pixelair_rs
//!
//! An async Rust library that discovers PixelAir smart lights (Fluora, Monos,
//! ...) on the local network and keeps their state in sync.
//!
//! The crate is **runtime-agnostic**. Its building blocks, from the bottom up:
//!
//! - **Shared transport**: one UDP socket per process, reference-counted
//!   across device sessions by a [`TransportManager`].
//! - **Discovery**: broadcast discovery, targeted verification of a single
//!   address and the [`SetupFlow`] that picks a new device among the answers.
//! - **Device session**: a [`DeviceSession`] binds a [`DeviceIdentity`] to
//!   the device's current address and issues commands.
//! - **Coordinator**: a [`Coordinator`] polls a cheap state counter, listens
//!   for pushes, applies optimistic updates after commands, and publishes one
//!   consistent [`CoordinatorView`].
//!
//! [`Hub`] ties these together for host applications and [`LightEntity`]
//! adapts a coordinator to a light-shaped API.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pixelair_rs::{Hub, SetupStep, Settings};
//!
//! async fn setup() -> Result<(), pixelair_rs::Error> {
//!     let hub = Hub::new(Settings::default());
//!
//!     let mut flow = hub.setup_flow();
//!     if let SetupStep::Confirm(device) = hub.run_discovery_flow(&mut flow).await? {
//!         println!("found {} at {}", device.display_name, device.ip_address);
//!         let record = flow.confirm()?;
//!         let light = hub.attach(&record).await?;
//!         light.subscribe(|view| println!("available: {}", view.available()));
//!         light.turn_on().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Communication
//!
//! Devices speak JSON over UDP on port 9000. Every device-side change bumps a
//! state counter; polling compares only that counter and fetches the full
//! state when it moves.
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime

mod command;
mod config;
mod coordinator;
mod discovery;
mod entity;
mod errors;
mod flow;
mod hub;
mod identity;
mod link;
#[cfg(test)]
mod mock;
pub mod runtime;
mod session;
mod state;
mod transport;
mod types;
mod udp;

// Re-export public API
pub use command::Command;
pub use config::Settings;
pub use coordinator::{
    Coordinator, CoordinatorView, DeviceInfo, MANUFACTURER, PollingState, SubscriptionId,
    ViewCallback,
};
pub use discovery::{DiscoveredDevice, DiscoveryService};
pub use entity::{LightEntity, TurnOn};
pub use errors::Error;
pub use flow::{SelectOption, SetupFlow, SetupStep};
pub use hub::Hub;
pub use identity::{DeviceIdentity, IdentityRecord, normalize_mac};
pub use link::{Link, Notification, NotificationCallback, ProbeReply};
pub use session::{CallbackId, DeviceSession, StateCallback};
pub use state::DeviceState;
pub use transport::{LinkOpener, TransportHandle, TransportManager};
pub use types::{DeviceMode, Effect, EffectId, HueSaturation, Level};
pub use udp::UdpLink;
