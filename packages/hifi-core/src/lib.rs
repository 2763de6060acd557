//! Hi-Fi Core - shared library for Unified Hi-Fi Control.
//!
//! This crate puts heterogeneous hi-fi playback systems behind one zone
//! model: a Roon core, UPnP MediaRenderers, OpenHome devices, a Logitech
//! Media Server and an HQPlayer pipeline all appear as zones with ids of the
//! form `{backend}:{native_id}`, controllable through a single [`Bus`].
//!
//! # Architecture
//!
//! - [`bus`]: zone registry and router, fan-out reads, event broadcast
//! - [`adapters`]: one [`Adapter`](adapters::Adapter) per backend
//! - [`roon`], [`upnp`], [`lms`], [`hqplayer`]: protocol clients
//! - [`volume`]: range clamping and rate-limited relative volume
//! - [`artwork`]: bounded image fetching, resizing and RGB565 conversion
//! - [`events`]: zone/status change events
//! - [`runtime`]: cancellable background task groups
//! - [`error`]: unified error taxonomy
//!
//! # Abstraction Traits
//!
//! - [`Adapter`](adapters::Adapter): uniform backend contract
//! - [`DeviceFamily`](upnp::DeviceFamily): SSDP device family plugged into
//!   the shared discovery/poll engine
//! - [`VolumeSink`](volume::VolumeSink): destination of batched volume steps
//! - [`EventEmitter`](events::EventEmitter): event transport

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod artwork;
pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod hqplayer;
pub mod lms;
pub mod model;
pub mod protocol_constants;
pub mod roon;
pub mod runtime;
pub mod upnp;
pub mod utils;
pub mod volume;

// Re-export commonly used types at the crate root
pub use adapters::{Adapter, AdapterKind};
pub use artwork::{ArtworkFetcher, ArtworkFormat, ArtworkImage, ArtworkRequest};
pub use bus::{Bus, BusStatus, ZoneQuery};
pub use config::{ArtworkConfig, Config, DiscoveryConfig, HqpConfig, LmsConfig, RoonConfig};
pub use error::{BridgeError, BridgeResult, ErrorCode};
pub use events::{BroadcastEventBridge, BusEvent, EventEmitter, LoggingEventEmitter, ZoneEvents};
pub use model::{
    BackendStatus, Capabilities, ControlAction, NowPlaying, VolumeControl, VolumeInfo, VolumeKind,
    Zone, ZoneId, ZoneState,
};
pub use utils::now_millis;
pub use volume::{clamp, VolumeRange};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, create_http_client, BootstrappedServices};
