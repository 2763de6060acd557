//! Roon core client: MOO/1 over WebSocket.
//!
//! - [`moo`]: message codec
//! - `transport`: request/response correlation over one socket
//! - [`RoonClient`]: pairing state machine, zone cache, commands

mod client;
pub mod moo;
mod transport;
mod types;

use thiserror::Error;

pub use client::{RoonClient, VolumeChange};
pub use types::{
    zone_events, CoreEvent, CoreInfo, Registration, RoonNowPlaying, RoonOutput, RoonVolume,
    RoonZone, SeekUpdate, ThreeLine,
};

/// Errors from the MOO codec and the core link.
#[derive(Debug, Error)]
pub enum MooError {
    #[error("Malformed MOO message: {0}")]
    Malformed(String),

    #[error("Invalid MOO body: {0}")]
    Json(#[from] serde_json::Error),

    /// The core answered with a non-`Success` status.
    #[error("Core rejected request: {0}")]
    Request(String),

    #[error("Cannot reach Roon core: {0}")]
    Connect(String),

    #[error("Not connected to a Roon core")]
    Disconnected,

    #[error("Roon request timed out")]
    Timeout,
}

impl MooError {
    /// True for failures that a reconnect may cure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Disconnected | Self::Timeout)
    }
}

pub type MooResult<T> = Result<T, MooError>;
