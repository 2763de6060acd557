//! HQPlayer control client.
//!
//! HQPlayer listens on TCP 4321 for single-line XML requests and answers each
//! with one XML line. The client opens a fresh connection per request, polls
//! the pipeline state, and exposes the result as one pseudo-zone.

mod client;
mod protocol;

use thiserror::Error;

pub use client::{HqpClient, PipelineSnapshot};
pub use protocol::{
    HqpCommand, HqpElement, HqpInfo, HqpPlayback, HqpReply, HqpState, HqpStatus, HqpVolumeRange,
};

/// Errors from the HQPlayer control connection.
#[derive(Debug, Error)]
pub enum HqpError {
    #[error("HQPlayer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HQPlayer did not answer in time")]
    Timeout,

    #[error("Malformed HQPlayer reply: {0}")]
    Parse(String),

    #[error("HQPlayer rejected the request: {0}")]
    Rejected(String),
}

impl HqpError {
    /// Returns true for failures that may clear up on the next poll.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout)
    }
}

/// Result alias for HQPlayer requests.
pub type HqpResult<T> = Result<T, HqpError>;
