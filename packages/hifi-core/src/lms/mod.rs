//! Logitech Media Server client.
//!
//! LMS exposes a single JSON-RPC endpoint (`/jsonrpc.js`) that tunnels the
//! CLI command language through `slim.request`. The client polls the player
//! list plus each player's status and keeps the result as its cache.

mod client;
mod types;

use thiserror::Error;

pub use client::{LmsClient, LmsCommand};
pub use types::{LmsPlayer, LmsStatus, PlayMode};

/// Errors from LMS JSON-RPC calls.
#[derive(Debug, Error)]
pub enum LmsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error status: {0}")]
    HttpStatus(u16),

    #[error("JSON-RPC error: {0}")]
    Rpc(String),
}

impl LmsError {
    /// Returns true for failures worth retrying on the next poll.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::HttpStatus(status) => *status >= 500,
            Self::Rpc(_) => false,
        }
    }
}

/// Result alias for LMS calls.
pub type LmsResult<T> = Result<T, LmsError>;
