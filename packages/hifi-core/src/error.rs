//! Centralized error types for the hi-fi control core.
//!
//! Protocol modules define their own `thiserror` enums (SOAP, SSDP, MOO, LMS,
//! HQPlayer, artwork). Everything that crosses the adapter boundary is mapped
//! into [`BridgeError`], the unified taxonomy seen by bus callers.

use serde::Serialize;
use thiserror::Error;

use crate::artwork::ArtworkError;
use crate::hqplayer::HqpError;
use crate::lms::LmsError;
use crate::roon::MooError;
use crate::upnp::soap::SoapError;
use crate::upnp::types::DiscoveryError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind(_) => "socket_bind_failed",
            Self::NoInterfaces => "no_network_interfaces",
            Self::Description(_) => "device_description_failed",
            Self::InvalidDescription(_) => "invalid_device_description",
        }
    }
}

impl ErrorCode for SoapError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::HttpStatus(_, _) => "http_error_status",
            Self::Fault(_) => "soap_fault",
            Self::Parse => "soap_parse_error",
        }
    }
}

impl ErrorCode for MooError {
    fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "moo_malformed",
            Self::Json(_) => "moo_json",
            Self::Request(_) => "moo_request_failed",
            Self::Connect(_) => "moo_connect_failed",
            Self::Disconnected => "moo_disconnected",
            Self::Timeout => "moo_timeout",
        }
    }
}

impl ErrorCode for LmsError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::HttpStatus(_) => "http_error_status",
            Self::Rpc(_) => "lms_rpc_error",
        }
    }
}

impl ErrorCode for HqpError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "hqp_io_error",
            Self::Timeout => "hqp_timeout",
            Self::Parse(_) => "hqp_parse_error",
            Self::Rejected(_) => "hqp_rejected",
        }
    }
}

impl ErrorCode for ArtworkError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "http_request_failed",
            Self::HttpStatus(_) => "http_error_status",
            Self::TooManyRedirects => "too_many_redirects",
            Self::TooLarge(_) => "artwork_too_large",
            Self::Timeout => "artwork_timeout",
            Self::Decode(_) => "artwork_decode_failed",
            Self::DimensionTooLarge(_) => "artwork_dimension_too_large",
            Self::NotAnImage(_) => "artwork_not_an_image",
        }
    }
}

/// Unified error taxonomy for bus and adapter operations.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum BridgeError {
    /// No adapter is registered for the zone id's backend prefix.
    #[error("Unknown zone: {0}")]
    UnknownZone(String),

    /// The adapter exists but does not know the zone.
    #[error("Zone not found: {0}")]
    ZoneNotFound(String),

    /// The backend cannot perform the requested action on this zone.
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// The backend is unreachable, unpaired or rejected the request.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A network operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A resource limit was hit (redirect count, body size).
    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// Caller sent a malformed request (bad zone id, unknown action).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A backend with this name is already registered.
    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    /// Internal failure not attributable to the caller or a backend.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorCode for BridgeError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownZone(_) => "unknown_zone",
            Self::ZoneNotFound(_) => "zone_not_found",
            Self::UnsupportedAction(_) => "unsupported_action",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Timeout(_) => "timeout",
            Self::ResourceExceeded(_) => "resource_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::DuplicateBackend(_) => "duplicate_backend",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl BridgeError {
    /// Returns true for failures a caller may reasonably retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

// Re-export Result type aliases from their defining modules
pub use crate::upnp::soap::SoapResult;
pub use crate::upnp::types::DiscoveryResult;

/// Convenient Result alias for bus and adapter operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

impl From<SoapError> for BridgeError {
    fn from(err: SoapError) -> Self {
        match &err {
            SoapError::Http(e) if e.is_timeout() => Self::Timeout(err.to_string()),
            _ if err.is_unsupported_action() => Self::UnsupportedAction(err.to_string()),
            _ => Self::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<DiscoveryError> for BridgeError {
    fn from(err: DiscoveryError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<MooError> for BridgeError {
    fn from(err: MooError) -> Self {
        match err {
            MooError::Timeout => Self::Timeout(err.to_string()),
            _ => Self::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<LmsError> for BridgeError {
    fn from(err: LmsError) -> Self {
        match &err {
            LmsError::Http(e) if e.is_timeout() => Self::Timeout(err.to_string()),
            _ => Self::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<HqpError> for BridgeError {
    fn from(err: HqpError) -> Self {
        match err {
            HqpError::Timeout => Self::Timeout(err.to_string()),
            _ => Self::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<ArtworkError> for BridgeError {
    fn from(err: ArtworkError) -> Self {
        match err {
            ArtworkError::TooManyRedirects
            | ArtworkError::TooLarge(_)
            | ArtworkError::DimensionTooLarge(_) => Self::ResourceExceeded(err.to_string()),
            ArtworkError::NotAnImage(_) => Self::InvalidRequest(err.to_string()),
            ArtworkError::Timeout => Self::Timeout(err.to_string()),
            ArtworkError::Decode(_) => Self::Internal(err.to_string()),
            ArtworkError::Http(_) | ArtworkError::HttpStatus(_) => {
                Self::BackendUnavailable(err.to_string())
            }
        }
    }
}
