//! Fixed protocol constants and safety limits that should NOT be changed.
//!
//! Values here are either defined by external protocols (SSDP, UPnP, MOO) or
//! are hard safety limits shared by every backend. Tunable intervals live in
//! [`Config`](crate::config::Config).

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// SSDP / UPnP
// ─────────────────────────────────────────────────────────────────────────────

/// Standard SSDP multicast address and port.
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// UPnP MediaRenderer device type used as the SSDP search target.
pub const MEDIA_RENDERER_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

/// OpenHome Product service type used as the SSDP search target.
pub const OPENHOME_SEARCH_TARGET: &str = "urn:av-openhome-org:service:Product:1";

/// Timeout for SOAP HTTP requests (seconds).
///
/// 10 seconds is reasonable for LAN operations.
pub const SOAP_TIMEOUT_SECS: u64 = 10;

/// Number of discovery intervals a device may go unseen before eviction.
pub const DEVICE_STALE_INTERVALS: u32 = 3;

/// Minimum spacing between failure log lines for the same device.
pub const DEVICE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Subscription Client (Roon)
// ─────────────────────────────────────────────────────────────────────────────

/// Cached zones keep being served this long after the core disconnects.
pub const UNPAIRED_GRACE: Duration = Duration::from_secs(5);

/// Cached zones are purged after this long without a core.
pub const UNPAIRED_PURGE: Duration = Duration::from_secs(5 * 60);

/// Default Roon core WebSocket port.
pub const ROON_DEFAULT_PORT: u16 = 9330;

/// Service name of the Roon registry.
pub const ROON_REGISTRY_SERVICE: &str = "com.roonlabs.registry:1";

/// Service name of the Roon transport API.
pub const ROON_TRANSPORT_SERVICE: &str = "com.roonlabs.transport:2";

/// Service name of the ping service every extension must provide.
pub const ROON_PING_SERVICE: &str = "com.roonlabs.ping:1";

// ─────────────────────────────────────────────────────────────────────────────
// Volume Safety
// ─────────────────────────────────────────────────────────────────────────────

/// Largest relative step transmitted in a single flush.
pub const MAX_RELATIVE_VOLUME_STEP: f64 = 25.0;

/// Minimum spacing between transmitted relative steps for one output.
pub const MIN_VOLUME_STEP_INTERVAL: Duration = Duration::from_millis(100);

/// Range assumed when a device advertises no volume descriptor.
pub const DEFAULT_VOLUME_MIN: f64 = 0.0;

/// Range assumed when a device advertises no volume descriptor.
pub const DEFAULT_VOLUME_MAX: f64 = 100.0;

// ─────────────────────────────────────────────────────────────────────────────
// Artwork
// ─────────────────────────────────────────────────────────────────────────────

/// Redirects followed before an artwork fetch is aborted.
pub const MAX_ARTWORK_REDIRECTS: usize = 5;

/// Upper bound on an artwork body (10 MB).
pub const MAX_ARTWORK_BYTES: usize = 10 * 1024 * 1024;

/// Timeout for a single artwork fetch (seconds).
pub const ARTWORK_TIMEOUT_SECS: u64 = 10;

/// Largest width or height a caller may request from the resizer (pixels).
pub const MAX_ARTWORK_DIMENSION: u32 = 2048;

// ─────────────────────────────────────────────────────────────────────────────
// Other Backends
// ─────────────────────────────────────────────────────────────────────────────

/// Default Logitech Media Server HTTP port.
pub const LMS_DEFAULT_PORT: u16 = 9000;

/// Timeout for one LMS JSON-RPC request (seconds).
pub const LMS_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Maximum number of players requested from LMS per poll.
pub const LMS_MAX_PLAYERS: u32 = 100;

/// Default HQPlayer control port.
pub const HQPLAYER_DEFAULT_PORT: u16 = 4321;

/// Native id of the single HQPlayer pseudo-zone.
pub const HQPLAYER_ZONE_ID: &str = "pipeline";

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the bus event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Extension id presented to the Roon core.
pub const EXTENSION_ID: &str = "com.unified-hifi-control.bridge";

/// Application name used in protocol handshakes.
pub const APP_NAME: &str = "Unified Hi-Fi Control";
