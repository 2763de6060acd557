//! UPnP device families: SSDP discovery, SOAP control and polling.
//!
//! Two families share one engine ([`DiscoveryClient`]):
//!
//! - [`MediaRendererFamily`]: plain AVTransport/RenderingControl renderers
//! - [`OpenHomeFamily`]: OpenHome Playlist/Volume/Info/Time devices

pub mod description;
pub mod didl;
pub mod discovery_client;
pub mod openhome;
pub mod registry;
pub mod renderer;
pub(crate) mod retry;
pub mod soap;
pub mod ssdp;
pub mod types;
pub mod xml;

pub use discovery_client::{DeviceFamily, DiscoveryClient, TransportCommand};
pub use openhome::OpenHomeFamily;
pub use registry::{DeviceSnapshot, DeviceState, TransportState, TransportStatus, VolumeStatus};
pub use renderer::MediaRendererFamily;
pub use soap::{SoapError, SoapFault, SoapResult};
pub use types::{DeviceDescription, DiscoveryError, DiscoveryResult, ServiceEndpoint};
