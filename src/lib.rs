//! Device link and telemetry decoding engine for BerryMed-protocol
//! pulse oximeters.
//!
//! The engine speaks three physical transports - classic Bluetooth
//! RFCOMM, BLE GATT and serial-over-USB - behind one connection state
//! machine, and decodes the 5-byte measurement frames all of them
//! carry. Embedders construct an [`OxiLink`] with an [`EventBus`]
//! implementation and drive it through its handful of methods; every
//! observable change comes back as a [`LinkEvent`].

pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod protocol;
pub mod scan;
pub mod transport;

pub use config::Config;
pub use error::{OxiLinkError, Result};
pub use event::{ChannelBus, DiscoveredDevice, EventBus, EventSender, LinkEvent};
pub use link::{facade::OxiLink, supervisor::LinkState};
pub use protocol::frame::{FrameDecoder, MeasurementRecord, OxiParams, pi_percent};
pub use scan::ScanManager;
pub use transport::{DeviceId, ServiceKind};
