//! Error types for the oximeter link engine.
//!
//! Every transport failure in this crate is recoverable: open failures
//! surface once as a connection-failed event and I/O failures as a
//! connection-lost event, after which the supervisor resumes listening.

use thiserror::Error;

/// Main error type for the oximeter link engine.
#[derive(Error, Debug)]
pub enum OxiLinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("Serial port error: {0}")]
   Serial(#[from] serialport::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   /// The transport could not be created or claimed at all.
   #[error("Failed to open transport: {0}")]
   TransportOpen(&'static str),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Not connected")]
   NotConnected,

   #[error("No matching device attached")]
   NoMatchingDevice,

   #[error("Remote device does not expose the oximeter data service")]
   DataServiceNotFound,

   /// Adapter or manager for the requested transport is absent.
   /// Reported once, never retried.
   #[error("Capability unavailable: {0}")]
   CapabilityUnavailable(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `OxiLinkError`.
pub type Result<T> = std::result::Result<T, OxiLinkError>;
