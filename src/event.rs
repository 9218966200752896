//! Event surface exposed to the application layer.
//!
//! Every observable change in the link (state transitions, scan
//! progress, decoded measurements) is delivered as one tagged
//! [`LinkEvent`] through an [`EventBus`] implementation.

use std::sync::Arc;

use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::{
   link::supervisor::LinkState,
   protocol::frame::{MeasurementRecord, OxiParams},
   transport::DeviceId,
};

/// A device seen during a scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
   pub id: DeviceId,
   pub name: SmolStr,
   pub rssi: i16,
}

/// Events emitted by the oximeter link engine.
#[derive(Debug, Clone)]
pub enum LinkEvent {
   /// The supervisor moved to a new state.
   StateChanged(LinkState),
   /// A link was established; carries the remote display name.
   DeviceConnected(SmolStr),
   DeviceDisconnected,
   ConnectionFailed(SmolStr),
   /// One decoded frame. Fires for every frame, valid params or not.
   Measurement(MeasurementRecord),
   /// The SpO2/pulse-rate/PI triple changed since the previous frame.
   ParamsChanged(OxiParams),
   ScanStarted,
   ScanStopped,
   DeviceFound(DiscoveredDevice),
   /// Serial transport plugged-state flipped.
   UsbStateChanged(bool),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// An [`EventBus`] backed by an unbounded channel.
///
/// Convenient for embedders that want to consume events from a single
/// receiver loop, and for tests.
pub struct ChannelBus {
   tx: mpsc::UnboundedSender<LinkEvent>,
}

impl ChannelBus {
   pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Arc::new(Self { tx }), rx)
   }
}

impl EventBus for ChannelBus {
   fn emit(&self, event: LinkEvent) {
      // Receiver gone means the embedder stopped caring; drop silently.
      let _ = self.tx.send(event);
   }
}
