//! Top-level handle over the whole engine.
//!
//! [`OxiLink`] wires the supervisor, the scanner and the decode pump
//! together and is the only type an embedder needs to hold. All decoded
//! output flows through the event bus passed at construction; the
//! last-known parameter triple is additionally available as a polled
//! snapshot.

use std::{sync::Arc, time::Duration};

use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   config::Config,
   error::Result,
   event::EventSender,
   link::supervisor::{LinkState, Supervisor},
   protocol::frame::{OxiParams, ParamsCell, spawn_decoder},
   scan::ScanManager,
   transport::{BluerBackend, DeviceId, LinkBackend},
};

pub struct OxiLink {
   supervisor: Arc<Supervisor>,
   scanner: Arc<ScanManager>,
   params: ParamsCell,
   decoder: JoinHandle<()>,
}

impl OxiLink {
   /// Builds the engine over the default Bluetooth adapter.
   ///
   /// Fails when no adapter is present; serial-only deployments can
   /// still run by constructing their own backend.
   pub async fn new(config: &Config, events: EventSender) -> Result<Self> {
      let serial_poll = Duration::from_millis(config.serial_poll_ms);
      let backend = BluerBackend::new(Arc::clone(&events), serial_poll).await?;
      let scanner = ScanManager::new(
         backend.adapter().clone(),
         Arc::clone(&events),
         Duration::from_secs(config.scan_window_secs),
      );
      Ok(Self::assemble(
         Arc::new(backend),
         scanner,
         events,
         config.auto_relisten,
      ))
   }

   fn assemble(
      backend: Arc<dyn LinkBackend>,
      scanner: Arc<ScanManager>,
      events: EventSender,
      auto_relisten: bool,
   ) -> Self {
      let (bytes_tx, bytes_rx) = mpsc::unbounded_channel();
      let params: ParamsCell = Arc::default();
      let decoder = spawn_decoder(bytes_rx, Arc::clone(&params), Arc::clone(&events));
      let supervisor = Supervisor::new(backend, events, bytes_tx, auto_relisten);
      Self {
         supervisor,
         scanner,
         params,
         decoder,
      }
   }

   pub fn state(&self) -> LinkState {
      self.supervisor.state()
   }

   /// Last valid SpO2/pulse-rate/PI triple, or the all-zero invalid
   /// triple when the sensor has not yet produced a clean reading.
   pub fn oxi_params(&self) -> OxiParams {
      let params = self.params.load();
      if params.is_valid() {
         params
      } else {
         OxiParams::INVALID
      }
   }

   /// Accepts inbound connections on both service records.
   pub fn start_listening(&self) {
      self.supervisor.start_listening();
   }

   /// Dials an outbound connection. Discovery is stopped first; the
   /// radio cannot scan and connect at the same time.
   pub fn connect(&self, device: DeviceId, secure: bool) {
      self.scanner.stop_scan();
      self.supervisor.connect(device, secure);
   }

   /// Connects to the first attached USB bridge from the probe table.
   pub fn connect_usb(&self) {
      self.connect(DeviceId::Serial(SmolStr::default()), true);
   }

   /// Tears the link down and stops accepting inbound connections.
   pub fn disconnect(&self) {
      self.supervisor.stop();
   }

   /// Writes raw bytes to the connected device. Silently dropped when
   /// no link is up.
   pub async fn send(&self, data: &[u8]) {
      self.supervisor.send(data).await;
   }

   pub fn start_scan(&self) {
      self.scanner.start_scan();
   }

   pub fn stop_scan(&self) {
      self.scanner.stop_scan();
   }

   pub fn is_scanning(&self) -> bool {
      self.scanner.is_scanning()
   }

   /// Last observed signal strength in the current scan window.
   pub fn rssi(&self, id: &DeviceId) -> Option<i16> {
      self.scanner.rssi(id)
   }
}

impl Drop for OxiLink {
   fn drop(&mut self) {
      // Workers hold their own supervisor handle; stopping them is what
      // lets the supervisor itself drop.
      self.supervisor.stop();
      self.decoder.abort();
   }
}

#[cfg(test)]
mod tests {
   use futures::future::BoxFuture;
   use tokio::time;

   use super::*;
   use crate::{
      error::OxiLinkError,
      event::{ChannelBus, LinkEvent},
      transport::{InboundAcceptor, RemoteInfo, ServiceKind, TransportLink},
   };

   /// A backend with no reachable devices and no usable radio.
   struct NullBackend;

   impl LinkBackend for NullBackend {
      fn listen(
         &self,
         _service: ServiceKind,
      ) -> BoxFuture<'static, Result<Box<dyn InboundAcceptor>>> {
         Box::pin(async { Err(OxiLinkError::CapabilityUnavailable("no radio")) })
      }

      fn open(
         &self,
         _device: DeviceId,
         _secure: bool,
      ) -> BoxFuture<'static, Result<(TransportLink, RemoteInfo)>> {
         Box::pin(async { Err(OxiLinkError::NoMatchingDevice) })
      }
   }

   fn engine(auto_relisten: bool) -> (OxiLink, mpsc::UnboundedReceiver<LinkEvent>) {
      let (bus, events) = ChannelBus::new();
      let scanner = ScanManager::detached(Arc::clone(&bus) as EventSender, Duration::from_secs(8));
      let link = OxiLink::assemble(Arc::new(NullBackend), scanner, bus, auto_relisten);
      (link, events)
   }

   #[tokio::test]
   async fn fresh_engine_is_idle_with_invalid_params() {
      let (link, _events) = engine(true);
      assert_eq!(link.state(), LinkState::Idle);
      assert!(!link.oxi_params().is_valid());
      assert!(!link.is_scanning());
   }

   #[tokio::test]
   async fn connect_stops_an_active_scan() {
      let (link, mut events) = engine(false);

      link.start_scan();
      assert!(link.is_scanning());
      link.connect(DeviceId::Serial("/dev/ttyUSB0".into()), true);
      assert!(!link.is_scanning());

      time::sleep(Duration::from_millis(20)).await;
      let got: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
      assert!(got.iter().any(|e| matches!(e, LinkEvent::ScanStarted)));
      assert!(got.iter().any(|e| matches!(e, LinkEvent::ScanStopped)));
      assert!(
         got.iter()
            .any(|e| matches!(e, LinkEvent::ConnectionFailed(_)))
      );
      // auto_relisten off: the failed attempt ends back at Idle.
      assert_eq!(link.state(), LinkState::Idle);
   }

   #[tokio::test]
   async fn send_without_a_link_is_harmless() {
      let (link, _events) = engine(true);
      link.send(&[0x01]).await;
      link.disconnect();
      assert_eq!(link.state(), LinkState::Idle);
   }
}
