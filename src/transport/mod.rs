//! Transport layer: one contract, three physical backends.
//!
//! Every transport variant produces a [`TransportLink`]: a receiver and
//! sender channel pair plus the worker tasks pumping the physical
//! connection. Dropping the link aborts its workers and closes the
//! underlying resource, which is how cancellation works everywhere in
//! this crate - close first, never join.

use std::{sync::Arc, time::Duration};

use bluer::{Adapter, Address, Session};
use futures::future::BoxFuture;
use log::debug;
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};
use uuid::Uuid;

use crate::{
   error::{OxiLinkError, Result},
   event::EventSender,
};

pub mod gatt;
pub mod rfcomm;
pub mod serial;

pub type Packet = SmallVec<[u8; 32]>;

/// Per-link channel depth.
const CHANNEL_BUFFER_SIZE: usize = 128;
/// Timeout for acknowledged write operations.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// OUI of the BerryMed low-energy oximeter modules. Addresses in this
/// block take the GATT path; everything else uses classic RFCOMM.
const LE_OXIMETER_OUI: [u8; 3] = [0x00, 0xA0, 0x50];

pub fn is_le_oximeter(addr: Address) -> bool {
   addr.0[..3] == LE_OXIMETER_OUI
}

/// Transport-level identity of a remote oximeter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceId {
   Bluetooth(Address),
   /// Serial device node, e.g. `/dev/ttyUSB0`.
   Serial(SmolStr),
}

impl std::fmt::Display for DeviceId {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         Self::Bluetooth(addr) => addr.fmt(f),
         Self::Serial(port) => f.write_str(port),
      }
   }
}

/// The two classic-radio service records the oximeter link advertises
/// and dials, inherited from the original device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ServiceKind {
   /// Standard Serial Port Profile record.
   Secure,
   /// Unauthenticated link for sensors that cannot pair.
   Insecure,
}

impl ServiceKind {
   pub const fn from_secure(secure: bool) -> Self {
      if secure { Self::Secure } else { Self::Insecure }
   }

   /// Advertised service-record UUID.
   pub const fn uuid(self) -> Uuid {
      match self {
         Self::Secure => Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb),
         Self::Insecure => Uuid::from_u128(0x8ce255c0_200a_11e0_ac64_0800200c9a66),
      }
   }

   /// RFCOMM channel backing the service record.
   pub const fn channel(self) -> u8 {
      match self {
         Self::Secure => 1,
         Self::Insecure => 2,
      }
   }
}

/// Identity and display name of the peer behind an established link.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
   pub id: DeviceId,
   pub name: SmolStr,
}

pub(crate) enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an established transport.
#[derive(Debug)]
pub struct LinkReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl LinkReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self
         .rx
         .recv()
         .await
         .ok_or(OxiLinkError::ConnectionClosed)?
   }
}

/// Sender half of an established transport. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Command>,
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(OxiLinkError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| OxiLinkError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| OxiLinkError::ConnectionLost)?
         .map_err(|_| OxiLinkError::ConnectionClosed)?
   }
}

/// One established physical connection plus its pump workers.
///
/// At most one is current per supervisor; dropping it aborts the
/// workers, which closes the owned socket or port.
#[derive(Debug)]
pub struct TransportLink {
   receiver: LinkReceiver,
   sender: LinkSender,
   jset: JoinSet<()>,
}

impl TransportLink {
   pub(crate) fn new(
      rx: mpsc::Receiver<Result<Packet>>,
      tx: mpsc::Sender<Command>,
      jset: JoinSet<()>,
   ) -> Self {
      Self {
         receiver: LinkReceiver { rx },
         sender: LinkSender { tx },
         jset,
      }
   }

   pub fn sender(&self) -> LinkSender {
      self.sender.clone()
   }

   pub async fn recv(&mut self) -> Result<Packet> {
      self.receiver.recv().await
   }

   /// Builds the channel halves for a new link. The transport spawns
   /// its read worker with the returned producer side and its write
   /// worker with the command receiver.
   pub(crate) fn channels() -> (
      mpsc::Sender<Result<Packet>>,
      mpsc::Receiver<Result<Packet>>,
      mpsc::Sender<Command>,
      mpsc::Receiver<Command>,
   ) {
      let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      (in_tx, in_rx, cmd_tx, cmd_rx)
   }
}

impl Drop for TransportLink {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Factory seam between the supervisor and the physical transports.
///
/// The production implementation is [`BluerBackend`]; tests substitute
/// an in-memory one.
pub trait LinkBackend: Send + Sync {
   /// Opens an inbound listening endpoint for one service record.
   fn listen(&self, service: ServiceKind) -> BoxFuture<'static, Result<Box<dyn InboundAcceptor>>>;

   /// Opens an outbound connection to the given device. Blocks until
   /// the link is up or the attempt failed; a failed attempt leaves no
   /// half-open resource behind.
   fn open(
      &self,
      device: DeviceId,
      secure: bool,
   ) -> BoxFuture<'static, Result<(TransportLink, RemoteInfo)>>;
}

/// A bound inbound endpoint. Dropping it closes the listening socket,
/// unblocking any accept in flight.
pub trait InboundAcceptor: Send {
   fn accept(&mut self) -> BoxFuture<'_, Result<(TransportLink, RemoteInfo)>>;
}

/// Production backend: Bluetooth via bluer, serial via serialport.
pub struct BluerBackend {
   adapter: Adapter,
   events: EventSender,
   serial_poll: Duration,
}

impl BluerBackend {
   pub async fn new(events: EventSender, serial_poll: Duration) -> Result<Self> {
      let session = Session::new()
         .await
         .map_err(|_| OxiLinkError::CapabilityUnavailable("no Bluetooth session"))?;
      let adapter = session
         .default_adapter()
         .await
         .map_err(|_| OxiLinkError::CapabilityUnavailable("no Bluetooth adapter"))?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
      }
      Ok(Self {
         adapter,
         events,
         serial_poll,
      })
   }

   pub fn adapter(&self) -> &Adapter {
      &self.adapter
   }
}

/// Resolves the peer display name, falling back to the address string.
pub(crate) async fn display_name(adapter: &Adapter, addr: Address) -> SmolStr {
   match adapter.device(addr) {
      Ok(device) => device
         .name()
         .await
         .ok()
         .flatten()
         .map_or_else(|| addr.to_smolstr(), SmolStr::from),
      Err(_) => addr.to_smolstr(),
   }
}

impl LinkBackend for BluerBackend {
   fn listen(&self, service: ServiceKind) -> BoxFuture<'static, Result<Box<dyn InboundAcceptor>>> {
      let adapter = self.adapter.clone();
      Box::pin(async move {
         let acceptor = rfcomm::listen(adapter, service).await?;
         Ok(Box::new(acceptor) as Box<dyn InboundAcceptor>)
      })
   }

   fn open(
      &self,
      device: DeviceId,
      secure: bool,
   ) -> BoxFuture<'static, Result<(TransportLink, RemoteInfo)>> {
      let adapter = self.adapter.clone();
      let events = Arc::clone(&self.events);
      let serial_poll = self.serial_poll;
      Box::pin(async move {
         match device {
            DeviceId::Bluetooth(addr) => {
               let name = display_name(&adapter, addr).await;
               let link = if is_le_oximeter(addr) {
                  debug!("{addr} is in the LE oximeter OUI block, using GATT");
                  gatt::connect(&adapter, addr).await?
               } else {
                  rfcomm::connect(addr, ServiceKind::from_secure(secure)).await?
               };
               Ok((
                  link,
                  RemoteInfo {
                     id: DeviceId::Bluetooth(addr),
                     name,
                  },
               ))
            },
            DeviceId::Serial(port) => serial::open(&port, events, serial_poll).await,
         }
      })
   }
}
