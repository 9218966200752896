//! Connection supervisor: the link state machine.
//!
//! Owns the current transport and every worker task around it: up to
//! two inbound listeners, at most one connect worker, at most one data
//! pump. All state transitions and handle swaps happen under one mutex,
//! so two transitions can never interleave. Cancelling a worker means
//! aborting it, which drops its owned resource; the supervisor never
//! joins a worker inline with a transition.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::ToSmolStr;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   error::OxiLinkError,
   event::{EventSender, LinkEvent},
   transport::{DeviceId, LinkBackend, LinkSender, Packet, RemoteInfo, ServiceKind, TransportLink},
};

/// Link lifecycle states. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum LinkState {
   #[default]
   Idle,
   Listening,
   Connecting,
   Connected,
}

const LISTENER_SERVICES: [ServiceKind; 2] = [ServiceKind::Secure, ServiceKind::Insecure];

struct PumpWorker {
   handle: JoinHandle<()>,
   sender: LinkSender,
}

#[derive(Default)]
struct SupervisorInner {
   state: LinkState,
   listeners: [Option<JoinHandle<()>>; 2],
   connect_worker: Option<JoinHandle<()>>,
   /// Bumped whenever the connect worker is replaced or cancelled; a
   /// completing worker must present the epoch it was spawned with, so
   /// a late cancel can never race a successful connect.
   connect_epoch: u64,
   pump: Option<PumpWorker>,
}

/// Drives the `Idle -> Listening -> Connecting -> Connected` state
/// machine over an injected [`LinkBackend`].
pub struct Supervisor {
   backend: Arc<dyn LinkBackend>,
   events: EventSender,
   bytes_tx: mpsc::UnboundedSender<Packet>,
   auto_relisten: bool,
   inner: Mutex<SupervisorInner>,
}

impl Supervisor {
   pub fn new(
      backend: Arc<dyn LinkBackend>,
      events: EventSender,
      bytes_tx: mpsc::UnboundedSender<Packet>,
      auto_relisten: bool,
   ) -> Arc<Self> {
      Arc::new(Self {
         backend,
         events,
         bytes_tx,
         auto_relisten,
         inner: Mutex::new(SupervisorInner::default()),
      })
   }

   pub fn state(&self) -> LinkState {
      self.inner.lock().state
   }

   fn set_state(&self, inner: &mut SupervisorInner, state: LinkState) {
      if inner.state != state {
         debug!("Link state {} -> {state}", inner.state);
         inner.state = state;
         self.events.emit(LinkEvent::StateChanged(state));
      }
   }

   /// Transitions to Listening and ensures one live inbound listener
   /// per service record. Cancels any connect or connected worker.
   /// Idempotent for listeners that are already running.
   pub fn start_listening(self: &Arc<Self>) {
      let mut inner = self.inner.lock();
      if let Some(handle) = inner.connect_worker.take() {
         handle.abort();
      }
      inner.connect_epoch += 1;
      if let Some(pump) = inner.pump.take() {
         pump.handle.abort();
      }
      self.set_state(&mut inner, LinkState::Listening);

      for (slot, service) in LISTENER_SERVICES.into_iter().enumerate() {
         let live = inner.listeners[slot]
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
         if live {
            continue;
         }
         let this = Arc::clone(self);
         inner.listeners[slot] = Some(tokio::spawn(listener_worker(this, service)));
      }
   }

   /// Starts an outbound connection attempt, cancelling any previous
   /// connect-in-progress or connected session first. There is never
   /// more than one connect worker.
   pub fn connect(self: &Arc<Self>, device: DeviceId, secure: bool) {
      let mut inner = self.inner.lock();
      if let Some(handle) = inner.connect_worker.take() {
         handle.abort();
      }
      if let Some(pump) = inner.pump.take() {
         pump.handle.abort();
      }
      inner.connect_epoch += 1;
      let epoch = inner.connect_epoch;

      info!("Connecting to {device}");
      let this = Arc::clone(self);
      inner.connect_worker = Some(tokio::spawn(connect_worker(this, device, secure, epoch)));
      self.set_state(&mut inner, LinkState::Connecting);
   }

   /// Installs an established link as the current transport.
   ///
   /// Cancels every other worker kind: a previous pump, a connect
   /// worker, and both inbound listeners - accepting further inbound
   /// connections is meaningless once one link is up.
   pub fn on_connected(self: &Arc<Self>, link: TransportLink, remote: &RemoteInfo) {
      let mut inner = self.inner.lock();
      if let Some(handle) = inner.connect_worker.take() {
         handle.abort();
      }
      inner.connect_epoch += 1;
      if let Some(pump) = inner.pump.take() {
         pump.handle.abort();
      }
      for slot in &mut inner.listeners {
         if let Some(handle) = slot.take() {
            handle.abort();
         }
      }

      let sender = link.sender();
      let this = Arc::clone(self);
      let handle = tokio::spawn(pump_worker(this, link));
      inner.pump = Some(PumpWorker { handle, sender });

      info!("Connected to {} ({})", remote.name, remote.id);
      self
         .events
         .emit(LinkEvent::DeviceConnected(remote.name.clone()));
      self.set_state(&mut inner, LinkState::Connected);
   }

   /// Cancels every worker and returns to Idle. Explicit teardown.
   pub fn stop(&self) {
      let mut inner = self.inner.lock();
      if let Some(handle) = inner.connect_worker.take() {
         handle.abort();
      }
      inner.connect_epoch += 1;
      if let Some(pump) = inner.pump.take() {
         pump.handle.abort();
      }
      for slot in &mut inner.listeners {
         if let Some(handle) = slot.take() {
            handle.abort();
         }
      }
      self.set_state(&mut inner, LinkState::Idle);
   }

   /// Writes to the current link. Silent no-op unless Connected; data
   /// cannot be queued for a future connection.
   pub async fn send(&self, data: &[u8]) {
      let sender = {
         let inner = self.inner.lock();
         if inner.state != LinkState::Connected {
            return;
         }
         inner.pump.as_ref().map(|pump| pump.sender.clone())
      };
      if let Some(sender) = sender
         && let Err(e) = sender.send(data).await
      {
         warn!("Send failed: {e}");
      }
   }

   /// Takes the connect worker's own handle if `epoch` is still
   /// current. Returns false when the attempt has been superseded.
   fn claim_connect(&self, epoch: u64) -> bool {
      let mut inner = self.inner.lock();
      if inner.connect_epoch != epoch {
         return false;
      }
      // Our own task; take without abort.
      inner.connect_worker = None;
      true
   }

   fn connection_failed(self: &Arc<Self>, reason: &OxiLinkError) {
      warn!("Connection failed: {reason}");
      self
         .events
         .emit(LinkEvent::ConnectionFailed(reason.to_smolstr()));
      if self.auto_relisten {
         self.start_listening();
      } else {
         self.stop();
      }
   }

   fn connection_lost(self: &Arc<Self>) {
      {
         let inner = self.inner.lock();
         if inner.state != LinkState::Connected {
            return;
         }
      }
      warn!("Connection lost");
      self.events.emit(LinkEvent::DeviceDisconnected);
      if self.auto_relisten {
         self.start_listening();
      } else {
         self.stop();
      }
   }
}

impl Drop for Supervisor {
   fn drop(&mut self) {
      let mut inner = self.inner.lock();
      if let Some(handle) = inner.connect_worker.take() {
         handle.abort();
      }
      if let Some(pump) = inner.pump.take() {
         pump.handle.abort();
      }
      for slot in &mut inner.listeners {
         if let Some(handle) = slot.take() {
            handle.abort();
         }
      }
   }
}

/// Accepts inbound connections on one service record until cancelled.
async fn listener_worker(this: Arc<Supervisor>, service: ServiceKind) {
   let mut acceptor = match this.backend.listen(service).await {
      Ok(acceptor) => acceptor,
      Err(e) => {
         warn!("Failed to open {service} listener: {e}");
         return;
      },
   };

   while this.state() != LinkState::Connected {
      match acceptor.accept().await {
         Ok((link, remote)) => match this.state() {
            LinkState::Listening | LinkState::Connecting => {
               debug!("Inbound {service} connection from {}", remote.id);
               this.on_connected(link, &remote);
            },
            LinkState::Idle | LinkState::Connected => {
               // Unwanted inbound socket; dropping the link closes it.
               debug!("Rejecting inbound {service} connection from {}", remote.id);
            },
         },
         Err(e) => {
            debug!("{service} accept failed: {e}");
            return;
         },
      }
   }
}

/// Opens the chosen transport and hands it to the supervisor.
async fn connect_worker(this: Arc<Supervisor>, device: DeviceId, secure: bool, epoch: u64) {
   match this.backend.open(device, secure).await {
      Ok((link, remote)) => {
         if this.claim_connect(epoch) {
            this.on_connected(link, &remote);
         }
         // Superseded: dropping the fresh link tears it down.
      },
      Err(e) => {
         // The transport closed its half-open resource before erroring.
         if this.claim_connect(epoch) {
            this.connection_failed(&e);
         }
      },
   }
}

/// Relays incoming bytes from the established link into the raw byte
/// queue until the transport reports an error.
async fn pump_worker(this: Arc<Supervisor>, mut link: TransportLink) {
   loop {
      match link.recv().await {
         Ok(packet) => {
            if this.bytes_tx.send(packet).is_err() {
               debug!("Byte queue consumer gone, pump exiting");
               return;
            }
         },
         Err(e) => {
            debug!("Data pump read failed: {e}");
            this.connection_lost();
            return;
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{
      sync::atomic::{AtomicUsize, Ordering},
      time::Duration,
   };

   use futures::future::BoxFuture;
   use tokio::{sync::oneshot, task::JoinSet, time};

   use super::*;
   use crate::{
      error::Result,
      event::ChannelBus,
      transport::{Command, InboundAcceptor},
   };

   type Inbound = (TransportLink, RemoteInfo);

   struct OpenRequest {
      device: DeviceId,
      reply: oneshot::Sender<Result<(TransportLink, RemoteInfo)>>,
   }

   struct MockBackend {
      open_reqs: mpsc::UnboundedSender<OpenRequest>,
      listen_txs: Mutex<Vec<mpsc::UnboundedSender<Inbound>>>,
      live_acceptors: Arc<AtomicUsize>,
   }

   struct MockAcceptor {
      rx: mpsc::UnboundedReceiver<Inbound>,
      live: Arc<AtomicUsize>,
   }

   impl Drop for MockAcceptor {
      fn drop(&mut self) {
         self.live.fetch_sub(1, Ordering::SeqCst);
      }
   }

   impl InboundAcceptor for MockAcceptor {
      fn accept(&mut self) -> BoxFuture<'_, Result<Inbound>> {
         Box::pin(async {
            self
               .rx
               .recv()
               .await
               .ok_or(OxiLinkError::ConnectionClosed)
         })
      }
   }

   impl LinkBackend for MockBackend {
      fn listen(&self, _service: ServiceKind) -> BoxFuture<'static, Result<Box<dyn InboundAcceptor>>> {
         let (tx, rx) = mpsc::unbounded_channel();
         self.listen_txs.lock().push(tx);
         self.live_acceptors.fetch_add(1, Ordering::SeqCst);
         let live = Arc::clone(&self.live_acceptors);
         Box::pin(async move { Ok(Box::new(MockAcceptor { rx, live }) as Box<dyn InboundAcceptor>) })
      }

      fn open(&self, device: DeviceId, _secure: bool) -> BoxFuture<'static, Result<Inbound>> {
         let (reply, rx) = oneshot::channel();
         let _ = self.open_reqs.send(OpenRequest { device, reply });
         Box::pin(async move {
            rx.await.map_err(|_| OxiLinkError::ConnectionClosed)?
         })
      }
   }

   struct Fixture {
      supervisor: Arc<Supervisor>,
      backend: Arc<MockBackend>,
      open_reqs: mpsc::UnboundedReceiver<OpenRequest>,
      events: mpsc::UnboundedReceiver<LinkEvent>,
      bytes_rx: mpsc::UnboundedReceiver<Packet>,
   }

   fn fixture() -> Fixture {
      let (open_tx, open_reqs) = mpsc::unbounded_channel();
      let backend = Arc::new(MockBackend {
         open_reqs: open_tx,
         listen_txs: Mutex::new(Vec::new()),
         live_acceptors: Arc::new(AtomicUsize::new(0)),
      });
      let (bus, events) = ChannelBus::new();
      let (bytes_tx, bytes_rx) = mpsc::unbounded_channel();
      let supervisor = Supervisor::new(backend.clone(), bus, bytes_tx, true);
      Fixture {
         supervisor,
         backend,
         open_reqs,
         events,
         bytes_rx,
      }
   }

   /// A loopback link: the test keeps the byte producer and the write
   /// command receiver.
   fn mock_link(
      addr_tag: &str,
   ) -> (
      TransportLink,
      RemoteInfo,
      mpsc::Sender<Result<Packet>>,
      mpsc::Receiver<Command>,
   ) {
      let (in_tx, in_rx, cmd_tx, cmd_rx) = TransportLink::channels();
      let link = TransportLink::new(in_rx, cmd_tx, JoinSet::new());
      let remote = RemoteInfo {
         id: DeviceId::Serial(addr_tag.into()),
         name: addr_tag.into(),
      };
      (link, remote, in_tx, cmd_rx)
   }

   async fn settle() {
      time::sleep(Duration::from_millis(20)).await;
   }

   fn drain(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
      std::iter::from_fn(|| events.try_recv().ok()).collect()
   }

   #[tokio::test]
   async fn second_connect_supersedes_the_first_worker() {
      let mut fx = fixture();

      fx.supervisor.connect(DeviceId::Serial("a".into()), true);
      settle().await;
      let first = fx.open_reqs.recv().await.unwrap();

      fx.supervisor.connect(DeviceId::Serial("b".into()), true);
      settle().await;
      let second = fx.open_reqs.recv().await.unwrap();
      assert_eq!(second.device, DeviceId::Serial("b".into()));

      // A late success from the cancelled worker must not connect.
      let (link, remote, _in_tx, _cmd_rx) = mock_link("a");
      let _ = first.reply.send(Ok((link, remote)));
      settle().await;
      assert_eq!(fx.supervisor.state(), LinkState::Connecting);

      let (link, remote, _in_tx2, _cmd_rx2) = mock_link("b");
      second.reply.send(Ok((link, remote))).unwrap();
      settle().await;
      assert_eq!(fx.supervisor.state(), LinkState::Connected);

      let connected = drain(&mut fx.events)
         .into_iter()
         .filter(|e| matches!(e, LinkEvent::DeviceConnected(_)))
         .count();
      assert_eq!(connected, 1);
   }

   #[tokio::test]
   async fn failed_connect_reports_and_resumes_listening() {
      let mut fx = fixture();

      fx.supervisor.connect(DeviceId::Serial("a".into()), false);
      settle().await;
      let req = fx.open_reqs.recv().await.unwrap();
      req
         .reply
         .send(Err(OxiLinkError::TransportOpen("refused")))
         .unwrap();
      settle().await;

      assert_eq!(fx.supervisor.state(), LinkState::Listening);
      let events = drain(&mut fx.events);
      assert!(
         events
            .iter()
            .any(|e| matches!(e, LinkEvent::ConnectionFailed(_)))
      );
      // Both inbound listeners came up with the automatic re-listen.
      assert_eq!(fx.backend.live_acceptors.load(Ordering::SeqCst), 2);
   }

   #[tokio::test]
   async fn inbound_connection_closes_both_listeners() {
      let mut fx = fixture();

      fx.supervisor.start_listening();
      settle().await;
      assert_eq!(fx.supervisor.state(), LinkState::Listening);
      assert_eq!(fx.backend.live_acceptors.load(Ordering::SeqCst), 2);

      let (link, remote, _in_tx, _cmd_rx) = mock_link("peer");
      let tx = fx.backend.listen_txs.lock()[0].clone();
      tx.send((link, remote)).unwrap();
      settle().await;

      assert_eq!(fx.supervisor.state(), LinkState::Connected);
      assert_eq!(
         fx.backend.live_acceptors.load(Ordering::SeqCst),
         0,
         "accepting inbound links is meaningless once connected"
      );

      // A further inbound attempt has nobody listening anymore.
      let (link, remote, _in_tx2, _cmd_rx2) = mock_link("late");
      assert!(tx.send((link, remote)).is_err());

      let events = drain(&mut fx.events);
      assert!(
         events
            .iter()
            .any(|e| matches!(e, LinkEvent::DeviceConnected(name) if name.as_str() == "peer"))
      );
   }

   #[tokio::test]
   async fn io_failure_returns_to_listening_without_external_help() {
      let mut fx = fixture();

      fx.supervisor.connect(DeviceId::Serial("a".into()), true);
      settle().await;
      let req = fx.open_reqs.recv().await.unwrap();
      let (link, remote, in_tx, _cmd_rx) = mock_link("a");
      req.reply.send(Ok((link, remote))).unwrap();
      settle().await;
      assert_eq!(fx.supervisor.state(), LinkState::Connected);

      // Data flows into the raw byte queue in arrival order.
      in_tx
         .send(Ok(Packet::from_slice(&[0x83, 0x40])))
         .await
         .unwrap();
      settle().await;
      assert_eq!(
         fx.bytes_rx.try_recv().unwrap().as_slice(),
         &[0x83, 0x40]
      );

      in_tx.send(Err(OxiLinkError::ConnectionLost)).await.unwrap();
      settle().await;

      assert_eq!(fx.supervisor.state(), LinkState::Listening);
      let events = drain(&mut fx.events);
      assert!(
         events
            .iter()
            .any(|e| matches!(e, LinkEvent::DeviceDisconnected))
      );
   }

   #[tokio::test]
   async fn send_is_a_silent_noop_unless_connected() {
      let mut fx = fixture();

      // Not connected: nothing happens, nothing panics.
      fx.supervisor.send(b"\x01").await;

      fx.supervisor.connect(DeviceId::Serial("a".into()), true);
      settle().await;
      let req = fx.open_reqs.recv().await.unwrap();
      let (link, remote, _in_tx, mut cmd_rx) = mock_link("a");
      req.reply.send(Ok((link, remote))).unwrap();
      settle().await;

      let supervisor = Arc::clone(&fx.supervisor);
      let sent = tokio::spawn(async move { supervisor.send(b"\x02\x03").await });
      let Some(Command::Send { data, then }) = cmd_rx.recv().await else {
         panic!("expected a write command");
      };
      assert_eq!(data.as_slice(), &[0x02, 0x03]);
      then.send(Ok(())).unwrap();
      sent.await.unwrap();
   }

   #[tokio::test]
   async fn stop_reaches_idle_from_any_state() {
      let mut fx = fixture();

      fx.supervisor.start_listening();
      settle().await;
      fx.supervisor.stop();
      settle().await;

      assert_eq!(fx.supervisor.state(), LinkState::Idle);
      assert_eq!(fx.backend.live_acceptors.load(Ordering::SeqCst), 0);

      let states: Vec<_> = drain(&mut fx.events)
         .into_iter()
         .filter_map(|e| match e {
            LinkEvent::StateChanged(s) => Some(s),
            _ => None,
         })
         .collect();
      assert_eq!(states, vec![LinkState::Listening, LinkState::Idle]);
   }

   #[tokio::test]
   async fn start_listening_is_idempotent_for_live_listeners() {
      let fx = fixture();

      fx.supervisor.start_listening();
      settle().await;
      fx.supervisor.start_listening();
      settle().await;

      assert_eq!(fx.backend.live_acceptors.load(Ordering::SeqCst), 2);
      assert_eq!(fx.backend.listen_txs.lock().len(), 2);
   }
}
