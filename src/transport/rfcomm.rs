//! Classic-radio transport over RFCOMM.
//!
//! Two variants share one stream pump: a listener bound to one of the
//! two advertised service records, and an outbound dialer. Accepted or
//! dialed streams are pumped by a read worker feeding the raw byte
//! queue and a write worker draining the command channel.

use std::time::Duration;

use bluer::{
   Adapter, Address,
   rfcomm::{Listener, SocketAddr, Stream},
};
use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::mpsc,
   task::JoinSet,
   time,
};

use crate::{
   error::{OxiLinkError, Result},
   transport::{
      Command, DeviceId, InboundAcceptor, Packet, RemoteInfo, ServiceKind, TransportLink,
      display_name,
   },
};

/// Read buffer for one stream read.
const READ_BUFFER_SIZE: usize = 256;
/// Settle delay before the first read on a fresh socket.
const READ_SETTLE_DELAY: Duration = Duration::from_millis(100);
/// Pacing between reads; the sensor streams well below this rate.
const READ_PACE_INTERVAL: Duration = Duration::from_millis(40);

/// Dials the given device on one of the two service records.
///
/// A failed attempt drops the half-open socket before returning.
pub async fn connect(addr: Address, service: ServiceKind) -> Result<TransportLink> {
   debug!("Connecting RFCOMM to {addr} ({service}, channel {})", service.channel());
   let sa = SocketAddr::new(addr, service.channel());
   let stream = Stream::connect(sa).await?;
   Ok(spawn_pump(addr, stream))
}

/// Binds an inbound listener for one service record.
pub async fn listen(adapter: Adapter, service: ServiceKind) -> Result<RfcommAcceptor> {
   let sa = SocketAddr::new(Address::any(), service.channel());
   let listener = Listener::bind(sa).await?;
   debug!(
      "Listening for inbound {service} links on channel {} ({})",
      service.channel(),
      service.uuid()
   );
   Ok(RfcommAcceptor {
      listener,
      adapter,
      service,
   })
}

/// A bound inbound endpoint for one service record. Dropping it closes
/// the listening socket.
pub struct RfcommAcceptor {
   listener: Listener,
   adapter: Adapter,
   service: ServiceKind,
}

impl RfcommAcceptor {
   async fn accept_one(&mut self) -> Result<(TransportLink, RemoteInfo)> {
      let (stream, sa) = self.listener.accept().await?;
      debug!("Accepted inbound {} link from {}", self.service, sa.addr);
      let name = display_name(&self.adapter, sa.addr).await;
      Ok((
         spawn_pump(sa.addr, stream),
         RemoteInfo {
            id: DeviceId::Bluetooth(sa.addr),
            name,
         },
      ))
   }
}

impl InboundAcceptor for RfcommAcceptor {
   fn accept(&mut self) -> BoxFuture<'_, Result<(TransportLink, RemoteInfo)>> {
      Box::pin(self.accept_one())
   }
}

fn spawn_pump(addr: Address, stream: Stream) -> TransportLink {
   let (in_tx, in_rx, cmd_tx, cmd_rx) = TransportLink::channels();
   let (read_half, write_half) = tokio::io::split(stream);

   let mut jset = JoinSet::new();
   jset.spawn(recv_worker(addr, in_tx, read_half));
   jset.spawn(send_worker(addr, cmd_rx, write_half));
   TransportLink::new(in_rx, cmd_tx, jset)
}

async fn recv_worker(
   addr: Address,
   tx: mpsc::Sender<Result<Packet>>,
   mut read_half: ReadHalf<Stream>,
) {
   // Some sensor firmwares drop bytes written during link setup.
   time::sleep(READ_SETTLE_DELAY).await;

   let mut buf = [0u8; READ_BUFFER_SIZE];
   loop {
      match read_half.read(&mut buf).await {
         Ok(0) => {
            warn!("RFCOMM link to {addr} closed by peer");
            let _ = tx.send(Err(OxiLinkError::ConnectionLost)).await;
            return;
         },
         Ok(n) => {
            let recvd = &buf[..n];
            debug!("← {addr}: {}", hex::encode(recvd));
            if tx.send(Ok(Packet::from_slice(recvd))).await.is_err() {
               return;
            }
         },
         Err(e) => {
            warn!("RFCOMM read from {addr} failed: {e}");
            let _ = tx.send(Err(OxiLinkError::Io(e))).await;
            return;
         },
      }
      time::sleep(READ_PACE_INTERVAL).await;
   }
}

async fn send_worker(
   addr: Address,
   mut rx: mpsc::Receiver<Command>,
   mut write_half: WriteHalf<Stream>,
) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {addr}: {}", hex::encode(&data));
            if let Err(e) = write_half.write_all(&data).await {
               warn!("RFCOMM write to {addr} failed: {e}");
               let _ = then.send(Err(OxiLinkError::Io(e)));
            } else {
               let _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("RFCOMM send worker for {addr} shut down");
}
