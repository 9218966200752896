//! Low-energy transport over the attribute protocol.
//!
//! The oximeter's receive characteristic delivers variable-length
//! notification payloads; they are concatenated and re-split into fixed
//! 10-byte chunks before entering the raw byte queue, matching the
//! device's transfer package size. Writes are split the same way.

use std::time::Duration;

use bluer::{
   Adapter, Address, Device,
   gatt::remote::Characteristic,
};
use futures::StreamExt;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{sync::mpsc, task::JoinSet, time};
use uuid::Uuid;

use crate::{
   error::{OxiLinkError, Result},
   transport::{Command, Packet, TransportLink},
};

/// Primary data service of the BerryMed LE module.
pub const SERVICE_DATA: Uuid = Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);
/// Notification characteristic carrying measurement bytes.
pub const CHARACTERISTIC_RECEIVE: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);
/// Characteristic for renaming the module; kept for completeness of
/// the service table, the link engine never writes it.
pub const CHARACTERISTIC_RENAME: Uuid = Uuid::from_u128(0x00005343_0000_1000_8000_00805f9b34fb);

/// Fixed application chunk size on the LE link, reads and writes alike.
pub const TRANSFER_CHUNK: usize = 10;

/// How long to wait for service discovery after the link comes up.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_POLL: Duration = Duration::from_millis(250);

/// Connects, discovers the data service and subscribes to measurement
/// notifications.
pub async fn connect(adapter: &Adapter, addr: Address) -> Result<TransportLink> {
   let device = adapter.device(addr)?;
   if !device.is_connected().await? {
      debug!("Connecting GATT to {addr}");
      device.connect().await?;
   }

   let characteristic = match find_receive_characteristic(&device).await {
      Ok(ch) => ch,
      Err(e) => {
         // Do not leave a half-open link behind on a failed setup.
         let _ = device.disconnect().await;
         return Err(e);
      },
   };

   let notify = match characteristic.notify().await {
      Ok(stream) => stream,
      Err(e) => {
         let _ = device.disconnect().await;
         return Err(e.into());
      },
   };
   debug!("Notifications enabled on {CHARACTERISTIC_RECEIVE} for {addr}");

   let (in_tx, in_rx, cmd_tx, cmd_rx) = TransportLink::channels();
   let mut jset = JoinSet::new();
   jset.spawn(recv_worker(addr, in_tx, notify, device));
   jset.spawn(send_worker(addr, cmd_rx, characteristic));
   Ok(TransportLink::new(in_rx, cmd_tx, jset))
}

async fn find_receive_characteristic(device: &Device) -> Result<Characteristic> {
   // Service discovery completes asynchronously after connect.
   let resolved = time::timeout(RESOLVE_TIMEOUT, async {
      while !device.is_services_resolved().await.unwrap_or(false) {
         time::sleep(RESOLVE_POLL).await;
      }
   })
   .await;
   if resolved.is_err() {
      return Err(OxiLinkError::DataServiceNotFound);
   }

   for service in device.services().await? {
      if service.uuid().await? != SERVICE_DATA {
         continue;
      }
      for characteristic in service.characteristics().await? {
         if characteristic.uuid().await? == CHARACTERISTIC_RECEIVE {
            return Ok(characteristic);
         }
      }
   }
   Err(OxiLinkError::DataServiceNotFound)
}

/// Reassembles variable-length notification payloads into fixed
/// [`TRANSFER_CHUNK`]-byte packets.
#[derive(Debug, Default)]
struct Rechunker {
   buf: [u8; TRANSFER_CHUNK],
   filled: usize,
}

impl Rechunker {
   fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(Packet)) {
      for &b in bytes {
         self.buf[self.filled] = b;
         self.filled += 1;
         if self.filled == TRANSFER_CHUNK {
            self.filled = 0;
            emit(Packet::from_slice(&self.buf));
         }
      }
   }
}

/// Disconnects the device when the pump is torn down, including when
/// the worker task is aborted mid-await.
struct DisconnectGuard(Device);

impl Drop for DisconnectGuard {
   fn drop(&mut self) {
      let device = self.0.clone();
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
         handle.spawn(async move {
            let _ = device.disconnect().await;
         });
      }
   }
}

async fn recv_worker(
   addr: Address,
   tx: mpsc::Sender<Result<Packet>>,
   notify: impl futures::Stream<Item = Vec<u8>> + Send + 'static,
   device: Device,
) {
   let _guard = DisconnectGuard(device);
   let mut chunker = Rechunker::default();
   let mut notify = std::pin::pin!(notify);

   while let Some(value) = notify.next().await {
      debug!("← {addr}: {}", hex::encode(&value));
      let mut packets: SmallVec<[Packet; 4]> = SmallVec::new();
      chunker.push(&value, |packet| packets.push(packet));
      for packet in packets {
         if tx.send(Ok(packet)).await.is_err() {
            return;
         }
      }
   }

   warn!("GATT notification stream from {addr} ended");
   let _ = tx.send(Err(OxiLinkError::ConnectionLost)).await;
}

async fn send_worker(addr: Address, mut rx: mpsc::Receiver<Command>, ch: Characteristic) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {addr}: {}", hex::encode(&data));
            let mut result = Ok(());
            for chunk in data.chunks(TRANSFER_CHUNK) {
               if let Err(e) = ch.write(chunk).await {
                  warn!("GATT write to {addr} failed: {e}");
                  result = Err(OxiLinkError::Bluetooth(e));
                  break;
               }
            }
            let _ = then.send(result);
         },
      }
   }
   debug!("GATT send worker for {addr} shut down");
}
