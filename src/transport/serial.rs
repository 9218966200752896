//! Serial-over-USB transport.
//!
//! Attached devices are enumerated against a vendor/product-id probe
//! table and the first match is opened at 115200 8N1. Reads poll with
//! a short timeout on a blocking worker; a watchdog re-enumerates
//! periodically and flips the plugged flag when the bridge disappears,
//! which is the only unplug signal this transport gets.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use log::{debug, info, warn};
use serialport::{SerialPortType, UsbPortInfo};
use smol_str::SmolStr;
use tokio::{
   sync::mpsc,
   task::JoinSet,
   time::{self, MissedTickBehavior},
};

use crate::{
   error::{OxiLinkError, Result},
   event::{EventSender, LinkEvent},
   transport::{Command, DeviceId, Packet, RemoteInfo, TransportLink},
};

const BAUD_RATE: u32 = 115_200;
/// One polling read per loop iteration.
const READ_BUFFER_SIZE: usize = 32;

/// Vendor/product pairs of the supported USB serial bridges.
pub const PROBE_TABLE: &[(u16, u16)] = &[
   // Silicon Labs CP210x
   (0x10C4, 0xEA60),
   (0x10C4, 0xEA70),
   (0x10C4, 0xEA80),
   // FTDI FT232/FT231X
   (0x0403, 0x6001),
   (0x0403, 0x6015),
   // Prolific PL2303
   (0x067B, 0x2303),
   // CDC-ACM class devices (Arduino-style bridges)
   (0x2341, 0x0043),
   (0x2341, 0x0001),
];

fn matches_probe_table(info: &UsbPortInfo) -> bool {
   PROBE_TABLE
      .iter()
      .any(|&(vid, pid)| info.vid == vid && info.pid == pid)
}

/// Returns the device node of the first attached bridge matching the
/// probe table, if any.
pub fn probe() -> Result<Option<SmolStr>> {
   for port in serialport::available_ports()? {
      if let SerialPortType::UsbPort(info) = &port.port_type
         && matches_probe_table(info)
      {
         debug!(
            "Probe matched {} (vid {:04x}, pid {:04x})",
            port.port_name, info.vid, info.pid
         );
         return Ok(Some(SmolStr::from(port.port_name)));
      }
   }
   Ok(None)
}

fn any_bridge_attached() -> bool {
   serialport::available_ports()
      .map(|ports| {
         ports.iter().any(|p| {
            matches!(&p.port_type, SerialPortType::UsbPort(info) if matches_probe_table(info))
         })
      })
      .unwrap_or(false)
}

/// Opens the given device node, or the first probed match when the
/// node is empty. Enumeration and the port open are blocking calls and
/// run off the async runtime.
pub async fn open(
   port: &str,
   events: EventSender,
   poll: Duration,
) -> Result<(TransportLink, RemoteInfo)> {
   let requested = SmolStr::from(port);
   let (port_name, serial, writer) = tokio::task::spawn_blocking(move || {
      let port_name = if requested.is_empty() {
         probe()?.ok_or(OxiLinkError::NoMatchingDevice)?
      } else {
         requested
      };
      let serial = serialport::new(port_name.as_str(), BAUD_RATE)
         .timeout(poll)
         .open()?;
      let writer = serial.try_clone()?;
      Ok::<_, OxiLinkError>((port_name, serial, writer))
   })
   .await
   .map_err(|_| OxiLinkError::TransportOpen("serial open task failed"))??;
   info!("Opened serial oximeter at {port_name}");

   let plugged = Arc::new(AtomicBool::new(true));
   events.emit(LinkEvent::UsbStateChanged(true));

   let (in_tx, in_rx, cmd_tx, cmd_rx) = TransportLink::channels();

   let mut jset = JoinSet::new();
   {
      let plugged = Arc::clone(&plugged);
      let tx = in_tx.clone();
      let name = port_name.clone();
      jset.spawn_blocking(move || read_loop(serial, tx, plugged, name));
   }
   {
      let name = port_name.clone();
      jset.spawn_blocking(move || write_loop(writer, cmd_rx, name));
   }
   jset.spawn(watchdog(plugged, in_tx, events, poll));

   let info = RemoteInfo {
      id: DeviceId::Serial(port_name.clone()),
      name: port_name,
   };
   Ok((TransportLink::new(in_rx, cmd_tx, jset), info))
}

fn read_loop(
   mut serial: Box<dyn serialport::SerialPort>,
   tx: mpsc::Sender<Result<Packet>>,
   plugged: Arc<AtomicBool>,
   name: SmolStr,
) {
   let mut buf = [0u8; READ_BUFFER_SIZE];
   while plugged.load(Ordering::Relaxed) && !tx.is_closed() {
      match serial.read(&mut buf) {
         Ok(0) => {},
         Ok(n) => {
            let recvd = &buf[..n];
            debug!("← {name}: {}", hex::encode(recvd));
            if tx.blocking_send(Ok(Packet::from_slice(recvd))).is_err() {
               return;
            }
         },
         Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
         Err(e) => {
            warn!("Serial read from {name} failed: {e}");
            let _ = tx.blocking_send(Err(OxiLinkError::Io(e)));
            return;
         },
      }
   }
   debug!("Serial read loop for {name} exiting");
}

fn write_loop(
   mut serial: Box<dyn serialport::SerialPort>,
   mut rx: mpsc::Receiver<Command>,
   name: SmolStr,
) {
   while let Some(cmd) = rx.blocking_recv() {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {name}: {}", hex::encode(&data));
            let result = serial
               .write_all(&data)
               .and_then(|()| serial.flush())
               .map_err(OxiLinkError::Io);
            if let Err(e) = &result {
               warn!("Serial write to {name} failed: {e}");
            }
            let _ = then.send(result);
         },
      }
   }
   debug!("Serial write loop for {name} exiting");
}

/// Re-enumerates attached bridges and flips the plugged flag when the
/// device disappears.
async fn watchdog(
   plugged: Arc<AtomicBool>,
   tx: mpsc::Sender<Result<Packet>>,
   events: EventSender,
   poll: Duration,
) {
   let mut interval = time::interval(poll);
   interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
   loop {
      interval.tick().await;
      if tx.is_closed() {
         return;
      }
      let attached = tokio::task::spawn_blocking(any_bridge_attached)
         .await
         .unwrap_or(false);
      if !attached {
         warn!("Serial oximeter unplugged");
         plugged.store(false, Ordering::Relaxed);
         events.emit(LinkEvent::UsbStateChanged(false));
         let _ = tx.send(Err(OxiLinkError::ConnectionLost)).await;
         return;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::event::ChannelBus;

   #[tokio::test]
   async fn open_rejects_a_missing_port() {
      let (bus, _events) = ChannelBus::new();
      let result = open("/dev/tty-oxilink-missing", bus, Duration::from_millis(100)).await;
      assert!(result.is_err());
   }

   #[test]
   fn probe_table_matches_known_bridges() {
      let cp210x = UsbPortInfo {
         vid: 0x10C4,
         pid: 0xEA60,
         serial_number: None,
         manufacturer: None,
         product: None,
      };
      assert!(matches_probe_table(&cp210x));

      let unknown = UsbPortInfo {
         vid: 0x1234,
         pid: 0x5678,
         serial_number: None,
         manufacturer: None,
         product: None,
      };
      assert!(!matches_probe_table(&unknown));
   }
}
