//! Device discovery with a bounded scan window.
//!
//! One scan window lasts eight seconds unless stopped earlier. Signal
//! strength is tracked per device across the window; each distinct
//! device is reported exactly once per window, while its RSSI entry
//! keeps updating on repeated advertisement broadcasts.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   event::{DiscoveredDevice, EventSender, LinkEvent},
   transport::{self, DeviceId},
};

#[derive(Default)]
struct ScanInner {
   scanning: bool,
   rssi: HashMap<DeviceId, i16>,
   seen: HashSet<DeviceId>,
   worker: Option<JoinHandle<()>>,
   timer: Option<JoinHandle<()>>,
}

/// Owns the discovery primitive and the scan-window timer.
///
/// Exactly one instance should coordinate one radio; collaborators
/// receive it by reference rather than through a global.
pub struct ScanManager {
   adapter: Option<Adapter>,
   events: EventSender,
   window: Duration,
   inner: Mutex<ScanInner>,
}

impl ScanManager {
   pub fn new(adapter: Adapter, events: EventSender, window: Duration) -> Arc<Self> {
      Arc::new(Self {
         adapter: Some(adapter),
         events,
         window,
         inner: Mutex::new(ScanInner::default()),
      })
   }

   /// A manager with no radio attached; discovery events must be fed
   /// through [`ScanManager::found`].
   #[cfg(test)]
   pub(crate) fn detached(events: EventSender, window: Duration) -> Arc<Self> {
      Arc::new(Self {
         adapter: None,
         events,
         window,
         inner: Mutex::new(ScanInner::default()),
      })
   }

   pub fn is_scanning(&self) -> bool {
      self.inner.lock().scanning
   }

   /// Last observed signal strength for a device in the current window.
   pub fn rssi(&self, id: &DeviceId) -> Option<i16> {
      self.inner.lock().rssi.get(id).copied()
   }

   /// Starts a scan window, restarting any window already in flight.
   ///
   /// The previous discovery worker and stop timer are cancelled before
   /// the new ones start; there is never more than one of each.
   pub fn start_scan(self: &Arc<Self>) {
      let mut inner = self.inner.lock();
      if let Some(worker) = inner.worker.take() {
         worker.abort();
      }
      if let Some(timer) = inner.timer.take() {
         timer.abort();
      }
      inner.rssi.clear();
      inner.seen.clear();
      inner.scanning = true;
      self.events.emit(LinkEvent::ScanStarted);

      if let Some(adapter) = self.adapter.clone() {
         let this = Arc::clone(self);
         inner.worker = Some(tokio::spawn(discovery_worker(this, adapter)));
      }
      let this = Arc::clone(self);
      inner.timer = Some(tokio::spawn(async move {
         time::sleep(this.window).await;
         debug!("Scan window elapsed");
         this.stop_scan();
      }));
   }

   /// Stops the current scan window, if any.
   pub fn stop_scan(&self) {
      let mut inner = self.inner.lock();
      if !inner.scanning {
         return;
      }
      if let Some(worker) = inner.worker.take() {
         worker.abort();
      }
      if let Some(timer) = inner.timer.take() {
         timer.abort();
      }
      inner.scanning = false;
      self.events.emit(LinkEvent::ScanStopped);
   }

   /// Records one discovery broadcast. Updates the RSSI bookkeeping on
   /// every call and forwards a found-device event once per distinct
   /// identifier per window.
   pub fn found(&self, id: DeviceId, name: SmolStr, rssi: i16) {
      let mut inner = self.inner.lock();
      if !inner.scanning {
         return;
      }
      inner.rssi.insert(id.clone(), rssi);
      if inner.seen.insert(id.clone()) {
         self
            .events
            .emit(LinkEvent::DeviceFound(DiscoveredDevice { id, name, rssi }));
      }
   }
}

impl Drop for ScanManager {
   fn drop(&mut self) {
      let mut inner = self.inner.lock();
      if let Some(worker) = inner.worker.take() {
         worker.abort();
      }
      if let Some(timer) = inner.timer.take() {
         timer.abort();
      }
   }
}

async fn discovery_worker(this: Arc<ScanManager>, adapter: Adapter) {
   let events = match adapter.discover_devices().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to start discovery: {e}");
         this.stop_scan();
         return;
      },
   };
   let mut events = std::pin::pin!(events);
   // Per-device property monitors; dropped with the worker at window end.
   let mut monitors = JoinSet::new();

   while let Some(event) = events.next().await {
      let AdapterEvent::DeviceAdded(addr) = event else {
         continue;
      };
      let name = transport::display_name(&adapter, addr).await;
      let rssi = match adapter.device(addr) {
         Ok(device) => device.rssi().await.ok().flatten().unwrap_or(0),
         Err(_) => 0,
      };
      debug!("Discovered {addr} ({name}) at {rssi} dBm");
      this.found(DeviceId::Bluetooth(addr), name.clone(), rssi);

      // Repeated advertisement broadcasts arrive as RSSI property
      // changes; route them through the same bookkeeping.
      let Ok(device) = adapter.device(addr) else {
         continue;
      };
      let this = Arc::clone(&this);
      monitors.spawn(async move {
         let Ok(updates) = device.events().await else {
            return;
         };
         let mut updates = std::pin::pin!(updates);
         while let Some(DeviceEvent::PropertyChanged(prop)) = updates.next().await {
            if let DeviceProperty::Rssi(rssi) = prop {
               this.found(DeviceId::Bluetooth(addr), name.clone(), rssi);
            }
         }
      });
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::event::ChannelBus;
   use bluer::Address;

   fn device(last: u8) -> DeviceId {
      DeviceId::Bluetooth(Address::new([0x00, 0xA0, 0x50, 0x00, 0x00, last]))
   }

   #[tokio::test]
   async fn forwards_each_device_once_per_window() {
      let (bus, mut events) = ChannelBus::new();
      let scanner = ScanManager::detached(bus, Duration::from_secs(8));

      scanner.start_scan();
      scanner.found(device(1), "BerryMed".into(), -40);
      scanner.found(device(1), "BerryMed".into(), -45);
      scanner.found(device(2), "Other".into(), -70);

      assert!(matches!(events.try_recv(), Ok(LinkEvent::ScanStarted)));
      let mut found = 0;
      while let Ok(event) = events.try_recv() {
         if matches!(event, LinkEvent::DeviceFound(_)) {
            found += 1;
         }
      }
      assert_eq!(found, 2, "duplicate broadcasts are suppressed");

      // RSSI bookkeeping still follows the latest broadcast.
      assert_eq!(scanner.rssi(&device(1)), Some(-45));
   }

   #[tokio::test]
   async fn restart_clears_window_state() {
      let (bus, mut events) = ChannelBus::new();
      let scanner = ScanManager::detached(bus, Duration::from_secs(8));

      scanner.start_scan();
      scanner.found(device(1), "BerryMed".into(), -40);
      scanner.start_scan();
      assert_eq!(scanner.rssi(&device(1)), None);

      // The same device is reported again in the new window.
      scanner.found(device(1), "BerryMed".into(), -42);
      let found = std::iter::from_fn(|| events.try_recv().ok())
         .filter(|e| matches!(e, LinkEvent::DeviceFound(_)))
         .count();
      assert_eq!(found, 2);
   }

   #[tokio::test]
   async fn window_stops_on_its_own() {
      let (bus, mut events) = ChannelBus::new();
      let scanner = ScanManager::detached(bus, Duration::from_millis(20));

      scanner.start_scan();
      assert!(scanner.is_scanning());
      time::sleep(Duration::from_millis(80)).await;
      assert!(!scanner.is_scanning());

      let stopped = std::iter::from_fn(|| events.try_recv().ok())
         .filter(|e| matches!(e, LinkEvent::ScanStopped))
         .count();
      assert_eq!(stopped, 1);

      // Broadcasts after the window closes are ignored.
      scanner.found(device(1), "BerryMed".into(), -40);
      assert_eq!(scanner.rssi(&device(1)), None);
   }

   #[tokio::test]
   async fn stop_scan_is_idempotent() {
      let (bus, mut events) = ChannelBus::new();
      let scanner = ScanManager::detached(bus, Duration::from_secs(8));

      scanner.start_scan();
      scanner.stop_scan();
      scanner.stop_scan();

      let stopped = std::iter::from_fn(|| events.try_recv().ok())
         .filter(|e| matches!(e, LinkEvent::ScanStopped))
         .count();
      assert_eq!(stopped, 1);
   }
}
