//! Oximeter link daemon.
//!
//! Brings the engine up over the default Bluetooth adapter, starts
//! listening for inbound connections, scans until a device link is up
//! and logs every event the link produces until interrupted.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};

use oxilink::{Config, EventBus, LinkEvent, LinkState, OxiLink, Result, pi_percent};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting oxilink daemon...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();
   let link = Arc::new(OxiLink::new(&config, event_bus.clone()).await?);

   event_bus.spawn_dispatcher(Arc::clone(&link));
   link.start_listening();
   link.start_scan();

   signal::ctrl_c().await?;
   info!("Shutting down oxilink daemon...");
   link.stop_scan();
   link.disconnect();

   Ok(())
}

/// Lock-free event funnel between the engine's workers and the single
/// logging dispatcher task.
struct EventProcessor {
   queue: SegQueue<LinkEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn dispatch(link: &OxiLink, event: LinkEvent) {
      match event {
         LinkEvent::StateChanged(state) => info!("Link state: {state}"),
         LinkEvent::DeviceConnected(name) => info!("Connected to {name}"),
         LinkEvent::DeviceDisconnected => info!("Device disconnected"),
         LinkEvent::ConnectionFailed(reason) => warn!("Connection failed: {reason}"),
         LinkEvent::ParamsChanged(params) => {
            if params.is_valid() {
               info!(
                  "SpO2 {}%, pulse {} bpm, PI {:.1}%",
                  params.spo2,
                  params.pulse_rate,
                  pi_percent(params.pi)
               );
            } else {
               info!("Sensor reports no valid reading");
            }
         },
         LinkEvent::Measurement(record) => {
            debug!(
               "Frame: wave {} pulse_detected {}",
               record.wave, record.pulse_detected
            );
         },
         LinkEvent::ScanStarted => info!("Scan started"),
         LinkEvent::ScanStopped => {
            info!("Scan stopped");
            // Scan-until-found: keep opening windows until a link is
            // up or being set up.
            if matches!(link.state(), LinkState::Idle | LinkState::Listening) {
               link.start_scan();
            }
         },
         LinkEvent::DeviceFound(device) => {
            info!("Found {} ({}) at {} dBm", device.name, device.id, device.rssi);
         },
         LinkEvent::UsbStateChanged(plugged) => {
            info!(
               "USB oximeter {}",
               if plugged { "plugged" } else { "unplugged" }
            );
         },
      }
   }

   fn spawn_dispatcher(self: &Arc<Self>, link: Arc<OxiLink>) {
      let this = Arc::clone(self);
      tokio::spawn(async move {
         while let Some(event) = this.recv().await {
            Self::dispatch(&link, event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
