//! Frame synchronization and measurement decoding.
//!
//! The oximeter streams 5-byte frames with no length or checksum field.
//! Byte 0 carries the frame marker in bit 7; resynchronization after
//! corruption relies on that bit alone. [`FrameDecoder`] is pure and
//! transport independent; [`spawn_decoder`] runs it as the single
//! consumer of the raw byte queue.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::debug;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   event::{EventSender, LinkEvent},
   transport::Packet,
};

/// Length of one wire frame.
pub const FRAME_LEN: usize = 5;

/// Bit 7 of byte 0: start-of-frame marker.
const MARKER_BIT: u8 = 0x80;
/// Bit 6 of byte 0: a pulse beat was detected during this frame.
const PULSE_BIT: u8 = 0x40;
/// Bit 6 of byte 2: top bit of the pulse rate. Mid-frame bytes never
/// carry bit 7, so byte 3 holds only the low 7 bits.
const PULSE_RATE_HIGH_BIT: u8 = 0x40;

/// Approximate perfusion percentages for PI classes 0-8.
const PI_TABLE: [f32; 9] = [0.1, 0.2, 0.4, 0.7, 1.4, 2.7, 5.3, 10.3, 20.0];

/// Maps a perfusion-index class to an approximate numeric value.
///
/// Classes above 8 are out of the documented range and map to 0.0.
pub fn pi_percent(class: u8) -> f32 {
   PI_TABLE.get(class as usize).copied().unwrap_or(0.0)
}

/// Last-known-good SpO2 / pulse-rate / perfusion-index triple.
///
/// The zero value doubles as the definitely-invalid sentinel returned
/// before any valid frame has been decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OxiParams {
   pub spo2: u8,
   pub pulse_rate: u16,
   pub pi: u8,
}

impl OxiParams {
   /// Saturation value the sensor reports when the reading is invalid.
   pub const SPO2_INVALID: u8 = 127;
   /// Pulse-rate value the sensor reports when the reading is invalid.
   pub const PULSE_RATE_INVALID: u16 = 255;
   /// PI class the sensor reports when the reading is invalid.
   pub const PI_INVALID: u8 = 15;

   /// The all-zero, definitely-invalid triple.
   pub const INVALID: Self = Self {
      spo2: 0,
      pulse_rate: 0,
      pi: 0,
   };

   /// True when every field is present and none carries a sentinel.
   pub fn is_valid(&self) -> bool {
      self.spo2 != Self::SPO2_INVALID
         && self.pulse_rate != Self::PULSE_RATE_INVALID
         && self.pi != Self::PI_INVALID
         && self.spo2 != 0
         && self.pulse_rate != 0
         && self.pi != 0
   }

   /// Approximate perfusion percentage for the stored PI class.
   pub fn pi_percent(&self) -> f32 {
      pi_percent(self.pi)
   }
}

/// One decoded frame. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementRecord {
   pub spo2: u8,
   pub pulse_rate: u16,
   /// Perfusion-index class, 0-8 (15 = invalid).
   pub pi: u8,
   /// Plethysmograph waveform amplitude for this frame.
   pub wave: u8,
   /// A pulse beat was detected during this frame.
   pub pulse_detected: bool,
}

impl MeasurementRecord {
   /// The parameter triple carried by this record.
   pub fn params(&self) -> OxiParams {
      OxiParams {
         spo2: self.spo2,
         pulse_rate: self.pulse_rate,
         pi: self.pi,
      }
   }
}

/// Output of feeding one byte that completed a frame.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
   pub record: MeasurementRecord,
   /// The SpO2/pulse-rate/PI triple differs from the previous frame.
   pub params_changed: bool,
}

/// Incremental frame assembler and field extractor.
///
/// Feed bytes in arrival order with [`FrameDecoder::push`]; a value is
/// returned whenever a byte completes a 5-byte frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
   buf: [u8; FRAME_LEN],
   filled: usize,
   params: OxiParams,
   desyncs: u64,
}

impl FrameDecoder {
   pub fn new() -> Self {
      Self::default()
   }

   /// Last accepted parameter triple, unfiltered.
   pub fn params(&self) -> OxiParams {
      self.params
   }

   /// Count of mid-frame marker bytes seen so far.
   pub fn desyncs(&self) -> u64 {
      self.desyncs
   }

   /// Consumes one byte; returns a record when it completed a frame.
   ///
   /// A marker bit inside the frame body aborts the current frame and
   /// starts a new one at that byte. The original decoder left the slot
   /// unwritten instead, silently carrying a stale field into the next
   /// record; re-aligning here loses the same frame without the stale
   /// read.
   pub fn push(&mut self, byte: u8) -> Option<Decoded> {
      if byte & MARKER_BIT != 0 {
         if self.filled != 0 {
            self.desyncs += 1;
         }
         self.buf[0] = byte;
         self.filled = 1;
         return None;
      }

      if self.filled == 0 {
         // Between frames; discard until the next marker.
         return None;
      }

      self.buf[self.filled] = byte;
      self.filled += 1;
      if self.filled < FRAME_LEN {
         return None;
      }
      self.filled = 0;
      Some(self.finish_frame())
   }

   fn finish_frame(&mut self) -> Decoded {
      let record = MeasurementRecord {
         spo2: self.buf[4],
         pulse_rate: u16::from(self.buf[3])
            | (u16::from(self.buf[2] & PULSE_RATE_HIGH_BIT) << 1),
         pi: self.buf[0] & 0x0F,
         wave: self.buf[1],
         pulse_detected: self.buf[0] & PULSE_BIT != 0,
      };

      let params = record.params();
      let params_changed = params != self.params;
      if params_changed {
         self.params = params;
      }
      Decoded {
         record,
         params_changed,
      }
   }
}

/// Shared last-known-good parameter snapshot.
///
/// Written only by the decode pump; readers always observe a whole
/// triple, never a torn one.
pub type ParamsCell = Arc<AtomicCell<OxiParams>>;

/// Spawns the single-consumer decode loop over the raw byte queue.
///
/// Runs until every byte producer hangs up. Parameter-changed events
/// are emitted before the per-frame measurement event, preserving the
/// notification order of the device protocol.
pub fn spawn_decoder(
   mut bytes_rx: mpsc::UnboundedReceiver<Packet>,
   params: ParamsCell,
   events: EventSender,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut decoder = FrameDecoder::new();
      let mut reported_desyncs = 0;
      while let Some(chunk) = bytes_rx.recv().await {
         for &byte in &chunk {
            let Some(decoded) = decoder.push(byte) else {
               continue;
            };
            if decoded.params_changed {
               params.store(decoded.record.params());
               events.emit(LinkEvent::ParamsChanged(decoded.record.params()));
            }
            events.emit(LinkEvent::Measurement(decoded.record));
         }
         if decoder.desyncs() != reported_desyncs {
            reported_desyncs = decoder.desyncs();
            debug!("Frame resync, {reported_desyncs} total");
         }
      }
      debug!("Byte queue closed, decode loop exiting");
   })
}
