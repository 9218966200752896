//! Configuration for the oximeter link engine.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and scan/reconnect parameters.

use std::{env, fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OxiLinkError, Result};

/// Main configuration structure for the engine.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Scan window in seconds before discovery stops on its own.
   #[serde(default = "default_scan_window_secs")]
   pub scan_window_secs: u64,

   /// Polling period for the serial read loop and unplug watchdog.
   #[serde(default = "default_serial_poll_ms")]
   pub serial_poll_ms: u64,

   /// Return to the Listening state automatically after a connection
   /// fails or is lost.
   #[serde(default = "default_auto_relisten")]
   pub auto_relisten: bool,
}

/// A remembered oximeter device.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_scan_window_secs() -> u64 {
   8
}

const fn default_serial_poll_ms() -> u64 {
   100
}

const fn default_auto_relisten() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         scan_window_secs: default_scan_window_secs(),
         serial_poll_ms: default_serial_poll_ms(),
         auto_relisten: default_auto_relisten(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(oxilink_home) = env::var("OXILINK_HOME") {
         PathBuf::from(oxilink_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(OxiLinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("oxilink").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address == address)
         .map(|d| d.name.as_str())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn defaults_match_the_wire_protocol_expectations() {
      let config = Config::default();
      assert_eq!(config.scan_window_secs, 8);
      assert_eq!(config.serial_poll_ms, 100);
      assert!(config.auto_relisten);
      assert!(config.known_devices.is_empty());
   }

   #[test]
   fn round_trips_through_toml() {
      let mut config = Config::default();
      config.known_devices.push(KnownDevice {
         address: "00:A0:50:01:02:03".into(),
         name: "BerryMed".into(),
      });

      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.known_devices.len(), 1);
      assert_eq!(back.is_known_device("00:A0:50:01:02:03"), Some("BerryMed"));
      assert_eq!(back.is_known_device("11:22:33:44:55:66"), None);
   }

   #[test]
   fn load_respects_oxilink_home() {
      let dir = tempfile::tempdir().unwrap();
      // Serialized env access; this test owns the variable.
      unsafe { env::set_var("OXILINK_HOME", dir.path()) };

      let config = Config::load().unwrap();
      assert!(config.auto_relisten);
      assert!(dir.path().join("oxilink").join("config.toml").exists());

      unsafe { env::remove_var("OXILINK_HOME") };
   }
}
