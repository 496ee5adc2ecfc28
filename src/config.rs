//! Configuration management for the battery service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and scan/arbitration parameters.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   airpods::arbiter::STALE_TIMEOUT_MS,
   bluetooth::scan::{REPORT_DELAY_MS, ScanMode, ScanSettings},
   error::{ProximityError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Seconds between checks for connected headsets.
   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   /// Start a session automatically when a headset connects.
   #[serde(default = "default_auto_start")]
   pub auto_start: bool,

   #[serde(default = "default_stale_timeout")]
   pub stale_timeout_ms: u64,

   #[serde(default = "default_report_delay")]
   pub report_delay_ms: u64,

   #[serde(default)]
   pub scan_mode: ScanMode,

   #[serde(default = "default_queue_capacity")]
   pub queue_capacity: usize,
}

/// A headset that should be tracked even if it does not advertise the
/// `AirPods` service UUIDs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: SmolStr,
}

const fn default_poll_interval() -> u64 {
   5
}

const fn default_auto_start() -> bool {
   true
}

const fn default_stale_timeout() -> u64 {
   STALE_TIMEOUT_MS
}

const fn default_report_delay() -> u64 {
   REPORT_DELAY_MS
}

const fn default_queue_capacity() -> usize {
   256
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         poll_interval: default_poll_interval(),
         auto_start: default_auto_start(),
         stale_timeout_ms: default_stale_timeout(),
         report_delay_ms: default_report_delay(),
         scan_mode: ScanMode::default(),
         queue_capacity: default_queue_capacity(),
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
      let config_dir = if let Ok(home) = env::var("AIRPODS_BATTERY_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(ProximityError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("airpods-battery").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }

   pub fn scan_settings(&self) -> ScanSettings {
      ScanSettings {
         scan_mode: self.scan_mode,
         report_delay: Duration::from_millis(self.report_delay_ms),
      }
   }

   pub fn poll_interval(&self) -> Duration {
      Duration::from_secs(self.poll_interval.max(1))
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   #[test]
   fn test_partial_file_uses_defaults() {
      let config: Config = toml::from_str(
         r#"
            scan_mode = "balanced"

            [[known_devices]]
            address = "AA:BB:CC:DD:EE:FF"
            name = "Bench AirPods"
         "#,
      )
      .unwrap();

      assert_eq!(config.scan_mode, ScanMode::Balanced);
      assert_eq!(config.stale_timeout_ms, 5000);
      assert_eq!(config.report_delay_ms, 500);
      assert!(config.auto_start);
      assert_eq!(
         config.is_known_device("aa:bb:cc:dd:ee:ff"),
         Some("Bench AirPods")
      );
      assert_eq!(config.is_known_device("00:00:00:00:00:00"), None);
   }

   #[test]
   fn test_scan_settings_from_config() {
      let config = Config {
         report_delay_ms: 0,
         scan_mode: ScanMode::LowPower,
         ..Config::default()
      };
      let settings = config.scan_settings();
      assert!(settings.report_delay.is_zero());
      assert_eq!(settings.scan_mode, ScanMode::LowPower);
   }

   #[test]
   fn test_load_creates_default_then_reads_back() -> Result<()> {
      let temp_dir = TempDir::new().unwrap();
      unsafe {
         env::set_var("AIRPODS_BATTERY_HOME", temp_dir.path());
      }

      let created = Config::load()?;
      assert_eq!(created, Config::default());
      assert!(
         temp_dir
            .path()
            .join("airpods-battery")
            .join("config.toml")
            .exists()
      );

      let mut edited = created;
      edited.stale_timeout_ms = 8000;
      edited.save()?;
      assert_eq!(Config::load()?.stale_timeout_ms, 8000);

      Ok(())
   }
}
