//! Error types for the proximity battery service.
//!
//! Everything that can fail inside the daemon funnels into
//! [`ProximityError`]. The advertisement pipeline itself never surfaces
//! these to the radio stack; failures there degrade to "no event".

use thiserror::Error;

/// Main error type for the proximity battery service.
#[derive(Error, Debug)]
pub enum ProximityError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Scan session has been stopped")]
   SessionStopped,

   #[error("No active scan session")]
   NoSession,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `ProximityError`.
pub type Result<T> = std::result::Result<T, ProximityError>;
