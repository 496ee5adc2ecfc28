//! Bluetooth side of the service.
//!
//! This module provides the scan session and its BlueZ radio adapter, plus
//! the manager that starts and stops sessions as headsets come and go.

pub mod bluez;
pub mod manager;
pub mod scan;
