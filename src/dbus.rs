use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::manager::BluetoothManager;

pub const SERVICE_NAME: &str = "org.kairpods.battery";
pub const OBJECT_PATH: &str = "/org/kairpods/battery";

pub struct BatteryService {
   bluetooth_manager: BluetoothManager,
}

impl BatteryService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.kde.plasma.airpods.battery")]
impl BatteryService {
   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let status = match self.bluetooth_manager.status().await {
         Some(status) => status.to_json(),
         None => serde_json::Value::Null,
      };
      Ok(status.to_string())
   }

   async fn start_session(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;

      self
         .bluetooth_manager
         .start_session(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Battery scan requested for {address}");
      Ok(true)
   }

   async fn stop_session(&self) -> zbus::fdo::Result<bool> {
      self
         .bluetooth_manager
         .stop_session()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn session_started(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_stopped(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_indicator_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      command: &str,
      company_id: u16,
      command_type: i32,
      args: Vec<i32>,
      category: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn scanning(&self) -> bool {
      self
         .bluetooth_manager
         .status()
         .await
         .is_some_and(|s| s.scanning)
   }
}
