//! `AirPods` proximity battery service.
//!
//! This service passively scans for the proximity-pairing advertisements of
//! a connected `AirPods` headset, decodes their battery payload and
//! republishes it as a vendor-specific headset battery indicator on D-Bus.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::BluetoothManager;
use dbus::BatteryService;
use event::{BatteryEvent, EventBus};

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;

use crate::{dbus::BatteryServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting AirPods battery service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let event_bus = EventProcessor::new();

   let bluetooth_manager = BluetoothManager::new(event_bus.clone(), config);

   let service = BatteryService::new(bluetooth_manager);

   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("AirPods battery service started at {}", dbus::SERVICE_NAME);

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down AirPods battery service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, BatteryEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Address, BatteryEvent)> {
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

   async fn dispatch(
      &self,
      iface: &InterfaceRef<BatteryService>,
      (device, event): (Address, BatteryEvent),
   ) -> Result<()> {
      let addr_str = device.to_string();
      match event {
         BatteryEvent::SessionStarted => {
            iface.session_started(&addr_str).await?;
         },
         BatteryEvent::SessionStopped => {
            iface.session_stopped(&addr_str).await?;
         },
         BatteryEvent::IndicatorChanged(ev) => {
            iface
               .battery_indicator_changed(
                  &addr_str,
                  ev.command,
                  ev.company_id,
                  ev.command_type,
                  ev.arguments.to_vec(),
                  &ev.category(),
                  &ev.state.to_json().to_string(),
               )
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BatteryService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: Address, event: BatteryEvent) {
      self.queue.push((device, event));
      self.notifier.notify_waiters();
   }
}
