//! Bluetooth manager driving scan sessions.
//!
//! This module owns the BlueZ session and adapter, watches for a connected
//! `AirPods` headset and starts a battery scan session for it, stopping the
//! session again when the headset disconnects or the adapter goes away.

use std::{pin::pin, time::Duration};

use bluer::{Adapter, Address, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   airpods,
   bluetooth::{
      bluez,
      scan::{ScanFilter, ScanSession, SessionStatus},
   },
   config::Config,
   error::{ProximityError, Result},
   event::{BatteryPublisher, EventSender},
};

/// Maximum adapter recovery delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(Adapter),
   AdapterLost,

   // User commands
   StartSession(Address, Option<oneshot::Sender<Result<()>>>),
   StopSession(Option<oneshot::Sender<Result<()>>>),
   GetStatus(oneshot::Sender<Option<SessionStatus>>),
}

// === Main Manager ===

/// Handle to the manager actor.
///
/// This type provides the control surface used by the D-Bus service.
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub fn new(event_tx: EventSender, config: Config) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(config, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   pub async fn start_session(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::StartSession(address, Some(tx)))
         .await
         .map_err(|_| ProximityError::ManagerShutdown)?;
      rx.await.map_err(|_| ProximityError::ManagerShutdown)?
   }

   pub async fn stop_session(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::StopSession(Some(tx)))
         .await
         .map_err(|_| ProximityError::ManagerShutdown)?;
      rx.await.map_err(|_| ProximityError::ManagerShutdown)?
   }

   pub async fn status(&self) -> Option<SessionStatus> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetStatus(tx))
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }
}

// === Manager Actor ===

struct ActiveSession {
   session: ScanSession,
   /// Started by the connection watcher, stopped when the headset disconnects.
   automatic: bool,
}

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,

   // State
   bt_session: Option<Session>,
   adapter: Option<Adapter>,
   adapter_name: SmolStr,
   adapter_monitor: Option<JoinHandle<()>>,
   retry: RetryBackoff,
   active: Option<ActiveSession>,
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         bt_session: None,
         adapter: None,
         adapter_name: SmolStr::default(),
         adapter_monitor: None,
         retry: RetryBackoff::default(),
         active: None,
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapter().await;

      let mut connection_check_interval = time::interval(self.config.poll_interval());
      connection_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = connection_check_interval.tick() => {
                 if self.config.auto_start {
                     self.check_headset_connection().await;
                 }
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup();
   }

   async fn initialize_adapter(&mut self) {
      let session = match &self.bt_session {
         Some(session) => session.clone(),
         None => match Session::new().await {
            Ok(session) => {
               self.bt_session = Some(session.clone());
               session
            },
            Err(e) => {
               warn!("Bluetooth is not available, battery scanning disabled: {e}");
               return;
            },
         },
      };

      match session.default_adapter().await {
         Ok(adapter) => self.handle_adapter_available(adapter).await,
         Err(e) => {
            warn!("No Bluetooth adapter found: {e}");
            self.schedule_adapter_recovery();
         },
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(adapter) => {
            self.handle_adapter_available(adapter).await;
         },
         ManagerCommand::AdapterLost => {
            self.handle_adapter_lost();
         },
         ManagerCommand::StartSession(addr, reply) => {
            let result = self.start_session(addr, false).await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::StopSession(reply) => {
            let result = self.stop_session();
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::GetStatus(reply) => {
            let status = self.active.as_ref().map(|a| a.session.status());
            let _ = reply.send(status);
         },
      }
   }

   async fn handle_adapter_available(&mut self, adapter: Adapter) {
      let name = SmolStr::new(adapter.name());
      info!("Adapter available: {name}");

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {name}: {e}");
            self.schedule_adapter_recovery();
            return;
         }
         info!("Powered on adapter: {name}");
      }

      if let Some(handle) = self.adapter_monitor.take() {
         handle.abort();
      }
      self.adapter_monitor = Some(Self::start_adapter_monitor(
         self.loopback_tx.clone(),
         adapter.clone(),
      ));
      self.adapter = Some(adapter);
      self.adapter_name = name;
      self.retry.reset();

      if self.config.auto_start {
         self.check_headset_connection().await;
      }
   }

   fn start_adapter_monitor(loopback: mpsc::Sender<ManagerCommand>, adapter: Adapter) -> JoinHandle<()> {
      tokio::spawn(async move {
         match adapter.events().await {
            Ok(events) => {
               let mut events = pin!(events);
               while events.next().await.is_some() {}
            },
            Err(e) => {
               error!("Failed to get events of adapter {}: {e}", adapter.name());
            },
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(ManagerCommand::AdapterLost).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   fn handle_adapter_lost(&mut self) {
      warn!("Adapter lost: {}", self.adapter_name);

      if let Some(handle) = self.adapter_monitor.take() {
         handle.abort();
      }
      self.adapter = None;

      if let Some(mut active) = self.active.take() {
         active.session.stop();
      }

      self.schedule_adapter_recovery();
   }

   fn schedule_adapter_recovery(&mut self) {
      let Some(session) = self.bt_session.clone() else {
         return;
      };
      let loopback = self.loopback_tx.clone();
      let delay = self.retry.next_delay();
      debug!("Retrying adapter in {delay:?}");

      tokio::spawn(async move {
         time::sleep(delay).await;

         let cmd = match session.default_adapter().await {
            Ok(adapter) => ManagerCommand::AdapterAvailable(adapter),
            Err(e) => {
               warn!("Adapter recovery failed: {e}");
               ManagerCommand::AdapterLost
            },
         };
         let _ = loopback.send(cmd).await;
      });
   }

   async fn is_airpods_device(&self, device: &bluer::Device) -> bool {
      let addr = device.address();
      if self.config.is_known_device(&addr.to_string()).is_some() {
         return true;
      }
      airpods::recognition::is_device_airpods(device).await
   }

   /// Starts a session for a newly connected headset, or stops the automatic
   /// session whose headset disconnected.
   async fn check_headset_connection(&mut self) {
      let Some(adapter) = self.adapter.clone() else {
         return;
      };

      if let Some(active) = &self.active {
         let target = active.session.device();
         if !active.automatic {
            return;
         }
         let connected = match adapter.device(target) {
            Ok(device) => device.is_connected().await.unwrap_or(false),
            Err(_) => false,
         };
         if !connected {
            info!("{target} disconnected, stopping battery scan");
            let _ = self.stop_session();
         }
         return;
      }

      let Ok(addresses) = adapter.device_addresses().await else {
         return;
      };
      for addr in addresses {
         if let Ok(device) = adapter.device(addr)
            && device.is_connected().await.unwrap_or(false)
            && self.is_airpods_device(&device).await
         {
            info!("Found connected AirPods: {addr}");
            if let Err(e) = self.start_session(addr, true).await {
               warn!("Failed to start battery scan for {addr}: {e}");
            }
            return;
         }
      }
   }

   async fn start_session(&mut self, addr: Address, automatic: bool) -> Result<()> {
      if let Some(mut previous) = self.active.take() {
         previous.session.stop();
      }

      let Some(adapter) = self.adapter.clone() else {
         warn!("No Bluetooth adapter, not scanning for {addr}");
         return Err(ProximityError::AdapterNotAvailable);
      };

      let publisher = BatteryPublisher::new(addr, self.event_tx.clone());
      let mut session = ScanSession::start(publisher, &self.config);

      match bluez::register_scan(
         &adapter,
         ScanFilter::proximity_battery(),
         self.config.scan_settings(),
         session.sink(),
      )
      .await
      {
         Ok(registration) => session.attach(registration),
         Err(e) => {
            session.stop();
            return Err(e);
         },
      }

      self.active = Some(ActiveSession { session, automatic });
      Ok(())
   }

   fn stop_session(&mut self) -> Result<()> {
      let mut active = self.active.take().ok_or(ProximityError::NoSession)?;
      active.session.stop();
      Ok(())
   }

   fn cleanup(&mut self) {
      info!("Cleaning up Bluetooth manager");

      if let Some(handle) = self.adapter_monitor.take() {
         handle.abort();
      }
      if let Some(mut active) = self.active.take() {
         active.session.stop();
      }
   }
}

/// Adapter recovery back-off. Every scheduled retry advances it.
#[derive(Debug, Default)]
struct RetryBackoff {
   attempts: u32,
}

impl RetryBackoff {
   fn next_delay(&mut self) -> Duration {
      let delay = calc_retry_delay(self.attempts);
      self.attempts = self.attempts.saturating_add(1);
      delay
   }

   const fn reset(&mut self) {
      self.attempts = 0;
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
