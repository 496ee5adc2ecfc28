//! BlueZ-backed advertisement scanning.
//!
//! Registers an advertisement monitor for the proximity filter (or, when
//! bluetoothd lacks monitor support, runs LE discovery instead), watches the
//! manufacturer data of every matching device and feeds the resulting
//! observations to a scan session in report-delay batches.

use std::{collections::HashMap, mem, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport,
   monitor::{Monitor, MonitorEvent, MonitorHandle, MonitorManager, Pattern, RssiSamplingPeriod, Type},
};
use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use tokio::{
   select,
   sync::mpsc,
   task::{AbortHandle, JoinSet},
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::scan::{
      Batch, Observation, ObservationSink, ScanFilter, ScanMode, ScanRegistration, ScanReport,
      ScanSettings,
   },
   error::Result,
};

/// AD type of manufacturer-specific data.
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;
/// RSSI reported before BlueZ has a reading.
const RSSI_UNKNOWN: i16 = -128;
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Starts scanning on `adapter` and feeds matching observations to `sink`.
///
/// The scan runs until the returned registration is dropped.
pub async fn register_scan(
   adapter: &Adapter,
   filter: ScanFilter,
   settings: ScanSettings,
   sink: ObservationSink,
) -> Result<ScanRegistration> {
   let (obs_tx, obs_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   let mut tasks = JoinSet::new();

   match register_monitor(adapter, &filter, settings.scan_mode).await {
      Ok((manager, handle)) => {
         info!(
            "Registered advertisement monitor on {} ({} mode)",
            adapter.name(),
            settings.scan_mode
         );
         tasks.spawn(run_monitor(adapter.clone(), manager, handle, filter, obs_tx));
      },
      Err(e) => {
         warn!("Advertisement monitor unavailable ({e}), falling back to LE discovery");
         adapter
            .set_discovery_filter(DiscoveryFilter {
               transport: DiscoveryTransport::Le,
               duplicate_data: true,
               ..Default::default()
            })
            .await?;
         let events = adapter.discover_devices_with_changes().await?;
         info!("Started LE discovery on {}", adapter.name());
         tasks.spawn(run_discovery(adapter.clone(), events, filter, obs_tx));
      },
   }

   tasks.spawn(batch_reports(obs_rx, settings.report_delay, sink));
   Ok(ScanRegistration::new(tasks))
}

async fn register_monitor(
   adapter: &Adapter,
   filter: &ScanFilter,
   mode: ScanMode,
) -> bluer::Result<(MonitorManager, MonitorHandle)> {
   let manager = adapter.monitor().await?;
   let rssi_sampling_period = match mode {
      ScanMode::LowPower => RssiSamplingPeriod::First,
      ScanMode::Balanced | ScanMode::LowLatency => RssiSamplingPeriod::All,
   };
   let handle = manager
      .register(Monitor {
         monitor_type: Type::OrPatterns,
         rssi_sampling_period: Some(rssi_sampling_period),
         patterns: Some(vec![Pattern {
            data_type: AD_TYPE_MANUFACTURER_DATA,
            start_position: 0,
            content: filter.pattern_content(),
         }]),
         ..Default::default()
      })
      .await?;
   Ok((manager, handle))
}

/// Per-device property watchers, keyed by address.
struct DeviceWatchers {
   filter: ScanFilter,
   tx: mpsc::Sender<Observation>,
   tasks: JoinSet<()>,
   handles: HashMap<Address, AbortHandle>,
}

impl DeviceWatchers {
   fn new(filter: ScanFilter, tx: mpsc::Sender<Observation>) -> Self {
      Self {
         filter,
         tx,
         tasks: JoinSet::new(),
         handles: HashMap::new(),
      }
   }

   fn watch(&mut self, adapter: &Adapter, address: Address) {
      if self.handles.get(&address).is_some_and(|h| !h.is_finished()) {
         return;
      }
      let device = match adapter.device(address) {
         Ok(device) => device,
         Err(e) => {
            debug!("Cannot watch {address}: {e}");
            return;
         },
      };
      trace!("Watching advertisements of {address}");
      let handle = self
         .tasks
         .spawn(watch_device(device, self.filter.clone(), self.tx.clone()));
      self.handles.insert(address, handle);
   }

   fn forget(&mut self, address: Address) {
      if let Some(handle) = self.handles.remove(&address) {
         trace!("No longer watching {address}");
         handle.abort();
      }
   }

   fn is_closed(&self) -> bool {
      self.tx.is_closed()
   }
}

async fn run_monitor(
   adapter: Adapter,
   _manager: MonitorManager,
   mut handle: MonitorHandle,
   filter: ScanFilter,
   tx: mpsc::Sender<Observation>,
) {
   let mut watchers = DeviceWatchers::new(filter, tx);
   while !watchers.is_closed() {
      select! {
         event = handle.next() => match event {
            Some(MonitorEvent::DeviceFound(id)) => watchers.watch(&adapter, id.device),
            Some(MonitorEvent::DeviceLost(id)) => watchers.forget(id.device),
            Some(_) => {},
            None => break,
         },
         Some(_) = watchers.tasks.join_next() => {},
      }
   }
   debug!("Advertisement monitor on {} finished", adapter.name());
}

async fn run_discovery(
   adapter: Adapter,
   events: impl Stream<Item = AdapterEvent>,
   filter: ScanFilter,
   tx: mpsc::Sender<Observation>,
) {
   let mut events = pin!(events);
   let mut watchers = DeviceWatchers::new(filter, tx);
   while !watchers.is_closed() {
      select! {
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(addr)) => watchers.watch(&adapter, addr),
            Some(AdapterEvent::DeviceRemoved(addr)) => watchers.forget(addr),
            Some(_) => {},
            None => break,
         },
         Some(_) = watchers.tasks.join_next() => {},
      }
   }
   debug!("LE discovery on {} finished", adapter.name());
}

async fn watch_device(device: Device, filter: ScanFilter, tx: mpsc::Sender<Observation>) {
   let address = device.address();
   let present_rssi = device.rssi().await.ok().flatten();
   let mut rssi = present_rssi.unwrap_or(RSSI_UNKNOWN);

   if let Ok(Some(data)) = device.manufacturer_data().await {
      match cached_payload(&filter, present_rssi, &data) {
         Some((rssi, payload)) => {
            if tx
               .send(Observation::now(address, rssi, payload.to_vec()))
               .await
               .is_err()
            {
               return;
            }
         },
         None => trace!("{address}: no live cached advertisement, waiting for next one"),
      }
   }

   let events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         debug!("Failed to subscribe to {address}: {e}");
         return;
      },
   };
   let mut events = pin!(events);

   while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
      match property {
         DeviceProperty::Rssi(value) => rssi = value,
         DeviceProperty::ManufacturerData(data) => {
            if !forward(&filter, address, rssi, &data, &tx).await {
               break;
            }
         },
         _ => {},
      }
   }
}

/// Manufacturer block of `data` that passes `filter`.
fn matching_payload<'a>(filter: &ScanFilter, data: &'a HashMap<u16, Vec<u8>>) -> Option<&'a [u8]> {
   let payload = data.get(&filter.manufacturer_id)?;
   filter
      .matches(filter.manufacturer_id, payload)
      .then_some(payload.as_slice())
}

/// Block BlueZ already holds for a device, usable as an observation.
///
/// BlueZ keeps the data of devices that went out of range; only a device
/// with an RSSI reading is present in the current scan.
fn cached_payload<'a>(
   filter: &ScanFilter,
   rssi: Option<i16>,
   data: &'a HashMap<u16, Vec<u8>>,
) -> Option<(i16, &'a [u8])> {
   let rssi = rssi?;
   matching_payload(filter, data).map(|payload| (rssi, payload))
}

/// Sends the filtered manufacturer block as an observation. Returns `false`
/// once the receiving side is gone.
async fn forward(
   filter: &ScanFilter,
   address: Address,
   rssi: i16,
   data: &HashMap<u16, Vec<u8>>,
   tx: &mpsc::Sender<Observation>,
) -> bool {
   let Some(payload) = matching_payload(filter, data) else {
      trace!("{address}: manufacturer data does not match filter");
      return true;
   };
   tx.send(Observation::now(address, rssi, payload.to_vec()))
      .await
      .is_ok()
}

/// Groups observations into one report per `report_delay` window, keeping
/// arrival order. A zero delay forwards every observation on its own.
async fn batch_reports(
   mut rx: mpsc::Receiver<Observation>,
   report_delay: Duration,
   sink: ObservationSink,
) {
   if report_delay.is_zero() {
      while let Some(obs) = rx.recv().await {
         if sink.deliver(ScanReport::Single(obs)).await.is_err() {
            return;
         }
      }
      return;
   }

   let mut flush = time::interval(report_delay);
   flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
   let mut pending = Batch::new();

   loop {
      select! {
         obs = rx.recv() => {
            let Some(obs) = obs else {
               break;
            };
            pending.push(obs);
         },
         _ = flush.tick() => {
            if !pending.is_empty()
               && sink.deliver(ScanReport::Batch(mem::take(&mut pending))).await.is_err()
            {
               return;
            }
         },
      }
   }

   if !pending.is_empty() {
      let _ = sink.deliver(ScanReport::Batch(pending)).await;
   }
}
