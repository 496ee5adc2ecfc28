//! Scan session: filter definition, observation queue and processing.
//!
//! A [`ScanSession`] is created for one target headset. The radio side gets
//! an [`ObservationSink`] and pushes [`ScanReport`]s into a bounded queue;
//! a single processor task drains it and runs every observation through
//! matcher, arbiter, decoder and publisher while holding the session lock.

use std::{
   sync::{Arc, LazyLock},
   time::{Duration, Instant},
};

use bluer::Address;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;
use tokio::{
   sync::mpsc,
   task::{JoinHandle, JoinSet},
};

use crate::{
   airpods::{
      arbiter::{Arbiter, TrackedCandidate, Verdict},
      parser::{self, ProximityPayload},
      protocol::{
         DATA_LENGTH_BATTERY, DecodedBatteryState, HEADER_LEN, MANUFACTURER_ID,
         MANUFACTURER_MAGIC, MIN_PAYLOAD_LEN,
      },
      recognition,
   },
   config::Config,
   error::{ProximityError, Result},
   event::{BatteryEvent, BatteryPublisher},
};

/// Default batching window of the radio, in ms.
pub const REPORT_DELAY_MS: u64 = 500;

static BASE_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds between process start and `t`.
pub fn monotonic_millis(t: Instant) -> u64 {
   t.saturating_duration_since(*BASE_TIME)
      .as_millis()
      .try_into()
      .unwrap_or(u64::MAX)
}

/// Radio duty cycle requested from the scanner.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanMode {
   LowPower,
   Balanced,
   #[default]
   LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
   pub scan_mode: ScanMode,
   /// Observations are delivered in batches covering this window; zero
   /// delivers them one by one.
   pub report_delay: Duration,
}

impl Default for ScanSettings {
   fn default() -> Self {
      Self {
         scan_mode: ScanMode::LowLatency,
         report_delay: Duration::from_millis(REPORT_DELAY_MS),
      }
   }
}

/// Manufacturer-data filter handed to the radio.
///
/// Matches like a BLE scan filter: the company id must be equal, the data
/// must be at least as long as the filter, and every byte selected by the
/// mask must be equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
   pub manufacturer_id: u16,
   pub data: Vec<u8>,
   pub mask: Vec<u8>,
}

impl ScanFilter {
   /// Exact match over magic and declared length of the proximity block.
   pub fn proximity_battery() -> Self {
      let len = HEADER_LEN + DATA_LENGTH_BATTERY as usize;
      let mut data = vec![0u8; len];
      data[0] = MANUFACTURER_MAGIC;
      data[1] = DATA_LENGTH_BATTERY;

      let mut mask = vec![0u8; len];
      mask[0] = 0xFF;
      mask[1] = 0xFF;

      Self {
         manufacturer_id: MANUFACTURER_ID,
         data,
         mask,
      }
   }

   pub fn matches(&self, company_id: u16, payload: &[u8]) -> bool {
      company_id == self.manufacturer_id
         && payload.len() >= self.data.len()
         && self
            .data
            .iter()
            .zip(&self.mask)
            .zip(payload)
            .all(|((d, m), p)| d & m == p & m)
   }

   /// Content of an AD-type `0xFF` pattern: company id (LE) followed by the
   /// fully masked leading bytes.
   pub fn pattern_content(&self) -> Vec<u8> {
      self
         .manufacturer_id
         .to_le_bytes()
         .into_iter()
         .chain(
            self
               .data
               .iter()
               .zip(&self.mask)
               .take_while(|(_, m)| **m == 0xFF)
               .map(|(d, _)| *d),
         )
         .collect()
   }
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
   pub address: Address,
   pub rssi: i16,
   /// Manufacturer block with the company id removed.
   pub payload: Vec<u8>,
   /// Monotonic milliseconds, see [`monotonic_millis`].
   pub timestamp: u64,
}

impl Observation {
   pub fn now(address: Address, rssi: i16, payload: Vec<u8>) -> Self {
      Self {
         address,
         rssi,
         payload,
         timestamp: monotonic_millis(Instant::now()),
      }
   }
}

pub type Batch = SmallVec<[Observation; 8]>;

/// What the radio delivers: a single result or a batch in arrival order.
#[derive(Debug, Clone)]
pub enum ScanReport {
   Single(Observation),
   Batch(Batch),
}

impl ScanReport {
   fn into_observations(self) -> Batch {
      match self {
         Self::Single(obs) => smallvec::smallvec![obs],
         Self::Batch(batch) => batch,
      }
   }
}

/// Producer half of a session's observation queue.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct ObservationSink {
   tx: mpsc::Sender<ScanReport>,
}

impl ObservationSink {
   /// Creates a bounded queue and its sink.
   pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ScanReport>) {
      let (tx, rx) = mpsc::channel(capacity.max(1));
      (Self { tx }, rx)
   }

   pub async fn deliver(&self, report: ScanReport) -> Result<()> {
      self
         .tx
         .send(report)
         .await
         .map_err(|_| ProximityError::SessionStopped)
   }
}

/// Radio-side tasks feeding a session. Dropping it releases the scan.
#[derive(Debug)]
pub struct ScanRegistration {
   tasks: JoinSet<()>,
}

impl ScanRegistration {
   pub const fn new(tasks: JoinSet<()>) -> Self {
      Self { tasks }
   }
}

impl Drop for ScanRegistration {
   fn drop(&mut self) {
      self.tasks.abort_all();
   }
}

/// Arbitration and publishing state, mutated only under the session lock.
struct SessionCore {
   arbiter: Arbiter,
   publisher: BatteryPublisher,
   stopped: bool,
}

impl SessionCore {
   const fn new(arbiter: Arbiter, publisher: BatteryPublisher) -> Self {
      Self {
         arbiter,
         publisher,
         stopped: false,
      }
   }

   /// Processes one observation unless stopped. Returns `false` once the
   /// session is stopped.
   fn process(&mut self, obs: &Observation) -> bool {
      if self.stopped {
         return false;
      }
      self.handle_observation(obs);
      true
   }

   fn handle_observation(&mut self, obs: &Observation) -> Option<DecodedBatteryState> {
      if !recognition::matches_proximity_payload(&obs.payload) {
         trace!("Ignoring non-proximity payload from {}", obs.address);
         return None;
      }

      let payload = match ProximityPayload::parse(&obs.payload) {
         Ok(payload) => payload,
         Err(e) => {
            debug!("Dropping observation from {}: {e}", obs.address);
            return None;
         },
      };

      let verdict = self.arbiter.observe(obs.address, obs.rssi, obs.timestamp);
      if !verdict.is_accepted() {
         trace!("Discarding {} (rssi={})", obs.address, obs.rssi);
         return None;
      }
      if verdict != Verdict::Refreshed {
         debug!("Tracking {}, rssi={}: {verdict}", obs.address, obs.rssi);
      }

      let state = parser::decode(&payload);
      debug!(
         "{} [{}] {state}",
         obs.address,
         hex::encode(&obs.payload[..MIN_PAYLOAD_LEN])
      );
      self.publisher.publish(state);
      Some(state)
   }

   /// Marks the session stopped and clears arbitration. Returns `true` only
   /// for the call that performed the transition.
   fn stop(&mut self) -> bool {
      if self.stopped {
         return false;
      }
      self.stopped = true;
      self.arbiter.reset();
      true
   }
}

/// Snapshot of a session for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
   pub device: Address,
   pub candidate: Option<TrackedCandidate>,
   pub scanning: bool,
}

impl SessionStatus {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "device": self.device.to_string(),
          "scanning": self.scanning,
          "candidate": self.candidate,
      })
   }
}

/// Scan session for one target headset.
pub struct ScanSession {
   device: Address,
   core: Arc<Mutex<SessionCore>>,
   sink: ObservationSink,
   processor: Option<JoinHandle<()>>,
   registration: Option<ScanRegistration>,
}

impl ScanSession {
   /// Creates the session and spawns its processor. Must be called within a
   /// tokio runtime.
   pub fn start(publisher: BatteryPublisher, config: &Config) -> Self {
      let device = publisher.device();
      let (sink, rx) = ObservationSink::channel(config.queue_capacity);
      let core = Arc::new(Mutex::new(SessionCore::new(
         Arbiter::new(config.stale_timeout_ms),
         publisher,
      )));

      let processor = tokio::spawn(process_reports(core.clone(), rx));
      core.lock().publisher.emit(BatteryEvent::SessionStarted);
      info!("Started scan session for {device}");

      Self {
         device,
         core,
         sink,
         processor: Some(processor),
         registration: None,
      }
   }

   pub const fn device(&self) -> Address {
      self.device
   }

   pub fn sink(&self) -> ObservationSink {
      self.sink.clone()
   }

   /// Takes ownership of the radio registration feeding this session.
   pub fn attach(&mut self, registration: ScanRegistration) {
      if self.is_stopped() {
         warn!("Scan registration attached to stopped session for {}", self.device);
         return;
      }
      self.registration = Some(registration);
   }

   pub fn is_stopped(&self) -> bool {
      self.core.lock().stopped
   }

   pub fn status(&self) -> SessionStatus {
      let core = self.core.lock();
      SessionStatus {
         device: self.device,
         candidate: core.arbiter.candidate(),
         scanning: !core.stopped && self.registration.is_some(),
      }
   }

   /// Releases the scan, stops processing and clears the tracked candidate.
   ///
   /// Idempotent; once it returns no further observation is processed.
   pub fn stop(&mut self) -> bool {
      drop(self.registration.take());

      let mut core = self.core.lock();
      if !core.stop() {
         return false;
      }
      if let Some(processor) = self.processor.take() {
         processor.abort();
      }
      core.publisher.emit(BatteryEvent::SessionStopped);
      drop(core);

      info!("Stopped scan session for {}", self.device);
      true
   }
}

impl Drop for ScanSession {
   fn drop(&mut self) {
      self.stop();
   }
}

/// Runs a report through the session in order, taking the lock once per
/// observation. Returns `false` once the session is stopped.
fn handle_report(core: &Mutex<SessionCore>, report: ScanReport) -> bool {
   report
      .into_observations()
      .iter()
      .all(|obs| core.lock().process(obs))
}

async fn process_reports(core: Arc<Mutex<SessionCore>>, mut rx: mpsc::Receiver<ScanReport>) {
   while let Some(report) = rx.recv().await {
      if !handle_report(&core, report) {
         break;
      }
   }
   debug!("Observation processor exiting");
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;
   use crate::{
      airpods::protocol::{FLAG_REVERSED, Level, OFFSET_BATTERY, OFFSET_CHARGING, OFFSET_FLAGS},
      event::{EventBus, tests::RecordingBus},
   };

   const DEVICE: Address = Address([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
   const ADDR_A: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
   const ADDR_B: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);

   fn payload(flags: u8, battery: u8, charging: u8) -> Vec<u8> {
      let mut data = ScanFilter::proximity_battery().data;
      data[OFFSET_FLAGS] = flags;
      data[OFFSET_BATTERY] = battery;
      data[OFFSET_CHARGING] = charging;
      data
   }

   fn obs(address: Address, rssi: i16, timestamp: u64, battery: u8) -> Observation {
      Observation {
         address,
         rssi,
         payload: payload(0x00, battery, 0x00),
         timestamp,
      }
   }

   fn core(bus: &Arc<RecordingBus>) -> SessionCore {
      SessionCore::new(
         Arbiter::default(),
         BatteryPublisher::new(DEVICE, bus.clone()),
      )
   }

   #[test]
   fn test_filter_definition() {
      let filter = ScanFilter::proximity_battery();
      assert_eq!(filter.manufacturer_id, 0x004C);
      assert_eq!(filter.data.len(), 27);
      assert_eq!(&filter.data[..2], &[0x07, 25]);
      assert_eq!(&filter.mask[..2], &[0xFF, 0xFF]);
      assert!(filter.mask[2..].iter().all(|&m| m == 0));
      assert_eq!(filter.pattern_content(), vec![0x4C, 0x00, 0x07, 0x19]);
   }

   #[test]
   fn test_filter_matches() {
      let filter = ScanFilter::proximity_battery();
      let data = payload(0x12, 0x34, 0x56);
      assert!(filter.matches(0x004C, &data));
      assert!(!filter.matches(0x0075, &data));
      assert!(!filter.matches(0x004C, &data[..26]));

      let mut other = data.clone();
      other[0] = 0x10;
      assert!(!filter.matches(0x004C, &other));
   }

   #[test]
   fn test_pipeline_publishes_decoded_level() {
      let bus = Arc::new(RecordingBus::default());
      let mut core = core(&bus);

      let state = core
         .handle_observation(&Observation {
            address: ADDR_A,
            rssi: -50,
            payload: payload(FLAG_REVERSED, 0x8A, 0x20),
            timestamp: 0,
         })
         .expect("accepted");
      assert_eq!(state.left, Level::Known(0xA));
      assert_eq!(state.right, Level::Known(0x8));
      assert!(state.right_charging);

      let indicators = bus.indicators();
      assert_eq!(indicators.len(), 1);
      assert_eq!(indicators[0].arguments, [1, 1, 7]);
      assert_eq!(indicators[0].device, DEVICE);
   }

   #[test]
   fn test_non_matching_and_short_payloads_dropped() {
      let bus = Arc::new(RecordingBus::default());
      let mut core = core(&bus);

      let mut foreign = obs(ADDR_A, -40, 0, 0x55);
      foreign.payload[1] = 0x0F;
      assert!(core.handle_observation(&foreign).is_none());

      let short = Observation {
         address: ADDR_A,
         rssi: -40,
         payload: vec![0x07, 25, 0, 0, 0],
         timestamp: 0,
      };
      assert!(core.handle_observation(&short).is_none());

      // Neither reached the arbiter
      assert_eq!(core.arbiter.candidate(), None);
      assert!(bus.events.lock().is_empty());
   }

   #[test]
   fn test_batch_processed_in_order() {
      let bus = Arc::new(RecordingBus::default());
      let core = Mutex::new(core(&bus));

      // B is weaker and arrives within the stale window, so only A publishes
      let batch: Batch = smallvec::smallvec![
         obs(ADDR_A, -40, 0, 0x33),
         obs(ADDR_B, -70, 1000, 0x99),
         obs(ADDR_A, -40, 1500, 0x22),
         obs(ADDR_B, -70, 7000, 0x99),
      ];
      assert!(handle_report(&core, ScanReport::Batch(batch)));

      let values: Vec<_> = bus.indicators().iter().map(|e| e.indicator_value()).collect();
      assert_eq!(values, vec![2, 1, 8]);
      assert_eq!(core.lock().arbiter.candidate().map(|c| c.address), Some(ADDR_B));
   }

   #[test]
   fn test_stop_clears_state_once() {
      let bus = Arc::new(RecordingBus::default());
      let core = Mutex::new(core(&bus));
      assert!(handle_report(&core, ScanReport::Single(obs(ADDR_A, -30, 0, 0x55))));

      assert!(core.lock().stop());
      assert!(!core.lock().stop());
      assert_eq!(core.lock().arbiter.candidate(), None);
      assert!(!handle_report(&core, ScanReport::Single(obs(ADDR_B, -90, 1, 0x55))));
      assert_eq!(bus.indicators().len(), 1);
   }

   /// Bus forwarding indicator values to a channel the test can await.
   struct ChannelBus(mpsc::UnboundedSender<i32>);

   impl EventBus for ChannelBus {
      fn emit(&self, _device: Address, event: BatteryEvent) {
         if let BatteryEvent::IndicatorChanged(ev) = event {
            let _ = self.0.send(ev.indicator_value());
         }
      }
   }

   async fn next_value(rx: &mut mpsc::UnboundedReceiver<i32>) -> Option<i32> {
      time::timeout(Duration::from_secs(2), rx.recv())
         .await
         .ok()
         .flatten()
   }

   #[tokio::test]
   async fn test_session_stop_then_fresh_observation_adopted() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let bus = Arc::new(ChannelBus(tx));
      let config = Config::default();

      let mut session = ScanSession::start(BatteryPublisher::new(DEVICE, bus.clone()), &config);
      session
         .sink()
         .deliver(ScanReport::Single(obs(ADDR_A, -30, 0, 0x66)))
         .await
         .unwrap();
      assert_eq!(next_value(&mut rx).await, Some(5));
      assert_eq!(
         session.status().candidate.map(|c| c.address),
         Some(ADDR_A)
      );

      let old_sink = session.sink();
      assert!(session.stop());
      assert!(!session.stop());
      assert!(session.is_stopped());
      assert_eq!(session.status().candidate, None);

      // Observations queued after stop never reach the publisher
      let _ = old_sink
         .deliver(ScanReport::Single(obs(ADDR_A, -30, 10, 0x66)))
         .await;

      // A new session adopts a much weaker address at once
      let mut session = ScanSession::start(BatteryPublisher::new(DEVICE, bus), &config);
      session
         .sink()
         .deliver(ScanReport::Single(obs(ADDR_B, -95, 20, 0x44)))
         .await
         .unwrap();
      assert_eq!(next_value(&mut rx).await, Some(3));
      assert_eq!(
         session.status().candidate.map(|c| c.address),
         Some(ADDR_B)
      );
      session.stop();
   }

   #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
   async fn test_stop_during_batch_processing() {
      let bus = Arc::new(RecordingBus::default());
      let config = Config::default();
      let mut session = ScanSession::start(BatteryPublisher::new(DEVICE, bus.clone()), &config);

      let batch: Batch = (0..5000u64).map(|t| obs(ADDR_A, -40, t, 0x55)).collect();
      session
         .sink()
         .deliver(ScanReport::Batch(batch))
         .await
         .unwrap();

      // Wait for the processor to be inside the batch
      time::timeout(Duration::from_secs(2), async {
         while bus.indicators().is_empty() {
            tokio::task::yield_now().await;
         }
      })
      .await
      .unwrap();

      assert!(session.stop());
      let at_stop = bus.events.lock().len();
      assert_eq!(session.status().candidate, None);

      time::sleep(Duration::from_millis(100)).await;
      let events = bus.events.lock();
      assert_eq!(events.len(), at_stop);

      let stopped = events
         .iter()
         .position(|(_, e)| matches!(e, BatteryEvent::SessionStopped))
         .expect("stop event");
      assert_eq!(stopped, events.len() - 1);
      assert!(
         !events[stopped..]
            .iter()
            .any(|(_, e)| matches!(e, BatteryEvent::IndicatorChanged(_)))
      );
   }
}
