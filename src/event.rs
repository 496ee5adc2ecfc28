//! Outbound events of the battery service.
//!
//! Every decoded advertisement turns into exactly one
//! [`HeadsetBatteryEvent`], the vendor-specific headset indicator event that
//! headset battery UIs understand. Session lifecycle changes are reported
//! alongside it.

use std::sync::Arc;

use bluer::Address;
use log::debug;

use crate::airpods::protocol::{
   AT_CMD_TYPE_SET, COMPANY_ID_CATEGORY, DecodedBatteryState, INDICATOR_BATTERY_LEVEL,
   MANUFACTURER_ID, VENDOR_EVENT_IPHONEACCEV,
};

/// Vendor-specific headset event carrying one battery indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadsetBatteryEvent {
   pub device: Address,
   pub command: &'static str,
   pub company_id: u16,
   pub command_type: i32,
   /// `[indicator count, indicator type, indicator value]`
   pub arguments: [i32; 3],
   pub state: DecodedBatteryState,
}

impl HeadsetBatteryEvent {
   pub fn new(device: Address, state: DecodedBatteryState) -> Self {
      Self {
         device,
         command: VENDOR_EVENT_IPHONEACCEV,
         company_id: MANUFACTURER_ID,
         command_type: AT_CMD_TYPE_SET,
         arguments: [
            1,
            INDICATOR_BATTERY_LEVEL,
            state.display.to_indicator_value(),
         ],
         state,
      }
   }

   pub const fn indicator_value(&self) -> i32 {
      self.arguments[2]
   }

   /// Category the event is scoped to, e.g. `...companyid.76`.
   pub fn category(&self) -> String {
      format!("{COMPANY_ID_CATEGORY}.{}", self.company_id)
   }
}

/// Events that can be emitted by the battery service.
#[derive(Debug, Clone)]
pub enum BatteryEvent {
   SessionStarted,
   SessionStopped,
   IndicatorChanged(HeadsetBatteryEvent),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event about `device` to all registered listeners.
   fn emit(&self, device: Address, event: BatteryEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Turns decoded snapshots of one device into indicator events.
#[derive(Clone)]
pub struct BatteryPublisher {
   device: Address,
   event_tx: EventSender,
}

impl BatteryPublisher {
   pub fn new(device: Address, event_tx: EventSender) -> Self {
      Self { device, event_tx }
   }

   pub const fn device(&self) -> Address {
      self.device
   }

   pub fn publish(&self, state: DecodedBatteryState) {
      let event = HeadsetBatteryEvent::new(self.device, state);
      debug!(
         "Publishing {} indicator {} for {}",
         event.command,
         event.indicator_value(),
         self.device
      );
      self
         .event_tx
         .emit(self.device, BatteryEvent::IndicatorChanged(event));
   }

   pub fn emit(&self, event: BatteryEvent) {
      self.event_tx.emit(self.device, event);
   }
}
