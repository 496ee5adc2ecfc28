//! Proximity-pairing advertisement definitions and decoded data structures.
//!
//! This module contains the wire constants of the vendor's proximity-pairing
//! manufacturer data, the constants of the headset vendor event it is
//! republished as, and the decoded battery snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Bluetooth SIG company identifier of the vendor (Apple).
pub const MANUFACTURER_ID: u16 = 0x004C;
/// First byte of a proximity-pairing manufacturer block.
pub const MANUFACTURER_MAGIC: u8 = 0x07;
/// Declared length of the proximity-pairing body, after the magic/length header.
pub const DATA_LENGTH_BATTERY: u8 = 25;
/// Magic byte plus length byte.
pub const HEADER_LEN: usize = 2;

// Payload offsets, relative to the manufacturer block (company id stripped)
pub const OFFSET_FLAGS: usize = 5;
pub const OFFSET_BATTERY: usize = 6;
pub const OFFSET_CHARGING: usize = 7;
/// Shortest block the decoder can read.
pub const MIN_PAYLOAD_LEN: usize = OFFSET_CHARGING + 1;

pub const FLAG_REVERSED: u8 = 1 << 7;
pub const MASK_USING_LEFT: u8 = 1 << 3;
pub const MASK_USING_RIGHT: u8 = 1 << 1;

pub const MASK_CHARGING_CASE: u8 = 1 << 6;
pub const MASK_CHARGING_LEFT: u8 = 1 << 5;
pub const MASK_CHARGING_RIGHT: u8 = 1 << 4;

/// Nibble value meaning "no reading".
pub const LEVEL_SENTINEL: u8 = 0x0F;

// Headset vendor event
pub const VENDOR_EVENT_IPHONEACCEV: &str = "+IPHONEACCEV";
pub const INDICATOR_BATTERY_LEVEL: i32 = 1;
pub const AT_CMD_TYPE_SET: i32 = 2;
pub const BATTERY_LEVEL_UNKNOWN: i32 = -1;
pub const COMPANY_ID_CATEGORY: &str = "android.bluetooth.headset.intent.category.companyid";

/// A 4-bit level reading, with the `0xF` sentinel lifted into its own variant.
///
/// `Known` sorts before `Unknown`, so `min` of a known and an unknown level is
/// the known one, mirroring `min` over raw nibbles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
   Known(u8),
   Unknown,
}

impl Level {
   pub const fn from_nibble(nibble: u8) -> Self {
      let nibble = nibble & 0x0F;
      if nibble == LEVEL_SENTINEL {
         Self::Unknown
      } else {
         Self::Known(nibble)
      }
   }

   pub const fn known(self) -> Option<u8> {
      match self {
         Self::Known(n) => Some(n),
         Self::Unknown => None,
      }
   }

   /// Wire value of the indicator argument.
   pub fn to_indicator_value(self) -> i32 {
      match self {
         Self::Known(n) => i32::from(n),
         Self::Unknown => BATTERY_LEVEL_UNKNOWN,
      }
   }
}

impl fmt::Display for Level {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Known(n) => write!(f, "{n}"),
         Self::Unknown => f.write_str("-"),
      }
   }
}

/// Battery snapshot decoded from one proximity advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedBatteryState {
   pub left: Level,
   pub right: Level,
   pub case: Level,
   pub left_charging: bool,
   pub right_charging: bool,
   pub case_charging: bool,
   pub left_in_use: bool,
   pub right_in_use: bool,
   pub display: Level,
}

impl DecodedBatteryState {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": self.left.known(),
          "right_level": self.right.known(),
          "case_level": self.case.known(),
          "left_charging": self.left_charging,
          "right_charging": self.right_charging,
          "case_charging": self.case_charging,
          "left_in_use": self.left_in_use,
          "right_in_use": self.right_in_use,
          "display_level": self.display.to_indicator_value(),
      })
   }
}

impl fmt::Display for DecodedBatteryState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      const fn pod(using: bool, charging: bool) -> &'static str {
         if using {
            "USE"
         } else if charging {
            "CHG"
         } else {
            "---"
         }
      }
      write!(
         f,
         "L: {} ({}) R: {} ({}) CASE: {} ({}) => {}",
         self.left,
         pod(self.left_in_use, self.left_charging),
         self.right,
         pod(self.right_in_use, self.right_charging),
         self.case,
         pod(false, self.case_charging),
         self.display,
      )
   }
}
