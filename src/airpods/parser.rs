//! Proximity-pairing payload decoding.
//!
//! Decoding is split in two: [`ProximityPayload::parse`] is the validation
//! boundary that rejects blocks too short to read, and [`decode`] is a pure,
//! infallible transformation of an already validated payload.

use thiserror::Error;

use crate::airpods::protocol::{
   DecodedBatteryState, FLAG_REVERSED, Level, MASK_CHARGING_CASE, MASK_CHARGING_LEFT,
   MASK_CHARGING_RIGHT, MASK_USING_LEFT, MASK_USING_RIGHT, MIN_PAYLOAD_LEN, OFFSET_BATTERY,
   OFFSET_CHARGING, OFFSET_FLAGS,
};

/// Error type for payload parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
   /// Payload is too short for the expected format
   #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },
}

/// The three bytes of a proximity block the decoder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProximityPayload {
   pub flags: u8,
   pub battery: u8,
   pub charging: u8,
}

impl ProximityPayload {
   /// Validates a manufacturer block (company id already stripped).
   pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
      if data.len() < MIN_PAYLOAD_LEN {
         return Err(ProtoError::PacketTooShort {
            expected: MIN_PAYLOAD_LEN,
            actual: data.len(),
         });
      }
      Ok(Self {
         flags: data[OFFSET_FLAGS],
         battery: data[OFFSET_BATTERY],
         charging: data[OFFSET_CHARGING],
      })
   }

   pub const fn is_reversed(&self) -> bool {
      self.flags & FLAG_REVERSED != 0
   }
}

/// Decodes the battery, charging and in-use state of a proximity payload.
pub fn decode(payload: &ProximityPayload) -> DecodedBatteryState {
   let ProximityPayload {
      flags,
      battery,
      charging,
   } = *payload;

   let high = battery >> 4;
   let low = battery & 0x0F;
   let charging_high = charging & MASK_CHARGING_LEFT != 0;
   let charging_low = charging & MASK_CHARGING_RIGHT != 0;

   let (left_raw, right_raw, left_charging, right_charging) = if payload.is_reversed() {
      (low, high, charging_low, charging_high)
   } else {
      (high, low, charging_high, charging_low)
   };

   DecodedBatteryState {
      left: Level::from_nibble(left_raw),
      right: Level::from_nibble(right_raw),
      case: Level::from_nibble(charging & 0x0F),
      left_charging,
      right_charging,
      case_charging: charging & MASK_CHARGING_CASE != 0,
      left_in_use: flags & MASK_USING_LEFT != 0,
      right_in_use: flags & MASK_USING_RIGHT != 0,
      display: display_level(left_raw, right_raw),
   }
}

/// Level shown by the headset battery meter.
///
/// Levels 1..=14 are shifted down by one; 0 stays 0.
fn display_level(left: u8, right: u8) -> Level {
   match Level::from_nibble(left.min(right)) {
      Level::Known(0) => Level::Known(0),
      Level::Known(n) => Level::Known(n - 1),
      Level::Unknown => Level::Unknown,
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::{DATA_LENGTH_BATTERY, MANUFACTURER_MAGIC};

   fn block(flags: u8, battery: u8, charging: u8) -> Vec<u8> {
      let mut data = vec![0u8; 2 + DATA_LENGTH_BATTERY as usize];
      data[0] = MANUFACTURER_MAGIC;
      data[1] = DATA_LENGTH_BATTERY;
      data[OFFSET_FLAGS] = flags;
      data[OFFSET_BATTERY] = battery;
      data[OFFSET_CHARGING] = charging;
      data
   }

   fn decode_block(flags: u8, battery: u8, charging: u8) -> DecodedBatteryState {
      let payload = ProximityPayload::parse(&block(flags, battery, charging)).unwrap();
      decode(&payload)
   }

   #[test]
   fn test_short_payload_rejected() {
      assert_eq!(
         ProximityPayload::parse(&[0x07, 0x19, 0, 0, 0, 0, 0]),
         Err(ProtoError::PacketTooShort {
            expected: 8,
            actual: 7
         })
      );
      assert!(ProximityPayload::parse(&[0u8; 8]).is_ok());
   }

   #[test]
   fn test_decode_is_deterministic() {
      let data = block(0x2B, 0x58, 0x64);
      let payload = ProximityPayload::parse(&data).unwrap();
      assert_eq!(decode(&payload), decode(&payload));
   }

   #[test]
   fn test_reversed_bit_swaps_pods() {
      let normal = decode_block(0x00, 0xAB, 0x3D);
      assert_eq!(normal.left, Level::Known(0xA));
      assert_eq!(normal.right, Level::Known(0xB));
      assert!(normal.left_charging);
      assert!(normal.right_charging);

      let normal = decode_block(0x00, 0xAB, 0x2D);
      assert!(normal.left_charging);
      assert!(!normal.right_charging);

      let reversed = decode_block(FLAG_REVERSED, 0xAB, 0x2D);
      assert_eq!(reversed.left, Level::Known(0xB));
      assert_eq!(reversed.right, Level::Known(0xA));
      assert!(!reversed.left_charging);
      assert!(reversed.right_charging);

      // Case fields are unaffected by the reversed bit
      assert_eq!(normal.case, reversed.case);
      assert_eq!(normal.case, Level::Known(0xD));
   }

   #[test]
   fn test_in_use_bits_not_swapped() {
      let state = decode_block(FLAG_REVERSED | MASK_USING_LEFT, 0x55, 0x00);
      assert!(state.left_in_use);
      assert!(!state.right_in_use);

      let state = decode_block(MASK_USING_RIGHT, 0x55, 0x00);
      assert!(!state.left_in_use);
      assert!(state.right_in_use);
   }

   #[test]
   fn test_case_charging_and_level() {
      let state = decode_block(0x00, 0x99, MASK_CHARGING_CASE | 0x0F);
      assert!(state.case_charging);
      assert_eq!(state.case, Level::Unknown);
      assert!(!state.left_charging);
      assert!(!state.right_charging);
   }

   #[test]
   fn test_sentinel_propagation() {
      assert_eq!(decode_block(0x00, 0xFF, 0x00).display, Level::Unknown);
      // One unknown pod falls back to the other reading
      assert_eq!(decode_block(0x00, 0xF6, 0x00).display, Level::Known(5));
      assert_eq!(decode_block(FLAG_REVERSED, 0x6F, 0x00).display, Level::Known(5));
   }

   #[test]
   fn test_display_rebasing() {
      assert_eq!(decode_block(0x00, 0x00, 0x00).display, Level::Known(0));
      assert_eq!(decode_block(0x00, 0x11, 0x00).display, Level::Known(0));
      for k in 1..=14u8 {
         let battery = (k << 4) | 0x0E;
         let state = decode_block(0x00, battery, 0x00);
         assert_eq!(state.display, Level::Known(k - 1), "min level {k}");
      }
   }
}
