//! Recognition of proximity-pairing advertisements and `AirPods` devices.
//!
//! Two independent checks live here: the manufacturer-data match that
//! decides whether an advertisement carries a proximity battery payload, and
//! the service UUID allow-list used as an identity hint for connected
//! headsets.

use uuid::Uuid;

use crate::airpods::protocol::{DATA_LENGTH_BATTERY, MANUFACTURER_MAGIC};

/// Service UUIDs advertised by `AirPods` over classic Bluetooth.
/// The second entry is the first one byte-reversed; both show up in the wild.
static AIRPODS_UUIDS: [Uuid; 2] = [
   Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a),
   Uuid::from_u128(0x2a72e02b_7b99_778f_014d_ad0b7221ec74),
];

/// Checks whether a manufacturer block is a proximity battery payload.
///
/// `data` is the block that follows the 16-bit company identifier:
/// `[0] magic, [1] declared length, [2..] body`.
pub fn matches_proximity_payload(data: &[u8]) -> bool {
   matches!(data, [MANUFACTURER_MAGIC, DATA_LENGTH_BATTERY, ..])
}

/// Checks whether any of the advertised service UUIDs identifies `AirPods`.
pub fn should_be_airpods<'a>(uuids: impl IntoIterator<Item = &'a Uuid>) -> bool {
   uuids.into_iter().any(|u| AIRPODS_UUIDS.contains(u))
}

/// Queries BlueZ for the UUIDs of `dev` and applies [`should_be_airpods`].
pub async fn is_device_airpods(dev: &bluer::Device) -> bool {
   match dev.uuids().await {
      Ok(Some(uuids)) => {
         let found = should_be_airpods(&uuids);
         if found {
            log::debug!("AirPods detected via service UUID on {}", dev.address());
         }
         found
      },
      Ok(None) => false,
      Err(e) => {
         log::debug!("Failed to read UUIDs of {}: {e}", dev.address());
         false
      },
   }
}
