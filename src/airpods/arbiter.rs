//! Selection of the advertisement stream that represents the paired headset.
//!
//! Several cases or buds can be in range at once, each broadcasting its own
//! proximity payload under a rotating address. The arbiter keeps a single
//! tracked candidate and only lets observations from it through: a different
//! address takes over when it is at least as strong, or when the tracked
//! one has been silent for longer than the stale timeout.

use std::fmt;

use bluer::Address;
use serde::Serialize;

/// Default silence window after which a weaker broadcaster may take over, in ms.
pub const STALE_TIMEOUT_MS: u64 = 5000;

/// The broadcaster currently believed to be the headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackedCandidate {
   #[serde(serialize_with = "serialize_address")]
   pub address: Address,
   pub rssi: i16,
   pub last_seen: u64,
}

fn serialize_address<S: serde::Serializer>(addr: &Address, s: S) -> Result<S::Ok, S::Error> {
   s.collect_str(addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbiterState {
   #[default]
   NoCandidate,
   Tracking(TrackedCandidate),
}

/// Outcome of feeding one observation to the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
   /// First observation since start; adopted.
   Adopted,
   /// Observation from the tracked candidate.
   Refreshed,
   /// A different address with an equal or stronger signal took over.
   Replaced { previous: Address },
   /// The tracked candidate went silent; a weaker address took over.
   Failover { previous: Address },
   /// Weaker address while the tracked candidate is still fresh.
   Discarded,
}

impl Verdict {
   /// Whether the observation should be decoded and published.
   pub const fn is_accepted(&self) -> bool {
      !matches!(self, Self::Discarded)
   }
}

impl fmt::Display for Verdict {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Adopted => f.write_str("first result"),
         Self::Refreshed => f.write_str("refreshed"),
         Self::Replaced { previous } => write!(f, "better than {previous}"),
         Self::Failover { previous } => write!(f, "{previous} gone, alternate result"),
         Self::Discarded => f.write_str("discarded"),
      }
   }
}

#[derive(Debug, Clone)]
pub struct Arbiter {
   state: ArbiterState,
   stale_timeout: u64,
}

impl Default for Arbiter {
   fn default() -> Self {
      Self::new(STALE_TIMEOUT_MS)
   }
}

impl Arbiter {
   pub const fn new(stale_timeout: u64) -> Self {
      Self {
         state: ArbiterState::NoCandidate,
         stale_timeout,
      }
   }

   pub const fn candidate(&self) -> Option<TrackedCandidate> {
      match self.state {
         ArbiterState::NoCandidate => None,
         ArbiterState::Tracking(c) => Some(c),
      }
   }

   /// Evaluates one observation against the tracked candidate.
   pub fn observe(&mut self, address: Address, rssi: i16, timestamp: u64) -> Verdict {
      let adopt = TrackedCandidate {
         address,
         rssi,
         last_seen: timestamp,
      };

      let ArbiterState::Tracking(current) = &mut self.state else {
         self.state = ArbiterState::Tracking(adopt);
         return Verdict::Adopted;
      };

      if current.address == address {
         current.last_seen = timestamp;
         return Verdict::Refreshed;
      }

      let previous = current.address;
      let verdict = if rssi >= current.rssi {
         Verdict::Replaced { previous }
      } else if timestamp.saturating_sub(current.last_seen) > self.stale_timeout {
         Verdict::Failover { previous }
      } else {
         return Verdict::Discarded;
      };

      *current = adopt;
      verdict
   }

   /// Drops the tracked candidate.
   pub fn reset(&mut self) {
      self.state = ArbiterState::NoCandidate;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const ADDR_A: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
   const ADDR_B: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);

   fn tracking(address: Address, rssi: i16, last_seen: u64) -> ArbiterState {
      ArbiterState::Tracking(TrackedCandidate {
         address,
         rssi,
         last_seen,
      })
   }

   #[test]
   fn test_first_observation_adopted() {
      let mut arbiter = Arbiter::default();
      assert_eq!(arbiter.state, ArbiterState::NoCandidate);
      assert_eq!(arbiter.observe(ADDR_A, -80, 10), Verdict::Adopted);
      assert_eq!(arbiter.state, tracking(ADDR_A, -80, 10));
   }

   #[test]
   fn test_same_address_refreshes_last_seen_only() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -60, 0);
      assert_eq!(arbiter.observe(ADDR_A, -90, 400), Verdict::Refreshed);
      assert_eq!(arbiter.state, tracking(ADDR_A, -60, 400));
   }

   #[test]
   fn test_stronger_signal_wins_immediately() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -60, 1000);
      assert_eq!(
         arbiter.observe(ADDR_B, -50, 1100),
         Verdict::Replaced { previous: ADDR_A }
      );
      assert_eq!(arbiter.state, tracking(ADDR_B, -50, 1100));
   }

   #[test]
   fn test_equal_signal_wins() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -60, 0);
      assert!(arbiter.observe(ADDR_B, -60, 1).is_accepted());
      assert_eq!(arbiter.candidate().map(|c| c.address), Some(ADDR_B));
   }

   #[test]
   fn test_weak_signal_held_off_until_stale() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -40, 0);

      assert_eq!(arbiter.observe(ADDR_B, -70, 1000), Verdict::Discarded);
      assert_eq!(arbiter.state, tracking(ADDR_A, -40, 0));

      assert_eq!(
         arbiter.observe(ADDR_B, -70, 6000),
         Verdict::Failover { previous: ADDR_A }
      );
      assert_eq!(arbiter.state, tracking(ADDR_B, -70, 6000));
   }

   #[test]
   fn test_stale_window_is_exclusive() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -40, 0);
      assert_eq!(arbiter.observe(ADDR_B, -70, 5000), Verdict::Discarded);
      assert!(arbiter.observe(ADDR_B, -70, 5001).is_accepted());
   }

   #[test]
   fn test_refresh_postpones_failover() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -40, 0);
      arbiter.observe(ADDR_A, -40, 4000);
      assert_eq!(arbiter.observe(ADDR_B, -70, 6000), Verdict::Discarded);
   }

   #[test]
   fn test_out_of_order_timestamp_not_stale() {
      let mut arbiter = Arbiter::default();
      arbiter.observe(ADDR_A, -40, 10_000);
      assert_eq!(arbiter.observe(ADDR_B, -70, 0), Verdict::Discarded);
   }

   #[test]
   fn test_reset_clears_candidate() {
      let mut arbiter = Arbiter::new(100);
      arbiter.observe(ADDR_A, -30, 0);
      arbiter.reset();
      assert_eq!(arbiter.candidate(), None);

      // A much weaker address is adopted right away after a reset
      assert_eq!(arbiter.observe(ADDR_B, -99, 1), Verdict::Adopted);
      assert_eq!(arbiter.state, tracking(ADDR_B, -99, 1));
   }
}
