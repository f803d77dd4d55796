//! Wall-clock abstraction.
//!
//! Every script invocation is timestamped with the client's notion of "now"
//! as decimal seconds. The server is the authority for ordering but records
//! client time as the event timestamp, so tests can freeze time by swapping
//! the clock.

use chrono::Utc;
use std::sync::Arc;

/// A source of the current time in seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// The default clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FrozenClock(pub f64);

impl Clock for FrozenClock {
    fn now(&self) -> f64 {
        self.0
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Format a timestamp the way the script expects it: the shortest decimal
/// representation that round-trips.
pub fn format_seconds(now: f64) -> String {
    format!("{:?}", now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 1_000_000_000.0);
    }

    #[test]
    fn test_frozen_clock() {
        let clock = FrozenClock(1234.5);
        assert_eq!(clock.now(), 1234.5);
        assert_eq!(clock.now(), 1234.5);
    }

    #[test]
    fn test_format_round_trips() {
        assert_eq!(format_seconds(1625072912.125), "1625072912.125");
        assert_eq!(format_seconds(0.0), "0.0");
    }
}
