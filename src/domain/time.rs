//! A minimal absolute-time type, expressed in whole seconds since the Unix
//! epoch, matching the `datetime` columns the persistence layer requires
//! (spec §6).

use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Absolute UTC time, second resolution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTime(pub u64);

impl UnixTime {
    pub const EPOCH: UnixTime = UnixTime(0);

    /// The real wall clock. Not used by any test: tests drive a
    /// [`crate::scheduler::VirtualClock`] instead.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        UnixTime(secs)
    }

    pub fn saturating_sub(self, rhs: UnixTime) -> Duration {
        Duration::from_secs(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub_duration(self, rhs: Duration) -> Option<UnixTime> {
        self.0.checked_sub(rhs.as_secs()).map(UnixTime)
    }
}

impl Add<Duration> for UnixTime {
    type Output = UnixTime;

    fn add(self, rhs: Duration) -> UnixTime {
        UnixTime(self.0.saturating_add(rhs.as_secs()))
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_sub_roundtrip() {
        let t = UnixTime(1000);
        let t2 = t + Duration::from_secs(500);
        assert_eq!(t2, UnixTime(1500));
        assert_eq!(t2.saturating_sub(t), Duration::from_secs(500));
        assert_eq!(t.saturating_sub(t2), Duration::ZERO);
    }
}
