//! Post-transition cooldown

use chrono::{DateTime, Duration, Utc};

use super::RegimeSnapshot;

/// Suppresses new entries for `duration` after each regime change.
/// Holds no timestamp of its own; it reads `last_change_at` from the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CooldownTimer {
    duration: Duration,
}

impl Default for CooldownTimer {
    fn default() -> Self {
        CooldownTimer {
            duration: Duration::minutes(15),
        }
    }
}

impl CooldownTimer {
    pub fn new(duration: Duration) -> Self {
        CooldownTimer { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// True for `now < last_change_at + duration`
    pub fn is_cooling_down(&self, snapshot: &RegimeSnapshot, now: DateTime<Utc>) -> bool {
        self.remaining(snapshot, now).is_some()
    }

    /// Time left in the current cooldown window, if one is running
    pub fn remaining(&self, snapshot: &RegimeSnapshot, now: DateTime<Utc>) -> Option<Duration> {
        let ends_at = snapshot.last_change_at? + self.duration;
        (now < ends_at).then(|| ends_at - now)
    }
}
