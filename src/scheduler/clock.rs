use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock time derived from tokio's monotonic clock.
///
/// The wall time is read once and advanced by tokio's `Instant`, so deadlines
/// computed here line up exactly with `sleep_until` and stay deterministic
/// when the runtime's clock is paused.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    /// The tokio instant corresponding to `at`. Past times map to the anchor,
    /// which is already elapsed.
    pub fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.wall).to_std() {
            Ok(offset) => self.mono + offset,
            Err(_) => self.mono,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
