//! Rate limiting for status updates.
//!
//! Discord rate-limits message edits, so progress is pushed at most once per
//! interval. Only the *timing* is throttled: the most recent value is always
//! kept, so whatever is emitted next is never stale.

use std::time::Duration;

use tokio::time::Instant;

/// Default minimum time between two status pushes.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ProgressThrottle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    latest: Option<T>,
    pending: bool,
}

impl<T> ProgressThrottle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            latest: None,
            pending: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Records `value` and reports whether it may be pushed now.
    ///
    /// The first value is always allowed. After that a value is allowed once
    /// `interval` has passed since the last allowed one.
    pub fn should_emit(&mut self, now: Instant, value: T) -> bool {
        self.latest = Some(value);

        let allowed = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if allowed {
            self.last_emit = Some(now);
        }
        self.pending = !allowed;

        allowed
    }

    /// Records a terminal value. Always allowed, regardless of timing.
    pub fn finish(&mut self, now: Instant, value: T) -> bool {
        self.latest = Some(value);
        self.last_emit = Some(now);
        self.pending = false;
        true
    }

    /// The last value seen, emitted or not.
    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    /// Whether the latest value was held back and has not been pushed yet.
    pub fn has_pending(&self) -> bool {
        self.pending
    }
}

impl<T> Default for ProgressThrottle<T> {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL)
    }
}
