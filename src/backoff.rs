use std::time::Duration;

/// Default length of one backoff unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Default cap on the wait, in backoff units.
pub const DEFAULT_MAX_BACKOFF_UNITS: u32 = 16;

/// Capped exponential backoff between retry attempts.
///
/// The wait after attempt `n` (starting at 1) is `unit * min(2^(n-1), max_units)`,
/// which gives `1, 2, 4, 8, 16, 16, ...` units with the defaults.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffPolicy {
    unit: Duration,
    max_units: u32,
}

impl BackoffPolicy {
    /// Creates a policy. A `max_units` of zero is treated as one.
    pub fn new(unit: Duration, max_units: u32) -> Self {
        Self {
            unit,
            max_units: max_units.max(1),
        }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    pub fn max_units(&self) -> u32 {
        self.max_units
    }

    /// Returns how long to wait after the given attempt failed.
    ///
    /// Attempt `0` is treated as the first attempt.
    pub fn next_wait(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let units = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.unit.saturating_mul(units.min(self.max_units))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_UNIT, DEFAULT_MAX_BACKOFF_UNITS)
    }
}
