use std::time::Duration;

/// Default delay before a failed plan is retried
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before a successful plan is run again
pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before re-running a plan that failed
    pub timeout: Duration,
    /// Delay before re-running a plan that succeeded
    pub resync_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
        }
    }
}

impl ReconcilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    /// Replaces zero durations with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.resync_timeout.is_zero() {
            self.resync_timeout = DEFAULT_RESYNC_TIMEOUT;
        }
        self
    }
}
