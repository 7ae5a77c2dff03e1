use std::time::Duration;

use backon::ExponentialBuilder;

/// How to wait for a new app to become ready.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// The delay after the first status check that did not find the app ready.
    pub initial_interval: Duration,
    /// The maximum delay between status checks.
    pub max_interval: Duration,
    /// Give up if the app is not ready after this long.
    pub timeout: Duration,
    /// Give up after this many status checks.
    pub max_attempts: Option<usize>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            max_attempts: None,
        }
    }
}

impl PollPolicy {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        // backon counts retries, not attempts.
        let max_retries = self
            .max_attempts
            .map(|n| n.saturating_sub(1))
            .unwrap_or(usize::MAX);

        ExponentialBuilder::default()
            .with_min_delay(self.initial_interval)
            .with_max_delay(self.max_interval)
            .with_factor(2.0)
            .with_max_times(max_retries)
    }
}
