//! Configuration for the sync core.

use crate::retry::RetryConfig;
use crate::task::QueueKind;
use std::time::Duration;

/// Configuration for the sync client and its queue runners.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Worker slots for the foreground (interactive) queue.
    pub foreground_concurrency: usize,
    /// Worker slots for the background (battery-conscious) queue.
    pub background_concurrency: usize,
    /// Drain-loop poll interval for the foreground queue.
    pub foreground_poll_interval: Duration,
    /// Drain-loop poll interval for the background queue.
    pub background_poll_interval: Duration,
    /// Per-operation network timeout for the foreground queue.
    pub foreground_timeout: Duration,
    /// Per-operation network timeout for the background queue.
    pub background_timeout: Duration,
    /// Minimum reschedule delay for background tasks, applied on top of
    /// the retry policy so background retries stay sparse.
    pub background_retry_floor: Duration,
    /// Maximum tasks fetched per drain cycle.
    pub drain_batch_size: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with the default interactive profile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            foreground_concurrency: 3,
            background_concurrency: 1,
            foreground_poll_interval: Duration::from_secs(1),
            background_poll_interval: Duration::from_secs(30),
            foreground_timeout: Duration::from_secs(60),
            background_timeout: Duration::from_secs(20),
            background_retry_floor: Duration::from_secs(30),
            drain_batch_size: 32,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the foreground queue concurrency.
    #[must_use]
    pub fn with_foreground_concurrency(mut self, slots: usize) -> Self {
        self.foreground_concurrency = slots.max(1);
        self
    }

    /// Sets the background queue concurrency.
    #[must_use]
    pub fn with_background_concurrency(mut self, slots: usize) -> Self {
        self.background_concurrency = slots.max(1);
        self
    }

    /// Sets the maximum retry attempts.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Sets the initial retry delay.
    #[must_use]
    pub fn with_initial_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.initial_delay = delay;
        self
    }

    /// Sets the maximum retry delay.
    #[must_use]
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.max_delay = delay;
        self
    }

    /// Sets the maximum network timeout for both queues.
    #[must_use]
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.foreground_timeout = timeout;
        self.background_timeout = timeout;
        self
    }

    /// Sets the poll intervals for both queues.
    #[must_use]
    pub fn with_poll_intervals(mut self, foreground: Duration, background: Duration) -> Self {
        self.foreground_poll_interval = foreground;
        self.background_poll_interval = background;
        self
    }

    /// Sets the retry configuration wholesale.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the drain batch size.
    #[must_use]
    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size.max(1);
        self
    }

    /// Returns the worker slots for a queue.
    #[must_use]
    pub fn concurrency_for(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Foreground => self.foreground_concurrency,
            QueueKind::Background => self.background_concurrency,
        }
    }

    /// Returns the poll interval for a queue.
    #[must_use]
    pub fn poll_interval_for(&self, kind: QueueKind) -> Duration {
        match kind {
            QueueKind::Foreground => self.foreground_poll_interval,
            QueueKind::Background => self.background_poll_interval,
        }
    }

    /// Returns the per-operation timeout for a queue.
    #[must_use]
    pub fn timeout_for(&self, kind: QueueKind) -> Duration {
        match kind {
            QueueKind::Foreground => self.foreground_timeout,
            QueueKind::Background => self.background_timeout,
        }
    }

    /// Returns the minimum reschedule delay for a queue.
    #[must_use]
    pub fn retry_floor_for(&self, kind: QueueKind) -> Duration {
        match kind {
            QueueKind::Foreground => Duration::ZERO,
            QueueKind::Background => self.background_retry_floor,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
