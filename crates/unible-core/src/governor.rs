//! Scan start rate governor
//!
//! OS scanners hard-fail when scanning is started too often (five starts in
//! thirty seconds on Android). The governor remembers recent start instants
//! and, once the window is full, defers the request until the oldest start
//! leaves the window. Only one deferred retry exists at a time.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Governor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Scan starts allowed inside one window
    pub max_starts: usize,
    /// Length of the sliding window
    pub window: Duration,
    /// Extra delay added to a deferred retry
    pub retry_margin: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_starts: 5,
            window: Duration::from_secs(30),
            retry_margin: Duration::from_secs(2),
        }
    }
}

impl GovernorConfig {
    pub fn with_max_starts(mut self, max_starts: usize) -> Self {
        self.max_starts = max_starts;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_retry_margin(mut self, retry_margin: Duration) -> Self {
        self.retry_margin = retry_margin;
        self
    }
}

// ----------------------------------------------------------------------------
// Scan Rate Governor
// ----------------------------------------------------------------------------

/// Outcome of a scan start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAdmission {
    /// Start the scan now; the start has been recorded
    Admitted,
    /// Window is full; retry the same request after `retry_after`
    Deferred { retry_after: Duration },
    /// Window is full and a retry is already scheduled
    Dropped,
}

#[derive(Debug)]
pub struct ScanRateGovernor {
    config: GovernorConfig,
    starts: VecDeque<Instant>,
    retry_scheduled: bool,
}

impl Default for ScanRateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl ScanRateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            starts: VecDeque::with_capacity(config.max_starts),
            config,
            retry_scheduled: false,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide whether a scan may start at `now`
    pub fn request_start(&mut self, now: Instant) -> ScanAdmission {
        self.evict_expired(now);

        if self.starts.len() < self.config.max_starts {
            self.retry_scheduled = false;
            self.starts.push_back(now);
            debug!("Scan start admitted ({} in window)", self.starts.len());
            return ScanAdmission::Admitted;
        }

        if self.retry_scheduled {
            warn!("Scan start too frequent, retry already scheduled; dropping request");
            return ScanAdmission::Dropped;
        }

        let oldest = self.starts.front().copied().unwrap_or(now);
        let retry_at = oldest + self.config.window + self.config.retry_margin;
        let retry_after = retry_at.saturating_duration_since(now);
        self.retry_scheduled = true;

        warn!(
            "Scan start too frequent, retrying in {} ms",
            retry_after.as_millis()
        );
        ScanAdmission::Deferred { retry_after }
    }

    /// The scheduled retry fired; the caller re-submits through `request_start`
    pub fn retry_fired(&mut self) {
        self.retry_scheduled = false;
    }

    /// Forget any scheduled retry. Returns whether one was pending.
    pub fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.retry_scheduled, false)
    }

    pub fn is_retry_scheduled(&self) -> bool {
        self.retry_scheduled
    }

    pub fn recent_starts(&self) -> usize {
        self.starts.len()
    }

    fn evict_expired(&mut self, now: Instant) {
        let window = self.config.window;
        self.starts
            .retain(|start| now.saturating_duration_since(*start) <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_sixth_start_is_deferred_then_admitted_after_window() {
        let base = Instant::now();
        let mut governor = ScanRateGovernor::default();

        for t in 0..5 {
            assert_eq!(governor.request_start(base + secs(t)), ScanAdmission::Admitted);
        }

        assert_eq!(
            governor.request_start(base + secs(5)),
            ScanAdmission::Deferred {
                retry_after: secs(27)
            }
        );
        assert!(governor.is_retry_scheduled());

        governor.retry_fired();
        assert_eq!(governor.request_start(base + secs(31)), ScanAdmission::Admitted);
        assert_eq!(governor.recent_starts(), 5);
    }

    #[test]
    fn test_second_request_while_deferred_is_dropped() {
        let base = Instant::now();
        let mut governor = ScanRateGovernor::default();
        for t in 0..5 {
            governor.request_start(base + secs(t));
        }

        assert!(matches!(
            governor.request_start(base + secs(6)),
            ScanAdmission::Deferred { .. }
        ));
        assert_eq!(governor.request_start(base + secs(7)), ScanAdmission::Dropped);
    }

    #[test]
    fn test_stop_clears_scheduled_retry() {
        let base = Instant::now();
        let mut governor = ScanRateGovernor::default();
        for t in 0..5 {
            governor.request_start(base + secs(t));
        }
        governor.request_start(base + secs(5));

        assert!(governor.stop());
        assert!(!governor.stop());
        assert!(matches!(
            governor.request_start(base + secs(6)),
            ScanAdmission::Deferred { .. }
        ));
    }

    #[test]
    fn test_start_exactly_at_window_edge_still_counts() {
        let base = Instant::now();
        let mut governor = ScanRateGovernor::new(GovernorConfig::default().with_max_starts(1));
        governor.request_start(base);

        assert!(matches!(
            governor.request_start(base + secs(30)),
            ScanAdmission::Deferred { .. }
        ));
        governor.retry_fired();
        assert_eq!(
            governor.request_start(base + Duration::from_millis(30_001)),
            ScanAdmission::Admitted
        );
    }
}
