//! Per-page retry decisions and retry statistics.

use crate::error::{Error, Result};
use log::debug;
use std::time::{Duration, Instant};

/// Default number of resends allowed for a single page.
pub const DEFAULT_MAX_RETRIES: u32 = 32;

/// Limits on how long a page may keep failing verification.
///
/// Both limits apply per page. `None` disables a limit; with both disabled
/// a page is resent until it verifies, however long that takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends allowed for one page.
    pub max_retries: Option<u32>,
    /// Time allowed from the first send of a page to its acceptance.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// Retry forever.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            max_elapsed: None,
        }
    }

    /// Set the resend limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the time limit.
    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Whether neither limit is set.
    pub fn is_unbounded(&self) -> bool {
        self.max_retries
            .is_none()
            && self
                .max_elapsed
                .is_none()
    }
}

/// Retry statistics of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RetryStats {
    /// Failed verifies over the whole session.
    pub total_retries: u64,
    /// Highest retry count of any single page.
    pub max_retries_seen: u32,
    /// Page that set `max_retries_seen`, if any page needed a retry.
    pub max_retry_page: Option<u32>,
}

/// Decides whether a page is resent and keeps the tally.
#[derive(Debug)]
pub struct RetryController {
    policy: RetryPolicy,
    stats: RetryStats,
    page: u32,
    page_retries: u32,
    page_started: Instant,
}

impl RetryController {
    /// Create a controller with the given limits.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: RetryStats::default(),
            page: 0,
            page_retries: 0,
            page_started: Instant::now(),
        }
    }

    /// Start tracking a new page.
    pub fn begin_page(&mut self, page: u32) {
        self.page = page;
        self.page_retries = 0;
        self.page_started = Instant::now();
    }

    /// Record a failed verify of the current page.
    ///
    /// Returns `Ok(())` when the page should be resent and
    /// [`Error::LinkUnreliable`] when a limit has been exceeded.
    pub fn record_mismatch(&mut self) -> Result<()> {
        self.page_retries += 1;
        self.stats.total_retries += 1;

        let over_count = self
            .policy
            .max_retries
            .is_some_and(|max| self.page_retries > max);
        let over_time = self
            .policy
            .max_elapsed
            .is_some_and(|max| self.page_started.elapsed() >= max);

        if over_count || over_time {
            debug!(
                "Giving up on page {} after {} retries ({:?})",
                self.page,
                self.page_retries,
                self.page_started.elapsed()
            );
            return Err(Error::LinkUnreliable {
                page: self.page,
                retries: self.page_retries,
            });
        }

        Ok(())
    }

    /// Record that the current page verified; returns its retry count.
    pub fn record_accept(&mut self) -> u32 {
        if self.page_retries > self.stats.max_retries_seen {
            self.stats.max_retries_seen = self.page_retries;
            self.stats.max_retry_page = Some(self.page);
        }
        self.page_retries
    }

    /// Retries of the current page so far.
    pub fn page_retries(&self) -> u32 {
        self.page_retries
    }

    /// Statistics so far.
    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }
}
