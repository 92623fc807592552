//! Freshness-gated refresh scheduler
//!
//! Gates whether a wide fetch is attempted at all. The wide view is slow and
//! rate-limited, so it is only requested when the last success is older than
//! the minimum interval, or when the user forces it. Repeated failures put the
//! scheduler into a degraded state that serves the cached observation, with an
//! occasional retry to find out whether the source has recovered.
//!
//! No retries happen here; one attempt per call.

use chrono::Duration;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::observation::FullAccountObservation;
use crate::source::AccountSource;
use crate::types::Timestamp;

/// Whether a wide fetch is due.
pub fn should_refresh(
    last_success_at: Option<Timestamp>,
    now: Timestamp,
    min_interval: Duration,
    forced: bool,
) -> bool {
    if forced {
        return true;
    }
    match last_success_at {
        None => true,
        // A clock that stepped backwards counts as stale
        Some(last) => {
            let elapsed = now - last;
            elapsed < Duration::zero() || elapsed >= min_interval
        }
    }
}

/// Timing policy for the scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerPolicy {
    pub min_interval: Duration,
    /// Consecutive failures before switching to cache-only
    pub failure_threshold: u32,
    /// How long a degraded scheduler waits before retrying the source
    pub degraded_retry_interval: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::seconds(60),
            failure_threshold: 3,
            degraded_retry_interval: Duration::seconds(600),
        }
    }
}

/// Why the cached observation was used instead of a fresh one
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NotDue,
    Degraded,
    Failed(FetchError),
}

/// Result of one scheduling decision
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(FullAccountObservation),
    Fallback {
        cached: Option<FullAccountObservation>,
        reason: FallbackReason,
    },
    /// A newer forced refresh took over; the result was discarded
    Abandoned { cached: Option<FullAccountObservation> },
}

impl FetchOutcome {
    /// Wide observation to feed into the merge, fresh or cached
    pub fn observation(&self) -> Option<&FullAccountObservation> {
        match self {
            FetchOutcome::Fresh(obs) => Some(obs),
            FetchOutcome::Fallback { cached, .. } | FetchOutcome::Abandoned { cached } => {
                cached.as_ref()
            }
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, FetchOutcome::Fresh(_))
    }

    pub fn failure(&self) -> Option<&FetchError> {
        match self {
            FetchOutcome::Fallback {
                reason: FallbackReason::Failed(err),
                ..
            } => Some(err),
            _ => None,
        }
    }
}

/// Tracks fetch history and the last known-good observation
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    policy: SchedulerPolicy,
    last_success_at: Option<Timestamp>,
    last_failure_at: Option<Timestamp>,
    consecutive_failures: u32,
    last_good: Option<FullAccountObservation>,
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(SchedulerPolicy::default())
    }
}

impl RefreshScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self {
            policy,
            last_success_at: None,
            last_failure_at: None,
            consecutive_failures: 0,
            last_good: None,
        }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    pub fn last_success_at(&self) -> Option<Timestamp> {
        self.last_success_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_good(&self) -> Option<&FullAccountObservation> {
        self.last_good.as_ref()
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.policy.failure_threshold
    }

    /// Decide whether to attempt a fetch now.
    ///
    /// Returns `None` when a fetch should be attempted, otherwise the reason
    /// the cache is served instead.
    pub fn gate(&self, now: Timestamp, forced: bool) -> Option<FallbackReason> {
        if forced {
            return None;
        }
        if self.is_degraded() {
            let retry_due = self
                .last_failure_at
                .map_or(true, |at| now - at >= self.policy.degraded_retry_interval);
            return if retry_due {
                None
            } else {
                Some(FallbackReason::Degraded)
            };
        }
        if should_refresh(self.last_success_at, now, self.policy.min_interval, false) {
            None
        } else {
            Some(FallbackReason::NotDue)
        }
    }

    pub fn record_success(&mut self, observation: FullAccountObservation, now: Timestamp) {
        if self.is_degraded() {
            info!(
                failures = self.consecutive_failures,
                "wide source recovered; leaving cache-only mode"
            );
        }
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.last_good = Some(observation);
    }

    pub fn record_failure(&mut self, error: &FetchError, now: Timestamp) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        if self.consecutive_failures == self.policy.failure_threshold {
            warn!(
                failures = self.consecutive_failures,
                %error,
                "wide source failing; switching to cache-only mode"
            );
        } else {
            warn!(failures = self.consecutive_failures, %error, "wide fetch failed");
        }
    }

    /// One gated fetch attempt.
    ///
    /// `abandon` resolves when a newer forced refresh wants the fetch slot;
    /// the in-flight result is then discarded without counting as a failure.
    pub async fn fetch_or_fallback<F>(
        &mut self,
        source: &dyn AccountSource,
        now: Timestamp,
        forced: bool,
        abandon: F,
    ) -> FetchOutcome
    where
        F: Future<Output = ()>,
    {
        if let Some(reason) = self.gate(now, forced) {
            debug!(?reason, "wide fetch skipped");
            // A not-yet-due fetch adds nothing the last merge did not already see
            let cached = match reason {
                FallbackReason::NotDue => None,
                _ => self.last_good.clone(),
            };
            return FetchOutcome::Fallback { cached, reason };
        }

        // A pass superseded before it got here never starts its fetch
        let result = tokio::select! {
            biased;
            _ = abandon => Err(FetchError::Abandoned),
            result = source.fetch_full_account() => result,
        };

        match result {
            Ok(observation) => {
                debug!(entities = observation.entities.len(), "wide fetch succeeded");
                self.record_success(observation.clone(), now);
                FetchOutcome::Fresh(observation)
            }
            Err(FetchError::Abandoned) => {
                info!("wide fetch abandoned for a forced refresh");
                FetchOutcome::Abandoned {
                    cached: self.last_good.clone(),
                }
            }
            Err(error) => {
                self.record_failure(&error, now);
                FetchOutcome::Fallback {
                    cached: self.last_good.clone(),
                    reason: FallbackReason::Failed(error),
                }
            }
        }
    }
}
