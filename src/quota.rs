#![forbid(unsafe_code)]

//! Wall-clock quota governor.
//!
//! The data API's daily quota resets at midnight Pacific time, not a fixed
//! interval after exhaustion. The governor computes the next reset instant in
//! `America/Los_Angeles` (DST handled by the timezone table), then waits in
//! intervals, logging progress and observing cancellation. Nothing is
//! persisted: a restarted process recomputes the reset from the current
//! clock.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::Los_Angeles;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BackupConfig;
use crate::error::ArchiveError;

/// Outcome of a governor wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The reset instant passed; the caller may retry.
    Completed,
    /// Cancellation fired mid-wait; the caller must persist partial progress.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct QuotaGovernor {
    enabled: bool,
    max_wait: Duration,
    check_interval: Duration,
}

impl QuotaGovernor {
    pub fn from_config(backup: &BackupConfig) -> Self {
        Self {
            enabled: backup.quota_wait_enabled,
            max_wait: Duration::from_secs(backup.max_wait_hours * 3600),
            check_interval: Duration::from_secs(backup.quota_check_interval_minutes * 60),
        }
    }

    #[cfg(test)]
    pub fn for_tests(check_interval: Duration) -> Self {
        Self {
            enabled: true,
            max_wait: Duration::from_secs(48 * 3600),
            check_interval,
        }
    }

    /// The next daily reset strictly after `now`.
    pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&Los_Angeles);
        let next_day = local
            .date_naive()
            .succ_opt()
            .expect("calendar does not end");
        // US DST transitions move 02:00, never midnight; an ambiguous
        // midnight still resolves to the earliest valid instant.
        let midnight = next_day.and_hms_opt(0, 0, 0).expect("midnight exists");
        match Los_Angeles.from_local_datetime(&midnight) {
            chrono::LocalResult::Single(at) => at.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            chrono::LocalResult::None => Los_Angeles
                .from_local_datetime(&midnight)
                .earliest()
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|| now + chrono::Duration::hours(24)),
        }
    }

    /// Blocks (cooperatively) until the quota resets. Emits one log event at
    /// the start and a progress line per check interval.
    pub async fn wait_for_reset(&self, cancel: &CancellationToken) -> Result<WaitOutcome> {
        if !self.enabled {
            return Err(ArchiveError::QuotaExhausted.into());
        }

        let reset_at = Self::next_reset(Utc::now());
        let total = (reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if total > self.max_wait {
            warn!(
                reset_at = %reset_at.to_rfc3339(),
                "quota reset is beyond the configured maximum wait"
            );
            return Err(ArchiveError::QuotaExhausted.into());
        }

        info!(
            event = "governor_wait",
            reset_at = %reset_at.to_rfc3339(),
            wait_seconds = total.as_secs(),
            "API quota exhausted; waiting for the daily reset"
        );
        println!(
            "Quota exhausted. Waiting until {} ({} min)",
            reset_at.to_rfc3339(),
            total.as_secs() / 60
        );

        loop {
            let remaining = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                info!(event = "governor_resume", "quota reset reached; resuming");
                return Ok(WaitOutcome::Completed);
            }
            let step = remaining.min(self.check_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(event = "governor_cancelled", "cancellation during quota wait");
                    return Ok(WaitOutcome::Cancelled);
                }
                _ = tokio::time::sleep(step) => {
                    let left = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if !left.is_zero() {
                        println!("  Still waiting for quota reset ({} min left)", left.as_secs() / 60);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn reset_is_next_pacific_midnight_in_winter() {
        // PST is UTC-8: midnight local is 08:00 UTC.
        let reset = QuotaGovernor::next_reset(utc("2024-01-15T20:00:00Z"));
        assert_eq!(reset, utc("2024-01-16T08:00:00Z"));
    }

    #[test]
    fn reset_is_next_pacific_midnight_in_summer() {
        // PDT is UTC-7: midnight local is 07:00 UTC.
        let reset = QuotaGovernor::next_reset(utc("2024-07-15T20:00:00Z"));
        assert_eq!(reset, utc("2024-07-16T07:00:00Z"));
    }

    #[test]
    fn reset_crosses_spring_forward_correctly() {
        // 2024-03-10 is the spring-forward date. At 01:30 PST (09:30Z) the
        // next local midnight is Mar 11 00:00 PDT, which is 07:00Z.
        let reset = QuotaGovernor::next_reset(utc("2024-03-10T09:30:00Z"));
        assert_eq!(reset, utc("2024-03-11T07:00:00Z"));
    }

    #[test]
    fn reset_crosses_fall_back_correctly() {
        // 2024-11-03 is the fall-back date. Before the transition (08:30Z is
        // 01:30 PDT) the next local midnight is Nov 4 00:00 PST = 08:00Z.
        let reset = QuotaGovernor::next_reset(utc("2024-11-03T08:30:00Z"));
        assert_eq!(reset, utc("2024-11-04T08:00:00Z"));
    }

    #[test]
    fn reset_is_always_in_the_future() {
        for now in [
            "2024-01-01T00:00:00Z",
            "2024-03-10T09:59:00Z",
            "2024-11-03T08:59:00Z",
            "2025-06-30T23:59:59Z",
        ] {
            let now = utc(now);
            let reset = QuotaGovernor::next_reset(now);
            assert!(reset > now, "reset {reset} not after {now}");
            assert!(reset - now <= chrono::Duration::hours(25));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stays_pending_until_wall_clock_reset() {
        let governor = QuotaGovernor::for_tests(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        // Paused tokio time auto-advances through the sleeps; the loop exits
        // once the wall-clock comparison sees the reset. Wall clock does not
        // advance under paused time, so drive with an already-elapsed reset.
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            governor.wait_for_reset(&cancel),
        )
        .await;
        // The reset is many wall-clock hours away; we only assert the wait is
        // still pending rather than erroring out immediately.
        assert!(outcome.is_err(), "wait should still be in progress");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation() {
        let governor = QuotaGovernor::for_tests(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = governor.wait_for_reset(&cancel).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn disabled_governor_propagates_exhaustion() {
        let governor = QuotaGovernor {
            enabled: false,
            max_wait: Duration::from_secs(1),
            check_interval: Duration::from_secs(1),
        };
        let cancel = CancellationToken::new();
        let err = governor.wait_for_reset(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("quota"));
    }
}
