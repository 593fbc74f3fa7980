#![forbid(unsafe_code)]

//! Classified errors for the archival pipeline.
//!
//! Every fallible operation in the pipeline maps its failure onto one of the
//! variants below so the retry policy can be decided without inspecting error
//! strings. The policy itself is a pure function from classification to
//! action, which keeps it unit-testable without any network.

use std::time::Duration;

/// Everything that can go wrong while archiving, grouped by how the pipeline
/// must react rather than by where the failure happened.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Connection resets, timeouts, DNS hiccups. Worth retrying.
    #[error("network error: {0}")]
    NetworkTransient(String),

    /// The server told us to slow down. Distinct from quota exhaustion.
    #[error("rate limited by remote server")]
    RateLimited { retry_after: Option<Duration> },

    /// The daily API quota is spent; only the governor's wall-clock wait helps.
    #[error("daily API quota exhausted")]
    QuotaExhausted,

    /// Key rejected or missing scopes. Retrying will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote made the video private/removed it. Recorded, never fatal.
    #[error("remote content unavailable: {0}")]
    RemoteUnavailable(String),

    /// The extractor cannot handle this particular video (age gate, new
    /// challenge format, geo block).
    #[error("extractor failed on {0}")]
    ExtractorIncompatible(String),

    /// The content store command failed in a way that may pass on retry.
    #[error("content store (transient): {0}")]
    StoreTransient(String),

    /// The content store is broken (corrupt index, missing backend).
    #[error("content store failure: {0}")]
    StoreFatal(String),

    /// config.toml could not be parsed or is self-contradictory.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Disk full, permission denied, or any other filesystem-level failure.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// An on-disk record or remote payload did not have the expected shape.
    #[error("data error: {0}")]
    Data(String),
}

impl ArchiveError {
    /// Stable machine-readable code emitted in `--json` event streams.
    pub fn code(&self) -> &'static str {
        match self {
            ArchiveError::NetworkTransient(_) => "network_transient",
            ArchiveError::RateLimited { .. } => "rate_limited",
            ArchiveError::QuotaExhausted => "quota_exhausted",
            ArchiveError::Auth(_) => "auth",
            ArchiveError::RemoteUnavailable(_) => "remote_unavailable",
            ArchiveError::ExtractorIncompatible(_) => "extractor_incompatible",
            ArchiveError::StoreTransient(_) => "store_transient",
            ArchiveError::StoreFatal(_) => "store_fatal",
            ArchiveError::ConfigInvalid(_) => "config_invalid",
            ArchiveError::Filesystem(_) => "filesystem",
            ArchiveError::Data(_) => "data",
        }
    }

    /// Process exit code class per the documented command contract
    /// (0=ok, 1=generic, 2=args, 3=network, 4=store, 5=fs, 6=config, 7=data).
    pub fn exit_code(&self) -> i32 {
        match self {
            ArchiveError::NetworkTransient(_)
            | ArchiveError::RateLimited { .. }
            | ArchiveError::QuotaExhausted
            | ArchiveError::Auth(_)
            | ArchiveError::RemoteUnavailable(_)
            | ArchiveError::ExtractorIncompatible(_) => 3,
            ArchiveError::StoreTransient(_) | ArchiveError::StoreFatal(_) => 4,
            ArchiveError::Filesystem(_) => 5,
            ArchiveError::ConfigInvalid(_) => 6,
            ArchiveError::Data(_) => 7,
        }
    }
}

/// How far a failure should propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Video,
    Source,
    Archive,
}

/// Decision produced by the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Try the same operation again after the given pause.
    Retry { after: Duration },
    /// Hand the wait to the quota governor, then retry.
    AwaitQuota,
    /// Record the failure at video granularity and move on.
    Skip,
    /// Stop work at the given scope and record the error in sync-state.
    Abort(Scope),
}

/// Retry tuning. Defaults follow the documented backoff contract: base 2 s,
/// cap 5 min, at most 5 attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential backoff for the given zero-based attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31);
        let raw = self
            .base
            .checked_mul(2_u32.saturating_pow(exp))
            .unwrap_or(self.cap);
        raw.min(self.cap)
    }

    /// Maps an error classification and attempt count onto the action the
    /// caller must take. `attempt` counts completed tries of this operation.
    pub fn decide(&self, error: &ArchiveError, attempt: u32) -> ErrorAction {
        match error {
            ArchiveError::NetworkTransient(_) => {
                if attempt + 1 >= self.max_attempts {
                    ErrorAction::Skip
                } else {
                    ErrorAction::Retry {
                        after: self.backoff(attempt),
                    }
                }
            }
            ArchiveError::RateLimited { retry_after } => {
                if attempt + 1 >= self.max_attempts {
                    ErrorAction::Skip
                } else {
                    // A server-supplied hint always wins over our own backoff.
                    let after = retry_after.unwrap_or_else(|| self.backoff(attempt));
                    ErrorAction::Retry { after }
                }
            }
            ArchiveError::QuotaExhausted => ErrorAction::AwaitQuota,
            ArchiveError::Auth(_) => ErrorAction::Abort(Scope::Source),
            ArchiveError::RemoteUnavailable(_) => ErrorAction::Skip,
            ArchiveError::ExtractorIncompatible(_) => ErrorAction::Skip,
            ArchiveError::StoreTransient(_) => {
                if attempt + 1 >= 3 {
                    ErrorAction::Abort(Scope::Source)
                } else {
                    ErrorAction::Retry {
                        after: self.backoff(attempt),
                    }
                }
            }
            ArchiveError::StoreFatal(_) => ErrorAction::Abort(Scope::Archive),
            ArchiveError::ConfigInvalid(_) => ErrorAction::Abort(Scope::Archive),
            ArchiveError::Filesystem(_) => ErrorAction::Abort(Scope::Archive),
            ArchiveError::Data(_) => ErrorAction::Skip,
        }
    }
}

/// Keeps the most severe exit code seen across a whole invocation so the
/// process can exit with the documented class even after recovering.
#[derive(Debug, Default)]
pub struct SeverityTracker {
    worst: i32,
}

impl SeverityTracker {
    pub fn record(&mut self, error: &ArchiveError) {
        // Higher codes are defined as more specific, not more severe; the
        // contract says the *highest-severity class* wins, which maps to the
        // largest code among those encountered.
        self.worst = self.worst.max(error.exit_code());
    }

    pub fn record_generic(&mut self) {
        self.worst = self.worst.max(1);
    }

    pub fn exit_code(&self) -> i32 {
        self.worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(300));
    }

    #[test]
    fn transient_network_retries_then_skips() {
        let policy = RetryPolicy::default();
        let err = ArchiveError::NetworkTransient("reset".into());
        assert_eq!(
            policy.decide(&err, 0),
            ErrorAction::Retry {
                after: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.decide(&err, 4), ErrorAction::Skip);
    }

    #[test]
    fn rate_limit_honors_server_hint() {
        let policy = RetryPolicy::default();
        let err = ArchiveError::RateLimited {
            retry_after: Some(Duration::from_secs(17)),
        };
        assert_eq!(
            policy.decide(&err, 0),
            ErrorAction::Retry {
                after: Duration::from_secs(17)
            }
        );
    }

    #[test]
    fn quota_goes_to_governor() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&ArchiveError::QuotaExhausted, 0),
            ErrorAction::AwaitQuota
        );
    }

    #[test]
    fn store_transient_aborts_source_after_three() {
        let policy = RetryPolicy::default();
        let err = ArchiveError::StoreTransient("lock".into());
        assert!(matches!(
            policy.decide(&err, 0),
            ErrorAction::Retry { .. }
        ));
        assert_eq!(policy.decide(&err, 2), ErrorAction::Abort(Scope::Source));
    }

    #[test]
    fn fatal_classes_abort_archive() {
        let policy = RetryPolicy::default();
        for err in [
            ArchiveError::StoreFatal("corrupt".into()),
            ArchiveError::ConfigInvalid("bad".into()),
        ] {
            assert_eq!(policy.decide(&err, 0), ErrorAction::Abort(Scope::Archive));
        }
    }

    #[test]
    fn severity_tracker_keeps_worst_class() {
        let mut tracker = SeverityTracker::default();
        tracker.record(&ArchiveError::NetworkTransient("x".into()));
        tracker.record(&ArchiveError::ConfigInvalid("y".into()));
        tracker.record(&ArchiveError::NetworkTransient("z".into()));
        assert_eq!(tracker.exit_code(), 6);
    }
}
