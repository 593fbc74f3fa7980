#![forbid(unsafe_code)]

//! Tracing setup for the command-line surface.
//!
//! Human-readable progress stays on stdout; the structured event stream goes
//! to stderr. `--json` switches the stderr stream to one JSON object per
//! event carrying `timestamp`, `level`, and the fields attached at the call
//! sites (`source`, `video_id`, `error.code`, …) plus the run's `trace_id`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub level: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

/// Installs the global subscriber and returns the run's trace id.
pub fn init(options: &LogOptions) -> Result<String> {
    let directive = if options.quiet {
        "error".to_string()
    } else {
        options.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let filter = EnvFilter::try_new(&directive)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default filter is valid");

    if options.json {
        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    Ok(new_trace_id())
}

static TRACE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-unique id stamped on every event of this run. The wall clock and
/// pid distinguish processes; the sequence counter distinguishes successive
/// ids even on clocks too coarse to tick between calls.
fn new_trace_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    let sequence = TRACE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:016x}{:08x}{:04x}",
        nanos as u64,
        std::process::id(),
        sequence & 0xffff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_carry_distinct_sequence_numbers() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_eq!(a.len(), 28);
        assert_eq!(b.len(), 28);
        // The trailing sequence field alone guarantees distinctness, no
        // matter how coarse the clock is.
        assert_ne!(&a[24..], &b[24..]);
        assert_ne!(a, b);
    }
}
