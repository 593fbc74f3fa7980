#![forbid(unsafe_code)]

//! Cancellation wiring and checkpoint commits.
//!
//! One cancellation token is shared by every suspension point in the
//! pipeline. Ctrl-C trips it; each task unwinds at its next await point and
//! the orchestrator commits whatever prefix of the run already reached disk.
//! Checkpoint commits always cover a prefix of the enumeration order, which
//! is what makes interrupted runs resumable.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BackupConfig;
use crate::store::ContentStore;

/// Owns the process-wide cancellation token.
#[derive(Debug, Clone)]
pub struct InterruptController {
    token: CancellationToken,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trips the token on the first Ctrl-C. A second Ctrl-C kills the
    /// process the usual way because the handler is installed only once.
    pub fn install_signal_handler(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!();
                println!("Interrupt received; committing partial progress...");
                info!(event = "interrupt", "cancellation requested");
                token.cancel();
            }
        });
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

/// Commit messages, all in one place so tests can rely on the wording.
pub fn checkpoint_message(source: &str, processed: usize, total: usize) -> String {
    format!("Checkpoint: {source} ({processed}/{total} videos)")
}

pub fn completion_message(source: &str, processed: usize) -> String {
    format!("Backup: {source} ({processed} videos)")
}

pub fn interruption_message(source: &str, processed: usize) -> String {
    format!("Partial backup (interrupted): {source} ({processed} videos)")
}

pub fn export_message() -> String {
    "Regenerate summary tables".to_string()
}

/// Counts processed videos and commits every N, at source completion, and on
/// cancellation.
#[derive(Debug)]
pub struct Checkpointer {
    enabled: bool,
    commit_on_interrupt: bool,
    interval: usize,
    since_last: usize,
}

impl Checkpointer {
    pub fn from_config(backup: &BackupConfig) -> Self {
        Self {
            enabled: backup.checkpoint_enabled,
            commit_on_interrupt: backup.auto_commit_on_interrupt,
            interval: backup.checkpoint_interval.max(1),
            since_last: 0,
        }
    }

    /// Called after each fully processed video. Commits when the interval is
    /// reached; returns whether a commit was made.
    pub fn note_video(
        &mut self,
        store: &ContentStore,
        source: &str,
        processed: usize,
        total: usize,
    ) -> Result<bool> {
        self.since_last += 1;
        if !self.enabled || self.since_last < self.interval {
            return Ok(false);
        }
        let committed = store.commit(&checkpoint_message(source, processed, total))?;
        if committed {
            info!(event = "checkpoint", source, processed, total, "checkpoint commit");
        }
        self.since_last = 0;
        Ok(committed)
    }

    /// Final commit for a source that ran to completion.
    pub fn source_complete(
        &mut self,
        store: &ContentStore,
        source: &str,
        processed: usize,
    ) -> Result<bool> {
        self.since_last = 0;
        store.commit(&completion_message(source, processed))
    }

    /// Commit taken when cancellation interrupted the source mid-run.
    pub fn interrupted(
        &mut self,
        store: &ContentStore,
        source: &str,
        processed: usize,
    ) -> Result<bool> {
        self.since_last = 0;
        if !self.commit_on_interrupt {
            return Ok(false);
        }
        store.commit(&interruption_message(source, processed))
    }
}
