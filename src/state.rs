#![forbid(unsafe_code)]

//! Durable sync-state: the only mutable state the pipeline keeps outside the
//! content files themselves.
//!
//! One JSON document per archive, keyed first by source URL and then by video
//! id. Every update is persisted with a write-then-rename so a crash at any
//! point leaves either the old or the new snapshot, never a torn file.
//! Unknown fields are captured and written back untouched, so newer versions
//! of the tool can extend the document without older ones destroying it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Availability, DownloadStatus};

pub const STATE_DIR: &str = ".sync";
pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = "lock";

/// Exclusive per-archive lock. Parallel pipelines against the same archive
/// directory are disallowed; distinct directories may run in parallel
/// processes. Released on drop.
#[derive(Debug)]
pub struct ArchiveLock {
    path: PathBuf,
}

impl ArchiveLock {
    pub fn acquire(archive_root: &Path) -> Result<Self> {
        let dir = archive_root.join(STATE_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(LOCK_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => anyhow::bail!(
                "archive is in use by another process (remove {} if that process is gone)",
                path.display()
            ),
            Err(err) => {
                Err(err).with_context(|| format!("creating lock {}", path.display()))
            }
        }
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Lifecycle of a source within the archive. There is no terminal state; the
/// archive never forgets a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Error,
    Paused,
}

impl Default for SourceStatus {
    fn default() -> Self {
        SourceStatus::Active
    }
}

/// Per-source record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_video_id: Option<String>,
    /// Monotonic until a successful pass resets it.
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: SourceStatus,
    #[serde(default)]
    pub videos_tracked: u64,
    #[serde(default)]
    pub videos_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SourceState {
    pub fn record_failure(&mut self, error: &str, next_retry: Option<DateTime<Utc>>) {
        self.consecutive_errors += 1;
        self.status = SourceStatus::Error;
        self.last_error = Some(error.to_string());
        self.next_retry = next_retry;
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_errors = 0;
        self.status = SourceStatus::Active;
        self.last_error = None;
        self.next_retry = None;
        self.last_sync = Some(at);
    }
}

/// Timestamps of the last successful fetch of each component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentStamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captions: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<DateTime<Utc>>,
}

/// Per-video ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoState {
    pub availability: Availability,
    /// Directory recorded at the last materialization, relative to the
    /// archive root. Rename detection compares against this.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// URL of the source that first produced this video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_source: Option<String>,
    /// Other sources that also list this id. Lives here, not in the video
    /// metadata file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub back_references: Vec<String>,
    #[serde(default)]
    pub components: ComponentStamps,
    /// Caption languages fetched so far; delta detection fetches only the
    /// newly gained ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captions_fetched: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default = "default_download_status")]
    pub download_status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_download_status() -> DownloadStatus {
    DownloadStatus::NotTracked
}

impl Default for VideoState {
    fn default() -> Self {
        Self {
            availability: Availability::Public,
            path: String::new(),
            first_source: None,
            back_references: Vec::new(),
            components: ComponentStamps::default(),
            captions_fetched: Vec::new(),
            view_count: None,
            like_count: None,
            comment_count: None,
            updated_at: None,
            update_count: 0,
            download_status: DownloadStatus::NotTracked,
            last_error: None,
            extra: BTreeMap::new(),
        }
    }
}

impl VideoState {
    /// Registers `source_url` against this video, keeping the first source as
    /// owner and later ones as back-references.
    pub fn note_source(&mut self, source_url: &str) {
        match &self.first_source {
            None => self.first_source = Some(source_url.to_string()),
            Some(first) if first == source_url => {}
            Some(_) => {
                if !self.back_references.iter().any(|r| r == source_url) {
                    self.back_references.push(source_url.to_string());
                }
            }
        }
    }
}

/// The whole durable document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceState>,
    #[serde(default)]
    pub videos: BTreeMap<String, VideoState>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Single-writer handle over the on-disk document. Every `update_*` persists
/// before returning, so an in-process read and a crash-restart read always
/// agree.
#[derive(Debug)]
pub struct SyncStateStore {
    path: PathBuf,
    state: SyncState,
}

impl SyncStateStore {
    /// Opens `<archive>/.sync/state.json`, creating an empty document when the
    /// archive has never synced.
    pub fn open(archive_root: &Path) -> Result<Self> {
        let path = archive_root.join(STATE_DIR).join(STATE_FILE);
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            SyncState::default()
        };
        Ok(Self { path, state })
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Writes the document atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut payload =
            serde_json::to_vec_pretty(&self.state).context("serializing sync-state")?;
        payload.push(b'\n');
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("finalizing {}", self.path.display()))?;
        Ok(())
    }

    /// Applies `apply` to the source record (created on first touch) and
    /// persists the document.
    pub fn update_source(
        &mut self,
        url: &str,
        apply: impl FnOnce(&mut SourceState),
    ) -> Result<()> {
        let entry = self.state.sources.entry(url.to_string()).or_default();
        apply(entry);
        self.save()
    }

    /// Applies `apply` to the video ledger entry (created on first touch) and
    /// persists the document.
    pub fn update_video(
        &mut self,
        video_id: &str,
        apply: impl FnOnce(&mut VideoState),
    ) -> Result<()> {
        let entry = self.state.videos.entry(video_id.to_string()).or_default();
        apply(entry);
        self.save()
    }

    pub fn source(&self, url: &str) -> Option<&SourceState> {
        self.state.sources.get(url)
    }

    pub fn video(&self, video_id: &str) -> Option<&VideoState> {
        self.state.videos.get(video_id)
    }

    pub fn last_sync(&self, url: &str) -> Option<DateTime<Utc>> {
        self.state.sources.get(url).and_then(|s| s.last_sync)
    }

    pub fn set_last_sync(&mut self, url: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_source(url, |source| source.last_sync = Some(at))
    }

    /// Video ids whose availability is terminal. These generate zero detail
    /// fetches on incremental runs.
    pub fn known_unavailable_set(&self) -> BTreeSet<String> {
        self.state
            .videos
            .iter()
            .filter(|(_, video)| video.availability.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_without_file_yields_empty_state() {
        let dir = tempdir().unwrap();
        let store = SyncStateStore::open(dir.path()).unwrap();
        assert!(store.state().sources.is_empty());
        assert!(store.state().videos.is_empty());
    }

    #[test]
    fn update_persists_immediately() {
        let dir = tempdir().unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("abc", |video| {
                video.availability = Availability::Private;
                video.path = "videos/x".into();
            })
            .unwrap();

        // A fresh open (simulating a crash) sees the same durable view.
        let reopened = SyncStateStore::open(dir.path()).unwrap();
        let video = reopened.video("abc").expect("video recorded");
        assert_eq!(video.availability, Availability::Private);
        assert_eq!(video.path, "videos/x");
        assert!(!dir
            .path()
            .join(STATE_DIR)
            .join("state.tmp")
            .exists());
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join(STATE_DIR);
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(
            state_dir.join(STATE_FILE),
            r#"{"sources":{},"videos":{},"future_field":{"keep":"me"}}"#,
        )
        .unwrap();

        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store.update_source("https://example", |_| {}).unwrap();

        let raw = fs::read_to_string(state_dir.join(STATE_FILE)).unwrap();
        assert!(raw.contains("future_field"));
        assert!(raw.contains("\"keep\": \"me\"") || raw.contains("\"keep\":\"me\""));
    }

    #[test]
    fn unavailable_set_collects_terminal_states() {
        let dir = tempdir().unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("pub", |v| v.availability = Availability::Public)
            .unwrap();
        store
            .update_video("priv", |v| v.availability = Availability::Private)
            .unwrap();
        store
            .update_video("gone", |v| v.availability = Availability::Removed)
            .unwrap();

        let set = store.known_unavailable_set();
        assert!(set.contains("priv"));
        assert!(set.contains("gone"));
        assert!(!set.contains("pub"));
    }

    #[test]
    fn error_counter_monotonic_until_success() {
        let mut source = SourceState::default();
        source.record_failure("boom", None);
        source.record_failure("boom again", None);
        assert_eq!(source.consecutive_errors, 2);
        assert_eq!(source.status, SourceStatus::Error);

        source.record_success(Utc::now());
        assert_eq!(source.consecutive_errors, 0);
        assert_eq!(source.status, SourceStatus::Active);
        assert!(source.last_error.is_none());
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let lock = ArchiveLock::acquire(dir.path()).unwrap();
        let err = ArchiveLock::acquire(dir.path()).unwrap_err();
        assert!(err.to_string().contains("in use"));
        drop(lock);
        ArchiveLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn note_source_tracks_back_references() {
        let mut video = VideoState::default();
        video.note_source("https://a");
        video.note_source("https://a");
        video.note_source("https://b");
        assert_eq!(video.first_source.as_deref(), Some("https://a"));
        assert_eq!(video.back_references, vec!["https://b"]);
    }
}
