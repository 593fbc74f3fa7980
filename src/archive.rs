#![forbid(unsafe_code)]

//! The archiver: per-source enumeration, per-video component fetches, and
//! checkpointed materialization into the content repository.
//!
//! One orchestration thread drives source-level sequencing. Within a source,
//! videos are processed in bounded waves; inside each video the component
//! fetches run as sibling tasks so one failure never aborts the others.
//! Checkpoint commits always cover a prefix of the enumeration order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ArchiveConfig, ComponentsConfig, SourceConfig, SourceKind, api_key_from_env};
use crate::enumerate::{DetailOutcomes, Enumerator};
use crate::error::{ArchiveError, ErrorAction, RetryPolicy, Scope, SeverityTracker};
use crate::export::Exporter;
use crate::extractor::{Extractor, video_url};
use crate::filter::FilterConfig;
use crate::interrupt::{Checkpointer, export_message};
use crate::model::{
    Availability, CaptionTrack, ChannelRecord, DownloadStatus, PlaylistRecord, VideoRecord,
    write_json_atomic,
};
use crate::paths::{PathInputs, PathPlanner};
use crate::quota::{QuotaGovernor, WaitOutcome};
use crate::state::{ArchiveLock, SyncStateStore};
use crate::store::{AddMode, ContentStore};
use crate::update::{ComponentPlan, ForceOptions, SkipReason, VideoJob, component_plan, plan_jobs};

pub const COOKIES_FILE: &str = "cookies.txt";

/// Aggregate results of one invocation.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub sources: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct SourceOutcome {
    processed: usize,
    skipped: usize,
    failed: usize,
    downloaded: usize,
    cancelled: bool,
}

pub struct Archiver {
    root: PathBuf,
    config: ArchiveConfig,
    store: ContentStore,
    enumerator: Enumerator,
    governor: QuotaGovernor,
    planner: PathPlanner,
    state: SyncStateStore,
    policy: RetryPolicy,
    checkpointer: Checkpointer,
    cancel: CancellationToken,
    severity: SeverityTracker,
    _lock: ArchiveLock,
}

impl Archiver {
    /// Builds the pipeline for one archive directory. The data API is wired
    /// in only when a key is present in the environment.
    pub fn open(root: &Path, config: ArchiveConfig, cancel: CancellationToken) -> Result<Self> {
        let lock = ArchiveLock::acquire(root)?;
        let store = ContentStore::new(root);
        let timeout = Duration::from_secs(config.backup.http_timeout_secs);
        let api = api_key_from_env()
            .map(|key| crate::api::DataApiClient::new(key, timeout));
        if api.is_none() {
            println!("No API key in environment; running extractor-only (less complete).");
        }
        let cookies = root.join(COOKIES_FILE);
        let extractor = Extractor::new(cookies.exists().then_some(cookies));
        let scratch = root.join(crate::state::STATE_DIR).join("tmp");
        let enumerator = Enumerator::new(api, extractor, scratch);
        let governor = QuotaGovernor::from_config(&config.backup);
        let planner = PathPlanner::new(&config.organization);
        let state = SyncStateStore::open(root)?;
        let checkpointer = Checkpointer::from_config(&config.backup);
        Ok(Self {
            root: root.to_path_buf(),
            config,
            store,
            enumerator,
            governor,
            planner,
            state,
            policy: RetryPolicy::default(),
            checkpointer,
            cancel,
            severity: SeverityTracker::default(),
            _lock: lock,
        })
    }

    pub fn exit_code(&self) -> i32 {
        self.severity.exit_code()
    }

    /// Full or incremental pass over every enabled source, or over a single
    /// ad-hoc URL.
    pub async fn run(
        &mut self,
        url: Option<&str>,
        force: ForceOptions,
    ) -> Result<RunSummary> {
        let sources: Vec<SourceConfig> = match url {
            Some(url) => {
                // A URL already declared in config keeps its overrides.
                match self
                    .config
                    .sources
                    .iter()
                    .find(|source| source.url == url)
                {
                    Some(declared) => vec![declared.clone()],
                    None => vec![SourceConfig::ad_hoc(url)],
                }
            }
            None => self.config.enabled_sources().cloned().collect(),
        };

        if sources.is_empty() {
            println!("No enabled sources. Add [[sources]] entries to config.toml.");
            return Ok(RunSummary::default());
        }

        let mut summary = RunSummary::default();
        let total_sources = sources.len();
        for (index, source) in sources.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if self
                .state
                .source(&source.url)
                .is_some_and(|entry| entry.status == crate::state::SourceStatus::Paused)
            {
                println!("Skipping paused source {}", source.url);
                continue;
            }
            println!();
            println!(
                "[{}/{}] Source: {}",
                index + 1,
                total_sources,
                source.url
            );
            summary.sources += 1;
            match self.backup_source(source, force).await {
                Ok(outcome) => {
                    summary.processed += outcome.processed;
                    summary.skipped += outcome.skipped;
                    summary.failed += outcome.failed;
                    if outcome.cancelled {
                        summary.cancelled = true;
                        break;
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    let fatal = self.record_source_error(&source.url, &err)?;
                    if fatal {
                        return Err(err);
                    }
                }
            }
        }

        // Tables are regenerated after each source; after a cancelled run the
        // partial commit has already happened. Nothing else to flush here.
        Ok(summary)
    }

    /// Records a source-level failure, commits partial progress, and reports
    /// whether the error class aborts the whole archive.
    fn record_source_error(&mut self, url: &str, err: &anyhow::Error) -> Result<bool> {
        let classified = err.downcast_ref::<ArchiveError>();
        let fatal = classified
            .map(|e| matches!(self.policy.decide(e, 0), ErrorAction::Abort(Scope::Archive)))
            .unwrap_or(false);
        if let Some(e) = classified {
            self.severity.record(e);
            error!(
                source = url,
                error.code = e.code(),
                error.message = %e,
                "source failed"
            );
        } else {
            self.severity.record_generic();
            error!(source = url, error.message = %err, "source failed");
        }
        eprintln!("  Warning: source {url} failed: {err}");
        self.state.update_source(url, |source| {
            source.record_failure(&err.to_string(), None);
        })?;
        self.store
            .commit(&format!("Partial backup (error): {url}"))?;
        Ok(fatal)
    }

    async fn backup_source(
        &mut self,
        source: &SourceConfig,
        force: ForceOptions,
    ) -> Result<SourceOutcome> {
        let components = self.config.effective_components(source);
        let filters = self.config.effective_filters(source);
        let caption_filter = components
            .caption_languages
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|err| ArchiveError::ConfigInvalid(format!("caption_languages: {err}")))?;

        // Enumeration. Playlist membership keeps the remote's order; channel
        // listings keep the extractor's enumeration order.
        let playlist = if source.kind == SourceKind::Playlist {
            let record = self.remote_playlist_info(&source.url).await?;
            let Some(record) = record else {
                return Ok(SourceOutcome {
                    cancelled: true,
                    ..SourceOutcome::default()
                });
            };
            if !filters.playlist_allowed(&record.playlist_id) {
                println!("  Playlist {} excluded by filters.", record.playlist_id);
                return Ok(SourceOutcome::default());
            }
            Some(record)
        } else {
            None
        };

        let candidates = match &playlist {
            Some(record) => record.video_ids.clone(),
            None => {
                let Some(ids) = self.remote_list_flat(source).await? else {
                    return Ok(SourceOutcome {
                        cancelled: true,
                        ..SourceOutcome::default()
                    });
                };
                ids
            }
        };
        println!("  Found {} videos", candidates.len());

        let channel = if source.kind == SourceKind::Channel {
            self.remote_channel_info(&source.url).await?
        } else {
            None
        };

        let jobs = plan_jobs(&self.root, &candidates, &self.state, &components, force);
        let outcome = self
            .process_jobs(source, &jobs, &components, &filters, caption_filter.as_ref())
            .await?;

        // Entity records for the source itself.
        if let Some(mut channel) = channel {
            channel.video_ids = candidates.clone();
            channel.last_sync = Some(Utc::now());
            self.write_channel_record(&channel)?;
        } else if source.kind == SourceKind::Channel {
            self.synthesize_channel_record(&jobs)?;
        }
        if let Some(mut record) = playlist {
            record.fetched_at = Some(Utc::now());
            self.materialize_playlist(&mut record)?;
        }

        let processed = outcome.processed + outcome.skipped;
        if outcome.cancelled {
            self.checkpointer
                .interrupted(&self.store, &source.url, outcome.processed)?;
            info!(source = %source.url, processed = outcome.processed, "source interrupted");
            return Ok(outcome);
        }

        self.checkpointer
            .source_complete(&self.store, &source.url, processed)?;

        // Summary tables are regenerated from disk after every completed
        // source, then committed separately.
        let exporter = Exporter::new(&self.root);
        exporter.export_all()?;
        self.store.commit(&export_message())?;

        let now = Utc::now();
        let last_id = jobs.last().map(|job| job.video_id.clone());
        let downloaded = outcome.downloaded as u64;
        let tracked = outcome.processed as u64;
        self.state.update_source(&source.url, |entry| {
            entry.record_success(now);
            entry.last_video_id = last_id;
            entry.videos_tracked += tracked;
            entry.videos_downloaded += downloaded;
        })?;

        println!(
            "  Done: {} fetched, {} already current, {} failed",
            outcome.processed, outcome.skipped, outcome.failed
        );
        Ok(outcome)
    }

    /// Runs the per-video pipeline over the planned jobs in bounded waves.
    async fn process_jobs(
        &mut self,
        source: &SourceConfig,
        jobs: &[VideoJob],
        components: &ComponentsConfig,
        filters: &FilterConfig,
        caption_filter: Option<&Regex>,
    ) -> Result<SourceOutcome> {
        let mut outcome = SourceOutcome::default();
        let total = jobs.len();
        let mut details = DetailOutcomes::new();
        let mut included = 0usize;
        let limit = filters.limit.unwrap_or(usize::MAX);
        let component_permits = Arc::new(Semaphore::new(
            self.config.backup.component_parallelism.max(1),
        ));
        let wave_size = self.config.backup.max_in_flight_videos.max(1);

        let mut position = 0usize;
        'waves: while position < jobs.len() {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let wave_end = (position + wave_size).min(jobs.len());
            let wave = &jobs[position..wave_end];

            // Make sure details exist for this wave's fetch jobs before
            // spawning anything.
            let missing: Vec<String> = wave
                .iter()
                .filter(|job| job.skip.is_none())
                .filter(|job| !details.contains_key(&job.video_id))
                .map(|job| job.video_id.clone())
                .collect();
            if !missing.is_empty() {
                let enumerator = self.enumerator.clone();
                let fetched = self
                    .remote(move || enumerator.detail_batch(&missing))
                    .await?;
                match fetched {
                    Some(batch) => details.extend(batch),
                    None => {
                        outcome.cancelled = true;
                        break;
                    }
                }
            }

            let mut tasks: JoinSet<VideoOutcome> = JoinSet::new();
            let mut ordered: BTreeMap<usize, Option<VideoOutcome>> = BTreeMap::new();
            let mut limit_reached = false;

            for (offset, job) in wave.iter().enumerate() {
                let index = position + offset;
                match job.skip {
                    Some(SkipReason::Unavailable) => {
                        // Nothing to fetch, nothing to move; the record on
                        // disk is the final word.
                        outcome.skipped += 1;
                        ordered.insert(index, None);
                        self.state.update_video(&job.video_id, |entry| {
                            entry.note_source(&source.url);
                        })?;
                    }
                    Some(SkipReason::Complete) => {
                        outcome.skipped += 1;
                        ordered.insert(index, None);
                        self.rename_if_needed(&job.video_id)?;
                        self.state.update_video(&job.video_id, |entry| {
                            entry.note_source(&source.url);
                        })?;
                    }
                    None => {
                        let detail = match details.remove(&job.video_id) {
                            Some(Ok(record)) => record,
                            Some(Err(err)) => {
                                self.record_video_error(&source.url, &job.video_id, err)?;
                                outcome.failed += 1;
                                ordered.insert(index, None);
                                continue;
                            }
                            None => {
                                // The facade guarantees per-id outcomes; a
                                // missing entry means the batch was skipped.
                                ordered.insert(index, None);
                                continue;
                            }
                        };

                        if !filters.includes(&detail) {
                            ordered.insert(index, None);
                            continue;
                        }
                        if included >= limit {
                            // Finish what is already in flight, then stop.
                            limit_reached = true;
                            break;
                        }
                        included += 1;

                        let previous = self.state.video(&job.video_id).cloned();
                        let plan = component_plan(
                            &detail,
                            previous.as_ref(),
                            components,
                            caption_filter,
                        );
                        self.rename_for_detail(&detail, previous.as_ref().map(|p| p.path.clone()))?;

                        // Nothing observable changed and no component work is
                        // pending: no writes at all, only the source-level
                        // last_sync bump at the end of the pass.
                        let only_metadata = !plan.fetch_thumbnail
                            && plan.caption_languages.is_empty()
                            && !plan.fetch_comments
                            && !plan.track_video
                            && !plan.download_video;
                        if only_metadata
                            && previous
                                .as_ref()
                                .is_some_and(|prev| crate::update::detail_unchanged(&detail, prev))
                        {
                            outcome.skipped += 1;
                            ordered.insert(index, None);
                            continue;
                        }

                        let ctx = VideoContext {
                            index,
                            archive_root: self.root.clone(),
                            video_dir: self.planner.video_dir(&PathInputs::from_video(&detail)),
                            video_filename: self.config.organization.video_filename.clone(),
                            detail,
                            plan,
                            captions_requested: components.captions,
                            comments_depth: components.comments_depth,
                            enumerator: self.enumerator.clone(),
                            governor: self.governor.clone(),
                            policy: self.policy.clone(),
                            cancel: self.cancel.clone(),
                            permits: component_permits.clone(),
                        };
                        tasks.spawn(process_video(ctx));
                    }
                }
            }

            while let Some(joined) = tasks.join_next().await {
                let video_outcome = joined.context("video task panicked")?;
                ordered.insert(video_outcome.index, Some(video_outcome));
            }

            // Finalize in enumeration order so sync-state and checkpoints
            // always describe a prefix.
            for (_, slot) in std::mem::take(&mut ordered) {
                let Some(video_outcome) = slot else { continue };
                let cancelled = video_outcome.cancelled;
                self.finalize_video(source, video_outcome, &mut outcome)?;
                let done = outcome.processed + outcome.skipped;
                self.checkpointer
                    .note_video(&self.store, &source.url, done, total)?;
                if cancelled {
                    outcome.cancelled = true;
                    break 'waves;
                }
            }

            if limit_reached {
                break;
            }
            position = wave_end;
        }

        Ok(outcome)
    }

    /// Applies one completed video task to the store and sync-state.
    fn finalize_video(
        &mut self,
        source: &SourceConfig,
        video: VideoOutcome,
        outcome: &mut SourceOutcome,
    ) -> Result<()> {
        // Register the video URL with the blob store: track by default,
        // bytes only when the videos component asked for them.
        let mut download_status: Option<DownloadStatus> = None;
        if let Some(rel) = &video.track_path {
            match self
                .store
                .add_url(rel, &video_url(&video.video_id), AddMode::Track)
            {
                Ok(()) => download_status = Some(DownloadStatus::Tracked),
                Err(err) => {
                    eprintln!(
                        "  Warning: could not track {}: {}",
                        video.video_id, err
                    );
                    warn!(video_id = %video.video_id, error = %err, "track registration failed");
                }
            }
        }
        if let Some(rel) = &video.downloaded_path {
            match self.store.add_file(rel) {
                Ok(()) => {
                    download_status = Some(DownloadStatus::Downloaded);
                    outcome.downloaded += 1;
                }
                Err(err) => {
                    download_status = Some(DownloadStatus::Failed);
                    eprintln!(
                        "  Warning: could not add media for {}: {}",
                        video.video_id, err
                    );
                }
            }
        }

        // Blob metadata for every annexed entry this video produced.
        if let Some(record) = &video.record {
            for (rel, filetype) in &video.annexed {
                let mut kv = BTreeMap::new();
                kv.insert("video_id".to_string(), record.video_id.clone());
                kv.insert("title".to_string(), record.title.clone());
                kv.insert("channel".to_string(), record.channel_name.clone());
                kv.insert(
                    "published".to_string(),
                    record
                        .published_at
                        .map(|at| at.format("%Y-%m-%d").to_string())
                        .unwrap_or_default(),
                );
                kv.insert("source_url".to_string(), source.url.clone());
                kv.insert("filetype".to_string(), filetype.clone());
                if let Err(err) = self.store.set_blob_metadata(rel, &kv) {
                    warn!(video_id = %record.video_id, error = %err, "blob metadata failed");
                }
            }
        }

        for (component, err) in &video.component_errors {
            self.severity.record(err);
            error!(
                source = %source.url,
                video_id = %video.video_id,
                component = %component,
                error.code = err.code(),
                error.message = %err,
                "component failed"
            );
            eprintln!(
                "  Warning: {} failed for {}: {}",
                component, video.video_id, err
            );
        }

        let failed = !video.component_errors.is_empty();
        if failed {
            outcome.failed += 1;
        } else {
            outcome.processed += 1;
        }

        let now = Utc::now();
        let source_url = source.url.clone();
        let last_error = video
            .component_errors
            .first()
            .map(|(component, err)| format!("{component}: {err}"));
        self.state.update_video(&video.video_id, |entry| {
            entry.note_source(&source_url);
            if let Some(record) = &video.record {
                entry.availability = record.availability;
                entry.path = record.file_path.clone();
                entry.view_count = record.view_count;
                entry.like_count = record.like_count;
                entry.comment_count = record.comment_count;
                entry.updated_at = record.updated_at;
            }
            let stamps = &mut entry.components;
            let fetched = &video.fetched;
            if fetched.metadata {
                stamps.metadata = Some(now);
            }
            if fetched.thumbnail {
                stamps.thumbnail = Some(now);
            }
            if fetched.captions {
                stamps.captions = Some(now);
            }
            if fetched.comments {
                stamps.comments = Some(now);
            }
            if fetched.video {
                stamps.video = Some(now);
            }
            for lang in &video.caption_langs_fetched {
                if !entry.captions_fetched.contains(lang) {
                    entry.captions_fetched.push(lang.clone());
                }
            }
            entry.captions_fetched.sort();
            if let Some(status) = download_status {
                entry.download_status = status;
            }
            if video.wrote_anything {
                entry.update_count += 1;
            }
            entry.last_error = last_error;
        })?;

        Ok(())
    }

    fn record_video_error(
        &mut self,
        source_url: &str,
        video_id: &str,
        err: ArchiveError,
    ) -> Result<()> {
        if let ArchiveError::RemoteUnavailable(reason) = &err {
            // The transition is recorded; previously fetched components are
            // retained untouched.
            let availability = if reason.contains("private") {
                Availability::Private
            } else if reason.contains("removed") {
                Availability::Removed
            } else {
                Availability::Unavailable
            };
            println!("  {video_id} is now {reason}; keeping what we have");
            self.state.update_video(video_id, |entry| {
                entry.availability = availability;
            })?;
            return Ok(());
        }
        self.severity.record(&err);
        error!(
            source = source_url,
            video_id,
            error.code = err.code(),
            error.message = %err,
            "detail fetch failed"
        );
        eprintln!("  Warning: failed to fetch {video_id}: {err}");
        let message = err.to_string();
        self.state.update_video(video_id, |entry| {
            entry.last_error = Some(message);
        })?;
        Ok(())
    }

    /// Rename detection for a video that is otherwise skipped: the record on
    /// disk supplies the template inputs.
    fn rename_if_needed(&mut self, video_id: &str) -> Result<()> {
        let Some(entry) = self.state.video(video_id) else {
            return Ok(());
        };
        let recorded = entry.path.clone();
        if recorded.is_empty() {
            return Ok(());
        }
        let metadata_path = self.root.join(&recorded).join("metadata.json");
        let Ok(record) = VideoRecord::load(&metadata_path) else {
            return Ok(());
        };
        self.apply_rename(&record, &recorded)
    }

    fn rename_for_detail(&mut self, detail: &VideoRecord, recorded: Option<String>) -> Result<()> {
        let Some(recorded) = recorded else {
            return Ok(());
        };
        if recorded.is_empty() {
            return Ok(());
        }
        self.apply_rename(detail, &recorded)
    }

    fn apply_rename(&mut self, record: &VideoRecord, recorded: &str) -> Result<()> {
        let inputs = PathInputs::from_video(record);
        if let Some(plan) = self.planner.detect_rename(&self.root, recorded, &inputs) {
            println!("  Moving {} -> {}", plan.from, plan.to);
            info!(from = %plan.from, to = %plan.to, "history-preserving move");
            self.store.mv(&plan.from, &plan.to)?;
            // Only sync-state learns the new location. The entity file is
            // left byte-identical; exports derive paths from where files
            // actually live.
            let new_path = plan.to.clone();
            let video_id = record.video_id.clone();
            self.state.update_video(&video_id, |entry| {
                entry.path = new_path;
            })?;
        }
        Ok(())
    }

    fn write_channel_record(&self, channel: &ChannelRecord) -> Result<()> {
        let dir = self.root.join(self.planner.channel_dir(&channel.channel_id));
        let path = dir.join("metadata.json");
        if let Ok(existing) = ChannelRecord::load(&path) {
            let mut normalized = channel.clone();
            normalized.last_sync = existing.last_sync;
            if serde_json::to_value(&normalized)? == serde_json::to_value(&existing)? {
                return Ok(());
            }
        }
        write_json_atomic(&path, channel)
    }

    /// Extractor-only runs have no channel endpoint; derive a minimal record
    /// from the first archived video of this pass.
    fn synthesize_channel_record(&self, jobs: &[VideoJob]) -> Result<()> {
        for job in jobs {
            let Some(entry) = self.state.video(&job.video_id) else {
                continue;
            };
            if entry.path.is_empty() {
                continue;
            }
            let metadata_path = self.root.join(&entry.path).join("metadata.json");
            let Ok(record) = VideoRecord::load(&metadata_path) else {
                continue;
            };
            if record.channel_id.is_empty() {
                continue;
            }
            let channel = ChannelRecord {
                channel_id: record.channel_id.clone(),
                title: record.channel_name.clone(),
                description: String::new(),
                custom_url: None,
                subscriber_count: None,
                video_count: None,
                created_at: None,
                last_sync: Some(Utc::now()),
                video_ids: jobs.iter().map(|job| job.video_id.clone()).collect(),
                playlist_ids: Vec::new(),
            };
            return self.write_channel_record(&channel);
        }
        Ok(())
    }

    /// Writes the playlist record and rebuilds its ordered references.
    fn materialize_playlist(&mut self, playlist: &mut PlaylistRecord) -> Result<()> {
        let dir = self.root.join(self.planner.playlist_dir(&playlist.playlist_id));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join("metadata.json");
        let changed = match PlaylistRecord::load(&path) {
            Ok(existing) => {
                let mut normalized = playlist.clone();
                normalized.fetched_at = existing.fetched_at;
                serde_json::to_value(&normalized)? != serde_json::to_value(&existing)?
            }
            Err(_) => true,
        };
        if changed {
            write_json_atomic(&path, playlist)?;
        }

        // Drop every existing ordered reference, then recreate from the
        // authoritative order. Inserting at position k renumbers only k and
        // later because earlier entries regenerate byte-identically.
        let width = self.config.organization.playlist_index_width;
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let prefix: String = name.chars().take(width).collect();
            let is_index = name.chars().count() > width
                && prefix.chars().all(|c| c.is_ascii_digit());
            if is_index {
                let path = entry.path();
                if path.is_symlink() || path.is_file() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("removing {}", path.display()))?;
                }
            }
        }

        let mut position = 0usize;
        for video_id in &playlist.video_ids {
            let Some(entry) = self.state.video(video_id) else {
                continue;
            };
            if entry.path.is_empty() {
                continue;
            }
            let metadata_path = self.root.join(&entry.path).join("metadata.json");
            let Ok(record) = VideoRecord::load(&metadata_path) else {
                continue;
            };
            let inputs = PathInputs::from_video(&record);
            let name = self.planner.playlist_entry_name(position, &inputs);
            let link_path = dir.join(&name);
            let target = PathBuf::from("../..").join(&entry.path);
            make_reference(&link_path, &target)?;
            position += 1;
        }
        Ok(())
    }

    async fn remote_list_flat(&self, source: &SourceConfig) -> Result<Option<Vec<String>>> {
        let enumerator = self.enumerator.clone();
        let source = source.clone();
        self.remote(move || enumerator.list_flat(&source)).await
    }

    async fn remote_channel_info(&self, url: &str) -> Result<Option<ChannelRecord>> {
        let enumerator = self.enumerator.clone();
        let url = url.to_string();
        Ok(self
            .remote(move || enumerator.channel_info(&url))
            .await?
            .flatten())
    }

    async fn remote_playlist_info(&self, url: &str) -> Result<Option<PlaylistRecord>> {
        let enumerator = self.enumerator.clone();
        let url = url.to_string();
        self.remote(move || enumerator.playlist_info(&url)).await
    }

    /// Runs a blocking backend call off-thread with retry, backoff, and
    /// governor handling. `Ok(None)` means cancellation won.
    async fn remote<T, F>(&self, op: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + Clone + 'static,
    {
        remote_call(op, &self.governor, &self.cancel, &self.policy).await
    }
}

/// Shared retry loop used by the orchestrator and by per-video component
/// tasks. Quota exhaustion hands the wait to the governor without consuming
/// a retry attempt.
async fn remote_call<T, F>(
    op: F,
    governor: &QuotaGovernor,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
) -> Result<Option<T>>
where
    T: Send + 'static,
    F: Fn() -> Result<T> + Send + Clone + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let call = op.clone();
        let result = tokio::task::spawn_blocking(call)
            .await
            .context("backend task join")?;
        let err = match result {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };
        let classified = match err.downcast::<ArchiveError>() {
            Ok(classified) => classified,
            Err(other) => return Err(other),
        };
        match policy.decide(&classified, attempt) {
            ErrorAction::Retry { after } => {
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(after) => {}
                }
            }
            ErrorAction::AwaitQuota => match governor.wait_for_reset(cancel).await? {
                WaitOutcome::Completed => {}
                WaitOutcome::Cancelled => return Ok(None),
            },
            ErrorAction::Skip | ErrorAction::Abort(_) => return Err(classified.into()),
        }
    }
}

/// Everything a per-video task needs, owned.
struct VideoContext {
    index: usize,
    archive_root: PathBuf,
    video_dir: String,
    video_filename: String,
    detail: VideoRecord,
    plan: ComponentPlan,
    captions_requested: bool,
    comments_depth: u32,
    enumerator: Enumerator,
    governor: QuotaGovernor,
    policy: RetryPolicy,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct FetchedComponents {
    metadata: bool,
    thumbnail: bool,
    captions: bool,
    comments: bool,
    video: bool,
}

struct VideoOutcome {
    index: usize,
    video_id: String,
    record: Option<VideoRecord>,
    fetched: FetchedComponents,
    caption_langs_fetched: Vec<String>,
    component_errors: Vec<(&'static str, ArchiveError)>,
    /// Relative path to register with `addurl` in track mode.
    track_path: Option<String>,
    /// Relative path of a downloaded media file to annex.
    downloaded_path: Option<String>,
    /// Annexed entries needing blob metadata, with their filetype key.
    annexed: Vec<(String, String)>,
    wrote_anything: bool,
    cancelled: bool,
}

/// Fetches one video's components. Sibling components run concurrently under
/// the shared permit pool; a failure in one never aborts the others.
async fn process_video(ctx: VideoContext) -> VideoOutcome {
    let video_id = ctx.detail.video_id.clone();
    let abs_dir = ctx.archive_root.join(&ctx.video_dir);
    let mut outcome = VideoOutcome {
        index: ctx.index,
        video_id: video_id.clone(),
        record: None,
        fetched: FetchedComponents::default(),
        caption_langs_fetched: Vec::new(),
        component_errors: Vec::new(),
        track_path: None,
        downloaded_path: None,
        annexed: Vec::new(),
        wrote_anything: false,
        cancelled: false,
    };

    println!("  Fetching {}", video_id);

    let thumbnail = run_component(&ctx, ctx.plan.fetch_thumbnail, {
        let enumerator = ctx.enumerator.clone();
        let video_id = video_id.clone();
        let dir = abs_dir.clone();
        move || enumerator.thumbnail(&video_id, &dir).map(|_| ())
    });

    let captions = run_component(&ctx, !ctx.plan.caption_languages.is_empty(), {
        let enumerator = ctx.enumerator.clone();
        let video_id = video_id.clone();
        let dir = abs_dir.clone();
        let languages = ctx.plan.caption_languages.clone();
        let basename = ctx.video_filename.clone();
        move || enumerator.captions(&video_id, &languages, &dir, &basename)
    });

    let comments = run_component(&ctx, ctx.plan.fetch_comments, {
        let enumerator = ctx.enumerator.clone();
        let video_id = video_id.clone();
        let depth = ctx.comments_depth;
        move || enumerator.comments(&video_id, depth)
    });

    let download = run_component(&ctx, ctx.plan.download_video, {
        let enumerator = ctx.enumerator.clone();
        let video_id = video_id.clone();
        let dir = abs_dir.clone();
        let basename = ctx.video_filename.clone();
        move || enumerator.download_video(&video_id, &dir, &basename)
    });

    let (thumbnail, captions, comments, download) =
        tokio::join!(thumbnail, captions, comments, download);

    match thumbnail {
        ComponentResult::Done(()) => {
            outcome.fetched.thumbnail = true;
            outcome.wrote_anything = true;
            outcome.annexed.push((
                format!("{}/thumbnail.jpg", ctx.video_dir),
                "thumbnail".to_string(),
            ));
        }
        ComponentResult::Failed(err) => outcome.component_errors.push(("thumbnail", err)),
        ComponentResult::Cancelled => outcome.cancelled = true,
        ComponentResult::Skipped => {}
    }

    match captions {
        ComponentResult::Done(tracks) => {
            outcome.fetched.captions = true;
            if !tracks.is_empty() {
                outcome.wrote_anything = true;
            }
            outcome.caption_langs_fetched =
                tracks.iter().map(|track| track.language.clone()).collect();
            if let Err(err) = write_caption_manifest(&abs_dir, &video_id, &tracks) {
                outcome
                    .component_errors
                    .push(("captions", ArchiveError::Data(err.to_string())));
            }
        }
        ComponentResult::Failed(err) => outcome.component_errors.push(("captions", err)),
        ComponentResult::Cancelled => outcome.cancelled = true,
        ComponentResult::Skipped => {
            // Requested with nothing new to fetch still counts as current,
            // otherwise a captionless video would never reach completeness.
            outcome.fetched.captions =
                ctx.captions_requested && !ctx.detail.suppresses_fetch();
        }
    }

    match comments {
        ComponentResult::Done((roots, truncated)) => {
            outcome.fetched.comments = true;
            if truncated {
                warn!(video_id = %video_id, "comments came from the extractor and may be truncated");
            }
            match write_comments(&abs_dir, &roots) {
                Ok(()) => outcome.wrote_anything = true,
                Err(err) => outcome
                    .component_errors
                    .push(("comments", ArchiveError::Data(err.to_string()))),
            }
        }
        ComponentResult::Failed(err) => outcome.component_errors.push(("comments", err)),
        ComponentResult::Cancelled => outcome.cancelled = true,
        ComponentResult::Skipped => {}
    }

    match download {
        ComponentResult::Done(path) => {
            outcome.fetched.video = true;
            outcome.wrote_anything = true;
            let rel = format!(
                "{}/{}",
                ctx.video_dir,
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| ctx.video_filename.clone())
            );
            outcome.annexed.push((rel.clone(), "video".to_string()));
            outcome.downloaded_path = Some(rel);
        }
        ComponentResult::Failed(err) => outcome.component_errors.push(("video", err)),
        ComponentResult::Cancelled => outcome.cancelled = true,
        ComponentResult::Skipped => {}
    }

    if ctx.plan.track_video {
        outcome.track_path = Some(format!("{}/{}.mp4", ctx.video_dir, ctx.video_filename));
    }

    // Metadata last, so the written record reflects what actually landed.
    let mut record = ctx.detail.clone();
    record.file_path = ctx.video_dir.clone();
    if ctx.plan.write_metadata {
        match write_metadata_if_changed(&abs_dir, &record) {
            Ok(wrote) => {
                outcome.fetched.metadata = true;
                outcome.wrote_anything |= wrote;
            }
            Err(err) => outcome
                .component_errors
                .push(("metadata", ArchiveError::Data(err.to_string()))),
        }
    }
    outcome.record = Some(record);

    outcome
}

enum ComponentResult<T> {
    Done(T),
    Failed(ArchiveError),
    Cancelled,
    Skipped,
}

/// Wraps one component fetch in the shared permit pool and retry loop.
async fn run_component<T, F>(ctx: &VideoContext, wanted: bool, op: F) -> ComponentResult<T>
where
    T: Send + 'static,
    F: Fn() -> Result<T> + Send + Clone + 'static,
{
    if !wanted {
        return ComponentResult::Skipped;
    }
    let permit = match ctx.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ComponentResult::Cancelled,
    };
    let result = remote_call(op, &ctx.governor, &ctx.cancel, &ctx.policy).await;
    drop(permit);
    match result {
        Ok(Some(value)) => ComponentResult::Done(value),
        Ok(None) => ComponentResult::Cancelled,
        Err(err) => match err.downcast::<ArchiveError>() {
            Ok(classified) => ComponentResult::Failed(classified),
            Err(other) => ComponentResult::Failed(ArchiveError::Data(other.to_string())),
        },
    }
}

/// Writes `metadata.json` only when the record differs beyond its volatile
/// timestamps, keeping reruns byte-identical.
fn write_metadata_if_changed(abs_dir: &Path, record: &VideoRecord) -> Result<bool> {
    let path = abs_dir.join("metadata.json");
    if let Ok(existing) = VideoRecord::load(&path) {
        let mut normalized = record.clone();
        normalized.fetched_at = existing.fetched_at;
        normalized.updated_at = existing.updated_at;
        normalized.download_status = existing.download_status;
        // The recorded path may predate a template change; the directory's
        // real location is authoritative.
        normalized.file_path = existing.file_path.clone();
        if serde_json::to_value(&normalized)? == serde_json::to_value(&existing)? {
            return Ok(false);
        }
    }
    write_json_atomic(&path, record)?;
    Ok(true)
}

fn write_comments(abs_dir: &Path, roots: &[crate::model::CommentRecord]) -> Result<()> {
    crate::model::validate_comment_tree(roots)?;
    write_json_atomic(&abs_dir.join("comments.json"), &roots.to_vec())
}

fn write_caption_manifest(
    abs_dir: &Path,
    video_id: &str,
    tracks: &[CaptionTrack],
) -> Result<()> {
    if tracks.is_empty() {
        return Ok(());
    }
    Exporter::write_captions_manifest(abs_dir, video_id, tracks)
}

/// Ordered playlist reference: a relative symlink on Unix, a pointer file
/// elsewhere.
fn make_reference(link_path: &Path, target: &Path) -> Result<()> {
    if link_path.exists() || link_path.is_symlink() {
        std::fs::remove_file(link_path)
            .with_context(|| format!("removing {}", link_path.display()))?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link_path)
            .with_context(|| format!("linking {}", link_path.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(link_path, target.to_string_lossy().as_bytes())
            .with_context(|| format!("writing {}", link_path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn remote_call_retries_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let governor = QuotaGovernor::for_tests(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 5,
        };
        let result = remote_call(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ArchiveError::NetworkTransient("flaky".into()).into())
                } else {
                    Ok(42u32)
                }
            },
            &governor,
            &cancel,
            &policy,
        )
        .await
        .unwrap();
        assert_eq!(result, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn remote_call_respects_cancellation() {
        let governor = QuotaGovernor::for_tests(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::default();
        let result: Option<u32> = remote_call(
            move || Ok(1u32),
            &governor,
            &cancel,
            &policy,
        )
        .await
        .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn remote_call_surfaces_skip_class_errors() {
        let governor = QuotaGovernor::for_tests(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::default();
        let result: Result<Option<u32>> = remote_call(
            move || Err(ArchiveError::ExtractorIncompatible("nope".into()).into()),
            &governor,
            &cancel,
            &policy,
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::ExtractorIncompatible(_))
        ));
    }

    #[test]
    fn metadata_write_skips_when_only_timestamps_differ() {
        let dir = tempdir().unwrap();
        let mut record = VideoRecord {
            video_id: "aaaaaaaaaaa".into(),
            title: "T".into(),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: "C".into(),
            published_at: Some("2024-01-01T00:00:00Z".parse().unwrap()),
            duration_seconds: Some(5),
            view_count: Some(1),
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            license: None,
            privacy: None,
            availability: Availability::Public,
            tags: Vec::new(),
            categories: Vec::new(),
            language: None,
            captions_available: Vec::new(),
            download_status: DownloadStatus::NotTracked,
            file_path: "videos/x".into(),
            fetched_at: Some("2024-01-02T00:00:00Z".parse().unwrap()),
            updated_at: Some("2024-01-02T00:00:00Z".parse().unwrap()),
            less_complete: false,
        };
        assert!(write_metadata_if_changed(dir.path(), &record).unwrap());
        let first = std::fs::read(dir.path().join("metadata.json")).unwrap();

        // Fresh timestamps only: no write, bytes unchanged.
        record.fetched_at = Some("2024-06-01T00:00:00Z".parse().unwrap());
        record.updated_at = Some("2024-06-01T00:00:00Z".parse().unwrap());
        assert!(!write_metadata_if_changed(dir.path(), &record).unwrap());
        let second = std::fs::read(dir.path().join("metadata.json")).unwrap();
        assert_eq!(first, second);

        // A real change rewrites.
        record.view_count = Some(2);
        assert!(write_metadata_if_changed(dir.path(), &record).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn make_reference_creates_relative_symlink() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("0001_slug");
        make_reference(&link, Path::new("../../videos/2024-01-01_abc")).unwrap();
        let target = std::fs::read_link(&link).unwrap();
        assert_eq!(target, PathBuf::from("../../videos/2024-01-01_abc"));
        // Recreating over an existing link succeeds.
        make_reference(&link, Path::new("../../videos/other")).unwrap();
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("../../videos/other")
        );
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use crate::config::ArchiveConfig;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        fn make_executable(path: &Path, script: &str) {
            fs::write(path, script).unwrap();
            let mut perms = fs::metadata(path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms).unwrap();
        }

        /// A git stub that records every invocation and reports a dirty tree
        /// so commits go through.
        fn git_stub(dir: &Path) -> (PathBuf, PathBuf) {
            let log = dir.join("git-args.log");
            let stub = dir.join("git-stub.sh");
            make_executable(
                &stub,
                &format!(
                    "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in status) echo ' M x';; esac\nexit 0\n",
                    log.display()
                ),
            );
            (stub, log)
        }

        /// A yt-dlp stub serving a two-video channel: flat listing, per-id
        /// JSON dumps, and thumbnail files.
        fn ytdlp_stub(dir: &Path) -> PathBuf {
            let payload_a = dir.join("payload_a.json");
            fs::write(
                &payload_a,
                r#"{"title":"First Video","description":"a","channel_id":"UCstub",
                   "channel":"Stub Channel","upload_date":"20240101","duration":60,
                   "view_count":10,"availability":"public"}"#,
            )
            .unwrap();
            let payload_b = dir.join("payload_b.json");
            fs::write(
                &payload_b,
                r#"{"title":"Second Video","description":"b","channel_id":"UCstub",
                   "channel":"Stub Channel","upload_date":"20240202","duration":90,
                   "view_count":20,"availability":"public"}"#,
            )
            .unwrap();

            let stub = dir.join("yt-dlp-stub.sh");
            make_executable(
                &stub,
                &format!(
                    r#"#!/bin/sh
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
case "$*" in
  *--flat-playlist*) printf 'aaaaaaaaaaa\nbbbbbbbbbbb\n';;
  *--dump-single-json*)
    case "$*" in
      *aaaaaaaaaaa*) cat {payload_a};;
      *bbbbbbbbbbb*) cat {payload_b};;
    esac;;
  *--write-thumbnail*) touch "$out.jpg";;
esac
exit 0
"#,
                    payload_a = payload_a.display(),
                    payload_b = payload_b.display(),
                ),
            );
            stub
        }

        fn test_config() -> ArchiveConfig {
            ArchiveConfig::parse(
                r#"
                [[sources]]
                url = "https://www.youtube.com/@stub"
                type = "channel"

                [components]
                captions = false
                comments = false
                "#,
            )
            .unwrap()
        }

        #[tokio::test]
        async fn small_channel_metadata_and_thumbnails() {
            let tools = tempdir().unwrap();
            let archive = tempdir().unwrap();
            let (git, git_log) = git_stub(tools.path());
            let _git_guard = crate::store::set_git_stub_path(git);
            let _yt_guard =
                crate::extractor::set_ytdlp_stub_path(ytdlp_stub(tools.path()));

            let cancel = CancellationToken::new();
            let mut archiver =
                Archiver::open(archive.path(), test_config(), cancel.clone()).unwrap();
            let summary = archiver.run(None, ForceOptions::default()).await.unwrap();

            assert_eq!(summary.processed, 2);
            assert_eq!(summary.failed, 0);
            assert!(!summary.cancelled);

            // One directory per video with metadata and thumbnail.
            let first = archive.path().join("videos/2024-01-01_aaaaaaaaaaa");
            let second = archive.path().join("videos/2024-02-02_bbbbbbbbbbb");
            assert!(first.join("metadata.json").exists());
            assert!(first.join("thumbnail.jpg").exists());
            assert!(second.join("metadata.json").exists());
            assert!(second.join("thumbnail.jpg").exists());

            // Summary table: header plus two rows, date ascending.
            let table =
                fs::read_to_string(archive.path().join(crate::export::VIDEOS_TSV)).unwrap();
            let lines: Vec<&str> = table.lines().collect();
            assert_eq!(lines.len(), 3);
            assert!(lines[1].starts_with("First Video\t"));
            assert!(lines[2].starts_with("Second Video\t"));

            // The channel record was synthesized from the detail records.
            assert!(archive
                .path()
                .join("channels/UCstub/metadata.json")
                .exists());

            // Video URLs registered in track mode; completion committed.
            let logged = fs::read_to_string(&git_log).unwrap();
            assert!(logged.contains("annex addurl --relaxed --file"));
            assert!(logged.contains("Backup: https://www.youtube.com/@stub (2 videos)"));

            // Sync-state carries stamps and the resolved paths.
            let state = archiver.state.video("aaaaaaaaaaa").unwrap();
            assert!(state.components.metadata.is_some());
            assert!(state.components.thumbnail.is_some());
            assert_eq!(state.path, "videos/2024-01-01_aaaaaaaaaaa");
        }

        #[tokio::test]
        async fn second_run_skips_complete_videos() {
            let tools = tempdir().unwrap();
            let archive = tempdir().unwrap();
            let (git, _git_log) = git_stub(tools.path());
            let _git_guard = crate::store::set_git_stub_path(git);
            let _yt_guard =
                crate::extractor::set_ytdlp_stub_path(ytdlp_stub(tools.path()));

            let cancel = CancellationToken::new();
            let mut archiver =
                Archiver::open(archive.path(), test_config(), cancel.clone()).unwrap();
            archiver.run(None, ForceOptions::default()).await.unwrap();
            let metadata_path = archive
                .path()
                .join("videos/2024-01-01_aaaaaaaaaaa/metadata.json");
            let first_bytes = fs::read(&metadata_path).unwrap();
            drop(archiver);

            // Fresh archiver over the same directory, as after a restart.
            let mut archiver =
                Archiver::open(archive.path(), test_config(), cancel).unwrap();
            let summary = archiver.run(None, ForceOptions::default()).await.unwrap();
            assert_eq!(summary.processed, 0);
            assert_eq!(summary.skipped, 2);
            // No rewrite of the entity file.
            assert_eq!(fs::read(&metadata_path).unwrap(), first_bytes);
        }

        /// A git stub whose `mv` really moves, so rename plans land on disk.
        fn git_stub_with_mv(dir: &Path) -> (PathBuf, PathBuf) {
            let log = dir.join("git-args.log");
            let stub = dir.join("git-stub.sh");
            make_executable(
                &stub,
                &format!(
                    "#!/bin/sh\necho \"$@\" >> {}\ncase \"$1\" in status) echo ' M x';; mv) mv \"$2\" \"$3\";; esac\nexit 0\n",
                    log.display()
                ),
            );
            (stub, log)
        }

        #[tokio::test]
        async fn template_change_moves_directories_without_rewrites() {
            let tools = tempdir().unwrap();
            let archive = tempdir().unwrap();
            let (git, git_log) = git_stub_with_mv(tools.path());
            let _git_guard = crate::store::set_git_stub_path(git);
            let _yt_guard =
                crate::extractor::set_ytdlp_stub_path(ytdlp_stub(tools.path()));

            let cancel = CancellationToken::new();
            let mut archiver =
                Archiver::open(archive.path(), test_config(), cancel.clone()).unwrap();
            archiver.run(None, ForceOptions::default()).await.unwrap();
            let old_metadata = archive
                .path()
                .join("videos/2024-01-01_aaaaaaaaaaa/metadata.json");
            let original_bytes = fs::read(&old_metadata).unwrap();
            drop(archiver);

            // Same archive, new template.
            let mut config = test_config();
            config.organization.video_path_template = "{year}/{month}/{video_id}".into();
            let mut archiver = Archiver::open(archive.path(), config, cancel).unwrap();
            let summary = archiver.run(None, ForceOptions::default()).await.unwrap();

            // Nothing refetched, both directories moved exactly once.
            assert_eq!(summary.processed, 0);
            assert_eq!(summary.skipped, 2);
            let logged = fs::read_to_string(&git_log).unwrap();
            assert_eq!(
                logged
                    .lines()
                    .filter(|line| line.starts_with("mv videos/2024-01-01_aaaaaaaaaaa"))
                    .count(),
                1
            );

            // History-preserving move, content bytes untouched.
            let new_metadata = archive
                .path()
                .join("videos/2024/01/aaaaaaaaaaa/metadata.json");
            assert!(!old_metadata.exists());
            assert_eq!(fs::read(&new_metadata).unwrap(), original_bytes);

            // The summary table reflects the new locations.
            let table =
                fs::read_to_string(archive.path().join(crate::export::VIDEOS_TSV)).unwrap();
            assert!(table.contains("videos/2024/01/aaaaaaaaaaa"));
            assert!(!table.contains("videos/2024-01-01_aaaaaaaaaaa"));
        }

        #[tokio::test]
        async fn unavailable_video_generates_no_detail_fetch() {
            let tools = tempdir().unwrap();
            let archive = tempdir().unwrap();
            let (git, _log) = git_stub(tools.path());
            let _git_guard = crate::store::set_git_stub_path(git);

            // This stub counts dump-single-json calls per id.
            let counter = tools.path().join("detail-calls.log");
            let stub = tools.path().join("yt-dlp-stub.sh");
            make_executable(
                &stub,
                &format!(
                    r#"#!/bin/sh
case "$*" in
  *--flat-playlist*) printf 'aaaaaaaaaaa\nbbbbbbbbbbb\n';;
  *--dump-single-json*) echo "$*" >> {counter}
    printf '{{"title":"X","channel_id":"UCstub","channel":"S","upload_date":"20240101","availability":"public"}}';;
  *--write-thumbnail*) :;;
esac
exit 0
"#,
                    counter = counter.display(),
                ),
            );
            let _yt_guard = crate::extractor::set_ytdlp_stub_path(stub);

            // Thumbnails off too: the stub creates no files here.
            let config = ArchiveConfig::parse(
                r#"
                [[sources]]
                url = "https://www.youtube.com/@stub"
                type = "channel"

                [components]
                captions = false
                comments = false
                thumbnails = false
                "#,
            )
            .unwrap();

            let cancel = CancellationToken::new();
            let mut archiver =
                Archiver::open(archive.path(), config.clone(), cancel.clone()).unwrap();
            // Pre-mark one id as private before the run.
            archiver
                .state
                .update_video("bbbbbbbbbbb", |entry| {
                    entry.availability = Availability::Private;
                })
                .unwrap();

            archiver.run(None, ForceOptions::default()).await.unwrap();

            let calls = fs::read_to_string(&counter).unwrap_or_default();
            assert!(calls.contains("aaaaaaaaaaa"));
            assert!(
                !calls.contains("bbbbbbbbbbb"),
                "terminal availability must suppress detail fetches"
            );
        }
    }
}
