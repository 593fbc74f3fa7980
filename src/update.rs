#![forbid(unsafe_code)]

//! Incremental planning: which videos need a detail fetch, and which
//! components of a fetched video need work.
//!
//! The two-pass strategy keeps quota spend proportional to change: a flat
//! listing produces candidates, the known-unavailable set and the
//! fully-archived set are subtracted, and only the remainder pays for detail
//! fetches. Delta detection then narrows the component work per video. All
//! decisions here are pure functions over sync-state and on-disk records so
//! they are unit-testable without any network.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::NaiveDate;
use regex::Regex;

use crate::config::ComponentsConfig;
use crate::model::VideoRecord;
use crate::state::{SyncStateStore, VideoState};

/// Why a candidate was excluded from the detail fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Terminal availability recorded in sync-state.
    Unavailable,
    /// Every requested component is present and fresh.
    Complete,
}

/// One enumerated id with its planning decision.
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub video_id: String,
    pub skip: Option<SkipReason>,
}

/// Options that widen the fetch set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceOptions {
    /// Refetch everything, ignoring the fully-archived exclusion.
    pub force: bool,
    /// Re-include archived videos published on or after this date.
    pub force_date: Option<NaiveDate>,
}

/// Splits the enumerated candidates into fetch jobs and skips.
///
/// Order is preserved: the returned jobs follow the remote enumeration order,
/// which is what checkpoint commits and resumability lean on.
pub fn plan_jobs(
    archive_root: &Path,
    candidates: &[String],
    state: &SyncStateStore,
    components: &ComponentsConfig,
    force: ForceOptions,
) -> Vec<VideoJob> {
    let unavailable: BTreeSet<String> = state.known_unavailable_set();
    candidates
        .iter()
        .map(|video_id| {
            if unavailable.contains(video_id) {
                // Terminal availability wins over --force: the metadata is on
                // disk and the remote has nothing more to give.
                return VideoJob {
                    video_id: video_id.clone(),
                    skip: Some(SkipReason::Unavailable),
                };
            }
            if force.force {
                return VideoJob {
                    video_id: video_id.clone(),
                    skip: None,
                };
            }
            let Some(entry) = state.video(video_id) else {
                return VideoJob {
                    video_id: video_id.clone(),
                    skip: None,
                };
            };
            if !is_complete(archive_root, entry, components) {
                return VideoJob {
                    video_id: video_id.clone(),
                    skip: None,
                };
            }
            if let Some(cutoff) = force.force_date
                && published_on_or_after(archive_root, entry, cutoff)
            {
                return VideoJob {
                    video_id: video_id.clone(),
                    skip: None,
                };
            }
            VideoJob {
                video_id: video_id.clone(),
                skip: Some(SkipReason::Complete),
            }
        })
        .collect()
}

/// A video counts as complete when its directory exists and every requested
/// component has a fetch stamp.
fn is_complete(archive_root: &Path, entry: &VideoState, components: &ComponentsConfig) -> bool {
    if entry.path.is_empty() || !archive_root.join(&entry.path).exists() {
        return false;
    }
    let stamps = &entry.components;
    if components.metadata && stamps.metadata.is_none() {
        return false;
    }
    if components.thumbnails && stamps.thumbnail.is_none() {
        return false;
    }
    if components.captions && stamps.captions.is_none() {
        return false;
    }
    if components.comments && stamps.comments.is_none() {
        return false;
    }
    if components.videos && stamps.video.is_none() {
        return false;
    }
    true
}

fn published_on_or_after(archive_root: &Path, entry: &VideoState, cutoff: NaiveDate) -> bool {
    let metadata_path = archive_root.join(&entry.path).join("metadata.json");
    match VideoRecord::load(&metadata_path) {
        Ok(record) => record
            .published_at
            .map(|at| at.date_naive() >= cutoff)
            .unwrap_or(true),
        // Without a readable record the safe answer is to refetch.
        Err(_) => true,
    }
}

/// Per-component work for one freshly fetched detail record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentPlan {
    pub write_metadata: bool,
    pub fetch_thumbnail: bool,
    /// Caption languages to download, already regex-filtered.
    pub caption_languages: Vec<String>,
    pub fetch_comments: bool,
    pub track_video: bool,
    pub download_video: bool,
}

/// Delta detection between the fresh detail record and the sync-state
/// snapshot of the previous pass.
pub fn component_plan(
    detail: &VideoRecord,
    previous: Option<&VideoState>,
    components: &ComponentsConfig,
    caption_filter: Option<&Regex>,
) -> ComponentPlan {
    let mut plan = ComponentPlan::default();
    if detail.suppresses_fetch() {
        // Availability is recorded by the caller; nothing else is fetched.
        plan.write_metadata = components.metadata;
        return plan;
    }

    let stamps = previous.map(|p| &p.components);

    if components.metadata {
        plan.write_metadata = true;
    }

    if components.thumbnails {
        plan.fetch_thumbnail = stamps.is_none_or(|s| s.thumbnail.is_none());
    }

    if components.captions {
        let already: BTreeSet<&str> = previous
            .map(|p| p.captions_fetched.iter().map(String::as_str).collect())
            .unwrap_or_default();
        plan.caption_languages = detail
            .captions_available
            .iter()
            .filter(|code| !already.contains(code.as_str()))
            .filter(|code| caption_filter.is_none_or(|filter| filter.is_match(code)))
            .cloned()
            .collect();
    }

    if components.comments {
        let count_grew = match (previous.and_then(|p| p.comment_count), detail.comment_count) {
            (Some(old), Some(new)) => new > old,
            _ => true,
        };
        plan.fetch_comments = stamps.is_none_or(|s| s.comments.is_none()) || count_grew;
    }

    if components.videos {
        plan.download_video = stamps.is_none_or(|s| s.video.is_none());
    } else {
        plan.track_video = previous.is_none_or(|p| {
            matches!(p.download_status, crate::model::DownloadStatus::NotTracked)
        });
    }

    plan
}

/// True when the fresh detail carries no observable change against the
/// snapshot: counts equal and no new caption languages. Such videos bump
/// `last_sync` without any disk write.
pub fn detail_unchanged(detail: &VideoRecord, previous: &VideoState) -> bool {
    previous.view_count == detail.view_count
        && previous.like_count == detail.like_count
        && previous.comment_count == detail.comment_count
        && detail
            .captions_available
            .iter()
            .all(|code| previous.captions_fetched.iter().any(|have| have == code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, DownloadStatus};
    use crate::state::ComponentStamps;
    use chrono::Utc;
    use tempfile::tempdir;

    fn detail(id: &str) -> VideoRecord {
        VideoRecord {
            video_id: id.into(),
            title: "t".into(),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: String::new(),
            published_at: Some("2024-05-01T00:00:00Z".parse().unwrap()),
            duration_seconds: Some(10),
            view_count: Some(100),
            like_count: Some(10),
            comment_count: Some(3),
            thumbnail_url: None,
            license: None,
            privacy: None,
            availability: Availability::Public,
            tags: Vec::new(),
            categories: Vec::new(),
            language: None,
            captions_available: vec!["en".into(), "fr".into()],
            download_status: DownloadStatus::NotTracked,
            file_path: String::new(),
            fetched_at: None,
            updated_at: None,
            less_complete: false,
        }
    }

    fn complete_state(path: &str) -> VideoState {
        let now = Utc::now();
        VideoState {
            availability: Availability::Public,
            path: path.into(),
            components: ComponentStamps {
                metadata: Some(now),
                thumbnail: Some(now),
                captions: Some(now),
                comments: Some(now),
                video: None,
            },
            captions_fetched: vec!["en".into(), "fr".into()],
            view_count: Some(100),
            like_count: Some(10),
            comment_count: Some(3),
            download_status: DownloadStatus::Tracked,
            ..VideoState::default()
        }
    }

    #[test]
    fn unavailable_candidates_are_excluded() {
        let dir = tempdir().unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("gone", |v| v.availability = Availability::Removed)
            .unwrap();

        let jobs = plan_jobs(
            dir.path(),
            &["gone".into(), "new".into()],
            &store,
            &ComponentsConfig::default(),
            ForceOptions::default(),
        );
        assert_eq!(jobs[0].skip, Some(SkipReason::Unavailable));
        assert_eq!(jobs[1].skip, None);
    }

    #[test]
    fn unavailable_exclusion_survives_force() {
        let dir = tempdir().unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("gone", |v| v.availability = Availability::Private)
            .unwrap();
        let jobs = plan_jobs(
            dir.path(),
            &["gone".into()],
            &store,
            &ComponentsConfig::default(),
            ForceOptions {
                force: true,
                force_date: None,
            },
        );
        assert_eq!(jobs[0].skip, Some(SkipReason::Unavailable));
    }

    #[test]
    fn complete_videos_are_excluded_until_forced() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("videos/x")).unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("done", |v| *v = complete_state("videos/x"))
            .unwrap();

        let components = ComponentsConfig::default();
        let jobs = plan_jobs(
            dir.path(),
            &["done".into()],
            &store,
            &components,
            ForceOptions::default(),
        );
        assert_eq!(jobs[0].skip, Some(SkipReason::Complete));

        let jobs = plan_jobs(
            dir.path(),
            &["done".into()],
            &store,
            &components,
            ForceOptions {
                force: true,
                force_date: None,
            },
        );
        assert_eq!(jobs[0].skip, None);
    }

    #[test]
    fn missing_directory_defeats_completeness() {
        let dir = tempdir().unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("moved", |v| *v = complete_state("videos/never-created"))
            .unwrap();
        let jobs = plan_jobs(
            dir.path(),
            &["moved".into()],
            &store,
            &ComponentsConfig::default(),
            ForceOptions::default(),
        );
        assert_eq!(jobs[0].skip, None);
    }

    #[test]
    fn force_date_reincludes_recent_videos() {
        let dir = tempdir().unwrap();
        let video_dir = dir.path().join("videos/x");
        std::fs::create_dir_all(&video_dir).unwrap();
        crate::model::write_json_atomic(&video_dir.join("metadata.json"), &detail("done"))
            .unwrap();
        let mut store = SyncStateStore::open(dir.path()).unwrap();
        store
            .update_video("done", |v| *v = complete_state("videos/x"))
            .unwrap();

        // Published 2024-05-01; a cutoff before that re-includes it.
        let jobs = plan_jobs(
            dir.path(),
            &["done".into()],
            &store,
            &ComponentsConfig::default(),
            ForceOptions {
                force: false,
                force_date: Some("2024-04-01".parse().unwrap()),
            },
        );
        assert_eq!(jobs[0].skip, None);

        let jobs = plan_jobs(
            dir.path(),
            &["done".into()],
            &store,
            &ComponentsConfig::default(),
            ForceOptions {
                force: false,
                force_date: Some("2024-06-01".parse().unwrap()),
            },
        );
        assert_eq!(jobs[0].skip, Some(SkipReason::Complete));
    }

    #[test]
    fn first_fetch_plans_every_requested_component() {
        let plan = component_plan(
            &detail("new"),
            None,
            &ComponentsConfig::default(),
            None,
        );
        assert!(plan.write_metadata);
        assert!(plan.fetch_thumbnail);
        assert_eq!(plan.caption_languages, vec!["en", "fr"]);
        assert!(plan.fetch_comments);
        assert!(plan.track_video);
        assert!(!plan.download_video);
    }

    #[test]
    fn comment_growth_triggers_refetch() {
        let mut previous = complete_state("videos/x");
        previous.comment_count = Some(2);
        let plan = component_plan(
            &detail("v"),
            Some(&previous),
            &ComponentsConfig::default(),
            None,
        );
        assert!(plan.fetch_comments);

        let previous = complete_state("videos/x");
        let plan = component_plan(
            &detail("v"),
            Some(&previous),
            &ComponentsConfig::default(),
            None,
        );
        assert!(!plan.fetch_comments);
    }

    #[test]
    fn only_new_caption_languages_are_fetched() {
        let mut previous = complete_state("videos/x");
        previous.captions_fetched = vec!["en".into()];
        let plan = component_plan(
            &detail("v"),
            Some(&previous),
            &ComponentsConfig::default(),
            None,
        );
        assert_eq!(plan.caption_languages, vec!["fr"]);
    }

    #[test]
    fn caption_regex_still_filters_new_languages() {
        let mut previous = complete_state("videos/x");
        previous.captions_fetched = vec!["en".into()];
        let filter = Regex::new("^en").unwrap();
        let plan = component_plan(
            &detail("v"),
            Some(&previous),
            &ComponentsConfig::default(),
            Some(&filter),
        );
        // "fr" is new but excluded by the configured filter.
        assert!(plan.caption_languages.is_empty());
    }

    #[test]
    fn terminal_availability_suppresses_components() {
        let mut gone = detail("v");
        gone.availability = Availability::Removed;
        let plan = component_plan(&gone, None, &ComponentsConfig::default(), None);
        assert!(plan.write_metadata);
        assert!(!plan.fetch_thumbnail);
        assert!(plan.caption_languages.is_empty());
        assert!(!plan.fetch_comments);
        assert!(!plan.track_video);
    }

    #[test]
    fn unchanged_detail_detected() {
        let previous = complete_state("videos/x");
        assert!(detail_unchanged(&detail("v"), &previous));

        let mut grew = detail("v");
        grew.view_count = Some(101);
        assert!(!detail_unchanged(&grew, &previous));
    }
}
