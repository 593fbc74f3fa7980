#![forbid(unsafe_code)]

//! Core entity records persisted inside the content repository.
//!
//! All structs in this module mirror how entities are serialized to disk:
//! one `metadata.json` per video, playlist, and channel, plus sidecar files
//! for captions and comments. Remote identifiers are authoritative keys.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote availability of a video. The three non-public states are terminal:
/// once recorded, the pipeline stops fetching components for the video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Public,
    Private,
    Removed,
    Unavailable,
}

impl Availability {
    /// Terminal states suppress any further component fetch.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Availability::Public)
    }
}

/// Privacy status as reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Unlisted,
    Private,
}

/// License reported by the remote service. The remote spelling is kept so
/// filters can match the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum License {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "creativeCommon")]
    CreativeCommon,
}

/// Whether the video binary itself is registered, present, or failed.
/// `Tracked` is compatible with "no bytes present locally": the URL is
/// registered with the blob store without retrieving content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStatus {
    NotTracked,
    Tracked,
    Downloaded,
    Failed,
}

/// One archived video. Written as `videos/<path>/metadata.json`.
///
/// Many fields are optional so partially known metadata (extractor-only
/// fetches, very old uploads) still round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<Privacy>,
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Sorted, de-duplicated BCP-47 codes of every caption track the remote
    /// reports for this video.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captions_available: Vec<String>,
    pub download_status: DownloadStatus,
    /// Path of the video's directory relative to the archive root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set when the record was produced by the extractor fallback and may be
    /// missing API-only attributes such as license or exact counts.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub less_complete: bool,
}

impl VideoRecord {
    /// Normalizes the caption language list: sorted, unique.
    pub fn set_captions_available(&mut self, mut codes: Vec<String>) {
        codes.sort();
        codes.dedup();
        self.captions_available = codes;
    }

    /// Terminal availability means no further component fetches happen.
    pub fn suppresses_fetch(&self) -> bool {
        self.availability.is_terminal()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// One archived playlist. Written as `playlists/<playlist_id>/metadata.json`.
/// `video_count` always equals `video_ids.len()`; order is the remote order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRecord {
    pub playlist_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_name: String,
    pub video_ids: Vec<String>,
    pub video_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl PlaylistRecord {
    /// Replaces the membership list, keeping the count invariant.
    pub fn set_video_ids(&mut self, ids: Vec<String>) {
        self.video_count = ids.len();
        self.video_ids = ids;
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// One archived channel. Written as `channels/<channel_id>/metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub playlist_ids: Vec<String>,
}

impl ChannelRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// One caption track sidecar next to the video directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub video_id: String,
    /// BCP-47 language code.
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language_name: String,
    #[serde(default)]
    pub auto_generated: bool,
    pub format: String,
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One comment, with replies nested one level under their root. The on-disk
/// `comments.json` is an ordered array of roots; every reply's `parent_id`
/// resolves to its enclosing root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub video_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<CommentRecord>,
}

/// Checks the comment-file invariant: replies carry the id of their root and
/// never nest further.
pub fn validate_comment_tree(roots: &[CommentRecord]) -> Result<()> {
    for root in roots {
        if root.parent_id.is_some() {
            anyhow::bail!("root comment {} carries a parent id", root.id);
        }
        for reply in &root.replies {
            if reply.parent_id.as_deref() != Some(root.id.as_str()) {
                anyhow::bail!(
                    "reply {} does not resolve to its root {}",
                    reply.id,
                    root.id
                );
            }
            if !reply.replies.is_empty() {
                anyhow::bail!("reply {} nests deeper than one level", reply.id);
            }
        }
    }
    Ok(())
}

/// Serializes any entity record to `path` atomically (write then rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut payload = serde_json::to_vec_pretty(value).context("serializing record")?;
    payload.push(b'\n');
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_video() -> VideoRecord {
        VideoRecord {
            video_id: "dQw4w9WgXcQ".into(),
            title: "Sample".into(),
            description: String::new(),
            channel_id: "UC123".into(),
            channel_name: "Channel".into(),
            published_at: Some("2024-01-01T00:00:00Z".parse().unwrap()),
            duration_seconds: Some(212),
            view_count: Some(10),
            like_count: Some(2),
            comment_count: Some(1),
            thumbnail_url: None,
            license: Some(License::Standard),
            privacy: Some(Privacy::Public),
            availability: Availability::Public,
            tags: vec!["music".into()],
            categories: Vec::new(),
            language: None,
            captions_available: Vec::new(),
            download_status: DownloadStatus::NotTracked,
            file_path: "videos/2024-01-01_dQw4w9WgXcQ".into(),
            fetched_at: None,
            updated_at: None,
            less_complete: false,
        }
    }

    #[test]
    fn availability_terminal_set() {
        assert!(!Availability::Public.is_terminal());
        assert!(Availability::Private.is_terminal());
        assert!(Availability::Removed.is_terminal());
        assert!(Availability::Unavailable.is_terminal());
    }

    #[test]
    fn captions_available_sorted_unique() {
        let mut video = sample_video();
        video.set_captions_available(vec!["fr".into(), "en".into(), "fr".into()]);
        assert_eq!(video.captions_available, vec!["en", "fr"]);
    }

    #[test]
    fn video_record_round_trips_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let video = sample_video();
        write_json_atomic(&path, &video).unwrap();
        let loaded = VideoRecord::load(&path).unwrap();
        assert_eq!(loaded.video_id, video.video_id);
        assert_eq!(loaded.license, video.license);
        assert_eq!(loaded.availability, Availability::Public);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn tracked_status_serializes_kebab_case() {
        let json = serde_json::to_string(&DownloadStatus::NotTracked).unwrap();
        assert_eq!(json, "\"not-tracked\"");
    }

    #[test]
    fn playlist_count_follows_membership() {
        let mut playlist = PlaylistRecord {
            playlist_id: "PL1".into(),
            title: "List".into(),
            description: String::new(),
            channel_id: "UC123".into(),
            channel_name: String::new(),
            video_ids: Vec::new(),
            video_count: 0,
            published_at: None,
            fetched_at: None,
        };
        playlist.set_video_ids(vec!["a".into(), "b".into()]);
        assert_eq!(playlist.video_count, 2);
    }

    #[test]
    fn comment_tree_invariant_enforced() {
        let root = CommentRecord {
            id: "c1".into(),
            video_id: "v".into(),
            author: "a".into(),
            author_channel_id: None,
            text: "hello".into(),
            published_at: None,
            like_count: None,
            parent_id: None,
            reply_count: Some(1),
            replies: vec![CommentRecord {
                id: "c2".into(),
                video_id: "v".into(),
                author: "b".into(),
                author_channel_id: None,
                text: "hi".into(),
                published_at: None,
                like_count: None,
                parent_id: Some("c1".into()),
                reply_count: None,
                replies: Vec::new(),
            }],
        };
        assert!(validate_comment_tree(&[root.clone()]).is_ok());

        let mut broken = root;
        broken.replies[0].parent_id = Some("other".into());
        assert!(validate_comment_tree(&[broken]).is_err());
    }
}
