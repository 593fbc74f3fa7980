#![forbid(unsafe_code)]

//! Unified enumeration facade over the two backends.
//!
//! Selection rules, per operation:
//! - flat listings → extractor (cheap, no quota);
//! - batched detail metadata → data API when a key is present, else
//!   extractor per id;
//! - comments → data API when a key is present, else extractor best-effort;
//! - captions and thumbnails → extractor with a language filter.
//!
//! The facade never silently drops ids: every id handed to `detail_batch`
//! comes back either as a record or as a per-id error. When the data API
//! fails for a reason other than quota, the operation falls back to the
//! extractor and the result is annotated as less complete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use crate::api::{DataApiClient, MAX_BATCH};
use crate::config::{SourceConfig, SourceKind};
use crate::error::ArchiveError;
use crate::extractor::Extractor;
use crate::model::{CaptionTrack, ChannelRecord, CommentRecord, PlaylistRecord, VideoRecord};

/// Per-id outcome of a batched detail fetch.
pub type DetailOutcomes = BTreeMap<String, Result<VideoRecord, ArchiveError>>;

#[derive(Debug, Clone)]
pub struct Enumerator {
    api: Option<DataApiClient>,
    extractor: Extractor,
    scratch_dir: PathBuf,
}

impl Enumerator {
    pub fn new(api: Option<DataApiClient>, extractor: Extractor, scratch_dir: PathBuf) -> Self {
        Self {
            api,
            extractor,
            scratch_dir,
        }
    }

    pub fn has_api(&self) -> bool {
        self.api.is_some()
    }

    /// Flat enumeration of a source: remote order, ids only.
    pub fn list_flat(&self, source: &SourceConfig) -> Result<Vec<String>> {
        match source.kind {
            SourceKind::Channel => self.extractor.list_flat(&channel_videos_url(&source.url)),
            SourceKind::Playlist | SourceKind::AdHocUrl => self.extractor.list_flat(&source.url),
            SourceKind::VideoList => Ok(ids_from_video_urls(&source.url)),
        }
    }

    /// Detailed records for up to [`MAX_BATCH`] ids. Every input id appears
    /// in the result map exactly once.
    pub fn detail_batch(&self, ids: &[String]) -> Result<DetailOutcomes> {
        let mut outcomes = DetailOutcomes::new();
        if ids.is_empty() {
            return Ok(outcomes);
        }

        if let Some(api) = &self.api {
            for chunk in ids.chunks(MAX_BATCH) {
                match api.videos_batch(chunk) {
                    Ok(records) => {
                        let mut returned: BTreeMap<String, VideoRecord> = records
                            .into_iter()
                            .map(|record| (record.video_id.clone(), record))
                            .collect();
                        for id in chunk {
                            match returned.remove(id.as_str()) {
                                Some(record) => {
                                    outcomes.insert(id.clone(), Ok(record));
                                }
                                None => {
                                    // The API omits deleted/private ids from the
                                    // response; the extractor can still tell us
                                    // which it is.
                                    debug!(video_id = %id, "id missing from batch; probing via extractor");
                                    outcomes.insert(id.clone(), self.extractor_detail(id));
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let classified = err.downcast::<ArchiveError>();
                        match classified {
                            Ok(ArchiveError::QuotaExhausted) => {
                                return Err(ArchiveError::QuotaExhausted.into());
                            }
                            Ok(other) => {
                                warn!(
                                    error = %other,
                                    "data API batch failed; degrading to extractor"
                                );
                                for id in chunk {
                                    outcomes.insert(id.clone(), self.extractor_detail(id));
                                }
                            }
                            Err(other) => return Err(other),
                        }
                    }
                }
            }
        } else {
            for id in ids {
                outcomes.insert(id.clone(), self.extractor_detail(id));
            }
        }

        Ok(outcomes)
    }

    fn extractor_detail(&self, id: &str) -> Result<VideoRecord, ArchiveError> {
        match self.extractor.detail(id) {
            Ok(record) => Ok(record),
            Err(err) => Err(err
                .downcast::<ArchiveError>()
                .unwrap_or_else(|other| ArchiveError::ExtractorIncompatible(other.to_string()))),
        }
    }

    /// Channel metadata. `None` when no API key is configured; the caller
    /// synthesizes a minimal record from the first detailed video instead.
    pub fn channel_info(&self, source_url: &str) -> Result<Option<ChannelRecord>> {
        let Some(api) = &self.api else {
            return Ok(None);
        };
        let Some(selector) = channel_selector(source_url) else {
            return Ok(None);
        };
        api.channel(&selector).map(Some)
    }

    /// Playlist metadata plus authoritative membership order.
    pub fn playlist_info(&self, source_url: &str) -> Result<PlaylistRecord> {
        let playlist_id = playlist_id_from_url(source_url)
            .ok_or_else(|| ArchiveError::Data(format!("no playlist id in {source_url}")))?;
        if let Some(api) = &self.api {
            let mut record = api.playlist(&playlist_id)?;
            let ids = api.playlist_video_ids(&playlist_id)?;
            record.set_video_ids(ids);
            return Ok(record);
        }
        // Keyless fallback: membership from the flat listing, title unknown.
        let ids = self.extractor.list_flat(source_url)?;
        let mut record = PlaylistRecord {
            playlist_id: playlist_id.clone(),
            title: playlist_id,
            description: String::new(),
            channel_id: String::new(),
            channel_name: String::new(),
            video_ids: Vec::new(),
            video_count: 0,
            published_at: None,
            fetched_at: None,
        };
        record.set_video_ids(ids);
        Ok(record)
    }

    /// Comment tree for one video. The boolean is true when the result came
    /// from the extractor and may be truncated.
    pub fn comments(&self, video_id: &str, depth: u32) -> Result<(Vec<CommentRecord>, bool)> {
        if depth == 0 {
            return Ok((Vec::new(), false));
        }
        if let Some(api) = &self.api {
            match api.comment_threads(video_id, depth) {
                Ok(comments) => return Ok((comments, false)),
                Err(err) => match err.downcast::<ArchiveError>() {
                    Ok(ArchiveError::QuotaExhausted) => {
                        return Err(ArchiveError::QuotaExhausted.into());
                    }
                    Ok(ArchiveError::RemoteUnavailable(_)) => return Ok((Vec::new(), false)),
                    Ok(other) => {
                        warn!(video_id, error = %other, "comment fetch degrading to extractor");
                    }
                    Err(other) => return Err(other),
                },
            }
        }
        let work_dir = self.scratch_dir.join("comments").join(video_id);
        let comments = self.extractor.comments(video_id, &work_dir)?;
        let _ = std::fs::remove_dir_all(&work_dir);
        Ok((comments, true))
    }

    /// Caption download, extractor only.
    pub fn captions(
        &self,
        video_id: &str,
        languages: &[String],
        dest_dir: &Path,
        basename: &str,
    ) -> Result<Vec<CaptionTrack>> {
        self.extractor
            .fetch_captions(video_id, languages, dest_dir, basename)
    }

    /// Thumbnail download, extractor only.
    pub fn thumbnail(&self, video_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        self.extractor.fetch_thumbnail(video_id, dest_dir)
    }

    /// Video binary download, extractor only.
    pub fn download_video(
        &self,
        video_id: &str,
        dest_dir: &Path,
        basename: &str,
    ) -> Result<PathBuf> {
        self.extractor.download_video(video_id, dest_dir, basename)
    }
}

/// Normalizes a channel URL so `/videos` is not appended twice.
fn channel_videos_url(channel_url: &str) -> String {
    let (without_fragment, _) = match channel_url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (channel_url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };
    let base = base.trim_end_matches('/');
    let mut result = if base.ends_with("/videos") {
        base.to_string()
    } else {
        format!("{base}/videos")
    };
    if let Some(query) = query {
        result.push('?');
        result.push_str(query);
    }
    result
}

/// Extracts the API selector from a channel URL: a raw `UC…` id or an
/// `@handle`.
fn channel_selector(url: &str) -> Option<String> {
    let path = url.split("//").nth(1).unwrap_or(url);
    let mut segments = path.split('/').skip(1).filter(|s| !s.is_empty());
    match segments.next()? {
        "channel" => segments.next().map(|id| id.to_string()),
        segment if segment.starts_with('@') => Some(segment.to_string()),
        _ => None,
    }
}

/// Extracts `list=` from a playlist URL.
fn playlist_id_from_url(url: &str) -> Option<String> {
    let query = url.split_once('?').map(|(_, q)| q)?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("list=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Pulls watch-URL ids out of a whitespace- or comma-separated list.
fn ids_from_video_urls(value: &str) -> Vec<String> {
    value
        .split([',', ' ', '\n'])
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            if let Some((_, rest)) = part.split_once("watch?v=") {
                let id: String = rest.chars().take_while(|c| *c != '&').collect();
                return Some(id);
            }
            if let Some((_, rest)) = part.split_once("/shorts/") {
                let id: String = rest.chars().take_while(|c| *c != '?').collect();
                return Some(id);
            }
            // An 11-character opaque token is already an id.
            if part.len() == 11 && !part.contains('/') {
                return Some(part.to_string());
            }
            None
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_normalization() {
        assert_eq!(
            channel_videos_url("https://www.youtube.com/@chan"),
            "https://www.youtube.com/@chan/videos"
        );
        assert_eq!(
            channel_videos_url("https://www.youtube.com/@chan/videos/"),
            "https://www.youtube.com/@chan/videos"
        );
        assert_eq!(
            channel_videos_url("https://www.youtube.com/@chan?view=0"),
            "https://www.youtube.com/@chan/videos?view=0"
        );
    }

    #[test]
    fn channel_selector_extraction() {
        assert_eq!(
            channel_selector("https://www.youtube.com/channel/UCabc").as_deref(),
            Some("UCabc")
        );
        assert_eq!(
            channel_selector("https://www.youtube.com/@handle/videos").as_deref(),
            Some("@handle")
        );
        assert_eq!(channel_selector("https://example.org/other"), None);
    }

    #[test]
    fn playlist_id_extraction() {
        assert_eq!(
            playlist_id_from_url("https://www.youtube.com/playlist?list=PL123").as_deref(),
            Some("PL123")
        );
        assert_eq!(
            playlist_id_from_url("https://www.youtube.com/watch?v=abc&list=PL9").as_deref(),
            Some("PL9")
        );
        assert_eq!(playlist_id_from_url("https://www.youtube.com/playlist"), None);
    }

    #[test]
    fn video_list_parsing() {
        let ids = ids_from_video_urls(
            "https://www.youtube.com/watch?v=abcdefghijk&t=4 lmnopqrstuv,https://www.youtube.com/shorts/zyxwvutsrqp",
        );
        assert_eq!(ids, vec!["abcdefghijk", "lmnopqrstuv", "zyxwvutsrqp"]);
    }

    #[test]
    fn keyless_facade_has_no_channel_info() {
        let facade = Enumerator::new(
            None,
            Extractor::default(),
            std::env::temp_dir(),
        );
        assert!(!facade.has_api());
        assert!(facade
            .channel_info("https://www.youtube.com/@chan")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn depth_zero_comments_are_empty_without_any_backend_call() {
        let facade = Enumerator::new(None, Extractor::default(), std::env::temp_dir());
        let (comments, truncated) = facade.comments("abcdefghijk", 0).unwrap();
        assert!(comments.is_empty());
        assert!(!truncated);
    }
}
