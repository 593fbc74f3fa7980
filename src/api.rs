#![forbid(unsafe_code)]

//! Authenticated Data-API backend.
//!
//! Quota-priced and batched: detailed video attributes, playlist membership,
//! channel statistics, and comment threads come from here whenever a key is
//! configured. Every response failure is classified so the facade can route
//! quota exhaustion to the governor and everything else to the retry policy.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ArchiveError;
use crate::model::{
    Availability, ChannelRecord, CommentRecord, License, PlaylistRecord, Privacy, VideoRecord,
};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Hard API limit on ids per detail call.
pub const MAX_BATCH: usize = 50;

#[derive(Debug, Clone)]
pub struct DataApiClient {
    agent: ureq::Agent,
    key: String,
    base: String,
}

impl DataApiClient {
    pub fn new(key: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .build();
        Self {
            agent,
            key,
            base: API_BASE.to_string(),
        }
    }

    /// Channel metadata by raw id (`UC…`) or handle (`@name`).
    pub fn channel(&self, id_or_handle: &str) -> Result<ChannelRecord> {
        let mut request = self
            .agent
            .get(&format!("{}/channels", self.base))
            .query("part", "snippet,statistics,contentDetails")
            .query("key", &self.key);
        request = if let Some(handle) = id_or_handle.strip_prefix('@') {
            request.query("forHandle", handle)
        } else {
            request.query("id", id_or_handle)
        };

        let listing: Listing<ChannelItem> = call_json(request)?;
        let item = listing
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ArchiveError::RemoteUnavailable(format!("channel {id_or_handle}")))?;
        Ok(item.into_record())
    }

    /// Playlist metadata (title, owner, declared size).
    pub fn playlist(&self, playlist_id: &str) -> Result<PlaylistRecord> {
        let request = self
            .agent
            .get(&format!("{}/playlists", self.base))
            .query("part", "snippet,contentDetails")
            .query("id", playlist_id)
            .query("key", &self.key);
        let listing: Listing<PlaylistItemResource> = call_json(request)?;
        let item = listing
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ArchiveError::RemoteUnavailable(format!("playlist {playlist_id}")))?;
        Ok(item.into_record())
    }

    /// Every video id in a playlist, in the playlist's authoritative order.
    /// Pages through the listing 50 at a time.
    pub fn playlist_video_ids(&self, playlist_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .agent
                .get(&format!("{}/playlistItems", self.base))
                .query("part", "contentDetails")
                .query("playlistId", playlist_id)
                .query("maxResults", "50")
                .query("key", &self.key);
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }
            let listing: Listing<PlaylistEntry> = call_json(request)?;
            for item in listing.items {
                ids.push(item.content_details.video_id);
            }
            match listing.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(ids)
    }

    /// Detailed records for up to [`MAX_BATCH`] ids in one quota unit. The
    /// response may omit ids (deleted or private videos); callers surface
    /// those per id via the facade's batching contract.
    pub fn videos_batch(&self, ids: &[String]) -> Result<Vec<VideoRecord>> {
        if ids.len() > MAX_BATCH {
            return Err(ArchiveError::Data(format!(
                "batch of {} exceeds the {} id limit",
                ids.len(),
                MAX_BATCH
            ))
            .into());
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = self
            .agent
            .get(&format!("{}/videos", self.base))
            .query("part", "snippet,contentDetails,statistics,status")
            .query("id", &ids.join(","))
            .query("maxResults", "50")
            .query("key", &self.key);
        let listing: Listing<VideoItem> = call_json(request)?;
        Ok(listing.items.into_iter().map(VideoItem::into_record).collect())
    }

    /// Comment threads for one video, replies included, newest first as the
    /// API returns them. `depth` 0 disables, 1 keeps roots only.
    pub fn comment_threads(&self, video_id: &str, depth: u32) -> Result<Vec<CommentRecord>> {
        if depth == 0 {
            return Ok(Vec::new());
        }
        let mut roots = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .agent
                .get(&format!("{}/commentThreads", self.base))
                .query("part", "snippet,replies")
                .query("videoId", video_id)
                .query("maxResults", "100")
                .query("textFormat", "plainText")
                .query("key", &self.key);
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }
            let listing: Listing<CommentThread> = call_json(request)?;
            for thread in listing.items {
                roots.push(thread.into_record(video_id, depth));
            }
            match listing.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(roots)
    }
}

/// Performs the request and classifies any failure.
fn call_json<T: serde::de::DeserializeOwned>(request: ureq::Request) -> Result<T> {
    match request.call() {
        Ok(response) => response
            .into_json::<T>()
            .context("deserializing API response"),
        Err(ureq::Error::Status(code, response)) => {
            let retry_after = response
                .header("retry-after")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.into_string().unwrap_or_default();
            Err(classify_status(code, &body, retry_after).into())
        }
        Err(ureq::Error::Transport(err)) => {
            Err(ArchiveError::NetworkTransient(err.to_string()).into())
        }
    }
}

/// Maps an HTTP failure status plus error body onto the pipeline's classes.
/// Quota exhaustion is deliberately distinguished from rate limiting: the
/// former waits for the wall-clock reset, the latter backs off.
fn classify_status(code: u16, body: &str, retry_after: Option<Duration>) -> ArchiveError {
    let reason = error_reason(body);
    match code {
        403 => match reason.as_deref() {
            Some("quotaExceeded") | Some("dailyLimitExceeded") => ArchiveError::QuotaExhausted,
            Some("rateLimitExceeded") | Some("userRateLimitExceeded") => {
                ArchiveError::RateLimited { retry_after }
            }
            Some("commentsDisabled") => {
                ArchiveError::RemoteUnavailable("comments disabled".into())
            }
            _ => ArchiveError::Auth(format!("API rejected the request (403): {reason:?}")),
        },
        400 | 401 => ArchiveError::Auth(format!("API key rejected ({code})")),
        404 => ArchiveError::RemoteUnavailable(format!("not found: {reason:?}")),
        429 => ArchiveError::RateLimited { retry_after },
        code if code >= 500 => ArchiveError::NetworkTransient(format!("server error {code}")),
        code => ArchiveError::Data(format!("unexpected status {code}")),
    }
}

/// Pulls `error.errors[0].reason` out of an API error body.
fn error_reason(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("errors")?
        .get(0)?
        .get("reason")?
        .as_str()
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Response models. Only the fields the pipeline reads; everything optional
// that the remote has ever been seen to omit.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    snippet: Option<ChannelSnippet>,
    statistics: Option<ChannelStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelSnippet {
    title: Option<String>,
    description: Option<String>,
    custom_url: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    video_count: Option<String>,
}

impl ChannelItem {
    fn into_record(self) -> ChannelRecord {
        let snippet = self.snippet.unwrap_or(ChannelSnippet {
            title: None,
            description: None,
            custom_url: None,
            published_at: None,
        });
        let statistics = self.statistics;
        ChannelRecord {
            channel_id: self.id,
            title: snippet.title.unwrap_or_default(),
            description: snippet.description.unwrap_or_default(),
            custom_url: snippet.custom_url,
            subscriber_count: statistics
                .as_ref()
                .and_then(|s| s.subscriber_count.as_deref())
                .and_then(|s| s.parse().ok()),
            video_count: statistics
                .as_ref()
                .and_then(|s| s.video_count.as_deref())
                .and_then(|s| s.parse().ok()),
            created_at: snippet.published_at,
            last_sync: None,
            video_ids: Vec::new(),
            playlist_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    id: String,
    snippet: Option<PlaylistSnippet>,
    content_details: Option<PlaylistContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    title: Option<String>,
    description: Option<String>,
    channel_id: Option<String>,
    channel_title: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    item_count: Option<usize>,
}

impl PlaylistItemResource {
    fn into_record(self) -> PlaylistRecord {
        let snippet = self.snippet.unwrap_or(PlaylistSnippet {
            title: None,
            description: None,
            channel_id: None,
            channel_title: None,
            published_at: None,
        });
        PlaylistRecord {
            playlist_id: self.id,
            title: snippet.title.unwrap_or_default(),
            description: snippet.description.unwrap_or_default(),
            channel_id: snippet.channel_id.unwrap_or_default(),
            channel_name: snippet.channel_title.unwrap_or_default(),
            video_ids: Vec::new(),
            video_count: self
                .content_details
                .and_then(|details| details.item_count)
                .unwrap_or(0),
            published_at: snippet.published_at,
            fetched_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistEntry {
    content_details: PlaylistEntryDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistEntryDetails {
    video_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: Option<VideoSnippet>,
    content_details: Option<VideoContentDetails>,
    statistics: Option<VideoStatistics>,
    status: Option<VideoStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    published_at: Option<DateTime<Utc>>,
    channel_id: Option<String>,
    channel_title: Option<String>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    category_id: Option<String>,
    default_audio_language: Option<String>,
    default_language: Option<String>,
    thumbnails: Option<ThumbnailSet>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailSet {
    maxres: Option<Thumbnail>,
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl ThumbnailSet {
    fn best_url(self) -> Option<String> {
        self.maxres
            .or(self.high)
            .or(self.medium)
            .or(self.default)
            .map(|t| t.url)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus {
    privacy_status: Option<String>,
    license: Option<String>,
}

impl VideoItem {
    fn into_record(self) -> VideoRecord {
        let snippet = self.snippet;
        let status = self.status;
        let privacy = status
            .as_ref()
            .and_then(|s| s.privacy_status.as_deref())
            .and_then(|p| match p {
                "public" => Some(Privacy::Public),
                "unlisted" => Some(Privacy::Unlisted),
                "private" => Some(Privacy::Private),
                _ => None,
            });
        let availability = match privacy {
            Some(Privacy::Private) => Availability::Private,
            _ => Availability::Public,
        };
        let license = status
            .as_ref()
            .and_then(|s| s.license.as_deref())
            .and_then(|l| match l {
                "youtube" | "standard" => Some(License::Standard),
                "creativeCommon" => Some(License::CreativeCommon),
                _ => None,
            });
        let statistics = self.statistics;
        let parse_count = |value: Option<&str>| value.and_then(|v| v.parse::<i64>().ok());

        let mut record = VideoRecord {
            video_id: self.id,
            title: String::new(),
            description: String::new(),
            channel_id: String::new(),
            channel_name: String::new(),
            published_at: None,
            duration_seconds: self
                .content_details
                .and_then(|details| details.duration)
                .as_deref()
                .and_then(parse_iso8601_duration),
            view_count: parse_count(
                statistics.as_ref().and_then(|s| s.view_count.as_deref()),
            ),
            like_count: parse_count(
                statistics.as_ref().and_then(|s| s.like_count.as_deref()),
            ),
            comment_count: parse_count(
                statistics.as_ref().and_then(|s| s.comment_count.as_deref()),
            ),
            thumbnail_url: None,
            license,
            privacy,
            availability,
            tags: Vec::new(),
            categories: Vec::new(),
            language: None,
            captions_available: Vec::new(),
            download_status: crate::model::DownloadStatus::NotTracked,
            file_path: String::new(),
            fetched_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            less_complete: false,
        };
        if let Some(snippet) = snippet {
            record.title = snippet.title.unwrap_or_default();
            record.description = snippet.description.unwrap_or_default();
            record.channel_id = snippet.channel_id.unwrap_or_default();
            record.channel_name = snippet.channel_title.unwrap_or_default();
            record.published_at = snippet.published_at;
            record.tags = snippet.tags;
            record.language = snippet
                .default_audio_language
                .or(snippet.default_language);
            if let Some(category) = snippet.category_id {
                record.categories = vec![category];
            }
            record.thumbnail_url = snippet.thumbnails.and_then(ThumbnailSet::best_url);
        }
        record
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThread {
    snippet: CommentThreadSnippet,
    replies: Option<CommentReplies>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentThreadSnippet {
    top_level_comment: CommentResource,
    total_reply_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentReplies {
    #[serde(default = "Vec::new")]
    comments: Vec<CommentResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentResource {
    id: String,
    snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentSnippet {
    author_display_name: Option<String>,
    author_channel_id: Option<AuthorChannelId>,
    text_display: Option<String>,
    text_original: Option<String>,
    like_count: Option<i64>,
    published_at: Option<DateTime<Utc>>,
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorChannelId {
    value: Option<String>,
}

impl CommentResource {
    fn into_record(self, video_id: &str) -> CommentRecord {
        let snippet = self.snippet;
        CommentRecord {
            id: self.id,
            video_id: video_id.to_string(),
            author: snippet.author_display_name.unwrap_or_default(),
            author_channel_id: snippet.author_channel_id.and_then(|a| a.value),
            text: snippet
                .text_original
                .or(snippet.text_display)
                .unwrap_or_default(),
            published_at: snippet.published_at,
            like_count: snippet.like_count,
            parent_id: snippet.parent_id,
            reply_count: None,
            replies: Vec::new(),
        }
    }
}

impl CommentThread {
    fn into_record(self, video_id: &str, depth: u32) -> CommentRecord {
        let mut root = self.snippet.top_level_comment.into_record(video_id);
        root.reply_count = self.snippet.total_reply_count;
        if depth > 1
            && let Some(replies) = self.replies
        {
            let root_id = root.id.clone();
            root.replies = replies
                .comments
                .into_iter()
                .map(|reply| {
                    let mut record = reply.into_record(video_id);
                    // The API reports the thread id as parent; pin it to the
                    // root so the comment-file invariant holds.
                    record.parent_id = Some(root_id.clone());
                    record
                })
                .collect();
        }
        root
    }
}

/// Parses the API's ISO-8601 durations (`PT1H2M3S`, `P1DT2H`) into seconds.
pub fn parse_iso8601_duration(value: &str) -> Option<i64> {
    let rest = value.strip_prefix('P')?;
    let mut seconds: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            'D' if !in_time => {
                seconds += number.parse::<i64>().ok()? * 86_400;
                number.clear();
            }
            'H' if in_time => {
                seconds += number.parse::<i64>().ok()? * 3_600;
                number.clear();
            }
            'M' if in_time => {
                seconds += number.parse::<i64>().ok()? * 60;
                number.clear();
            }
            'S' if in_time => {
                seconds += number.parse::<i64>().ok()?;
                number.clear();
            }
            _ => return None,
        }
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing_handles_api_forms() {
        assert_eq!(parse_iso8601_duration("PT3M33S"), Some(213));
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), Some(3723));
        assert_eq!(parse_iso8601_duration("PT45S"), Some(45));
        assert_eq!(parse_iso8601_duration("P1DT2H"), Some(93_600));
        assert_eq!(parse_iso8601_duration("PT0S"), Some(0));
        assert_eq!(parse_iso8601_duration("nonsense"), None);
    }

    #[test]
    fn quota_exhaustion_is_distinguished_from_rate_limit() {
        let quota_body = r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#;
        assert!(matches!(
            classify_status(403, quota_body, None),
            ArchiveError::QuotaExhausted
        ));

        let rate_body = r#"{"error":{"errors":[{"reason":"rateLimitExceeded"}]}}"#;
        assert!(matches!(
            classify_status(403, rate_body, None),
            ArchiveError::RateLimited { .. }
        ));

        assert!(matches!(
            classify_status(429, "", Some(Duration::from_secs(7))),
            ArchiveError::RateLimited {
                retry_after: Some(after)
            } if after == Duration::from_secs(7)
        ));
    }

    #[test]
    fn unknown_403_is_auth() {
        let body = r#"{"error":{"errors":[{"reason":"forbidden"}]}}"#;
        assert!(matches!(
            classify_status(403, body, None),
            ArchiveError::Auth(_)
        ));
    }

    #[test]
    fn video_item_parses_into_record() {
        let raw = r#"{
            "id": "dQw4w9WgXcQ",
            "snippet": {
                "publishedAt": "2009-10-25T06:57:33Z",
                "channelId": "UCuAXFkgsw1L7xaCfnd5JJOw",
                "title": "Official Video",
                "description": "d",
                "channelTitle": "Artist",
                "tags": ["music"],
                "categoryId": "10",
                "thumbnails": {"high": {"url": "https://i.ytimg.com/x/hq.jpg"}}
            },
            "contentDetails": {"duration": "PT3M33S"},
            "statistics": {"viewCount": "1000", "likeCount": "10", "commentCount": "5"},
            "status": {"privacyStatus": "public", "license": "youtube"}
        }"#;
        let item: VideoItem = serde_json::from_str(raw).unwrap();
        let record = item.into_record();
        assert_eq!(record.video_id, "dQw4w9WgXcQ");
        assert_eq!(record.duration_seconds, Some(213));
        assert_eq!(record.view_count, Some(1000));
        assert_eq!(record.license, Some(License::Standard));
        assert_eq!(record.privacy, Some(Privacy::Public));
        assert_eq!(record.availability, Availability::Public);
        assert_eq!(record.channel_name, "Artist");
        assert_eq!(record.thumbnail_url.as_deref(), Some("https://i.ytimg.com/x/hq.jpg"));
    }

    #[test]
    fn private_status_maps_to_private_availability() {
        let raw = r#"{"id": "x", "status": {"privacyStatus": "private"}}"#;
        let item: VideoItem = serde_json::from_str(raw).unwrap();
        let record = item.into_record();
        assert_eq!(record.availability, Availability::Private);
    }

    #[test]
    fn comment_thread_pins_reply_parents_to_root() {
        let raw = r#"{
            "snippet": {
                "topLevelComment": {
                    "id": "root1",
                    "snippet": {
                        "authorDisplayName": "A",
                        "textOriginal": "first",
                        "likeCount": 3,
                        "publishedAt": "2024-01-01T00:00:00Z"
                    }
                },
                "totalReplyCount": 1
            },
            "replies": {
                "comments": [{
                    "id": "root1.reply1",
                    "snippet": {
                        "authorDisplayName": "B",
                        "textOriginal": "second",
                        "parentId": "root1"
                    }
                }]
            }
        }"#;
        let thread: CommentThread = serde_json::from_str(raw).unwrap();
        let record = thread.into_record("vid", 2);
        assert_eq!(record.id, "root1");
        assert_eq!(record.replies.len(), 1);
        assert_eq!(record.replies[0].parent_id.as_deref(), Some("root1"));
        crate::model::validate_comment_tree(std::slice::from_ref(&record)).unwrap();
    }

    #[test]
    fn depth_one_strips_replies() {
        let raw = r#"{
            "snippet": {
                "topLevelComment": {"id": "r", "snippet": {"textOriginal": "t"}},
                "totalReplyCount": 2
            },
            "replies": {"comments": [{"id": "r.1", "snippet": {}}]}
        }"#;
        let thread: CommentThread = serde_json::from_str(raw).unwrap();
        let record = thread.into_record("vid", 1);
        assert!(record.replies.is_empty());
        assert_eq!(record.reply_count, Some(2));
    }
}
