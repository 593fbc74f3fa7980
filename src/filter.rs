#![forbid(unsafe_code)]

//! Inclusion predicates applied to enumerated videos.
//!
//! All fields are optional and AND-ed together. Flat listings carry only
//! ids, so every predicate runs once the detail fetch has produced a full
//! record; only the playlist allow/deny check applies at enumeration time.

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;
use crate::model::{License, VideoRecord};

/// `[filters]` section. Also used verbatim for per-source overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Stop after this many included videos per source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Half-open publication window: `date_start <= published < date_end`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_end: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses: Option<Vec<License>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlists_include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlists_exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_views: Option<i64>,
    /// OR within the set: a video passes when it carries any listed tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.date_start, self.date_end)
            && start >= end
        {
            return Err(ArchiveError::ConfigInvalid(format!(
                "date_start {start} is not before date_end {end}"
            ))
            .into());
        }
        if let (Some(min), Some(max)) = (self.min_duration_seconds, self.max_duration_seconds)
            && min > max
        {
            return Err(ArchiveError::ConfigInvalid(
                "min_duration_seconds exceeds max_duration_seconds".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Full predicate over a detailed record. AND semantics across fields.
    pub fn includes(&self, video: &VideoRecord) -> bool {
        if let Some(published) = video.published_at {
            if !self.date_in_window(published.date_naive()) {
                return false;
            }
        } else if self.date_start.is_some() || self.date_end.is_some() {
            // A dated window cannot admit an undated video.
            return false;
        }

        if let Some(licenses) = &self.licenses {
            match video.license {
                Some(license) if licenses.contains(&license) => {}
                _ => return false,
            }
        }

        if let Some(min) = self.min_duration_seconds
            && video.duration_seconds.is_none_or(|d| d < min)
        {
            return false;
        }
        if let Some(max) = self.max_duration_seconds
            && video.duration_seconds.is_none_or(|d| d > max)
        {
            return false;
        }

        if let Some(min_views) = self.min_views
            && video.view_count.is_none_or(|v| v < min_views)
        {
            return false;
        }

        if let Some(tags) = &self.tags
            && !tags.is_empty()
            && !video.tags.iter().any(|tag| tags.contains(tag))
        {
            return false;
        }

        true
    }

    /// Whether a whole playlist takes part in enumeration.
    pub fn playlist_allowed(&self, playlist_id: &str) -> bool {
        if let Some(include) = &self.playlists_include
            && !include.iter().any(|id| id == playlist_id)
        {
            return false;
        }
        if let Some(exclude) = &self.playlists_exclude
            && exclude.iter().any(|id| id == playlist_id)
        {
            return false;
        }
        true
    }

    fn date_in_window(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.date_start
            && date < start
        {
            return false;
        }
        if let Some(end) = self.date_end
            && date >= end
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, DownloadStatus};

    fn video(published: &str, duration: i64, views: i64) -> VideoRecord {
        VideoRecord {
            video_id: "abcdefghijk".into(),
            title: "t".into(),
            description: String::new(),
            channel_id: "UC1".into(),
            channel_name: String::new(),
            published_at: Some(format!("{published}T12:00:00Z").parse().unwrap()),
            duration_seconds: Some(duration),
            view_count: Some(views),
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            license: Some(License::Standard),
            privacy: None,
            availability: Availability::Public,
            tags: vec!["rust".into()],
            categories: Vec::new(),
            language: None,
            captions_available: Vec::new(),
            download_status: DownloadStatus::NotTracked,
            file_path: String::new(),
            fetched_at: None,
            updated_at: None,
            less_complete: false,
        }
    }

    fn window(start: &str, end: &str) -> FilterConfig {
        FilterConfig {
            date_start: Some(start.parse().unwrap()),
            date_end: Some(end.parse().unwrap()),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn empty_filter_includes_everything() {
        let filter = FilterConfig::default();
        assert!(filter.includes(&video("2024-06-01", 100, 5)));
    }

    #[test]
    fn date_window_is_half_open() {
        let filter = window("2024-01-01", "2024-02-01");
        assert!(filter.includes(&video("2024-01-01", 100, 5)));
        assert!(filter.includes(&video("2024-01-31", 100, 5)));
        assert!(!filter.includes(&video("2024-02-01", 100, 5)));
        assert!(!filter.includes(&video("2023-12-31", 100, 5)));
    }

    #[test]
    fn undated_video_fails_dated_window() {
        let filter = window("2024-01-01", "2024-02-01");
        let mut v = video("2024-01-15", 100, 5);
        v.published_at = None;
        assert!(!filter.includes(&v));
    }

    #[test]
    fn license_set_filters() {
        let filter = FilterConfig {
            licenses: Some(vec![License::CreativeCommon]),
            ..FilterConfig::default()
        };
        assert!(!filter.includes(&video("2024-01-01", 100, 5)));
        let mut cc = video("2024-01-01", 100, 5);
        cc.license = Some(License::CreativeCommon);
        assert!(filter.includes(&cc));
    }

    #[test]
    fn duration_and_views_thresholds() {
        let filter = FilterConfig {
            min_duration_seconds: Some(60),
            max_duration_seconds: Some(600),
            min_views: Some(100),
            ..FilterConfig::default()
        };
        assert!(filter.includes(&video("2024-01-01", 120, 150)));
        assert!(!filter.includes(&video("2024-01-01", 30, 150)));
        assert!(!filter.includes(&video("2024-01-01", 1200, 150)));
        assert!(!filter.includes(&video("2024-01-01", 120, 50)));
    }

    #[test]
    fn tags_are_or_within_set() {
        let filter = FilterConfig {
            tags: Some(vec!["go".into(), "rust".into()]),
            ..FilterConfig::default()
        };
        assert!(filter.includes(&video("2024-01-01", 100, 5)));
        let filter = FilterConfig {
            tags: Some(vec!["go".into()]),
            ..FilterConfig::default()
        };
        assert!(!filter.includes(&video("2024-01-01", 100, 5)));
    }

    #[test]
    fn playlist_include_exclude() {
        let filter = FilterConfig {
            playlists_include: Some(vec!["PL1".into()]),
            playlists_exclude: Some(vec!["PL2".into()]),
            ..FilterConfig::default()
        };
        assert!(filter.playlist_allowed("PL1"));
        assert!(!filter.playlist_allowed("PL2"));
        assert!(!filter.playlist_allowed("PL3"));
    }

    #[test]
    fn validate_rejects_inverted_window() {
        let filter = window("2024-02-01", "2024-01-01");
        assert!(filter.validate().is_err());
    }
}
