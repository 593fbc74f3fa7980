#![forbid(unsafe_code)]

//! Renders entity paths from the configured templates.
//!
//! The planner is deterministic: the same record and configuration always
//! produce the same relative path. Rename detection compares the freshly
//! rendered path against the one recorded in sync-state so template changes
//! translate into history-preserving moves instead of orphaned directories.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::config::OrganizationConfig;
use crate::model::VideoRecord;

pub const VIDEOS_SUBDIR: &str = "videos";
pub const PLAYLISTS_SUBDIR: &str = "playlists";
pub const CHANNELS_SUBDIR: &str = "channels";

/// Longest path we ever render, in bytes. Kept under the common filesystem
/// limit with headroom for the archive root prefix.
const MAX_PATH_BYTES: usize = 255;

/// Characters that never survive sanitization on any supported filesystem.
const RESERVED: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0',
];

#[derive(Debug, Clone)]
pub struct PathPlanner {
    organization: OrganizationConfig,
}

/// Inputs for template rendering; a subset of a full `VideoRecord` so the
/// planner can run before detail metadata exists.
#[derive(Debug, Clone, Default)]
pub struct PathInputs<'a> {
    pub video_id: &'a str,
    pub title: &'a str,
    pub channel_id: &'a str,
    pub channel_name: &'a str,
    pub playlist_id: &'a str,
    pub published_at: Option<DateTime<Utc>>,
}

impl<'a> PathInputs<'a> {
    pub fn from_video(video: &'a VideoRecord) -> Self {
        Self {
            video_id: &video.video_id,
            title: &video.title,
            channel_id: &video.channel_id,
            channel_name: &video.channel_name,
            playlist_id: "",
            published_at: video.published_at,
        }
    }
}

/// A scheduled history-preserving move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub from: String,
    pub to: String,
}

impl PathPlanner {
    pub fn new(organization: &OrganizationConfig) -> Self {
        Self {
            organization: organization.clone(),
        }
    }

    /// Relative path of a video's directory under the archive root, e.g.
    /// `videos/2024-01-01_dQw4w9WgXcQ`.
    pub fn video_dir(&self, inputs: &PathInputs) -> String {
        let rendered = self.render_template(&self.organization.video_path_template, inputs);
        let mut path = format!("{VIDEOS_SUBDIR}/{rendered}");
        if path.len() > MAX_PATH_BYTES {
            path = self.shrink(&path, inputs);
        }
        path
    }

    /// Relative path of a playlist's directory.
    pub fn playlist_dir(&self, playlist_id: &str) -> String {
        format!("{PLAYLISTS_SUBDIR}/{}", sanitize_component(playlist_id, "-", false))
    }

    /// Relative path of a channel's directory.
    pub fn channel_dir(&self, channel_id: &str) -> String {
        format!("{CHANNELS_SUBDIR}/{}", sanitize_component(channel_id, "-", false))
    }

    /// Name of the ordered reference inside a playlist directory, e.g.
    /// `0001_my-video-slug`. `position` is zero-based; entries are numbered
    /// from one.
    pub fn playlist_entry_name(&self, position: usize, inputs: &PathInputs) -> String {
        let width = self.organization.playlist_index_width;
        let slug = self.video_slug(inputs);
        format!(
            "{:0width$}{}{}",
            position + 1,
            self.organization.playlist_index_separator,
            slug,
            width = width
        )
    }

    /// The slug a video contributes to playlist entries: the last template
    /// path segment.
    pub fn video_slug(&self, inputs: &PathInputs) -> String {
        let dir = self.video_dir(inputs);
        dir.rsplit('/').next().unwrap_or(&dir).to_string()
    }

    /// Compares the recorded path against the freshly planned one. Returns a
    /// move plan when they differ and the old directory still exists.
    pub fn detect_rename(
        &self,
        archive_root: &Path,
        recorded: &str,
        inputs: &PathInputs,
    ) -> Option<RenamePlan> {
        let expected = self.video_dir(inputs);
        if recorded.is_empty() || recorded == expected {
            return None;
        }
        if !archive_root.join(recorded).exists() {
            return None;
        }
        Some(RenamePlan {
            from: recorded.to_string(),
            to: expected,
        })
    }

    fn render_template(&self, template: &str, inputs: &PathInputs) -> String {
        let separator = &self.organization.sanitization_separator;
        let lowercase = self.organization.lowercase_paths;
        let (date, year, month) = match inputs.published_at {
            Some(at) => (
                at.format("%Y-%m-%d").to_string(),
                at.format("%Y").to_string(),
                at.format("%m").to_string(),
            ),
            None => ("0000-00-00".to_string(), "0000".to_string(), "00".to_string()),
        };

        let mut out = template.to_string();
        // Path-forming fields may contain `/` in the template itself, so the
        // substitution values are sanitized per component, never the whole
        // template string.
        for (field, value) in [
            ("{date}", date.as_str()),
            ("{year}", year.as_str()),
            ("{month}", month.as_str()),
            ("{video_id}", inputs.video_id),
            ("{channel_id}", inputs.channel_id),
            ("{playlist_id}", inputs.playlist_id),
        ] {
            out = out.replace(field, &sanitize_component(value, separator, false));
        }
        for (field, value) in [
            ("{sanitized_title}", inputs.title),
            ("{channel_name}", inputs.channel_name),
        ] {
            out = out.replace(field, &sanitize_component(value, separator, lowercase));
        }
        out.trim_matches('/').to_string()
    }

    /// Re-renders with the title truncated until the path fits. The title is
    /// the only unbounded field; ids and dates are fixed-width.
    fn shrink(&self, long_path: &str, inputs: &PathInputs) -> String {
        let overshoot = long_path.len().saturating_sub(MAX_PATH_BYTES);
        let separator = &self.organization.sanitization_separator;
        let lowercase = self.organization.lowercase_paths;
        let full_title = sanitize_component(inputs.title, separator, lowercase);
        let keep = full_title.len().saturating_sub(overshoot);
        let truncated = truncate_on_boundary(&full_title, keep);
        let shortened = PathInputs {
            title: &truncated,
            ..inputs.clone()
        };
        let rendered = self.render_template(&self.organization.video_path_template, &shortened);
        format!("{VIDEOS_SUBDIR}/{rendered}")
    }
}

/// Sanitizes one path component: reserved characters removed, whitespace runs
/// collapsed to the separator, no leading/trailing separator or dot.
pub fn sanitize_component(value: &str, separator: &str, lowercase: bool) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_gap = false;
    for c in value.chars() {
        if c.is_whitespace() {
            pending_gap = !out.is_empty();
            continue;
        }
        if RESERVED.contains(&c) || c.is_control() {
            continue;
        }
        if pending_gap {
            out.push_str(separator);
            pending_gap = false;
        }
        if lowercase {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    let trimmed = out
        .trim_matches(|c: char| c == '.' || separator.contains(c))
        .to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

/// Byte-limited truncation that never splits a UTF-8 code point.
fn truncate_on_boundary(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn planner() -> PathPlanner {
        PathPlanner::new(&OrganizationConfig::default())
    }

    fn inputs<'a>(video_id: &'a str, title: &'a str) -> PathInputs<'a> {
        PathInputs {
            video_id,
            title,
            channel_id: "UCchannel",
            channel_name: "The Channel",
            playlist_id: "",
            published_at: Some("2024-03-05T10:00:00Z".parse().unwrap()),
        }
    }

    #[test]
    fn default_template_renders_date_and_id() {
        let dir = planner().video_dir(&inputs("dQw4w9WgXcQ", "Hello"));
        assert_eq!(dir, "videos/2024-03-05_dQw4w9WgXcQ");
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = planner().video_dir(&inputs("dQw4w9WgXcQ", "Some Title"));
        let b = planner().video_dir(&inputs("dQw4w9WgXcQ", "Some Title"));
        assert_eq!(a, b);
    }

    #[test]
    fn title_template_sanitizes_whitespace_and_reserved() {
        let organization = OrganizationConfig {
            video_path_template: "{sanitized_title}_{video_id}".into(),
            ..OrganizationConfig::default()
        };
        let planner = PathPlanner::new(&organization);
        let dir = planner.video_dir(&inputs("dQw4w9WgXcQ", "What? A/B   test: <yes>"));
        assert_eq!(dir, "videos/What-AB-test-yes_dQw4w9WgXcQ");
    }

    #[test]
    fn year_month_template_builds_nested_dirs() {
        let organization = OrganizationConfig {
            video_path_template: "{year}/{month}/{video_id}".into(),
            ..OrganizationConfig::default()
        };
        let planner = PathPlanner::new(&organization);
        let dir = planner.video_dir(&inputs("dQw4w9WgXcQ", "x"));
        assert_eq!(dir, "videos/2024/03/dQw4w9WgXcQ");
    }

    #[test]
    fn missing_date_renders_zero_date() {
        let mut i = inputs("dQw4w9WgXcQ", "x");
        i.published_at = None;
        assert_eq!(planner().video_dir(&i), "videos/0000-00-00_dQw4w9WgXcQ");
    }

    #[test]
    fn long_titles_truncate_under_limit() {
        let organization = OrganizationConfig {
            video_path_template: "{date}_{sanitized_title}_{video_id}".into(),
            ..OrganizationConfig::default()
        };
        let planner = PathPlanner::new(&organization);
        let long_title = "ü".repeat(400);
        let dir = planner.video_dir(&inputs("dQw4w9WgXcQ", &long_title));
        assert!(dir.len() <= 255, "path is {} bytes", dir.len());
        assert!(dir.ends_with("_dQw4w9WgXcQ"));
        assert!(dir.starts_with("videos/2024-03-05_"));
    }

    #[test]
    fn playlist_entry_names_are_fixed_width() {
        let p = planner();
        let entry = p.playlist_entry_name(0, &inputs("dQw4w9WgXcQ", "t"));
        assert_eq!(entry, "0001_2024-03-05_dQw4w9WgXcQ");
        let entry = p.playlist_entry_name(41, &inputs("dQw4w9WgXcQ", "t"));
        assert!(entry.starts_with("0042_"));
    }

    #[test]
    fn detect_rename_requires_existing_old_dir() {
        let p = planner();
        let root = tempdir().unwrap();
        let i = inputs("dQw4w9WgXcQ", "t");

        // Old path recorded but gone from disk: nothing to move.
        assert!(p.detect_rename(root.path(), "videos/old_dQw4w9WgXcQ", &i).is_none());

        std::fs::create_dir_all(root.path().join("videos/old_dQw4w9WgXcQ")).unwrap();
        let plan = p
            .detect_rename(root.path(), "videos/old_dQw4w9WgXcQ", &i)
            .expect("rename planned");
        assert_eq!(plan.from, "videos/old_dQw4w9WgXcQ");
        assert_eq!(plan.to, "videos/2024-03-05_dQw4w9WgXcQ");

        // Identical paths never schedule a move.
        std::fs::create_dir_all(root.path().join("videos/2024-03-05_dQw4w9WgXcQ")).unwrap();
        assert!(
            p.detect_rename(root.path(), "videos/2024-03-05_dQw4w9WgXcQ", &i)
                .is_none()
        );
    }

    #[test]
    fn sanitize_component_edge_cases() {
        assert_eq!(sanitize_component("  spaced   out  ", "-", false), "spaced-out");
        assert_eq!(sanitize_component("...", "-", false), "untitled");
        assert_eq!(sanitize_component("MiXeD", "-", true), "mixed");
        assert_eq!(sanitize_component("a\tb\nc", "_", false), "a_b_c");
    }
}
