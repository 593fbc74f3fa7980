#![forbid(unsafe_code)]

//! Archive configuration: `config.toml` plus environment credentials.
//!
//! The file declares what to archive and how to organize it; API credentials
//! are read from the environment only and never from the file.

use std::collections::HashMap;
use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;
use crate::filter::FilterConfig;

pub const CONFIG_FILE: &str = "config.toml";
pub const API_KEY_ENV: &str = "TUBEVAULT_API_KEY";

pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 50;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_WAIT_HOURS: u64 = 24;
pub const DEFAULT_QUOTA_CHECK_INTERVAL_MINUTES: u64 = 30;
pub const DEFAULT_MAX_IN_FLIGHT_VIDEOS: usize = 8;
pub const DEFAULT_COMPONENT_PARALLELISM: usize = 4;

/// What kind of remote entity a source URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Channel,
    Playlist,
    VideoList,
    AdHocUrl,
}

impl SourceKind {
    /// Best-effort classification for bare URLs given on the command line.
    pub fn infer(url: &str) -> Self {
        if url.contains("list=") || url.contains("/playlist") {
            SourceKind::Playlist
        } else if url.contains("watch?v=") || url.contains("/shorts/") {
            SourceKind::VideoList
        } else if url.contains("/channel/") || url.contains("/@") || url.contains("/c/") {
            SourceKind::Channel
        } else {
            SourceKind::AdHocUrl
        }
    }
}

/// One `[[sources]]` entry. Never mutated by the pipeline; sync-state
/// references sources by URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-source component override, replacing the `[components]` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentsConfig>,
    /// Per-source filter override, replacing the `[filters]` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterConfig>,
}

impl SourceConfig {
    pub fn ad_hoc(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            kind: SourceKind::infer(url),
            enabled: true,
            components: None,
            filters: None,
        }
    }
}

/// Which components to fetch per video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentsConfig {
    #[serde(default = "default_true")]
    pub metadata: bool,
    #[serde(default = "default_true")]
    pub thumbnails: bool,
    #[serde(default = "default_true")]
    pub captions: bool,
    #[serde(default = "default_true")]
    pub comments: bool,
    /// Video binaries default to tracked-only; enabling this downloads bytes.
    #[serde(default)]
    pub videos: bool,
    #[serde(default = "default_comments_depth")]
    pub comments_depth: u32,
    /// Regex over BCP-47 codes; only matching caption languages are fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption_languages: Option<String>,
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            metadata: true,
            thumbnails: true,
            captions: true,
            comments: true,
            videos: false,
            comments_depth: default_comments_depth(),
            caption_languages: None,
        }
    }
}

impl ComponentsConfig {
    pub fn any_enabled(&self) -> bool {
        self.metadata || self.thumbnails || self.captions || self.comments || self.videos
    }
}

/// `[organization]`: path templates and naming rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationConfig {
    #[serde(default = "default_video_template")]
    pub video_path_template: String,
    /// Separator substituted for whitespace runs during sanitization.
    #[serde(default = "default_separator")]
    pub sanitization_separator: String,
    #[serde(default)]
    pub lowercase_paths: bool,
    #[serde(default = "default_index_width")]
    pub playlist_index_width: usize,
    #[serde(default = "default_playlist_separator")]
    pub playlist_index_separator: String,
    #[serde(default = "default_video_filename")]
    pub video_filename: String,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            video_path_template: default_video_template(),
            sanitization_separator: default_separator(),
            lowercase_paths: false,
            playlist_index_width: default_index_width(),
            playlist_index_separator: default_playlist_separator(),
            video_filename: default_video_filename(),
        }
    }
}

/// `[backup]`: checkpointing, quota waits, and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_true")]
    pub checkpoint_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_commit_on_interrupt: bool,
    #[serde(default = "default_true")]
    pub quota_wait_enabled: bool,
    #[serde(default = "default_max_wait_hours")]
    pub max_wait_hours: u64,
    #[serde(default = "default_quota_check_interval")]
    pub quota_check_interval_minutes: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_videos: usize,
    #[serde(default = "default_component_parallelism")]
    pub component_parallelism: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            checkpoint_enabled: true,
            auto_commit_on_interrupt: true,
            quota_wait_enabled: true,
            max_wait_hours: default_max_wait_hours(),
            quota_check_interval_minutes: default_quota_check_interval(),
            http_timeout_secs: default_http_timeout(),
            max_in_flight_videos: default_max_in_flight(),
            component_parallelism: default_component_parallelism(),
        }
    }
}

/// The whole `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub components: ComponentsConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub organization: OrganizationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl ArchiveConfig {
    /// Loads and validates `<archive>/config.toml`.
    pub fn load(archive_root: &Path) -> Result<Self> {
        let path = archive_root.join(CONFIG_FILE);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(raw)
            .map_err(|err| anyhow::Error::from(ArchiveError::ConfigInvalid(err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for source in &self.sources {
            if source.url.trim().is_empty() {
                return Err(ArchiveError::ConfigInvalid("source with empty url".into()).into());
            }
            if seen.insert(source.url.as_str(), ()).is_some() {
                return Err(ArchiveError::ConfigInvalid(format!(
                    "duplicate source url {}",
                    source.url
                ))
                .into());
            }
        }
        if self.organization.playlist_index_width == 0 {
            return Err(ArchiveError::ConfigInvalid(
                "playlist_index_width must be at least 1".into(),
            )
            .into());
        }
        if let Some(pattern) = &self.components.caption_languages {
            regex::Regex::new(pattern)
                .map_err(|err| ArchiveError::ConfigInvalid(format!("caption_languages: {err}")))?;
        }
        self.filters.validate()?;
        for source in &self.sources {
            if let Some(filters) = &source.filters {
                filters.validate()?;
            }
        }
        Ok(())
    }

    /// Sources that take part in an archive pass.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }

    /// Component selection for a source, with per-source override applied.
    pub fn effective_components(&self, source: &SourceConfig) -> ComponentsConfig {
        source
            .components
            .clone()
            .unwrap_or_else(|| self.components.clone())
    }

    /// Filter selection for a source, with per-source override applied.
    pub fn effective_filters(&self, source: &SourceConfig) -> FilterConfig {
        source
            .filters
            .clone()
            .unwrap_or_else(|| self.filters.clone())
    }
}

/// Reads the Data-API key from the environment, treating a blank value as
/// absent. The pipeline degrades to extractor-only operation without it.
pub fn api_key_from_env() -> Option<String> {
    env::var(API_KEY_ENV).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Commented template written by `init` so a fresh archive is editable
/// without consulting the docs.
pub fn config_template(urls: &[String]) -> String {
    let mut out = String::new();
    out.push_str("# tubevault archive configuration\n");
    out.push_str("# API credentials are read from the environment (");
    out.push_str(API_KEY_ENV);
    out.push_str("), never from this file.\n\n");
    for url in urls {
        out.push_str("[[sources]]\n");
        out.push_str(&format!("url = {:?}\n", url));
        out.push_str(&format!(
            "type = \"{}\"\n",
            match SourceKind::infer(url) {
                SourceKind::Channel => "channel",
                SourceKind::Playlist => "playlist",
                SourceKind::VideoList => "video-list",
                SourceKind::AdHocUrl => "ad-hoc-url",
            }
        ));
        out.push_str("enabled = true\n\n");
    }
    if urls.is_empty() {
        out.push_str("# [[sources]]\n");
        out.push_str("# url = \"https://www.youtube.com/@example\"\n");
        out.push_str("# type = \"channel\"\n");
        out.push_str("# enabled = true\n\n");
    }
    out.push_str(
        "[components]\n\
         metadata = true\n\
         thumbnails = true\n\
         captions = true\n\
         comments = true\n\
         videos = false\n\
         comments_depth = 1\n\
         # caption_languages = \"^(en|fr)\"\n\n\
         [filters]\n\
         # limit = 100\n\
         # date_start = \"2020-01-01\"\n\
         # date_end = \"2025-01-01\"\n\
         # licenses = [\"creativeCommon\"]\n\
         # min_duration_seconds = 60\n\
         # min_views = 1000\n\
         # tags = [\"archival\"]\n\n\
         [organization]\n\
         video_path_template = \"{date}_{video_id}\"\n\
         sanitization_separator = \"-\"\n\
         playlist_index_width = 4\n\
         playlist_index_separator = \"_\"\n\
         video_filename = \"video\"\n\n\
         [backup]\n\
         checkpoint_interval = 50\n\
         checkpoint_enabled = true\n\
         auto_commit_on_interrupt = true\n\
         max_wait_hours = 24\n",
    );
    out
}

fn default_true() -> bool {
    true
}

fn default_comments_depth() -> u32 {
    1
}

fn default_video_template() -> String {
    "{date}_{video_id}".to_string()
}

fn default_separator() -> String {
    "-".to_string()
}

fn default_index_width() -> usize {
    4
}

fn default_playlist_separator() -> String {
    "_".to_string()
}

fn default_video_filename() -> String {
    "video".to_string()
}

fn default_checkpoint_interval() -> usize {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_max_wait_hours() -> u64 {
    DEFAULT_MAX_WAIT_HOURS
}

fn default_quota_check_interval() -> u64 {
    DEFAULT_QUOTA_CHECK_INTERVAL_MINUTES
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT_VIDEOS
}

fn default_component_parallelism() -> usize {
    DEFAULT_COMPONENT_PARALLELISM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_fills_defaults() {
        let config = ArchiveConfig::parse(
            r#"
            [[sources]]
            url = "https://www.youtube.com/@example"
            type = "channel"
            "#,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 1);
        assert!(config.sources[0].enabled);
        assert!(config.components.metadata);
        assert!(!config.components.videos);
        assert_eq!(config.backup.checkpoint_interval, 50);
        assert_eq!(config.organization.video_path_template, "{date}_{video_id}");
    }

    #[test]
    fn parse_rejects_duplicate_sources() {
        let err = ArchiveConfig::parse(
            r#"
            [[sources]]
            url = "https://www.youtube.com/@a"
            type = "channel"

            [[sources]]
            url = "https://www.youtube.com/@a"
            type = "channel"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate source"));
    }

    #[test]
    fn parse_rejects_bad_caption_regex() {
        let err = ArchiveConfig::parse(
            r#"
            [components]
            caption_languages = "("
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("caption_languages"));
    }

    #[test]
    fn per_source_overrides_replace_global() {
        let config = ArchiveConfig::parse(
            r#"
            [[sources]]
            url = "https://www.youtube.com/@a"
            type = "channel"

            [[sources]]
            url = "https://www.youtube.com/playlist?list=PL1"
            type = "playlist"
            [sources.components]
            comments = false

            [components]
            comments = true
            "#,
        )
        .unwrap();
        let plain = config.effective_components(&config.sources[0]);
        let overridden = config.effective_components(&config.sources[1]);
        assert!(plain.comments);
        assert!(!overridden.comments);
    }

    #[test]
    fn infer_source_kind_from_url() {
        assert_eq!(
            SourceKind::infer("https://www.youtube.com/@handle"),
            SourceKind::Channel
        );
        assert_eq!(
            SourceKind::infer("https://www.youtube.com/playlist?list=PL1"),
            SourceKind::Playlist
        );
        assert_eq!(
            SourceKind::infer("https://www.youtube.com/watch?v=abc123def45"),
            SourceKind::VideoList
        );
        assert_eq!(
            SourceKind::infer("https://example.org/feed"),
            SourceKind::AdHocUrl
        );
    }

    #[test]
    fn config_template_is_parseable() {
        let rendered = config_template(&["https://www.youtube.com/@example".to_string()]);
        let config = ArchiveConfig::parse(&rendered).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::Channel);
    }
}
