#![forbid(unsafe_code)]

//! Summary-table export.
//!
//! Regeneration reads the per-entity JSON records on disk, never sync-state,
//! so a lost state file cannot corrupt the tables. All tables are
//! tab-separated with a header row; column order is stable and documented
//! (title first, id last) so downstream tools can rely on it:
//!
//! - `videos.tsv`: title, channel, published, duration_seconds, views,
//!   likes, comments, license, privacy, availability, tags, captions, path,
//!   channel_id, video_id
//! - `playlists.tsv`: title, channel, published, video_count, video_ids,
//!   channel_id, playlist_id
//! - `authors.tsv`: author, comments, videos, author_channel_id
//! - `channels.tsv` (multi-channel archives only): title, subscribers,
//!   videos, channel_id
//! - per-video `captions.tsv`: language, format, auto_generated, file,
//!   video_id
//!
//! Escaping: backslash, tab, CR and LF become `\\`, `\t`, `\r`, `\n`.
//! Backslash is encoded first so decoding is unambiguous.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::model::{CommentRecord, PlaylistRecord, VideoRecord};
use crate::paths::{CHANNELS_SUBDIR, PLAYLISTS_SUBDIR, VIDEOS_SUBDIR};

pub const VIDEOS_TSV: &str = "videos.tsv";
pub const PLAYLISTS_TSV: &str = "playlists.tsv";
pub const AUTHORS_TSV: &str = "authors.tsv";
pub const CHANNELS_TSV: &str = "channels.tsv";
pub const CAPTIONS_TSV: &str = "captions.tsv";

/// Encodes one field for a TSV cell. Order matters: backslash first.
pub fn escape_field(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// Inverse of [`escape_field`].
pub fn unescape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn write_table(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut out = String::new();
    out.push_str(&header.join("\t"));
    out.push('\n');
    for row in rows {
        let encoded: Vec<String> = row.iter().map(|field| escape_field(field)).collect();
        out.push_str(&encoded.join("\t"));
        out.push('\n');
    }
    let tmp_path = path.with_extension("tsv.tmp");
    fs::write(&tmp_path, out).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

fn opt_count(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct ExportSummary {
    pub videos: usize,
    pub playlists: usize,
    pub authors: usize,
    pub channels: usize,
}

#[derive(Debug)]
pub struct Exporter {
    root: PathBuf,
}

impl Exporter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Regenerates every summary table from the entity files on disk.
    pub fn export_all(&self) -> Result<ExportSummary> {
        let mut summary = ExportSummary::default();
        summary.videos = self.export_videos()?;
        summary.playlists = self.export_playlists()?;
        summary.authors = self.export_authors()?;
        summary.channels = self.export_channels()?;
        Ok(summary)
    }

    /// Loads every video record under `videos/`, publication ascending with
    /// id as the tie-break.
    pub fn load_videos(&self) -> Result<Vec<VideoRecord>> {
        let videos_dir = self.root.join(VIDEOS_SUBDIR);
        let mut videos = Vec::new();
        if !videos_dir.exists() {
            return Ok(videos);
        }
        for entry in WalkDir::new(&videos_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            if entry.file_name().to_string_lossy() != "metadata.json" {
                continue;
            }
            match VideoRecord::load(entry.path()) {
                Ok(mut video) => {
                    // The path column reflects where the directory actually
                    // lives; the stored field can lag behind a template
                    // change because moves never rewrite entity files.
                    if let Some(parent) = entry.path().parent()
                        && let Ok(relative) = parent.strip_prefix(&self.root)
                    {
                        video.file_path = relative.to_string_lossy().into_owned();
                    }
                    videos.push(video);
                }
                Err(err) => {
                    eprintln!("  Warning: skipping {}: {}", entry.path().display(), err);
                }
            }
        }
        videos.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.video_id.cmp(&b.video_id))
        });
        Ok(videos)
    }

    fn export_videos(&self) -> Result<usize> {
        let videos = self.load_videos()?;
        let rows: Vec<Vec<String>> = videos
            .iter()
            .map(|video| {
                vec![
                    video.title.clone(),
                    video.channel_name.clone(),
                    video
                        .published_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default(),
                    opt_count(video.duration_seconds),
                    opt_count(video.view_count),
                    opt_count(video.like_count),
                    opt_count(video.comment_count),
                    video
                        .license
                        .map(|license| {
                            serde_json::to_value(license)
                                .ok()
                                .and_then(|v| v.as_str().map(str::to_owned))
                                .unwrap_or_default()
                        })
                        .unwrap_or_default(),
                    video
                        .privacy
                        .map(|privacy| {
                            serde_json::to_value(privacy)
                                .ok()
                                .and_then(|v| v.as_str().map(str::to_owned))
                                .unwrap_or_default()
                        })
                        .unwrap_or_default(),
                    serde_json::to_value(video.availability)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_default(),
                    video.tags.join(","),
                    video.captions_available.join(","),
                    video.file_path.clone(),
                    video.channel_id.clone(),
                    video.video_id.clone(),
                ]
            })
            .collect();
        write_table(
            &self.root.join(VIDEOS_TSV),
            &[
                "title",
                "channel",
                "published",
                "duration_seconds",
                "views",
                "likes",
                "comments",
                "license",
                "privacy",
                "availability",
                "tags",
                "captions",
                "path",
                "channel_id",
                "video_id",
            ],
            &rows,
        )?;
        Ok(rows.len())
    }

    fn load_playlists(&self) -> Result<Vec<PlaylistRecord>> {
        let playlists_dir = self.root.join(PLAYLISTS_SUBDIR);
        let mut playlists = Vec::new();
        if !playlists_dir.exists() {
            return Ok(playlists);
        }
        for entry in WalkDir::new(&playlists_dir)
            .max_depth(2)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            if entry.file_name().to_string_lossy() != "metadata.json" {
                continue;
            }
            match PlaylistRecord::load(entry.path()) {
                Ok(playlist) => playlists.push(playlist),
                Err(err) => {
                    eprintln!("  Warning: skipping {}: {}", entry.path().display(), err);
                }
            }
        }
        playlists.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.playlist_id.cmp(&b.playlist_id))
        });
        Ok(playlists)
    }

    fn export_playlists(&self) -> Result<usize> {
        let playlists = self.load_playlists()?;
        let rows: Vec<Vec<String>> = playlists
            .iter()
            .map(|playlist| {
                vec![
                    playlist.title.clone(),
                    playlist.channel_name.clone(),
                    playlist
                        .published_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default(),
                    playlist.video_count.to_string(),
                    playlist.video_ids.join(" "),
                    playlist.channel_id.clone(),
                    playlist.playlist_id.clone(),
                ]
            })
            .collect();
        write_table(
            &self.root.join(PLAYLISTS_TSV),
            &[
                "title",
                "channel",
                "published",
                "video_count",
                "video_ids",
                "channel_id",
                "playlist_id",
            ],
            &rows,
        )?;
        Ok(rows.len())
    }

    /// Aggregates commenters across every `comments.json` in the archive.
    fn export_authors(&self) -> Result<usize> {
        #[derive(Default)]
        struct AuthorStats {
            comments: u64,
            videos: std::collections::BTreeSet<String>,
            channel_id: Option<String>,
        }

        let videos_dir = self.root.join(VIDEOS_SUBDIR);
        let mut authors: BTreeMap<String, AuthorStats> = BTreeMap::new();
        if videos_dir.exists() {
            for entry in WalkDir::new(&videos_dir)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                if entry.file_name().to_string_lossy() != "comments.json" {
                    continue;
                }
                let raw = fs::read_to_string(entry.path())
                    .with_context(|| format!("reading {}", entry.path().display()))?;
                let roots: Vec<CommentRecord> = match serde_json::from_str(&raw) {
                    Ok(roots) => roots,
                    Err(err) => {
                        eprintln!("  Warning: skipping {}: {}", entry.path().display(), err);
                        continue;
                    }
                };
                let mut record = |comment: &CommentRecord| {
                    if comment.author.is_empty() {
                        return;
                    }
                    let stats = authors.entry(comment.author.clone()).or_default();
                    stats.comments += 1;
                    stats.videos.insert(comment.video_id.clone());
                    if stats.channel_id.is_none() {
                        stats.channel_id = comment.author_channel_id.clone();
                    }
                };
                for root in &roots {
                    record(root);
                    for reply in &root.replies {
                        record(reply);
                    }
                }
            }
        }

        let rows: Vec<Vec<String>> = authors
            .iter()
            .map(|(author, stats)| {
                vec![
                    author.clone(),
                    stats.comments.to_string(),
                    stats.videos.len().to_string(),
                    stats.channel_id.clone().unwrap_or_default(),
                ]
            })
            .collect();
        write_table(
            &self.root.join(AUTHORS_TSV),
            &["author", "comments", "videos", "author_channel_id"],
            &rows,
        )?;
        Ok(rows.len())
    }

    /// Channel table, only written when the archive spans more than one
    /// channel.
    fn export_channels(&self) -> Result<usize> {
        let channels_dir = self.root.join(CHANNELS_SUBDIR);
        let mut channels = Vec::new();
        if channels_dir.exists() {
            for entry in WalkDir::new(&channels_dir)
                .max_depth(2)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                if entry.file_name().to_string_lossy() != "metadata.json" {
                    continue;
                }
                match crate::model::ChannelRecord::load(entry.path()) {
                    Ok(channel) => channels.push(channel),
                    Err(err) => {
                        eprintln!("  Warning: skipping {}: {}", entry.path().display(), err);
                    }
                }
            }
        }
        if channels.len() < 2 {
            return Ok(0);
        }
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        let rows: Vec<Vec<String>> = channels
            .iter()
            .map(|channel| {
                vec![
                    channel.title.clone(),
                    opt_count(channel.subscriber_count),
                    opt_count(channel.video_count),
                    channel.channel_id.clone(),
                ]
            })
            .collect();
        write_table(
            &self.root.join(CHANNELS_TSV),
            &["title", "subscribers", "videos", "channel_id"],
            &rows,
        )?;
        Ok(rows.len())
    }

    /// Writes the per-video caption manifest next to the video's metadata.
    pub fn write_captions_manifest(
        video_dir: &Path,
        video_id: &str,
        tracks: &[crate::model::CaptionTrack],
    ) -> Result<()> {
        let rows: Vec<Vec<String>> = tracks
            .iter()
            .map(|track| {
                vec![
                    track.language.clone(),
                    track.format.clone(),
                    track.auto_generated.to_string(),
                    track.file_path.clone(),
                    video_id.to_string(),
                ]
            })
            .collect();
        write_table(
            &video_dir.join(CAPTIONS_TSV),
            &["language", "format", "auto_generated", "file", "video_id"],
            &rows,
        )
    }
}
