#![forbid(unsafe_code)]

//! Generic extractor backend, driven through the yt-dlp command line.
//!
//! Unauthenticated and unquoted, but slower: flat playlist listings, caption
//! and thumbnail downloads, comment dumps, and the per-id metadata fallback
//! all run through here. A `cookies.txt` in the archive root is passed
//! through when present.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::error::ArchiveError;
use crate::model::{Availability, CaptionTrack, CommentRecord, VideoRecord};

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
pub(crate) fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        *YT_DLP_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    cookies: Option<PathBuf>,
}

impl Extractor {
    pub fn new(cookies: Option<PathBuf>) -> Self {
        Self { cookies }
    }

    /// Runs `yt-dlp --version` to fail loudly when the tool is missing.
    pub fn ensure_available() -> Result<()> {
        let status = yt_dlp_command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!("yt-dlp is installed but returned a failure status"),
            Err(err) => bail!("yt-dlp is not installed or not in PATH: {}", err),
        }
    }

    fn apply_cookies(&self, command: &mut Command) {
        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            command
                .arg("--cookies")
                .arg(cookies.to_string_lossy().to_string());
        }
    }

    /// Lists every video id in a channel or playlist without touching the
    /// per-video pages. Output order is the remote enumeration order.
    pub fn list_flat(&self, list_url: &str) -> Result<Vec<String>> {
        let mut command = yt_dlp_command();
        command
            .arg("--flat-playlist")
            .arg("--get-id")
            .arg("--ignore-errors")
            .arg("--no-warnings")
            .arg(list_url);
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("listing videos from {}", list_url))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(list_url, &stderr).into());
        }

        let content = String::from_utf8_lossy(&output.stdout);
        let ids = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|id| id.to_owned())
            .collect();
        Ok(ids)
    }

    /// Fetches full metadata for one video. The resulting record is flagged
    /// `less_complete` because the extractor cannot see API-only attributes
    /// such as the license.
    pub fn detail(&self, video_id: &str) -> Result<VideoRecord> {
        let url = video_url(video_id);
        let mut command = yt_dlp_command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(&url);
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("fetching metadata for {}", url))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(video_id, &stderr).into());
        }

        let raw_json = String::from_utf8(output.stdout)
            .context("parsing metadata JSON response as UTF-8")?;
        let info: VideoInfo =
            serde_json::from_str(&raw_json).context("deserializing metadata JSON")?;
        Ok(info.into_record(video_id))
    }

    /// Downloads caption tracks for the listed languages into `dest_dir`,
    /// named `<basename>.<lang>.vtt`. Returns the tracks found on disk.
    pub fn fetch_captions(
        &self,
        video_id: &str,
        languages: &[String],
        dest_dir: &Path,
        basename: &str,
    ) -> Result<Vec<CaptionTrack>> {
        if languages.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;

        let output_pattern = dest_dir.join(basename).to_string_lossy().to_string();
        let mut command = yt_dlp_command();
        command
            .arg("--write-sub")
            .arg("--write-auto-sub")
            .arg("--sub-langs")
            .arg(languages.join(","))
            .arg("--sub-format")
            .arg("vtt")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--output")
            .arg(output_pattern)
            .arg(video_url(video_id));
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("fetching captions for {}", video_id))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(video_id, &stderr).into());
        }

        let mut tracks = Vec::new();
        let prefix = format!("{basename}.");
        for entry in fs::read_dir(dest_dir)
            .with_context(|| format!("reading captions dir {}", dest_dir.display()))?
        {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry
                .file_name()
                .into_string()
                .unwrap_or_else(|os| os.to_string_lossy().into_owned());
            let Some(rest) = file_name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(code) = rest.strip_suffix(".vtt") else {
                continue;
            };
            if code.is_empty() {
                continue;
            }
            tracks.push(CaptionTrack {
                video_id: video_id.to_owned(),
                language: code.to_owned(),
                language_name: String::new(),
                auto_generated: false,
                format: "vtt".to_owned(),
                file_path: file_name.clone(),
                fetched_at: Some(Utc::now()),
            });
        }
        tracks.sort_by(|a, b| a.language.cmp(&b.language));
        Ok(tracks)
    }

    /// Downloads the best thumbnail as `thumbnail.jpg` inside `dest_dir`.
    pub fn fetch_thumbnail(&self, video_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let output_pattern = dest_dir.join("thumbnail").to_string_lossy().to_string();
        let mut command = yt_dlp_command();
        command
            .arg("--write-thumbnail")
            .arg("--convert-thumbnails")
            .arg("jpg")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--output")
            .arg(output_pattern)
            .arg(video_url(video_id));
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("fetching thumbnail for {}", video_id))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(video_id, &stderr).into());
        }

        let path = dest_dir.join("thumbnail.jpg");
        if !path.exists() {
            return Err(ArchiveError::ExtractorIncompatible(format!(
                "{video_id}: no thumbnail produced"
            ))
            .into());
        }
        Ok(path)
    }

    /// Dumps every comment the extractor can reach. Best effort: the result
    /// may be truncated compared to the Data-API view.
    pub fn comments(&self, video_id: &str, work_dir: &Path) -> Result<Vec<CommentRecord>> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("creating {}", work_dir.display()))?;
        let output_pattern = work_dir.join(video_id).to_string_lossy().to_string();
        let mut command = yt_dlp_command();
        command
            .arg("--skip-download")
            .arg("--write-comments")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--force-overwrites")
            .arg("--output")
            .arg(output_pattern)
            .arg(video_url(video_id));
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("fetching comments for {}", video_id))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(video_id, &stderr).into());
        }

        let info_path = work_dir.join(format!("{video_id}.info.json"));
        if !info_path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&info_path)
            .with_context(|| format!("reading {}", info_path.display()))?;
        let dump: CommentDump =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", info_path.display()))?;
        Ok(nest_comments(video_id, dump.comments))
    }

    /// Downloads the video binary itself as `<basename>.<ext>` in `dest_dir`
    /// and returns the produced path.
    pub fn download_video(
        &self,
        video_id: &str,
        dest_dir: &Path,
        basename: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let mut output_pattern = dest_dir.join(basename);
        output_pattern.set_extension("%(ext)s");
        let mut command = yt_dlp_command();
        command
            .arg("--format")
            .arg("best")
            .arg("--no-overwrites")
            .arg("--continue")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--output")
            .arg(output_pattern.to_string_lossy().to_string())
            .arg(video_url(video_id));
        self.apply_cookies(&mut command);

        let output = command
            .output()
            .with_context(|| format!("downloading {}", video_id))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_extractor_failure(video_id, &stderr).into());
        }

        find_video_file(dest_dir, basename)?.ok_or_else(|| {
            ArchiveError::ExtractorIncompatible(format!("{video_id}: no media file produced"))
                .into()
        })
    }
}

/// Locates the first non-partial media file matching `<basename>.<ext>`.
fn find_video_file(dest_dir: &Path, basename: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{basename}.");
    for entry in fs::read_dir(dest_dir)
        .with_context(|| format!("reading media dir {}", dest_dir.display()))?
    {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .unwrap_or_else(|os| os.to_string_lossy().into_owned());
        let Some(ext) = name.strip_prefix(&prefix) else {
            continue;
        };
        if ext.contains('.') || matches!(ext, "part" | "ytdl" | "json" | "jpg" | "vtt") {
            continue;
        }
        return Ok(Some(entry.path()));
    }
    Ok(None)
}

/// Maps yt-dlp stderr onto the pipeline's error classes. The messages are the
/// extractor's own and reasonably stable across releases.
fn classify_extractor_failure(subject: &str, stderr: &str) -> ArchiveError {
    let summary = format!("{subject}: {}", stderr.trim());
    if stderr.contains("Private video") {
        ArchiveError::RemoteUnavailable(format!("{subject}: private"))
    } else if stderr.contains("Video unavailable") || stderr.contains("has been removed") {
        ArchiveError::RemoteUnavailable(format!("{subject}: removed"))
    } else if stderr.contains("HTTP Error 429") || stderr.contains("rate-limited") {
        ArchiveError::RateLimited { retry_after: None }
    } else if stderr.contains("Unable to download")
        || stderr.contains("Connection re")
        || stderr.contains("timed out")
    {
        ArchiveError::NetworkTransient(summary)
    } else {
        ArchiveError::ExtractorIncompatible(summary)
    }
}

/// Subset of the extractor's single-JSON dump the pipeline reads. Everything
/// is optional because older videos may lack metadata.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    channel_id: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    upload_date: Option<String>,
    #[serde(default)]
    release_timestamp: Option<i64>,
    duration: Option<i64>,
    view_count: Option<i64>,
    like_count: Option<i64>,
    comment_count: Option<i64>,
    tags: Option<Vec<String>>,
    categories: Option<Vec<String>>,
    language: Option<String>,
    availability: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    subtitles: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, rename = "automatic_captions")]
    automatic_captions: Option<HashMap<String, serde_json::Value>>,
}

impl VideoInfo {
    fn into_record(self, video_id: &str) -> VideoRecord {
        let title = self
            .fulltitle
            .as_deref()
            .or(self.title.as_deref())
            .filter(|t| !t.is_empty())
            .unwrap_or(video_id)
            .to_owned();

        let published_at = self
            .upload_date
            .as_deref()
            .and_then(upload_date_to_utc)
            .or_else(|| {
                self.release_timestamp
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            });

        let mut captions: Vec<String> = self
            .subtitles
            .iter()
            .flat_map(|subs| subs.keys().cloned())
            .collect();
        captions.extend(
            self.automatic_captions
                .iter()
                .flat_map(|subs| subs.keys().cloned()),
        );

        let mut record = VideoRecord {
            video_id: video_id.to_owned(),
            title,
            description: self.description.unwrap_or_default(),
            channel_id: self.channel_id.unwrap_or_default(),
            channel_name: self.channel.or(self.uploader).unwrap_or_default(),
            published_at,
            duration_seconds: self.duration,
            view_count: self.view_count,
            like_count: self.like_count,
            comment_count: self.comment_count,
            thumbnail_url: self.thumbnail,
            license: None,
            privacy: None,
            availability: parse_availability(self.availability.as_deref()),
            tags: self.tags.unwrap_or_default(),
            categories: self.categories.unwrap_or_default(),
            language: self.language,
            captions_available: Vec::new(),
            download_status: crate::model::DownloadStatus::NotTracked,
            file_path: String::new(),
            fetched_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
            less_complete: true,
        };
        record.set_captions_available(captions);
        record
    }
}

fn parse_availability(value: Option<&str>) -> Availability {
    match value {
        Some("private") | Some("needs_auth") => Availability::Private,
        Some("public") | Some("unlisted") | None => Availability::Public,
        Some(_) => Availability::Unavailable,
    }
}

/// Converts the extractor's `YYYYMMDD` upload date into a UTC midnight.
fn upload_date_to_utc(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 8 {
        return None;
    }
    let year = value[0..4].parse().ok()?;
    let month = value[4..6].parse().ok()?;
    let day = value[6..8].parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[derive(Debug, Deserialize)]
struct CommentDump {
    #[serde(default)]
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    parent: Option<String>,
}

/// Folds the extractor's flat comment list into the on-disk shape: roots in
/// order, replies nested one level under their root.
fn nest_comments(video_id: &str, raw: Vec<RawComment>) -> Vec<CommentRecord> {
    let mut roots: Vec<CommentRecord> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for comment in raw {
        let parent = comment
            .parent
            .as_deref()
            .filter(|parent| *parent != "root")
            .map(str::to_owned);
        let record = CommentRecord {
            id: comment.id.clone(),
            video_id: video_id.to_owned(),
            author: comment.author.unwrap_or_default(),
            author_channel_id: comment.author_id,
            text: comment.text.unwrap_or_default(),
            published_at: comment
                .timestamp
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            like_count: comment.like_count,
            parent_id: parent.clone(),
            reply_count: None,
            replies: Vec::new(),
        };
        match parent {
            None => {
                index_by_id.insert(comment.id, roots.len());
                roots.push(record);
            }
            Some(parent_id) => {
                // Thread ids look like `<root>.<reply>`; resolve either form.
                let root_key = parent_id.split('.').next().unwrap_or(&parent_id);
                if let Some(&idx) = index_by_id
                    .get(parent_id.as_str())
                    .or_else(|| index_by_id.get(root_key))
                {
                    let mut record = record;
                    record.parent_id = Some(roots[idx].id.clone());
                    roots[idx].replies.push(record);
                }
                // An orphan reply (its root was withheld) is dropped rather
                // than violating the comment-file invariant.
            }
        }
    }

    for root in &mut roots {
        root.reply_count = Some(root.replies.len() as i64);
    }
    roots
}
