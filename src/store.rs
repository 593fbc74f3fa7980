#![forbid(unsafe_code)]

//! Adapter over the version-controlled content repository.
//!
//! Everything goes through the `git` (and `git annex`) command line: small
//! text sidecars live directly in the tree, media goes to the annex blob
//! store, and moves are recorded as renames so history survives template
//! changes. Commits are the unit of durability.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};

use crate::error::ArchiveError;

#[cfg(test)]
static GIT_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn git_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = GIT_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("git")
}

#[cfg(test)]
pub(crate) fn set_git_stub_path(path: PathBuf) -> GitStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = GIT_STUB.lock().unwrap();
        *lock = Some(path);
    }
    GitStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct GitStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for GitStubGuard {
    fn drop(&mut self) {
        *GIT_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// How a URL-addressed blob is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Register the URL as the authoritative source; no bytes retrieved.
    Track,
    /// Download the content now.
    Fetch,
    /// Register without verifying the URL is reachable.
    FastTrack,
}

/// Which backend a path routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    Git,
    Annex,
}

/// Extensions routed to the annex blob store. Declared once at init time and
/// mirrored in `.gitattributes`.
const ANNEX_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "flv", "m4a", "mp3", "opus", "jpg", "jpeg", "png", "gif",
    "webp",
];

/// Handle over one archive repository.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `git --version` so missing tooling fails loudly before any work.
    pub fn ensure_available() -> Result<()> {
        let status = git_command()
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!("git is installed but returned a failure status"),
            Err(err) => bail!("git is not installed or not in PATH: {}", err),
        }
    }

    /// Creates the repository, the annex backend when present, and the
    /// attribute rules that route media to the blob store.
    pub fn bootstrap(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        self.run(&["init", "--quiet"])?;

        let mut attributes = String::new();
        for ext in ANNEX_EXTENSIONS {
            attributes.push_str(&format!("*.{ext} annex.largefiles=anything\n"));
        }
        attributes.push_str("*.json annex.largefiles=nothing\n");
        attributes.push_str("*.tsv annex.largefiles=nothing\n");
        attributes.push_str("*.vtt annex.largefiles=nothing\n");
        attributes.push_str("*.md annex.largefiles=nothing\n");
        let attr_path = self.root.join(".gitattributes");
        std::fs::write(&attr_path, attributes)
            .with_context(|| format!("writing {}", attr_path.display()))?;

        // The annex backend is optional at bootstrap; tracked URLs simply
        // require it at backup time.
        if self.run(&["annex", "init", "tubevault"]).is_err() {
            eprintln!("  Warning: git-annex not available; video tracking disabled until it is");
        }
        Ok(())
    }

    /// Registers `url` at `path` (relative to the repository root).
    pub fn add_url(&self, path: &str, url: &str, mode: AddMode) -> Result<()> {
        let mode_flag = match mode {
            AddMode::Track => Some("--relaxed"),
            AddMode::FastTrack => Some("--fast"),
            AddMode::Fetch => None,
        };
        let mut args = vec!["annex", "addurl"];
        if let Some(flag) = mode_flag {
            args.push(flag);
        }
        args.extend(["--file", path, url]);
        self.run(&args)
    }

    /// Stages a file that already exists in the working tree, routing to the
    /// annex or the plain index by extension.
    pub fn add_file(&self, path: &str) -> Result<()> {
        match self.query_tracking(path) {
            Tracking::Annex => self.run(&["annex", "add", path]),
            Tracking::Git => self.run(&["add", path]),
        }
    }

    /// Attaches key/value metadata to an annexed blob.
    pub fn set_blob_metadata(&self, path: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        let mut args: Vec<String> = vec!["annex".into(), "metadata".into(), path.into()];
        for (key, value) in metadata {
            args.push("-s".into());
            args.push(format!("{key}={value}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs)
    }

    /// History-preserving move. Always `git mv`, never delete+add.
    pub fn mv(&self, from: &str, to: &str) -> Result<()> {
        if let Some(parent) = Path::new(to).parent()
            && !parent.as_os_str().is_empty()
        {
            let abs = self.root.join(parent);
            std::fs::create_dir_all(&abs)
                .with_context(|| format!("creating {}", abs.display()))?;
        }
        self.run(&["mv", from, to])
    }

    /// Stages everything and commits. A clean tree is not an error; the
    /// commit is simply skipped.
    pub fn commit(&self, message: &str) -> Result<bool> {
        self.run(&["add", "-A"])?;
        let status = self.capture(&["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.run(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    /// Extension rule table declared at init time.
    pub fn query_tracking(&self, path: &str) -> Tracking {
        let ext = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ANNEX_EXTENSIONS.contains(&ext.as_str()) {
            Tracking::Annex
        } else {
            Tracking::Git
        }
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = git_command()
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("running git {}", args.join(" ")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(classify_git_failure(args, &stderr).into())
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        let output = git_command()
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("running git {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(classify_git_failure(args, &stderr).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Maps a failed git invocation onto the pipeline's error classes.
fn classify_git_failure(args: &[&str], stderr: &str) -> ArchiveError {
    let summary = format!("git {}: {}", args.join(" "), stderr.trim());
    if stderr.contains("index.lock") || stderr.contains("could not lock") {
        ArchiveError::StoreTransient(summary)
    } else if stderr.contains("not a git repository")
        || stderr.contains("annex: not found")
        || stderr.contains("git-annex: not found")
    {
        ArchiveError::StoreFatal(summary)
    } else if args.first() == Some(&"annex") && args.get(1) == Some(&"addurl") {
        // addurl failures are usually the remote, not the repository.
        ArchiveError::StoreTransient(summary)
    } else {
        ArchiveError::StoreFatal(summary)
    }
}
