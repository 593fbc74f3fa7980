#![forbid(unsafe_code)]

//! Thin command dispatcher over the archival pipeline.
//!
//! Exit codes: 0 ok, 1 generic, 2 argument errors (clap's default), 3
//! network, 4 content store, 5 filesystem, 6 configuration, 7 data.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::Instrument;

use crate::archive::Archiver;
use crate::config::{ArchiveConfig, CONFIG_FILE, config_template};
use crate::error::ArchiveError;
use crate::export::Exporter;
use crate::interrupt::InterruptController;
use crate::logging::{LogOptions, init as init_logging};
use crate::model::License;
use crate::security::ensure_not_root;
use crate::store::ContentStore;
use crate::update::ForceOptions;

#[derive(Debug, Parser)]
#[command(name = "tubevault", version, about = "Archive YouTube channels and playlists")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter, e.g. `info` or `tubevault=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit structured JSON events on stderr.
    #[arg(long, global = true)]
    json: bool,

    /// Only errors on stderr.
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bootstrap an archive directory with a config template.
    Init {
        dir: PathBuf,
        /// Sources to pre-declare in the generated config.
        urls: Vec<String>,
    },
    /// Full archive pass over configured sources (or one URL).
    Backup {
        url: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Keep only videos with this license (standard|creativeCommon).
        #[arg(long)]
        license: Option<String>,
        #[arg(long)]
        date_start: Option<NaiveDate>,
        #[arg(long)]
        date_end: Option<NaiveDate>,
        /// Archive directory (defaults to the current directory).
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Download video binaries instead of registering tracked URLs.
        #[arg(long)]
        download_videos: bool,
        #[arg(long)]
        no_metadata: bool,
        #[arg(long)]
        no_thumbnails: bool,
        #[arg(long)]
        no_captions: bool,
        #[arg(long)]
        no_comments: bool,
    },
    /// Incremental pass: flat enumeration, then detail fetch of the delta.
    Update {
        url: Option<String>,
        /// Refetch even videos that look complete.
        #[arg(long)]
        force: bool,
        /// Re-include archived videos published on or after this date.
        #[arg(long)]
        force_date: Option<NaiveDate>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Regenerate the summary tables from the entity files on disk.
    Export {
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

/// Parses arguments, runs the command, and maps the outcome to an exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let log_options = LogOptions {
        level: cli.log_level.clone(),
        json: cli.json,
        quiet: cli.quiet,
    };
    let trace_id = match init_logging(&log_options) {
        Ok(trace_id) => trace_id,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return 1;
        }
    };

    let span = tracing::info_span!("run", trace_id = %trace_id);
    match execute(cli.command).instrument(span).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            err.downcast_ref::<ArchiveError>()
                .map(ArchiveError::exit_code)
                .unwrap_or(1)
        }
    }
}

async fn execute(command: Command) -> Result<i32> {
    match command {
        Command::Init { dir, urls } => init_archive(&dir, &urls),
        Command::Backup {
            url,
            limit,
            license,
            date_start,
            date_end,
            output_dir,
            download_videos,
            no_metadata,
            no_thumbnails,
            no_captions,
            no_comments,
        } => {
            ensure_not_root("tubevault backup")?;
            let root = archive_root(output_dir)?;
            let mut config = ArchiveConfig::load(&root)?;
            if let Some(limit) = limit {
                config.filters.limit = Some(limit);
            }
            if let Some(license) = license {
                config.filters.licenses = Some(vec![parse_license(&license)?]);
            }
            if date_start.is_some() {
                config.filters.date_start = date_start;
            }
            if date_end.is_some() {
                config.filters.date_end = date_end;
            }
            config.filters.validate()?;
            if download_videos {
                config.components.videos = true;
            }
            if no_metadata {
                config.components.metadata = false;
            }
            if no_thumbnails {
                config.components.thumbnails = false;
            }
            if no_captions {
                config.components.captions = false;
            }
            if no_comments {
                config.components.comments = false;
            }
            run_pipeline(&root, config, url.as_deref(), ForceOptions::default()).await
        }
        Command::Update {
            url,
            force,
            force_date,
            output_dir,
        } => {
            ensure_not_root("tubevault update")?;
            let root = archive_root(output_dir)?;
            let config = ArchiveConfig::load(&root)?;
            let force = ForceOptions { force, force_date };
            run_pipeline(&root, config, url.as_deref(), force).await
        }
        Command::Export { output_dir } => {
            ensure_not_root("tubevault export")?;
            let root = archive_root(output_dir)?;
            let exporter = Exporter::new(&root);
            let summary = exporter.export_all()?;
            let store = ContentStore::new(&root);
            store.commit(&crate::interrupt::export_message())?;
            println!(
                "Exported {} videos, {} playlists, {} authors.",
                summary.videos, summary.playlists, summary.authors
            );
            Ok(0)
        }
    }
}

fn init_archive(dir: &Path, urls: &[String]) -> Result<i32> {
    ensure_not_root("tubevault init")?;
    ContentStore::ensure_available()?;

    let config_path = dir.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(ArchiveError::ConfigInvalid(format!(
            "{} already exists; refusing to overwrite",
            config_path.display()
        ))
        .into());
    }

    let store = ContentStore::new(dir);
    store.bootstrap()?;
    std::fs::write(&config_path, config_template(urls))
        .with_context(|| format!("writing {}", config_path.display()))?;
    store.commit("Initialize archive")?;

    println!("Initialized archive at {}", dir.display());
    println!("Edit {} and run `tubevault backup`.", config_path.display());
    Ok(0)
}

async fn run_pipeline(
    root: &Path,
    config: ArchiveConfig,
    url: Option<&str>,
    force: ForceOptions,
) -> Result<i32> {
    ContentStore::ensure_available()?;
    if let Err(err) = crate::extractor::Extractor::ensure_available() {
        // The pipeline can limp along on the data API alone, but say so.
        eprintln!("  Warning: {err}");
    }

    let controller = InterruptController::new();
    controller.install_signal_handler();
    let mut archiver = Archiver::open(root, config, controller.token())?;
    let summary = archiver.run(url, force).await?;

    println!();
    println!("===================================");
    if summary.cancelled {
        println!("Archive interrupted; progress committed.");
    } else {
        println!("Archive pass complete.");
    }
    println!("===================================");
    println!("Sources:   {}", summary.sources);
    println!("Fetched:   {}", summary.processed);
    println!("Unchanged: {}", summary.skipped);
    println!("Failed:    {}", summary.failed);

    Ok(archiver.exit_code())
}

fn archive_root(output_dir: Option<PathBuf>) -> Result<PathBuf> {
    match output_dir {
        Some(dir) => Ok(dir),
        None => env::current_dir().context("resolving current directory"),
    }
}

fn parse_license(value: &str) -> Result<License> {
    match value {
        "standard" => Ok(License::Standard),
        "creativeCommon" | "creative-common" | "cc" => Ok(License::CreativeCommon),
        other => Err(ArchiveError::ConfigInvalid(format!(
            "unknown license {other}; expected standard or creativeCommon"
        ))
        .into()),
    }
}
