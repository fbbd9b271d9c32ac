use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tempfile::tempdir;

use crate::archiver::{AbortOnError, Archiver};
use crate::backend::Backend;
use crate::backend::fs::FilesystemBackend;
use crate::cancel::CancellationToken;
use crate::filter;
use crate::hashing::ObjectId;
use crate::progress::LoggingProgress;
use crate::repository::Repository;
use crate::settings::Settings;
use crate::snapshot;

/// Back up the given paths into a new snapshot.
#[derive(Debug, Parser)]
pub struct Args {
    /// Skip anything whose absolute path matches the given regular expression
    #[arg(short = 's', long = "skip", name = "regex")]
    skips: Vec<String>,

    /// Back up as the child of this snapshot instead of autodetecting one
    #[arg(long)]
    parent: Option<ObjectId>,

    /// Add a metadata tag to the snapshot (can be specified multiple times)
    #[arg(short = 't', long = "tag", name = "tag")]
    tags: Vec<String>,

    /// The paths to back up; canonicalized into absolute paths before archiving
    #[arg(required = true)]
    paths: Vec<Utf8PathBuf>,
}

pub fn run(repository: &Utf8Path, settings: &Settings, args: Args) -> Result<()> {
    let paths: BTreeSet<Utf8PathBuf> = args
        .paths
        .into_iter()
        .map(|p| p.canonicalize_utf8().with_context(|| format!("Couldn't canonicalize {p}")))
        .collect::<Result<_>>()?;

    let backend: Box<dyn Backend> = Box::new(FilesystemBackend::open(repository, None)?);
    let temp_dir = tempdir()?;
    let temp_dir = Utf8PathBuf::from_path_buf(temp_dir.keep())
        .map_err(|p| anyhow::anyhow!("{p:?} isn't valid UTF-8"))?;

    let repo = Repository::open(backend, &super::password()?, temp_dir, settings)?;

    let parent = match args.parent {
        Some(id) => Some(id),
        None => latest_snapshot_touching(&repo, &paths)?,
    };

    let select = Arc::new(filter::skip_matching_paths(&args.skips)?);
    let archiver = Archiver::with_progress(
        &repo,
        settings,
        select,
        Arc::new(AbortOnError),
        Arc::new(LoggingProgress),
    );

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();
    let tags: BTreeSet<String> = args.tags.into_iter().collect();

    let snapshot_id = archiver.archive(&paths, parent, hostname, username, uid, gid, tags)?;
    println!("Created snapshot {snapshot_id}");
    println!(
        "{} files read, {} reused, {} directories packed",
        archiver.stats.files_read.load(std::sync::atomic::Ordering::Relaxed),
        archiver.stats.files_reused.load(std::sync::atomic::Ordering::Relaxed),
        archiver.stats.dirs_packed.load(std::sync::atomic::Ordering::Relaxed),
    );
    Ok(())
}

/// Picks the most recent snapshot that shares at least one path with this
/// backup, the same "parent autodetection" shorthand the spec's CLI
/// contract names without mandating a specific heuristic.
fn latest_snapshot_touching(repo: &Repository, paths: &BTreeSet<Utf8PathBuf>) -> Result<Option<ObjectId>> {
    let snaps = snapshot::load_chronologically(repo.backend(), &CancellationToken::new())?;
    Ok(snaps
        .into_iter()
        .rev()
        .find(|(_, snap)| snap.paths.iter().any(|p| paths.contains(p)))
        .map(|(id, _)| id))
}
