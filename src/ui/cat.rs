use std::io::{self, Write};

use anyhow::{Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tempfile::tempdir;

use crate::backend::Backend;
use crate::backend::fs::FilesystemBackend;
use crate::cancel::CancellationToken;
use crate::hashing::ObjectId;
use crate::repository::Repository;
use crate::settings::Settings;
use crate::snapshot::{self, Snapshot};
use crate::tree::Tree;

/// Print a stored object (as JSON, or raw bytes for a data blob) to stdout
#[derive(Debug, Parser)]
pub struct Args {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Print a data blob's raw bytes
    Blob { id: ObjectId },
    /// Print a tree blob as JSON
    Tree { id: ObjectId },
    /// Print the snapshot whose id starts with the given prefix
    Snapshot { id_prefix: String },
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let backend: Box<dyn Backend> = Box::new(FilesystemBackend::open(repository, None)?);

    match args.subcommand {
        Subcommand::Snapshot { id_prefix } => {
            let snap = find_snapshot(backend.as_ref(), &id_prefix)?;
            serde_json::to_writer(io::stdout(), &snap)?;
            return Ok(());
        }
        Subcommand::Blob { id } => {
            let repo = open_repository(backend)?;
            let bytes = repo.load_blob(&id)?;
            io::stdout().write_all(&bytes)?;
        }
        Subcommand::Tree { id } => {
            let repo = open_repository(backend)?;
            let bytes = repo.load_blob(&id)?;
            let tree = Tree::from_bytes(&bytes, &id)?;
            serde_json::to_writer(io::stdout(), &tree)?;
        }
    }
    Ok(())
}

fn open_repository(backend: Box<dyn Backend>) -> Result<Repository> {
    let temp_dir = tempdir()?;
    let temp_dir = Utf8PathBuf::from_path_buf(temp_dir.keep())
        .map_err(|p| anyhow!("{p:?} isn't valid UTF-8"))?;
    Ok(Repository::open(backend, &super::password()?, temp_dir, &Settings::default())?)
}

fn find_snapshot(backend: &dyn Backend, id_prefix: &str) -> Result<Snapshot> {
    let cancel = CancellationToken::new();
    let matches: Vec<ObjectId> = snapshot::list(backend, &cancel)?
        .into_iter()
        .filter(|id| id.to_string().starts_with(id_prefix))
        .collect();
    match matches.as_slice() {
        [] => Err(anyhow!("No snapshot starts with {id_prefix}")),
        [id] => Ok(Snapshot::load(backend, id)?),
        _ => Err(anyhow!("{id_prefix} matches more than one snapshot")),
    }
}
