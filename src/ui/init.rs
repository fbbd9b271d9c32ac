use anyhow::Result;
use camino::Utf8Path;
use tempfile::tempdir;

use crate::backend::Backend;
use crate::backend::fs::FilesystemBackend;
use crate::repository::Repository;
use crate::settings::Settings;

pub fn run(repository: &Utf8Path, settings: &Settings) -> Result<()> {
    let backend: Box<dyn Backend> = Box::new(FilesystemBackend::initialize(repository)?);
    let temp_dir = tempdir()?;
    let temp_dir = camino::Utf8PathBuf::from_path_buf(temp_dir.keep())
        .map_err(|p| anyhow::anyhow!("{p:?} isn't valid UTF-8"))?;

    Repository::init(backend, &super::password()?, temp_dir, settings, &mut rand::thread_rng())?;
    println!("Initialized repository at {repository}");
    Ok(())
}
