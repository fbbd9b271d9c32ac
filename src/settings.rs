//! Ambient, local settings: worker-pool sizes, per-backend connection
//! concurrency, and the like. None of this is part of a repository - it's
//! read from `~/.config/cratepak.toml` the way the teacher's own
//! `config::load()` read `~/.config/backpak.toml`, and every field has a
//! sensible default if the file (or the field) is absent.

use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

const DEFAULT_FILE_WORKERS: usize = 10;
const DEFAULT_DIRECTORY_WORKERS: usize = 10;
const DEFAULT_BLOB_SAVE_TOKENS: u32 = 32;
const DEFAULT_BACKEND_CONNECTIONS: u32 = 5;
const DEFAULT_MAX_OPEN_PACKS: usize = 20;
const DEFAULT_INDEX_SAVE_INTERVAL_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;

#[inline]
fn default_soft_pack_size() -> Byte {
    Byte::from_u64(4 * 1024 * 1024)
}

#[inline]
fn default_hard_pack_size() -> Byte {
    Byte::from_u64(16 * 1024 * 1024)
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_file_workers")]
    pub file_workers: usize,
    #[serde(default = "default_directory_workers")]
    pub directory_workers: usize,
    #[serde(default = "default_blob_save_tokens")]
    pub blob_save_tokens: u32,
    #[serde(default = "default_backend_connections")]
    pub backend_connections: u32,
    #[serde(default = "default_max_open_packs")]
    pub max_open_packs: usize,
    #[serde(default = "default_soft_pack_size")]
    pub soft_pack_size: Byte,
    #[serde(default = "default_hard_pack_size")]
    pub hard_pack_size: Byte,
    #[serde(default = "default_index_save_interval_secs")]
    pub index_save_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

fn default_file_workers() -> usize {
    DEFAULT_FILE_WORKERS
}
fn default_directory_workers() -> usize {
    DEFAULT_DIRECTORY_WORKERS
}
fn default_blob_save_tokens() -> u32 {
    DEFAULT_BLOB_SAVE_TOKENS
}
fn default_backend_connections() -> u32 {
    DEFAULT_BACKEND_CONNECTIONS
}
fn default_max_open_packs() -> usize {
    DEFAULT_MAX_OPEN_PACKS
}
fn default_index_save_interval_secs() -> u64 {
    DEFAULT_INDEX_SAVE_INTERVAL_SECS
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_workers: DEFAULT_FILE_WORKERS,
            directory_workers: DEFAULT_DIRECTORY_WORKERS,
            blob_save_tokens: DEFAULT_BLOB_SAVE_TOKENS,
            backend_connections: DEFAULT_BACKEND_CONNECTIONS,
            max_open_packs: DEFAULT_MAX_OPEN_PACKS,
            soft_pack_size: default_soft_pack_size(),
            hard_pack_size: default_hard_pack_size(),
            index_save_interval_secs: DEFAULT_INDEX_SAVE_INTERVAL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
        }
    }
}

pub fn load() -> Result<Settings> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "cratepak.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let settings = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(settings)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_the_reference_numbers() {
        let settings = Settings::default();
        assert_eq!(settings.file_workers, 10);
        assert_eq!(settings.directory_workers, 10);
        assert_eq!(settings.blob_save_tokens, 32);
        assert_eq!(settings.backend_connections, 5);
        assert_eq!(settings.max_open_packs, 20);
        assert_eq!(settings.soft_pack_size.as_u64(), 4 * 1024 * 1024);
        assert_eq!(settings.hard_pack_size.as_u64(), 16 * 1024 * 1024);
        assert_eq!(settings.index_save_interval_secs, 30);
    }

    #[test]
    fn parses_a_partial_toml_file() -> Result<()> {
        let settings: Settings = toml::from_str("file_workers = 4\n")?;
        assert_eq!(settings.file_workers, 4);
        assert_eq!(settings.directory_workers, 10);
        Ok(())
    }
}
