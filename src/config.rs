//! The repository [`Config`] entity: a single unpacked JSON object living
//! at the backend's `config` handle, holding the repository version, the
//! per-repo chunker polynomial, and the names of the key files that can
//! open it.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, load_all, save_bytes};
use crate::error::{Error, Result};
use crate::hashing::canonical_json;
use crate::layout::Handle;
use crate::polynomial::Polynomial;

pub const REPOSITORY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub chunker_polynomial: Polynomial,
    /// Names of the key-type handles written against this repository.
    /// Informational only - `open()` lists the key file type directly
    /// rather than trusting this to be exhaustive.
    #[serde(default)]
    pub key_files: Vec<String>,
}

impl Config {
    /// Builds a fresh config around a repository-specific chunker
    /// polynomial, with no key files registered yet.
    pub fn new(chunker_polynomial: Polynomial) -> Self {
        Self {
            version: REPOSITORY_VERSION,
            chunker_polynomial,
            key_files: Vec::new(),
        }
    }

    pub fn with_key_file(mut self, name: impl Into<String>) -> Self {
        self.key_files.push(name.into());
        self
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        canonical_json(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("Couldn't parse config")
    }
}

/// Loads the config from `backend`, if one has been written.
pub fn load(backend: &dyn Backend) -> Result<Option<Config>> {
    let handle = Handle::config();
    if !backend.test(&handle)? {
        return Ok(None);
    }
    let bytes = load_all(backend, &handle)?;
    let config =
        Config::from_bytes(&bytes).map_err(|e| Error::Configuration(e.to_string()))?;
    Ok(Some(config))
}

/// Writes `config` to `backend`. Refuses if one is already present - init
/// is write-once, same as every other handle.
pub fn save(backend: &dyn Backend, config: &Config) -> Result<()> {
    let handle = Handle::config();
    if backend.test(&handle)? {
        return Err(Error::AlreadyExists("config".to_string()));
    }
    let bytes = config.to_bytes().map_err(|e| Error::Configuration(e.to_string()))?;
    save_bytes(backend, &handle, &bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn test_polynomial() -> Polynomial {
        Polynomial::random_irreducible(&mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn to_bytes_has_a_trailing_newline() -> anyhow::Result<()> {
        let config = Config::new(test_polynomial());
        let bytes = config.to_bytes()?;
        assert_eq!(bytes.last(), Some(&b'\n'));
        Ok(())
    }

    #[test]
    fn round_trips_through_bytes() -> anyhow::Result<()> {
        let config = Config::new(test_polynomial()).with_key_file("abc123");
        let bytes = config.to_bytes()?;
        let parsed = Config::from_bytes(&bytes)?;
        assert_eq!(parsed.version, config.version);
        assert_eq!(parsed.chunker_polynomial, config.chunker_polynomial);
        assert_eq!(parsed.key_files, config.key_files);
        Ok(())
    }

    #[test]
    fn round_trips_through_a_backend() -> Result<()> {
        let backend = MemoryBackend::new();
        assert!(load(&backend)?.is_none());

        let config = Config::new(test_polynomial());
        save(&backend, &config)?;

        let loaded = load(&backend)?.expect("config was just saved");
        assert_eq!(loaded.chunker_polynomial, config.chunker_polynomial);
        Ok(())
    }

    #[test]
    fn refuses_to_overwrite_an_existing_config() -> Result<()> {
        let backend = MemoryBackend::new();
        save(&backend, &Config::new(test_polynomial()))?;
        assert!(save(&backend, &Config::new(test_polynomial())).is_err());
        Ok(())
    }
}
