//! The `Backend` trait: opaque, named-blob storage that everything above it
//! (crypto, packs, the index, the repository facade) is built on top of.
//!
//! A backend doesn't know about encryption, packs, or deduplication - it
//! just stores bytes under a `(type, name)` handle and lists them back by
//! type. Two implementations ship here: a filesystem backend for real use,
//! and an in-memory one for tests.

use std::io::Read;

use tracing::*;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::layout::{FileType, Handle};

pub mod fs;
pub mod memory;
pub mod semaphored;

pub use semaphored::Semaphored;

/// Metadata about a stored object.
#[derive(Debug, Copy, Clone)]
pub struct Stat {
    pub size: u64,
}

pub trait Backend: Send + Sync {
    /// Writes `reader` under `handle`. MUST fail with
    /// [`crate::error::Error::AlreadyExists`] if the handle is already
    /// occupied - every write here is write-once.
    fn save(&self, handle: &Handle, reader: &mut dyn Read) -> Result<()>;

    /// Reads `length` bytes starting at `offset` (0 meaning "to end").
    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Box<dyn Read + Send>>;

    fn stat(&self, handle: &Handle) -> Result<Stat>;

    fn test(&self, handle: &Handle) -> Result<bool>;

    /// Idempotent: removing something already gone is success, not an
    /// error.
    fn remove(&self, handle: &Handle) -> Result<()>;

    /// Lists every name stored under `file_type`. `cancel` is checked by
    /// backends whose listing genuinely streams (e.g. paginated network
    /// calls); the bundled backends here finish fast enough that they
    /// don't bother.
    fn list(&self, file_type: FileType, cancel: &CancellationToken) -> Result<Vec<String>>;

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Bulk-removes everything the backend holds. Only containers that can
    /// do this cheaply (a directory, an in-memory map) need implement it;
    /// the default refuses.
    fn delete(&self) -> Result<()> {
        Err(crate::error::Error::Configuration(
            "this backend doesn't support bulk delete".to_string(),
        ))
    }
}

/// Convenience: read an entire handle's contents into a `Vec<u8>`.
pub fn load_all(backend: &dyn Backend, handle: &Handle) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut reader = backend.load(handle, 0, 0)?;
    reader
        .read_to_end(&mut buf)
        .map_err(|e| crate::error::Error::io(handle.name.clone(), e))?;
    Ok(buf)
}

/// Saves `bytes` under `handle`; logs at `debug!` like the rest of the
/// repository's write path.
pub fn save_bytes(backend: &dyn Backend, handle: &Handle, bytes: &[u8]) -> Result<()> {
    debug!(
        "Saving {:?} {} ({} bytes)",
        handle.file_type,
        handle.name,
        bytes.len()
    );
    backend.save(handle, &mut std::io::Cursor::new(bytes))
}
