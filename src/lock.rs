//! Locks: short-lived JSON objects identifying a process, used to
//! arbitrate exclusive (pruning) vs. shared (reading, backing up) access
//! to a repository. No teacher precedent - built directly from §3/§4.2's
//! description, resolving the granularity open question as a single
//! whole-repository lock rather than per-operation locks (pruning is the
//! only operation the spec names as needing exclusivity, so there is only
//! ever one thing to arbitrate against).

use jiff::Timestamp;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{self, Backend};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::hashing::{ObjectId, canonical_json};
use crate::layout::{FileType, Handle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub pid: u32,
    pub hostname: String,
    pub start: Timestamp,
    pub exclusive: bool,
}

impl Lock {
    fn new(exclusive: bool) -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            start: Timestamp::now(),
            exclusive,
        }
    }
}

/// Every other lock in the repository, found while trying to take one of
/// our own.
fn list(backend: &dyn Backend, cancel: &CancellationToken) -> Result<Vec<(ObjectId, Lock)>> {
    backend
        .list(FileType::Lock, cancel)?
        .into_iter()
        .map(|name| {
            let id: ObjectId = name
                .parse()
                .map_err(|_| Error::Configuration(format!("lock name {name:?} isn't a valid id")))?;
            let handle = Handle::new(FileType::Lock, name)?;
            let bytes = backend::load_all(backend, &handle)?;
            let lock: Lock = serde_json::from_slice(&bytes).map_err(Error::Json)?;
            Ok((id, lock))
        })
        .collect()
}

/// A held lock; dropping it removes the backend object. Holding onto this
/// is how a caller keeps the repository locked for the scope of an
/// operation.
pub struct Guard<'a> {
    backend: &'a dyn Backend,
    handle: Handle,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.remove(&self.handle) {
            warn!("Couldn't release lock {}: {e}", self.handle.name);
        }
    }
}

/// Attempts to take a lock. An exclusive request is blocked by any
/// existing lock (shared or exclusive); a shared request is blocked only
/// by an existing exclusive lock.
pub fn acquire<'a>(
    backend: &'a dyn Backend,
    exclusive: bool,
    cancel: &CancellationToken,
    rng: &mut impl RngCore,
) -> Result<Guard<'a>> {
    let existing = list(backend, cancel)?;
    let blocked = if exclusive {
        !existing.is_empty()
    } else {
        existing.iter().any(|(_, lock)| lock.exclusive)
    };
    if blocked {
        return Err(Error::Configuration(
            "repository is locked by another process".to_string(),
        ));
    }

    let lock = Lock::new(exclusive);
    let bytes = canonical_json(&lock).map_err(|e| Error::Configuration(e.to_string()))?;

    // The name doesn't need to be a content hash the way a blob's does -
    // locks aren't deduplicated - but the handle contract still requires
    // 64 hex characters, so we mint a random one.
    let mut id_bytes = [0u8; 32];
    rng.fill_bytes(&mut id_bytes);
    let id = ObjectId::from_bytes(&id_bytes).expect("32 bytes");
    let handle = Handle::new(FileType::Lock, id.to_string())?;
    backend::save_bytes(backend, &handle, &bytes)?;
    debug!("Acquired {} lock {id}", if exclusive { "exclusive" } else { "shared" });

    Ok(Guard { backend, handle })
}
