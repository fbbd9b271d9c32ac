//! Snapshots: the top-level object produced by a backup run, persisted
//! unpacked as a single JSON file under type snapshot.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{self, Backend};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::hashing::{ObjectId, canonical_json};
use crate::layout::{FileType, Handle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ObjectId>,
    pub tree: ObjectId,
    pub paths: BTreeSet<Utf8PathBuf>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Snapshot {
    /// Serializes the snapshot into its canonical bytes and the id those
    /// bytes hash to - also the snapshot's backend name.
    pub fn serialize_and_hash(&self) -> Result<(Vec<u8>, ObjectId)> {
        let bytes = canonical_json(self).map_err(|e| Error::Configuration(e.to_string()))?;
        let id = ObjectId::hash(&bytes);
        Ok((bytes, id))
    }

    /// Saves the snapshot under its content-addressed name; a collision
    /// (identical snapshot saved twice) is treated as a dedup hit, not an
    /// error, matching every other content-addressed write.
    pub fn save(&self, backend: &dyn Backend) -> Result<ObjectId> {
        let (bytes, id) = self.serialize_and_hash()?;
        let handle = Handle::new(FileType::Snapshot, id.to_string())?;
        match backend::save_bytes(backend, &handle, &bytes) {
            Ok(()) => {}
            Err(Error::AlreadyExists(_)) => {
                debug!("Snapshot {id} already exists, treating as a dedup hit");
            }
            Err(e) => return Err(e),
        }
        Ok(id)
    }

    /// Loads the snapshot named `id`, verifying its bytes hash back to it.
    pub fn load(backend: &dyn Backend, id: &ObjectId) -> Result<Self> {
        let handle = Handle::new(FileType::Snapshot, id.to_string())?;
        let bytes = backend::load_all(backend, &handle)?;
        let calculated = ObjectId::hash(&bytes);
        if calculated != *id {
            return Err(Error::Integrity {
                id: *id,
                reason: format!("snapshot bytes hash to {calculated} instead"),
            });
        }
        serde_json::from_slice(&bytes).map_err(Error::Json)
    }
}

/// Lists every snapshot id present in the backend, in no particular order.
pub fn list(backend: &dyn Backend, cancel: &CancellationToken) -> Result<Vec<ObjectId>> {
    backend
        .list(FileType::Snapshot, cancel)?
        .into_iter()
        .map(|name| {
            name.parse()
                .map_err(|_| Error::Configuration(format!("snapshot name {name:?} isn't a valid object id")))
        })
        .collect()
}

/// Loads every snapshot in the backend and sorts them by creation time,
/// oldest first - used to resolve the "last" snapshot shorthand.
pub fn load_chronologically(
    backend: &dyn Backend,
    cancel: &CancellationToken,
) -> Result<Vec<(ObjectId, Snapshot)>> {
    let mut snaps: Vec<(ObjectId, Snapshot)> = list(backend, cancel)?
        .into_iter()
        .map(|id| Snapshot::load(backend, &id).map(|s| (id, s)))
        .collect::<Result<_>>()?;
    snaps.sort_by_key(|(_, s)| s.time);
    Ok(snaps)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn sample() -> Snapshot {
        Snapshot {
            time: "1969-07-20T20:17:40Z".parse().unwrap(),
            parent: None,
            tree: ObjectId::hash(b"One small step"),
            paths: ["moon/orbit", "moon/tranquility-base"]
                .iter()
                .map(Utf8PathBuf::from)
                .collect(),
            hostname: "eagle".to_string(),
            username: "neil".to_string(),
            uid: 1000,
            gid: 1000,
            tags: ["apollo", "nasa"].iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn serializes_with_a_trailing_newline() -> Result<()> {
        let (bytes, _id) = sample().serialize_and_hash()?;
        assert!(bytes.ends_with(b"\n"));
        assert!(bytes.starts_with(b"{"));
        Ok(())
    }

    #[test]
    fn omits_parent_when_absent() -> Result<()> {
        let (bytes, _id) = sample().serialize_and_hash()?;
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("parent"));
        Ok(())
    }

    #[test]
    fn save_and_load_round_trip_through_a_backend() -> Result<()> {
        let backend = MemoryBackend::new();
        let snap = sample();
        let id = snap.save(&backend)?;

        let loaded = Snapshot::load(&backend, &id)?;
        assert_eq!(loaded, snap);
        Ok(())
    }

    #[test]
    fn saving_the_same_snapshot_twice_is_a_dedup_hit_not_an_error() -> Result<()> {
        let backend = MemoryBackend::new();
        let snap = sample();
        let id1 = snap.save(&backend)?;
        let id2 = snap.save(&backend)?;
        assert_eq!(id1, id2);
        Ok(())
    }

    #[test]
    fn load_chronologically_sorts_oldest_first() -> Result<()> {
        let backend = MemoryBackend::new();
        let mut later = sample();
        later.time = "2020-01-01T00:00:00Z".parse().unwrap();
        later.tree = ObjectId::hash(b"later tree");

        let early_id = sample().save(&backend)?;
        let later_id = later.save(&backend)?;

        let all = load_chronologically(&backend, &CancellationToken::new())?;
        assert_eq!(all.first().unwrap().0, early_id);
        assert_eq!(all.last().unwrap().0, later_id);
        Ok(())
    }
}
