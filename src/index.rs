//! The master index: `blob-id -> {pack-id, type, offset, length}`, plus the
//! inverse `pack-id -> its blob records`. Persisted as one or more
//! `index`-type JSON files; merging every non-superseded one yields the
//! canonical view of what's in the repository.

use std::collections::HashSet;
use std::sync::RwLock;

use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{self, Backend};
use crate::blob;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::hashing::{ObjectId, canonical_json};
use crate::layout::{FileType, Handle};

/// A blob's location within a pack, as recorded in that pack's entry in
/// the index - no pack id, since it's implied by which pack list it's in.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub blob_type: blob::Type,
    pub offset: u64,
    pub length: u32,
}

/// A blob's location as returned by [`Index::find_blob`] - the pack id is
/// what's missing from a bare [`BlobRecord`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Location {
    pub pack_id: ObjectId,
    pub blob_type: blob::Type,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexedPack {
    id: ObjectId,
    blobs: Vec<BlobRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    supersedes: Vec<ObjectId>,
    packs: Vec<IndexedPack>,
}

/// Where an in-flight (not yet finalized) blob's sealed bytes can be read
/// directly off the local temp file backing its still-open pack, per
/// §4.5's ordering guarantee: a `save-blob` that returns must have its id
/// visible to a same-process `load-blob` before the pack is ever flushed.
#[derive(Debug, Clone)]
pub struct InFlightLocation {
    pub temp_path: Utf8PathBuf,
    pub offset: u64,
    pub length: u32,
}

#[derive(Default)]
pub struct Index {
    pack_entries: RwLock<FxHashMap<ObjectId, Vec<BlobRecord>>>,
    blob_locations: RwLock<FxHashMap<ObjectId, Vec<Location>>>,
    in_flight: RwLock<FxHashMap<ObjectId, InFlightLocation>>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a finalized pack's contents. Idempotent refusal if the
    /// pack id is already present.
    pub fn add_pack(&self, pack_id: ObjectId, entries: Vec<BlobRecord>) -> Result<()> {
        let mut packs = self.pack_entries.write().unwrap();
        if packs.contains_key(&pack_id) {
            return Err(Error::AlreadyExists(pack_id.to_string()));
        }

        let mut locations = self.blob_locations.write().unwrap();
        for entry in &entries {
            locations.entry(entry.id).or_default().push(Location {
                pack_id,
                blob_type: entry.blob_type,
                offset: entry.offset,
                length: entry.length,
            });
        }
        packs.insert(pack_id, entries);
        Ok(())
    }

    /// Merges a pack's entries in without failing if it's already present
    /// (used while loading index files, where the same pack can
    /// legitimately be mentioned by more than one surviving index).
    fn merge_pack(&self, pack_id: ObjectId, entries: Vec<BlobRecord>) {
        let mut packs = self.pack_entries.write().unwrap();
        if packs.contains_key(&pack_id) {
            trace!("Pack {pack_id} already known, skipping duplicate index entry");
            return;
        }
        let mut locations = self.blob_locations.write().unwrap();
        for entry in &entries {
            locations.entry(entry.id).or_default().push(Location {
                pack_id,
                blob_type: entry.blob_type,
                offset: entry.offset,
                length: entry.length,
            });
        }
        packs.insert(pack_id, entries);
    }

    /// Removes a pack and every blob location it contributed.
    pub fn remove_pack(&self, pack_id: &ObjectId) {
        let Some(entries) = self.pack_entries.write().unwrap().remove(pack_id) else {
            return;
        };
        let mut locations = self.blob_locations.write().unwrap();
        for entry in entries {
            if let Some(locs) = locations.get_mut(&entry.id) {
                locs.retain(|loc| loc.pack_id != *pack_id);
                if locs.is_empty() {
                    locations.remove(&entry.id);
                }
            }
        }
    }

    /// All known locations of `id`. Order isn't specified by the contract
    /// beyond being stable within a call.
    pub fn find_blob(&self, id: &ObjectId) -> Vec<Location> {
        self.blob_locations
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.blob_locations.read().unwrap().contains_key(id)
    }

    /// Registers where a just-enqueued blob's sealed bytes live on the
    /// host while its pack is still open, so a same-process `load-blob`
    /// can find it before any flush.
    pub fn mark_in_flight(&self, id: ObjectId, location: InFlightLocation) {
        self.in_flight.write().unwrap().insert(id, location);
    }

    /// The in-flight location for `id`, if its pack hasn't been finalized
    /// yet (or has and the entry just hasn't been cleared by a concurrent
    /// flush; the caller should fall back to [`Index::find_blob`] on a
    /// read failure).
    pub fn in_flight_location(&self, id: &ObjectId) -> Option<InFlightLocation> {
        self.in_flight.read().unwrap().get(id).cloned()
    }

    /// Drops an in-flight entry once its pack has been finalized and
    /// registered via [`Index::add_pack`].
    pub fn clear_in_flight(&self, id: &ObjectId) {
        self.in_flight.write().unwrap().remove(id);
    }

    pub fn lookup_size(&self, id: &ObjectId) -> Option<u32> {
        self.blob_locations
            .read()
            .unwrap()
            .get(id)
            .and_then(|locs| locs.first())
            .map(|loc| loc.length)
    }

    /// Blobs present in two or more packs - a diagnostic, not an error.
    pub fn duplicate_blobs(&self) -> HashSet<ObjectId> {
        self.blob_locations
            .read()
            .unwrap()
            .iter()
            .filter(|(_, locs)| locs.len() > 1)
            .map(|(id, _)| *id)
            .collect()
    }

    fn to_file(&self, supersedes: &[ObjectId]) -> IndexFile {
        let packs = self
            .pack_entries
            .read()
            .unwrap()
            .iter()
            .map(|(id, blobs)| IndexedPack {
                id: *id,
                blobs: blobs.clone(),
            })
            .collect();
        IndexFile {
            supersedes: supersedes.to_vec(),
            packs,
        }
    }

    /// Serializes the current index state into a fresh index file and
    /// uploads it, naming it by the hash of its own bytes.
    pub fn save(&self, backend: &dyn Backend, supersedes: &[ObjectId]) -> Result<ObjectId> {
        let file = self.to_file(supersedes);
        let bytes = canonical_json(&file).map_err(|e| Error::Configuration(e.to_string()))?;
        let id = ObjectId::hash(&bytes);
        let handle = Handle::new(FileType::Index, id.to_string())?;
        backend::save_bytes(backend, &handle, &bytes)?;
        debug!("Saved index {id} covering {} packs", file.packs.len());
        Ok(id)
    }

    /// Lists and loads every index file in `backend`, merging the
    /// non-superseded ones into a fresh `Index`.
    pub fn load(backend: &dyn Backend, cancel: &CancellationToken) -> Result<Self> {
        let names = backend.list(FileType::Index, cancel)?;

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let handle = Handle::new(FileType::Index, name)?;
            let bytes = backend::load_all(backend, &handle)?;
            let file: IndexFile =
                serde_json::from_slice(&bytes).map_err(|e| Error::Configuration(e.to_string()))?;
            let id = ObjectId::hash(&bytes);
            files.push((id, file));
        }

        let superseded: HashSet<ObjectId> = files
            .iter()
            .flat_map(|(_, file)| file.supersedes.iter().copied())
            .collect();

        let index = Self::new();
        for (id, file) in files {
            if superseded.contains(&id) {
                warn!("Index {id} is superseded, dropping it from the merged view");
                continue;
            }
            for pack in file.packs {
                index.merge_pack(pack.id, pack.blobs);
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn record(name: &str, offset: u64, length: u32) -> BlobRecord {
        BlobRecord {
            id: ObjectId::hash(name.as_bytes()),
            blob_type: blob::Type::Data,
            offset,
            length,
        }
    }

    #[test]
    fn add_and_find() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"pack-a");
        let entry = record("blob-a", 0, 100);
        index.add_pack(pack_id, vec![entry]).unwrap();

        assert!(index.has(&entry.id));
        let locs = index.find_blob(&entry.id);
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].pack_id, pack_id);
        assert_eq!(locs[0].length, 100);
    }

    #[test]
    fn add_pack_refuses_a_duplicate_id() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"pack-a");
        index.add_pack(pack_id, vec![record("blob-a", 0, 100)]).unwrap();
        assert!(index.add_pack(pack_id, vec![record("blob-b", 0, 50)]).is_err());
    }

    #[test]
    fn remove_pack_clears_its_blob_locations() {
        let index = Index::new();
        let pack_id = ObjectId::hash(b"pack-a");
        let entry = record("blob-a", 0, 100);
        index.add_pack(pack_id, vec![entry]).unwrap();

        index.remove_pack(&pack_id);
        assert!(!index.has(&entry.id));
        assert!(index.find_blob(&entry.id).is_empty());
    }

    #[test]
    fn duplicate_blobs_reports_multiply_packed_ids() {
        let index = Index::new();
        let entry = record("blob-a", 0, 100);
        index.add_pack(ObjectId::hash(b"pack-a"), vec![entry]).unwrap();
        index.add_pack(ObjectId::hash(b"pack-b"), vec![entry]).unwrap();

        let dupes = index.duplicate_blobs();
        assert_eq!(dupes.len(), 1);
        assert!(dupes.contains(&entry.id));
    }

    #[test]
    fn save_and_load_round_trip_through_a_backend() -> Result<()> {
        let backend = MemoryBackend::new();
        let index = Index::new();
        let pack_id = ObjectId::hash(b"pack-a");
        let entry = record("blob-a", 0, 100);
        index.add_pack(pack_id, vec![entry]).unwrap();
        index.save(&backend, &[])?;

        let loaded = Index::load(&backend, &CancellationToken::new())?;
        assert!(loaded.has(&entry.id));
        assert_eq!(loaded.find_blob(&entry.id)[0].pack_id, pack_id);
        Ok(())
    }

    #[test]
    fn load_drops_superseded_index_files() -> Result<()> {
        let backend = MemoryBackend::new();

        let old = Index::new();
        let old_pack = ObjectId::hash(b"old-pack");
        old.add_pack(old_pack, vec![record("old-blob", 0, 10)]).unwrap();
        let old_id = old.save(&backend, &[])?;

        let new = Index::new();
        let new_pack = ObjectId::hash(b"new-pack");
        new.add_pack(new_pack, vec![record("new-blob", 0, 10)]).unwrap();
        new.save(&backend, &[old_id])?;

        let loaded = Index::load(&backend, &CancellationToken::new())?;
        assert!(loaded.has(&ObjectId::hash(b"new-blob")));
        assert!(!loaded.has(&ObjectId::hash(b"old-blob")));
        Ok(())
    }
}
