//! The pack binary format, and the pack builder / content manager that
//! serializes new blobs into a small bounded set of open packs.
//!
//! A pack is, in order: the concatenated encrypted blobs, an encrypted
//! header of fixed-size `(type, length, id)` records, and a 4-byte
//! little-endian trailer giving the plaintext header length. A pack's id
//! (and backend name) is the hash of its own bytes, computed as they're
//! written.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Mutex;

use byte_unit::Byte;
use camino::{Utf8Path, Utf8PathBuf};
use rand::RngCore;
use tempfile::NamedTempFile;
use tracing::*;

use crate::backend::{self, Backend};
use crate::blob::{self, Blob};
use crate::crypto::{self, Keys};
use crate::error::{Error, Result};
use crate::hashing::ObjectId;
use crate::index::{BlobRecord, Index, InFlightLocation};
use crate::layout::{FileType, Handle};

/// zstd's "pretty good, pretty fast" level - blob contents are already
/// chunked for dedup, not for maximum ratio, so there's little to gain
/// from a slower level.
const COMPRESSION_LEVEL: i32 = 3;

fn compress(plaintext: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(plaintext, COMPRESSION_LEVEL)
        .map_err(|e| Error::Configuration(format!("zstd compression failed: {e}")))
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(compressed)
        .map_err(|e| Error::Configuration(format!("zstd decompression failed: {e}")))
}

/// Decrypts then decompresses a sealed blob, however its ciphertext bytes
/// were obtained (a finalized pack's byte range, or an in-flight pack's
/// temp file).
fn open_sealed(keys: &Keys, sealed: &[u8]) -> Result<Vec<u8>> {
    let compressed = crypto::decrypt(keys, sealed, "pack blob")
        .map_err(|e| Error::Configuration(e.to_string()))?;
    decompress(&compressed)
}

const HEADER_RECORD_LEN: usize = 1 + 4 + 32;
const TRAILER_LEN: usize = 4;

fn encode_type(kind: blob::Type) -> u8 {
    match kind {
        blob::Type::Data => 0,
        blob::Type::Tree => 1,
    }
}

fn decode_type(byte: u8) -> Result<blob::Type> {
    match byte {
        0 => Ok(blob::Type::Data),
        1 => Ok(blob::Type::Tree),
        other => Err(Error::Configuration(format!(
            "unknown blob type byte {other} in pack header"
        ))),
    }
}

/// A single entry of a pack's (plaintext, pre-encryption) header.
#[derive(Debug, Clone, Copy)]
struct HeaderRecord {
    blob_type: blob::Type,
    length: u32,
    id: ObjectId,
}

fn encode_header(records: &[HeaderRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * HEADER_RECORD_LEN);
    for record in records {
        out.push(encode_type(record.blob_type));
        out.extend_from_slice(&record.length.to_le_bytes());
        out.extend_from_slice(record.id.as_bytes());
    }
    out
}

fn decode_header(bytes: &[u8]) -> Result<Vec<HeaderRecord>> {
    if bytes.len() % HEADER_RECORD_LEN != 0 {
        return Err(Error::Configuration(format!(
            "pack header length {} isn't a multiple of the record size {HEADER_RECORD_LEN}",
            bytes.len()
        )));
    }
    bytes
        .chunks_exact(HEADER_RECORD_LEN)
        .map(|chunk| {
            let blob_type = decode_type(chunk[0])?;
            let length = u32::from_le_bytes(chunk[1..5].try_into().unwrap());
            let id = ObjectId::from_bytes(&chunk[5..37])
                .map_err(|e| Error::Configuration(e.to_string()))?;
            Ok(HeaderRecord {
                blob_type,
                length,
                id,
            })
        })
        .collect()
}

/// A pack still being written to, backed by a temporary file on the host.
struct OpenPack {
    file: NamedTempFile,
    records: Vec<HeaderRecord>,
    size: u64,
}

fn utf8_path_of(path: &std::path::Path) -> Utf8PathBuf {
    Utf8Path::from_path(path)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| Utf8PathBuf::from("<non-utf8 temp path>"))
}

impl OpenPack {
    fn create(temp_dir: &Utf8PathBuf) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("cratepak-pack-")
            .suffix(".part")
            .tempfile_in(temp_dir)
            .map_err(|e| Error::io(temp_dir.clone(), e))?;
        Ok(Self {
            file,
            records: Vec::new(),
            size: 0,
        })
    }

    /// Appends a sealed blob to this pack's temp file, returning the byte
    /// offset it was written at - needed immediately to register an
    /// in-flight index location, not just once the pack is finalized.
    fn append(&mut self, id: ObjectId, kind: blob::Type, sealed: &[u8]) -> Result<u64> {
        let offset = self.size;
        self.file
            .write_all(sealed)
            .map_err(|e| Error::io(utf8_path_of(self.file.path()), e))?;
        self.records.push(HeaderRecord {
            blob_type: kind,
            length: sealed.len() as u32,
            id,
        });
        self.size += sealed.len() as u64;
        Ok(offset)
    }

    fn temp_path(&self) -> Utf8PathBuf {
        utf8_path_of(self.file.path())
    }

    /// Writes the encrypted header and length trailer, returning the
    /// finalized pack's id and full bytes.
    fn finalize(mut self, keys: &Keys, rng: &mut impl RngCore) -> Result<(ObjectId, Vec<u8>)> {
        let plaintext_header = encode_header(&self.records);
        let sealed_header = crypto::encrypt(keys, &plaintext_header, rng);

        let path = utf8_path_of(self.file.path());
        self.file
            .write_all(&sealed_header)
            .map_err(|e| Error::io(path.clone(), e))?;
        self.file
            .write_all(&(sealed_header.len() as u32).to_le_bytes())
            .map_err(|e| Error::io(path.clone(), e))?;
        self.file.flush().map_err(|e| Error::io(path.clone(), e))?;

        let mut bytes = Vec::new();
        self.file
            .reopen()
            .map_err(|e| Error::io(path.clone(), e))?
            .read_to_end(&mut bytes)
            .map_err(|e| Error::io(path, e))?;

        let id = ObjectId::hash(&bytes);
        Ok((id, bytes))
    }

    fn blob_records(&self) -> Vec<BlobRecord> {
        let mut offset = 0u64;
        self.records
            .iter()
            .map(|record| {
                let entry = BlobRecord {
                    id: record.id,
                    blob_type: record.blob_type,
                    offset,
                    length: record.length,
                };
                offset += record.length as u64;
                entry
            })
            .collect()
    }
}

/// Serializes new blob writes into a bounded set of open packs, flushes
/// packs that are large enough, uploads them, and registers their
/// contents in the index. Per §4.5, the open-pack list and the dedup set
/// are guarded by one mutex; a higher-throughput implementation could
/// pre-encrypt outside the lock and only append under it.
pub struct PackBuilder {
    keys: Keys,
    temp_dir: Utf8PathBuf,
    soft_size: u64,
    hard_size: u64,
    max_open_packs: usize,
    open: Mutex<Vec<OpenPack>>,
    enqueued: Mutex<HashSet<ObjectId>>,
}

impl PackBuilder {
    pub fn new(keys: Keys, temp_dir: impl Into<Utf8PathBuf>) -> Self {
        Self::with_limits(
            keys,
            temp_dir,
            4 * 1024 * 1024,
            16 * 1024 * 1024,
            20,
        )
    }

    pub fn with_limits(
        keys: Keys,
        temp_dir: impl Into<Utf8PathBuf>,
        soft_size: u64,
        hard_size: u64,
        max_open_packs: usize,
    ) -> Self {
        Self {
            keys,
            temp_dir: temp_dir.into(),
            soft_size,
            hard_size,
            max_open_packs,
            open: Mutex::new(Vec::new()),
            enqueued: Mutex::new(HashSet::new()),
        }
    }

    pub fn soft_size(&self) -> Byte {
        Byte::from_u64(self.soft_size)
    }

    /// Encrypts and enqueues `blob` into an open pack, unless it's already
    /// been enqueued by a concurrent caller (a dedup hit). Returns whether
    /// the blob was newly written. `backend` and `index` are only touched
    /// when the open-pack ceiling is hit and the largest open pack has to
    /// be flushed to make room.
    pub fn add_new_blob(
        &self,
        blob: &Blob,
        rng: &mut impl RngCore,
        backend: &dyn Backend,
        index: &Index,
    ) -> Result<bool> {
        {
            let mut enqueued = self.enqueued.lock().unwrap();
            if !enqueued.insert(blob.id) {
                return Ok(false);
            }
        }

        let compressed = compress(blob.bytes())?;
        let sealed = crypto::encrypt(&self.keys, &compressed, rng);
        let needed = sealed.len() as u64;

        let mut open = self.open.lock().unwrap();
        let slot = open
            .iter()
            .position(|pack| pack.size + needed < self.hard_size);

        let slot = match slot {
            Some(slot) => slot,
            None => {
                if open.len() >= self.max_open_packs {
                    if let Some((biggest, _)) = open.iter().enumerate().max_by_key(|(_, pack)| pack.size)
                    {
                        let pack = open.remove(biggest);
                        let entries = pack.blob_records();
                        let (id, bytes) = pack.finalize(&self.keys, rng)?;
                        let handle = Handle::new(FileType::Data, id.to_string())?;
                        backend::save_bytes(backend, &handle, &bytes)?;
                        index.add_pack(id, entries.clone())?;
                        for entry in &entries {
                            index.clear_in_flight(&entry.id);
                        }
                        debug!(
                            "Flushed largest open pack {id} to make room under the ceiling"
                        );
                    }
                }
                open.push(OpenPack::create(&self.temp_dir)?);
                open.len() - 1
            }
        };

        let offset = open[slot].append(blob.id, blob.kind, &sealed)?;
        index.mark_in_flight(
            blob.id,
            InFlightLocation {
                temp_path: open[slot].temp_path(),
                offset,
                length: needed as u32,
            },
        );
        Ok(true)
    }

    /// Finalizes and uploads every open pack at or above 80% of the hard
    /// size limit, registering each with `index`. Returns how many packs
    /// were flushed.
    pub fn save_full_packs(
        &self,
        backend: &dyn Backend,
        index: &Index,
        rng: &mut impl RngCore,
    ) -> Result<usize> {
        let threshold = self.hard_size * 4 / 5;
        self.flush_where(backend, index, rng, |pack| pack.size >= threshold)
    }

    /// Finalizes and uploads every open pack, regardless of size.
    pub fn save_all(
        &self,
        backend: &dyn Backend,
        index: &Index,
        rng: &mut impl RngCore,
    ) -> Result<usize> {
        self.flush_where(backend, index, rng, |_| true)
    }

    fn flush_where(
        &self,
        backend: &dyn Backend,
        index: &Index,
        rng: &mut impl RngCore,
        predicate: impl Fn(&OpenPack) -> bool,
    ) -> Result<usize> {
        let ready: Vec<OpenPack> = {
            let mut open = self.open.lock().unwrap();
            let mut ready = Vec::new();
            let mut remaining = Vec::new();
            for pack in open.drain(..) {
                if predicate(&pack) {
                    ready.push(pack);
                } else {
                    remaining.push(pack);
                }
            }
            *open = remaining;
            ready
        };

        let count = ready.len();
        for pack in ready {
            let entries = pack.blob_records();
            let (id, bytes) = pack.finalize(&self.keys, rng)?;
            let handle = Handle::new(FileType::Data, id.to_string())?;
            backend::save_bytes(backend, &handle, &bytes)?;
            index.add_pack(id, entries.clone())?;
            for entry in &entries {
                index.clear_in_flight(&entry.id);
            }
            debug!("Finalized pack {id} ({} bytes)", bytes.len());
        }
        Ok(count)
    }
}

/// Loads a single blob out of a pack's ciphertext, given the pack bytes
/// and the blob's `(offset, length)` as recorded in the index.
pub fn extract_blob(
    keys: &Keys,
    pack_bytes: &[u8],
    offset: u64,
    length: u32,
) -> Result<Vec<u8>> {
    let start = offset as usize;
    let end = start + length as usize;
    if end > pack_bytes.len() {
        return Err(Error::Configuration(
            "blob location runs past the end of its pack".to_string(),
        ));
    }
    open_sealed(keys, &pack_bytes[start..end])
}

/// Decrypts and decompresses a blob's sealed bytes read directly off an
/// in-flight pack's temp file, rather than a finalized pack's byte range.
pub fn open_in_flight_blob(keys: &Keys, sealed: &[u8]) -> Result<Vec<u8>> {
    open_sealed(keys, sealed)
}

/// Reads and authenticates a pack's header, returning its entries in
/// storage order (matching the offsets `finalize` assigned).
pub fn read_header(keys: &Keys, pack_bytes: &[u8]) -> Result<Vec<BlobRecord>> {
    if pack_bytes.len() < TRAILER_LEN {
        return Err(Error::Configuration("pack is shorter than its trailer".to_string()));
    }
    let (body, trailer) = pack_bytes.split_at(pack_bytes.len() - TRAILER_LEN);
    let header_len = u32::from_le_bytes(trailer.try_into().unwrap()) as usize;
    if header_len > body.len() {
        return Err(Error::Configuration(
            "pack header length trailer points before the start of the file".to_string(),
        ));
    }
    let (blobs_region, sealed_header) = body.split_at(body.len() - header_len);

    let plaintext_header = crypto::decrypt(keys, sealed_header, "pack header")
        .map_err(|e| Error::Configuration(e.to_string()))?;
    let records = decode_header(&plaintext_header)?;

    let mut offset = 0u64;
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        if offset + record.length as u64 > blobs_region.len() as u64 {
            return Err(Error::Configuration(
                "pack header describes more bytes than the pack contains".to_string(),
            ));
        }
        entries.push(BlobRecord {
            id: record.id,
            blob_type: record.blob_type,
            offset,
            length: record.length,
        });
        offset += record.length as u64;
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn test_keys() -> Keys {
        Keys::generate(&mut StdRng::seed_from_u64(1))
    }

    fn test_blob(contents: &[u8], kind: blob::Type) -> Blob {
        Blob {
            contents: blob::Contents::Buffer(contents.to_vec()),
            id: ObjectId::hash(contents),
            kind,
        }
    }

    fn builder(keys: Keys) -> PackBuilder {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so it outlives the builder in these short tests.
        let path = Utf8PathBuf::from_path_buf(dir.keep()).unwrap();
        PackBuilder::with_limits(keys, path, 1024, 4096, 4)
    }

    #[test]
    fn header_round_trips() {
        let records = vec![
            HeaderRecord {
                blob_type: blob::Type::Data,
                length: 42,
                id: ObjectId::hash(b"a"),
            },
            HeaderRecord {
                blob_type: blob::Type::Tree,
                length: 7,
                id: ObjectId::hash(b"b"),
            },
        ];
        let encoded = encode_header(&records);
        let decoded = decode_header(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, records[0].id);
        assert_eq!(decoded[1].length, 7);
    }

    #[test]
    fn dedup_hit_on_the_second_insert_of_the_same_blob() {
        let keys = test_keys();
        let builder = builder(keys);
        let backend = MemoryBackend::new();
        let index = Index::new();
        let mut rng = StdRng::seed_from_u64(2);
        let blob = test_blob(b"hello", blob::Type::Data);

        assert!(builder.add_new_blob(&blob, &mut rng, &backend, &index).unwrap());
        assert!(!builder.add_new_blob(&blob, &mut rng, &backend, &index).unwrap());
    }

    #[test]
    fn save_all_finalizes_and_registers_every_open_pack() -> Result<()> {
        let keys = test_keys();
        let builder = builder(keys.clone());
        let backend = MemoryBackend::new();
        let index = Index::new();
        let mut rng = StdRng::seed_from_u64(3);

        let blob = test_blob(b"some file content", blob::Type::Data);
        builder.add_new_blob(&blob, &mut rng, &backend, &index)?;

        let flushed = builder.save_all(&backend, &index, &mut rng)?;
        assert_eq!(flushed, 1);
        assert!(index.has(&blob.id));
        Ok(())
    }

    #[test]
    fn finalized_pack_round_trips_header_and_blob_bytes() -> Result<()> {
        let keys = test_keys();
        let builder = builder(keys.clone());
        let backend = MemoryBackend::new();
        let index = Index::new();
        let mut rng = StdRng::seed_from_u64(4);

        let a = test_blob(b"first blob", blob::Type::Data);
        let b = test_blob(b"second blob, a bit longer", blob::Type::Tree);
        builder.add_new_blob(&a, &mut rng, &backend, &index)?;
        builder.add_new_blob(&b, &mut rng, &backend, &index)?;
        builder.save_all(&backend, &index, &mut rng)?;

        let locations_a = index.find_blob(&a.id);
        assert_eq!(locations_a.len(), 1);
        let pack_id = locations_a[0].pack_id;
        let handle = Handle::new(FileType::Data, pack_id.to_string())?;
        let pack_bytes = backend::load_all(&backend, &handle)?;

        let header = read_header(&keys, &pack_bytes)?;
        assert_eq!(header.len(), 2);

        let entry_a = header.iter().find(|e| e.id == a.id).unwrap();
        let recovered = extract_blob(&keys, &pack_bytes, entry_a.offset, entry_a.length)?;
        assert_eq!(recovered, b"first blob");

        let entry_b = header.iter().find(|e| e.id == b.id).unwrap();
        assert_eq!(entry_b.blob_type, blob::Type::Tree);
        Ok(())
    }

    #[test]
    fn save_full_packs_leaves_small_packs_open() -> Result<()> {
        let keys = test_keys();
        let builder = builder(keys);
        let backend = MemoryBackend::new();
        let index = Index::new();
        let mut rng = StdRng::seed_from_u64(5);

        builder.add_new_blob(&test_blob(b"tiny", blob::Type::Data), &mut rng, &backend, &index)?;
        let flushed = builder.save_full_packs(&backend, &index, &mut rng)?;
        assert_eq!(flushed, 0);

        let flushed = builder.save_all(&backend, &index, &mut rng)?;
        assert_eq!(flushed, 1);
        Ok(())
    }
}
