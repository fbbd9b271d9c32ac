//! Cut files into content-based chunks.
//!
//! Chunk boundaries are decided by a Rabin-style rolling fingerprint over a
//! sliding window, using a polynomial that's generated once at repository
//! init and kept secret in the repository config (see [`crate::polynomial`]).
//! That's a deliberate departure from FastCDC: a public, well-known chunking
//! function would let an attacker who can see pack sizes on the backend
//! guess plaintext boundaries. A secret per-repository polynomial means an
//! outside observer can't replicate our cut points even if they know the
//! algorithm.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use rayon::prelude::*;
use tracing::*;

use crate::blob::{self, Blob};
use crate::counters;
use crate::file_util;
use crate::hashing::ObjectId;
use crate::polynomial::Polynomial;

/// A span of a shared byte buffer,
/// similar to [`Bytes`](https://docs.rs/bytes/latest/bytes/struct.Bytes.html),
/// but referencing a file it came from.
///
/// All chunks from a file share the same underlying buffer via a refcount to
/// avoid reallocating the whole file, bit by bit, as we pass its chunks to the packer.
///
/// It would probably be nicer to just have the Arc and a slice into it,
/// but self-referential structures in Rust are a bit of a PITA...
#[derive(Debug, Clone)]
pub struct FileSpan {
    file: Arc<file_util::LoadedFile>,
    start: usize,
    end: usize,
}

impl AsRef<[u8]> for FileSpan {
    fn as_ref(&self) -> &[u8] {
        let bytes: &[u8] = self.file.bytes();
        &bytes[self.start..self.end]
    }
}

pub type ChunkedFile = Vec<Blob>;

/// Chunk size bounds. A reference configuration of MIN≈512KiB, MAX≈8MiB,
/// average≈1MiB, same order of magnitude Restic uses.
pub const MIN_SIZE: usize = 1024 * 512;
pub const TARGET_SIZE: usize = 1024 * 1024;
pub const MAX_SIZE: usize = 1024 * 1024 * 8;

/// Bytes of trailing context the rolling hash considers when deciding
/// whether to cut - large enough that a single-byte insert or delete
/// perturbs only a handful of candidate boundaries near it.
const WINDOW_SIZE: usize = 64;

/// A Rabin fingerprint rolled over the last `WINDOW_SIZE` bytes seen.
///
/// `roll()` is called once per input byte; it costs one GF(2) reduction (a
/// handful of XORs) and one table lookup, so chunking stays linear in the
/// input regardless of chunk count.
struct RollingHash {
    poly: Polynomial,
    /// out_table[b] == reduce(b * x^(8*WINDOW_SIZE) mod poly): the
    /// contribution a byte makes to the digest once it's `WINDOW_SIZE`
    /// bytes behind the cursor, used to cancel it back out.
    out_table: [Polynomial; 256],
    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    digest: u64,
    mask: u64,
}

impl RollingHash {
    fn new(poly: Polynomial, mask: u64) -> Self {
        let window_shift = Polynomial(0b10).modpow((8 * WINDOW_SIZE) as u64, poly);
        let mut out_table = [Polynomial(0); 256];
        for (b, entry) in out_table.iter_mut().enumerate() {
            *entry = Polynomial(b as u64).mulmod(window_shift, poly);
        }
        Self {
            poly,
            out_table,
            window: [0; WINDOW_SIZE],
            window_pos: 0,
            digest: 0,
            mask,
        }
    }

    fn reset(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.window_pos = 0;
        self.digest = 0;
    }

    /// Feeds one byte into the window. Returns true if the resulting
    /// digest matches the split mask - the caller still has to clamp this
    /// against MIN/MAX_SIZE.
    fn roll(&mut self, byte: u8) -> bool {
        let leaving = self.window[self.window_pos];
        self.window[self.window_pos] = byte;
        self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;

        let widened = ((self.digest as u128) << 8) | byte as u128;
        self.digest = self.poly.reduce(widened).0;
        self.digest ^= self.out_table[leaving as usize].0;

        self.digest & self.mask == self.mask
    }
}

/// Finds `(offset, length)` cut points for `data`, given the repository's
/// secret polynomial. Deterministic: the same polynomial and bytes always
/// produce the same boundaries, and a short prefix inserted ahead of `data`
/// only perturbs boundaries within one window-size of the insertion.
pub fn find_cut_points(
    poly: Polynomial,
    data: &[u8],
    min_size: usize,
    max_size: usize,
    target_size: usize,
) -> Vec<(usize, usize)> {
    if data.is_empty() {
        return Vec::new();
    }

    let bits = target_size.max(2).ilog2();
    let mask = (1u64 << bits) - 1;
    let mut hash = RollingHash::new(poly, mask);

    let mut points = Vec::new();
    let mut start = 0usize;
    for (i, &byte) in data.iter().enumerate() {
        let boundary_hit = hash.roll(byte);
        let len = i + 1 - start;
        if len >= max_size || (len >= min_size && boundary_hit) {
            points.push((start, len));
            start = i + 1;
            hash.reset();
        }
    }
    if start < data.len() {
        points.push((start, data.len() - start));
    }
    points
}

/// Cuts a file into content-based chunks using the repository's secret
/// polynomial.
///
/// See <https://restic.readthedocs.io/en/latest/100_references.html#backups-and-deduplication>
/// for the rationale behind content-defined chunking over fixed-size or
/// whole-file deduplication.
pub fn chunk_file<P: AsRef<Utf8Path>>(poly: Polynomial, path: P) -> Result<ChunkedFile> {
    let path: &Utf8Path = path.as_ref();

    let file = file_util::read_file(path).with_context(|| format!("Couldn't read {path}"))?;
    let file_bytes: &[u8] = file.bytes();

    trace!("Finding cut points for {path}");
    let cuts = find_cut_points(poly, file_bytes, MIN_SIZE, MAX_SIZE, TARGET_SIZE);
    debug!("Chunking {} into {} chunks", path, cuts.len());
    counters::add(counters::Op::ChunkCut, cuts.len());

    let chunks: Vec<Blob> = cuts
        .par_iter()
        .map(|&(start, len)| {
            let file = file.clone();
            let end = start + len;
            let span = FileSpan { file, start, end };

            let id = ObjectId::hash(span.as_ref());

            trace!("{}: [{}..{}] {}", path, start, end, id);

            Blob {
                contents: blob::Contents::Span(span),
                id,
                kind: blob::Type::Data,
            }
        })
        .collect();

    Ok(chunks)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn test_poly() -> Polynomial {
        Polynomial::random_irreducible(&mut StdRng::seed_from_u64(1))
    }

    #[test]
    fn empty_input_has_no_cuts() {
        assert!(find_cut_points(test_poly(), &[], 4, 16, 8).is_empty());
    }

    #[test]
    fn small_input_is_one_chunk() {
        let data = vec![7u8; 10];
        let cuts = find_cut_points(test_poly(), &data, 512, 8192, 1024);
        assert_eq!(cuts, vec![(0, 10)]);
    }

    #[test]
    fn never_exceeds_max_size() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let cuts = find_cut_points(test_poly(), &data, 64, 256, 128);
        for &(_, len) in &cuts {
            assert!(len <= 256, "chunk of length {len} exceeds MAX_SIZE");
        }
        let total: usize = cuts.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn is_deterministic() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 173) as u8).collect();
        let poly = test_poly();
        let a = find_cut_points(poly, &data, 64, 1024, 256);
        let b = find_cut_points(poly, &data, 64, 1024, 256);
        assert_eq!(a, b);
    }

    #[test]
    fn different_polynomials_cut_differently() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 197) as u8).collect();
        let a = find_cut_points(
            Polynomial::random_irreducible(&mut StdRng::seed_from_u64(1)),
            &data,
            64,
            1024,
            256,
        );
        let b = find_cut_points(
            Polynomial::random_irreducible(&mut StdRng::seed_from_u64(2)),
            &data,
            64,
            1024,
            256,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn cut_points_are_contiguous_and_reconstruct_the_input() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 211) as u8).collect();
        let cuts = find_cut_points(test_poly(), &data, 64, 1024, 256);

        let mut expected_start = 0usize;
        for &(start, len) in &cuts {
            assert_eq!(start, expected_start);
            assert!(len > 0);
            expected_start += len;
        }
        assert_eq!(expected_start, data.len());
    }
}
