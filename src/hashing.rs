//! Tools for hashing everything we care about into a unique [`ObjectId`].

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256, digest::Output};

type Sha256Digest = Output<Sha256>;

/// The hash (SHA-256) used to identify every blob, pack, tree, snapshot,
/// and index in the repository. Two ids are equal iff the bytes they were
/// computed over are equal - that's the whole deduplication contract.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: Sha256Digest,
}

impl ObjectId {
    /// Calculates an id from the given bytes.
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() == 32, "expected a 32-byte object id");
        Ok(Self::from_digest(*Sha256Digest::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// Gets a git-like shortened version of the hash that's unique enough
    /// for most UI uses.
    pub fn short_name(&self) -> String {
        format!("{self}")[..8].to_string()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(
            s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()),
            "Expected 64 hex digits, got {s}"
        );
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .with_context(|| format!("Couldn't decode {s} as hex"))?;
        Self::from_bytes(&bytes)
    }
}

// Object ids are always persisted (and hashed over) as their hex string -
// the spec's backend-name constraint *is* the hex string, so there's no
// "raw bytes in storage, hex in UI" split to juggle like the old prettify
// global-hack serialization.
impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(&self.digest))
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<ObjectId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wraps a reader, hashing everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, R) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

/// Wraps a writer, hashing everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, W) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Serializes `value` to canonical JSON: whatever serde_json produces,
/// plus exactly one trailing newline. Every call site that persists a
/// tree, snapshot, index, or config object goes through this, since the
/// byte-for-byte result is what gets hashed into the object's id.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    const EXPECTED: &[u8] =
        &hex_literal::hex!("2cca07b57ec9bb130e3f1f6f1d7e5c3eb468a0fe1c4c4a7a9f0a331f51258069");

    #[test]
    fn smoke() {
        let id = ObjectId::hash(DEVELOPERS);
        assert_eq!(id.digest.as_slice(), EXPECTED);
    }

    #[test]
    fn round_trips_through_hex() -> Result<()> {
        let id = ObjectId::hash(DEVELOPERS);
        let s = format!("{id}");
        assert_eq!(s.len(), 64);
        let parsed: ObjectId = s.parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn round_trips_through_json() -> Result<()> {
        let id = ObjectId::hash(DEVELOPERS);
        let json = serde_json::to_string(&id)?;
        let parsed: ObjectId = serde_json::from_str(&json)?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("not hex".parse::<ObjectId>().is_err());
        assert!("abcd".parse::<ObjectId>().is_err());
    }

    #[test]
    fn reader() -> Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        assert_eq!(r.finalize().0.digest.as_slice(), EXPECTED);
        Ok(())
    }

    #[test]
    fn writer() -> Result<()> {
        let mut w = HashingWriter::new(io::sink());
        w.write_all(DEVELOPERS)?;
        assert_eq!(w.finalize().0.digest.as_slice(), EXPECTED);
        Ok(())
    }

    #[test]
    fn canonical_json_has_trailing_newline() -> Result<()> {
        let bytes = canonical_json(&42u32)?;
        assert_eq!(bytes, b"42\n");
        Ok(())
    }

    #[test]
    fn short_name_is_prefix() {
        let id = ObjectId::hash(DEVELOPERS);
        assert!(format!("{id}").starts_with(&id.short_name()));
        assert_eq!(id.short_name().len(), 8);
    }
}
