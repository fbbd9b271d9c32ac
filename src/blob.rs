//! Defines [`Blob`], our fundamental unit of backup.

use serde_derive::*;

use crate::chunk::FileSpan;
use crate::hashing::ObjectId;

/// A chunk of a file or a tree to place in a pack.
///
/// Our fundamental unit of backup.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The bytes to back up
    pub contents: Contents,
    /// The ID of said bytes - always `hash(contents)`
    pub id: ObjectId,
    /// Is the blob a chunk of file data or a tree?
    pub kind: Type,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    /// A chunk of a file's contents.
    Data,
    /// File and directory metadata - a serialized [`crate::tree::Tree`].
    Tree,
}

impl Type {
    /// The subdirectory/handle-type name this kind of blob lives under.
    /// Note that on-disk, blobs of both kinds live inside *packs* -
    /// this matters for the repository's handle-type enum, not blob storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Type::Data => "data",
            Type::Tree => "tree",
        }
    }
}

/// Either part of a loaded file or a `Vec<u8>` buffer.
///
/// Formerly this was some `Box<dyn AsRef<u8> + Send + Sync>`,
/// but let's cut down on the indirection where there's only a few choices.
#[derive(Debug, Clone)]
pub enum Contents {
    Buffer(Vec<u8>),
    Span(FileSpan),
}

impl Blob {
    /// Convenience method to get at the blob's contents as a byte slice
    pub fn bytes(&self) -> &[u8] {
        match &self.contents {
            Contents::Buffer(v) => v,
            Contents::Span(s) => s.as_ref(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_round_trips_through_json() {
        assert_eq!(serde_json::to_string(&Type::Data).unwrap(), "\"data\"");
        assert_eq!(serde_json::to_string(&Type::Tree).unwrap(), "\"tree\"");
        assert_eq!(
            serde_json::from_str::<Type>("\"data\"").unwrap(),
            Type::Data
        );
    }
}
