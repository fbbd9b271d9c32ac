//! Trees: ordered sequences of filesystem entries ([`Node`]), serialized as
//! a canonical JSON array and hashed into a tree blob.

use std::collections::HashSet;

use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashing::{ObjectId, canonical_json};

/// A name that marks a flattening node (§4.7): its subtree's entries
/// replace it in the parent tree rather than nesting under it. Used when
/// a single source path resolves to a bare root like `/` or `.`.
pub fn is_flattening_name(name: &str) -> bool {
    name == "." || name == "/"
}

/// Node contents specific to each filesystem entry kind, tagged by `type`
/// in the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum NodeContents {
    File { size: u64, chunks: Vec<ObjectId> },
    Dir { subtree: ObjectId },
    Symlink { link_target: Utf8PathBuf },
    Fifo,
    Socket,
    Chardev { device: u64 },
    Blockdev { device: u64 },
}

impl NodeContents {
    pub fn chunks(&self) -> &[ObjectId] {
        match self {
            NodeContents::File { chunks, .. } => chunks,
            _ => panic!("expected a file node"),
        }
    }

    pub fn subtree(&self) -> &ObjectId {
        match self {
            NodeContents::Dir { subtree } => subtree,
            _ => panic!("expected a dir node"),
        }
    }
}

/// A single filesystem entry: common metadata plus kind-specific contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: Utf8PathBuf,
    pub mode: u32,
    pub mtime: Timestamp,
    pub atime: Timestamp,
    pub ctime: Timestamp,
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub inode: u64,
    pub links: u64,
    #[serde(flatten)]
    pub contents: NodeContents,
}

// Years 1-9999, per the node round-trip property (§8.5). jiff's Timestamp
// can represent years outside that range; a repository never should.
const MIN_YEAR: i16 = 1;
const MAX_YEAR: i16 = 9999;

fn year_in_range(ts: Timestamp) -> bool {
    let year = ts.to_zoned(jiff::tz::TimeZone::UTC).date().year();
    (MIN_YEAR..=MAX_YEAR).contains(&year)
}

impl Node {
    /// Builds a node, rejecting any timestamp outside years 1-9999.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Utf8PathBuf,
        mode: u32,
        mtime: Timestamp,
        atime: Timestamp,
        ctime: Timestamp,
        uid: u32,
        gid: u32,
        user: String,
        group: String,
        inode: u64,
        links: u64,
        contents: NodeContents,
    ) -> Result<Self> {
        for (label, ts) in [("mtime", mtime), ("atime", atime), ("ctime", ctime)] {
            if !year_in_range(ts) {
                return Err(Error::Configuration(format!(
                    "node {name:?}'s {label} is outside years 1-9999"
                )));
            }
        }
        Ok(Self {
            name,
            mode,
            mtime,
            atime,
            ctime,
            uid,
            gid,
            user,
            group,
            inode,
            links,
            contents,
        })
    }
}

/// An ordered sequence of nodes representing one directory. Names within a
/// tree must be unique; enforced at construction, not just by convention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tree(Vec<Node>);

impl Tree {
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.name.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate node name {:?} in tree",
                    node.name
                )));
            }
        }
        Ok(Self(nodes))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.0
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the tree into its canonical bytes and computes the id
    /// those bytes hash to - the tree blob's content address.
    pub fn serialize_and_hash(&self) -> Result<(Vec<u8>, ObjectId)> {
        let bytes = canonical_json(self).map_err(|e| Error::Configuration(e.to_string()))?;
        let id = ObjectId::hash(&bytes);
        Ok((bytes, id))
    }

    /// Reconstructs a tree from previously serialized bytes, verifying the
    /// bytes hash to `expected_id` before trusting the contents.
    pub fn from_bytes(bytes: &[u8], expected_id: &ObjectId) -> Result<Self> {
        let calculated = ObjectId::hash(bytes);
        if calculated != *expected_id {
            return Err(Error::Integrity {
                id: *expected_id,
                reason: format!("tree bytes hash to {calculated} instead"),
            });
        }
        serde_json::from_slice(bytes).map_err(Error::Json)
    }
}
