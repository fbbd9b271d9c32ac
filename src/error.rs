//! The structured error taxonomy used across the repository core.
//!
//! CLI-facing code (the `ui` module and `main`) works in `anyhow::Result`
//! like the rest of the teacher codebase. Library code that needs to
//! branch on *kind* of failure (retry the next blob location on an
//! integrity error, swallow a not-found on an optional lookup, treat
//! already-exists as success for content-addressed writes) returns this
//! enum instead, so callers match variants instead of grepping strings.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hashing::ObjectId;

#[derive(Debug, Error)]
pub enum Error {
    /// Decryption's authentication tag didn't verify, or the recovered
    /// plaintext didn't hash to the id we were looking for.
    #[error("integrity failure for {id}: {reason}")]
    Integrity { id: ObjectId, reason: String },

    /// A mandatory handle wasn't present in the backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write landed on a name that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Network hiccup, 5xx, or similar - the backend itself should have
    /// retried a bounded number of times before this surfaces.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Bad chunker polynomial, unknown layout, wrong password, etc.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A handle (type, name) failed the basic shape check.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that the spec says an optional lookup should
    /// swallow into an empty result rather than propagate.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
