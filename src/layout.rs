//! Pure mapping from a backend handle `(type, name)` to a path on the
//! underlying object store. Kept separate from any one backend so that the
//! filesystem, an in-memory test double, or a future cloud backend all
//! agree on where things live.

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The kinds of named object a backend stores, per §4.1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Config,
    Key,
    Snapshot,
    Index,
    Data,
    Lock,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Config,
        FileType::Key,
        FileType::Snapshot,
        FileType::Index,
        FileType::Data,
        FileType::Lock,
    ];

    fn plural_dir_name(self) -> &'static str {
        match self {
            FileType::Config => "", // config is a single file, not a directory
            FileType::Key => "keys",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Data => "data",
            FileType::Lock => "locks",
        }
    }

    fn singular_dir_name(self) -> &'static str {
        match self {
            FileType::Config => "",
            FileType::Key => "key",
            FileType::Snapshot => "snapshot",
            FileType::Index => "index",
            FileType::Data => "data",
            FileType::Lock => "lock",
        }
    }
}

/// A `(type, name)` pair identifying an object on the backend. `name` is
/// empty only for `Config`; otherwise it's always 64 lower-case hex
/// characters (the handle-name constraint of §6).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let handle = Self { file_type, name };
        handle.validate()?;
        Ok(handle)
    }

    pub fn config() -> Self {
        Self {
            file_type: FileType::Config,
            name: String::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.file_type == FileType::Config {
            return Ok(());
        }
        let ok = self.name.len() == 64 && self.name.bytes().all(|b| b.is_ascii_hexdigit());
        if !ok {
            return Err(Error::InvalidHandle(format!(
                "{:?} name {:?} isn't 64 lower-case hex characters",
                self.file_type, self.name
            )));
        }
        Ok(())
    }
}

/// The three layout variants named in §6.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Layout {
    /// `/config`, `/keys/<name>`, `/data/<first-2-hex>/<name>`, ...
    Default,
    /// Singular directory names, no data subdirectory splitting. Matches
    /// how old S3-backed repositories were historically laid out.
    S3Legacy,
    /// Default's directory names, prefixed with an absolute URL.
    Cloud { base_url: String },
}

impl Layout {
    pub fn path(&self, handle: &Handle) -> Utf8PathBuf {
        let relative = match self {
            Layout::Default => default_relative_path(handle, true),
            Layout::Cloud { base_url } => {
                let rel = default_relative_path(handle, true);
                return Utf8PathBuf::from(format!("{base_url}/{rel}"));
            }
            Layout::S3Legacy => default_relative_path(handle, false),
        };
        relative
    }

    /// Chooses a layout per §4.1's precedence: explicit user string wins;
    /// failing that, autodetection against a directory listing; failing
    /// that, the backend's own default.
    ///
    /// `explicit` is a user-provided `default|s3-legacy|cloud` string.
    /// `top_level_dirs` is the set of entries found at the repository
    /// root, used for autodetection. `backend_default` is returned only
    /// when neither of the above settle it.
    pub fn detect(
        explicit: Option<&str>,
        top_level_dirs: &[String],
        backend_default: Layout,
    ) -> Result<Layout> {
        if let Some(explicit) = explicit {
            return parse_explicit(explicit);
        }

        let has = |name: &str| top_level_dirs.iter().any(|d| d == name);
        let looks_default = has("keys") || has("snapshots") || has("index");
        let looks_s3_legacy = has("key") || has("snapshot");

        match (looks_default, looks_s3_legacy) {
            (true, false) => Ok(Layout::Default),
            (false, true) => Ok(Layout::S3Legacy),
            (false, false) => Ok(backend_default),
            (true, true) => Err(Error::Configuration(format!(
                "ambiguous repository layout: top-level entries {top_level_dirs:?} match both \
                 the default and s3-legacy naming conventions; pass an explicit layout"
            ))),
        }
    }
}

fn default_relative_path(handle: &Handle, split_data: bool) -> Utf8PathBuf {
    let dir = if split_data {
        handle.file_type.plural_dir_name()
    } else {
        handle.file_type.singular_dir_name()
    };

    match handle.file_type {
        FileType::Config => Utf8PathBuf::from("config"),
        FileType::Data if split_data => {
            let prefix = &handle.name[..2];
            Utf8PathBuf::from(format!("{dir}/{prefix}/{}", handle.name))
        }
        _ => Utf8PathBuf::from(format!("{dir}/{}", handle.name)),
    }
}

fn parse_explicit(s: &str) -> Result<Layout> {
    match s {
        "default" => Ok(Layout::Default),
        "s3-legacy" => Ok(Layout::S3Legacy),
        "cloud" => Err(Error::Configuration(
            "the cloud layout requires a base URL; pass it via the backend config, not the \
             layout string"
                .to_string(),
        )),
        other => Err(Error::Configuration(format!(
            "unknown layout {other:?}; expected default, s3-legacy, or cloud"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn data_handle() -> Handle {
        Handle::new(
            FileType::Data,
            "ab".to_string() + &"0".repeat(62),
        )
        .unwrap()
    }

    #[test]
    fn rejects_short_names() {
        assert!(Handle::new(FileType::Data, "deadbeef").is_err());
    }

    #[test]
    fn config_handle_allows_empty_name() {
        assert!(Handle::config().validate().is_ok());
    }

    #[test]
    fn default_layout_splits_data_into_two_hex_subdirs() {
        let path = Layout::Default.path(&data_handle());
        assert!(path.as_str().starts_with("data/ab/ab"));
    }

    #[test]
    fn s3_legacy_uses_singular_names_and_no_split() {
        let path = Layout::S3Legacy.path(&data_handle());
        assert!(path.as_str().starts_with("data/ab"));
        assert!(!path.as_str().contains("data/ab/ab"));
    }

    #[test]
    fn cloud_layout_prefixes_a_url() {
        let layout = Layout::Cloud {
            base_url: "https://example.com/repo".to_string(),
        };
        let path = layout.path(&data_handle());
        assert!(path.as_str().starts_with("https://example.com/repo/data/"));
    }

    #[test]
    fn explicit_string_wins_over_autodetection() -> Result<()> {
        let layout = Layout::detect(
            Some("s3-legacy"),
            &["keys".to_string(), "snapshots".to_string()],
            Layout::Default,
        )?;
        assert_eq!(layout, Layout::S3Legacy);
        Ok(())
    }

    #[test]
    fn autodetects_default_layout() -> Result<()> {
        let layout = Layout::detect(
            None,
            &["keys".to_string(), "snapshots".to_string(), "index".to_string()],
            Layout::S3Legacy,
        )?;
        assert_eq!(layout, Layout::Default);
        Ok(())
    }

    #[test]
    fn autodetects_s3_legacy_layout() -> Result<()> {
        let layout = Layout::detect(
            None,
            &["key".to_string(), "snapshot".to_string()],
            Layout::Default,
        )?;
        assert_eq!(layout, Layout::S3Legacy);
        Ok(())
    }

    #[test]
    fn falls_back_to_backend_default_when_empty() -> Result<()> {
        let layout = Layout::detect(None, &[], Layout::Default)?;
        assert_eq!(layout, Layout::Default);
        Ok(())
    }

    #[test]
    fn ambiguous_autodetection_is_an_error() {
        let result = Layout::detect(
            None,
            &["keys".to_string(), "snapshot".to_string()],
            Layout::Default,
        );
        assert!(result.is_err());
    }
}
