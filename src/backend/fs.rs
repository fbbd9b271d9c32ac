//! A filesystem-backed [`Backend`]: every handle maps to a real file under
//! a base directory via a [`Layout`].

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::layout::{FileType, Handle, Layout};

use super::{Backend, Stat};

pub struct FilesystemBackend {
    base_directory: Utf8PathBuf,
    layout: Layout,
    // Serializes `create_dir_all` calls so concurrent writers into a fresh
    // two-hex-char bucket don't race each other.
    dirs_made: Mutex<()>,
}

impl FilesystemBackend {
    /// Creates a brand new, empty repository directory tree.
    pub fn initialize(base_directory: impl Into<Utf8PathBuf>) -> Result<Self> {
        let base_directory = base_directory.into();
        if base_directory.exists() {
            return Err(Error::AlreadyExists(base_directory.to_string()));
        }
        fs::create_dir_all(&base_directory).map_err(|e| Error::io(&base_directory, e))?;

        let layout = Layout::Default;
        for file_type in FileType::ALL {
            if file_type == FileType::Config {
                continue;
            }
            let dummy = Handle::new(file_type, "0".repeat(64))?;
            let path = base_directory.join(layout.path(&dummy).parent().unwrap());
            fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        }

        Ok(Self {
            base_directory,
            layout,
            dirs_made: Mutex::new(()),
        })
    }

    /// Opens an existing repository directory, detecting its layout from
    /// what's actually on disk unless `explicit_layout` overrides it.
    pub fn open(base_directory: impl Into<Utf8PathBuf>, explicit_layout: Option<&str>) -> Result<Self> {
        let base_directory = base_directory.into();
        if !base_directory.exists() {
            return Err(Error::NotFound(base_directory.to_string()));
        }

        let top_level: Vec<String> = fs::read_dir(&base_directory)
            .map_err(|e| Error::io(&base_directory, e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();

        let layout = Layout::detect(explicit_layout, &top_level, Layout::Default)
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self {
            base_directory,
            layout,
            dirs_made: Mutex::new(()),
        })
    }

    fn full_path(&self, handle: &Handle) -> Utf8PathBuf {
        self.base_directory.join(self.layout.path(handle))
    }

    fn ensure_parent_dir(&self, path: &Utf8Path) -> Result<()> {
        let _guard = self.dirs_made.lock().unwrap();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        Ok(())
    }
}

impl Backend for FilesystemBackend {
    fn save(&self, handle: &Handle, reader: &mut dyn Read) -> Result<()> {
        let path = self.full_path(handle);
        if path.exists() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        self.ensure_parent_dir(&path)?;

        let tmp = path.with_extension("part");
        {
            let mut fh = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
            io::copy(reader, &mut fh).map_err(|e| Error::io(&tmp, e))?;
            fh.sync_all().map_err(|e| Error::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        trace!("Saved {path}");
        Ok(())
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        let path = self.full_path(handle);
        let mut fh = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(path.to_string())
            } else {
                Error::io(&path, e)
            }
        })?;
        if offset > 0 {
            fh.seek(SeekFrom::Start(offset)).map_err(|e| Error::io(&path, e))?;
        }
        if length == 0 {
            Ok(Box::new(fh))
        } else {
            Ok(Box::new(fh.take(length)))
        }
    }

    fn stat(&self, handle: &Handle) -> Result<Stat> {
        let path = self.full_path(handle);
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(path.to_string())
            } else {
                Error::io(&path, e)
            }
        })?;
        Ok(Stat { size: meta.len() })
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        Ok(self.full_path(handle).exists())
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let path = self.full_path(handle);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    fn list(&self, file_type: FileType, _cancel: &CancellationToken) -> Result<Vec<String>> {
        let probe = Handle {
            file_type,
            name: "0".repeat(64),
        };
        let dir = self
            .full_path(&probe)
            .parent()
            .map(|p| if file_type == FileType::Data { p.parent().unwrap_or(p) } else { p })
            .unwrap()
            .to_owned();

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        if file_type == FileType::Data && matches!(self.layout, Layout::Default | Layout::Cloud { .. }) {
            for bucket in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
                let bucket = bucket.map_err(|e| Error::io(&dir, e))?;
                if !bucket.path().is_dir() {
                    continue;
                }
                for entry in fs::read_dir(bucket.path()).map_err(|e| Error::io(&dir, e))? {
                    let entry = entry.map_err(|e| Error::io(&dir, e))?;
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        } else {
            for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
                let entry = entry.map_err(|e| Error::io(&dir, e))?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn delete(&self) -> Result<()> {
        fs::remove_dir_all(&self.base_directory).map_err(|e| Error::io(&self.base_directory, e))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::test_util::backend_contract;

    #[test]
    fn satisfies_the_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("repo")).unwrap();
        let backend = FilesystemBackend::initialize(&path).unwrap();
        backend_contract(&backend);
    }

    #[test]
    fn initialize_refuses_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        assert!(FilesystemBackend::initialize(&path).is_err());
    }

    #[test]
    fn detects_s3_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir(path.join("key")).unwrap();
        fs::create_dir(path.join("snapshot")).unwrap();

        let backend = FilesystemBackend::open(&path, None).unwrap();
        assert_eq!(backend.layout, Layout::S3Legacy);
    }
}
