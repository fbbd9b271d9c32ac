//! An in-memory [`Backend`], used by tests and as a reference for what a
//! minimal conforming backend looks like.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::layout::{FileType, Handle};

use super::{Backend, Stat};

#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<(FileType, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn save(&self, handle: &Handle, reader: &mut dyn Read) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let key = (handle.file_type, handle.name.clone());
        if files.contains_key(&key) {
            return Err(Error::AlreadyExists(handle.name.clone()));
        }
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| Error::io(handle.name.clone(), e))?;
        files.insert(key, buf);
        Ok(())
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        let files = self.files.lock().unwrap();
        let key = (handle.file_type, handle.name.clone());
        let bytes = files
            .get(&key)
            .ok_or_else(|| Error::NotFound(handle.name.clone()))?;

        let start = offset as usize;
        let end = if length == 0 {
            bytes.len()
        } else {
            (start + length as usize).min(bytes.len())
        };
        Ok(Box::new(io::Cursor::new(bytes[start..end].to_vec())))
    }

    fn stat(&self, handle: &Handle) -> Result<Stat> {
        let files = self.files.lock().unwrap();
        let key = (handle.file_type, handle.name.clone());
        files
            .get(&key)
            .map(|bytes| Stat {
                size: bytes.len() as u64,
            })
            .ok_or_else(|| Error::NotFound(handle.name.clone()))
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        let key = (handle.file_type, handle.name.clone());
        Ok(self.files.lock().unwrap().contains_key(&key))
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let key = (handle.file_type, handle.name.clone());
        self.files.lock().unwrap().remove(&key);
        Ok(())
    }

    fn list(&self, file_type: FileType, _cancel: &CancellationToken) -> Result<Vec<String>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|(t, _)| *t == file_type)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn delete(&self) -> Result<()> {
        self.files.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::test_util::backend_contract;

    #[test]
    fn satisfies_the_backend_contract() {
        backend_contract(&MemoryBackend::new());
    }

    #[test]
    fn partial_loads_respect_offset_and_length() {
        let backend = MemoryBackend::new();
        let handle = Handle::new(FileType::Data, "a".repeat(64)).unwrap();
        super::super::save_bytes(&backend, &handle, b"0123456789").unwrap();

        let mut buf = Vec::new();
        backend
            .load(&handle, 2, 3)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"234");
    }
}
