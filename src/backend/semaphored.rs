//! Wraps any [`Backend`] with a connection-concurrency limit.
//!
//! Useful for backends that talk to the network, where letting every
//! worker thread open its own connection at once would just get requests
//! throttled or refused.

use std::io::Read;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::layout::{FileType, Handle};
use crate::semaphore::Semaphore;

use super::{Backend, Stat};

pub struct Semaphored<B> {
    inner: B,
    permits: Semaphore,
}

impl<B: Backend> Semaphored<B> {
    pub fn new(inner: B, concurrency: u32) -> Self {
        Self {
            inner,
            permits: Semaphore::new(concurrency),
        }
    }
}

impl<B: Backend> Backend for Semaphored<B> {
    fn save(&self, handle: &Handle, reader: &mut dyn Read) -> Result<()> {
        let _permit = self.permits.acquire();
        self.inner.save(handle, reader)
    }

    fn load(&self, handle: &Handle, offset: u64, length: u64) -> Result<Box<dyn Read + Send>> {
        let _permit = self.permits.acquire();
        self.inner.load(handle, offset, length)
    }

    fn stat(&self, handle: &Handle) -> Result<Stat> {
        let _permit = self.permits.acquire();
        self.inner.stat(handle)
    }

    fn test(&self, handle: &Handle) -> Result<bool> {
        let _permit = self.permits.acquire();
        self.inner.test(handle)
    }

    fn remove(&self, handle: &Handle) -> Result<()> {
        let _permit = self.permits.acquire();
        self.inner.remove(handle)
    }

    fn list(&self, file_type: FileType, cancel: &CancellationToken) -> Result<Vec<String>> {
        let _permit = self.permits.acquire();
        self.inner.list(file_type, cancel)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::test_util::backend_contract;

    #[test]
    fn satisfies_the_backend_contract() {
        let backend = Semaphored::new(MemoryBackend::new(), 4);
        backend_contract(&backend);
    }

    #[test]
    fn delegates_to_the_inner_backend() {
        let backend = Semaphored::new(MemoryBackend::new(), 1);
        let handle = Handle::new(FileType::Snapshot, "b".repeat(64)).unwrap();
        super::super::save_bytes(&backend, &handle, b"payload").unwrap();
        assert!(backend.test(&handle).unwrap());
    }
}
