//! Progress reporting: the explicit handle a caller passes into the
//! archiver instead of the pipeline touching any global terminal state
//! (§6 - "pass a progress sink and a logger as explicit handles").
//! Terminal rendering itself is an external collaborator's job, not this
//! crate's; this module only defines the contract and a couple of
//! trivial implementations of it.

use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::rcu::Rcu;

/// Events the archive pipeline reports as it runs. Every method has a
/// default no-op body so a caller only needs to implement the ones it
/// cares about.
pub trait ProgressSink: Send + Sync {
    /// A file finished being chunked and saved.
    fn file_done(&self, _path: &Utf8Path, _bytes: u64) {}
    /// A file was reused unchanged from the parent snapshot.
    fn file_reused(&self, _path: &Utf8Path) {}
    /// A directory's tree blob was saved.
    fn dir_done(&self, _path: &Utf8Path) {}
    /// An entry was skipped or aborted on due to an error.
    fn error(&self, _path: &Utf8Path, _message: &str) {}
}

/// Discards every event - the default when a caller doesn't want
/// progress reporting at all.
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Logs every event through `tracing`, at a level appropriate to its
/// severity. A reasonable default for non-interactive callers (cron
/// jobs, CI) that still want a record of what happened.
#[derive(Default)]
pub struct LoggingProgress;

impl ProgressSink for LoggingProgress {
    fn file_done(&self, path: &Utf8Path, bytes: u64) {
        tracing::debug!("{path}: saved ({bytes} bytes)");
    }

    fn file_reused(&self, path: &Utf8Path) {
        tracing::debug!("{path}: reused from parent snapshot");
    }

    fn dir_done(&self, path: &Utf8Path) {
        tracing::debug!("{path}: tree saved");
    }

    fn error(&self, path: &Utf8Path, message: &str) {
        tracing::warn!("{path}: {message}");
    }
}

/// Running totals plus the path currently being processed, published
/// through an [`Rcu`] so a renderer on another thread can poll it
/// without blocking the workers that update it.
pub struct Counters {
    pub files_done: AtomicU64,
    pub files_reused: AtomicU64,
    pub bytes_done: AtomicU64,
    pub errors: AtomicU64,
    current: Rcu<Box<Utf8Path>>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            files_done: AtomicU64::new(0),
            files_reused: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            current: Rcu::new(Utf8PathBuf::new().into_boxed_path()),
        }
    }
}

impl Counters {
    pub fn set_current(&self, path: &Utf8Path) {
        self.current.update(path.to_path_buf().into_boxed_path());
    }

    pub fn current(&self) -> Box<Utf8Path> {
        self.current.borrow().clone()
    }
}

impl ProgressSink for Counters {
    fn file_done(&self, path: &Utf8Path, bytes: u64) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.set_current(path);
    }

    fn file_reused(&self, path: &Utf8Path) {
        self.files_reused.fetch_add(1, Ordering::Relaxed);
        self.set_current(path);
    }

    fn dir_done(&self, path: &Utf8Path) {
        self.set_current(path);
    }

    fn error(&self, _path: &Utf8Path, _message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_accumulate_across_events() {
        let counters = Counters::default();
        counters.file_done(Utf8Path::new("a.txt"), 10);
        counters.file_done(Utf8Path::new("b.txt"), 5);
        counters.file_reused(Utf8Path::new("c.txt"));
        counters.error(Utf8Path::new("d.txt"), "boom");

        assert_eq!(counters.files_done.load(Ordering::Relaxed), 2);
        assert_eq!(counters.bytes_done.load(Ordering::Relaxed), 15);
        assert_eq!(counters.files_reused.load(Ordering::Relaxed), 1);
        assert_eq!(counters.errors.load(Ordering::Relaxed), 1);
        assert_eq!(&*counters.current(), Utf8Path::new("c.txt"));
    }

    #[test]
    fn null_progress_does_nothing_but_compiles_against_the_trait() {
        let sink: &dyn ProgressSink = &NullProgress;
        sink.file_done(Utf8Path::new("x"), 1);
    }
}
