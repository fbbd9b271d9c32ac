//! A hand-rolled counting semaphore.
//!
//! `std` still doesn't ship one, and pulling in a whole async runtime just
//! to bound concurrency would be silly for a codebase that's plain OS
//! threads throughout. `atomic-wait` gives us a futex (or futex-equivalent)
//! to block on, so waiting threads actually sleep instead of spinning.
//!
//! Used for both the archiver's per-blob-save token pool and a backend's
//! connection concurrency limit.

use std::sync::atomic::{AtomicU32, Ordering};

use atomic_wait::{wait, wake_one};

pub struct Semaphore {
    count: AtomicU32,
}

pub struct SemaphoreGuard<'a> {
    count: &'a AtomicU32,
}

impl Semaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            count: AtomicU32::new(permits),
        }
    }

    /// Blocks until a permit is available, then holds it until the
    /// returned guard is dropped.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        // See https://www.remlab.net/op/futex-misc.shtml for the shape of
        // this loop: we don't bother with an initial relaxed load since a
        // single extra CAS is noise next to the I/O this guards.
        let mut prev = 1;
        loop {
            match self.count.compare_exchange_weak(
                prev,
                prev - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    if actual == 0 {
                        wait(&self.count, 0);
                        // A permit's been posted (the waker dropped its
                        // guard); assume it's just the one and retry from 1.
                        // If several posted at once, the CAS below just
                        // fails again and we loop.
                        prev = 1;
                    } else {
                        prev = actual;
                    }
                }
            }
        }
        SemaphoreGuard { count: &self.count }
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if self.count.fetch_add(1, Ordering::Release) == 0 {
            wake_one(self.count);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_up_to_the_limit_run_concurrently() {
        let sem = Arc::new(Semaphore::new(2));
        let a = sem.acquire();
        let b = sem.acquire();
        // A third acquire would block; we just check the first two didn't.
        drop(a);
        drop(b);
    }

    #[test]
    fn blocked_acquirer_wakes_on_release() {
        let sem = Arc::new(Semaphore::new(1));
        let guard = sem.acquire();

        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            let _g = sem2.acquire();
        });

        thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
    }
}
