//! Synchronisation primitives: a sequence lock and an adaptive spinner.
//!
//! The sequence lock keeps a single `u32` counter. Writers make it odd for
//! the duration of a write and even again afterwards; readers snapshot an
//! even value up front and re-check it after copying, discarding anything
//! they read if the counter moved. The same primitive serves three roles:
//! the shard-wide guard, the shard's exclusive mode, and the per-slot
//! write locks.

use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Upper bound on cooperative yields per failed acquisition.
pub const MAX_SPINS: u8 = 16;

/// Optimistic reader/writer sequence lock.
///
/// Readers never block writers and writers never wait for readers; a
/// reader that overlaps a write simply observes a changed counter and
/// retries. Writers spin against each other.
pub struct SeqLock {
    seq: AtomicU32,
}

impl SeqLock {
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    /// Begin an optimistic read.
    ///
    /// Returns the token to pass to [`read_validate`](Self::read_validate),
    /// or `None` if a writer currently holds the lock (counter is odd).
    /// Callers are expected to yield and retry rather than spin hard.
    #[inline]
    pub fn read_begin(&self) -> Option<u32> {
        let seq = self.seq.load(Ordering::Acquire);
        if seq & 1 == 1 {
            None
        } else {
            Some(seq)
        }
    }

    /// Check that no write overlapped the read section.
    ///
    /// The acquire fence orders the caller's data loads before the counter
    /// re-load, so a torn read can never validate.
    #[inline]
    pub fn read_validate(&self, token: u32) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == token
    }

    /// Acquire the write side, spinning until the counter is even and the
    /// transition to odd succeeds.
    #[inline]
    pub fn write_lock(&self) {
        let mut spin = Spinner::default();
        loop {
            let seq = self.seq.load(Ordering::Relaxed);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(
                        seq,
                        seq.wrapping_add(1),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            spin.spin();
        }
    }

    /// Release the write side, making the counter even again.
    #[inline]
    pub fn write_unlock(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }
}

impl Default for SeqLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Adaptive backoff for contended acquisitions.
///
/// Each failure yields the thread once more than the previous failure,
/// capped at [`MAX_SPINS`] yields. Yields are cooperative; the thread is
/// never put to sleep.
#[derive(Default)]
pub struct Spinner {
    failures: u8,
}

impl Spinner {
    #[inline]
    pub fn spin(&mut self) {
        self.failures = self.failures.saturating_add(1);
        let count = self.failures.min(MAX_SPINS);
        for _ in 0..count {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn read_token_survives_quiet_lock() {
        let lock = SeqLock::new();
        let token = lock.read_begin().unwrap();
        assert!(lock.read_validate(token));
    }

    #[test]
    fn write_invalidates_read_token() {
        let lock = SeqLock::new();
        let token = lock.read_begin().unwrap();
        lock.write_lock();
        lock.write_unlock();
        assert!(!lock.read_validate(token));
    }

    #[test]
    fn read_begin_fails_while_locked() {
        let lock = SeqLock::new();
        lock.write_lock();
        assert!(lock.read_begin().is_none());
        lock.write_unlock();
        assert!(lock.read_begin().is_some());
    }

    #[test]
    fn concurrent_writers_serialise() {
        let lock = Arc::new(SeqLock::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.write_lock();
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    lock.write_unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn spinner_caps_at_max() {
        let mut spin = Spinner::default();
        for _ in 0..1000 {
            spin.spin();
        }
        // saturates instead of wrapping back to short waits
        assert_eq!(spin.failures, u8::MAX);
    }
}
