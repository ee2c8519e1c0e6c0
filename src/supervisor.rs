//! # Lifecycle Supervisor
//!
//! Process-level cleanup around the middleware engine:
//!
//! - [`ModuleSlot`] holds the current middleware handle and swaps it for a
//!   fresh one on [`Adapter::terminate_all`](crate::Adapter::terminate_all).
//! - [`LockSweeper`] removes stale lock files an earlier process left in
//!   the lock directory.
//!
//! Neither ever fails. Problems are logged at `warn`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::LockArtifactError;
use crate::middleware::{Middleware, MiddlewareFactory};

/// Lock artifact names the engine leaves behind.
pub const DEFAULT_LOCK_PATTERN: &str = r"vsomeip.*\.lck";

/// Attempts per lock file before giving up.
pub const DEFAULT_SWEEP_ATTEMPTS: u32 = 3;

/// Pause between attempts on one lock file.
pub const DEFAULT_SWEEP_BACKOFF: Duration = Duration::from_millis(100);

/// The current middleware handle.
pub struct ModuleSlot {
    factory: MiddlewareFactory,
    current: RwLock<Arc<dyn Middleware>>,
}

impl ModuleSlot {
    pub fn new(factory: MiddlewareFactory) -> Self {
        let current = RwLock::new(factory.produce());
        Self { factory, current }
    }

    pub fn get(&self) -> Arc<dyn Middleware> {
        self.current.read().clone()
    }

    /// Drop the current handle and take a fresh one from the factory.
    ///
    /// Sessions still holding the old handle keep it until they release it.
    pub fn reset(&self) {
        let fresh = self.factory.produce();
        let previous = std::mem::replace(&mut *self.current.write(), fresh);
        drop(previous);
        std::thread::yield_now();
        tracing::debug!("Middleware handle reset");
    }
}

impl std::fmt::Debug for ModuleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSlot")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

/// Removes stale lock files from one directory.
#[derive(Debug, Clone)]
pub struct LockSweeper {
    dir: PathBuf,
    attempts: u32,
    backoff: Duration,
}

impl LockSweeper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            attempts: DEFAULT_SWEEP_ATTEMPTS,
            backoff: DEFAULT_SWEEP_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove every file whose name matches `pattern` anywhere.
    ///
    /// Returns whether at least one file was removed. An invalid pattern or
    /// an unreadable directory removes nothing.
    pub fn sweep(&self, pattern: &str) -> bool {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!("Invalid lock pattern {:?}: {}", pattern, e);
                return false;
            }
        };
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", self.dir.display(), e);
                return false;
            }
        };

        let mut removed = false;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !regex.is_match(&name.to_string_lossy()) {
                continue;
            }
            match self.remove(&entry.path()) {
                Ok(true) => {
                    tracing::debug!("Removed stale lock {}", entry.path().display());
                    removed = true;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("{}", e),
            }
        }
        removed
    }

    /// `Ok(false)` when the file vanished before we got to it.
    fn remove(&self, path: &Path) -> std::result::Result<bool, LockArtifactError> {
        let mut attempt = 1;
        loop {
            match fs::remove_file(path) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(source) if attempt >= self.attempts => {
                    return Err(LockArtifactError {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source,
                    })
                }
                Err(e) => {
                    tracing::trace!("Removing {} failed ({}), retrying", path.display(), e);
                    attempt += 1;
                    std::thread::sleep(self.backoff);
                }
            }
        }
    }
}

impl Default for LockSweeper {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::LocalMiddleware;

    #[test]
    fn sweep_removes_matching_files_only() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vsomeip-0100.lck", "vsomeip.lck", "other.lck", "vsomeip.json"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let sweeper = LockSweeper::new(dir.path());
        assert!(sweeper.sweep(DEFAULT_LOCK_PATTERN));

        assert!(!dir.path().join("vsomeip-0100.lck").exists());
        assert!(!dir.path().join("vsomeip.lck").exists());
        assert!(dir.path().join("other.lck").exists());
        assert!(dir.path().join("vsomeip.json").exists());

        assert!(!sweeper.sweep(DEFAULT_LOCK_PATTERN));
    }

    #[test]
    fn stubborn_lock_is_retried_then_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // remove_file never succeeds on a directory
        fs::create_dir(dir.path().join("vsomeip-x.lck")).unwrap();

        let sweeper = LockSweeper::new(dir.path()).with_attempts(3, Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert!(!sweeper.sweep(DEFAULT_LOCK_PATTERN));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(dir.path().join("vsomeip-x.lck").is_dir());

        let err = sweeper.remove(&dir.path().join("vsomeip-x.lck")).unwrap_err();
        assert_eq!(err.attempts, 3);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vsomeip.lck"), b"").unwrap();

        let sweeper = LockSweeper::new(dir.path()).with_attempts(0, Duration::ZERO);
        assert!(sweeper.sweep(DEFAULT_LOCK_PATTERN));
    }

    #[test]
    fn sweep_never_fails() {
        let missing = LockSweeper::new("/nonexistent/lock/dir");
        assert!(!missing.sweep(DEFAULT_LOCK_PATTERN));

        let dir = tempfile::tempdir().unwrap();
        assert!(!LockSweeper::new(dir.path()).sweep("(unclosed"));
    }

    #[test]
    fn reset_produces_fresh_handle() {
        let slot = ModuleSlot::new(MiddlewareFactory::new(LocalMiddleware::new));
        let before = slot.get();
        slot.reset();
        assert!(!Arc::ptr_eq(&before, &slot.get()));
    }

    #[test]
    fn shared_factory_keeps_handle() {
        let shared: Arc<dyn Middleware> = Arc::new(LocalMiddleware::new());
        let slot = ModuleSlot::new(MiddlewareFactory::shared(shared.clone()));
        slot.reset();
        assert!(Arc::ptr_eq(&shared, &slot.get()));
    }
}
