//! Allocation of per-invocation run directories.
//!
//! Directories follow the `predict`, `predict2`, `predict3`, ... convention
//! under a shared root. Creation is exclusive, so concurrent callers never
//! receive the same directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_RUNS_ROOT: &str = "runs/detect";
pub const DEFAULT_RUN_PREFIX: &str = "predict";

#[derive(Debug)]
pub struct RunAllocator {
    root: PathBuf,
    prefix: String,
    // Next suffix to try; only a hint, the filesystem decides.
    next: AtomicU32,
}

impl RunAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_prefix(root, DEFAULT_RUN_PREFIX)
    }

    pub fn with_prefix(root: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.to_string(),
            next: AtomicU32::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_name(&self, n: u32) -> String {
        if n <= 1 {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, n)
        }
    }

    /// Create and return a fresh, empty run directory.
    pub fn allocate(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;

        let mut n = self.next.load(Ordering::Relaxed).max(1);
        loop {
            let candidate = self.root.join(self.dir_name(n));
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    self.next.fetch_max(n + 1, Ordering::Relaxed);
                    tracing::debug!(run_dir = %candidate.display(), "Allocated run directory");
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    n = n.checked_add(1).ok_or_else(|| {
                        io::Error::other(format!(
                            "Run directory suffixes exhausted under {}",
                            self.root.display()
                        ))
                    })?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
