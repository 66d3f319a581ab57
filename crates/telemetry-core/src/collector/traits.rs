//! Abstractions for filesystem access to enable testing and mocking.
//!
//! Metric readers go through the `FileSystem` trait so the same code reads
//! the real `/sys` and `/proc` trees on Linux and an in-memory `MockFs` in
//! tests or on hosts without those trees.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Reads the first line of a file with the trailing newline stripped.
    ///
    /// Sysfs attributes hold a single value terminated by `\n`.
    fn read_first_line(&self, path: &Path) -> io::Result<String> {
        let content = self.read_to_string(path)?;
        Ok(content.lines().next().unwrap_or("").trim().to_string())
    }
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}
