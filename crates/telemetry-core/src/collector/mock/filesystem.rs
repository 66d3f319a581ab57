//! In-memory mock filesystem for testing readers without real `/sys`.
//!
//! Clones of a `MockFs` share the same backing store, so a test can hand a
//! clone to a reader and keep changing file contents between ticks.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct MockState {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
}

impl MockState {
    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

/// Shared in-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    state: Arc<RwLock<MockState>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds or replaces a file. Parent directories are created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.write_state();
        state.add_parents(&path);
        state.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.write_state();
        state.add_parents(&path);
        state.directories.insert(path);
    }

    /// Removes a file so subsequent reads fail with `NotFound`.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.write_state().files.remove(path.as_ref());
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.read_state().files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.read_state();
        state.files.contains_key(path) || state.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.read_state();
        if !state.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();
        for file_path in state.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }
        for dir_path in &state.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        let mut entries: Vec<PathBuf> = entries.into_iter().collect();
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let fs = MockFs::new();
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "48000\n");

        assert!(fs.exists(Path::new("/sys/class/thermal/thermal_zone0/temp")));
        assert!(fs.exists(Path::new("/sys/class/thermal")));
        assert_eq!(
            fs.read_first_line(Path::new("/sys/class/thermal/thermal_zone0/temp"))
                .unwrap(),
            "48000"
        );
    }

    #[test]
    fn test_mock_fs_clones_share_contents() {
        let fs = MockFs::new();
        let reader_view = fs.clone();
        fs.add_file("/sys/class/power_supply/BAT0/capacity", "80\n");
        assert!(reader_view.exists(Path::new("/sys/class/power_supply/BAT0/capacity")));

        fs.remove_file("/sys/class/power_supply/BAT0/capacity");
        let err = reader_view
            .read_to_string(Path::new("/sys/class/power_supply/BAT0/capacity"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_mock_fs_read_dir_lists_direct_children() {
        let fs = MockFs::new();
        fs.add_file("/sys/class/net/lo/statistics/rx_bytes", "0\n");
        fs.add_file("/sys/class/net/eth0/statistics/rx_bytes", "0\n");

        let entries = fs.read_dir(Path::new("/sys/class/net")).unwrap();
        assert_eq!(
            entries,
            vec![
                PathBuf::from("/sys/class/net/eth0"),
                PathBuf::from("/sys/class/net/lo")
            ]
        );
        assert!(fs.read_dir(Path::new("/sys/class/missing")).is_err());
    }
}
