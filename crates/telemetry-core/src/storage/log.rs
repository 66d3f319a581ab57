//! Append-only CSV log of samples.
//!
//! The first line is a fixed header; every following line is one sample with
//! two decimals for the float columns. Each append is written in one call and
//! synced before returning, so a crash loses at most the record being written.
//!
//! On open, a trailing line without a newline (a record cut off by a crash)
//! is truncated away. Complete records are never rewritten.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::storage::model::Sample;

/// Header line written once when the log is created.
pub const HEADER: &str =
    "battery_voltage,battery_current,battery_capacity,temperature,net_throughput,timestamp";

const TAIL_BLOCK: u64 = 4096;

/// Error type for the durable log.
#[derive(Debug)]
pub enum LogError {
    Io { path: PathBuf, source: io::Error },
    Csv(csv::Error),
    /// The file exists but was written with a different column layout.
    HeaderMismatch { path: PathBuf, found: String },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            LogError::Csv(e) => write!(f, "CSV error: {}", e),
            LogError::HeaderMismatch { path, found } => write!(
                f,
                "{} has header {:?}, expected {:?}",
                path.display(),
                found,
                HEADER
            ),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Io { source, .. } => Some(source),
            LogError::Csv(e) => Some(e),
            LogError::HeaderMismatch { .. } => None,
        }
    }
}

impl From<csv::Error> for LogError {
    fn from(e: csv::Error) -> Self {
        LogError::Csv(e)
    }
}

/// Formats a sample as log columns.
pub fn format_record(sample: &Sample) -> [String; 6] {
    [
        format!("{:.2}", sample.battery_voltage),
        format!("{:.2}", sample.battery_current),
        format!("{:.2}", sample.battery_capacity),
        format!("{:.2}", sample.temperature),
        format!("{:.2}", sample.net_throughput),
        sample.timestamp.to_string(),
    ]
}

/// Formats a sample as one CSV line, newline included.
fn encode_record(sample: &Sample) -> Result<Vec<u8>, LogError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(64));
    writer.write_record(&format_record(sample))?;
    writer
        .into_inner()
        .map_err(|e| LogError::Csv(csv::Error::from(e.into_error())))
}

/// Appends samples to a CSV file.
///
/// Nothing is buffered between calls: every record goes to the file in one
/// write, and a failed append is rolled back to the previous length.
pub struct DurableLogger {
    path: PathBuf,
    file: File,
    appended: u64,
}

impl DurableLogger {
    /// Opens `path` for appending, creating it (and its directory) if needed.
    ///
    /// Writes the header only when the file is empty after recovery.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let io_err = |source| LogError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let len = file.metadata().map_err(io_err)?.len();
        let kept = if len > 0 {
            let complete = complete_length(&mut file, len).map_err(io_err)?;
            if complete < len {
                warn!(
                    "{}: dropping {} bytes of a partial record left by a crash",
                    path.display(),
                    len - complete
                );
                file.set_len(complete).map_err(io_err)?;
            }
            complete
        } else {
            0
        };

        if kept > 0 {
            check_header(&mut file, &path)?;
        }

        let mut logger = Self {
            path,
            file,
            appended: 0,
        };
        if kept == 0 {
            let header = format!("{HEADER}\n");
            logger.write_rolled_back(header.as_bytes(), |f, b| f.write_all(b))?;
            info!("created log {}", logger.path.display());
        } else {
            debug!("resuming log {} at {} bytes", logger.path.display(), kept);
        }
        Ok(logger)
    }

    /// Appends one record and syncs it to disk.
    ///
    /// On failure the file is truncated back to its previous length, so a
    /// failed append never leaves a partial line behind.
    pub fn append(&mut self, sample: &Sample) -> Result<(), LogError> {
        let line = encode_record(sample)?;
        self.write_rolled_back(&line, |f, b| f.write_all(b))?;
        self.appended += 1;
        Ok(())
    }

    /// Writes `bytes` with `write`, syncs, and truncates back on any error.
    fn write_rolled_back<W>(&mut self, bytes: &[u8], write: W) -> Result<(), LogError>
    where
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let io_err = |source| LogError::Io {
            path: self.path.clone(),
            source,
        };
        let before = self.file.metadata().map_err(io_err)?.len();

        let result = write(&mut self.file, bytes).and_then(|()| self.file.sync_data());
        if let Err(source) = result {
            if let Err(e) = self.file.set_len(before) {
                warn!(
                    "{}: cannot roll back failed append to {} bytes: {}",
                    self.path.display(),
                    before,
                    e
                );
            }
            return Err(LogError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this handle.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Syncs and closes the file.
    pub fn close(self) -> Result<(), LogError> {
        self.file.sync_all().map_err(|source| LogError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Swaps the handle for a read-only one so later appends fail.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> io::Result<()> {
        self.file = File::open(&self.path)?;
        Ok(())
    }
}

/// Returns the length of the file up to and including its last newline.
fn complete_length(file: &mut File, len: u64) -> io::Result<u64> {
    let mut end = len;
    let mut block = vec![0u8; TAIL_BLOCK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_BLOCK);
        let chunk = &mut block[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn check_header(file: &mut File, path: &Path) -> Result<(), LogError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|source| LogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let mut first = String::new();
    BufReader::new(&mut *file)
        .read_line(&mut first)
        .map_err(|source| LogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let found = first.trim_end_matches(['\r', '\n']);
    if found != HEADER {
        return Err(LogError::HeaderMismatch {
            path: path.to_path_buf(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// Reads every record of a log.
pub fn read_log(path: &Path) -> Result<Vec<Sample>, LogError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut samples = Vec::new();
    for record in reader.deserialize() {
        samples.push(record?);
    }
    Ok(samples)
}
