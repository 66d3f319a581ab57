//! Network byte counter sources.
//!
//! Each source returns the cumulative `(rx_bytes, tx_bytes)` of one interface.
//! Turning those into a rate is the job of [`ThroughputTracker`].
//!
//! [`ThroughputTracker`]: crate::rates::ThroughputTracker

use std::path::{Path, PathBuf};

use crate::collector::readers::{ReadError, read_number};
use crate::collector::traits::FileSystem;

/// Capability to read a pair of monotonically increasing byte counters.
pub trait ByteCounters: Send {
    fn read_counters(&mut self) -> Result<(u64, u64), ReadError>;
}

impl<F> ByteCounters for F
where
    F: FnMut() -> Result<(u64, u64), ReadError> + Send,
{
    fn read_counters(&mut self) -> Result<(u64, u64), ReadError> {
        self()
    }
}

/// Reads `<root>/class/net/<iface>/statistics/{rx,tx}_bytes`.
pub struct SysfsNetCounters<F: FileSystem> {
    fs: F,
    rx_path: PathBuf,
    tx_path: PathBuf,
}

impl<F: FileSystem> SysfsNetCounters<F> {
    pub fn new(fs: F, sysfs_root: &Path, interface: &str) -> Self {
        let stats = sysfs_root
            .join("class/net")
            .join(interface)
            .join("statistics");
        Self {
            fs,
            rx_path: stats.join("rx_bytes"),
            tx_path: stats.join("tx_bytes"),
        }
    }
}

impl<F: FileSystem> ByteCounters for SysfsNetCounters<F> {
    fn read_counters(&mut self) -> Result<(u64, u64), ReadError> {
        let rx = read_number(&self.fs, &self.rx_path)?;
        let tx = read_number(&self.fs, &self.tx_path)?;
        Ok((rx, tx))
    }
}

/// Reads one interface's line from `/proc/net/dev`.
///
/// Both counters come from a single read of the file, so they are consistent
/// with each other.
pub struct ProcNetDevCounters<F: FileSystem> {
    fs: F,
    path: PathBuf,
    interface: String,
}

impl<F: FileSystem> ProcNetDevCounters<F> {
    pub fn new(fs: F, proc_path: &Path, interface: impl Into<String>) -> Self {
        Self {
            fs,
            path: proc_path.join("net/dev"),
            interface: interface.into(),
        }
    }
}

impl<F: FileSystem> ByteCounters for ProcNetDevCounters<F> {
    fn read_counters(&mut self) -> Result<(u64, u64), ReadError> {
        let content = self
            .fs
            .read_to_string(&self.path)
            .map_err(|source| ReadError::Io {
                path: self.path.clone(),
                source,
            })?;

        let Some(line) = content.lines().find_map(|line| {
            let (name, rest) = line.split_once(':')?;
            (name.trim() == self.interface).then_some(rest)
        }) else {
            return Err(ReadError::Unavailable(format!(
                "interface {} in {}",
                self.interface,
                self.path.display()
            )));
        };

        parse_net_dev_counters(line).ok_or_else(|| ReadError::Parse {
            path: self.path.clone(),
            value: line.trim().to_string(),
        })
    }
}

/// Extracts receive bytes (column 0) and transmit bytes (column 8) from the
/// part of a `/proc/net/dev` line after the interface name.
fn parse_net_dev_counters(fields: &str) -> Option<(u64, u64)> {
    let columns: Vec<&str> = fields.split_whitespace().collect();
    if columns.len() < 9 {
        return None;
    }
    let rx = columns[0].parse().ok()?;
    let tx = columns[8].parse().ok()?;
    Some((rx, tx))
}

/// Simulated counters that grow by a fixed pattern on every read.
#[derive(Debug, Clone)]
pub struct SimulatedCounters {
    rx: u64,
    tx: u64,
    reads: u64,
}

impl SimulatedCounters {
    pub fn new() -> Self {
        Self {
            rx: 1_000_000,
            tx: 250_000,
            reads: 0,
        }
    }
}

impl Default for SimulatedCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCounters for SimulatedCounters {
    fn read_counters(&mut self) -> Result<(u64, u64), ReadError> {
        // 50..65 KiB/s total, cycling every 16 reads
        let step = 50 * 1024 + (self.reads % 16) * 1024;
        self.rx += step * 3 / 4;
        self.tx += step / 4;
        self.reads += 1;
        Ok((self.rx, self.tx))
    }
}

/// Picks the first non-loopback interface under `<root>/class/net`.
pub fn detect_interface<F: FileSystem>(fs: &F, sysfs_root: &Path) -> Option<String> {
    let mut names: Vec<String> = fs
        .read_dir(&sysfs_root.join("class/net"))
        .ok()?
        .into_iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .filter(|name| name != "lo")
        .collect();
    names.sort();
    names.into_iter().next()
}
