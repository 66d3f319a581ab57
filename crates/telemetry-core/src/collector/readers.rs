//! Scalar metric readers.
//!
//! A reader produces one value per call and may fail. The sampler never looks
//! behind the trait, so sysfs files, simulated generators and test closures
//! are interchangeable.

use std::f64::consts::TAU;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::collector::traits::FileSystem;

/// Error type for a single metric read.
#[derive(Debug)]
pub enum ReadError {
    /// The backing file could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The backing file held something that is not a number.
    Parse { path: PathBuf, value: String },
    /// The source has no value right now.
    Unavailable(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            ReadError::Parse { path, value } => {
                write!(f, "invalid value {:?} in {}", value, path.display())
            }
            ReadError::Unavailable(what) => write!(f, "{} unavailable", what),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Capability to read one scalar metric.
pub trait MetricReader: Send {
    fn read(&mut self) -> Result<f64, ReadError>;
}

impl<F> MetricReader for F
where
    F: FnMut() -> Result<f64, ReadError> + Send,
{
    fn read(&mut self) -> Result<f64, ReadError> {
        self()
    }
}

/// Reads the first line of a file and parses it as a number.
pub(crate) fn read_number<F: FileSystem, T: std::str::FromStr>(
    fs: &F,
    path: &Path,
) -> Result<T, ReadError> {
    let line = fs.read_first_line(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    line.parse().map_err(|_| ReadError::Parse {
        path: path.to_path_buf(),
        value: line,
    })
}

/// Reads a sysfs attribute and divides it by a fixed scale.
///
/// The kernel exposes temperatures in millidegrees and battery voltage and
/// current in micro-units.
pub struct SysfsReader<F: FileSystem> {
    fs: F,
    path: PathBuf,
    scale: f64,
}

impl<F: FileSystem> SysfsReader<F> {
    pub const MILLI: f64 = 1_000.0;
    pub const MICRO: f64 = 1_000_000.0;

    pub fn new(fs: F, path: impl Into<PathBuf>, scale: f64) -> Self {
        Self {
            fs,
            path: path.into(),
            scale,
        }
    }

    /// `<root>/class/thermal/<zone>/temp` in °C.
    pub fn thermal_zone(fs: F, sysfs_root: &Path, zone: &str) -> Self {
        let path = sysfs_root
            .join("class/thermal")
            .join(zone)
            .join("temp");
        Self::new(fs, path, Self::MILLI)
    }

    /// `<root>/class/power_supply/<battery>/voltage_now` in volts.
    pub fn battery_voltage(fs: F, sysfs_root: &Path, battery: &str) -> Self {
        Self::new(fs, power_supply(sysfs_root, battery, "voltage_now"), Self::MICRO)
    }

    /// `<root>/class/power_supply/<battery>/current_now` in amperes.
    pub fn battery_current(fs: F, sysfs_root: &Path, battery: &str) -> Self {
        Self::new(fs, power_supply(sysfs_root, battery, "current_now"), Self::MICRO)
    }

    /// `<root>/class/power_supply/<battery>/capacity` in percent.
    pub fn battery_capacity(fs: F, sysfs_root: &Path, battery: &str) -> Self {
        Self::new(fs, power_supply(sysfs_root, battery, "capacity"), 1.0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn power_supply(sysfs_root: &Path, battery: &str, attr: &str) -> PathBuf {
    sysfs_root
        .join("class/power_supply")
        .join(battery)
        .join(attr)
}

impl<F: FileSystem> MetricReader for SysfsReader<F> {
    fn read(&mut self) -> Result<f64, ReadError> {
        let raw: f64 = read_number(&self.fs, &self.path)?;
        Ok(raw / self.scale)
    }
}

/// Deterministic waveform standing in for a real sensor.
///
/// Produces `base + amplitude * sin(2π · n / period)` for the n-th read.
#[derive(Debug, Clone)]
pub struct SimulatedReader {
    base: f64,
    amplitude: f64,
    period: u32,
    tick: u32,
}

impl SimulatedReader {
    pub fn new(base: f64, amplitude: f64, period: u32) -> Self {
        Self {
            base,
            amplitude,
            period: period.max(1),
            tick: 0,
        }
    }

    /// CPU temperature swinging between 50 and 60 °C.
    pub fn temperature() -> Self {
        Self::new(55.0, 5.0, 120)
    }

    /// Battery capacity between 78 and 82 %.
    pub fn battery_capacity() -> Self {
        Self::new(80.0, 2.0, 600)
    }

    pub fn battery_voltage() -> Self {
        Self::new(11.8, 0.3, 300)
    }

    pub fn battery_current() -> Self {
        Self::new(1.2, 0.4, 45)
    }
}

impl MetricReader for SimulatedReader {
    fn read(&mut self) -> Result<f64, ReadError> {
        let phase = f64::from(self.tick % self.period) / f64::from(self.period);
        self.tick = self.tick.wrapping_add(1);
        Ok(self.base + self.amplitude * (TAU * phase).sin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_sysfs_reader_scales_millidegrees() {
        let fs = MockFs::laptop_on_battery();
        let mut reader = SysfsReader::thermal_zone(fs, Path::new("/sys"), "thermal_zone0");
        let value = reader.read().unwrap();
        assert!((value - 48.25).abs() < 1e-9);
    }

    #[test]
    fn test_sysfs_reader_battery_attributes() {
        let fs = MockFs::laptop_on_battery();
        let root = Path::new("/sys");

        let voltage = SysfsReader::battery_voltage(fs.clone(), root, "BAT0")
            .read()
            .unwrap();
        let current = SysfsReader::battery_current(fs.clone(), root, "BAT0")
            .read()
            .unwrap();
        let capacity = SysfsReader::battery_capacity(fs, root, "BAT0")
            .read()
            .unwrap();

        assert!((voltage - 11.85).abs() < 1e-9);
        assert!((current - 1.25).abs() < 1e-9);
        assert_eq!(capacity, 80.0);
    }

    #[test]
    fn test_sysfs_reader_missing_file() {
        let fs = MockFs::laptop_on_battery();
        let mut reader = SysfsReader::battery_capacity(fs, Path::new("/sys"), "BAT1");
        match reader.read() {
            Err(ReadError::Io { path, source }) => {
                assert_eq!(path, Path::new("/sys/class/power_supply/BAT1/capacity"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_sysfs_reader_garbage_is_parse_error() {
        let fs = MockFs::laptop_on_battery();
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "N/A\n");
        let mut reader = SysfsReader::thermal_zone(fs, Path::new("/sys"), "thermal_zone0");
        assert!(matches!(
            reader.read(),
            Err(ReadError::Parse { ref value, .. }) if value == "N/A"
        ));
    }

    #[test]
    fn test_simulated_reader_stays_in_range() {
        let mut reader = SimulatedReader::temperature();
        for _ in 0..240 {
            let value = reader.read().unwrap();
            assert!((50.0..=60.0).contains(&value), "out of range: {value}");
        }
    }

    #[test]
    fn test_closure_reader() {
        let mut calls = 0;
        let mut reader = move || {
            calls += 1;
            if calls == 1 {
                Ok(1.5)
            } else {
                Err(ReadError::Unavailable("sensor".into()))
            }
        };
        assert_eq!(MetricReader::read(&mut reader).unwrap(), 1.5);
        let err = MetricReader::read(&mut reader).unwrap_err();
        assert_eq!(err.to_string(), "sensor unavailable");
    }
}
