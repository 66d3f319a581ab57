//! Host metric collection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Sampler                            │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐ │
//! │  │  MetricReader ×4         │   │  ByteCounters            │ │
//! │  │  - thermal_zone*/temp    │   │  - statistics/*_bytes    │ │
//! │  │  - power_supply/BAT*/*   │   │  - /proc/net/dev         │ │
//! │  └────────────┬─────────────┘   └────────────┬─────────────┘ │
//! │               │                  ThroughputTracker           │
//! │               └───────────────┬──────────────┘               │
//! │                        ┌──────▼──────┐                       │
//! │                        │  FileSystem │ (trait)               │
//! │                        └──────┬──────┘                       │
//! └───────────────────────────────┼──────────────────────────────┘
//!                ┌────────────────┼────────────────┐
//!         ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐
//!         │   RealFs    │  │   MockFs    │  │  Scenarios  │
//!         │  (Linux)    │  │  (Testing)  │  │ (Fixtures)  │
//!         └─────────────┘  └─────────────┘  └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use std::path::Path;
//! use std::time::Duration;
//! use telemetry_core::collector::{MockFs, Sampler, SysfsReader};
//!
//! let fs = MockFs::laptop_on_battery();
//! let mut sampler = Sampler::new(Duration::from_secs(1))
//!     .with_temperature(SysfsReader::thermal_zone(fs, Path::new("/sys"), "thermal_zone0"));
//! let sample = sampler.tick(1_700_000_000);
//! assert_eq!(sample.temperature, 48.25);
//! ```

pub mod mock;
pub mod net;
pub mod readers;
pub mod sampler;
pub mod traits;

pub use mock::MockFs;
pub use net::{ByteCounters, ProcNetDevCounters, SimulatedCounters, SysfsNetCounters, detect_interface};
pub use readers::{MetricReader, ReadError, SimulatedReader, SysfsReader};
pub use sampler::Sampler;
pub use traits::{FileSystem, RealFs};
