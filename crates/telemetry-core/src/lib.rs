//! Shared library for the host telemetry sampler.
//!
//! Provides:
//! - `analysis`: isolation-forest anomaly scoring over logged samples
//! - `collector`: metric readers (sysfs, procfs, simulated) and the per-tick `Sampler`
//! - `rates`: throughput derivation from cumulative byte counters
//! - `storage`: the sample model, shared memory snapshot slot and CSV log
//! - `sampling`: the periodic loop tying sampler, publisher and logger together
//! - `util`: helper utilities

pub mod analysis;
pub mod collector;
pub mod rates;
pub mod sampling;
pub mod storage;
pub mod util;
