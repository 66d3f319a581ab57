//! The record produced by one sampling tick.

use serde::{Deserialize, Serialize};

/// Placeholder stored in a field whose reader failed or is not configured.
///
/// The value is fixed by the log and shared slot formats, so it is not
/// distinguishable from a genuine reading of exactly `-1.0`. That reading is
/// possible for a signed `current_now` (-1.00 A while charging) and for a
/// temperature below freezing. The log keeps two decimals, so any such
/// reading in `(-1.005, -0.995)` is also recorded as `-1.00`. Consumers
/// (including [`Sample::missing`]) treat all of these as missing.
pub const SENTINEL: f32 = -1.0;

/// One immutable, timestamped set of host metrics.
///
/// Field order matches the durable log columns and the shared slot layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Battery voltage in volts.
    /// Source: `class/power_supply/<bat>/voltage_now` (µV)
    pub battery_voltage: f32,

    /// Battery current in amperes.
    /// Source: `class/power_supply/<bat>/current_now` (µA)
    pub battery_current: f32,

    /// Battery charge in percent.
    /// Source: `class/power_supply/<bat>/capacity`
    pub battery_capacity: f32,

    /// CPU temperature in °C.
    /// Source: `class/thermal/<zone>/temp` (millidegrees)
    pub temperature: f32,

    /// Combined rx + tx network throughput in KiB/s.
    /// Source: interface byte counters, delta against the previous tick
    pub net_throughput: f32,

    /// Unix time in seconds when the tick ran.
    pub timestamp: u64,
}

impl Sample {
    /// Column names in log order.
    pub const FIELDS: [&'static str; 6] = [
        "battery_voltage",
        "battery_current",
        "battery_capacity",
        "temperature",
        "net_throughput",
        "timestamp",
    ];

    /// A sample with every metric set to [`SENTINEL`].
    pub fn empty(timestamp: u64) -> Self {
        Self {
            battery_voltage: SENTINEL,
            battery_current: SENTINEL,
            battery_capacity: SENTINEL,
            temperature: SENTINEL,
            net_throughput: SENTINEL,
            timestamp,
        }
    }

    /// Float fields paired with their column names.
    pub fn metrics(&self) -> [(&'static str, f32); 5] {
        [
            ("battery_voltage", self.battery_voltage),
            ("battery_current", self.battery_current),
            ("battery_capacity", self.battery_capacity),
            ("temperature", self.temperature),
            ("net_throughput", self.net_throughput),
        ]
    }

    /// Names of the metrics that hold the sentinel.
    ///
    /// A genuine `-1.0` reading is reported here as well; see [`SENTINEL`].
    pub fn missing(&self) -> Vec<&'static str> {
        self.metrics()
            .into_iter()
            .filter(|(_, value)| *value == SENTINEL)
            .map(|(name, _)| name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample_is_all_sentinel() {
        let sample = Sample::empty(42);
        assert_eq!(sample.timestamp, 42);
        assert_eq!(sample.missing().len(), 5);
    }

    #[test]
    fn test_missing_lists_only_sentinels() {
        let sample = Sample {
            temperature: 51.5,
            net_throughput: 0.0,
            ..Sample::empty(1)
        };
        assert_eq!(
            sample.missing(),
            vec!["battery_voltage", "battery_current", "battery_capacity"]
        );
    }

    #[test]
    fn test_genuine_minus_one_reads_as_missing() {
        // -1 A charging current from a signed current_now
        let sample = Sample {
            battery_voltage: 12.6,
            battery_current: -1.0,
            battery_capacity: 55.0,
            temperature: 48.0,
            net_throughput: 0.0,
            timestamp: 3,
        };
        assert_eq!(sample.missing(), vec!["battery_current"]);

        let other_negative = Sample {
            battery_current: -1.5,
            ..sample
        };
        assert!(other_negative.missing().is_empty());
    }

    #[test]
    fn test_metric_names_match_fields() {
        let sample = Sample::empty(0);
        let names: Vec<&str> = sample.metrics().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, Sample::FIELDS[..5]);
    }
}
