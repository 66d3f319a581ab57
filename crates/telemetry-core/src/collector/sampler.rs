//! One sampling tick: read every metric, derive throughput, stamp the result.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::net::ByteCounters;
use crate::collector::readers::{MetricReader, ReadError};
use crate::rates::ThroughputTracker;
use crate::storage::model::{SENTINEL, Sample};

/// A configured reader plus its failure state, for transition logging.
struct MetricSlot {
    name: &'static str,
    reader: Option<Box<dyn MetricReader>>,
    failing: bool,
}

impl MetricSlot {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            reader: None,
            failing: false,
        }
    }

    fn read(&mut self) -> f32 {
        let Some(reader) = self.reader.as_mut() else {
            return SENTINEL;
        };
        match reader.read() {
            Ok(value) => {
                if self.failing {
                    info!("{}: reader recovered", self.name);
                    self.failing = false;
                }
                value as f32
            }
            Err(e) => {
                report_failure(self.name, &mut self.failing, &e);
                SENTINEL
            }
        }
    }
}

fn report_failure(name: &str, failing: &mut bool, error: &ReadError) {
    if *failing {
        debug!("{}: still failing: {}", name, error);
    } else {
        warn!("{}: read failed, using sentinel: {}", name, error);
        *failing = true;
    }
}

/// Produces one [`Sample`] per tick from the configured readers.
///
/// Holds the throughput tracker for the lifetime of the run so the rate is
/// always computed against the previous tick.
pub struct Sampler {
    battery_voltage: MetricSlot,
    battery_current: MetricSlot,
    battery_capacity: MetricSlot,
    temperature: MetricSlot,
    network: Option<Box<dyn ByteCounters>>,
    network_failing: bool,
    tracker: ThroughputTracker,
    last_timestamp: Option<u64>,
    ticks: u64,
}

impl Sampler {
    /// Creates a sampler with no readers; every field is the sentinel until
    /// readers are attached.
    pub fn new(period: Duration) -> Self {
        Self {
            battery_voltage: MetricSlot::new("battery_voltage"),
            battery_current: MetricSlot::new("battery_current"),
            battery_capacity: MetricSlot::new("battery_capacity"),
            temperature: MetricSlot::new("temperature"),
            network: None,
            network_failing: false,
            tracker: ThroughputTracker::new(period),
            last_timestamp: None,
            ticks: 0,
        }
    }

    pub fn with_battery_voltage(mut self, reader: impl MetricReader + 'static) -> Self {
        self.battery_voltage.reader = Some(Box::new(reader));
        self
    }

    pub fn with_battery_current(mut self, reader: impl MetricReader + 'static) -> Self {
        self.battery_current.reader = Some(Box::new(reader));
        self
    }

    pub fn with_battery_capacity(mut self, reader: impl MetricReader + 'static) -> Self {
        self.battery_capacity.reader = Some(Box::new(reader));
        self
    }

    pub fn with_temperature(mut self, reader: impl MetricReader + 'static) -> Self {
        self.temperature.reader = Some(Box::new(reader));
        self
    }

    pub fn with_network(mut self, counters: impl ByteCounters + 'static) -> Self {
        self.network = Some(Box::new(counters));
        self
    }

    /// Replaces the tracker, e.g. to change the unit divisor.
    pub fn with_tracker(mut self, tracker: ThroughputTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Names of the metrics that have a reader attached.
    pub fn configured(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = [
            &self.battery_voltage,
            &self.battery_current,
            &self.battery_capacity,
            &self.temperature,
        ]
        .iter()
        .filter(|slot| slot.reader.is_some())
        .map(|slot| slot.name)
        .collect();
        if self.network.is_some() {
            names.push("net_throughput");
        }
        names
    }

    /// Runs one tick at wall-clock time `now` (Unix seconds).
    ///
    /// Never fails: a failing reader yields [`SENTINEL`] for its field.
    pub fn tick(&mut self, now: u64) -> Sample {
        self.tick_inner(now, None)
    }

    /// Runs one tick, deriving throughput over the measured `elapsed` time
    /// since the previous tick rather than the configured period.
    pub fn tick_over(&mut self, now: u64, elapsed: Duration) -> Sample {
        self.tick_inner(now, Some(elapsed))
    }

    fn tick_inner(&mut self, now: u64, elapsed: Option<Duration>) -> Sample {
        let timestamp = match self.last_timestamp {
            Some(last) if now < last => {
                debug!("clock stepped back from {} to {}, holding", last, now);
                last
            }
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        self.ticks += 1;

        Sample {
            battery_voltage: self.battery_voltage.read(),
            battery_current: self.battery_current.read(),
            battery_capacity: self.battery_capacity.read(),
            temperature: self.temperature.read(),
            net_throughput: self.read_throughput(elapsed),
            timestamp,
        }
    }

    fn read_throughput(&mut self, elapsed: Option<Duration>) -> f32 {
        let Some(counters) = self.network.as_mut() else {
            return SENTINEL;
        };
        match counters.read_counters() {
            Ok((rx, tx)) => {
                if self.network_failing {
                    info!("net_throughput: reader recovered");
                    self.network_failing = false;
                }
                let rate = match elapsed {
                    Some(elapsed) => self.tracker.update_over(rx, tx, elapsed),
                    None => self.tracker.update(rx, tx),
                };
                rate as f32
            }
            Err(e) => {
                report_failure("net_throughput", &mut self.network_failing, &e);
                // Re-baseline on the next good read instead of folding the
                // missed interval into one period.
                self.tracker.reset();
                SENTINEL
            }
        }
    }

    /// Number of ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tracker(&self) -> &ThroughputTracker {
        &self.tracker
    }
}
