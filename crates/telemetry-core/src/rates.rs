//! Rate computation from cumulative counters.
//!
//! Counters such as interface byte totals only ever grow until the interface
//! is reset. A rate needs the previous reading, so the tracker owns that state
//! and must live as long as the sampler that feeds it.

use std::time::Duration;

use tracing::debug;

/// Bytes per KiB, the default unit divisor.
pub const KIB: f64 = 1024.0;

/// Compute u64 delta, returning `None` on counter regression (reset).
pub fn du64(curr: u64, prev: u64) -> Option<u64> {
    (curr >= prev).then(|| curr - prev)
}

/// Turns two cumulative byte counters (rx, tx) into a combined rate.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    prev_rx: u64,
    prev_tx: u64,
    initialized: bool,
    period_secs: f64,
    unit_divisor: f64,
    updates: u64,
}

impl ThroughputTracker {
    /// Creates an uninitialized tracker reporting KiB/s over `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            prev_rx: 0,
            prev_tx: 0,
            initialized: false,
            period_secs: period.as_secs_f64(),
            unit_divisor: KIB,
            updates: 0,
        }
    }

    /// Overrides the unit divisor (1.0 for bytes/s, 1000.0 for kB/s).
    pub fn with_unit_divisor(mut self, divisor: f64) -> Self {
        self.unit_divisor = divisor;
        self
    }

    /// Feeds the current totals and returns the rate since the previous call,
    /// assuming exactly one configured period has elapsed.
    ///
    /// The first call only records the baseline and returns `0.0`.
    pub fn update(&mut self, rx_total: u64, tx_total: u64) -> f64 {
        self.update_with_secs(rx_total, tx_total, self.period_secs)
    }

    /// Like [`update`](Self::update), but divides by the measured `elapsed`
    /// time since the previous call instead of the configured period.
    pub fn update_over(&mut self, rx_total: u64, tx_total: u64, elapsed: Duration) -> f64 {
        self.update_with_secs(rx_total, tx_total, elapsed.as_secs_f64())
    }

    fn update_with_secs(&mut self, rx_total: u64, tx_total: u64, secs: f64) -> f64 {
        self.updates += 1;

        if !self.initialized {
            self.prev_rx = rx_total;
            self.prev_tx = tx_total;
            self.initialized = true;
            return 0.0;
        }

        let rx_delta = match du64(rx_total, self.prev_rx) {
            Some(delta) => delta,
            None => {
                debug!(
                    "rx counter went backwards ({} -> {}), treating as reset",
                    self.prev_rx, rx_total
                );
                0
            }
        };
        let tx_delta = match du64(tx_total, self.prev_tx) {
            Some(delta) => delta,
            None => {
                debug!(
                    "tx counter went backwards ({} -> {}), treating as reset",
                    self.prev_tx, tx_total
                );
                0
            }
        };

        self.prev_rx = rx_total;
        self.prev_tx = tx_total;

        if secs <= 0.0 {
            return 0.0;
        }
        (rx_delta as f64 + tx_delta as f64) / secs / self.unit_divisor
    }

    /// Configured period in seconds.
    pub fn period_secs(&self) -> f64 {
        self.period_secs
    }

    /// Drops the baseline; the next update reports `0.0` again.
    pub fn reset(&mut self) {
        self.prev_rx = 0;
        self.prev_tx = 0;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of `update` calls over the tracker's lifetime.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_update_is_baseline() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        assert!(!tracker.is_initialized());
        assert_eq!(tracker.update(1_000_000, 5_000_000), 0.0);
        assert!(tracker.is_initialized());
    }

    #[test]
    fn test_three_tick_scenario() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        let rx = [1000, 1500, 1700];
        let tx = [2000, 2100, 2500];
        let rates: Vec<f64> = rx
            .iter()
            .zip(tx.iter())
            .map(|(&r, &t)| tracker.update(r, t))
            .collect();

        assert_eq!(rates[0], 0.0);
        assert!(approx_eq(rates[1], (500.0 + 100.0) / 1024.0));
        assert!(approx_eq(rates[2], (200.0 + 400.0) / 1024.0));
        assert_eq!(tracker.updates(), 3);
    }

    #[test]
    fn test_rate_divides_by_period() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(2));
        tracker.update(0, 0);
        assert!(approx_eq(tracker.update(2048, 2048), 2.0));
    }

    #[test]
    fn test_unit_divisor() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1)).with_unit_divisor(1.0);
        tracker.update(100, 100);
        assert!(approx_eq(tracker.update(150, 175), 125.0));
    }

    #[test]
    fn test_counter_reset_is_clamped() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(10_000, 10_000);

        // rx reset by an interface restart, tx kept growing
        let rate = tracker.update(100, 11_024);
        assert!(rate >= 0.0);
        assert!(approx_eq(rate, 1.0));

        // the reset value becomes the new baseline
        assert!(approx_eq(tracker.update(1_124, 11_024), 1.0));
    }

    #[test]
    fn test_both_counters_reset_yields_zero() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(u64::MAX - 10, u64::MAX - 10);
        assert_eq!(tracker.update(5, 5), 0.0);
    }

    #[test]
    fn test_monotonic_sequences_match_formula() {
        let mut tracker = ThroughputTracker::new(Duration::from_millis(500));
        let mut rx = 0u64;
        let mut tx = 0u64;
        assert_eq!(tracker.update(rx, tx), 0.0);
        for step in 1..50u64 {
            let (drx, dtx) = (step * 37, step * step);
            rx += drx;
            tx += dtx;
            let expected = (drx + dtx) as f64 / 0.5 / 1024.0;
            assert!(approx_eq(tracker.update(rx, tx), expected));
        }
    }

    #[test]
    fn test_reset_rebaselines() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(1000, 1000);
        tracker.reset();
        assert_eq!(tracker.update(50_000, 50_000), 0.0);
        assert!(approx_eq(tracker.update(51_024, 50_000), 1.0));
        assert_eq!(tracker.updates(), 3);
    }

    #[test]
    fn test_huge_deltas_do_not_overflow() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(0, 0);
        let rate = tracker.update(1 << 63, 1 << 63);
        assert!(rate.is_finite());
        assert!(approx_eq(rate, 2.0f64.powi(64) / 1024.0));
    }

    #[test]
    fn test_update_over_uses_measured_interval() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(0, 0);

        // a tick that ran three periods late covers three seconds of traffic
        let rate = tracker.update_over(3072, 3072, Duration::from_secs(3));
        assert!(approx_eq(rate, 2.0));
        assert!(approx_eq(tracker.update(4096, 4096), 2.0));
    }

    #[test]
    fn test_update_over_zero_interval() {
        let mut tracker = ThroughputTracker::new(Duration::from_secs(1));
        tracker.update(0, 0);
        assert_eq!(tracker.update_over(100, 100, Duration::ZERO), 0.0);
        assert!(approx_eq(tracker.period_secs(), 1.0));
    }

    #[test]
    fn test_du64() {
        assert_eq!(du64(10, 3), Some(7));
        assert_eq!(du64(3, 3), Some(0));
        assert_eq!(du64(2, 3), None);
    }
}
