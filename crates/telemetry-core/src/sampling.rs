//! The periodic sampling loop: tick, publish, append, sleep.
//!
//! ```text
//! Idle ──start()──► Running ──shutdown()──► Stopping ──► Stopped
//! ```
//!
//! The loop keeps an absolute deadline schedule so that the time spent in a
//! tick does not accumulate as drift. Cancellation is cooperative: the stop
//! flag is checked before every tick and while sleeping, never in the middle
//! of a publish/append pair.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::collector::sampler::Sampler;
use crate::storage::log::{DurableLogger, LogError};
use crate::storage::model::Sample;
use crate::storage::shm::{DEFAULT_SHM_NAME, SnapshotPublisher};

/// Longest single sleep between stop-flag checks.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Settings for one sampling run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub period: Duration,
    pub log_path: PathBuf,
    /// Shared memory region name; `None` disables publishing.
    pub shm_name: Option<String>,
}

impl LoopConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            period: Duration::from_secs(1),
            log_path: log_path.into(),
            shm_name: Some(DEFAULT_SHM_NAME.to_string()),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_shm_name(mut self, name: Option<String>) -> Self {
        self.shm_name = name;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum LoopError {
    /// The log could not be opened; nothing was sampled.
    Setup(LogError),
    /// Appending to the log failed mid-run.
    Log(LogError),
    InvalidState {
        operation: &'static str,
        state: LoopState,
    },
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::Setup(e) => write!(f, "failed to open log: {}", e),
            LoopError::Log(e) => write!(f, "failed to write log: {}", e),
            LoopError::InvalidState { operation, state } => {
                write!(f, "cannot {} while {}", operation, state)
            }
        }
    }
}

impl std::error::Error for LoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoopError::Setup(e) | LoopError::Log(e) => Some(e),
            LoopError::InvalidState { .. } => None,
        }
    }
}

/// Outcome of [`SamplingLoop::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub publish_enabled: bool,
    /// Ticks that ran past the following deadline.
    pub overruns: u64,
}

/// Computes the deadline after `prev`.
///
/// Returns the new deadline and whether the tick that just finished at `now`
/// overran it. After an overrun the missed slots are dropped and the schedule
/// restarts one period after `now`.
pub fn next_deadline(prev: Instant, period: Duration, now: Instant) -> (Instant, bool) {
    let next = prev + period;
    if now <= next {
        (next, false)
    } else {
        (now + period, true)
    }
}

/// Current wall-clock time in Unix seconds.
pub fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Drives a [`Sampler`] and fans each sample out to the shared region and
/// the durable log.
pub struct SamplingLoop {
    config: LoopConfig,
    sampler: Sampler,
    state: LoopState,
    logger: Option<DurableLogger>,
    publisher: Option<SnapshotPublisher>,
    ticks: u64,
    overruns: u64,
}

impl SamplingLoop {
    pub fn new(config: LoopConfig, sampler: Sampler) -> Self {
        Self {
            config,
            sampler,
            state: LoopState::Idle,
            logger: None,
            publisher: None,
            ticks: 0,
            overruns: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn publish_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    fn require(&self, operation: &'static str, state: LoopState) -> Result<(), LoopError> {
        if self.state == state {
            Ok(())
        } else {
            Err(LoopError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Opens the log and, if configured, the shared region.
    pub fn start(&mut self) -> Result<(), LoopError> {
        self.require("start", LoopState::Idle)?;

        let logger = DurableLogger::open(&self.config.log_path).map_err(LoopError::Setup)?;
        info!("logging samples to {}", logger.path().display());

        self.publisher = match &self.config.shm_name {
            Some(name) => match SnapshotPublisher::open(name) {
                Ok(publisher) => {
                    info!("publishing snapshots to shared memory {}", name);
                    Some(publisher)
                }
                Err(e) => {
                    warn!("shared memory disabled: {}", e);
                    None
                }
            },
            None => {
                debug!("shared memory publishing not configured");
                None
            }
        };

        self.logger = Some(logger);
        self.state = LoopState::Running;
        Ok(())
    }

    /// Runs one tick at wall-clock time `now`: sample, publish, append.
    ///
    /// Throughput is derived over the configured period.
    pub fn tick_once(&mut self, now: u64) -> Result<Sample, LoopError> {
        self.tick_at(now, None)
    }

    fn tick_at(&mut self, now: u64, elapsed: Option<Duration>) -> Result<Sample, LoopError> {
        self.require("tick", LoopState::Running)?;

        let sample = match elapsed {
            Some(elapsed) => self.sampler.tick_over(now, elapsed),
            None => self.sampler.tick(now),
        };
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.publish(&sample);
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.append(&sample).map_err(LoopError::Log)?;
        }
        self.ticks += 1;

        let missing = sample.missing();
        if missing.is_empty() {
            debug!("tick #{} at {}", self.ticks, sample.timestamp);
        } else {
            debug!(
                "tick #{} at {} (missing: {})",
                self.ticks,
                sample.timestamp,
                missing.join(", ")
            );
        }
        Ok(sample)
    }

    /// Ticks every period until `stop` is raised, then shuts down.
    pub fn run(&mut self, stop: &StopSignal) -> Result<RunSummary, LoopError> {
        self.require("run", LoopState::Running)?;
        let period = self.config.period;
        info!("sampling every {:?}", period);

        let mut deadline = Instant::now();
        let mut last_tick: Option<Instant> = None;
        while !stop.is_stopped() {
            let started = Instant::now();
            let elapsed = last_tick.map(|prev| started.duration_since(prev));
            last_tick = Some(started);

            if let Err(e) = self.tick_at(unix_now(), elapsed) {
                error!("{}", e);
                if let Err(close_err) = self.shutdown() {
                    warn!("shutdown after failure: {}", close_err);
                }
                return Err(e);
            }

            let (next, overran) = next_deadline(deadline, period, Instant::now());
            if overran {
                self.overruns += 1;
                warn!(
                    "tick #{} overran the {:?} period, skipping missed slots; the next rate covers the measured gap",
                    self.ticks, period
                );
            }
            deadline = next;
            sleep_until(deadline, stop);
        }

        let summary = RunSummary {
            ticks: self.ticks,
            publish_enabled: self.publisher.is_some(),
            overruns: self.overruns,
        };
        self.shutdown()?;
        Ok(summary)
    }

    /// Releases the shared region and closes the log. Safe to call twice.
    pub fn shutdown(&mut self) -> Result<(), LoopError> {
        if self.state == LoopState::Stopped {
            return Ok(());
        }
        self.state = LoopState::Stopping;

        if let Some(publisher) = self.publisher.take() {
            let published = publisher.published();
            publisher.close();
            debug!("shared memory released after {} publishes", published);
        }
        let closed = match self.logger.take() {
            Some(logger) => logger.close().map_err(LoopError::Log),
            None => Ok(()),
        };

        self.state = LoopState::Stopped;
        info!("sampling stopped after {} ticks", self.ticks);
        closed
    }
}

impl Drop for SamplingLoop {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("{}", e);
        }
    }
}

/// Sleeps until `deadline` in slices, returning early once `stop` is raised.
fn sleep_until(deadline: Instant, stop: &StopSignal) {
    loop {
        if stop.is_stopped() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::readers::ReadError;
    use crate::storage::log::read_log;
    use crate::storage::shm::SnapshotReader;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::tempdir;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name() -> String {
        format!(
            "/telemetry-loop-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn sampler(period: Duration) -> Sampler {
        let mut temp = 40.0;
        Sampler::new(period).with_temperature(move || {
            temp += 0.5;
            Ok::<f64, ReadError>(temp)
        })
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempdir().unwrap();
        let config = LoopConfig::new(dir.path().join("t.csv")).with_shm_name(None);
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(1)));

        assert_eq!(sampling.state(), LoopState::Idle);
        assert!(matches!(
            sampling.tick_once(1),
            Err(LoopError::InvalidState {
                state: LoopState::Idle,
                ..
            })
        ));

        sampling.start().unwrap();
        assert_eq!(sampling.state(), LoopState::Running);
        assert!(sampling.start().is_err());

        sampling.tick_once(1).unwrap();
        sampling.shutdown().unwrap();
        assert_eq!(sampling.state(), LoopState::Stopped);
        sampling.shutdown().unwrap();
        assert!(sampling.tick_once(2).is_err());

        assert_eq!(read_log(&dir.path().join("t.csv")).unwrap().len(), 1);
    }

    #[test]
    fn test_log_open_failure_is_fatal() {
        let dir = tempdir().unwrap();
        // a directory cannot be opened as the log file
        let config = LoopConfig::new(dir.path()).with_shm_name(None);
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(1)));

        assert!(matches!(sampling.start(), Err(LoopError::Setup(_))));
        assert_eq!(sampling.state(), LoopState::Idle);
    }

    #[test]
    fn test_publisher_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let config = LoopConfig::new(&path).with_shm_name(Some("no/slash/allowed".into()));
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(1)));

        sampling.start().unwrap();
        assert!(!sampling.publish_enabled());
        sampling.tick_once(5).unwrap();
        sampling.shutdown().unwrap();

        assert_eq!(read_log(&path).unwrap()[0].timestamp, 5);
    }

    #[test]
    fn test_tick_publishes_and_logs_same_sample() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let name = unique_name();
        let config = LoopConfig::new(&path).with_shm_name(Some(name.clone()));
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(1)));

        sampling.start().unwrap();
        assert!(sampling.publish_enabled());
        let sample = sampling.tick_once(1_700_000_000).unwrap();

        let reader = SnapshotReader::open(&name).unwrap();
        assert_eq!(reader.read().unwrap(), Some(sample));
        assert_eq!(read_log(&path).unwrap(), vec![sample]);

        sampling.shutdown().unwrap();
        assert!(reader.is_orphaned());
    }

    #[test]
    fn test_stop_during_sleep_keeps_completed_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let config = LoopConfig::new(&path)
            .with_period(Duration::from_secs(30))
            .with_shm_name(None);
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(30)));
        sampling.start().unwrap();

        let stop = StopSignal::new();
        let trigger = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(250));
            trigger.stop();
        });

        let started = Instant::now();
        let summary = sampling.run(&stop).unwrap();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.ticks, 1);
        assert!(!summary.publish_enabled);
        assert_eq!(sampling.state(), LoopState::Stopped);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert_eq!(read_log(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_run_writes_one_complete_line_per_tick() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let config = LoopConfig::new(&path)
            .with_period(Duration::from_millis(40))
            .with_shm_name(None);
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_millis(40)));
        sampling.start().unwrap();

        let stop = StopSignal::new();
        let trigger = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.stop();
        });
        let summary = sampling.run(&stop).unwrap();
        handle.join().unwrap();

        let records = read_log(&path).unwrap();
        assert!(summary.ticks >= 2);
        assert_eq!(records.len() as u64, summary.ticks);
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_append_failure_during_run_tears_down() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let name = unique_name();
        let config = LoopConfig::new(&path)
            .with_period(Duration::from_millis(20))
            .with_shm_name(Some(name.clone()));
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_millis(20)));
        sampling.start().unwrap();
        assert!(sampling.publish_enabled());
        assert!(SnapshotReader::open(&name).is_ok());

        // the log handle can no longer be written to
        sampling.logger.as_mut().unwrap().reopen_read_only().unwrap();

        let result = sampling.run(&StopSignal::new());
        assert!(matches!(result, Err(LoopError::Log(_))));
        assert_eq!(sampling.state(), LoopState::Stopped);
        assert!(SnapshotReader::open(&name).is_err());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn test_run_measures_throughput_over_real_intervals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let config = LoopConfig::new(&path)
            .with_period(Duration::from_millis(50))
            .with_shm_name(None);
        // 1 KiB per tick against a 1 s nominal period: dividing by the
        // measured ~50 ms gap gives roughly 20 KiB/s, not 1 KiB/s.
        let mut total = 0u64;
        let sampler = Sampler::new(Duration::from_secs(1)).with_network(move || {
            total += 1024;
            Ok::<(u64, u64), ReadError>((total, 0))
        });
        let mut sampling = SamplingLoop::new(config, sampler);
        sampling.start().unwrap();

        let stop = StopSignal::new();
        let trigger = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(280));
            trigger.stop();
        });
        sampling.run(&stop).unwrap();
        handle.join().unwrap();

        let records = read_log(&path).unwrap();
        assert!(records.len() >= 2);
        assert_eq!(records[0].net_throughput, 0.0);
        assert!(records[1..].iter().all(|s| s.net_throughput > 2.0));
    }

    #[test]
    fn test_stop_before_run_ticks_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let config = LoopConfig::new(&path).with_shm_name(None);
        let mut sampling = SamplingLoop::new(config, sampler(Duration::from_secs(1)));
        sampling.start().unwrap();

        let stop = StopSignal::new();
        stop.stop();
        let summary = sampling.run(&stop).unwrap();
        assert_eq!(summary.ticks, 0);
        assert!(read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn test_next_deadline_on_schedule() {
        let t0 = Instant::now();
        let period = Duration::from_secs(1);

        let (next, overran) = next_deadline(t0, period, t0 + Duration::from_millis(300));
        assert_eq!(next, t0 + period);
        assert!(!overran);

        // the schedule is absolute, so tick cost does not accumulate
        let (after, _) = next_deadline(next, period, next + Duration::from_millis(900));
        assert_eq!(after, t0 + 2 * period);
    }

    #[test]
    fn test_next_deadline_reanchors_after_overrun() {
        let t0 = Instant::now();
        let period = Duration::from_secs(1);
        let late = t0 + Duration::from_millis(3500);

        let (next, overran) = next_deadline(t0, period, late);
        assert!(overran);
        assert_eq!(next, late + period);
    }

    #[test]
    fn test_loop_config_defaults() {
        let config = LoopConfig::new("telemetry.csv");
        assert_eq!(config.period, Duration::from_secs(1));
        assert_eq!(config.shm_name.as_deref(), Some(DEFAULT_SHM_NAME));
    }

    #[test]
    fn test_stop_signal_shared_between_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.is_stopped());
        stop.stop();
        assert!(other.is_stopped());
    }
}
