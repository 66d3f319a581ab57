//! telemetryd - host telemetry sampler daemon.
//!
//! Samples battery, temperature and network throughput once per period,
//! publishes the latest sample to a shared memory slot and appends it to a
//! CSV log. Stops cleanly on SIGINT/SIGTERM.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_core::collector::{
    FileSystem, ProcNetDevCounters, RealFs, Sampler, SimulatedCounters, SimulatedReader,
    SysfsNetCounters, SysfsReader, detect_interface,
};
use telemetry_core::sampling::{LoopConfig, LoopError, RunSummary, SamplingLoop, StopSignal};
use telemetry_core::storage::DEFAULT_SHM_NAME;
use telemetry_core::util::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NetSource {
    /// class/net/<iface>/statistics/{rx,tx}_bytes
    Sysfs,
    /// <proc>/net/dev
    Procfs,
}

/// Host telemetry sampler daemon.
#[derive(Debug, Parser)]
#[command(name = "telemetryd", about = "Host telemetry sampler daemon", version)]
struct Args {
    /// Sampling period (e.g., "500ms", "1s", "2m").
    #[arg(short, long, env = "TELEMETRY_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    interval: Duration,

    /// CSV log file. Created with a header if missing.
    #[arg(long, env = "TELEMETRY_LOG_PATH", default_value = "telemetry.csv")]
    log_path: PathBuf,

    /// Name of the shared memory region holding the latest sample.
    #[arg(long, env = "TELEMETRY_SHM_NAME", default_value = DEFAULT_SHM_NAME)]
    shm_name: String,

    /// Do not publish to shared memory.
    #[arg(long, env = "TELEMETRY_NO_SHM")]
    no_shm: bool,

    /// Path to sysfs (for testing/mocking).
    #[arg(long, env = "TELEMETRY_SYSFS_ROOT", default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Path to /proc filesystem (for testing/mocking).
    #[arg(long, env = "TELEMETRY_PROC_PATH", default_value = "/proc")]
    proc_path: PathBuf,

    /// Thermal zone providing the temperature.
    #[arg(long, env = "TELEMETRY_THERMAL_ZONE", default_value = "thermal_zone0")]
    thermal_zone: String,

    /// Power supply providing the battery metrics.
    #[arg(long, env = "TELEMETRY_BATTERY", default_value = "BAT0")]
    battery: String,

    /// Network interface. Defaults to the first non-loopback interface.
    #[arg(long, env = "TELEMETRY_INTERFACE")]
    interface: Option<String>,

    /// Where to read interface byte counters from.
    #[arg(long, env = "TELEMETRY_NET_SOURCE", value_enum, default_value_t = NetSource::Sysfs)]
    net_source: NetSource,

    /// Use simulated sensors instead of sysfs/procfs.
    #[arg(long, env = "TELEMETRY_SIMULATE")]
    simulate: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn shm_name(&self) -> Option<String> {
        (!self.no_shm).then(|| self.shm_name.clone())
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["telemetryd", "telemetry_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Warns once at startup about a sysfs attribute that is not there.
fn check_source<F: FileSystem>(fs: &F, metric: &str, path: &Path) {
    if fs.exists(path) {
        debug!("{}: {}", metric, path.display());
    } else {
        warn!(
            "{}: {} not found, the field will hold the sentinel",
            metric,
            path.display()
        );
    }
}

/// Builds a sampler reading the host's sysfs/procfs through `fs`.
fn build_sampler<F>(fs: F, args: &Args) -> Sampler
where
    F: FileSystem + Clone + 'static,
{
    let root = args.sysfs_root.as_path();

    let voltage = SysfsReader::battery_voltage(fs.clone(), root, &args.battery);
    let current = SysfsReader::battery_current(fs.clone(), root, &args.battery);
    let capacity = SysfsReader::battery_capacity(fs.clone(), root, &args.battery);
    let temperature = SysfsReader::thermal_zone(fs.clone(), root, &args.thermal_zone);
    check_source(&fs, "battery_voltage", voltage.path());
    check_source(&fs, "battery_current", current.path());
    check_source(&fs, "battery_capacity", capacity.path());
    check_source(&fs, "temperature", temperature.path());

    let sampler = Sampler::new(args.interval)
        .with_battery_voltage(voltage)
        .with_battery_current(current)
        .with_battery_capacity(capacity)
        .with_temperature(temperature);

    let Some(interface) = args
        .interface
        .clone()
        .or_else(|| detect_interface(&fs, root))
    else {
        warn!("no network interface found, net_throughput will hold the sentinel");
        return sampler;
    };

    info!("network throughput from {} via {:?}", interface, args.net_source);
    match args.net_source {
        NetSource::Sysfs => sampler.with_network(SysfsNetCounters::new(fs, root, &interface)),
        NetSource::Procfs => {
            sampler.with_network(ProcNetDevCounters::new(fs, &args.proc_path, interface))
        }
    }
}

fn simulated_sampler(period: Duration) -> Sampler {
    Sampler::new(period)
        .with_battery_voltage(SimulatedReader::battery_voltage())
        .with_battery_current(SimulatedReader::battery_current())
        .with_battery_capacity(SimulatedReader::battery_capacity())
        .with_temperature(SimulatedReader::temperature())
        .with_network(SimulatedCounters::new())
}

fn run(args: &Args) -> Result<RunSummary, LoopError> {
    let simulate = args.simulate || cfg!(not(target_os = "linux"));
    let sampler = if simulate {
        info!("using simulated sensors");
        simulated_sampler(args.interval)
    } else {
        build_sampler(RealFs::new(), args)
    };
    info!("sampling: {}", sampler.configured().join(", "));

    let config = LoopConfig::new(&args.log_path)
        .with_period(args.interval)
        .with_shm_name(args.shm_name());

    // Setup graceful shutdown
    let stop = StopSignal::new();
    let trigger = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        trigger.stop();
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let mut sampling = SamplingLoop::new(config, sampler);
    sampling.start()?;
    sampling.run(&stop)
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("telemetryd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={:?}, log={}, shm={}",
        args.interval,
        args.log_path.display(),
        args.shm_name().as_deref().unwrap_or("disabled")
    );

    match run(&args) {
        Ok(summary) => info!(
            "Shutdown complete: {} ticks, {} overruns, shm {}",
            summary.ticks,
            summary.overruns,
            if summary.publish_enabled {
                "published"
            } else {
                "disabled"
            }
        ),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
