use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use telemetry_core::analysis::{AnalysisReport, AnomalyModel, DEFAULT_CONTAMINATION};
use telemetry_core::storage::{
    DEFAULT_SHM_NAME, SENTINEL, Sample, ShmError, SnapshotReader, read_log,
};
use telemetry_core::util::parse_duration;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "telemetry-dump", about = "Inspect telemetry snapshots and logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Read the latest sample from shared memory
    Shm {
        /// Shared memory region name
        #[arg(long, default_value = DEFAULT_SHM_NAME)]
        name: String,

        /// Keep printing new samples until interrupted
        #[arg(long)]
        watch: bool,

        /// Poll period for --watch
        #[arg(long, default_value = "1s", value_parser = parse_duration)]
        interval: Duration,
    },
    /// Summarize a CSV log
    Log {
        /// Path to the log file
        #[arg(default_value = "telemetry.csv")]
        path: PathBuf,

        /// Also print the last N records
        #[arg(long, value_name = "N")]
        tail: Option<usize>,
    },
    /// Train an isolation forest on a log and report anomalous samples
    Anomalies {
        /// Path to the log file used for training
        #[arg(default_value = "telemetry.csv")]
        path: PathBuf,

        /// Expected share of anomalous samples, in (0, 0.5]
        #[arg(long, default_value_t = DEFAULT_CONTAMINATION)]
        contamination: f64,

        /// After training, score new samples from shared memory until interrupted
        #[arg(long)]
        live: bool,

        /// Shared memory region name for --live
        #[arg(long, default_value = DEFAULT_SHM_NAME)]
        name: String,

        /// Poll period for --live
        #[arg(long, default_value = "500ms", value_parser = parse_duration)]
        interval: Duration,
    },
}

fn main() {
    let cli = Cli::parse();
    match &cli.command {
        Command::Shm {
            name,
            watch,
            interval,
        } => {
            if *watch {
                watch_shm(name, *interval, cli.json);
            } else {
                dump_shm(name, cli.json);
            }
        }
        Command::Log { path, tail } => dump_log(path, *tail, cli.json),
        Command::Anomalies {
            path,
            contamination,
            live,
            name,
            interval,
        } => {
            let model = train_model(path, *contamination);
            if *live {
                score_live(&model, name, *interval, cli.json);
            } else {
                dump_anomalies(path, &model, cli.json);
            }
        }
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => fail(format!("Error encoding JSON: {e}")),
    }
}

// ── Formatting helpers ───────────────────────────────────────────────────────

fn fmt_ts(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn fmt_metric(value: f32, unit: &str) -> String {
    if value == SENTINEL {
        "n/a".to_string()
    } else {
        format!("{value:.2} {unit}")
    }
}

fn describe(sample: &Sample) -> String {
    format!(
        "{}  voltage {}  current {}  capacity {}  temp {}  net {}",
        fmt_ts(sample.timestamp),
        fmt_metric(sample.battery_voltage, "V"),
        fmt_metric(sample.battery_current, "A"),
        fmt_metric(sample.battery_capacity, "%"),
        fmt_metric(sample.temperature, "°C"),
        fmt_metric(sample.net_throughput, "KiB/s"),
    )
}

// ── JSON output types ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SampleJson {
    #[serde(flatten)]
    sample: Sample,
    time: String,
}

impl From<Sample> for SampleJson {
    fn from(sample: Sample) -> Self {
        Self {
            time: fmt_ts(sample.timestamp),
            sample,
        }
    }
}

#[derive(Serialize)]
struct ShmJson {
    name: String,
    sequence: u64,
    sample: Option<SampleJson>,
}

#[derive(Serialize)]
struct TimeRangeJson {
    first: String,
    last: String,
}

#[derive(Serialize, Debug, PartialEq)]
struct SentinelCount {
    column: &'static str,
    count: usize,
}

#[derive(Serialize)]
struct AnomaliesJson<'a> {
    file: String,
    trained_on: usize,
    #[serde(flatten)]
    report: &'a AnalysisReport,
}

#[derive(Serialize)]
struct LiveScoreJson {
    #[serde(flatten)]
    sample: SampleJson,
    score: Option<f64>,
    status: &'static str,
}

#[derive(Serialize)]
struct LogJson {
    file: String,
    records: usize,
    time_range: Option<TimeRangeJson>,
    sentinels: Vec<SentinelCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tail: Option<Vec<SampleJson>>,
}

// ── dump_shm ─────────────────────────────────────────────────────────────────

fn open_reader(name: &str) -> Result<SnapshotReader, ShmError> {
    SnapshotReader::open(name)
}

fn is_new_publish(last: Option<u64>, sequence: u64) -> bool {
    last != Some(sequence)
}

fn print_sample(name: &str, sequence: u64, sample: Option<Sample>, json: bool) {
    if json {
        print_json(&ShmJson {
            name: name.to_string(),
            sequence,
            sample: sample.map(SampleJson::from),
        });
    } else {
        match sample {
            Some(sample) => println!("{}", describe(&sample)),
            None => println!("{name}: no sample published yet"),
        }
    }
}

fn dump_shm(name: &str, json: bool) {
    let reader = open_reader(name).unwrap_or_else(|e| fail(format!("Error opening {name}: {e}")));
    let read = reader
        .read_with_sequence()
        .unwrap_or_else(|e| fail(format!("Error reading {name}: {e}")));
    match read {
        Some((sequence, sample)) => print_sample(name, sequence, Some(sample), json),
        None => print_sample(name, 0, None, json),
    }
}

fn watch_shm(name: &str, interval: Duration, json: bool) {
    let mut reader: Option<SnapshotReader> = None;
    let mut last_sequence = None;
    let mut waiting = false;

    loop {
        if reader.as_ref().is_some_and(SnapshotReader::is_orphaned) {
            eprintln!("{name}: producer went away, waiting for a new one");
            reader = None;
            last_sequence = None;
        }

        if reader.is_none() {
            match open_reader(name) {
                Ok(r) => {
                    waiting = false;
                    reader = Some(r);
                }
                Err(e) => {
                    if !waiting {
                        eprintln!("{name}: {e}; retrying every {interval:?}");
                        waiting = true;
                    }
                }
            }
        }

        if let Some(r) = reader.as_ref() {
            match r.read_with_sequence() {
                Ok(Some((sequence, sample))) => {
                    if is_new_publish(last_sequence, sequence) {
                        print_sample(name, sequence, Some(sample), json);
                        last_sequence = Some(sequence);
                    }
                }
                Ok(None) => {}
                Err(e) => eprintln!("{name}: {e}"),
            }
        }

        thread::sleep(interval);
    }
}

// ── dump_log ─────────────────────────────────────────────────────────────────

/// Counts sentinel values per metric column.
///
/// A genuine `-1.00` reading is counted too; the log cannot tell them apart.
fn sentinel_counts(samples: &[Sample]) -> Vec<SentinelCount> {
    Sample::FIELDS[..5]
        .iter()
        .enumerate()
        .map(|(i, &column)| SentinelCount {
            column,
            count: samples
                .iter()
                .filter(|s| s.metrics()[i].1 == SENTINEL)
                .count(),
        })
        .collect()
}

fn time_range(samples: &[Sample]) -> Option<TimeRangeJson> {
    let first = samples.first()?;
    let last = samples.last()?;
    Some(TimeRangeJson {
        first: fmt_ts(first.timestamp),
        last: fmt_ts(last.timestamp),
    })
}

fn tail_of(samples: &[Sample], n: usize) -> &[Sample] {
    &samples[samples.len().saturating_sub(n)..]
}

fn dump_log(path: &Path, tail: Option<usize>, json: bool) {
    let samples =
        read_log(path).unwrap_or_else(|e| fail(format!("Error reading {}: {e}", path.display())));
    let sentinels = sentinel_counts(&samples);

    if json {
        print_json(&LogJson {
            file: path.display().to_string(),
            records: samples.len(),
            time_range: time_range(&samples),
            sentinels,
            tail: tail.map(|n| tail_of(&samples, n).iter().copied().map(SampleJson::from).collect()),
        });
        return;
    }

    println!("File: {}", path.display());
    println!("Records: {}", samples.len());
    if let Some(range) = time_range(&samples) {
        println!("Time range: {} \u{2013} {}", range.first, range.last);
    }

    println!("\nSentinel values:");
    for SentinelCount { column, count } in &sentinels {
        let pct = if samples.is_empty() {
            0.0
        } else {
            *count as f64 / samples.len() as f64 * 100.0
        };
        println!("  {column:<18} {count:>8} ({pct:.1}%)");
    }

    if let Some(n) = tail {
        println!("\nLast {} records:", tail_of(&samples, n).len());
        for sample in tail_of(&samples, n) {
            println!("  {}", describe(sample));
        }
    }
}

// ── anomalies ────────────────────────────────────────────────────────────────

fn train_model(path: &Path, contamination: f64) -> AnomalyModel {
    let samples =
        read_log(path).unwrap_or_else(|e| fail(format!("Error reading {}: {e}", path.display())));
    AnomalyModel::train(&samples, contamination)
        .unwrap_or_else(|e| fail(format!("Error training on {}: {e}", path.display())))
}

fn classify(model: &AnomalyModel, sample: &Sample) -> (Option<f64>, &'static str) {
    match model.score(sample) {
        Some(score) if score > model.threshold() => (Some(score), "anomaly"),
        Some(score) => (Some(score), "ok"),
        None => (None, "incomplete"),
    }
}

fn dump_anomalies(path: &Path, model: &AnomalyModel, json: bool) {
    let samples =
        read_log(path).unwrap_or_else(|e| fail(format!("Error reading {}: {e}", path.display())));
    let report = model.scan(&samples);

    if json {
        print_json(&AnomaliesJson {
            file: path.display().to_string(),
            trained_on: model.trained_on(),
            report: &report,
        });
        return;
    }

    println!("File: {}", path.display());
    println!(
        "Trained on: {} samples ({} skipped with missing features)",
        model.trained_on(),
        model.skipped()
    );
    println!("Threshold: {:.4}", report.threshold);
    println!(
        "\nAnomalies: {} of {} scored samples",
        report.anomalies.len(),
        report.scored
    );
    for a in &report.anomalies {
        println!(
            "  {}  score {:.4}  temp {}  capacity {}  net {}",
            fmt_ts(a.timestamp),
            a.score,
            fmt_metric(a.temperature, "°C"),
            fmt_metric(a.battery_capacity, "%"),
            fmt_metric(a.net_throughput, "KiB/s"),
        );
    }
}

fn score_live(model: &AnomalyModel, name: &str, interval: Duration, json: bool) {
    let reader = open_reader(name).unwrap_or_else(|e| fail(format!("Error opening {name}: {e}")));
    let mut last_sequence = None;

    loop {
        if reader.is_orphaned() {
            fail(format!("{name}: producer went away"));
        }
        match reader.read_with_sequence() {
            Ok(Some((sequence, sample))) if is_new_publish(last_sequence, sequence) => {
                last_sequence = Some(sequence);
                let (score, status) = classify(model, &sample);
                if json {
                    print_json(&LiveScoreJson {
                        sample: SampleJson::from(sample),
                        score,
                        status,
                    });
                } else {
                    println!("{}  status {}", describe(&sample), status);
                }
            }
            Ok(_) => {}
            Err(e) => eprintln!("{name}: {e}"),
        }
        thread::sleep(interval);
    }
}
