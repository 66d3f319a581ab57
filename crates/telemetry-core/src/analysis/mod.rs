//! Offline anomaly scoring over logged samples.
//!
//! An extended isolation forest is trained on the complete rows of a log,
//! using temperature, battery capacity and network throughput as features.
//! Rows carrying a sentinel in any feature are skipped for training and never
//! scored. The decision threshold is the score quantile that marks the
//! requested `contamination` share of the training rows as anomalous.

use std::fmt;

use extended_isolation_forest::{Forest, ForestOptions};
use serde::Serialize;
use tracing::debug;

use crate::storage::model::{SENTINEL, Sample};

/// Feature names in model order.
pub const FEATURES: [&str; 3] = ["temperature", "battery_capacity", "net_throughput"];

/// Share of training rows expected to be anomalous.
pub const DEFAULT_CONTAMINATION: f64 = 0.05;

/// Fewest complete rows a model can be trained on.
pub const MIN_TRAINING_ROWS: usize = 16;

const N_TREES: usize = 150;
const MAX_SAMPLE_SIZE: usize = 256;

#[derive(Debug)]
pub enum AnalysisError {
    /// Not enough complete rows to train on.
    InsufficientData { usable: usize, required: usize },
    /// Contamination outside `(0, 0.5]`.
    InvalidContamination(f64),
    /// The forest rejected its training set.
    Forest(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::InsufficientData { usable, required } => write!(
                f,
                "need at least {} complete samples to train, found {}",
                required, usable
            ),
            AnalysisError::InvalidContamination(c) => {
                write!(f, "contamination must be in (0, 0.5], got {}", c)
            }
            AnalysisError::Forest(msg) => write!(f, "isolation forest: {}", msg),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// The feature vector of a sample, or `None` if any feature is missing.
pub fn features(sample: &Sample) -> Option<[f64; 3]> {
    let values = [
        sample.temperature,
        sample.battery_capacity,
        sample.net_throughput,
    ];
    if values.iter().any(|&v| v == SENTINEL || !v.is_finite()) {
        return None;
    }
    Some(values.map(f64::from))
}

/// Per-feature standardization learned from the training rows.
#[derive(Debug, Clone, Copy)]
struct Scaler {
    mean: [f64; 3],
    std: [f64; 3],
}

impl Scaler {
    fn fit(rows: &[[f64; 3]]) -> Self {
        let n = rows.len() as f64;
        let mut mean = [0.0; 3];
        let mut std = [0.0; 3];
        for i in 0..3 {
            mean[i] = rows.iter().map(|r| r[i]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[i] - mean[i]).powi(2)).sum::<f64>() / n;
            // constant column: leave it unscaled
            std[i] = if var > 0.0 { var.sqrt() } else { 1.0 };
        }
        Self { mean, std }
    }

    fn apply(&self, row: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for i in 0..3 {
            out[i] = (row[i] - self.mean[i]) / self.std[i];
        }
        out
    }
}

/// A trained detector.
pub struct AnomalyModel {
    forest: Forest<f64, 3>,
    scaler: Scaler,
    threshold: f64,
    trained_on: usize,
    skipped: usize,
}

impl AnomalyModel {
    /// Trains on every complete sample in `samples`.
    pub fn train(samples: &[Sample], contamination: f64) -> Result<Self, AnalysisError> {
        if !(contamination > 0.0 && contamination <= 0.5) {
            return Err(AnalysisError::InvalidContamination(contamination));
        }

        let rows: Vec<[f64; 3]> = samples.iter().filter_map(features).collect();
        let skipped = samples.len() - rows.len();
        if rows.len() < MIN_TRAINING_ROWS {
            return Err(AnalysisError::InsufficientData {
                usable: rows.len(),
                required: MIN_TRAINING_ROWS,
            });
        }

        let scaler = Scaler::fit(&rows);
        let scaled: Vec<[f64; 3]> = rows.iter().map(|&r| scaler.apply(r)).collect();

        let options = ForestOptions {
            n_trees: N_TREES,
            sample_size: scaled.len().min(MAX_SAMPLE_SIZE),
            max_tree_depth: None,
            extension_level: 1,
        };
        let forest = Forest::from_slice(scaled.as_slice(), &options)
            .map_err(|e| AnalysisError::Forest(format!("{e:?}")))?;

        let mut scores: Vec<f64> = scaled.iter().map(|r| forest.score(r)).collect();
        let threshold = quantile(&mut scores, 1.0 - contamination);
        debug!(
            "trained on {} samples ({} skipped), threshold {:.4}",
            rows.len(),
            skipped,
            threshold
        );

        Ok(Self {
            forest,
            scaler,
            threshold,
            trained_on: rows.len(),
            skipped,
        })
    }

    /// Anomaly score in `(0, 1)`; higher is more isolated. `None` when a
    /// feature holds the sentinel.
    pub fn score(&self, sample: &Sample) -> Option<f64> {
        let row = features(sample)?;
        Some(self.forest.score(&self.scaler.apply(row)))
    }

    /// True when the sample scores above the training threshold.
    pub fn is_anomaly(&self, sample: &Sample) -> Option<bool> {
        self.score(sample).map(|score| score > self.threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Complete rows the forest was trained on.
    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    /// Training rows skipped for missing features.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Scores every sample and collects the ones above the threshold.
    pub fn scan(&self, samples: &[Sample]) -> AnalysisReport {
        let mut scored = 0;
        let mut anomalies = Vec::new();
        for sample in samples {
            let Some(score) = self.score(sample) else {
                continue;
            };
            scored += 1;
            if score > self.threshold {
                anomalies.push(Anomaly {
                    timestamp: sample.timestamp,
                    score,
                    temperature: sample.temperature,
                    battery_capacity: sample.battery_capacity,
                    net_throughput: sample.net_throughput,
                });
            }
        }
        AnalysisReport {
            records: samples.len(),
            scored,
            skipped: samples.len() - scored,
            threshold: self.threshold,
            anomalies,
        }
    }
}

/// The value below which `q` of the (sorted in place) scores fall.
fn quantile(values: &mut [f64], q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let idx = ((values.len() - 1) as f64 * q).round() as usize;
    values[idx.min(values.len() - 1)]
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub timestamp: u64,
    pub score: f64,
    pub temperature: f32,
    pub battery_capacity: f32,
    pub net_throughput: f32,
}

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub records: usize,
    pub scored: usize,
    pub skipped: usize,
    pub threshold: f64,
    pub anomalies: Vec<Anomaly>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(ts: u64, temperature: f32, capacity: f32, net: f32) -> Sample {
        Sample {
            battery_voltage: 11.9,
            battery_current: 1.2,
            battery_capacity: capacity,
            temperature,
            net_throughput: net,
            timestamp: ts,
        }
    }

    /// A deterministic cloud around 55 °C, 80 %, 57 KiB/s.
    fn normal_operation(n: u64) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let a = (i % 7) as f32 / 6.0;
                let b = (i % 11) as f32 / 10.0;
                let c = (i % 13) as f32 / 12.0;
                reading(i, 50.0 + 10.0 * a, 78.0 + 4.0 * b, 50.0 + 15.0 * c)
            })
            .collect()
    }

    #[test]
    fn test_far_outlier_is_flagged() {
        let model = AnomalyModel::train(&normal_operation(400), DEFAULT_CONTAMINATION).unwrap();
        assert_eq!(model.trained_on(), 400);

        let overheating = reading(1_000, 95.0, 12.0, 900.0);
        let typical = reading(1_001, 55.0, 80.0, 57.5);

        assert_eq!(model.is_anomaly(&overheating), Some(true));
        assert_eq!(model.is_anomaly(&typical), Some(false));
        assert!(model.score(&overheating).unwrap() > model.score(&typical).unwrap());
    }

    #[test]
    fn test_sentinel_rows_are_skipped() {
        let mut samples = normal_operation(100);
        samples.push(reading(500, SENTINEL, 80.0, 57.0));
        samples.push(reading(501, 55.0, 80.0, SENTINEL));

        let model = AnomalyModel::train(&samples, DEFAULT_CONTAMINATION).unwrap();
        assert_eq!(model.trained_on(), 100);
        assert_eq!(model.skipped(), 2);
        assert_eq!(model.score(&samples[100]), None);

        let report = model.scan(&samples);
        assert_eq!(report.records, 102);
        assert_eq!(report.scored, 100);
        assert_eq!(report.skipped, 2);
        assert!(report.anomalies.iter().all(|a| a.timestamp < 500));
    }

    #[test]
    fn test_contamination_bounds_flagged_share() {
        let samples = normal_operation(400);
        let model = AnomalyModel::train(&samples, 0.1).unwrap();
        let report = model.scan(&samples);
        // strictly above the 90th percentile of the same scores
        assert!(report.anomalies.len() <= 40);
    }

    #[test]
    fn test_too_few_rows() {
        let mut samples = normal_operation(10);
        samples.extend((0..20).map(Sample::empty));
        assert!(matches!(
            AnomalyModel::train(&samples, DEFAULT_CONTAMINATION),
            Err(AnalysisError::InsufficientData {
                usable: 10,
                required: MIN_TRAINING_ROWS
            })
        ));
    }

    #[test]
    fn test_contamination_is_validated() {
        let samples = normal_operation(50);
        for bad in [0.0, -0.1, 0.75, f64::NAN] {
            assert!(matches!(
                AnomalyModel::train(&samples, bad),
                Err(AnalysisError::InvalidContamination(_))
            ));
        }
    }

    #[test]
    fn test_quantile() {
        let mut values = vec![0.5, 0.1, 0.9, 0.3, 0.7];
        assert_eq!(quantile(&mut values, 0.0), 0.1);
        assert_eq!(quantile(&mut values, 0.5), 0.5);
        assert_eq!(quantile(&mut values, 1.0), 0.9);
    }

    #[test]
    fn test_constant_column_is_usable() {
        let samples: Vec<Sample> = normal_operation(64)
            .into_iter()
            .map(|s| Sample {
                battery_capacity: 100.0,
                ..s
            })
            .collect();
        let model = AnomalyModel::train(&samples, DEFAULT_CONTAMINATION).unwrap();
        assert!(model.score(&samples[0]).unwrap().is_finite());
    }
}
