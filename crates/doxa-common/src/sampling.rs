//! Percentile and regression-detection utilities shared by the cache,
//! commit engine, and streaming engine for reporting latency/throughput
//! statistics.

use serde::{Deserialize, Serialize};

/// Summary statistics over a set of latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub std_dev: f64,
}

impl LatencyStats {
    fn zero() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            median: 0.0,
            p50: 0.0,
            p75: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            std_dev: 0.0,
        }
    }
}

/// Clamps a percentile index into `[0, n-1]`: `ceil(p/100*n) - 1`.
fn percentile_index(p: f64, n: usize) -> usize {
    let idx = (p / 100.0 * n as f64).ceil() as i64 - 1;
    idx.clamp(0, n as i64 - 1) as usize
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    sorted[percentile_index(p, sorted.len())]
}

/// Computes latency statistics over `samples`. Empty input returns all
/// zeros; a single sample returns that value for every stat and zero
/// std-dev.
pub fn calculate_latency_stats(samples: &[f64]) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::zero();
    }

    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let mean = sum / n as f64;

    let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let std_dev = variance.sqrt();

    LatencyStats {
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        median: percentile(&sorted, 50.0),
        p50: percentile(&sorted, 50.0),
        p75: percentile(&sorted, 75.0),
        p90: percentile(&sorted, 90.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
        std_dev,
    }
}

/// Per-metric regression thresholds, expressed as percent change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegressionThresholds {
    pub p50: f64,
    pub p95: f64,
    pub throughput: f64,
    pub cold_start: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            p50: 20.0,
            p95: 25.0,
            throughput: -15.0,
            cold_start: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegressionSeverity {
    None,
    Minor,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricChange {
    pub metric: String,
    pub baseline: f64,
    pub current: f64,
    pub percent_change: f64,
    pub regressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionReport {
    pub changes: Vec<MetricChange>,
    pub severity: RegressionSeverity,
}

struct Metric {
    name: &'static str,
    baseline: f64,
    current: f64,
    /// Threshold sign matches the metric's "worse" direction: a positive
    /// threshold means regression is `percent_change > threshold`; a
    /// negative threshold (throughput) means regression is
    /// `percent_change < threshold`.
    threshold: f64,
}

/// Compares `baseline` against `current` per-metric and classifies overall
/// severity by the count of regressed metrics: 0 -> none, 1 -> minor,
/// 2 -> moderate, >=3 -> severe. A zero baseline skips that metric.
/// Regression is a strict `>`/`<` against the threshold, never `>=`/`<=`.
pub fn detect_regression(
    baseline: &LatencyPerf,
    current: &LatencyPerf,
    thresholds: RegressionThresholds,
) -> RegressionReport {
    let metrics = [
        Metric {
            name: "p50",
            baseline: baseline.p50,
            current: current.p50,
            threshold: thresholds.p50,
        },
        Metric {
            name: "p95",
            baseline: baseline.p95,
            current: current.p95,
            threshold: thresholds.p95,
        },
        Metric {
            name: "throughput",
            baseline: baseline.throughput,
            current: current.throughput,
            threshold: thresholds.throughput,
        },
        Metric {
            name: "cold_start",
            baseline: baseline.cold_start,
            current: current.cold_start,
            threshold: thresholds.cold_start,
        },
    ];

    let mut changes = Vec::with_capacity(metrics.len());
    let mut regressed_count = 0;

    for m in metrics {
        if m.baseline == 0.0 {
            continue;
        }
        let percent_change = (m.current - m.baseline) / m.baseline * 100.0;
        let regressed = if m.threshold < 0.0 {
            percent_change < m.threshold
        } else {
            percent_change > m.threshold
        };
        if regressed {
            regressed_count += 1;
        }
        changes.push(MetricChange {
            metric: m.name.to_string(),
            baseline: m.baseline,
            current: m.current,
            percent_change,
            regressed,
        });
    }

    let severity = match regressed_count {
        0 => RegressionSeverity::None,
        1 => RegressionSeverity::Minor,
        2 => RegressionSeverity::Moderate,
        _ => RegressionSeverity::Severe,
    };

    RegressionReport { changes, severity }
}

/// The subset of a latency/throughput profile the regression detector
/// compares across a baseline/current pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencyPerf {
    pub p50: f64,
    pub p95: f64,
    pub throughput: f64,
    pub cold_start: f64,
}
