//! Latency spike detection over an entity's retained history.
//!
//! The latest snapshot is scored against the population mean of every
//! retained snapshot (including itself) for read and write latency
//! separately. Only upward deviations count.

use crate::config::{AnomalyConfig, ZScoreDenominator};
use crate::monitor::snapshot::EntitySnapshot;

/// Detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyParams {
    pub threshold: f64,
    pub min_history: usize,
    pub denominator: ZScoreDenominator,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self::from(AnomalyConfig::default())
    }
}

impl From<AnomalyConfig> for AnomalyParams {
    fn from(cfg: AnomalyConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            min_history: cfg.min_history,
            denominator: cfg.z_score_denominator,
        }
    }
}

/// True when the latest read or write latency scores above the threshold.
/// Always false with fewer than `min_history` entries.
pub fn detect(history: &[EntitySnapshot], params: &AnomalyParams) -> bool {
    if history.is_empty() || history.len() < params.min_history {
        return false;
    }

    let read = score(history, params.denominator, |s| s.read_latency_ns);
    let write = score(history, params.denominator, |s| s.write_latency_ns);

    read > params.threshold || write > params.threshold
}

/// Scores the last entry's field against the whole slice.
/// A zero or non-finite denominator scores 0.
pub fn score(
    history: &[EntitySnapshot],
    denominator: ZScoreDenominator,
    field: impl Fn(&EntitySnapshot) -> u64,
) -> f64 {
    let Some(latest) = history.last() else {
        return 0.0;
    };

    let n = history.len() as f64;
    let mean = history.iter().map(|s| field(s) as f64).sum::<f64>() / n;
    let variance = history
        .iter()
        .map(|s| {
            let d = field(s) as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;

    let divisor = match denominator {
        ZScoreDenominator::StdDev => variance.sqrt(),
        ZScoreDenominator::Variance => variance,
    };
    if divisor == 0.0 || !divisor.is_finite() {
        return 0.0;
    }

    (field(latest) as f64 - mean) / divisor
}
