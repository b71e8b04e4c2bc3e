use std::time::{Duration, SystemTime};

use crate::monitor::snapshot::EntitySnapshot;

/// Direction of combined latency over a lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Increased,
    Decreased,
    Stable,
}

impl TrendDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Increased => "increased",
            Self::Decreased => "decreased",
            Self::Stable => "stable",
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined read+write latency change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub direction: TrendDirection,
    pub change_percent: f64,
    pub old_latency_ns: u64,
    pub new_latency_ns: u64,
}

/// Compares the newest snapshot against the oldest one inside `window`.
///
/// The scan walks newest to oldest and stops at the first entry older than
/// `now - window`; with no entry inside the window the oldest retained entry
/// is used. Returns `None` with fewer than two entries.
pub fn trend(
    history: &[EntitySnapshot],
    window: Duration,
    now: SystemTime,
    change_percent: f64,
) -> Option<Trend> {
    if history.len() < 2 {
        return None;
    }
    let latest = history.last()?;
    let boundary = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);

    let old = history
        .iter()
        .rev()
        .take_while(|s| s.timestamp >= boundary)
        .last()
        .or_else(|| history.first())?;

    let old_ns = old.combined_latency_ns();
    let new_ns = latest.combined_latency_ns();

    let (direction, change) = if old_ns == 0 {
        if new_ns > 0 {
            (TrendDirection::Increased, 100.0)
        } else {
            (TrendDirection::Stable, 0.0)
        }
    } else {
        let change = (new_ns as f64 - old_ns as f64) / old_ns as f64 * 100.0;
        let direction = if change > change_percent {
            TrendDirection::Increased
        } else if change < -change_percent {
            TrendDirection::Decreased
        } else {
            TrendDirection::Stable
        };
        (direction, change)
    };

    Some(Trend {
        direction,
        change_percent: change,
        old_latency_ns: old_ns,
        new_latency_ns: new_ns,
    })
}

/// Ranking key for top-N queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankBy {
    /// Combined read+write latency.
    #[default]
    Latency,
    /// Combined read+write IOPS.
    Iops,
    /// Combined read+write throughput.
    Throughput,
}

/// Returns the `n` highest-ranked snapshots, descending. Ties keep entity
/// name order.
pub fn rank(mut snapshots: Vec<EntitySnapshot>, n: usize, by: RankBy) -> Vec<EntitySnapshot> {
    snapshots.sort_by(|a, b| a.entity.cmp(&b.entity));
    match by {
        RankBy::Latency => {
            snapshots.sort_by(|a, b| b.combined_latency_ns().cmp(&a.combined_latency_ns()));
        }
        RankBy::Iops => {
            snapshots.sort_by(|a, b| b.combined_iops().total_cmp(&a.combined_iops()));
        }
        RankBy::Throughput => {
            snapshots.sort_by(|a, b| {
                b.combined_throughput_bps()
                    .total_cmp(&a.combined_throughput_bps())
            });
        }
    }
    snapshots.truncate(n);
    snapshots
}
