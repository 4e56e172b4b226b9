//! Chart series: cumulative folding and bounded-length downsampling
//!
//! A series is always rebuilt wholesale from its raw points; readers never
//! observe a half-updated series.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::protocol::{as_i64, num_field, LocationId, Timeframe};

/// Default display budget per series.
pub const DEFAULT_MAX_POINTS: usize = 100;

/// Smallest budget that can hold the first point, the last point and one peak.
pub const MIN_MAX_POINTS: usize = 3;

/// Field names a point's time label may arrive under.
const TIME_FIELDS: [&str; 5] = ["timestamp", "time", "hour", "date", "label"];

/// One raw sample as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPoint {
    pub timestamp: String,
    pub value: i64,
}

impl RawPoint {
    pub fn new(timestamp: impl Into<String>, value: i64) -> Self {
        Self {
            timestamp: timestamp.into(),
            value,
        }
    }

    /// Accepts a bare number or an object with `count`/`value` and a time
    /// label. Points without a label are labelled by their position.
    pub fn from_json(v: &Value, index: usize) -> Option<Self> {
        match v {
            Value::Number(_) | Value::String(_) => Some(Self::new(index.to_string(), as_i64(v)?)),
            Value::Object(_) => {
                let value = num_field(v, &["count", "value"]).unwrap_or(0);
                let timestamp = TIME_FIELDS
                    .iter()
                    .find_map(|k| v.get(*k))
                    .map(|t| match t {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| index.to_string());
                Some(Self { timestamp, value })
            }
            _ => None,
        }
    }
}

/// One display point: the raw sample and the running total up to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: String,
    pub raw_value: i64,
    pub cumulative_value: u64,
}

/// Fold raw samples into a running total. Zero and negative samples never
/// reduce the total.
pub fn cumulative(raw: &[RawPoint]) -> Vec<SeriesPoint> {
    let mut total = 0u64;
    raw.iter()
        .map(|p| {
            total = total.saturating_add(p.value.max(0) as u64);
            SeriesPoint {
                timestamp: p.timestamp.clone(),
                raw_value: p.value,
                cumulative_value: total,
            }
        })
        .collect()
}

/// Reduce `points` to exactly `max_points` by keeping the first and last
/// points and the highest-keyed point of each interior bucket.
///
/// Interior points are split into `max_points - 2` contiguous buckets of equal
/// size, the last bucket taking the remainder. Ties keep the earliest point.
/// Budgets below [`MIN_MAX_POINTS`] are raised to it.
pub fn downsample_peaks<T, K>(points: &[T], max_points: usize, key: impl Fn(&T) -> K) -> Vec<T>
where
    T: Clone,
    K: PartialOrd,
{
    if max_points < MIN_MAX_POINTS {
        warn!(max_points, min = MIN_MAX_POINTS, "Chart budget too small, raising it");
    }
    let max_points = max_points.max(MIN_MAX_POINTS);
    if points.len() <= max_points {
        return points.to_vec();
    }

    let last = points.len() - 1;
    let interior = &points[1..last];
    let buckets = max_points - 2;
    let size = interior.len() / buckets;

    let mut out = Vec::with_capacity(max_points);
    out.push(points[0].clone());
    for b in 0..buckets {
        let start = b * size;
        let end = if b + 1 == buckets { interior.len() } else { start + size };

        let mut best = &interior[start];
        let mut best_key = key(best);
        for p in &interior[start + 1..end] {
            let k = key(p);
            if k > best_key {
                best = p;
                best_key = k;
            }
        }
        out.push(best.clone());
    }
    out.push(points[last].clone());

    trace!(from = points.len(), to = out.len(), "Downsampled series");
    out
}

/// Douglas-Peucker line simplification over (index, value). Keeps the first and
/// last points and every point farther than `tolerance` from the simplified line.
pub fn simplify<T: Clone>(points: &[T], tolerance: f64, value: impl Fn(&T) -> f64) -> Vec<T> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let last = points.len() - 1;
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[last] = true;

    let mut stack = vec![(0usize, last)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let a = (start as f64, value(&points[start]));
        let b = (end as f64, value(&points[end]));

        let mut max_dist = 0.0;
        let mut max_idx = start;
        for (i, p) in points.iter().enumerate().take(end).skip(start + 1) {
            let d = perpendicular_distance((i as f64, value(p)), a, b);
            if d > max_dist {
                max_dist = d;
                max_idx = i;
            }
        }

        if max_dist > tolerance {
            keep[max_idx] = true;
            stack.push((start, max_idx));
            stack.push((max_idx, end));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then(|| p.clone()))
        .collect()
}

fn perpendicular_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        return ((p.0 - a.0).powi(2) + (p.1 - a.1).powi(2)).sqrt();
    }
    (dy * p.0 - dx * p.1 + b.0 * a.1 - b.1 * a.0).abs() / len
}

/// How a cumulative series is reduced for display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownsampleStrategy {
    /// Bucketed max; exact point budget
    Peaks { max_points: usize },
    /// Douglas-Peucker; smoother, variable length
    Simplify { tolerance: f64 },
}

impl Default for DownsampleStrategy {
    fn default() -> Self {
        DownsampleStrategy::Peaks {
            max_points: DEFAULT_MAX_POINTS,
        }
    }
}

impl DownsampleStrategy {
    pub fn apply(&self, series: &[SeriesPoint]) -> Vec<SeriesPoint> {
        match *self {
            DownsampleStrategy::Peaks { max_points } => {
                downsample_peaks(series, max_points, |p| p.cumulative_value)
            }
            DownsampleStrategy::Simplify { tolerance } => {
                simplify(series, tolerance, |p| p.cumulative_value as f64)
            }
        }
    }
}

/// Display series for one (location, timeframe).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartSeries {
    /// Raw samples the series was built from (bounded history)
    pub raw: Vec<RawPoint>,
    /// Cumulative, downsampled points for display
    pub points: Vec<SeriesPoint>,
    /// Running total over all raw samples
    pub total: u64,
}

impl ChartSeries {
    fn build(raw: Vec<RawPoint>, strategy: &DownsampleStrategy) -> Self {
        let full = cumulative(&raw);
        let total = full.last().map_or(0, |p| p.cumulative_value);
        Self {
            points: strategy.apply(&full),
            raw,
            total,
        }
    }
}

/// All chart series, keyed by (location, timeframe).
pub struct ChartStore {
    series: HashMap<(LocationId, Timeframe), ChartSeries>,
    strategy: DownsampleStrategy,
    /// Maximum raw samples kept per series
    raw_history: usize,
}

impl ChartStore {
    pub fn new(strategy: DownsampleStrategy, raw_history: usize) -> Self {
        Self {
            series: HashMap::new(),
            strategy,
            raw_history: raw_history.max(1),
        }
    }

    /// Replace a series with a new batch of raw samples.
    pub fn replace(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        mut raw: Vec<RawPoint>,
    ) -> &ChartSeries {
        if raw.len() > self.raw_history {
            raw.drain(..raw.len() - self.raw_history);
        }
        let series = ChartSeries::build(raw, &self.strategy);
        debug!(
            location = location_id,
            %timeframe,
            raw = series.raw.len(),
            shown = series.points.len(),
            total = series.total,
            "Chart series replaced"
        );

        let slot = self
            .series
            .entry((location_id.to_string(), timeframe))
            .or_default();
        *slot = series;
        slot
    }

    /// Append one sample and rebuild the series from scratch.
    pub fn push_point(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        point: RawPoint,
    ) -> &ChartSeries {
        let mut raw = self
            .series
            .get(&(location_id.to_string(), timeframe))
            .map(|s| s.raw.clone())
            .unwrap_or_default();
        raw.push(point);
        self.replace(location_id, timeframe, raw)
    }

    pub fn get(&self, location_id: &str, timeframe: Timeframe) -> Option<&ChartSeries> {
        self.series.get(&(location_id.to_string(), timeframe))
    }

    /// Forget every series of a location.
    pub fn remove_location(&mut self, location_id: &str) {
        self.series.retain(|(l, _), _| l != location_id);
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
