//! Data distribution metrics.
//!
//! Counters live in the external key-value store under
//! `metrics_{YYYY-MM-DD}_{dataset}_{files|bytes}`, one pair per UTC day and
//! dataset plus a `total` pair per day. All updates go through the store's
//! atomic increment so concurrent publishes never lose counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::storage::{KeyValueStore, StoreError};

const METRICS_TAG: &str = "MetricsRecorder:";

/// Glob selecting every metrics key.
pub const METRICS_KEY_PATTERN: &str = "metrics_20*";

/// Dataset name used for the per-day process totals.
pub const TOTAL_DATASET: &str = "total";

/// Counter kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Number of files published.
    Files,
    /// Number of bytes published.
    Bytes,
}

impl Metric {
    /// Key suffix for this metric.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Bytes => "bytes",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "files" => Some(Self::Files),
            "bytes" => Some(Self::Bytes),
            _ => None,
        }
    }
}

/// Builds the store key for one counter.
#[must_use]
pub fn metric_key(day: NaiveDate, dataset: &str, metric: Metric) -> String {
    format!(
        "metrics_{}_{}_{}",
        day.format("%Y-%m-%d"),
        dataset.replace('_', "-"),
        metric.as_str()
    )
}

/// Parses a counter key into `(day, dataset, metric)`.
#[must_use]
pub fn parse_metric_key(key: &str) -> Option<(NaiveDate, String, Metric)> {
    let mut parts = key.split('_');
    let (Some("metrics"), Some(day), Some(dataset), Some(metric), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    let day = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    if dataset.is_empty() {
        return None;
    }
    Some((day, dataset.to_string(), Metric::parse(metric)?))
}

/// Name a dataset is exported under: the last `:` segment of its id, with
/// `_` spelled as `-` the way keys store it.
#[must_use]
pub fn export_name(dataset: &str) -> String {
    dataset.rsplit(':').next().unwrap_or(dataset).replace('_', "-")
}

/// Renders a byte count in binary units picked by its decimal length.
///
/// Up to 7 digits -> KB, 8-9 -> MB, 10-12 -> GB, 13-14 -> TB, longer -> PB.
#[must_use]
pub fn pretty_bytes(num_bytes: u64) -> String {
    let digits = num_bytes.to_string().len();
    let (unit, power) = match digits {
        0..=7 => ("KB", 1),
        8..=9 => ("MB", 2),
        10..=12 => ("GB", 3),
        13..=14 => ("TB", 4),
        _ => ("PB", 5),
    };

    #[allow(clippy::cast_precision_loss)]
    let mut value = num_bytes as f64;
    for _ in 0..power {
        value /= 1024.0;
    }

    let mut text = format!("{value:.2}");
    while text.ends_with('0') && !text.ends_with(".0") {
        text.pop();
    }
    format!("{text} {unit}")
}

/// Raw counters for one dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Files published.
    pub files: u64,
    /// Bytes published.
    pub bytes: u64,
}

/// Exported metrics for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetrics {
    /// Files published.
    pub files: u64,
    /// Human-readable volume.
    pub bytes: String,
    /// Dataset title from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Dataset topic from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Point-in-time export keyed by short dataset id.
pub type MetricsSnapshot = BTreeMap<String, DatasetMetrics>;

/// Records and exports distribution counters.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

fn parse_counter(key: &str, raw: Option<Vec<u8>>) -> Result<u64, StoreError> {
    let Some(raw) = raw else {
        return Ok(0);
    };
    std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))
}

fn to_delta(bytes: u64) -> Result<i64, StoreError> {
    i64::try_from(bytes).map_err(|_| StoreError::BackendError(format!("byte count too large: {bytes}")))
}

impl MetricsRecorder {
    /// Creates a recorder over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Counts one published file of `size_bytes` against today's UTC partition.
    ///
    /// # Errors
    ///
    /// Propagates store failures; counters already incremented stay incremented.
    pub fn record(&self, dataset: &str, size_bytes: Option<u64>) -> Result<(), StoreError> {
        self.record_on(Utc::now().date_naive(), dataset, size_bytes)
    }

    /// Counts one published file against the partition for `day`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ReservedKey` if `dataset` would export as the
    /// totals row, and propagates store failures.
    pub fn record_on(
        &self,
        day: NaiveDate,
        dataset: &str,
        size_bytes: Option<u64>,
    ) -> Result<(), StoreError> {
        if export_name(dataset) == TOTAL_DATASET {
            return Err(StoreError::ReservedKey(metric_key(day, dataset, Metric::Files)));
        }
        let delta = to_delta(size_bytes.unwrap_or(0))?;
        for name in [dataset, TOTAL_DATASET] {
            self.store.incr(&metric_key(day, name, Metric::Files))?;
            self.store.incr_by(&metric_key(day, name, Metric::Bytes), delta)?;
        }
        debug!("{METRICS_TAG} {day} {dataset} +1 file, +{delta} bytes");
        Ok(())
    }

    /// Reads the raw counters of `dataset` for `day`.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a non-integer counter is an error.
    pub fn counts(&self, day: NaiveDate, dataset: &str) -> Result<Counts, StoreError> {
        Ok(Counts {
            files: self.read_counter(&metric_key(day, dataset, Metric::Files))?,
            bytes: self.read_counter(&metric_key(day, dataset, Metric::Bytes))?,
        })
    }

    fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        parse_counter(key, self.store.get(key)?)
    }

    /// Scans every metrics key and folds it into a snapshot. `read` fetches
    /// each scanned key, so passing a removing read purges as it goes and
    /// increments that land after a key was read survive for the next run.
    fn collect<F>(&self, catalog: &Catalog, mut read: F) -> Result<MetricsSnapshot, StoreError>
    where
        F: FnMut(&str) -> Result<Option<Vec<u8>>, StoreError>,
    {
        let keys = self.store.scan(METRICS_KEY_PATTERN)?;
        let mut raw: BTreeMap<String, Counts> = BTreeMap::new();

        for key in &keys {
            let stored = read(key)?;
            let Some((_, dataset, metric)) = parse_metric_key(key) else {
                warn!("{METRICS_TAG} ignoring unrecognized key {key}");
                continue;
            };
            let value = match parse_counter(key, stored) {
                Ok(v) => v,
                Err(e) => {
                    warn!("{METRICS_TAG} ignoring {key}: {e}");
                    continue;
                }
            };
            let short = export_name(&dataset);
            let counts = raw.entry(short).or_default();
            match metric {
                Metric::Files => counts.files += value,
                Metric::Bytes => counts.bytes += value,
            }
        }

        let snapshot = raw
            .into_iter()
            .map(|(id, counts)| {
                let def = catalog.find_by_metadata_id(&id);
                let metrics = DatasetMetrics {
                    files: counts.files,
                    bytes: pretty_bytes(counts.bytes),
                    title: def.and_then(|d| d.title.clone()),
                    topic: def.map(|d| d.topic.clone()),
                };
                (id, metrics)
            })
            .collect();

        Ok(snapshot)
    }

    /// Exports all counters, joined with catalog titles and topics.
    ///
    /// # Errors
    ///
    /// Propagates store failures from the key scan.
    pub fn export(&self, catalog: &Catalog) -> Result<MetricsSnapshot, StoreError> {
        self.collect(catalog, |key| self.store.get(key))
    }

    /// Exports all counters, removing each key as it is read.
    ///
    /// Each counter is read and removed in one store operation, so a file
    /// recorded during the purge is either in the returned snapshot or left
    /// in the store, never dropped.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn purge(&self, catalog: &Catalog) -> Result<MetricsSnapshot, StoreError> {
        self.collect(catalog, |key| {
            debug!("{METRICS_TAG} removing {key}");
            self.store.take(key)
        })
    }
}
