//! Dispatch pipeline.
//!
//! Each file event runs `match -> build -> dedup -> publish -> meter`
//! independently: an unmatched event is rejected, a failed one is reported
//! with the stage it failed at, and neither affects the rest of the batch.
//! Metering is best-effort and never fails an event that was published.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::NodeConfig;
use crate::dedup::{self, DuplicateCache};
use crate::error::{ConfigError, NodeError, NodeResult, TransportError};
use crate::matcher::{MatchMode, Matcher};
use crate::message::{resolve_url, MessageBuilder, NotificationMessage};
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use crate::publisher::{Broker, Publisher, DEFAULT_QUEUE_CAPACITY};
use crate::storage::KeyValueStore;

const PIPELINE_TAG: &str = "DispatchPipeline:";

/// A file made available by the host pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvent {
    /// Public URL of the file tree.
    pub base_url: String,
    /// Path of the file below `base_url`.
    pub relative_path: String,
    /// File size, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
}

impl FileEvent {
    /// Creates an event.
    pub fn new(
        base_url: impl Into<String>,
        relative_path: impl Into<String>,
        file_size_bytes: Option<u64>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            relative_path: relative_path.into(),
            file_size_bytes,
        }
    }

    /// Full URL of the file.
    #[must_use]
    pub fn url(&self) -> String {
        resolve_url(&self.base_url, &self.relative_path)
    }
}

/// Step at which an event failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Building the notification.
    Build,
    /// Consulting the duplicate cache.
    Dedup,
    /// Handing the notification to the broker.
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Dedup => "dedup",
            Self::Publish => "publish",
        })
    }
}

/// An event that could not be announced.
#[derive(Debug)]
pub struct FailedEvent {
    /// The event as received.
    pub event: FileEvent,
    /// Where it failed.
    pub stage: Stage,
    /// Why it failed.
    pub error: NodeError,
}

impl FailedEvent {
    /// Returns true if redelivering the event may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// An event that was announced.
#[derive(Debug, Clone)]
pub struct PublishedNotification {
    /// The event as received.
    pub event: FileEvent,
    /// The message sent to the broker.
    pub message: NotificationMessage,
}

impl PublishedNotification {
    /// Returns true if the file had been announced before.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.message.is_update()
    }
}

/// Result of processing one event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Matched, built and published.
    Accepted(PublishedNotification),
    /// Belongs to no dataset.
    Rejected(FileEvent),
    /// Matched but could not be announced.
    Failed(FailedEvent),
}

/// Partition of a batch, each part in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Published events.
    pub accepted: Vec<PublishedNotification>,
    /// Events belonging to no dataset.
    pub rejected: Vec<FileEvent>,
    /// Events that failed.
    pub failed: Vec<FailedEvent>,
}

/// Counts of a `BatchReport`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Published events.
    pub accepted: usize,
    /// Events belonging to no dataset.
    pub rejected: usize,
    /// Events that failed.
    pub failed: usize,
}

impl BatchReport {
    fn from_outcomes(outcomes: impl IntoIterator<Item = EventOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            match outcome {
                EventOutcome::Accepted(published) => report.accepted.push(published),
                EventOutcome::Rejected(event) => report.rejected.push(event),
                EventOutcome::Failed(failed) => report.failed.push(failed),
            }
        }
        report
    }

    /// Number of events in the batch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len() + self.failed.len()
    }

    /// Per-partition counts.
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            accepted: self.accepted.len(),
            rejected: self.rejected.len(),
            failed: self.failed.len(),
        }
    }
}

/// Turns file events into broker notifications.
///
/// # Example
/// ```rust,ignore
/// let pipeline = DispatchPipeline::new(config, catalog, broker)?
///     .with_cache(store.clone())
///     .with_metrics(store);
/// let report = pipeline.dispatch(events);
/// ```
#[derive(Debug)]
pub struct DispatchPipeline {
    config: Arc<NodeConfig>,
    matcher: Matcher,
    builder: MessageBuilder,
    publisher: Publisher,
    cache: Option<DuplicateCache>,
    metrics: Option<MetricsRecorder>,
}

impl DispatchPipeline {
    /// Creates a pipeline without duplicate cache or metrics.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Internal` if the publish workers cannot start.
    pub fn new(config: Arc<NodeConfig>, catalog: Arc<Catalog>, broker: Arc<dyn Broker>) -> NodeResult<Self> {
        let publisher = Publisher::start(
            broker,
            config.dispatch_workers,
            DEFAULT_QUEUE_CAPACITY,
            config.publish_timeout(),
        )?;
        info!(
            "{PIPELINE_TAG} ready with {} datasets, topic prefix {}/{}",
            catalog.len(),
            config.topic_prefix,
            config.centre_id
        );
        Ok(Self {
            matcher: Matcher::new(catalog),
            builder: MessageBuilder::new(Arc::clone(&config)),
            config,
            publisher,
            cache: None,
            metrics: None,
        })
    }

    /// Enables duplicate detection over `store`.
    #[must_use]
    pub fn with_cache(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.cache = Some(DuplicateCache::new(store, self.config.cache_expiry()));
        self
    }

    /// Enables metering into `store`.
    #[must_use]
    pub fn with_metrics(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.metrics = Some(MetricsRecorder::new(store));
        self
    }

    /// Switches the matcher to `mode`.
    #[must_use]
    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.matcher = Matcher::with_mode(Arc::clone(self.matcher.catalog()), mode);
        self
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Dataset catalog.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        self.matcher.catalog()
    }

    /// Processes one event.
    pub fn process(&self, event: FileEvent) -> EventOutcome {
        let identification = self.matcher.identify(&event.relative_path);
        for degraded in &identification.degraded {
            warn!("{PIPELINE_TAG} {degraded}");
        }
        let Some(dataset) = identification.dataset else {
            debug!("{PIPELINE_TAG} no dataset for {}", event.relative_path);
            return EventOutcome::Rejected(event);
        };

        let url = event.url();
        let mut message = match self
            .builder
            .build(dataset, &url, &event.relative_path, event.file_size_bytes)
        {
            Ok(message) => message,
            Err(e) => return Self::fail(event, Stage::Build, e.into()),
        };
        let data_id = message.data_id().to_string();

        let _guard = match self.cache.as_ref().map(|cache| cache.lock(&data_id)).transpose() {
            Ok(guard) => guard,
            Err(e) => return Self::fail(event, Stage::Dedup, TransportError::from(e).into()),
        };
        if let Some(cache) = &self.cache {
            match cache.seen(&data_id) {
                Ok(true) => message.add_update_link(),
                Ok(false) => {}
                Err(e) => return Self::fail(event, Stage::Dedup, TransportError::from(e).into()),
            }
        }

        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(e) => return Self::fail(event, Stage::Build, e.into()),
        };
        let marker = dedup::marker(&payload);
        if let Err(e) = self.publisher.publish(message.topic(), payload) {
            return Self::fail(event, Stage::Publish, e.into());
        }
        info!(
            "{PIPELINE_TAG} published {data_id} on {}{}",
            message.topic(),
            if message.is_update() { " (update)" } else { "" }
        );

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remember(&data_id, &marker) {
                warn!("{PIPELINE_TAG} failed to remember {data_id}: {e}");
            }
        }
        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.record(&dataset.metadata_id, event.file_size_bytes) {
                warn!("{PIPELINE_TAG} failed to meter {data_id}: {e}");
            }
        }

        EventOutcome::Accepted(PublishedNotification { event, message })
    }

    fn fail(event: FileEvent, stage: Stage, error: NodeError) -> EventOutcome {
        error!(
            "{PIPELINE_TAG} {stage} failed for {} ({}): {error}",
            event.relative_path, event.base_url
        );
        EventOutcome::Failed(FailedEvent { event, stage, error })
    }

    /// Processes a batch, partitioning it into accepted, rejected and failed
    /// events in input order.
    pub fn dispatch(&self, events: Vec<FileEvent>) -> BatchReport {
        let workers = self.config.dispatch_workers.clamp(1, events.len().max(1));
        let report = if workers == 1 {
            BatchReport::from_outcomes(events.into_iter().map(|event| self.process(event)))
        } else {
            BatchReport::from_outcomes(self.process_parallel(events, workers))
        };

        let summary = report.summary();
        info!(
            "{PIPELINE_TAG} batch done: {} accepted, {} rejected, {} failed",
            summary.accepted, summary.rejected, summary.failed
        );
        report
    }

    fn process_parallel(&self, events: Vec<FileEvent>, workers: usize) -> Vec<EventOutcome> {
        let total = events.len();
        let (job_tx, job_rx) = bounded::<(usize, FileEvent)>(total);
        let (out_tx, out_rx) = bounded::<(usize, EventOutcome)>(total);
        for job in events.into_iter().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    while let Ok((idx, event)) = job_rx.recv() {
                        let _ = out_tx.send((idx, self.process(event)));
                    }
                });
            }
        });
        drop(out_tx);

        let mut slots: Vec<Option<EventOutcome>> = (0..total).map(|_| None).collect();
        for (idx, outcome) in out_rx.try_iter() {
            slots[idx] = Some(outcome);
        }
        slots.into_iter().flatten().collect()
    }

    /// Announces the withdrawal of discovery metadata record `identifier`.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Build` for a blank identifier and
    /// `NodeError::Transport` if the broker does not acknowledge.
    pub fn delete_metadata_record(&self, identifier: &str) -> NodeResult<bool> {
        let message = self.builder.build_retraction(identifier)?;
        let payload = message.to_payload()?;
        self.publisher.publish(message.topic(), payload)?;
        info!("{PIPELINE_TAG} announced deletion of {identifier} on {}", message.topic());
        Ok(true)
    }

    fn metrics(&self) -> NodeResult<&MetricsRecorder> {
        self.metrics
            .as_ref()
            .ok_or_else(|| ConfigError::MetricsDisabled.into())
    }

    /// Exports the distribution metrics.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Configuration` if metering is disabled, or the
    /// store's failure.
    pub fn export_metrics(&self) -> NodeResult<MetricsSnapshot> {
        Ok(self.metrics()?.export(self.catalog()).map_err(TransportError::from)?)
    }

    /// Exports the distribution metrics, then clears them.
    ///
    /// # Errors
    ///
    /// As `export_metrics`.
    pub fn purge_metrics(&self) -> NodeResult<MetricsSnapshot> {
        let snapshot = self.metrics()?.purge(self.catalog()).map_err(TransportError::from)?;
        info!("{PIPELINE_TAG} purged metrics for {} datasets", snapshot.len());
        Ok(snapshot)
    }

    /// Stops the publish workers after queued publishes complete.
    pub fn shutdown(self) {
        self.publisher.shutdown();
    }
}
