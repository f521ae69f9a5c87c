//! # wis2node - WIS2 notification dispatch
//!
//! Matches newly available data files to the dataset definitions of a
//! catalog and announces each one on a pub/sub broker as a WIS2
//! notification message.
//!
//! ## Core Concepts
//!
//! - **Catalog**: the dataset definitions loaded once at start-up
//! - **Matcher**: finds the first definition a file path belongs to
//! - **NotificationMessage**: the GeoJSON announcement of one file
//! - **DuplicateCache**: tells new files from updates of announced ones
//! - **MetricsRecorder**: per-day file and byte counters
//! - **DispatchPipeline**: runs `match -> build -> dedup -> publish -> meter`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wis2node::{Catalog, DispatchPipeline, FileEvent, InMemoryBroker, InMemoryStore, NodeConfig};
//!
//! let config = Arc::new(NodeConfig::from_env()?);
//! let catalog = Arc::new(Catalog::load(&config.dataset_config)?);
//! let store = Arc::new(InMemoryStore::new());
//!
//! let pipeline = DispatchPipeline::new(config, catalog, Arc::new(InMemoryBroker::new()))?
//!     .with_cache(store.clone())
//!     .with_metrics(store);
//!
//! let report = pipeline.dispatch(vec![FileEvent::new(
//!     "https://dd.weather.gc.ca",
//!     "observations/swob-ml/20240315/CYOW/2024-03-15-0600-CYOW-AUTO-swob.xml",
//!     Some(4096),
//! )]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Configuration and dataset definitions
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod error;

// Matching and message building
pub mod matcher;
pub mod message;

// External services
pub mod dedup;
pub mod metrics;
pub mod publisher;
pub mod storage;

// Dispatch
pub mod pipeline;

// Re-export primary types at crate root for convenience
pub use catalog::Catalog;
pub use config::{BrokerConfig, NodeConfig};
pub use dataset::{DatasetDefinition, RawDatasetDefinition};
pub use dedup::DuplicateCache;
pub use error::{BuildError, ConfigError, FilterError, NodeError, NodeResult, TransportError};
pub use matcher::{identify, Identification, MatchMode, Matcher};
pub use message::{Link, LinkRel, MessageBuilder, NotificationMessage};
pub use metrics::{DatasetMetrics, MetricsRecorder, MetricsSnapshot};
pub use pipeline::{
    BatchReport, BatchSummary, DispatchPipeline, EventOutcome, FailedEvent, FileEvent,
    PublishedNotification, Stage,
};
pub use publisher::{Broker, Delivery, InMemoryBroker, Publisher, Qos};
pub use storage::{InMemoryStore, KeyValueStore, StoreError};
