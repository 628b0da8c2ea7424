//! Keeps a local device inventory aligned with an external IoT device
//! registry, ingests deduplicated readings and maintains outlier-filtered
//! statistics per sensor channel.

pub mod aggregate;
pub mod config;
pub mod db;
pub mod dedup;
pub mod errors;
pub mod fanout;
pub mod metrics;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod source;
pub mod stats;
pub mod store;
pub mod sync;
pub mod validate;

pub use aggregate::StatisticsAggregator;
pub use errors::{Error, Result};
pub use sync::{SyncOptions, SyncOrchestrator};
