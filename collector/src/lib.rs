//! # ECS Exporter Collector
//!
//! The collection core of the ECS exporter: everything that happens between a
//! scrape request arriving and a flat list of gauge samples leaving.
//!
//! ## Architecture
//!
//! - **`types`**: Immutable per-scrape snapshots (clusters, services, container instances)
//! - **`gatherer`**: The `ClusterGatherer` and `MetricGatherer` capabilities the core consumes
//! - **`filter`**: Regex based cluster filtering
//! - **`metrics`**: The metric catalog, samples and Prometheus rendering
//! - **`publisher`**: Cancellation-safe publication onto the shared sample channel
//! - **`orchestrator`**: Scrape serialization, deadline, bounded fan-out and the `up` signal
//! - **`exporter`**: The describe/collect façade handed to the HTTP layer
//!
//! ## Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ecs_exporter_collector::{ClusterGatherer, Exporter, ExporterSettings};
//! # async fn run(gatherer: Arc<dyn ClusterGatherer>) -> eyre::Result<()> {
//! let settings = ExporterSettings::new("eu-west-1");
//! let exporter = Exporter::new(settings, gatherer, None)?;
//!
//! for sample in exporter.collect().await {
//!     println!("{sample}");
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

pub mod error;
pub mod exporter;
pub mod filter;
pub mod gatherer;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use error::CollectError;
pub use exporter::{
    Exporter,
    ExporterSettings,
    ScrapeResult,
};
pub use filter::ClusterFilter;
pub use gatherer::{
    ClusterGatherer,
    GatherFuture,
    MetricGatherer,
};
pub use metrics::{
    Catalog,
    MetricDesc,
    MetricKind,
    Sample,
};
pub use orchestrator::Orchestrator;
pub use publisher::Publisher;
pub use types::*;
