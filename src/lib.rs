pub mod apis;
pub mod artifact;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod geometry;
pub mod logging;
pub mod metrics;
pub mod pipeline;

pub use catalog::{CensusLevel, RoadLayer, SourceCatalog, SourceDefinition, SourceFamily};
pub use error::{CollectError, Result};
pub use pipeline::{Collector, QueryExecutor, QueryOutcome};
