//! Remote collaborators: the geodata service protocol and the statistics lookup.

pub mod arcgis;
pub mod census;

use crate::artifact::FeatureTable;
use crate::catalog::SourceDefinition;
use crate::error::Result;
use crate::geometry::Boundary;
use async_trait::async_trait;
use std::sync::Arc;

pub use arcgis::ArcGisRestClient;
pub use census::{CensusApi, StatisticsProvider};

/// One spatial selection against one source.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub source: SourceDefinition,
    pub boundary: Arc<Boundary>,
}

impl QueryRequest {
    pub fn new(source: SourceDefinition, boundary: Arc<Boundary>) -> Self {
        Self { source, boundary }
    }
}

/// Features returned by a service, in the source's output reference.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub table: FeatureTable,
}

impl FeatureSet {
    pub fn count(&self) -> usize {
        self.table.len()
    }
}

/// Resolves the service and layer of a source and returns every feature that
/// intersects the request boundary. Each call starts from scratch; any error is
/// treated as retryable by the caller.
#[async_trait]
pub trait FeatureService: Send + Sync {
    async fn select_by_location(&self, request: &QueryRequest) -> Result<FeatureSet>;

    /// Cheap reachability check of a server root.
    async fn check_connection(&self, url: &str) -> Result<()>;
}
