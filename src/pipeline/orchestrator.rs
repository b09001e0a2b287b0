//! Runs a full collection: boundary, geography, every infrastructure source,
//! ledger and tabular export.

use super::executor::{QueryExecutor, QueryOutcome};
use super::flatten::{self, FlatRole};
use super::formats::{ChainOutput, FormatChain};
use super::identify;
use super::kml::KmlOptions;
use super::ledger::{Ledger, LedgerEntry, LedgerStatus};
use crate::apis::{QueryRequest, StatisticsProvider};
use crate::artifact::{self, ArtifactFormat, FeatureTable};
use crate::catalog::{SourceCatalog, SourceDefinition, SourceFamily};
use crate::config::CollectConfig;
use crate::constants::{
    FACILITY_CSV, GEOGRAPHY_CSV, GEOGRAPHY_SECTOR, GEOID_FIELD, LEDGER_FILE, RUN_SUMMARY_FILE, SECTOR_FIELD,
};
use crate::error::{CollectError, Result};
use crate::geometry::{Boundary, BoundaryKind, BoundaryPair};
use crate::metrics;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Output directories of one run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub base: PathBuf,
    pub geojson: PathBuf,
    pub gpkg: PathBuf,
    pub kml: PathBuf,
    pub csv: PathBuf,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            geojson: base.join("geojson"),
            gpkg: base.join("gpkg"),
            kml: base.join("kml"),
            csv: base.join("csv"),
            base,
        }
    }

    pub fn primary_path(&self, source: &SourceDefinition) -> PathBuf {
        self.geojson
            .join(format!("{}.{}", source.key, ArtifactFormat::GeoJson.extension()))
    }
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub feature_index: Option<usize>,
    pub rederive_boundary: bool,
    pub gpkg: bool,
    pub overlay: Option<ArtifactFormat>,
    pub csv: bool,
    pub concurrency: usize,
    pub run_deadline: Option<Duration>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self::from(&CollectConfig::default())
    }
}

impl From<&CollectConfig> for CollectOptions {
    fn from(config: &CollectConfig) -> Self {
        let overlay = if config.outputs.kmz {
            Some(ArtifactFormat::Kmz)
        } else if config.outputs.kml {
            Some(ArtifactFormat::Kml)
        } else {
            None
        };
        Self {
            feature_index: config.feature_index,
            rederive_boundary: config.rederive_boundary,
            gpkg: config.outputs.gpkg,
            overlay,
            csv: config.outputs.csv,
            concurrency: config.query.concurrency.max(1),
            run_deadline: config.query.run_deadline(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunTotals {
    pub sources: usize,
    pub collected: usize,
    pub empty: usize,
    pub unavailable: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub features: usize,
}

impl RunTotals {
    fn from_ledger(ledger: &Ledger) -> Self {
        Self {
            sources: ledger.len(),
            collected: ledger.count_status(LedgerStatus::Collected),
            empty: ledger.count_status(LedgerStatus::Empty),
            unavailable: ledger.count_status(LedgerStatus::Unavailable),
            failed: ledger.count_status(LedgerStatus::Failed),
            cancelled: ledger.count_status(LedgerStatus::Cancelled),
            features: ledger.entries().iter().filter_map(|e| e.count).sum(),
        }
    }
}

/// Summary of a finished run, persisted as `run.json`.
#[derive(Debug, Serialize)]
pub struct CollectReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub boundary_source: String,
    pub totals: RunTotals,
    pub ledger_path: PathBuf,
    pub geography_csv: Option<PathBuf>,
    pub facility_csv: Option<PathBuf>,
    /// SHA-256 of every primary artifact, keyed by source.
    pub checksums: BTreeMap<String, String>,
    #[serde(skip)]
    pub ledger: Ledger,
}

pub struct Collector {
    catalog: SourceCatalog,
    executor: QueryExecutor,
    statistics: Option<Arc<dyn StatisticsProvider>>,
    options: CollectOptions,
    layout: OutputLayout,
}

impl Collector {
    pub fn new(catalog: SourceCatalog, executor: QueryExecutor, layout: OutputLayout) -> Self {
        Self {
            catalog,
            executor,
            statistics: None,
            options: CollectOptions::default(),
            layout,
        }
    }

    pub fn with_statistics(mut self, provider: Arc<dyn StatisticsProvider>) -> Self {
        self.statistics = Some(provider);
        self
    }

    pub fn with_options(mut self, options: CollectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Collects for the boundary stored in `path`.
    pub async fn collect(&self, path: &Path) -> Result<CollectReport> {
        let table = artifact::read_table(path)?;
        self.collect_table(&table, &path.display().to_string()).await
    }

    /// Collects for an in-memory boundary dataset. Only boundary derivation and
    /// the geography query can fail the run.
    #[instrument(skip(self, boundary), fields(boundary = %label))]
    pub async fn collect_table(&self, boundary: &FeatureTable, label: &str) -> Result<CollectReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_deadline = self.options.run_deadline.map(|d| tokio::time::Instant::now() + d);
        info!(%run_id, "starting collection over {} sources", self.catalog.len());

        fs::create_dir_all(&self.layout.base)?;

        let mut pair = BoundaryPair::derive(boundary, self.options.feature_index)?;

        let (geography_entry, geography_path) = self.collect_geography(&pair).await?;
        if self.options.rederive_boundary {
            match artifact::read_table(&geography_path).and_then(|t| BoundaryPair::derive(&t, None)) {
                Ok(rederived) => {
                    info!("query boundary replaced by dissolved geography");
                    pair = rederived;
                }
                Err(e) => warn!("keeping original boundary, geography could not be dissolved: {}", e),
            }
        }

        let projected = Arc::new(pair.projected);
        let geographic = Arc::new(pair.geographic);
        let jobs: Vec<(&SourceFamily, &SourceDefinition, Arc<Boundary>)> = self
            .catalog
            .entries()
            .map(|(family, source)| {
                let boundary = match family.boundary {
                    BoundaryKind::Projected => projected.clone(),
                    BoundaryKind::Geographic => geographic.clone(),
                };
                (family, source, boundary)
            })
            .collect();

        let mut entries: Vec<LedgerEntry> = stream::iter(jobs)
            .map(|(family, source, boundary)| async move {
                if let Some(deadline) = run_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        return cancelled(source);
                    }
                    match tokio::time::timeout_at(deadline, self.collect_source(family, source, boundary)).await {
                        Ok(entry) => entry,
                        Err(_) => cancelled(source),
                    }
                } else {
                    self.collect_source(family, source, boundary).await
                }
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        entries.push(geography_entry);

        let ledger = Ledger::assemble(&self.catalog.keys(), entries);
        let ledger_path = self.layout.base.join(LEDGER_FILE);
        ledger.write_csv(&ledger_path)?;
        info!("ledger written to {}", ledger_path.display());

        let (geography_csv, facility_csv) = if self.options.csv {
            self.export_tables(&ledger, &geography_path)
        } else {
            (None, None)
        };

        let report = CollectReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            boundary_source: label.to_string(),
            totals: RunTotals::from_ledger(&ledger),
            ledger_path,
            geography_csv,
            facility_csv,
            checksums: checksums(&ledger),
            ledger,
        };
        let summary_path = self.layout.base.join(RUN_SUMMARY_FILE);
        fs::write(&summary_path, serde_json::to_string_pretty(&report)?)?;
        info!(
            collected = report.totals.collected,
            empty = report.totals.empty,
            unavailable = report.totals.unavailable,
            failed = report.totals.failed,
            "collection finished"
        );
        Ok(report)
    }

    async fn collect_geography(&self, pair: &BoundaryPair) -> Result<(LedgerEntry, PathBuf)> {
        let source = &self.catalog.geography;
        let request = QueryRequest::new(source.clone(), Arc::new(pair.projected.clone()));
        let target = self.layout.primary_path(source);

        let started = Instant::now();
        let outcome = self.executor.execute(&request, &target).await?;
        let query_time = started.elapsed().as_secs_f64();
        metrics::record_outcome(&source.key, &outcome_status(&outcome).to_string());
        let (path, _) = outcome.into_result(&source.key).map_err(|e| {
            error!("geography query failed: {}", e);
            e
        })?;

        let mut table = artifact::read_table(&path)?;
        if let Some(provider) = &self.statistics {
            match provider.join_statistics(&table).await {
                Ok(joined) => table = joined,
                Err(e) => warn!("statistics join skipped: {}", e),
            }
        }
        if table.is_empty() {
            return Err(CollectError::EmptyResult {
                source_key: source.key.clone(),
            });
        }
        identify::assign_record_id_table(&mut table, GEOGRAPHY_SECTOR);
        artifact::write_table(&table, &path)?;

        let chain = self.chain().run(&path, &self.overlay_options(source, Some(GEOID_FIELD)));
        let mut entry = LedgerEntry::new(&source.key, LedgerStatus::Collected);
        entry.query_time = Some(query_time);
        entry.count = Some(table.len());
        entry.geojson = Some(path.clone());
        apply_chain(&mut entry, chain);
        info!("collected {} geography features", table.len());
        Ok((entry, path))
    }

    #[instrument(skip_all, fields(source = %source.key))]
    async fn collect_source(
        &self,
        family: &SourceFamily,
        source: &SourceDefinition,
        boundary: Arc<Boundary>,
    ) -> LedgerEntry {
        let request = QueryRequest::new(source.clone(), boundary);
        let target = self.layout.primary_path(source);

        let started = Instant::now();
        let outcome = self.executor.execute(&request, &target).await;
        let query_time = started.elapsed().as_secs_f64();

        let entry = match outcome {
            Err(e) => {
                error!("query failed: {}", e);
                metrics::record_failure(&source.key, e.kind());
                LedgerEntry::failed(&source.key, LedgerStatus::Failed, Some(query_time), e)
            }
            Ok(QueryOutcome::Empty) => {
                info!("no infrastructure located");
                LedgerEntry::empty(&source.key, query_time)
            }
            Ok(QueryOutcome::Unavailable {
                attempts,
                last_error,
            }) => {
                let e = CollectError::ServiceUnavailable {
                    source_key: source.key.clone(),
                    attempts,
                    last_error,
                };
                error!("{}", e);
                metrics::record_failure(&source.key, e.kind());
                LedgerEntry::failed(&source.key, LedgerStatus::Unavailable, Some(query_time), e)
            }
            Ok(QueryOutcome::Collected { path, count }) => {
                let mut entry = LedgerEntry::new(&source.key, LedgerStatus::Collected);
                entry.query_time = Some(query_time);
                entry.count = Some(count);
                entry.geojson = Some(path.clone());

                let label = family.sector_label(source).to_string();
                let chain = self.chain();
                let options = self.overlay_options(source, source.id_field.as_deref());
                // SQLite and file writes stay off the async workers
                let normalized = tokio::task::spawn_blocking(move || {
                    let path = identify::tag_sector(&path, &label, SECTOR_FIELD, true)?;
                    let path = identify::assign_record_id(&path, &label, true)?;
                    Ok::<_, CollectError>(chain.run(&path, &options))
                })
                .await
                .map_err(CollectError::from)
                .and_then(|result| result);
                match normalized {
                    Ok(chain) => {
                        apply_chain(&mut entry, chain);
                        info!("collected {} features", count);
                    }
                    Err(e) => {
                        error!("normalizing artifact failed: {}", e);
                        metrics::record_failure(&source.key, e.kind());
                        entry.status = LedgerStatus::Failed;
                        entry.error = Some(e.to_string());
                    }
                }
                entry
            }
        };
        metrics::record_outcome(&source.key, &entry.status.to_string());
        entry
    }

    fn chain(&self) -> FormatChain {
        let mut chain = FormatChain::new();
        if self.options.gpkg {
            chain = chain.with_gpkg(&self.layout.gpkg);
        }
        match self.options.overlay {
            Some(ArtifactFormat::Kmz) => chain.with_kmz(&self.layout.kml),
            Some(_) => chain.with_kml(&self.layout.kml),
            None => chain,
        }
    }

    fn overlay_options(&self, source: &SourceDefinition, id_field: Option<&str>) -> KmlOptions {
        KmlOptions {
            name: source.key.clone(),
            id_field: id_field.map(str::to_string),
            group_by: None,
            colors: source.color.iter().cloned().collect(),
            max_attributes: 0,
            content_fields: source.content_fields.clone(),
        }
    }

    fn export_tables(&self, ledger: &Ledger, geography: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
        let geography_csv = self.layout.csv.join(GEOGRAPHY_CSV);
        let geography_written = flatten::flatten_artifacts([(geography, None)], FlatRole::Geography)
            .write_csv(&geography_csv)
            .map_err(|e| warn!("geography table export failed: {}", e))
            .is_ok();

        let labels: HashMap<&str, &str> = self
            .catalog
            .entries()
            .map(|(family, source)| (source.key.as_str(), family.sector_label(source)))
            .collect();
        let facilities: Vec<(&Path, Option<&str>)> = ledger
            .entries()
            .iter()
            .filter(|e| e.source != self.catalog.geography.key && e.status == LedgerStatus::Collected)
            .filter_map(|e| Some((e.geojson.as_deref()?, labels.get(e.source.as_str()).copied())))
            .collect();
        let facility_csv = self.layout.csv.join(FACILITY_CSV);
        let facility_written = flatten::flatten_artifacts(facilities, FlatRole::Facility)
            .write_csv(&facility_csv)
            .map_err(|e| warn!("facility table export failed: {}", e))
            .is_ok();

        (
            geography_written.then_some(geography_csv),
            facility_written.then_some(facility_csv),
        )
    }
}

fn cancelled(source: &SourceDefinition) -> LedgerEntry {
    warn!(source = %source.key, "run deadline reached, source cancelled");
    metrics::record_outcome(&source.key, "cancelled");
    LedgerEntry::failed(&source.key, LedgerStatus::Cancelled, None, "run deadline reached")
}

fn outcome_status(outcome: &QueryOutcome) -> LedgerStatus {
    match outcome {
        QueryOutcome::Collected { .. } => LedgerStatus::Collected,
        QueryOutcome::Empty => LedgerStatus::Empty,
        QueryOutcome::Unavailable { .. } => LedgerStatus::Unavailable,
    }
}

fn apply_chain(entry: &mut LedgerEntry, chain: ChainOutput) {
    entry.error = chain.failure_summary();
    entry.gpkg = chain.gpkg;
    entry.kml = chain.overlay;
}

fn checksums(ledger: &Ledger) -> BTreeMap<String, String> {
    ledger
        .entries()
        .iter()
        .filter_map(|e| {
            let bytes = fs::read(e.geojson.as_ref()?).ok()?;
            Some((e.source.clone(), hex::encode(Sha256::digest(&bytes))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectConfig;

    #[test]
    fn options_follow_config() {
        let mut config = CollectConfig::default();
        config.outputs.kml = false;
        config.outputs.kmz = true;
        config.query.concurrency = 0;
        let options = CollectOptions::from(&config);
        assert_eq!(options.overlay, Some(ArtifactFormat::Kmz));
        assert_eq!(options.concurrency, 1);
        assert!(options.gpkg && options.csv);
    }

    #[test]
    fn layout_places_primary_artifacts_under_geojson() {
        let layout = OutputLayout::new("out");
        let source = crate::catalog::CensusLevel::Tracts.source(2022);
        assert_eq!(layout.primary_path(&source), PathBuf::from("out/geojson/Census_Tracts.geojson"));
        assert_eq!(layout.csv, PathBuf::from("out/csv"));
    }
}
