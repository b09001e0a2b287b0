use clap::{Parser, Subcommand};
use geocollect::apis::{ArcGisRestClient, CensusApi, FeatureService};
use geocollect::catalog::{CensusLevel, RoadLayer, SourceCatalog, SourceFamily};
use geocollect::config::CollectConfig;
use geocollect::constants::CENSUS_URL;
use geocollect::pipeline::executor::ReconnectPolicy;
use geocollect::pipeline::{CollectOptions, Collector, LedgerStatus, OutputLayout, QueryExecutor};
use geocollect::{logging, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "geocollect")]
#[command(about = "Collects infrastructure and census geodata for an area of interest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query every catalog source for the given boundary
    Collect {
        /// Boundary file (GeoJSON or GeoPackage)
        #[arg(long)]
        boundary: PathBuf,
        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Configuration file (defaults to geocollect.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// 0 block groups, 1 tracts, 2 counties, 3 tribal tracts, 4 tribal block groups
        #[arg(long)]
        census_level: Option<u8>,
        /// Use a single boundary feature instead of dissolving all of them
        #[arg(long)]
        feature_index: Option<usize>,
        /// Road or rail layer to add (0 primary, 1 secondary, 2 local, 3 railroads); repeatable
        #[arg(long = "road-layer")]
        road_layers: Vec<u8>,
        #[arg(long)]
        no_gpkg: bool,
        #[arg(long)]
        no_kml: bool,
        /// Write KMZ instead of KML
        #[arg(long)]
        kmz: bool,
        #[arg(long)]
        no_csv: bool,
        /// Keep querying with the input boundary instead of the census geography
        #[arg(long)]
        no_rederive: bool,
        /// Number of sources queried at once
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// List the built-in source catalog
    Sources {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check that the census service directory is reachable
    Check,
}

fn build_catalog(config: &CollectConfig) -> geocollect::Result<SourceCatalog> {
    let catalog = SourceCatalog::builtin(config.census_level, config.census_year)
        .with_transportation(&config.transportation)?;
    match &config.ad_hoc_sources {
        Some(path) => catalog.with_ad_hoc(SourceFamily::load_from_file(path)?),
        None => Ok(catalog),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            boundary,
            output,
            config,
            census_level,
            feature_index,
            road_layers,
            no_gpkg,
            no_kml,
            kmz,
            no_csv,
            no_rederive,
            concurrency,
        } => {
            let mut config = CollectConfig::load(config.as_deref())?;
            if let Some(dir) = output {
                config.output_dir = dir;
            }
            if let Some(level) = census_level {
                config.census_level = CensusLevel::try_from(level)?;
            }
            for layer in road_layers {
                config.transportation.push(RoadLayer::try_from(layer)?);
            }
            if feature_index.is_some() {
                config.feature_index = feature_index;
            }
            if let Some(n) = concurrency {
                config.query.concurrency = n;
            }
            config.outputs.gpkg &= !no_gpkg;
            config.outputs.csv &= !no_csv;
            config.rederive_boundary &= !no_rederive;
            if kmz {
                config.outputs.kmz = true;
                config.outputs.kml = false;
            }
            if no_kml {
                config.outputs.kml = false;
                config.outputs.kmz = false;
            }
            config.validate()?;

            let catalog = build_catalog(&config)?;
            let service: Arc<dyn FeatureService> = Arc::new(ArcGisRestClient::new());
            let executor = QueryExecutor::new(service)
                .with_policy(Arc::new(ReconnectPolicy {
                    attempt_limit: config.query.attempt_limit,
                }))
                .with_attempt_timeout(config.query.attempt_timeout());

            let mut collector = Collector::new(catalog, executor, OutputLayout::new(&config.output_dir))
                .with_options(CollectOptions::from(&config));
            match &config.census_api_key {
                Some(key) => {
                    collector = collector.with_statistics(Arc::new(CensusApi::new(key.clone(), config.census_year)));
                }
                None => warn!("CENSUS_API_KEY not set, census statistics will not be collected"),
            }

            info!("collecting for boundary {}", boundary.display());
            let report = match collector.collect(&boundary).await {
                Ok(report) => report,
                Err(e) => {
                    error!("collection failed: {}", e);
                    return Err(e.into());
                }
            };

            println!("\nCollection results ({}):", report.run_id);
            for entry in report.ledger.entries() {
                let count = entry.count.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
                println!("   {:<55} {:<12} {:>6}", entry.source, entry.status, count);
            }
            println!("\n   Collected: {}", report.totals.collected);
            println!("   Empty: {}", report.totals.empty);
            println!("   Unavailable: {}", report.totals.unavailable);
            println!("   Failed: {}", report.totals.failed + report.totals.cancelled);
            println!("   Ledger: {}", report.ledger_path.display());

            if report.ledger.count_status(LedgerStatus::Collected) == 0 {
                warn!("no infrastructure sources returned data");
            }
        }
        Commands::Sources { config } => {
            let config = CollectConfig::load(config.as_deref())?;
            let catalog = build_catalog(&config)?;
            println!("geography  {:<55} layer {}", catalog.geography.key, catalog.geography.layer);
            for (family, source) in catalog.entries() {
                println!(
                    "{:<10} {:<55} layer {:<3} {}",
                    family.name, source.key, source.layer, source.out_crs
                );
            }
        }
        Commands::Check => {
            let client = ArcGisRestClient::new();
            match client.check_connection(CENSUS_URL).await {
                Ok(()) => println!("census service directory reachable: {}", CENSUS_URL),
                Err(e) => {
                    error!("census service directory unreachable: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
