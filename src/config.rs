use crate::catalog::{CensusLevel, RoadLayer};
use crate::constants::{CENSUS_API_KEY_ENV, DEFAULT_ATTEMPT_LIMIT, DEFAULT_CENSUS_YEAR};
use crate::error::{CollectError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "geocollect.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub output_dir: PathBuf,
    pub census_level: CensusLevel,
    pub census_year: u16,
    /// Replace the query boundary with the dissolved census geography.
    pub rederive_boundary: bool,
    /// Use one feature of the boundary file instead of dissolving all of them.
    pub feature_index: Option<usize>,
    pub outputs: OutputConfig,
    pub query: QueryConfig,
    /// TOML file replacing the built-in ad-hoc source family.
    pub ad_hoc_sources: Option<PathBuf>,
    /// Road and rail layers to collect: 0 primary, 1 secondary, 2 local, 3 railroads.
    pub transportation: Vec<RoadLayer>,
    #[serde(skip)]
    pub census_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub gpkg: bool,
    pub kml: bool,
    pub kmz: bool,
    pub csv: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub attempt_limit: u32,
    pub attempt_timeout_secs: Option<u64>,
    pub concurrency: usize,
    pub run_deadline_secs: Option<u64>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            census_level: CensusLevel::Tracts,
            census_year: DEFAULT_CENSUS_YEAR,
            rederive_boundary: true,
            feature_index: None,
            outputs: OutputConfig::default(),
            query: QueryConfig::default(),
            ad_hoc_sources: None,
            transportation: Vec::new(),
            census_api_key: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            gpkg: true,
            kml: true,
            kmz: false,
            csv: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            attempt_timeout_secs: None,
            concurrency: 1,
            run_deadline_secs: None,
        }
    }
}

impl QueryConfig {
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

impl CollectConfig {
    /// Loads `path`, or `geocollect.toml` when present, or the defaults. The census
    /// API key is taken from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.census_api_key = std::env::var(CENSUS_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path).map_err(|e| {
            CollectError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: CollectConfig = toml::from_str(&config_content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.attempt_limit == 0 {
            return Err(CollectError::Config("query.attempt_limit must be at least 1".into()));
        }
        if self.query.concurrency == 0 {
            return Err(CollectError::Config("query.concurrency must be at least 1".into()));
        }
        if self.outputs.kml && self.outputs.kmz {
            return Err(CollectError::Config("choose one of outputs.kml and outputs.kmz".into()));
        }
        Ok(())
    }
}
