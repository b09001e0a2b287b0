/// Service roots and fixed names shared across the collector.

pub const CENSUS_URL: &str = "https://tigerweb.geo.census.gov/arcgis/rest/services/";
pub const HIFLD_URL: &str = "https://services1.arcgis.com/Hp6G80Pky0om7QvQ/ArcGIS/rest/services/";
pub const USGS_STRUCTURES_URL: &str = "https://carto.nationalmap.gov/arcgis/rest/services";
pub const CENSUS_STATS_URL: &str = "https://api.census.gov/data";

// Geography services are published per ACS release, e.g. "ACS2022/Tracts_Blocks"
pub const CENSUS_SERVICE_PREFIX: &str = "*ACS";

pub const CENSUS_TRANSPORTATION_SERVICE: &str = "Census2020/Transportation";

pub const HIFLD_PREFIX: &str = "HIFLD_";

/// Sector label written into the geography artifact.
pub const GEOGRAPHY_SECTOR: &str = "census_geometry";

pub const SECTOR_FIELD: &str = "Sector";
pub const RECORD_ID_FIELD: &str = "record_id";
pub const GEOID_FIELD: &str = "GEOID";

pub const LEDGER_FILE: &str = "query_result.csv";
pub const RUN_SUMMARY_FILE: &str = "run.json";
pub const GEOGRAPHY_CSV: &str = "census_geometry_and_stats.csv";
pub const FACILITY_CSV: &str = "facility_data.csv";

pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;
pub const DEFAULT_CENSUS_YEAR: u16 = 2022;

pub const CENSUS_API_KEY_ENV: &str = "CENSUS_API_KEY";
pub const METRICS_PORT_ENV: &str = "GEOCOLLECT_METRICS_PORT";
