//! American Community Survey statistics joined onto census geography.

use crate::artifact::{Feature, FeatureTable};
use crate::constants::{CENSUS_STATS_URL, GEOID_FIELD};
use crate::error::{CollectError, Result};
use async_trait::async_trait;
use serde_json::{Number, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Variables collected per geography, as `(name, code)`.
pub const CENSUS_VARIABLES: [(&str, &str); 2] = [
    ("total_population", "B01001_001E"),
    ("median_household_income", "B19013_001E"),
];

/// Column name a joined variable is stored under.
pub fn statistic_column(name: &str, code: &str) -> String {
    format!("{name}_{code}")
}

#[async_trait]
pub trait StatisticsProvider: Send + Sync {
    /// Returns the rows of `table` that have statistics, with the statistic columns added.
    async fn join_statistics(&self, table: &FeatureTable) -> Result<FeatureTable>;
}

pub struct CensusApi {
    client: reqwest::Client,
    api_key: String,
    year: u16,
    base_url: String,
}

impl CensusApi {
    pub fn new(api_key: impl Into<String>, year: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key: api_key.into(),
            year,
            base_url: CENSUS_STATS_URL.to_string(),
        }
    }

    async fn fetch_state(&self, state: &str, clause: &[(&'static str, String)]) -> Result<Option<Value>> {
        let variables: Vec<&str> = CENSUS_VARIABLES.iter().map(|(_, code)| *code).collect();
        let mut query: Vec<(&str, String)> = vec![("get", format!("NAME,{}", variables.join(",")))];
        query.extend(clause.iter().cloned());
        query.push(("key", self.api_key.clone()));

        let url = format!("{}/{}/acs/acs5", self.base_url, self.year);
        let body = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        if body.trim().is_empty() {
            debug!("empty statistics response for state {}", state);
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

#[async_trait]
impl StatisticsProvider for CensusApi {
    #[instrument(skip(self, table), fields(features = table.len()))]
    async fn join_statistics(&self, table: &FeatureTable) -> Result<FeatureTable> {
        let state_col = locate_column(table, "STATE", "state")?;
        let county_col = locate_column(table, "COUNTY", "county")?;
        let geoid_col = locate_column(table, GEOID_FIELD, "geoid")?;

        let states = distinct(table, &state_col);
        let counties: Vec<String> = distinct(table, &county_col).into_iter().collect();
        let geoid_len = table
            .features
            .iter()
            .filter_map(|f| f.text(&geoid_col))
            .map(|g| g.len())
            .max()
            .unwrap_or(0);

        let mut rows = Vec::new();
        for state in &states {
            let clause = geography_clause(geoid_len, state, &counties)?;
            match self.fetch_state(state, &clause).await? {
                Some(value) => rows.extend(parse_rows(&value)?),
                None => continue,
            }
        }

        if rows.is_empty() {
            warn!("no valid response from census statistics query");
            return Ok(table.clone());
        }
        let joined = join(table, &geoid_col, &rows);
        info!("joined statistics onto {} of {} features", joined.len(), table.len());
        Ok(joined)
    }
}

/// One statistics record keyed by GEOID.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsRow {
    pub geoid: String,
    pub values: Vec<(String, Value)>,
}

/// Query parameters selecting every geography of the right level in one state.
pub fn geography_clause(geoid_len: usize, state: &str, counties: &[String]) -> Result<Vec<(&'static str, String)>> {
    let counties = counties.join(",");
    match geoid_len {
        11 => Ok(vec![
            ("for", "tract:*".to_string()),
            ("in", format!("state:{state} county:{counties}")),
        ]),
        n if n >= 12 => Ok(vec![
            ("for", "block group:*".to_string()),
            ("in", format!("state:{state}")),
            ("in", format!("county:{counties}")),
            ("in", "tract:*".to_string()),
        ]),
        5 => Ok(vec![
            ("for", format!("county:{counties}")),
            ("in", format!("state:{state}")),
        ]),
        other => Err(CollectError::Service {
            message: format!("no statistics geography for GEOID length {other}"),
        }),
    }
}

/// Parses the header-plus-rows array the statistics API returns.
pub fn parse_rows(value: &Value) -> Result<Vec<StatisticsRow>> {
    let table = value.as_array().ok_or_else(|| CollectError::Service {
        message: "statistics response is not an array".into(),
    })?;
    let Some((header, body)) = table.split_first() else {
        return Ok(Vec::new());
    };
    let header: Vec<&str> = header
        .as_array()
        .map(|h| h.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut rows = Vec::with_capacity(body.len());
    for raw in body {
        let cells: HashMap<&str, &str> = header
            .iter()
            .copied()
            .zip(raw.as_array().into_iter().flatten().map(|c| c.as_str().unwrap_or("")))
            .collect();

        let Some(geoid) = build_geoid(&cells) else {
            continue;
        };
        let values = CENSUS_VARIABLES
            .iter()
            .map(|(name, code)| {
                let value = cells
                    .get(code)
                    .and_then(|c| c.parse::<f64>().ok())
                    .filter(|v| *v >= 0.0)
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                (statistic_column(name, code), value)
            })
            .collect();
        rows.push(StatisticsRow { geoid, values });
    }
    Ok(rows)
}

fn build_geoid(cells: &HashMap<&str, &str>) -> Option<String> {
    let part = |k: &str| cells.get(k).copied();
    if let Some(bg) = part("block group") {
        return Some(format!("{}{}{}{}", part("state")?, part("county")?, part("tract")?, bg));
    }
    if let Some(tract) = part("tract") {
        return Some(format!("{}{}{}", part("state")?, part("county")?, tract));
    }
    if let Some(county) = part("county") {
        return Some(format!("{}{}", part("state")?, county));
    }
    None
}

/// Inner join of `rows` onto `table` by GEOID.
pub fn join(table: &FeatureTable, geoid_col: &str, rows: &[StatisticsRow]) -> FeatureTable {
    let by_geoid: HashMap<&str, &StatisticsRow> = rows.iter().map(|r| (r.geoid.as_str(), r)).collect();
    let mut joined = FeatureTable::new(table.crs);
    joined.columns = table.columns.clone();
    for feature in &table.features {
        let Some(row) = feature.text(geoid_col).and_then(|g| by_geoid.get(g.as_str()).copied()) else {
            continue;
        };
        let mut feature: Feature = feature.clone();
        for (column, value) in &row.values {
            feature.properties.insert(column.clone(), value.clone());
        }
        joined.push(feature);
    }
    for (name, code) in CENSUS_VARIABLES {
        let column = statistic_column(name, code);
        if !joined.has_column(&column) {
            joined.columns.push(column);
        }
    }
    joined
}

fn locate_column(table: &FeatureTable, exact: &str, fragment: &str) -> Result<String> {
    if table.has_column(exact) {
        return Ok(exact.to_string());
    }
    table
        .columns
        .iter()
        .find(|c| c.to_ascii_lowercase().contains(fragment))
        .cloned()
        .ok_or_else(|| CollectError::Service {
            message: format!("geography has no {exact} column"),
        })
}

fn distinct(table: &FeatureTable, column: &str) -> BTreeSet<String> {
    table.features.iter().filter_map(|f| f.text(column)).collect()
}
