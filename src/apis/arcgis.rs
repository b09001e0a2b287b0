use super::{FeatureService, FeatureSet, QueryRequest};
use crate::artifact::{geojson_io, FeatureTable};
use crate::error::{CollectError, Result};
use async_trait::async_trait;
use geojson::GeoJson;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const MAX_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct Directory {
    #[serde(default)]
    folders: Vec<String>,
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Client for ArcGIS REST service directories.
pub struct ArcGisRestClient {
    client: reqwest::Client,
}

impl Default for ArcGisRestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcGisRestClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(120))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("geocollect/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let value: Value = self
            .client
            .get(url)
            .query(&[("f", "json")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        check_error(&value)?;
        Ok(value)
    }

    async fn directory(&self, url: &str) -> Result<Directory> {
        let value = self.get_json(url).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Finds the first service whose full name matches `pattern`, looking at the
    /// root directory first and then at matching folders one level down.
    async fn resolve_service(&self, root: &str, pattern: &str) -> Result<String> {
        let matcher = glob_regex(pattern)?;
        let root = root.trim_end_matches('/');
        let listing = self.directory(root).await?;

        if let Some(entry) = listing.services.iter().find(|s| matcher.is_match(&s.name)) {
            return Ok(service_url(root, entry));
        }

        let folder_matcher = match pattern.split_once('/') {
            Some((folder, _)) => Some(glob_regex(folder)?),
            None => None,
        };
        for folder in &listing.folders {
            if let Some(m) = &folder_matcher {
                if !m.is_match(folder) {
                    continue;
                }
            }
            let nested = self.directory(&format!("{root}/{folder}")).await?;
            if let Some(entry) = nested.services.iter().find(|s| matcher.is_match(&s.name)) {
                return Ok(service_url(root, entry));
            }
        }

        Err(CollectError::Service {
            message: format!("no service matching '{pattern}' under {root}"),
        })
    }

    async fn check_layer(&self, service_url: &str, layer: u32) -> Result<String> {
        let layer_url = format!("{service_url}/{layer}");
        let info = self.get_json(&layer_url).await?;
        if info.get("id").is_none() {
            return Err(CollectError::Service {
                message: format!("layer {layer} not found at {service_url}"),
            });
        }
        Ok(layer_url)
    }

    async fn query_page(&self, layer_url: &str, request: &QueryRequest, offset: usize) -> Result<Value> {
        let boundary = &request.boundary;
        let form = [
            ("geometry", boundary.to_esri_json().to_string()),
            ("geometryType", "esriGeometryPolygon".to_string()),
            ("spatialRel", "esriSpatialRelIntersects".to_string()),
            ("inSR", boundary.crs.epsg().to_string()),
            ("outSR", request.source.out_crs.epsg().to_string()),
            ("outFields", "*".to_string()),
            ("returnGeometry", "true".to_string()),
            ("resultOffset", offset.to_string()),
            ("f", "geojson".to_string()),
        ];
        let value: Value = self
            .client
            .post(format!("{layer_url}/query"))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        check_error(&value)?;
        Ok(value)
    }
}

#[async_trait]
impl FeatureService for ArcGisRestClient {
    #[instrument(skip(self, request), fields(source = %request.source.key))]
    async fn select_by_location(&self, request: &QueryRequest) -> Result<FeatureSet> {
        let source = &request.source;
        let service_url = self.resolve_service(&source.url, &source.service).await?;
        let layer_url = self.check_layer(&service_url, source.layer).await?;
        debug!("querying {}", layer_url);

        let mut table = FeatureTable::new(source.out_crs);
        let mut cursor = PageCursor::default();
        loop {
            let value = self.query_page(&layer_url, request, table.len()).await?;
            let exceeded = exceeded_transfer_limit(&value);
            let page_table = geojson_io::from_geojson(GeoJson::from_json_value(value)?, source.out_crs)?;
            let received = page_table.len();
            if cursor.pages == 0 {
                table.crs = page_table.crs;
            }
            for feature in page_table.to_crs(table.crs).features {
                table.push(feature);
            }
            if !cursor.advance(exceeded, received) {
                break;
            }
            debug!("transfer limit exceeded, fetching from offset {}", table.len());
        }
        if cursor.truncated() {
            warn!(
                "{} still reports more features after {} pages, result truncated at {}",
                source.key,
                cursor.pages,
                table.len()
            );
        }

        Ok(FeatureSet { table })
    }

    async fn check_connection(&self, url: &str) -> Result<()> {
        self.directory(url.trim_end_matches('/')).await.map(|_| ())
    }
}

/// Tracks `resultOffset` paging of one query.
#[derive(Debug, Default)]
struct PageCursor {
    pages: usize,
    more_available: bool,
}

impl PageCursor {
    /// Records one received page; true when another page should be requested.
    fn advance(&mut self, exceeded: bool, received: usize) -> bool {
        self.pages += 1;
        self.more_available = exceeded && received > 0;
        self.more_available && self.pages < MAX_PAGES
    }

    /// The page limit stopped paging while the service still had features.
    fn truncated(&self) -> bool {
        self.more_available && self.pages >= MAX_PAGES
    }
}

fn service_url(root: &str, entry: &ServiceEntry) -> String {
    format!("{root}/{}/{}", entry.name, entry.kind)
}

/// Converts a `*` wildcard pattern to an anchored, case-insensitive regex.
fn glob_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{body}$")).map_err(|e| CollectError::Config(e.to_string()))
}

fn check_error(value: &Value) -> Result<()> {
    match value.get("error") {
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            Err(CollectError::Service { message })
        }
        None => Ok(()),
    }
}

fn exceeded_transfer_limit(value: &Value) -> bool {
    value
        .get("exceededTransferLimit")
        .or_else(|| value.pointer("/properties/exceededTransferLimit"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_patterns_match_full_service_names() {
        let re = glob_regex("*ACS2022/Tracts*").unwrap();
        assert!(re.is_match("Generalized_ACS2022/Tracts_Blocks"));
        assert!(re.is_match("acs2022/tracts_blocks"));
        assert!(!re.is_match("Generalized_ACS2021/Tracts_Blocks"));

        let exact = glob_regex("Hospitals_gdb").unwrap();
        assert!(exact.is_match("Hospitals_gdb"));
        assert!(!exact.is_match("Hospitals_gdb_old"));
    }

    #[test]
    fn service_errors_are_reported() {
        let body = json!({"error": {"code": 400, "message": "Invalid or missing input parameters."}});
        let err = check_error(&body).unwrap_err();
        assert!(matches!(err, CollectError::Service { ref message } if message.contains("Invalid")));
        assert!(check_error(&json!({"type": "FeatureCollection"})).is_ok());
    }

    #[test]
    fn detects_paged_responses() {
        assert!(exceeded_transfer_limit(&json!({"exceededTransferLimit": true})));
        assert!(exceeded_transfer_limit(
            &json!({"properties": {"exceededTransferLimit": true}})
        ));
        assert!(!exceeded_transfer_limit(&json!({"features": []})));
    }

    #[test]
    fn paging_stops_at_page_limit() {
        let mut cursor = PageCursor::default();
        assert!(cursor.advance(true, 2000));
        assert!(!cursor.advance(false, 10));
        assert!(!cursor.truncated());

        let mut empty_page = PageCursor::default();
        assert!(!empty_page.advance(true, 0));
        assert!(!empty_page.truncated());

        let mut endless = PageCursor::default();
        let mut requested = 1;
        while endless.advance(true, 2000) {
            requested += 1;
        }
        assert_eq!(requested, MAX_PAGES);
        assert!(endless.truncated());
    }

    #[test]
    fn parses_directory_listing() {
        let listing: Directory = serde_json::from_value(json!({
            "currentVersion": 11.1,
            "folders": ["Generalized_ACS2022", "TIGERweb"],
            "services": [{"name": "Hospitals_gdb", "type": "FeatureServer"}]
        }))
        .unwrap();
        assert_eq!(listing.folders.len(), 2);
        assert_eq!(
            service_url("https://host/rest/services", &listing.services[0]),
            "https://host/rest/services/Hospitals_gdb/FeatureServer"
        );
    }
}
