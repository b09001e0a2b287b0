use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Service unavailable for {source_key} after {attempts} attempts: {last_error}")]
    ServiceUnavailable {
        source_key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("No features matched the boundary for {source_key}")]
    EmptyResult { source_key: String },

    #[error("Failed to read artifact {path}: {reason}")]
    ArtifactRead { path: PathBuf, reason: String },

    #[error("Failed to write artifact {path}: {reason}")]
    ArtifactWrite { path: PathBuf, reason: String },

    #[error("Unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("Unsupported coordinate reference EPSG:{0}")]
    UnsupportedCrs(i32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {message}")]
    Service { message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("WKB error: {0}")]
    Wkb(#[from] geozero::error::GeozeroError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CollectError {
    /// Short classification used in ledger rows and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectError::Geometry(_) => "geometry",
            CollectError::ServiceUnavailable { .. } => "service_unavailable",
            CollectError::EmptyResult { .. } => "empty_result",
            CollectError::ArtifactRead { .. } => "artifact_read",
            CollectError::ArtifactWrite { .. } => "artifact_write",
            CollectError::UnsupportedGeometry(_) => "unsupported_geometry",
            CollectError::UnsupportedCrs(_) => "unsupported_crs",
            CollectError::Config(_) => "config",
            CollectError::Service { .. } | CollectError::Http(_) => "service",
            CollectError::Task(_) => "task",
            _ => "io",
        }
    }

    pub fn read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CollectError::ArtifactRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        CollectError::ArtifactWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectError>;
