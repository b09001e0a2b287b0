//! In-memory feature tables and the vector file formats they are persisted in.

pub mod geojson_io;
pub mod gpkg;

use crate::error::{CollectError, Result};
use crate::geometry::{reproject, Crs};
use geo::Geometry;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// One geometry with its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            geometry: geometry.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    /// Attribute rendered as plain text; strings are not quoted.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A vector dataset: features sharing one coordinate reference, plus the ordered
/// list of attribute columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub crs: Crs,
    pub columns: Vec<String>,
    pub features: Vec<Feature>,
}

impl FeatureTable {
    pub fn new(crs: Crs) -> Self {
        Self {
            crs,
            columns: Vec::new(),
            features: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn push(&mut self, feature: Feature) {
        for key in feature.properties.keys() {
            if !self.has_column(key) {
                self.columns.push(key.clone());
            }
        }
        self.features.push(feature);
    }

    /// Sets `name` on every feature to the value computed from its position.
    pub fn set_column(&mut self, name: &str, mut value: impl FnMut(usize, &Feature) -> Value) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
        for (index, feature) in self.features.iter_mut().enumerate() {
            let v = value(index, feature);
            feature.properties.insert(name.to_string(), v);
        }
    }

    /// First column whose name matches case-insensitively.
    pub fn find_column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    pub fn to_crs(&self, target: Crs) -> FeatureTable {
        if self.crs == target {
            return self.clone();
        }
        FeatureTable {
            crs: target,
            columns: self.columns.clone(),
            features: self
                .features
                .iter()
                .map(|f| Feature {
                    geometry: reproject(&f.geometry, self.crs, target),
                    properties: f.properties.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    GeoJson,
    GeoPackage,
    Kml,
    Kmz,
}

impl ArtifactFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::GeoJson => "geojson",
            ArtifactFormat::GeoPackage => "gpkg",
            ArtifactFormat::Kml => "kml",
            ArtifactFormat::Kmz => "kmz",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "geojson" | "json" => Some(ArtifactFormat::GeoJson),
            "gpkg" => Some(ArtifactFormat::GeoPackage),
            "kml" => Some(ArtifactFormat::Kml),
            "kmz" => Some(ArtifactFormat::Kmz),
            _ => None,
        }
    }
}

/// Reads any supported vector file into memory.
pub fn read_table(path: &Path) -> Result<FeatureTable> {
    let result = match ArtifactFormat::from_path(path) {
        Some(ArtifactFormat::GeoJson) => geojson_io::read(path),
        Some(ArtifactFormat::GeoPackage) => gpkg::read(path),
        _ => return Err(CollectError::read(path, "unsupported vector format")),
    };
    result.map_err(|e| match e {
        e @ CollectError::ArtifactRead { .. } => e,
        other => CollectError::read(path, other),
    })
}

/// Writes a table in the format implied by the path extension, creating parent directories.
pub fn write_table(table: &FeatureTable, path: &Path) -> Result<()> {
    let format = match ArtifactFormat::from_path(path) {
        Some(f @ (ArtifactFormat::GeoJson | ArtifactFormat::GeoPackage)) => f,
        _ => return Err(CollectError::write(path, "unsupported vector format")),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| CollectError::write(path, e))?;
        }
    }
    let result = match format {
        ArtifactFormat::GeoPackage => gpkg::write(table, path),
        _ => geojson_io::write(table, path),
    };
    result.map_err(|e| match e {
        e @ CollectError::ArtifactWrite { .. } => e,
        other => CollectError::write(path, other),
    })
}

/// `<stem>_<n>.<ext>` for the first `n >= 1` that does not exist yet.
pub fn next_free_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Output path for a derived format: same stem, new directory and extension.
pub fn derived_path(input: &Path, out_dir: &Path, format: ArtifactFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    out_dir.join(format!("{stem}.{}", format.extension()))
}
