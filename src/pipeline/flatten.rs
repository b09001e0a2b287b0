//! Flattens artifacts into location-plus-attribute rows for spreadsheet use.

use super::identify::normalize_label;
use crate::apis::census::{statistic_column, CENSUS_VARIABLES};
use crate::artifact::{self, Feature, FeatureTable};
use crate::constants::{GEOID_FIELD, RECORD_ID_FIELD, SECTOR_FIELD};
use crate::error::{CollectError, Result};
use crate::geometry::{reproject, unproject, Crs, GeometryKind};
use geo::{Centroid, Geometry, InteriorPoint, Point};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatRole {
    Geography,
    Facility,
}

impl FlatRole {
    fn columns(self) -> Vec<String> {
        match self {
            FlatRole::Geography => CENSUS_VARIABLES
                .iter()
                .map(|(name, code)| statistic_column(name, code))
                .chain(std::iter::once(GEOID_FIELD.to_string()))
                .collect(),
            FlatRole::Facility => vec!["sector".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub record_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub attributes: Map<String, Value>,
}

/// Rows with `record_id, longitude, latitude` followed by `columns`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatTable {
    pub columns: Vec<String>,
    pub rows: Vec<FlatRow>,
}

impl FlatTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends `other`, adding any columns this table lacks.
    pub fn extend(&mut self, other: FlatTable) {
        for column in other.columns {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self.rows.extend(other.rows);
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["record_id".to_string(), "longitude".to_string(), "latitude".to_string()];
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![row.record_id.clone(), row.longitude.to_string(), row.latitude.to_string()];
            for column in &self.columns {
                record.push(match row.attributes.get(column) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                });
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Reduces every feature to one WGS84 location.
///
/// Points are kept, multipoints use an interior point and polygons use their
/// centroid computed in Web Mercator. Lines and mixed non-polygonal types are
/// rejected.
///
/// Facility rows take their sector from `sector` when given, otherwise from
/// the `Sector` field.
pub fn flatten(table: &FeatureTable, role: FlatRole, sector: Option<&str>) -> Result<FlatTable> {
    let kind = GeometryKind::common(table.features.iter().map(|f| &f.geometry))?;
    let wanted = role.columns();
    let columns: Vec<String> = match role {
        FlatRole::Geography => wanted.into_iter().filter(|c| table.has_column(c)).collect(),
        FlatRole::Facility => wanted,
    };
    let mut flat = FlatTable {
        columns,
        rows: Vec::with_capacity(table.len()),
    };
    let Some(kind) = kind else {
        return Ok(flat);
    };
    let has_ids = table.has_column(RECORD_ID_FIELD);
    let sector = sector.map(normalize_label);

    for (index, feature) in table.features.iter().enumerate() {
        let location = locate(feature, table.crs, kind)?;
        let record_id = feature
            .text(RECORD_ID_FIELD)
            .filter(|_| has_ids)
            .unwrap_or_else(|| format!("{RECORD_ID_FIELD}{index}"));

        let mut attributes = Map::new();
        match role {
            FlatRole::Geography => {
                for column in &flat.columns {
                    let value = feature.properties.get(column).cloned().unwrap_or(Value::Null);
                    attributes.insert(column.clone(), value);
                }
            }
            FlatRole::Facility => {
                let value = match &sector {
                    Some(label) => Value::from(label.as_str()),
                    None => feature
                        .text(SECTOR_FIELD)
                        .map(|s| Value::from(normalize_label(&s)))
                        .unwrap_or(Value::Null),
                };
                attributes.insert("sector".to_string(), value);
            }
        }

        flat.rows.push(FlatRow {
            record_id,
            longitude: location.x(),
            latitude: location.y(),
            attributes,
        });
    }
    Ok(flat)
}

fn locate(feature: &Feature, crs: Crs, kind: GeometryKind) -> Result<Point<f64>> {
    let missing = || CollectError::UnsupportedGeometry("empty geometry".into());
    match kind {
        GeometryKind::Point | GeometryKind::MultiPoint => {
            let wgs = reproject(&feature.geometry, crs, Crs::Wgs84);
            match wgs {
                Geometry::Point(p) => Ok(p),
                Geometry::MultiPoint(mp) => mp.interior_point().ok_or_else(missing),
                _ => Err(missing()),
            }
        }
        GeometryKind::Polygon => {
            let metric = reproject(&feature.geometry, crs, Crs::WebMercator);
            let centroid = metric.centroid().ok_or_else(missing)?;
            Ok(Point::from(unproject(centroid.0)))
        }
        GeometryKind::Line => Err(CollectError::UnsupportedGeometry(
            "line data cannot be reduced to a location".into(),
        )),
    }
}

/// Flattens every artifact, paired with the sector label it was tagged with,
/// independently and concatenates the results. Artifacts that cannot be read or
/// flattened are logged and left out.
pub fn flatten_artifacts<'a>(
    artifacts: impl IntoIterator<Item = (&'a Path, Option<&'a str>)>,
    role: FlatRole,
) -> FlatTable {
    let mut combined = FlatTable {
        columns: match role {
            FlatRole::Geography => Vec::new(),
            FlatRole::Facility => role.columns(),
        },
        rows: Vec::new(),
    };
    for (path, sector) in artifacts {
        match artifact::read_table(path).and_then(|t| flatten(&t, role, sector)) {
            Ok(flat) => {
                debug!("flattened {} rows from {}", flat.len(), path.display());
                combined.extend(flat);
            }
            Err(e) => warn!("skipping {} in tabular export: {}", path.display(), e),
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{project, Crs};
    use geo::{line_string, point, polygon, BoundingRect, Coord, MultiPoint};

    fn mercator_square(lon: f64, lat: f64, size: f64) -> Feature {
        let corner = |x: f64, y: f64| project(Coord { x, y });
        let a = corner(lon, lat);
        let b = corner(lon + size, lat + size);
        Feature::new(polygon![
            (x: a.x, y: a.y),
            (x: b.x, y: a.y),
            (x: b.x, y: b.y),
            (x: a.x, y: b.y)
        ])
    }

    #[test]
    fn polygon_centroids_fall_inside_bounds() {
        let mut table = FeatureTable::new(Crs::WebMercator);
        table.push(mercator_square(-106.7, 35.0, 0.1).with_property("GEOID", "35001000100"));
        table.push(mercator_square(-106.5, 35.2, 0.1).with_property("GEOID", "35001000200"));
        let bounds = table.to_crs(Crs::Wgs84);

        let flat = flatten(&table, FlatRole::Geography, None).unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.columns, vec!["GEOID".to_string()]);
        for (row, feature) in flat.rows.iter().zip(&bounds.features) {
            let rect = feature.geometry.bounding_rect().unwrap();
            assert!(row.longitude > rect.min().x && row.longitude < rect.max().x);
            assert!(row.latitude > rect.min().y && row.latitude < rect.max().y);
        }
        assert_eq!(flat.rows[0].record_id, "record_id0");
    }

    #[test]
    fn facility_rows_carry_normalized_sector() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(
            Feature::new(point!(x: -106.6, y: 35.1))
                .with_property(SECTOR_FIELD, "Fire Stations")
                .with_property(RECORD_ID_FIELD, "fire_stations_0"),
        );
        table.push(
            Feature::new(point!(x: -106.5, y: 35.2))
                .with_property(SECTOR_FIELD, "Fire Stations")
                .with_property(RECORD_ID_FIELD, "fire_stations_1"),
        );
        let flat = flatten(&table, FlatRole::Facility, None).unwrap();
        assert_eq!(flat.rows[1].record_id, "fire_stations_1");
        assert_eq!(flat.rows[0].attributes["sector"], Value::from("fire_stations"));
        assert_eq!(flat.rows[0].longitude, -106.6);
    }

    #[test]
    fn given_sector_label_wins_over_source_field() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(
            Feature::new(point!(x: -106.6, y: 35.1))
                .with_property(SECTOR_FIELD, "energy")
                .with_property("Sector_1", "Power Plants"),
        );
        let flat = flatten(&table, FlatRole::Facility, Some("Power Plants")).unwrap();
        assert_eq!(flat.rows[0].attributes["sector"], Value::from("power_plants"));
    }

    #[test]
    fn multipoints_use_an_interior_point() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(MultiPoint::new(vec![point!(x: 0.0, y: 0.0), point!(x: 2.0, y: 0.0)])));
        let flat = flatten(&table, FlatRole::Facility, None).unwrap();
        assert_eq!(flat.len(), 1);
        assert!(flat.rows[0].longitude >= 0.0 && flat.rows[0].longitude <= 2.0);
    }

    #[test]
    fn lines_and_mixed_types_are_rejected() {
        let mut lines = FeatureTable::new(Crs::Wgs84);
        lines.push(Feature::new(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]));
        assert!(matches!(
            flatten(&lines, FlatRole::Facility, None),
            Err(CollectError::UnsupportedGeometry(_))
        ));

        let mut mixed = FeatureTable::new(Crs::Wgs84);
        mixed.push(Feature::new(point!(x: 0.0, y: 0.0)));
        mixed.push(mercator_square(0.0, 0.0, 1.0));
        assert!(flatten(&mixed, FlatRole::Facility, None).is_err());
    }

    #[test]
    fn concatenates_artifacts_and_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.geojson");
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(point!(x: 1.0, y: 1.0)).with_property(SECTOR_FIELD, "A"));
        artifact::write_table(&table, &good).unwrap();
        let missing = dir.path().join("missing.geojson");

        let flat = flatten_artifacts(
            [(good.as_path(), Some("A")), (missing.as_path(), Some("B")), (good.as_path(), None)],
            FlatRole::Facility,
        );
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.rows[0].attributes["sector"], Value::from("a"));

        let csv_path = dir.path().join("csv").join("facility_data.csv");
        flat.write_csv(&csv_path).unwrap();
        let text = fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("record_id,longitude,latitude,sector"));
        assert_eq!(text.lines().count(), 3);
    }
}
