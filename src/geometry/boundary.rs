use super::{reproject, Crs};
use crate::artifact::{self, FeatureTable};
use crate::error::{CollectError, Result};
use geo::{BooleanOps, BoundingRect, Geometry, MultiPolygon, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;

/// A single polygonal area of interest in one coordinate reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub geometry: MultiPolygon<f64>,
    pub crs: Crs,
}

impl Boundary {
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    /// Esri JSON polygon used as the `geometry` parameter of a REST query.
    pub fn to_esri_json(&self) -> Value {
        let mut rings: Vec<Vec<[f64; 2]>> = Vec::new();
        for polygon in &self.geometry {
            rings.push(polygon.exterior().coords().map(|c| [c.x, c.y]).collect());
            for interior in polygon.interiors() {
                rings.push(interior.coords().map(|c| [c.x, c.y]).collect());
            }
        }
        json!({
            "rings": rings,
            "spatialReference": { "wkid": self.crs.epsg() }
        })
    }
}

/// Which of the two working boundaries a source family queries with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryKind {
    Projected,
    Geographic,
}

/// The same area of interest in the projected and geographic references.
#[derive(Debug, Clone)]
pub struct BoundaryPair {
    pub projected: Boundary,
    pub geographic: Boundary,
}

impl BoundaryPair {
    pub fn derive(table: &FeatureTable, feature_index: Option<usize>) -> Result<Self> {
        Ok(Self {
            projected: normalize(table, Crs::WebMercator, feature_index)?,
            geographic: normalize(table, Crs::Wgs84, feature_index)?,
        })
    }

    pub fn get(&self, kind: BoundaryKind) -> &Boundary {
        match kind {
            BoundaryKind::Projected => &self.projected,
            BoundaryKind::Geographic => &self.geographic,
        }
    }
}

/// Reads a vector file and turns it into a boundary.
pub fn normalize_file(path: &Path, target: Crs, feature_index: Option<usize>) -> Result<Boundary> {
    let table = artifact::read_table(path)?;
    normalize(&table, target, feature_index)
}

/// Turns a vector dataset into one query boundary in `target`.
///
/// Without `feature_index` every feature is dissolved into one geometry; with it the
/// indexed feature is used as is. The dataset is reprojected before selection so the
/// dissolve never happens across a projection discontinuity.
pub fn normalize(table: &FeatureTable, target: Crs, feature_index: Option<usize>) -> Result<Boundary> {
    if table.is_empty() {
        return Err(CollectError::Geometry("boundary dataset has no features".into()));
    }

    let geometry = match feature_index {
        Some(index) => {
            let feature = table.features.get(index).ok_or_else(|| {
                CollectError::Geometry(format!(
                    "feature index {index} out of range ({} features)",
                    table.len()
                ))
            })?;
            as_multipolygon(&reproject(&feature.geometry, table.crs, target))?
        }
        None => {
            let mut parts = Vec::with_capacity(table.len());
            for feature in &table.features {
                parts.push(as_multipolygon(&reproject(&feature.geometry, table.crs, target))?);
            }
            debug!("dissolving {} boundary features", parts.len());
            dissolve(parts)?
        }
    };

    Ok(Boundary {
        geometry,
        crs: target,
    })
}

fn dissolve(parts: Vec<MultiPolygon<f64>>) -> Result<MultiPolygon<f64>> {
    parts
        .into_iter()
        .reduce(|acc, part| acc.union(&part))
        .ok_or_else(|| CollectError::Geometry("nothing to dissolve".into()))
}

fn as_multipolygon(geometry: &Geometry<f64>) -> Result<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Ok(mp.clone()),
        Geometry::Rect(r) => Ok(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Ok(MultiPolygon::new(vec![t.to_polygon()])),
        other => Err(CollectError::Geometry(format!(
            "boundary geometry must be polygonal, found {}",
            geometry_name(other)
        ))),
    }
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Feature;
    use approx::assert_abs_diff_eq;
    use geo::{point, polygon, Area};

    fn square(x0: f64, y0: f64, size: f64) -> Geometry<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size)
        ]
        .into()
    }

    fn table(geometries: Vec<Geometry<f64>>) -> FeatureTable {
        let mut table = FeatureTable::new(Crs::Wgs84);
        for g in geometries {
            table.push(Feature::new(g));
        }
        table
    }

    #[test]
    fn dissolves_overlapping_polygons() {
        let input = table(vec![square(0.0, 0.0, 2.0), square(1.0, 0.0, 2.0)]);
        let boundary = normalize(&input, Crs::Wgs84, None).unwrap();
        assert_eq!(boundary.geometry.0.len(), 1);
        assert_abs_diff_eq!(boundary.geometry.unsigned_area(), 6.0, epsilon = 1e-9);
    }

    #[test]
    fn selects_single_feature_by_index() {
        let input = table(vec![square(0.0, 0.0, 1.0), square(10.0, 10.0, 1.0)]);
        let boundary = normalize(&input, Crs::Wgs84, Some(1)).unwrap();
        let rect = boundary.bounding_rect().unwrap();
        assert_abs_diff_eq!(rect.min().x, 10.0);
        assert!(normalize(&input, Crs::Wgs84, Some(5)).is_err());
    }

    #[test]
    fn reprojects_to_target() {
        let input = table(vec![square(-106.7, 35.0, 0.2)]);
        let boundary = normalize(&input, Crs::WebMercator, None).unwrap();
        assert_eq!(boundary.crs, Crs::WebMercator);
        let rect = boundary.bounding_rect().unwrap();
        assert!(rect.min().x < -11_000_000.0);

        let esri = boundary.to_esri_json();
        assert_eq!(esri["spatialReference"]["wkid"], 3857);
        assert_eq!(esri["rings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn rejects_empty_and_non_polygonal_inputs() {
        let empty = FeatureTable::new(Crs::Wgs84);
        assert!(matches!(normalize(&empty, Crs::Wgs84, None), Err(CollectError::Geometry(_))));

        let points = table(vec![point!(x: 1.0, y: 1.0).into()]);
        assert!(matches!(normalize(&points, Crs::Wgs84, None), Err(CollectError::Geometry(_))));
    }
}
