//! Coordinate references, projection between them and geometry classification.
//!
//! Only the two references the collector works in are supported: geographic
//! WGS84 (EPSG:4326) and Web Mercator (EPSG:3857).

pub mod boundary;

use crate::error::{CollectError, Result};
use geo::{Coord, Geometry, MapCoords};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use boundary::{normalize, normalize_file, Boundary, BoundaryKind, BoundaryPair};

/// WGS84 semi-major axis in meters.
const SEMIMAJOR: f64 = 6_378_137.0;
/// Latitude at which Web Mercator becomes a square world.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Crs {
    /// EPSG:4326, lon/lat degrees.
    Wgs84,
    /// EPSG:3857, meters.
    WebMercator,
}

impl Crs {
    pub fn epsg(self) -> i32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
        }
    }

    pub fn from_epsg(code: i32) -> Result<Self> {
        match code {
            4326 => Ok(Crs::Wgs84),
            3857 | 102100 | 900913 => Ok(Crs::WebMercator),
            other => Err(CollectError::UnsupportedCrs(other)),
        }
    }

    /// Parses names like `EPSG:3857` or `urn:ogc:def:crs:EPSG::3857`.
    pub fn from_name(name: &str) -> Result<Self> {
        if name.to_ascii_uppercase().contains("CRS84") {
            return Ok(Crs::Wgs84);
        }
        let code = name
            .rsplit(':')
            .next()
            .and_then(|c| c.trim().parse::<i32>().ok())
            .ok_or_else(|| CollectError::Geometry(format!("unrecognized CRS name '{name}'")))?;
        Self::from_epsg(code)
    }

    pub fn is_geographic(self) -> bool {
        matches!(self, Crs::Wgs84)
    }
}

impl TryFrom<i32> for Crs {
    type Error = CollectError;

    fn try_from(code: i32) -> Result<Self> {
        Crs::from_epsg(code)
    }
}

impl From<Crs> for i32 {
    fn from(crs: Crs) -> i32 {
        crs.epsg()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Lon/lat degrees to Web Mercator meters. Latitude is clamped to the mercator range.
pub fn project(coord: Coord<f64>) -> Coord<f64> {
    let lat = coord.y.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = SEMIMAJOR * coord.x.to_radians();
    let y = SEMIMAJOR * (std::f64::consts::FRAC_PI_4 + lat / 2.0).tan().ln();
    Coord { x, y }
}

/// Web Mercator meters to lon/lat degrees.
pub fn unproject(coord: Coord<f64>) -> Coord<f64> {
    let lat = std::f64::consts::FRAC_PI_2 - 2.0 * (-coord.y / SEMIMAJOR).exp().atan();
    let lon = coord.x / SEMIMAJOR;
    Coord {
        x: lon.to_degrees(),
        y: lat.to_degrees(),
    }
}

pub fn reproject(geometry: &Geometry<f64>, from: Crs, to: Crs) -> Geometry<f64> {
    match (from, to) {
        (Crs::Wgs84, Crs::WebMercator) => geometry.map_coords(project),
        (Crs::WebMercator, Crs::Wgs84) => geometry.map_coords(unproject),
        (Crs::Wgs84, Crs::Wgs84) | (Crs::WebMercator, Crs::WebMercator) => geometry.clone(),
    }
}

/// Closed set of geometry shapes the format and flattening stages know how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    MultiPoint,
    Line,
    Polygon,
}

impl GeometryKind {
    /// Returns `None` for geometry collections.
    pub fn of(geometry: &Geometry<f64>) -> Option<Self> {
        match geometry {
            Geometry::Point(_) => Some(GeometryKind::Point),
            Geometry::MultiPoint(_) => Some(GeometryKind::MultiPoint),
            Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
                Some(GeometryKind::Line)
            }
            Geometry::Polygon(_)
            | Geometry::MultiPolygon(_)
            | Geometry::Rect(_)
            | Geometry::Triangle(_) => Some(GeometryKind::Polygon),
            Geometry::GeometryCollection(_) => None,
        }
    }

    /// Resolves the single kind shared by every geometry. Polygonal variants unify
    /// to [`GeometryKind::Polygon`]; any other mix is unsupported.
    pub fn common<'a>(geometries: impl IntoIterator<Item = &'a Geometry<f64>>) -> Result<Option<Self>> {
        let mut found: Option<GeometryKind> = None;
        for geometry in geometries {
            let kind = GeometryKind::of(geometry).ok_or_else(|| {
                CollectError::UnsupportedGeometry("geometry collections are not handled".into())
            })?;
            match found {
                None => found = Some(kind),
                Some(existing) if existing == kind => {}
                Some(existing) => {
                    return Err(CollectError::UnsupportedGeometry(format!(
                        "multiple geometry types found ({existing} and {kind})"
                    )))
                }
            }
        }
        Ok(found)
    }
}

impl fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeometryKind::Point => "point",
            GeometryKind::MultiPoint => "multipoint",
            GeometryKind::Line => "line",
            GeometryKind::Polygon => "polygon",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use geo::{line_string, point, polygon, MultiPolygon};

    #[test]
    fn projects_known_coordinates() {
        let origin = project(Coord { x: 0.0, y: 0.0 });
        assert_abs_diff_eq!(origin.x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.y, 0.0, epsilon = 1e-9);

        let edge = project(Coord { x: 180.0, y: 0.0 });
        assert_abs_diff_eq!(edge.x, 20_037_508.342_789_244, epsilon = 1e-6);

        let back = unproject(project(Coord { x: -106.65, y: 35.08 }));
        assert_abs_diff_eq!(back.x, -106.65, epsilon = 1e-9);
        assert_abs_diff_eq!(back.y, 35.08, epsilon = 1e-9);
    }

    #[test]
    fn parses_crs_names() {
        assert_eq!(Crs::from_name("EPSG:3857").unwrap(), Crs::WebMercator);
        assert_eq!(Crs::from_name("urn:ogc:def:crs:EPSG::4326").unwrap(), Crs::Wgs84);
        assert_eq!(Crs::from_name("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap(), Crs::Wgs84);
        assert!(matches!(Crs::from_epsg(2263), Err(CollectError::UnsupportedCrs(2263))));
    }

    #[test]
    fn polygonal_variants_unify() {
        let a: Geometry<f64> = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)].into();
        let b: Geometry<f64> = MultiPolygon::new(vec![
            polygon![(x: 2.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 1.0)],
        ])
        .into();
        assert_eq!(GeometryKind::common([&a, &b]).unwrap(), Some(GeometryKind::Polygon));

        let p: Geometry<f64> = point!(x: 1.0, y: 1.0).into();
        let l: Geometry<f64> = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)].into();
        assert!(GeometryKind::common([&p, &l]).is_err());
        assert_eq!(GeometryKind::common(std::iter::empty()).unwrap(), None);
    }
}
