//! GeoJSON artifacts. The coordinate reference travels in the legacy `crs` member so
//! projected output survives a round trip; files without one are read as WGS84.

use super::{Feature, FeatureTable};
use crate::error::{CollectError, Result};
use crate::geometry::Crs;
use geojson::{FeatureCollection, GeoJson, JsonObject};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::debug;

pub fn read(path: &Path) -> Result<FeatureTable> {
    let text = fs::read_to_string(path)?;
    let geojson: GeoJson = text.parse()?;
    from_geojson(geojson, Crs::Wgs84)
}

pub fn write(table: &FeatureTable, path: &Path) -> Result<()> {
    let collection = to_collection(table);
    fs::write(path, GeoJson::from(collection).to_string())?;
    Ok(())
}

/// Builds a table from any GeoJSON object. `fallback` is used when no `crs` member is present.
pub fn from_geojson(geojson: GeoJson, fallback: Crs) -> Result<FeatureTable> {
    match geojson {
        GeoJson::FeatureCollection(collection) => from_collection(collection, fallback),
        GeoJson::Feature(feature) => {
            let crs = declared_crs(feature.foreign_members.as_ref())?.unwrap_or(fallback);
            let mut table = FeatureTable::new(crs);
            if let Some(f) = convert_feature(feature)? {
                table.push(f);
            }
            Ok(table)
        }
        GeoJson::Geometry(geometry) => {
            let mut table = FeatureTable::new(fallback);
            table.push(Feature::new(geo::Geometry::<f64>::try_from(geometry)?));
            Ok(table)
        }
    }
}

pub fn from_collection(collection: FeatureCollection, fallback: Crs) -> Result<FeatureTable> {
    let crs = declared_crs(collection.foreign_members.as_ref())?.unwrap_or(fallback);
    let mut table = FeatureTable::new(crs);
    let mut skipped = 0usize;
    for feature in collection.features {
        match convert_feature(feature)? {
            Some(f) => table.push(f),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("skipped {} features without geometry", skipped);
    }
    Ok(table)
}

pub fn to_collection(table: &FeatureTable) -> FeatureCollection {
    let features = table
        .features
        .iter()
        .map(|f| geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&f.geometry))),
            id: None,
            properties: Some(f.properties.clone()),
            foreign_members: None,
        })
        .collect();

    let mut members = JsonObject::new();
    members.insert(
        "crs".to_string(),
        json!({ "type": "name", "properties": { "name": table.crs.to_string() } }),
    );

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(members),
    }
}

fn convert_feature(feature: geojson::Feature) -> Result<Option<Feature>> {
    let Some(geometry) = feature.geometry else {
        return Ok(None);
    };
    Ok(Some(Feature {
        geometry: geo::Geometry::<f64>::try_from(geometry)?,
        properties: feature.properties.unwrap_or_default(),
    }))
}

fn declared_crs(members: Option<&JsonObject>) -> Result<Option<Crs>> {
    let Some(crs) = members.and_then(|m| m.get("crs")) else {
        return Ok(None);
    };
    match crs.pointer("/properties/name").and_then(Value::as_str) {
        Some(name) => Crs::from_name(name).map(Some),
        None => Err(CollectError::Geometry(format!("unreadable crs member: {crs}"))),
    }
}
