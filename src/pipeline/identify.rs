//! Sector tagging and per-record identifiers.

use crate::artifact::{self, FeatureTable};
use crate::constants::RECORD_ID_FIELD;
use crate::error::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lowercased label with spaces replaced by underscores.
pub fn normalize_label(label: &str) -> String {
    label.to_lowercase().replace(' ', "_")
}

/// First of `field`, `field_1`, `field_2`, ... that the table does not have yet,
/// compared case-insensitively since SQLite column names are.
pub fn free_column_name(table: &FeatureTable, field: &str) -> String {
    let mut candidate = field.to_string();
    let mut n = 0;
    while table.find_column(&candidate).is_some() {
        n += 1;
        candidate = format!("{field}_{n}");
    }
    candidate
}

/// Adds a constant `label` column. Existing columns are never touched; the name
/// actually used is returned.
pub fn tag_sector_table(table: &mut FeatureTable, label: &str, field: &str) -> String {
    let column = free_column_name(table, field);
    table.set_column(&column, |_, _| Value::from(label));
    column
}

/// Sets `record_id` to `<normalized label>_<row index>` on every feature.
pub fn assign_record_id_table(table: &mut FeatureTable, label: &str) {
    let prefix = normalize_label(label);
    table.set_column(RECORD_ID_FIELD, |index, _| Value::from(format!("{prefix}_{index}")));
}

pub fn tag_sector(path: &Path, label: &str, field: &str, overwrite: bool) -> Result<PathBuf> {
    let mut table = artifact::read_table(path)?;
    let column = tag_sector_table(&mut table, label, field);
    debug!("tagged {} with {}={}", path.display(), column, label);
    save(&table, path, overwrite)
}

pub fn assign_record_id(path: &Path, label: &str, overwrite: bool) -> Result<PathBuf> {
    let mut table = artifact::read_table(path)?;
    assign_record_id_table(&mut table, label);
    save(&table, path, overwrite)
}

fn save(table: &FeatureTable, path: &Path, overwrite: bool) -> Result<PathBuf> {
    let target = if overwrite {
        path.to_path_buf()
    } else {
        artifact::next_free_path(path)
    };
    artifact::write_table(table, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Feature;
    use crate::error::CollectError;
    use crate::geometry::Crs;
    use geo::point;
    use std::collections::HashSet;

    fn points(n: usize) -> FeatureTable {
        let mut table = FeatureTable::new(Crs::Wgs84);
        for i in 0..n {
            table.push(Feature::new(point!(x: i as f64, y: 0.0)).with_property("NAME", format!("site {i}")));
        }
        table
    }

    #[test]
    fn record_ids_are_distinct_and_prefixed() {
        let mut table = points(4);
        assign_record_id_table(&mut table, "Fire Stations");
        let ids: HashSet<String> = table
            .features
            .iter()
            .filter_map(|f| f.text(RECORD_ID_FIELD))
            .collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| id.starts_with("fire_stations_")));
        assert_eq!(table.features[2].text(RECORD_ID_FIELD).as_deref(), Some("fire_stations_2"));
    }

    #[test]
    fn second_tag_gets_suffixed_column() {
        let mut table = points(2);
        assert_eq!(tag_sector_table(&mut table, "Hospitals", "Sector"), "Sector");
        assert_eq!(tag_sector_table(&mut table, "Clinics", "Sector"), "Sector_1");
        assert_eq!(table.features[0].text("Sector").as_deref(), Some("Hospitals"));
        assert_eq!(table.features[0].text("Sector_1").as_deref(), Some("Clinics"));
    }

    #[test]
    fn column_collisions_ignore_case() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(point!(x: 0.0, y: 0.0)).with_property("SECTOR", "Energy"));
        assert_eq!(tag_sector_table(&mut table, "Power Plants", "Sector"), "Sector_1");
        assert_eq!(table.features[0].text("SECTOR").as_deref(), Some("Energy"));
        assert_eq!(normalize_label("Power Plants"), "power_plants");
    }

    #[test]
    fn file_variants_respect_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("HIFLD_Hospitals.geojson");
        artifact::write_table(&points(3), &path).unwrap();

        let copy = tag_sector(&path, "Hospitals", "Sector", false).unwrap();
        assert_eq!(copy, dir.path().join("HIFLD_Hospitals_1.geojson"));
        assert!(!artifact::read_table(&path).unwrap().has_column("Sector"));

        let same = assign_record_id(&copy, "Hospitals", true).unwrap();
        assert_eq!(same, copy);
        let table = artifact::read_table(&copy).unwrap();
        assert!(table.has_column("Sector"));
        assert!(table.has_column(RECORD_ID_FIELD));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = assign_record_id(Path::new("/nonexistent/none.geojson"), "x", true).unwrap_err();
        assert!(matches!(err, CollectError::ArtifactRead { .. }));
    }
}
