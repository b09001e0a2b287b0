//! Minimal OGC GeoPackage reader/writer: one feature table per file, geometry stored
//! as GeoPackage WKB in a `geom` column.

use super::{Feature, FeatureTable};
use crate::error::{CollectError, Result};
use crate::geometry::Crs;
use geo::BoundingRect;
use geozero::wkb::GpkgWkb;
use geozero::{CoordDimensions, ToGeo, ToWkb};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const GEOMETRY_COLUMN: &str = "geom";

const SCHEMA: &str = r#"
PRAGMA application_id = 1196444487;
PRAGMA user_version = 10200;
CREATE TABLE gpkg_spatial_ref_sys (
    srs_name                 TEXT NOT NULL,
    srs_id                   INTEGER PRIMARY KEY,
    organization             TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition               TEXT NOT NULL,
    description              TEXT
);
CREATE TABLE gpkg_contents (
    table_name  TEXT NOT NULL PRIMARY KEY,
    data_type   TEXT NOT NULL,
    identifier  TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x       DOUBLE,
    min_y       DOUBLE,
    max_x       DOUBLE,
    max_y       DOUBLE,
    srs_id      INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE gpkg_geometry_columns (
    table_name         TEXT NOT NULL,
    column_name        TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id             INTEGER NOT NULL,
    z                  TINYINT NOT NULL,
    m                  TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name)
);
INSERT INTO gpkg_spatial_ref_sys VALUES
    ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', 'undefined cartesian coordinate reference system'),
    ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', 'undefined geographic coordinate reference system');
"#;

const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const WEB_MERCATOR_WKT: &str = r#"PROJCS["WGS 84 / Pseudo-Mercator",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]],PROJECTION["Mercator_1SP"],PARAMETER["central_meridian",0],PARAMETER["scale_factor",1],PARAMETER["false_easting",0],PARAMETER["false_northing",0],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],EXTENSION["PROJ4","+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +wktext +no_defs"],AUTHORITY["EPSG","3857"]]"#;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

pub fn write(table: &FeatureTable, path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;

    let srs_id = table.crs.epsg();
    let (srs_name, definition) = match table.crs {
        Crs::Wgs84 => ("WGS 84 geodetic", WGS84_WKT),
        Crs::WebMercator => ("WGS 84 / Pseudo-Mercator", WEB_MERCATOR_WKT),
    };
    conn.execute(
        "INSERT INTO gpkg_spatial_ref_sys VALUES (?1, ?2, 'EPSG', ?2, ?3, NULL)",
        params![srs_name, srs_id, definition],
    )?;

    let name = table_name(path);
    let columns = sql_columns(table);

    let mut ddl = format!(
        "CREATE TABLE {} (fid INTEGER PRIMARY KEY AUTOINCREMENT, {} BLOB",
        quote(&name),
        GEOMETRY_COLUMN
    );
    for column in &columns {
        ddl.push_str(&format!(", {} {}", quote(&column.name), column.kind.sql()));
    }
    ddl.push(')');
    conn.execute_batch(&ddl)?;

    let bbox = table
        .features
        .iter()
        .filter_map(|f| f.geometry.bounding_rect())
        .reduce(|a, b| {
            geo::Rect::new(
                geo::Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                geo::Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        });
    conn.execute(
        "INSERT INTO gpkg_contents (table_name, data_type, identifier, min_x, min_y, max_x, max_y, srs_id)
         VALUES (?1, 'features', ?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            name,
            bbox.map(|r| r.min().x),
            bbox.map(|r| r.min().y),
            bbox.map(|r| r.max().x),
            bbox.map(|r| r.max().y),
            srs_id
        ],
    )?;
    conn.execute(
        "INSERT INTO gpkg_geometry_columns VALUES (?1, ?2, 'GEOMETRY', ?3, 0, 0)",
        params![name, GEOMETRY_COLUMN, srs_id],
    )?;

    let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
    let insert = format!(
        "INSERT INTO {} ({}{}) VALUES ({})",
        quote(&name),
        GEOMETRY_COLUMN,
        columns
            .iter()
            .map(|c| format!(", {}", quote(&c.name)))
            .collect::<String>(),
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&insert)?;
        for feature in &table.features {
            let blob = feature
                .geometry
                .to_gpkg_wkb(CoordDimensions::xy(), Some(srs_id), Vec::new())?;
            let mut values = Vec::with_capacity(columns.len() + 1);
            values.push(SqlValue::Blob(blob));
            for column in &columns {
                values.push(to_sql(feature.properties.get(column.source), column.kind));
            }
            stmt.execute(params_from_iter(values))?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn read(path: &Path) -> Result<FeatureTable> {
    if !path.exists() {
        return Err(CollectError::read(path, "file does not exist"));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let (name, geometry_column, srs_id): (String, String, i32) = conn.query_row(
        "SELECT table_name, column_name, srs_id FROM gpkg_geometry_columns LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let crs = if srs_id <= 0 {
        Crs::Wgs84
    } else {
        Crs::from_epsg(srs_id)?
    };

    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote(&name)))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;

    let mut table = FeatureTable::new(crs);
    while let Some(row) = rows.next()? {
        let mut geometry = None;
        let mut properties = Map::new();
        for (index, column) in names.iter().enumerate() {
            let value = row.get_ref(index)?;
            if column.eq_ignore_ascii_case(&geometry_column) {
                if let ValueRef::Blob(bytes) = value {
                    geometry = Some(GpkgWkb(bytes.to_vec()).to_geo()?);
                }
            } else if !column.eq_ignore_ascii_case("fid") {
                properties.insert(column.clone(), from_sql(value));
            }
        }
        if let Some(geometry) = geometry {
            table.push(Feature {
                geometry,
                properties,
            });
        }
    }
    Ok(table)
}

struct SqlColumn<'a> {
    source: &'a str,
    name: String,
    kind: ColumnType,
}

/// Maps attribute names to column names unique among themselves and the `fid`
/// and geometry columns. SQLite compares names case-insensitively, so clashes
/// such as `Sector`/`SECTOR` or a source's own `FID` get a `_<n>` suffix.
fn sql_columns(table: &FeatureTable) -> Vec<SqlColumn<'_>> {
    let mut taken: HashSet<String> = ["fid", GEOMETRY_COLUMN].iter().map(|c| c.to_string()).collect();
    let mut columns = Vec::with_capacity(table.columns.len());
    for source in &table.columns {
        let mut name = source.clone();
        let mut n = 0;
        while taken.contains(&name.to_ascii_lowercase()) {
            n += 1;
            name = format!("{source}_{n}");
        }
        taken.insert(name.to_ascii_lowercase());
        columns.push(SqlColumn {
            source,
            name,
            kind: infer_type(table, source),
        });
    }
    columns
}

fn table_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "features".to_string())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn infer_type(table: &FeatureTable, column: &str) -> ColumnType {
    let mut kind: Option<ColumnType> = None;
    for value in table.features.iter().filter_map(|f| f.properties.get(column)) {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Integer,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
            Value::Number(_) => ColumnType::Real,
            _ => ColumnType::Text,
        };
        kind = Some(match (kind, this) {
            (None, t) => t,
            (Some(ColumnType::Text), _) | (_, ColumnType::Text) => ColumnType::Text,
            (Some(ColumnType::Real), _) | (_, ColumnType::Real) => ColumnType::Real,
            _ => ColumnType::Integer,
        });
    }
    kind.unwrap_or(ColumnType::Text)
}

fn to_sql(value: Option<&Value>, kind: ColumnType) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match kind {
            ColumnType::Integer => n.as_i64().map(SqlValue::Integer).unwrap_or(SqlValue::Null),
            ColumnType::Real => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            ColumnType::Text => SqlValue::Text(n.to_string()),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}
