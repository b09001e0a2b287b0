//! KML/KMZ overlays for map viewers.
//!
//! Features are reprojected to WGS84 and multipart polygons/lines are exploded
//! into single parts. One renderer exists per geometry kind; every placemark
//! carries an HTML attribute table as its description and a style map pairing a
//! per-group colour with a shared orange highlight.

use crate::artifact::{Feature, FeatureTable};
use crate::error::{CollectError, Result};
use crate::geometry::{Crs, GeometryKind};
use geo::{Coord, Geometry, LineString, MultiPoint, Polygon};
use quick_xml::escape::escape;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const KML_NS: &str = "http://www.opengis.net/kml/2.2";
const ICON_HREF: &str = "http://maps.google.com/mapfiles/kml/paddle/wht-blank.png";

pub const PARENT_INDEX_FIELD: &str = "parent_index";

/// Highlight colour (orange) in `aabbggrr`.
const HIGHLIGHT: &str = "ff00a5ff";
const POLYGON_ALPHA: u8 = 166;
const POLYGON_HIGHLIGHT_ALPHA: u8 = 204;

/// Built-in `aabbggrr` colours. The highlight colour is left out.
const PALETTE: [&str; 24] = [
    "ff32cd9a", // yellowgreen
    "ff0000ff", // red
    "ffff0000", // blue
    "ff00ff00", // lime
    "ff00ffff", // yellow
    "ffff00ff", // magenta
    "ffffff00", // cyan
    "ff800080", // purple
    "ff008000", // green
    "ff000080", // maroon
    "ff808000", // teal
    "ff800000", // navy
    "ff008080", // olive
    "ff507fff", // coral
    "ffb469ff", // hotpink
    "ff2fffad", // greenyellow
    "ffd4ff7f", // aquamarine
    "ffe16941", // royalblue
    "ff1e69d2", // chocolate
    "ff8b008b", // darkmagenta
    "ff578b2e", // seagreen
    "ffcbc0ff", // pink
    "ff3c14dc", // crimson
    "ff00d7ff", // gold
];

#[derive(Debug, Clone, Default)]
pub struct KmlOptions {
    /// Document name; also the single folder name when no grouping applies.
    pub name: String,
    /// Attribute used as placemark name. Falls back to the row index.
    pub id_field: Option<String>,
    /// Attribute whose distinct values become folders.
    pub group_by: Option<String>,
    /// Explicit `aabbggrr` colours, reused cyclically across groups.
    pub colors: Vec<String>,
    /// Number of attributes listed in descriptions; 0 lists all.
    pub max_attributes: usize,
    /// Attributes listed in descriptions, after the id field. Overrides
    /// `max_attributes`; names the table lacks are skipped.
    pub content_fields: Option<Vec<String>>,
}

/// Writes `table` as KML, or as KMZ when `path` ends in `.kmz`.
pub fn write_kml(table: &FeatureTable, path: &Path, options: &KmlOptions) -> Result<()> {
    let document = render(table, options)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let kmz = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("kmz"))
        .unwrap_or(false);
    if kmz {
        let mut archive = ZipWriter::new(File::create(path)?);
        archive.start_file(
            "doc.kml",
            FileOptions::default().compression_method(CompressionMethod::Deflated),
        )?;
        archive.write_all(&document)?;
        archive.finish()?;
    } else {
        fs::write(path, &document)?;
    }
    debug!("wrote overlay {}", path.display());
    Ok(())
}

/// Renders the KML document bytes.
pub fn render(table: &FeatureTable, options: &KmlOptions) -> Result<Vec<u8>> {
    let table = explode(&table.to_crs(Crs::Wgs84));
    let kind = GeometryKind::common(table.features.iter().map(|f| &f.geometry))?
        .unwrap_or(GeometryKind::Point);

    let id_field = options.id_field.as_deref().filter(|field| {
        let present = table.has_column(field);
        if !present {
            warn!("id field {} not available, using row index", field);
        }
        present
    });
    let group_by = options.group_by.as_deref().filter(|field| {
        let present = table.has_column(field);
        if !present {
            warn!("group field {} not found", field);
        }
        present
    });

    let groups: Vec<String> = match group_by {
        Some(field) => table
            .features
            .iter()
            .map(|f| f.text(field).unwrap_or_default())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        None => vec![options.name.clone()],
    };
    let colors = palette(&options.colors, groups.len(), &options.name);
    let attributes = description_columns(&table, options, id_field);

    let mut out = KmlWriter::new();
    out.decl()?;
    out.start_with("kml", &[("xmlns", KML_NS)])?;
    out.start("Document")?;
    out.text_element("name", &options.name)?;
    out.text_element("open", "1")?;

    for (index, color) in colors.iter().enumerate() {
        out.style(&format!("normal_{index}"), kind, color, false)?;
        out.style_map(index)?;
    }
    out.style("highlight", kind, HIGHLIGHT, true)?;

    out.start("Folder")?;
    out.text_element("name", group_by.unwrap_or(options.name.as_str()))?;
    for (group_index, group) in groups.iter().enumerate() {
        out.start("Folder")?;
        out.text_element("name", group)?;
        for (row, feature) in table.features.iter().enumerate() {
            if let Some(field) = group_by {
                if feature.text(field).unwrap_or_default() != *group {
                    continue;
                }
            }
            let name = id_field
                .and_then(|field| feature.text(field))
                .unwrap_or_else(|| row.to_string());
            out.placemark(&name, feature, &attributes, group_index)?;
        }
        out.end("Folder")?;
    }
    out.end("Folder")?;

    out.end("Document")?;
    out.end("kml")?;
    Ok(out.finish())
}

/// Splits multipart polygons and lines into one feature per part, recording the
/// original row in `parent_index`.
pub fn explode(table: &FeatureTable) -> FeatureTable {
    let multipart = table.features.iter().any(|f| {
        matches!(
            f.geometry,
            Geometry::MultiPolygon(_) | Geometry::MultiLineString(_)
        )
    });
    if !multipart {
        return table.clone();
    }

    let mut exploded = FeatureTable::new(table.crs);
    exploded.columns = table.columns.clone();
    for (parent, feature) in table.features.iter().enumerate() {
        let parts: Vec<Geometry<f64>> = match &feature.geometry {
            Geometry::MultiPolygon(mp) => mp.0.iter().cloned().map(Geometry::Polygon).collect(),
            Geometry::MultiLineString(ml) => ml.0.iter().cloned().map(Geometry::LineString).collect(),
            other => vec![other.clone()],
        };
        for part in parts {
            let mut properties = feature.properties.clone();
            properties.insert(PARENT_INDEX_FIELD.to_string(), Value::from(parent));
            exploded.push(Feature {
                geometry: part,
                properties,
            });
        }
    }
    exploded
}

/// `count` colours: explicit ones reused cyclically, otherwise the built-in
/// palette starting at an offset derived from `seed`.
pub fn palette(explicit: &[String], count: usize, seed: &str) -> Vec<String> {
    let count = count.max(1);
    let explicit: Vec<String> = explicit
        .iter()
        .filter_map(|c| {
            let parsed = parse_color(c);
            if parsed.is_none() {
                warn!("ignoring invalid KML colour '{}'", c);
            }
            parsed
        })
        .collect();
    if !explicit.is_empty() {
        return explicit.iter().cycle().take(count).cloned().collect();
    }

    let digest = Sha256::digest(seed.as_bytes());
    let start = usize::from(digest[0]) % PALETTE.len();
    (0..count)
        .map(|i| PALETTE[(start + i) % PALETTE.len()].to_string())
        .collect()
}

/// Accepts `#aabbggrr` or `aabbggrr`.
fn parse_color(color: &str) -> Option<String> {
    let hex = color.trim().trim_start_matches('#');
    (hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| hex.to_ascii_lowercase())
}

fn with_alpha(color: &str, alpha: u8) -> String {
    format!("{alpha:02x}{}", color.get(2..).unwrap_or("000000"))
}

fn description_columns(table: &FeatureTable, options: &KmlOptions, id_field: Option<&str>) -> Vec<String> {
    if let Some(fields) = &options.content_fields {
        let found: Vec<&String> = fields.iter().filter(|f| table.has_column(f)).collect();
        if found.len() != fields.len() {
            warn!("found {} of {} content fields", found.len(), fields.len());
        }
        let mut selected: Vec<String> = id_field.map(str::to_string).into_iter().collect();
        for field in found {
            if !selected.contains(field) {
                selected.push(field.clone());
            }
        }
        return selected;
    }

    let max_attributes = options.max_attributes;
    if max_attributes == 0 || max_attributes >= table.columns.len() {
        return table.columns.clone();
    }
    table.columns[..max_attributes].to_vec()
}

fn description(feature: &Feature, columns: &[String]) -> String {
    let mut html = String::from("<table>");
    for column in columns {
        let value = feature.text(column).unwrap_or_default();
        // escaped markup can never close the surrounding CDATA section
        let (column, value) = (escape(column.as_str()), escape(value.as_str()));
        html.push_str(&format!(
            "<tr style='background-color:#9DBBE0'><th>{column}</th></tr>\
             <tr style='background-color:#ffffff'><td>{value}</td></tr>"
        ));
    }
    html.push_str("</table>");
    html
}

fn coordinates<'a>(coords: impl Iterator<Item = &'a Coord<f64>>) -> String {
    coords
        .map(|c| format!("{},{}", c.x, c.y))
        .collect::<Vec<_>>()
        .join(" ")
}

struct KmlWriter {
    writer: Writer<Vec<u8>>,
}

impl KmlWriter {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }

    fn decl(&mut self) -> Result<()> {
        self.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(())
    }

    fn start(&mut self, tag: &str) -> Result<()> {
        self.writer.write_event(Event::Start(BytesStart::new(tag)))?;
        Ok(())
    }

    fn start_with(&mut self, tag: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let mut element = BytesStart::new(tag);
        for attribute in attributes {
            element.push_attribute(*attribute);
        }
        self.writer.write_event(Event::Start(element))?;
        Ok(())
    }

    fn end(&mut self, tag: &str) -> Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(tag)))?;
        Ok(())
    }

    fn text_element(&mut self, tag: &str, text: &str) -> Result<()> {
        self.start(tag)?;
        self.writer.write_event(Event::Text(BytesText::new(text)))?;
        self.end(tag)
    }

    fn style(&mut self, id: &str, kind: GeometryKind, color: &str, highlight: bool) -> Result<()> {
        self.start_with("Style", &[("id", id)])?;
        match kind {
            GeometryKind::Point | GeometryKind::MultiPoint => {
                self.start("LabelStyle")?;
                self.text_element("scale", "0")?;
                self.end("LabelStyle")?;
                self.start("IconStyle")?;
                self.text_element("color", color)?;
                self.text_element("scale", if highlight { "2" } else { "1" })?;
                self.start("Icon")?;
                self.text_element("href", ICON_HREF)?;
                self.end("Icon")?;
                self.end("IconStyle")?;
            }
            GeometryKind::Line => {
                self.line_style(color, highlight)?;
            }
            GeometryKind::Polygon => {
                self.line_style(color, highlight)?;
                let alpha = if highlight {
                    POLYGON_HIGHLIGHT_ALPHA
                } else {
                    POLYGON_ALPHA
                };
                self.start("PolyStyle")?;
                self.text_element("color", &with_alpha(color, alpha))?;
                self.end("PolyStyle")?;
            }
        }
        self.end("Style")
    }

    fn line_style(&mut self, color: &str, highlight: bool) -> Result<()> {
        self.start("LineStyle")?;
        self.text_element("color", color)?;
        self.text_element("width", if highlight { "4" } else { "2" })?;
        self.end("LineStyle")
    }

    fn style_map(&mut self, index: usize) -> Result<()> {
        let id = format!("map_{index}");
        self.start_with("StyleMap", &[("id", id.as_str())])?;
        for (key, url) in [("normal", format!("#normal_{index}")), ("highlight", "#highlight".to_string())] {
            self.start("Pair")?;
            self.text_element("key", key)?;
            self.text_element("styleUrl", &url)?;
            self.end("Pair")?;
        }
        self.end("StyleMap")
    }

    fn placemark(&mut self, name: &str, feature: &Feature, columns: &[String], style: usize) -> Result<()> {
        self.start("Placemark")?;
        self.text_element("name", name)?;
        self.start("description")?;
        self.writer
            .write_event(Event::CData(BytesCData::new(description(feature, columns))))?;
        self.end("description")?;
        self.text_element("styleUrl", &format!("#map_{style}"))?;
        self.geometry(&feature.geometry)?;
        self.end("Placemark")
    }

    fn geometry(&mut self, geometry: &Geometry<f64>) -> Result<()> {
        match geometry {
            Geometry::Point(p) => self.point(p.0),
            Geometry::MultiPoint(mp) => self.multipoint(mp),
            Geometry::Line(l) => self.line(&LineString::from(vec![l.start, l.end])),
            Geometry::LineString(ls) => self.line(ls),
            Geometry::Polygon(p) => self.polygon(p),
            Geometry::Rect(r) => self.polygon(&r.to_polygon()),
            Geometry::Triangle(t) => self.polygon(&t.to_polygon()),
            Geometry::MultiPolygon(_)
            | Geometry::MultiLineString(_)
            | Geometry::GeometryCollection(_) => Err(CollectError::UnsupportedGeometry(
                "multipart geometry must be exploded before rendering".into(),
            )),
        }
    }

    fn point(&mut self, coord: Coord<f64>) -> Result<()> {
        self.start("Point")?;
        self.text_element("coordinates", &coordinates(std::iter::once(&coord)))?;
        self.end("Point")
    }

    fn multipoint(&mut self, points: &MultiPoint<f64>) -> Result<()> {
        self.start("MultiGeometry")?;
        for p in points {
            self.point(p.0)?;
        }
        self.end("MultiGeometry")
    }

    fn line(&mut self, line: &LineString<f64>) -> Result<()> {
        self.start("LineString")?;
        self.text_element("coordinates", &coordinates(line.coords()))?;
        self.end("LineString")
    }

    fn polygon(&mut self, polygon: &Polygon<f64>) -> Result<()> {
        self.start("Polygon")?;
        self.ring("outerBoundaryIs", polygon.exterior())?;
        for interior in polygon.interiors() {
            self.ring("innerBoundaryIs", interior)?;
        }
        self.end("Polygon")
    }

    fn ring(&mut self, tag: &str, ring: &LineString<f64>) -> Result<()> {
        self.start(tag)?;
        self.start("LinearRing")?;
        self.text_element("coordinates", &coordinates(ring.coords()))?;
        self.end("LinearRing")?;
        self.end(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon, MultiPolygon};
    use quick_xml::Reader;
    use std::io::Read;

    fn count_tags(xml: &str, tag: &[u8]) -> usize {
        let mut reader = Reader::from_str(xml);
        let mut count = 0;
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) if e.name().as_ref() == tag => count += 1,
                Event::Eof => break,
                _ => {}
            }
        }
        count
    }

    fn square(x: f64) -> Polygon<f64> {
        polygon![(x: x, y: 0.0), (x: x + 1.0, y: 0.0), (x: x + 1.0, y: 1.0), (x: x, y: 1.0)]
    }

    #[test]
    fn explodes_multipolygons_with_parent_index() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(MultiPolygon::new(vec![square(0.0), square(5.0)])).with_property("GEOID", "a"));
        table.push(Feature::new(square(10.0)).with_property("GEOID", "b"));

        let exploded = explode(&table);
        assert_eq!(exploded.len(), 3);
        assert_eq!(exploded.features[1].properties[PARENT_INDEX_FIELD], Value::from(0));
        assert_eq!(exploded.features[2].properties[PARENT_INDEX_FIELD], Value::from(1));
    }

    #[test]
    fn groups_points_into_sorted_folders() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        for (i, sector) in ["Schools", "Hospitals", "Schools"].iter().enumerate() {
            table.push(
                Feature::new(point!(x: -106.0 + i as f64, y: 35.0))
                    .with_property("Sector", *sector)
                    .with_property("NAME", format!("site <{i}>")),
            );
        }
        let options = KmlOptions {
            name: "facilities".into(),
            id_field: Some("NAME".into()),
            group_by: Some("Sector".into()),
            ..Default::default()
        };
        let xml = String::from_utf8(render(&table, &options).unwrap()).unwrap();
        assert_eq!(count_tags(&xml, b"Placemark"), 3);
        // outer folder plus one per sector
        assert_eq!(count_tags(&xml, b"Folder"), 3);
        assert!(xml.find("Hospitals").unwrap() < xml.rfind("Schools").unwrap());
        assert!(xml.contains("site &lt;0&gt;"));
        assert!(xml.contains(ICON_HREF));
    }

    #[test]
    fn descriptions_escape_markup() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(
            Feature::new(point!(x: -106.6, y: 35.1))
                .with_property("NOTE", "a]]>b<c")
                .with_property("R&D", "x & y"),
        );
        let xml = String::from_utf8(render(&table, &KmlOptions::default()).unwrap()).unwrap();

        let mut reader = Reader::from_str(&xml);
        let mut descriptions = Vec::new();
        loop {
            match reader.read_event().unwrap() {
                Event::CData(data) => descriptions.push(String::from_utf8(data.into_inner().into_owned()).unwrap()),
                Event::Eof => break,
                _ => {}
            }
        }
        assert_eq!(descriptions.len(), 1);
        assert!(descriptions[0].contains("<td>a]]&gt;b&lt;c</td>"));
        assert!(descriptions[0].contains("<th>R&amp;D</th>"));
        assert!(descriptions[0].contains("<td>x &amp; y</td>"));
    }

    #[test]
    fn content_fields_select_description_rows() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(
            Feature::new(point!(x: -106.6, y: 35.1))
                .with_property("NAME", "Station 4")
                .with_property("ADDRESS", "1 Main St")
                .with_property("PHONE", "555"),
        );
        let options = KmlOptions {
            id_field: Some("NAME".into()),
            content_fields: Some(vec!["PHONE".into(), "MISSING".into(), "NAME".into()]),
            max_attributes: 1,
            ..Default::default()
        };
        assert_eq!(description_columns(&table, &options, Some("NAME")), vec!["NAME", "PHONE"]);

        let xml = String::from_utf8(render(&table, &options).unwrap()).unwrap();
        assert!(xml.contains("<th>PHONE</th>"));
        assert!(!xml.contains("<th>ADDRESS</th>"));
    }

    #[test]
    fn rejects_mixed_geometry() {
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(point!(x: 0.0, y: 0.0)));
        table.push(Feature::new(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]));
        assert!(matches!(
            render(&table, &KmlOptions::default()),
            Err(CollectError::UnsupportedGeometry(_))
        ));
    }

    #[test]
    fn kmz_wraps_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Hospitals.kmz");
        let mut table = FeatureTable::new(Crs::WebMercator);
        table.push(Feature::new(square(0.0)));
        write_kml(&table, &path, &KmlOptions { name: "Hospitals".into(), ..Default::default() }).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        let mut doc = String::new();
        archive.by_name("doc.kml").unwrap().read_to_string(&mut doc).unwrap();
        assert_eq!(count_tags(&doc, b"Polygon"), 1);
        assert!(doc.contains(&with_alpha(HIGHLIGHT, POLYGON_HIGHLIGHT_ALPHA)));
    }

    #[test]
    fn palette_is_deterministic_and_honours_explicit_colours() {
        assert_eq!(palette(&[], 3, "Hospitals"), palette(&[], 3, "Hospitals"));
        assert!(!palette(&[], 30, "x").contains(&HIGHLIGHT.to_string()));
        let explicit = palette(&["#FF0000FF".to_string()], 2, "x");
        assert_eq!(explicit, vec!["ff0000ff".to_string(), "ff0000ff".to_string()]);
        assert_eq!(with_alpha("ff0000ff", POLYGON_ALPHA), "a60000ff");
    }
}
