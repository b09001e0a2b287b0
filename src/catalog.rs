//! Static table of remote sources, grouped into families.
//!
//! Every family queries with one of the two working boundaries and may declare
//! a key prefix that is stripped to get the sector label written into results.

use crate::constants::{
    CENSUS_SERVICE_PREFIX, CENSUS_TRANSPORTATION_SERVICE, CENSUS_URL, HIFLD_PREFIX, HIFLD_URL,
    USGS_STRUCTURES_URL,
};
use crate::error::{CollectError, Result};
use crate::geometry::{BoundaryKind, Crs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One remote endpoint/layer combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub key: String,
    pub url: String,
    /// Service name; `*` matches any run of characters in the server directory.
    pub service: String,
    pub layer: u32,
    #[serde(default = "default_out_crs")]
    pub out_crs: Crs,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    /// Attributes shown in overlay descriptions; all of them when unset.
    #[serde(default)]
    pub content_fields: Option<Vec<String>>,
}

fn default_out_crs() -> Crs {
    Crs::WebMercator
}

impl SourceDefinition {
    pub fn new(key: &str, url: &str, service: &str, layer: u32, out_crs: Crs) -> Self {
        Self {
            key: key.to_string(),
            url: url.to_string(),
            service: service.to_string(),
            layer,
            out_crs,
            color: None,
            id_field: None,
            content_fields: None,
        }
    }

    pub fn with_id_field(mut self, field: &str) -> Self {
        self.id_field = Some(field.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFamily {
    pub name: String,
    pub boundary: BoundaryKind,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl SourceFamily {
    /// Source key with the family prefix removed.
    pub fn sector_label<'a>(&self, source: &'a SourceDefinition) -> &'a str {
        self.key_prefix
            .as_deref()
            .and_then(|prefix| source.key.strip_prefix(prefix))
            .unwrap_or(&source.key)
    }

    /// Loads a family from a TOML file:
    ///
    /// ```toml
    /// name = "county_gis"
    /// boundary = "geographic"
    ///
    /// [[sources]]
    /// key = "County_Parcels"
    /// url = "https://gis.example.org/arcgis/rest/services"
    /// service = "Parcels*"
    /// layer = 0
    /// out_crs = 3857
    /// ```
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            CollectError::Config(format!("Failed to read source family '{}': {}", path.display(), e))
        })?;
        let family: SourceFamily = toml::from_str(&text)?;
        if family.sources.is_empty() {
            return Err(CollectError::Config(format!(
                "source family '{}' has no sources",
                family.name
            )));
        }
        Ok(family)
    }
}

/// Census geography level queried for the geography family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CensusLevel {
    BlockGroups,
    #[default]
    Tracts,
    Counties,
    TribalTracts,
    TribalBlockGroups,
}

impl CensusLevel {
    pub fn name(self) -> &'static str {
        match self {
            CensusLevel::BlockGroups => "Block_Groups",
            CensusLevel::Tracts => "Tracts",
            CensusLevel::Counties => "Counties",
            CensusLevel::TribalTracts => "Tribal_Tracts",
            CensusLevel::TribalBlockGroups => "Tribal_Block_Groups",
        }
    }

    fn sub_service(self) -> &'static str {
        match self {
            CensusLevel::BlockGroups | CensusLevel::Tracts => "/Tracts*",
            CensusLevel::Counties => "/State*",
            CensusLevel::TribalTracts | CensusLevel::TribalBlockGroups => "/Tribal*",
        }
    }

    fn layer(self) -> u32 {
        match self {
            CensusLevel::BlockGroups | CensusLevel::Tracts => 4,
            CensusLevel::Counties => 11,
            CensusLevel::TribalTracts => 3,
            CensusLevel::TribalBlockGroups => 4,
        }
    }

    /// Geography source for this level in the ACS release of `year`.
    pub fn source(self, year: u16) -> SourceDefinition {
        SourceDefinition::new(
            &format!("Census_{}", self.name()),
            CENSUS_URL,
            &format!("{CENSUS_SERVICE_PREFIX}{year}{}", self.sub_service()),
            self.layer(),
            Crs::WebMercator,
        )
        .with_id_field("GEOID")
    }
}

impl TryFrom<u8> for CensusLevel {
    type Error = CollectError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(CensusLevel::BlockGroups),
            1 => Ok(CensusLevel::Tracts),
            2 => Ok(CensusLevel::Counties),
            3 => Ok(CensusLevel::TribalTracts),
            4 => Ok(CensusLevel::TribalBlockGroups),
            other => Err(CollectError::Config(format!(
                "census level must be between 0 and 4, got {other}"
            ))),
        }
    }
}

impl From<CensusLevel> for u8 {
    fn from(level: CensusLevel) -> u8 {
        match level {
            CensusLevel::BlockGroups => 0,
            CensusLevel::Tracts => 1,
            CensusLevel::Counties => 2,
            CensusLevel::TribalTracts => 3,
            CensusLevel::TribalBlockGroups => 4,
        }
    }
}

/// TIGERweb transportation layer, numbered as on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RoadLayer {
    PrimaryRoads,
    SecondaryRoads,
    LocalRoads,
    Railroads,
}

impl RoadLayer {
    pub fn name(self) -> &'static str {
        match self {
            RoadLayer::PrimaryRoads => "Primary_Roads",
            RoadLayer::SecondaryRoads => "Secondary_Roads",
            RoadLayer::LocalRoads => "Local_Roads",
            RoadLayer::Railroads => "Railroads",
        }
    }

    fn layer(self) -> u32 {
        match self {
            RoadLayer::PrimaryRoads => 2,
            RoadLayer::SecondaryRoads => 6,
            RoadLayer::LocalRoads => 7,
            RoadLayer::Railroads => 9,
        }
    }

    pub fn source(self) -> SourceDefinition {
        SourceDefinition::new(
            &format!("{TRANSPORTATION_PREFIX}{}", self.name()),
            CENSUS_URL,
            CENSUS_TRANSPORTATION_SERVICE,
            self.layer(),
            Crs::WebMercator,
        )
    }
}

impl TryFrom<u8> for RoadLayer {
    type Error = CollectError;

    fn try_from(layer: u8) -> Result<Self> {
        match layer {
            0 => Ok(RoadLayer::PrimaryRoads),
            1 => Ok(RoadLayer::SecondaryRoads),
            2 => Ok(RoadLayer::LocalRoads),
            3 => Ok(RoadLayer::Railroads),
            other => Err(CollectError::Config(format!(
                "road layer must be between 0 and 3, got {other}"
            ))),
        }
    }
}

impl From<RoadLayer> for u8 {
    fn from(layer: RoadLayer) -> u8 {
        match layer {
            RoadLayer::PrimaryRoads => 0,
            RoadLayer::SecondaryRoads => 1,
            RoadLayer::LocalRoads => 2,
            RoadLayer::Railroads => 3,
        }
    }
}

const TRANSPORTATION_PREFIX: &str = "Census_";
pub const TRANSPORTATION_FAMILY: &str = "census_transportation";

/// The geography source plus the ordered infrastructure families.
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    pub geography: SourceDefinition,
    pub families: Vec<SourceFamily>,
}

pub const AD_HOC_FAMILY: &str = "non_hifld";

impl SourceCatalog {
    pub fn new(geography: SourceDefinition, families: Vec<SourceFamily>) -> Result<Self> {
        let mut seen = HashSet::new();
        seen.insert(geography.key.clone());
        for family in &families {
            for source in &family.sources {
                if !seen.insert(source.key.clone()) {
                    return Err(CollectError::Config(format!(
                        "duplicate source key '{}'",
                        source.key
                    )));
                }
            }
        }
        Ok(Self {
            geography,
            families,
        })
    }

    pub fn builtin(level: CensusLevel, year: u16) -> Self {
        Self {
            geography: level.source(year),
            families: vec![hifld_family(), usgs_family(), non_hifld_family()],
        }
    }

    /// Replaces the ad-hoc family, or appends `family` when none exists.
    pub fn with_ad_hoc(self, family: SourceFamily) -> Result<Self> {
        let mut families: Vec<SourceFamily> = self
            .families
            .into_iter()
            .filter(|f| f.name != AD_HOC_FAMILY)
            .collect();
        families.push(family);
        Self::new(self.geography, families)
    }

    pub fn with_family(self, family: SourceFamily) -> Result<Self> {
        let mut families = self.families;
        families.push(family);
        Self::new(self.geography, families)
    }

    /// Appends the requested road and rail layers as their own family. Duplicate
    /// layers are queried once; an empty request leaves the catalog unchanged.
    pub fn with_transportation(self, layers: &[RoadLayer]) -> Result<Self> {
        let mut unique: Vec<RoadLayer> = Vec::new();
        for layer in layers {
            if !unique.contains(layer) {
                unique.push(*layer);
            }
        }
        if unique.is_empty() {
            return Ok(self);
        }
        self.with_family(SourceFamily {
            name: TRANSPORTATION_FAMILY.to_string(),
            boundary: BoundaryKind::Projected,
            key_prefix: Some(TRANSPORTATION_PREFIX.to_string()),
            sources: unique.into_iter().map(RoadLayer::source).collect(),
        })
    }

    /// Every infrastructure source with its family, in catalog order.
    pub fn entries(&self) -> impl Iterator<Item = (&SourceFamily, &SourceDefinition)> {
        self.families
            .iter()
            .flat_map(|family| family.sources.iter().map(move |source| (family, source)))
    }

    /// Number of sources including the geography source.
    pub fn len(&self) -> usize {
        1 + self.families.iter().map(|f| f.sources.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn keys(&self) -> Vec<&str> {
        std::iter::once(self.geography.key.as_str())
            .chain(self.entries().map(|(_, s)| s.key.as_str()))
            .collect()
    }
}

fn hifld_family() -> SourceFamily {
    let layers: [(&str, &str, Crs); 17] = [
        ("Transmission", "Transmission_Lines", Crs::WebMercator),
        ("Cellular_Towers", "Cellular_Towers_New", Crs::Wgs84),
        ("Banks_FDIC", "FDIC_InsuredBanks", Crs::Wgs84),
        ("Hospitals", "Hospitals_gdb", Crs::WebMercator),
        ("Public_Schools", "Public_Schools", Crs::Wgs84),
        (
            "Colleges_and_Universities_Campuses",
            "Colleges_and_Universities_Campuses",
            Crs::WebMercator,
        ),
        (
            "Local_Emergency_Operations_Centers_EOC",
            "Local_Emergency_Operations_Centers_EOC",
            Crs::WebMercator,
        ),
        ("Child_Care_Centers", "ChildCareCenter1", Crs::WebMercator),
        (
            "Veterans_Health_Administration_Medical_Facilities",
            "Veterans_Health_Administration_Medical_Facilities",
            Crs::WebMercator,
        ),
        ("Mobile_Home_Parks", "Mobile_Home_Parks", Crs::WebMercator),
        (
            "Local_Law_Enforcement_Locations",
            "Local_Law_Enforcement_Locations",
            Crs::WebMercator,
        ),
        ("Private_Schools", "Private_Schools", Crs::Wgs84),
        ("Power_Plants", "Plants_gdb", Crs::WebMercator),
        ("Nursing_Homes", "NursingHomes", Crs::Wgs84),
        ("Microwave_Service_Towers", "Microwave_Service_Towers_New", Crs::Wgs84),
        ("BRS_EBS", "brs_ebs", Crs::Wgs84),
        ("Federal_Organizations", "organizationsfederal", Crs::WebMercator),
    ];

    let sources = layers
        .iter()
        .map(|(label, service, crs)| {
            let source = SourceDefinition::new(&format!("{HIFLD_PREFIX}{label}"), HIFLD_URL, service, 0, *crs);
            if *label == "Transmission" {
                source.with_id_field("ID")
            } else {
                source
            }
        })
        .collect();

    SourceFamily {
        name: "hifld".to_string(),
        boundary: BoundaryKind::Geographic,
        key_prefix: Some(HIFLD_PREFIX.to_string()),
        sources,
    }
}

fn usgs_family() -> SourceFamily {
    let layers = [
        ("USGS_Fire_stations_EMS_stations", 16),
        ("USGS_Police_stations", 18),
        ("USGS_Hospitals_Medical_Centers", 14),
    ];
    SourceFamily {
        name: "usgs".to_string(),
        boundary: BoundaryKind::Projected,
        key_prefix: None,
        sources: layers
            .iter()
            .map(|(key, layer)| {
                SourceDefinition::new(key, USGS_STRUCTURES_URL, "structures", *layer, Crs::WebMercator)
            })
            .collect(),
    }
}

fn non_hifld_family() -> SourceFamily {
    SourceFamily {
        name: AD_HOC_FAMILY.to_string(),
        boundary: BoundaryKind::Geographic,
        key_prefix: None,
        sources: vec![
            SourceDefinition::new(
                "SNAP_Accepting_Locations",
                "https://services1.arcgis.com/RLQu0rK7h4kbsBq5/ArcGIS/rest/services",
                "snap_retailer_location_data",
                0,
                Crs::WebMercator,
            ),
            SourceDefinition::new(
                "Dialysis_Locations",
                "https://services2.arcgis.com/FiaPA4ga0iQKduv3/arcgis/rest/services",
                "Dialysis_Facilities_in_the_United_States",
                0,
                Crs::WebMercator,
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_catalog_has_unique_keys() {
        let catalog = SourceCatalog::builtin(CensusLevel::Tracts, 2022);
        let keys = catalog.keys();
        assert_eq!(keys.len(), catalog.len());
        assert_eq!(keys.len(), 1 + 17 + 3 + 2);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys[0], "Census_Tracts");
        assert_eq!(catalog.geography.service, "*ACS2022/Tracts*");
    }

    #[test]
    fn transportation_layers_form_their_own_family() {
        let catalog = SourceCatalog::builtin(CensusLevel::Tracts, 2022)
            .with_transportation(&[RoadLayer::Railroads, RoadLayer::PrimaryRoads, RoadLayer::Railroads])
            .unwrap();
        assert_eq!(catalog.len(), 1 + 17 + 3 + 2 + 2);

        let family = catalog.families.last().unwrap();
        assert_eq!(family.name, TRANSPORTATION_FAMILY);
        assert_eq!(family.boundary, BoundaryKind::Projected);
        let rail = &family.sources[0];
        assert_eq!(rail.key, "Census_Railroads");
        assert_eq!(rail.layer, 9);
        assert_eq!(rail.service, "Census2020/Transportation");
        assert_eq!(family.sector_label(rail), "Railroads");

        assert!(RoadLayer::try_from(4).is_err());
        let unchanged = SourceCatalog::builtin(CensusLevel::Tracts, 2022).with_transportation(&[]).unwrap();
        assert_eq!(unchanged.len(), 1 + 17 + 3 + 2);
    }

    #[test]
    fn strips_family_prefix_for_sector() {
        let catalog = SourceCatalog::builtin(CensusLevel::Counties, 2022);
        let (family, source) = catalog
            .entries()
            .find(|(_, s)| s.key == "HIFLD_Hospitals")
            .unwrap();
        assert_eq!(family.sector_label(source), "Hospitals");

        let (family, source) = catalog
            .entries()
            .find(|(_, s)| s.key == "USGS_Police_stations")
            .unwrap();
        assert_eq!(family.boundary, BoundaryKind::Projected);
        assert_eq!(family.sector_label(source), "USGS_Police_stations");
    }

    #[test]
    fn ad_hoc_family_replaces_builtin_one() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
name = "county"
boundary = "geographic"

[[sources]]
key = "County_Parcels"
url = "https://gis.example.org/arcgis/rest/services"
service = "Parcels*"
layer = 2
out_crs = 4326
"#
        )
        .unwrap();

        let family = SourceFamily::load_from_file(file.path()).unwrap();
        assert_eq!(family.sources[0].out_crs, Crs::Wgs84);

        let catalog = SourceCatalog::builtin(CensusLevel::Tracts, 2022)
            .with_ad_hoc(family)
            .unwrap();
        let keys = catalog.keys();
        assert!(keys.contains(&"County_Parcels"));
        assert!(!keys.contains(&"Dialysis_Locations"));
    }

    #[test]
    fn rejects_duplicate_keys_and_bad_levels() {
        let catalog = SourceCatalog::builtin(CensusLevel::Tracts, 2022);
        let dup = catalog.families[0].clone();
        assert!(matches!(catalog.with_family(dup), Err(CollectError::Config(_))));
        assert!(CensusLevel::try_from(7).is_err());
    }
}
