use super::kml::{self, KmlOptions};
use crate::artifact::{self, ArtifactFormat};
use crate::error::{CollectError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Optional secondary formats derived from a primary artifact. Each stage reads
/// the newest artifact produced so far and writes a new file next to its peers.
#[derive(Debug, Clone, Default)]
pub struct FormatChain {
    gpkg_dir: Option<PathBuf>,
    overlay: Option<(ArtifactFormat, PathBuf)>,
}

/// Paths produced by one run of the chain and the stages that failed.
#[derive(Debug, Default)]
pub struct ChainOutput {
    pub gpkg: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
    pub failures: Vec<(ArtifactFormat, CollectError)>,
}

impl ChainOutput {
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|(format, e)| format!("{}: {}", format.extension(), e))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl FormatChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gpkg(mut self, dir: impl Into<PathBuf>) -> Self {
        self.gpkg_dir = Some(dir.into());
        self
    }

    pub fn with_kml(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overlay = Some((ArtifactFormat::Kml, dir.into()));
        self
    }

    pub fn with_kmz(mut self, dir: impl Into<PathBuf>) -> Self {
        self.overlay = Some((ArtifactFormat::Kmz, dir.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gpkg_dir.is_none() && self.overlay.is_none()
    }

    /// Runs every requested stage. Stage failures are collected, never returned.
    pub fn run(&self, primary: &Path, overlay: &KmlOptions) -> ChainOutput {
        let mut output = ChainOutput::default();
        let mut latest = primary.to_path_buf();

        if let Some(dir) = &self.gpkg_dir {
            let target = artifact::derived_path(primary, dir, ArtifactFormat::GeoPackage);
            match convert(&latest, &target) {
                Ok(()) => {
                    info!("wrote {}", target.display());
                    latest = target.clone();
                    output.gpkg = Some(target);
                }
                Err(e) => {
                    warn!("GeoPackage export of {} failed: {}", primary.display(), e);
                    output.failures.push((ArtifactFormat::GeoPackage, e));
                }
            }
        }

        if let Some((format, dir)) = &self.overlay {
            let target = artifact::derived_path(primary, dir, *format);
            match artifact::read_table(&latest).and_then(|t| kml::write_kml(&t, &target, overlay)) {
                Ok(()) => {
                    info!("wrote {}", target.display());
                    output.overlay = Some(target);
                }
                Err(e) => {
                    warn!("{} export of {} failed: {}", format.extension(), latest.display(), e);
                    output.failures.push((*format, e));
                }
            }
        }

        output
    }
}

fn convert(from: &Path, to: &Path) -> Result<()> {
    let table = artifact::read_table(from)?;
    artifact::write_table(&table, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Feature, FeatureTable};
    use crate::geometry::Crs;
    use geo::{line_string, point};
    use std::fs;

    fn write_primary(dir: &Path, table: &FeatureTable) -> PathBuf {
        let path = dir.join("geojson").join("HIFLD_Hospitals.geojson");
        artifact::write_table(table, &path).unwrap();
        path
    }

    #[test]
    fn runs_requested_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FeatureTable::new(Crs::WebMercator);
        table.push(Feature::new(point!(x: -11_870_000.0, y: 4_180_000.0)).with_property("NAME", "a"));
        let primary = write_primary(dir.path(), &table);
        let before = fs::read(&primary).unwrap();

        let chain = FormatChain::new()
            .with_gpkg(dir.path().join("gpkg"))
            .with_kml(dir.path().join("kml"));
        let output = chain.run(&primary, &KmlOptions { name: "HIFLD_Hospitals".into(), ..Default::default() });

        assert!(output.failures.is_empty());
        assert_eq!(output.gpkg, Some(dir.path().join("gpkg").join("HIFLD_Hospitals.gpkg")));
        assert_eq!(output.overlay, Some(dir.path().join("kml").join("HIFLD_Hospitals.kml")));
        assert_eq!(fs::read(&primary).unwrap(), before);
    }

    #[test]
    fn overlay_failure_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = FeatureTable::new(Crs::Wgs84);
        table.push(Feature::new(point!(x: 0.0, y: 0.0)));
        table.push(Feature::new(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]));
        let primary = write_primary(dir.path(), &table);

        let output = FormatChain::new()
            .with_kmz(dir.path().join("kml"))
            .run(&primary, &KmlOptions::default());
        assert_eq!(output.overlay, None);
        assert_eq!(output.failures.len(), 1);
        assert!(output.failure_summary().unwrap().starts_with("kmz:"));
    }
}
