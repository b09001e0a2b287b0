use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Collected,
    Empty,
    Unavailable,
    Failed,
    Cancelled,
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerStatus::Collected => "collected",
            LedgerStatus::Empty => "empty",
            LedgerStatus::Unavailable => "unavailable",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one source in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub source: String,
    /// Seconds spent querying, retries included.
    pub query_time: Option<f64>,
    pub status: LedgerStatus,
    pub count: Option<usize>,
    pub geojson: Option<PathBuf>,
    pub gpkg: Option<PathBuf>,
    pub kml: Option<PathBuf>,
    pub error: Option<String>,
}

impl LedgerEntry {
    pub fn new(source: impl Into<String>, status: LedgerStatus) -> Self {
        Self {
            source: source.into(),
            query_time: None,
            status,
            count: None,
            geojson: None,
            gpkg: None,
            kml: None,
            error: None,
        }
    }

    pub fn empty(source: impl Into<String>, query_time: f64) -> Self {
        Self {
            query_time: Some(query_time),
            count: Some(0),
            ..Self::new(source, LedgerStatus::Empty)
        }
    }

    pub fn failed(source: impl Into<String>, status: LedgerStatus, query_time: Option<f64>, error: impl ToString) -> Self {
        Self {
            query_time,
            error: Some(error.to_string()),
            ..Self::new(source, status)
        }
    }
}

/// Per-source entries in catalog order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Orders `entries` by the position of their source in `order`. Entries for
    /// unknown sources go last, in arrival order.
    pub fn assemble(order: &[&str], mut entries: Vec<LedgerEntry>) -> Self {
        let position: HashMap<&str, usize> = order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        entries.sort_by_key(|e| position.get(e.source.as_str()).copied().unwrap_or(usize::MAX));
        Self { entries }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, source: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.source == source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_status(&self, status: LedgerStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(path)?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let entries = reader
            .deserialize()
            .collect::<std::result::Result<Vec<LedgerEntry>, csv::Error>>()?;
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_catalog_not_arrival() {
        let order = ["Census_Tracts", "HIFLD_Hospitals", "USGS_Police_stations"];
        let entries = vec![
            LedgerEntry::empty("USGS_Police_stations", 0.4),
            LedgerEntry::failed("HIFLD_Hospitals", LedgerStatus::Unavailable, Some(2.0), "timeout"),
            LedgerEntry::new("Census_Tracts", LedgerStatus::Collected),
        ];
        let ledger = Ledger::assemble(&order, entries);
        let keys: Vec<&str> = ledger.entries().iter().map(|e| e.source.as_str()).collect();
        assert_eq!(keys, order.to_vec());
        assert_eq!(ledger.count_status(LedgerStatus::Unavailable), 1);
    }

    #[test]
    fn csv_round_trip_keeps_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query_result.csv");
        let mut collected = LedgerEntry::new("HIFLD_Hospitals", LedgerStatus::Collected);
        collected.count = Some(3);
        collected.query_time = Some(1.25);
        collected.geojson = Some(PathBuf::from("out/geojson/HIFLD_Hospitals.geojson"));
        let ledger = Ledger::assemble(&[], vec![collected, LedgerEntry::empty("Dialysis_Locations", 0.5)]);
        ledger.write_csv(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("source,query_time,status,count,geojson,gpkg,kml,error"));
        assert!(text.contains("Dialysis_Locations,0.5,empty,0,,,,"));

        let back = Ledger::read_csv(&path).unwrap();
        assert_eq!(back, ledger);
    }
}
