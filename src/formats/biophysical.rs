//! Biophysical parameter tables
//!
//! A CSV keyed by a land-use code column whose name varies per table. Only
//! `eff_n` and `load_n` are read. Blank cells read as 0 and a `load_n` of
//! `use raster` becomes [`USE_AG_LOAD_ID`].

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::config::USE_AG_LOAD_ID;

const EFFICIENCY_FIELD: &str = "eff_n";
const LOAD_FIELD: &str = "load_n";
const USE_RASTER: &str = "use raster";

/// Land-use code to nitrogen efficiency and base load
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LookupTables {
    pub efficiency: BTreeMap<i64, f64>,
    pub load: BTreeMap<i64, f64>,
}

fn parse_number(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| anyhow!("'{}' is not a number", trimmed))
}

fn parse_code(raw: &str) -> Result<i64> {
    let value = parse_number(raw)?;
    if value.fract() != 0.0 {
        bail!("land-use code '{}' is not an integer", raw.trim());
    }
    Ok(value as i64)
}

impl LookupTables {
    pub fn load(path: &Path, lulc_field: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open biophysical table {}", path.display()))?;
        Self::from_reader(file, lulc_field)
            .with_context(|| format!("Failed to parse biophysical table {}", path.display()))
    }

    pub fn from_reader<R: std::io::Read>(reader: R, lulc_field: &str) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader.headers().context("Failed to read header row")?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| anyhow!("missing column '{}'", name))
        };
        let code_col = column(lulc_field)?;
        let eff_col = column(EFFICIENCY_FIELD)?;
        let load_col = column(LOAD_FIELD)?;

        let mut tables = LookupTables::default();
        for (line, result) in csv_reader.records().enumerate() {
            let record = result.context("Failed to parse CSV record")?;
            let field = |idx: usize| record.get(idx).unwrap_or("");
            let row = line + 2;

            let code = parse_code(field(code_col)).with_context(|| format!("row {row}"))?;
            let efficiency = parse_number(field(eff_col)).with_context(|| format!("row {row}"))?;
            let load = if field(load_col).eq_ignore_ascii_case(USE_RASTER) {
                USE_AG_LOAD_ID as f64
            } else {
                parse_number(field(load_col)).with_context(|| format!("row {row}"))?
            };

            tables.efficiency.insert(code, efficiency);
            tables.load.insert(code, load);
        }
        debug!("Loaded {} land-use codes", tables.efficiency.len());
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blanks_and_use_raster() {
        let csv = "lucode,description,eff_n,load_n\n\
                   1,forest,0.8,2.5\n\
                   2,crop,0.5,use raster\n\
                   3.0,water,,\n";
        let tables = LookupTables::from_reader(csv.as_bytes(), "lucode").unwrap();
        assert_eq!(tables.efficiency.get(&1), Some(&0.8));
        assert_eq!(tables.load.get(&1), Some(&2.5));
        assert_eq!(tables.load.get(&2), Some(&999.0));
        assert_eq!(tables.efficiency.get(&3), Some(&0.0));
        assert_eq!(tables.load.get(&3), Some(&0.0));
    }

    #[test]
    fn test_missing_column_and_bad_values() {
        let err = LookupTables::from_reader("id,eff_n,load_n\n1,1,1\n".as_bytes(), "lucode")
            .unwrap_err();
        assert!(err.to_string().contains("lucode"));

        let err = LookupTables::from_reader("lucode,eff_n,load_n\n1,high,1\n".as_bytes(), "lucode")
            .unwrap_err();
        assert!(format!("{err:#}").contains("high"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bio.csv");
        std::fs::write(&path, "ID,eff_n,load_n\n10,0.1,4\n").unwrap();
        let tables = LookupTables::load(&path, "ID").unwrap();
        assert_eq!(tables.load.get(&10), Some(&4.0));
        assert!(LookupTables::load(&dir.path().join("none.csv"), "ID").is_err());
    }
}
