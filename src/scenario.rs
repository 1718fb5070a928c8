//! Scenario bundles and the merged, immutable scenario set
//!
//! A bundle is a JSON file naming input rasters, biophysical tables, rasters
//! that need scrubbing and the scenarios built from them. Bundles are merged
//! once, before anything is scheduled, and the result is never mutated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BiophysicalTableRef {
    pub path: PathBuf,
    /// Column holding the land-use code
    pub lulc_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDefinition {
    pub lulc_id: String,
    pub precip_id: String,
    pub fertilizer_id: String,
    pub biophysical_table_id: String,
}

impl ScenarioDefinition {
    pub fn raster_ids(&self) -> [&str; 3] {
        [&self.lulc_id, &self.precip_id, &self.fertilizer_id]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioBundle {
    #[serde(default)]
    pub rasters: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub biophysical_tables: BTreeMap<String, BiophysicalTableRef>,
    #[serde(default)]
    pub scrub_ids: BTreeSet<String>,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioDefinition>,
}

impl ScenarioBundle {
    /// Load a bundle, resolving relative paths against the bundle's directory
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario bundle {}", path.display()))?;
        let mut bundle: ScenarioBundle = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scenario bundle {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for raster in bundle.rasters.values_mut() {
            if raster.is_relative() {
                *raster = base.join(&*raster);
            }
        }
        for table in bundle.biophysical_tables.values_mut() {
            if table.path.is_relative() {
                table.path = base.join(&table.path);
            }
        }
        debug!(
            "Loaded bundle {}: {} rasters, {} scenarios",
            path.display(),
            bundle.rasters.len(),
            bundle.scenarios.len()
        );
        Ok(bundle)
    }
}

/// All scenarios of a run with every reference resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioSet {
    rasters: BTreeMap<String, PathBuf>,
    biophysical_tables: BTreeMap<String, BiophysicalTableRef>,
    scrub_ids: BTreeSet<String>,
    scenarios: BTreeMap<String, ScenarioDefinition>,
}

fn merge_map<V: PartialEq>(target: &mut BTreeMap<String, V>, source: BTreeMap<String, V>, kind: &str) {
    for (id, value) in source {
        if let Some(previous) = target.get(&id)
            && *previous != value
        {
            warn!("{} '{}' redefined by a later bundle", kind, id);
        }
        target.insert(id, value);
    }
}

impl ScenarioSet {
    /// Merge `bundles` in order and keep only the scenarios named in `filter`
    ///
    /// Later bundles override earlier definitions of the same id. Every
    /// scenario left after filtering must resolve all its references.
    pub fn merge(bundles: Vec<ScenarioBundle>, filter: Option<&[String]>) -> Result<Self> {
        let mut set = ScenarioSet::default();
        for bundle in bundles {
            merge_map(&mut set.rasters, bundle.rasters, "raster");
            merge_map(&mut set.biophysical_tables, bundle.biophysical_tables, "biophysical table");
            merge_map(&mut set.scenarios, bundle.scenarios, "scenario");
            set.scrub_ids.extend(bundle.scrub_ids);
        }

        if let Some(names) = filter {
            for name in names {
                if !set.scenarios.contains_key(name) {
                    return Err(PipelineError::UnknownInput {
                        kind: "scenario",
                        id: name.clone(),
                    }
                    .into());
                }
            }
            set.scenarios.retain(|name, _| names.contains(name));
        }

        set.check_references()?;
        Ok(set)
    }

    fn check_references(&self) -> Result<()> {
        for definition in self.scenarios.values() {
            for id in definition.raster_ids() {
                self.raster_path(id)?;
            }
            self.biophysical_table(&definition.biophysical_table_id)?;
        }
        for id in &self.scrub_ids {
            self.raster_path(id)?;
        }
        Ok(())
    }

    pub fn scenarios(&self) -> impl Iterator<Item = (&str, &ScenarioDefinition)> {
        self.scenarios.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn scenario_ids(&self) -> Vec<String> {
        self.scenarios.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn raster_path(&self, id: &str) -> Result<&Path> {
        self.rasters.get(id).map(PathBuf::as_path).ok_or_else(|| {
            PipelineError::UnknownInput {
                kind: "raster",
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn biophysical_table(&self, id: &str) -> Result<&BiophysicalTableRef> {
        self.biophysical_tables.get(id).ok_or_else(|| {
            PipelineError::UnknownInput {
                kind: "biophysical table",
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn scrub_ids(&self) -> &BTreeSet<String> {
        &self.scrub_ids
    }

    /// Every raster of the merged bundles, in id order
    ///
    /// Includes rasters no selected scenario uses.
    pub fn rasters(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.rasters.iter().map(|(id, path)| (id.as_str(), path.as_path()))
    }

    /// Copy of this set with some raster ids pointing at new files
    pub fn with_raster_paths(&self, replacements: &BTreeMap<String, PathBuf>) -> Self {
        let mut next = self.clone();
        for (id, path) in replacements {
            if let Some(slot) = next.rasters.get_mut(id) {
                *slot = path.clone();
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(json: serde_json::Value) -> ScenarioBundle {
        serde_json::from_value(json).unwrap()
    }

    fn baseline() -> ScenarioBundle {
        bundle(serde_json::json!({
            "rasters": {"lulc": "/data/lulc.tif", "precip": "/data/precip.tif", "fert": "/data/fert.tif"},
            "biophysical_tables": {"bio": {"path": "/data/bio.csv", "lulc_field": "ID"}},
            "scenarios": {
                "baseline": {"lulc_id": "lulc", "precip_id": "precip", "fertilizer_id": "fert", "biophysical_table_id": "bio"}
            }
        }))
    }

    fn bundle_with_future() -> ScenarioBundle {
        bundle(serde_json::json!({
            "rasters": {"lulc": "/other/lulc.tif", "lulc_future": "/data/future.tif"},
            "scrub_ids": ["precip"],
            "scenarios": {
                "future": {"lulc_id": "lulc_future", "precip_id": "precip", "fertilizer_id": "fert", "biophysical_table_id": "bio"}
            }
        }))
    }

    #[test]
    fn test_later_bundles_override() {
        let set = ScenarioSet::merge(vec![baseline(), bundle_with_future()], None).unwrap();
        assert_eq!(set.scenario_ids(), vec!["baseline", "future"]);
        assert_eq!(set.raster_path("lulc").unwrap(), Path::new("/other/lulc.tif"));
        assert!(set.scrub_ids().contains("precip"));
        let ids: Vec<&str> = set.rasters().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["fert", "lulc", "lulc_future", "precip"]);

        let filtered =
            ScenarioSet::merge(vec![baseline(), bundle_with_future()], Some(&["baseline".to_string()]))
                .unwrap();
        assert_eq!(filtered.scenario_ids(), vec!["baseline"]);
        assert_eq!(filtered.rasters().count(), 4);
    }

    #[test]
    fn test_filter_and_unknown_references() {
        let set = ScenarioSet::merge(vec![baseline()], Some(&["baseline".to_string()])).unwrap();
        assert_eq!(set.scenario_ids().len(), 1);

        let err = ScenarioSet::merge(vec![baseline()], Some(&["nope".to_string()])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::UnknownInput { kind: "scenario", .. })
        ));

        let broken = bundle(serde_json::json!({
            "scenarios": {
                "x": {"lulc_id": "missing", "precip_id": "precip", "fertilizer_id": "fert", "biophysical_table_id": "bio"}
            }
        }));
        let err = ScenarioSet::merge(vec![baseline(), broken], None).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{"rasters": {"lulc": "inputs/lulc.tif"},
                "biophysical_tables": {"bio": {"path": "bio.csv", "lulc_field": "lucode"}}}"#,
        )
        .unwrap();
        let loaded = ScenarioBundle::load(&path).unwrap();
        assert_eq!(loaded.rasters["lulc"], dir.path().join("inputs/lulc.tif"));
        assert_eq!(loaded.biophysical_tables["bio"].path, dir.path().join("bio.csv"));

        std::fs::write(&path, r#"{"ecoshards": {}}"#).unwrap();
        assert!(ScenarioBundle::load(&path).is_err());
    }

    #[test]
    fn test_with_raster_paths_leaves_original_untouched() {
        let set = ScenarioSet::merge(vec![baseline()], None).unwrap();
        let mut replacements = BTreeMap::new();
        replacements.insert("precip".to_string(), PathBuf::from("/ws/scrubbed/precip.tif"));
        let scrubbed = set.with_raster_paths(&replacements);
        assert_eq!(scrubbed.raster_path("precip").unwrap(), Path::new("/ws/scrubbed/precip.tif"));
        assert_eq!(set.raster_path("precip").unwrap(), Path::new("/data/precip.tif"));
    }
}
