//! Watershed discovery from GeoJSON feature collections
//!
//! Each `*.geojson` file in the watershed directory is one basin layer. A
//! feature's index within its collection is its fid, and its planar area in
//! square degrees drives the scheduling filter.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use geojson::{GeoJson, Value as GeoValue};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::PipelineError;

const VECTOR_EXTENSION: &str = "geojson";

/// One drainage basin polygon
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watershed {
    /// Vector file stem
    pub basename: String,
    pub fid: u64,
    pub vector_path: PathBuf,
    pub area_deg2: f64,
}

impl Watershed {
    pub fn watershed_id(&self) -> String {
        watershed_id(&self.basename, self.fid)
    }
}

pub fn watershed_id(basename: &str, fid: u64) -> String {
    format!("{basename}_{fid}")
}

/// Split `"<basename>_<fid>"` at its last underscore
pub fn split_watershed_id(id: &str) -> Result<(String, u64)> {
    let (basename, fid) = id
        .rsplit_once('_')
        .ok_or_else(|| anyhow!("watershed id '{}' has no '_<fid>' suffix", id))?;
    let fid = fid
        .parse::<u64>()
        .with_context(|| format!("watershed id '{}' does not end in a numeric fid", id))?;
    Ok((basename.to_string(), fid))
}

/// Source of the watersheds to schedule
#[async_trait]
pub trait WatershedCatalog: Send + Sync {
    /// Every watershed, in a stable order
    async fn watersheds(&self) -> Result<Vec<Watershed>>;

    /// Look up the watersheds named by `ids`
    ///
    /// Unknown ids are reported as [`crate::error::PipelineError::WatershedNotFound`].
    async fn resolve(&self, ids: &[String]) -> Result<Vec<Watershed>> {
        let all = self.watersheds().await?;
        ids.iter()
            .map(|id| {
                all.iter()
                    .find(|w| &w.watershed_id() == id)
                    .cloned()
                    .ok_or_else(|| PipelineError::WatershedNotFound(id.clone()).into())
            })
            .collect()
    }
}

/// Catalog backed by a directory of GeoJSON files
#[derive(Debug, Clone)]
pub struct GeoJsonCatalog {
    dir: PathBuf,
}

impl GeoJsonCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn vector_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list watershed directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == VECTOR_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl WatershedCatalog for GeoJsonCatalog {
    async fn watersheds(&self) -> Result<Vec<Watershed>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut all = Vec::new();
            for path in catalog.vector_files()? {
                let found = read_watersheds(&path)?;
                debug!("{}: {} features", path.display(), found.len());
                all.extend(found);
            }
            info!("Found {} watersheds in {}", all.len(), catalog.dir.display());
            Ok(all)
        })
        .await
        .context("Watershed discovery task panicked")?
    }

    /// Reads only the files the ids name
    async fn resolve(&self, ids: &[String]) -> Result<Vec<Watershed>> {
        let dir = self.dir.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut by_file: HashMap<String, Vec<Watershed>> = HashMap::new();
            let mut resolved = Vec::with_capacity(ids.len());
            for id in &ids {
                let (basename, fid) = split_watershed_id(id)?;
                let path = dir.join(format!("{basename}.{VECTOR_EXTENSION}"));
                if !by_file.contains_key(&basename) {
                    let found = if path.exists() {
                        read_watersheds(&path)?
                    } else {
                        Vec::new()
                    };
                    by_file.insert(basename.clone(), found);
                }
                let watershed = by_file
                    .get(&basename)
                    .and_then(|found| found.iter().find(|w| w.fid == fid))
                    .cloned()
                    .ok_or_else(|| PipelineError::WatershedNotFound(id.clone()))?;
                resolved.push(watershed);
            }
            Ok(resolved)
        })
        .await
        .context("Watershed lookup task panicked")?
    }
}

/// Read every feature of one GeoJSON file
pub fn read_watersheds(path: &Path) -> Result<Vec<Watershed>> {
    let basename = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let geojson: GeoJson = text
        .parse()
        .with_context(|| format!("{} is not valid GeoJSON", path.display()))?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        bail!("{} is not a GeoJSON feature collection", path.display());
    };

    Ok(collection
        .features
        .iter()
        .enumerate()
        .map(|(fid, feature)| Watershed {
            basename: basename.clone(),
            fid: fid as u64,
            vector_path: path.to_path_buf(),
            area_deg2: feature
                .geometry
                .as_ref()
                .map_or(0.0, |geometry| geometry_area(&geometry.value)),
        })
        .collect())
}

/// Planar area in square degrees; points and lines have none
fn geometry_area(value: &GeoValue) -> f64 {
    match value {
        GeoValue::Polygon(rings) => polygon_area(rings),
        GeoValue::MultiPolygon(polygons) => polygons.iter().map(|rings| polygon_area(rings)).sum(),
        GeoValue::GeometryCollection(geometries) => {
            geometries.iter().map(|g| geometry_area(&g.value)).sum()
        }
        _ => 0.0,
    }
}

/// Shell area minus hole areas
fn polygon_area(rings: &[Vec<Vec<f64>>]) -> f64 {
    let mut rings = rings.iter();
    let Some(shell) = rings.next() else {
        return 0.0;
    };
    let holes: f64 = rings.map(|ring| ring_area(ring)).sum();
    (ring_area(shell) - holes).max(0.0)
}

/// Unsigned shoelace area of a ring
fn ring_area(ring: &[Vec<f64>]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..ring.len() {
        let a = &ring[i];
        let b = &ring[(i + 1) % ring.len()];
        if a.len() < 2 || b.len() < 2 {
            continue;
        }
        twice += a[0] * b[1] - b[0] * a[1];
    }
    (twice / 2.0).abs()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geojson::{Feature, FeatureCollection, Geometry};
    use tempfile::TempDir;

    fn feature(value: Option<GeoValue>) -> Feature {
        Feature {
            bbox: None,
            geometry: value.map(Geometry::new),
            id: None,
            properties: None,
            foreign_members: None,
        }
    }

    fn ring(west: f64, south: f64, east: f64, north: f64) -> Vec<Vec<f64>> {
        vec![
            vec![west, south],
            vec![east, south],
            vec![east, north],
            vec![west, north],
            vec![west, south],
        ]
    }

    /// Square with the given edge length (degrees), anchored at `(west, south)`
    pub(crate) fn square(west: f64, south: f64, edge: f64) -> Feature {
        feature(Some(GeoValue::Polygon(vec![ring(
            west,
            south,
            west + edge,
            south + edge,
        )])))
    }

    pub(crate) fn write_collection(path: &Path, features: Vec<Feature>) {
        let collection = FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        std::fs::write(path, GeoJson::FeatureCollection(collection).to_string()).unwrap();
    }

    #[test]
    fn test_watershed_id_round_trip() {
        assert_eq!(watershed_id("af_bas_15s", 42), "af_bas_15s_42");
        assert_eq!(
            split_watershed_id("af_bas_15s_42").unwrap(),
            ("af_bas_15s".to_string(), 42)
        );
        assert!(split_watershed_id("nofid").is_err());
        assert!(split_watershed_id("basin_x").is_err());
    }

    #[test]
    fn test_areas_with_holes_and_multipolygons() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("basins.geojson");
        let holed = feature(Some(GeoValue::Polygon(vec![
            ring(0.0, 0.0, 2.0, 2.0),
            ring(0.5, 0.5, 1.5, 1.5),
        ])));
        let multi = feature(Some(GeoValue::MultiPolygon(vec![
            vec![ring(0.0, 0.0, 1.0, 1.0)],
            vec![ring(5.0, 5.0, 6.0, 7.0)],
        ])));
        write_collection(&path, vec![holed, multi, feature(None)]);

        let found = read_watersheds(&path).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].watershed_id(), "basins_0");
        assert!((found[0].area_deg2 - 3.0).abs() < 1e-12);
        assert!((found[1].area_deg2 - 3.0).abs() < 1e-12);
        assert_eq!(found[2].area_deg2, 0.0);
    }

    #[test]
    fn test_collections_and_non_areal_geometries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.geojson");
        std::fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"name": "outlet"},
                 "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}},
                {"type": "Feature", "properties": null,
                 "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]}},
                {"type": "Feature", "properties": null,
                 "geometry": {"type": "GeometryCollection", "geometries": [
                    {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]]},
                    {"type": "Point", "coordinates": [3.0, 3.0]}
                 ]}}
            ]}"#,
        )
        .unwrap();

        let found = read_watersheds(&path).unwrap();
        let areas: Vec<f64> = found.iter().map(|w| w.area_deg2).collect();
        assert_eq!(areas, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_non_collection_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("single.geojson");
        std::fs::write(&path, r#"{"type": "Point", "coordinates": [1.0, 2.0]}"#).unwrap();
        let err = read_watersheds(&path).unwrap_err();
        assert!(err.to_string().contains("not a GeoJSON feature collection"));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(read_watersheds(&path).is_err());
    }

    #[tokio::test]
    async fn test_catalog_lists_sorted_files_and_resolves() {
        let dir = TempDir::new().unwrap();
        write_collection(&dir.path().join("b.geojson"), vec![square(0.0, 0.0, 0.1)]);
        write_collection(
            &dir.path().join("a.geojson"),
            vec![square(0.0, 0.0, 0.01), square(1.0, 1.0, 0.02)],
        );
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = GeoJsonCatalog::new(dir.path());
        let ids: Vec<String> = catalog
            .watersheds()
            .await
            .unwrap()
            .iter()
            .map(Watershed::watershed_id)
            .collect();
        assert_eq!(ids, vec!["a_0", "a_1", "b_0"]);

        let resolved = catalog.resolve(&["b_0".to_string()]).await.unwrap();
        assert_eq!(resolved[0].basename, "b");
        let err = catalog.resolve(&["c_0".to_string()]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::PipelineError>(),
            Some(crate::error::PipelineError::WatershedNotFound(_))
        ));
    }
}
