//! Write cleaned copies of configured input rasters
//!
//! Cells that would fail validation are replaced by the nodata value. The
//! copy streams band by band, so memory stays bounded by one chunk row.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::validator::is_close;
use crate::config::LARGE_VALUE_NODATA_RTOL;
use crate::error::PipelineError;
use crate::raster::geotiff::{ImageLayer, write_geotiff};
use crate::raster::{RasterReader, RasterSpec};

/// Smallest band read per strip
const MIN_ROWS_PER_STRIP: u32 = 16;

/// Number of cells replaced, by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubCounts {
    pub non_finite: u64,
    pub large: u64,
    pub near_nodata: u64,
}

impl ScrubCounts {
    pub fn total(&self) -> u64 {
        self.non_finite + self.large + self.near_nodata
    }
}

fn config_error(path: &Path, reason: impl Into<String>) -> anyhow::Error {
    PipelineError::ScrubConfig {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

/// Canonical form of a path that may not exist yet
fn resolve(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(fs::canonicalize(path)?);
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => fs::canonicalize(p)?,
        _ => std::env::current_dir()?,
    };
    Ok(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}

/// Replace invalid cells in `values` with `nodata`, counting only real changes
pub fn scrub_values(values: &mut [f64], nodata: f64, rel_tol: f64, max_abs: f64, counts: &mut ScrubCounts) {
    for v in values.iter_mut() {
        if !v.is_finite() {
            if !(v.is_nan() && nodata.is_nan()) {
                counts.non_finite += 1;
            }
            *v = nodata;
        } else if v.abs() >= max_abs && !is_close(*v, nodata, LARGE_VALUE_NODATA_RTOL) {
            counts.large += 1;
            *v = nodata;
        } else if *v != nodata && is_close(*v, nodata, rel_tol) {
            counts.near_nodata += 1;
            *v = nodata;
        }
    }
}

/// Copy `base` to `target`, replacing invalid cells with nodata
///
/// The nodata value comes from `target_nodata` or, failing that, from the
/// source. If both are declared they must agree. `base` and `target` must not
/// refer to the same file.
pub fn scrub_raster(
    base: &Path,
    target: &Path,
    target_nodata: Option<f64>,
    rel_tol: f64,
    max_abs: f64,
) -> Result<ScrubCounts> {
    let base_resolved =
        resolve(base).with_context(|| format!("Scrub source {} is not accessible", base.display()))?;
    let target_resolved =
        resolve(target).with_context(|| format!("Scrub target {} is not accessible", target.display()))?;
    if base_resolved == target_resolved {
        return Err(config_error(base, "source and target are the same file"));
    }

    let mut reader = RasterReader::open(base)?;
    let info = reader.info().clone();
    let nodata = match (info.nodata, target_nodata) {
        (None, None) => {
            return Err(config_error(
                base,
                "neither the source nor the target declares a nodata value",
            ));
        }
        (Some(source), Some(requested)) if source != requested && !(source.is_nan() && requested.is_nan()) => {
            return Err(config_error(
                base,
                format!("source nodata {source} does not match requested nodata {requested}"),
            ));
        }
        (_, Some(requested)) => requested,
        (Some(source), None) => source,
    };
    let crs = info
        .crs
        .with_context(|| format!("{} has no supported coordinate reference system", base.display()))?;

    let spec = RasterSpec {
        width: info.width,
        height: info.height,
        transform: info.transform,
        crs,
        nodata: Some(nodata),
        sample: info.sample,
    };
    let rows_per_strip = reader.chunk_height().max(MIN_ROWS_PER_STRIP);

    let mut counts = ScrubCounts::default();
    {
        let counts = &mut counts;
        let reader = &mut reader;
        let layer = ImageLayer {
            spec,
            reduced: false,
            rows_per_strip,
            source: Box::new(move |row0, nrows| {
                let mut band = reader.read_rows(row0, nrows)?;
                scrub_values(&mut band, nodata, rel_tol, max_abs, counts);
                Ok(band)
            }),
        };
        write_geotiff(target, vec![layer])
            .with_context(|| format!("Failed to write scrubbed copy {}", target.display()))?;
    }

    if counts.total() > 0 {
        warn!(
            "Scrubbed {} into {}: {} non-finite, {} too large, {} near nodata cells set to {}",
            base.display(),
            target.display(),
            counts.non_finite,
            counts.large,
            counts.near_nodata,
            nodata
        );
    } else {
        info!("{} is clean", base.display());
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAX_ABS, DEFAULT_RELATIVE_TOLERANCE};
    use crate::raster::{Crs, GeoTransform, SampleType, write_raster};
    use tempfile::TempDir;

    fn write_f64(path: &Path, nodata: Option<f64>, values: &[f64]) {
        let spec = RasterSpec {
            width: values.len() as u32,
            height: 1,
            transform: GeoTransform::new(0.0, 1.0, 1.0, -1.0),
            crs: Crs::Wgs84,
            nodata,
            sample: SampleType::F64,
        };
        write_raster(path, &spec, values).unwrap();
    }

    #[test]
    fn test_scrub_replaces_each_condition_and_counts() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.tif");
        let target = dir.path().join("clean.tif");
        write_f64(
            &base,
            Some(-9999.0),
            &[1.0, f64::INFINITY, 1e35, -9999.0001, -9999.0, f64::NAN],
        );

        let counts = scrub_raster(&base, &target, None, DEFAULT_RELATIVE_TOLERANCE, DEFAULT_MAX_ABS)
            .unwrap();
        assert_eq!(
            counts,
            ScrubCounts {
                non_finite: 2,
                large: 1,
                near_nodata: 1
            }
        );

        let mut reader = RasterReader::open(&target).unwrap();
        assert_eq!(reader.info().nodata, Some(-9999.0));
        assert_eq!(
            reader.read_all().unwrap(),
            vec![1.0, -9999.0, -9999.0, -9999.0, -9999.0, -9999.0]
        );
    }

    #[test]
    fn test_scrubbed_values_pass_validation_with_huge_nodata() {
        let nodata = -3.4028234663852886e38;
        let near_sentinel = nodata * (1.0 + LARGE_VALUE_NODATA_RTOL / 2.0);
        let mut values = vec![near_sentinel, 1e35, 2.0];
        let mut counts = ScrubCounts::default();
        scrub_values(&mut values, nodata, 0.0, DEFAULT_MAX_ABS, &mut counts);

        assert_eq!(counts.large, 1);
        assert_eq!(values, vec![near_sentinel, nodata, 2.0]);
        assert!(
            crate::quality::validator::detect_invalid(&values, Some(nodata), 0.0, DEFAULT_MAX_ABS)
                .is_none()
        );
    }

    #[test]
    fn test_clean_raster_reports_zero() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.tif");
        write_f64(&base, None, &[1.0, 2.0]);
        let counts = scrub_raster(
            &base,
            &dir.path().join("clean.tif"),
            Some(-1.0),
            DEFAULT_RELATIVE_TOLERANCE,
            DEFAULT_MAX_ABS,
        )
        .unwrap();
        assert_eq!(counts.total(), 0);
    }

    #[test]
    fn test_configuration_errors() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.tif");
        write_f64(&base, Some(-9999.0), &[1.0]);

        let same = scrub_raster(&base, &base, None, 1e-3, 1e30).unwrap_err();
        assert!(matches!(
            same.downcast_ref::<PipelineError>(),
            Some(PipelineError::ScrubConfig { .. })
        ));

        let mismatch =
            scrub_raster(&base, &dir.path().join("t.tif"), Some(-1.0), 1e-3, 1e30).unwrap_err();
        assert!(mismatch.to_string().contains("does not match"));

        let bare = dir.path().join("bare.tif");
        write_f64(&bare, None, &[1.0]);
        let missing = scrub_raster(&bare, &dir.path().join("t2.tif"), None, 1e-3, 1e30).unwrap_err();
        assert!(missing.to_string().contains("nodata"));
    }
}
