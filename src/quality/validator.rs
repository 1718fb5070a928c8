//! Pre-flight data quality gate for input rasters
//!
//! Every distinct input raster is streamed block by block once. A raster is
//! invalid if any block holds a non-finite value, a value that is close to
//! but not exactly the nodata sentinel, or a value of implausible magnitude.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{LARGE_VALUE_NODATA_RTOL, MAX_REPORTED_VALUES};
use crate::error::{InvalidRaster, PipelineError};
use crate::raster::RasterReader;

/// Absolute tolerance shared by every closeness test
const CLOSE_ATOL: f64 = 1e-8;

/// Why a raster failed validation, with a sample of the offending values
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidReason {
    NonFinite { values: Vec<f64> },
    NearNodata { nodata: f64, values: Vec<f64> },
    TooLarge { max_abs: f64, values: Vec<f64> },
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::NonFinite { values } => {
                write!(f, "non-finite values {values:?}")
            }
            InvalidReason::NearNodata { nodata, values } => {
                write!(f, "values close to but not equal to nodata {nodata}: {values:?}")
            }
            InvalidReason::TooLarge { max_abs, values } => {
                write!(f, "values with magnitude >= {max_abs:e}: {values:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RasterCheck {
    Valid,
    Invalid(InvalidReason),
}

/// One logical input to validate
#[derive(Debug, Clone)]
pub struct RasterInput {
    pub id: String,
    pub path: PathBuf,
}

impl RasterInput {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

pub(crate) fn is_close(value: f64, target: f64, rtol: f64) -> bool {
    (value - target).abs() <= CLOSE_ATOL + rtol * target.abs()
}

fn sample<F: Fn(f64) -> bool>(values: &[f64], pred: F) -> Vec<f64> {
    values
        .iter()
        .copied()
        .filter(|v| pred(*v))
        .take(MAX_REPORTED_VALUES)
        .collect()
}

/// Check one block of values; the first failing condition wins
pub fn detect_invalid(
    values: &[f64],
    nodata: Option<f64>,
    rel_tol: f64,
    max_abs: f64,
) -> Option<InvalidReason> {
    let non_finite = sample(values, |v| !v.is_finite());
    if !non_finite.is_empty() {
        return Some(InvalidReason::NonFinite { values: non_finite });
    }

    if let Some(nodata) = nodata {
        let near = sample(values, |v| v != nodata && is_close(v, nodata, rel_tol));
        if !near.is_empty() {
            return Some(InvalidReason::NearNodata {
                nodata,
                values: near,
            });
        }
    }

    let large = sample(values, |v| {
        v.abs() >= max_abs && !nodata.is_some_and(|nd| is_close(v, nd, LARGE_VALUE_NODATA_RTOL))
    });
    if !large.is_empty() {
        return Some(InvalidReason::TooLarge {
            max_abs,
            values: large,
        });
    }
    None
}

/// Stream `path` block by block and report the first invalid condition found
pub fn check_raster(path: &Path, rel_tol: f64, max_abs: f64) -> Result<RasterCheck> {
    let mut reader = RasterReader::open(path)?;
    let nodata = reader.info().nodata;
    for index in 0..reader.chunk_count() {
        let block = reader.read_block(index)?;
        if let Some(reason) = detect_invalid(&block.values, nodata, rel_tol, max_abs) {
            debug!(
                "{} invalid in block {} at ({}, {})",
                path.display(),
                index,
                block.col0,
                block.row0
            );
            return Ok(RasterCheck::Invalid(reason));
        }
    }
    Ok(RasterCheck::Valid)
}

/// Validate every distinct raster among `inputs`
///
/// Inputs are deduplicated by canonical path, so ids aliasing the same file
/// are checked once. Distinct rasters are checked concurrently on the
/// blocking pool. Any invalid raster fails the whole call with
/// [`PipelineError::InvalidRasters`] listing all of them. Returns the number
/// of distinct rasters checked.
pub async fn validate_inputs(inputs: &[RasterInput], rel_tol: f64, max_abs: f64) -> Result<usize> {
    let mut order: Vec<PathBuf> = Vec::new();
    let mut ids_by_path: HashMap<PathBuf, Vec<String>> = HashMap::new();
    for input in inputs {
        let canonical = tokio::fs::canonicalize(&input.path).await.with_context(|| {
            format!(
                "Input raster '{}' at {} is not accessible",
                input.id,
                input.path.display()
            )
        })?;
        let ids = ids_by_path.entry(canonical.clone()).or_default();
        if ids.is_empty() {
            order.push(canonical);
        }
        ids.push(input.id.clone());
    }

    info!("Validating {} distinct input rasters", order.len());

    let checks = order.iter().cloned().map(|path| {
        tokio::task::spawn_blocking(move || {
            let result = check_raster(&path, rel_tol, max_abs);
            (path, result)
        })
    });
    let results = futures::future::join_all(checks).await;

    let mut invalid = Vec::new();
    for joined in results {
        let (path, result) = joined.context("Validation task panicked")?;
        let ids = ids_by_path.get(&path).map(|ids| ids.join(",")).unwrap_or_default();
        match result.with_context(|| format!("Failed to validate '{}' at {}", ids, path.display()))? {
            RasterCheck::Valid => debug!("{} is valid", path.display()),
            RasterCheck::Invalid(reason) => {
                warn!("{} ({}) is invalid: {}", ids, path.display(), reason);
                invalid.push(InvalidRaster {
                    id: ids,
                    path,
                    reason,
                });
            }
        }
    }

    if !invalid.is_empty() {
        return Err(PipelineError::InvalidRasters(invalid).into());
    }
    Ok(order.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAX_ABS, DEFAULT_RELATIVE_TOLERANCE};
    use crate::raster::mosaic::tests::write_wgs84;
    use tempfile::TempDir;

    #[test]
    fn test_detect_order_non_finite_first() {
        let values = [1e35, -9999.0001, f64::NAN];
        let reason = detect_invalid(&values, Some(-9999.0), 1e-3, 1e30).unwrap();
        assert!(matches!(reason, InvalidReason::NonFinite { .. }));
    }

    #[test]
    fn test_near_nodata_but_not_exact() {
        let nodata = Some(-9999.0);
        assert!(detect_invalid(&[-9999.0, 1.0], nodata, 1e-3, 1e30).is_none());
        let reason = detect_invalid(&[-9999.0001, 1.0], nodata, 1e-3, 1e30).unwrap();
        assert_eq!(
            reason,
            InvalidReason::NearNodata {
                nodata: -9999.0,
                values: vec![-9999.0001]
            }
        );
    }

    #[test]
    fn test_large_values_close_to_nodata_are_allowed() {
        let big_nodata = Some(-3.4028234663852886e38);
        assert!(detect_invalid(&[-3.4028234663852886e38, 2.0], big_nodata, 0.0, 1e30).is_none());
        let reason = detect_invalid(&[1e35], Some(-9999.0), 1e-3, 1e30).unwrap();
        assert!(matches!(reason, InvalidReason::TooLarge { .. }));
        // no nodata declared
        assert!(detect_invalid(&[1e35], None, 1e-3, 1e30).is_some());
    }

    #[test]
    fn test_reported_values_are_capped() {
        let values = vec![f64::INFINITY; MAX_REPORTED_VALUES * 3];
        match detect_invalid(&values, None, 1e-3, 1e30).unwrap() {
            InvalidReason::NonFinite { values } => assert_eq!(values.len(), MAX_REPORTED_VALUES),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_check_raster_streams_file() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.tif");
        let bad = dir.path().join("bad.tif");
        write_wgs84(&good, 0.0, 1.0, 2, 2, &[1.0, 2.0, -9999.0, 3.0]);
        write_wgs84(&bad, 0.0, 1.0, 2, 2, &[1.0, 1e35, -9999.0, 3.0]);

        let check = check_raster(&good, DEFAULT_RELATIVE_TOLERANCE, DEFAULT_MAX_ABS).unwrap();
        assert_eq!(check, RasterCheck::Valid);
        let check = check_raster(&bad, DEFAULT_RELATIVE_TOLERANCE, DEFAULT_MAX_ABS).unwrap();
        assert!(matches!(check, RasterCheck::Invalid(InvalidReason::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_validate_inputs_dedups_and_lists_all_failures() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.tif");
        let bad_a = dir.path().join("bad_a.tif");
        let bad_b = dir.path().join("bad_b.tif");
        write_wgs84(&good, 0.0, 1.0, 1, 1, &[1.0]);
        write_wgs84(&bad_a, 0.0, 1.0, 1, 1, &[1e35]);
        write_wgs84(&bad_b, 0.0, 1.0, 1, 1, &[1e31]);

        let ok = validate_inputs(
            &[
                RasterInput::new("lulc", &good),
                RasterInput::new("lulc_alias", dir.path().join(".").join("good.tif")),
            ],
            DEFAULT_RELATIVE_TOLERANCE,
            DEFAULT_MAX_ABS,
        )
        .await
        .unwrap();
        assert_eq!(ok, 1);

        let err = validate_inputs(
            &[
                RasterInput::new("lulc", &good),
                RasterInput::new("precip", &bad_a),
                RasterInput::new("fert", &bad_b),
            ],
            DEFAULT_RELATIVE_TOLERANCE,
            DEFAULT_MAX_ABS,
        )
        .await
        .unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::InvalidRasters(list)) => {
                let ids: Vec<&str> = list.iter().map(|r| r.id.as_str()).collect();
                assert_eq!(ids, vec!["precip", "fert"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_validate_inputs_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = validate_inputs(
            &[RasterInput::new("dem", dir.path().join("nope.tif"))],
            DEFAULT_RELATIVE_TOLERANCE,
            DEFAULT_MAX_ABS,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("dem"));
    }
}
