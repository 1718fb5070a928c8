//! Typed fatal errors
//!
//! Most code propagates `anyhow::Error`; the conditions below abort a run and
//! are kept as distinct types so callers (and tests) can downcast to them.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::quality::InvalidReason;

/// A raster that failed the pre-flight data quality check
#[derive(Debug, Clone)]
pub struct InvalidRaster {
    pub id: String,
    pub path: PathBuf,
    pub reason: InvalidReason,
}

impl fmt::Display for InvalidRaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.id, self.path.display(), self.reason)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{} input raster(s) failed validation:\n{}", .0.len(), format_invalid(.0))]
    InvalidRasters(Vec<InvalidRaster>),

    #[error("unit {watershed_id} reported success but {} does not exist", path.display())]
    MissingArtifact {
        watershed_id: String,
        path: PathBuf,
    },

    #[error("invalid scrub configuration for {}: {reason}", path.display())]
    ScrubConfig { path: PathBuf, reason: String },

    #[error("unknown {kind} '{id}'")]
    UnknownInput { kind: &'static str, id: String },

    #[error("watershed '{0}' is not present in the watershed catalog")]
    WatershedNotFound(String),

    #[error("stitch queue for scenario {scenario_id} is closed, {watershed_id} cannot be stitched")]
    StitchQueueClosed {
        scenario_id: String,
        watershed_id: String,
    },

    #[error("mosaic at {} was created with a different grid", path.display())]
    MosaicMismatch { path: PathBuf },
}

fn format_invalid(invalid: &[InvalidRaster]) -> String {
    invalid
        .iter()
        .map(|r| format!("  {r}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors from the status store access layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what}: database still locked after {attempts} attempts over {elapsed:?}")]
    Contention {
        what: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: sqlx::Error,
    },

    #[error("{what}: {source}")]
    Database {
        what: String,
        #[source]
        source: sqlx::Error,
    },
}
