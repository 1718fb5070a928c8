//! Configuration constants for the pipeline
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Status Store Configuration
// ============================================================================

/// File name of the work-status database inside the workspace directory
pub const WORK_STATUS_DATABASE: &str = "work_status.sqlite";

/// Initial delay before retrying a statement that hit a locked database
pub const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the exponential retry delay
pub const STORE_RETRY_MAX_DELAY: Duration = Duration::from_millis(3200);

/// Attempts before lock contention is treated as fatal
///
/// Many model processes share one store file, so contention is routine during
/// large runs. 100 attempts at the capped delay tolerates several minutes of
/// sustained locking.
pub const STORE_MAX_ATTEMPTS: u32 = 100;

/// SQLite busy handler timeout applied to every connection
pub const STORE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Scheduling Configuration
// ============================================================================

/// Watersheds with an area at or below this (in square degrees) are not scheduled
pub const AREA_DEG_THRESHOLD: f64 = 0.00016;

/// Number of completed units merged into the mosaics per flush
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Interval between progress reports
pub const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Concurrent model runs when none are configured: one per available CPU
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Model Parameters
// ============================================================================

pub const RETENTION_LENGTH_M: f64 = 150.0;

pub const K_VAL: f64 = 1.0;

pub const TARGET_CELL_LENGTH_M: f64 = 300.0;

/// Flow accumulation threshold, scaled from 90 m cells at 500 px to the target cell length
pub const FLOW_THRESHOLD: u32 = (500.0 * 500.0 * 90.0 / (TARGET_CELL_LENGTH_M * TARGET_CELL_LENGTH_M)) as u32;

pub const MAX_PIXEL_FILL_COUNT: u32 = 500;

/// Biophysical table marker meaning "take the load from the fertilizer raster"
pub const USE_AG_LOAD_ID: i64 = 999;

// ============================================================================
// Mosaic Configuration
// ============================================================================

/// Cell size of the global mosaics in degrees (2.5 arc seconds)
pub const MOSAIC_CELL_SIZE_DEG: f64 = 10.0 / 3600.0 / 2.0;

pub const MOSAIC_NODATA: f64 = -1.0;

/// Edge length of mosaic tiles and of strips in finalized outputs
pub const MOSAIC_TILE_SIZE: u32 = 256;

/// Sum-pooling factor applied when finalizing a mosaic
pub const AGGREGATION_FACTOR: u32 = 2;

// ============================================================================
// Data Quality Configuration
// ============================================================================

/// Relative tolerance for "close to nodata" checks
pub const DEFAULT_RELATIVE_TOLERANCE: f64 = 0.001;

/// Magnitudes at or above this are treated as garbage
pub const DEFAULT_MAX_ABS: f64 = 1e30;

/// Tighter tolerance used to recognise a huge nodata sentinel among huge values
pub const LARGE_VALUE_NODATA_RTOL: f64 = 1e-5;

/// Cap on offending values carried in a single validation report
pub const MAX_REPORTED_VALUES: usize = 16;
