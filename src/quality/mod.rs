//! Input data quality: pre-flight validation and scrubbing

pub mod scrubber;
pub mod validator;

pub use scrubber::{ScrubCounts, scrub_raster};
pub use validator::{InvalidReason, RasterCheck, RasterInput, check_raster, validate_inputs};
