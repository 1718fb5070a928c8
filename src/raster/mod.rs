//! Raster I/O, georeferencing and global mosaics

pub mod finalize;
pub mod geo;
pub mod geotiff;
pub mod mosaic;

pub use finalize::{FinalizedMosaic, finalize_mosaic};
pub use geo::{Crs, GeoTransform};
pub use geotiff::{RasterReader, RasterSpec, SampleType, write_raster};
pub use mosaic::{GlobalMosaic, MosaicGrid, StitchStats};
