//! Input file formats: biophysical tables and watershed vectors

pub mod biophysical;
pub mod geojson;

pub use self::biophysical::LookupTables;
pub use self::geojson::{GeoJsonCatalog, Watershed, WatershedCatalog, split_watershed_id, watershed_id};
