//! Global WGS84 mosaics stored as sparse tile directories.
//!
//! A mosaic covers -180..180 / -90..90 at a fixed cell size. Only tiles that
//! ever received data exist on disk; a missing tile reads as nodata. Layout:
//!
//! ```text
//! <dir>/mosaic.json
//! <dir>/tiles/r<row>_c<col>.tif
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::geo::{Crs, GeoTransform, lonlat_bounds, pixel_area_m2, wgs84_cell_area_m2};
use super::geotiff::{RasterReader, RasterSpec, SampleType, write_raster};
use crate::error::PipelineError;

const METADATA_FILE: &str = "mosaic.json";
const TILES_DIR: &str = "tiles";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MosaicGrid {
    /// Cell size in degrees
    pub cell_size: f64,
    pub nodata: f64,
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
}

impl MosaicGrid {
    /// Grid spanning the whole globe at `cell_size` degrees
    pub fn global(cell_size: f64, nodata: f64, tile_size: u32) -> Self {
        Self {
            cell_size,
            nodata,
            width: (360.0 / cell_size).round() as u32,
            height: (180.0 / cell_size).round() as u32,
            tile_size,
        }
    }

    /// Same extent with cells `factor` times larger
    pub fn downsampled(&self, factor: u32) -> Self {
        Self {
            cell_size: self.cell_size * factor as f64,
            nodata: self.nodata,
            width: self.width.div_ceil(factor),
            height: self.height.div_ceil(factor),
            tile_size: self.tile_size,
        }
    }

    pub fn transform(&self) -> GeoTransform {
        GeoTransform::new(-180.0, self.cell_size, 90.0, -self.cell_size)
    }

    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_size)
    }

    fn same_as(&self, other: &MosaicGrid) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.tile_size == other.tile_size
            && (self.cell_size - other.cell_size).abs() <= 1e-12 * self.cell_size.abs().max(1.0)
            && (self.nodata == other.nodata || (self.nodata.is_nan() && other.nodata.is_nan()))
    }

    fn is_nodata(&self, value: f64) -> bool {
        value.is_nan() || value == self.nodata
    }

    /// Target window (col0, row0, col1, row1) covering a lon/lat box
    fn window(&self, bounds: (f64, f64, f64, f64)) -> Option<(u32, u32, u32, u32)> {
        let (min_lon, min_lat, max_lon, max_lat) = bounds;
        let col0 = ((min_lon + 180.0) / self.cell_size).floor().max(0.0);
        let col1 = ((max_lon + 180.0) / self.cell_size)
            .ceil()
            .min(self.width as f64);
        let row0 = ((90.0 - max_lat) / self.cell_size).floor().max(0.0);
        let row1 = ((90.0 - min_lat) / self.cell_size)
            .ceil()
            .min(self.height as f64);
        if col0 >= col1 || row0 >= row1 {
            return None;
        }
        Some((col0 as u32, row0 as u32, col1 as u32, row1 as u32))
    }
}

/// Counts from one stitch call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StitchStats {
    pub sources: usize,
    pub cells_written: u64,
    pub tiles_written: usize,
}

#[derive(Debug, Clone)]
pub struct GlobalMosaic {
    dir: PathBuf,
    grid: MosaicGrid,
}

impl GlobalMosaic {
    /// Open the mosaic at `dir`, creating an empty one if none exists
    ///
    /// Fails if an existing mosaic was created with a different grid.
    pub fn create_if_absent(dir: &Path, grid: MosaicGrid) -> Result<Self> {
        let metadata = dir.join(METADATA_FILE);
        if metadata.exists() {
            let existing = Self::open(dir)?;
            if !existing.grid.same_as(&grid) {
                return Err(PipelineError::MosaicMismatch {
                    path: dir.to_path_buf(),
                }
                .into());
            }
            return Ok(existing);
        }

        fs::create_dir_all(dir.join(TILES_DIR))
            .with_context(|| format!("Failed to create mosaic directory {}", dir.display()))?;
        let json = serde_json::to_string_pretty(&grid).context("Failed to serialize mosaic grid")?;
        fs::write(&metadata, json)
            .with_context(|| format!("Failed to write {}", metadata.display()))?;
        debug!(
            "Created empty {}x{} mosaic at {}",
            grid.width,
            grid.height,
            dir.display()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            grid,
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let metadata = dir.join(METADATA_FILE);
        let contents = fs::read_to_string(&metadata)
            .with_context(|| format!("Failed to read {}", metadata.display()))?;
        let grid: MosaicGrid = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", metadata.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            grid,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn grid(&self) -> &MosaicGrid {
        &self.grid
    }

    /// Directory name, used to name finalized outputs
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mosaic".to_string())
    }

    fn tile_path(&self, row: u32, col: u32) -> PathBuf {
        self.dir.join(TILES_DIR).join(format!("r{row}_c{col}.tif"))
    }

    fn tile_spec(&self, row: u32, col: u32) -> RasterSpec {
        let g = &self.grid;
        let span = g.tile_size as f64 * g.cell_size;
        RasterSpec {
            width: g.tile_size,
            height: g.tile_size,
            transform: GeoTransform::new(
                -180.0 + col as f64 * span,
                g.cell_size,
                90.0 - row as f64 * span,
                -g.cell_size,
            ),
            crs: Crs::Wgs84,
            nodata: Some(g.nodata),
            sample: SampleType::F32,
        }
    }

    /// (tile_row, tile_col) of every tile present on disk
    pub fn existing_tiles(&self) -> Result<Vec<(u32, u32)>> {
        let dir = self.dir.join(TILES_DIR);
        let entries =
            fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut tiles = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(key) = parse_tile_name(&name) {
                tiles.push(key);
            }
        }
        tiles.sort_unstable();
        Ok(tiles)
    }

    /// Tile contents, or `None` if the tile was never written
    pub fn read_tile(&self, row: u32, col: u32) -> Result<Option<Vec<f32>>> {
        let path = self.tile_path(row, col);
        if !path.exists() {
            return Ok(None);
        }
        let values = RasterReader::open(&path)?.read_all()?;
        Ok(Some(values.into_iter().map(|v| v as f32).collect()))
    }

    /// Replace a tile on disk; the write is atomic
    pub fn write_tile(&self, row: u32, col: u32, data: &[f32]) -> Result<()> {
        let values: Vec<f64> = data.iter().copied().map(f64::from).collect();
        write_raster(&self.tile_path(row, col), &self.tile_spec(row, col), &values)
    }

    /// Read `nrows` full-width rows starting at `row0`
    pub fn read_rows(&self, row0: u32, nrows: u32) -> Result<Vec<f64>> {
        let g = self.grid;
        let width = g.width as usize;
        let mut out = vec![g.nodata; width * nrows as usize];
        if nrows == 0 {
            return Ok(out);
        }
        let ts = g.tile_size;
        for tile_row in row0 / ts..=(row0 + nrows - 1) / ts {
            for tile_col in 0..g.tiles_across() {
                let Some(tile) = self.read_tile(tile_row, tile_col)? else {
                    continue;
                };
                let col0 = tile_col * ts;
                let cols = ts.min(g.width - col0) as usize;
                for i in 0..ts {
                    let row = tile_row * ts + i;
                    if row < row0 || row >= row0 + nrows {
                        continue;
                    }
                    let src = (i * ts) as usize;
                    let dst = (row - row0) as usize * width + col0 as usize;
                    for (o, v) in out[dst..dst + cols].iter_mut().zip(&tile[src..src + cols]) {
                        *o = f64::from(*v);
                    }
                }
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn value_at(&self, col: u32, row: u32) -> Result<f64> {
        let ts = self.grid.tile_size;
        match self.read_tile(row / ts, col / ts)? {
            Some(tile) => Ok(f64::from(tile[((row % ts) * ts + col % ts) as usize])),
            None => Ok(self.grid.nodata),
        }
    }

    /// Etch each source raster into the mosaic, in order
    ///
    /// Each target cell takes the nearest source pixel, converted from a
    /// per-source-pixel quantity to a per-target-cell quantity by the ratio of
    /// their areas. Cells already holding data are never overwritten, so
    /// overlapping sources do not double count. Touched tiles are written
    /// once at the end.
    pub fn stitch(&self, sources: &[PathBuf]) -> Result<StitchStats> {
        let mut cache = TileCache::new(self);
        let mut stats = StitchStats::default();

        for source in sources {
            stats.cells_written += self
                .etch_source(source, &mut cache)
                .with_context(|| format!("Failed to stitch {}", source.display()))?;
            stats.sources += 1;
        }

        stats.tiles_written = cache.flush()?;
        Ok(stats)
    }

    fn etch_source(&self, source: &Path, cache: &mut TileCache<'_>) -> Result<u64> {
        let mut reader = RasterReader::open(source)?;
        let info = reader.info().clone();
        let Some(crs) = info.crs else {
            bail!("raster has no supported coordinate reference system");
        };
        let values = reader.read_all()?;

        let bounds = lonlat_bounds(crs, &info.transform, info.width, info.height)?;
        let Some((col0, row0, col1, row1)) = self.grid.window(bounds) else {
            warn!("{} lies outside the mosaic extent", source.display());
            return Ok(0);
        };

        let target = self.grid.transform();
        let mut written = 0;
        for row in row0..row1 {
            let (_, lat) = target.pixel_center(0, row);
            let target_area = wgs84_cell_area_m2(lat, self.grid.cell_size, self.grid.cell_size);
            for col in col0..col1 {
                let (lon, _) = target.pixel_center(col, row);
                let (x, y) = crs.from_lonlat(lon, lat);
                let Some((sc, sr)) = info.transform.pixel_of(x, y, info.width, info.height) else {
                    continue;
                };
                let value = values[(sr * info.width + sc) as usize];
                if !value.is_finite() || info.nodata == Some(value) {
                    continue;
                }
                let (_, source_y) = info.transform.pixel_center(sc, sr);
                let source_area = pixel_area_m2(crs, &info.transform, source_y);
                if cache.etch(col, row, value / source_area * target_area)? {
                    written += 1;
                }
            }
        }
        Ok(written)
    }
}

fn parse_tile_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(".tif")?.strip_prefix('r')?;
    let (row, col) = stem.split_once("_c")?;
    Some((row.parse().ok()?, col.parse().ok()?))
}

struct CachedTile {
    data: Vec<f32>,
    dirty: bool,
}

/// Tiles touched during one stitch call
struct TileCache<'a> {
    mosaic: &'a GlobalMosaic,
    tiles: HashMap<(u32, u32), CachedTile>,
}

impl<'a> TileCache<'a> {
    fn new(mosaic: &'a GlobalMosaic) -> Self {
        Self {
            mosaic,
            tiles: HashMap::new(),
        }
    }

    /// Write `value` at (col,row) if the cell holds no data; returns whether it did
    fn etch(&mut self, col: u32, row: u32, value: f64) -> Result<bool> {
        let grid = self.mosaic.grid;
        let ts = grid.tile_size;
        let key = (row / ts, col / ts);

        if !self.tiles.contains_key(&key) {
            let data = self
                .mosaic
                .read_tile(key.0, key.1)?
                .unwrap_or_else(|| vec![grid.nodata as f32; (ts * ts) as usize]);
            self.tiles.insert(key, CachedTile { data, dirty: false });
        }
        let Some(tile) = self.tiles.get_mut(&key) else {
            return Ok(false);
        };

        let cell = &mut tile.data[((row % ts) * ts + col % ts) as usize];
        if !grid.is_nodata(f64::from(*cell)) {
            return Ok(false);
        }
        *cell = value as f32;
        tile.dirty = true;
        Ok(true)
    }

    fn flush(self) -> Result<usize> {
        let mut written = 0;
        for ((row, col), tile) in self.tiles {
            if tile.dirty {
                self.mosaic.write_tile(row, col, &tile.data)?;
                written += 1;
            }
        }
        Ok(written)
    }
}
