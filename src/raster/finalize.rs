//! One-time finalization of a mosaic: sum-pool to a coarser grid, then write a
//! single compressed GeoTIFF carrying a mean-pooled overview pyramid.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::geo::Crs;
use super::geotiff::{ImageLayer, RasterSpec, SampleType, write_geotiff};
use super::mosaic::GlobalMosaic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    Sum,
    Mean,
}

#[derive(Debug, Clone)]
pub struct FinalizedMosaic {
    /// Sum-pooled mosaic store
    pub aggregated: PathBuf,
    /// Compressed GeoTIFF with overviews
    pub compressed: PathBuf,
    pub overview_levels: usize,
}

/// Finalize `mosaic` into `output_dir`
///
/// Produces `aggregated_<name>/` and `compressed_<name>.tif`. Re-running
/// replaces both.
pub fn finalize_mosaic(mosaic: &GlobalMosaic, output_dir: &Path, factor: u32) -> Result<FinalizedMosaic> {
    let name = mosaic.name();
    info!("Finalizing mosaic {}", name);

    let aggregated_dir = output_dir.join(format!("aggregated_{name}"));
    remove_if_present(&aggregated_dir)?;
    let aggregated = GlobalMosaic::create_if_absent(&aggregated_dir, mosaic.grid().downsampled(factor))?;
    pool_into(mosaic, &aggregated, factor, PoolOp::Sum)?;

    let mut levels = Vec::new();
    let mut current = aggregated.clone();
    while current.grid().width.max(current.grid().height) > current.grid().tile_size {
        let dir = output_dir.join(format!(".overview_{}_{name}", levels.len() + 1));
        remove_if_present(&dir)?;
        let next = GlobalMosaic::create_if_absent(&dir, current.grid().downsampled(2))?;
        pool_into(&current, &next, 2, PoolOp::Mean)?;
        levels.push(next.clone());
        current = next;
    }

    let compressed = output_dir.join(format!("compressed_{name}.tif"));
    let mut layers = vec![image_layer(&aggregated, false)];
    layers.extend(levels.iter().map(|level| image_layer(level, true)));
    write_geotiff(&compressed, layers)
        .with_context(|| format!("Failed to write {}", compressed.display()))?;

    for level in &levels {
        remove_if_present(level.dir())?;
    }

    info!(
        "Wrote {} with {} overview levels",
        compressed.display(),
        levels.len()
    );
    Ok(FinalizedMosaic {
        aggregated: aggregated_dir,
        compressed,
        overview_levels: levels.len(),
    })
}

fn remove_if_present(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

fn image_layer(mosaic: &GlobalMosaic, reduced: bool) -> ImageLayer<'_> {
    let grid = mosaic.grid();
    ImageLayer {
        spec: RasterSpec {
            width: grid.width,
            height: grid.height,
            transform: grid.transform(),
            crs: Crs::Wgs84,
            nodata: Some(grid.nodata),
            sample: SampleType::F32,
        },
        reduced,
        rows_per_strip: grid.tile_size,
        source: Box::new(move |row0, nrows| mosaic.read_rows(row0, nrows)),
    }
}

/// Pool `src` by `factor` into `dst`, whose grid must be `src` downsampled by `factor`
///
/// Nodata cells are ignored; a target cell with no valid inputs stays nodata.
/// Only tiles derived from existing source tiles are visited.
pub fn pool_into(src: &GlobalMosaic, dst: &GlobalMosaic, factor: u32, op: PoolOp) -> Result<()> {
    let sg = *src.grid();
    let ts = sg.tile_size;
    let cells = (ts * ts) as usize;

    let targets: BTreeSet<(u32, u32)> = src
        .existing_tiles()?
        .into_iter()
        .map(|(r, c)| (r / factor, c / factor))
        .collect();

    for (tr, tc) in targets {
        let mut sum = vec![0.0f64; cells];
        let mut count = vec![0u32; cells];

        for sr in tr * factor..(tr + 1) * factor {
            for sc in tc * factor..(tc + 1) * factor {
                let Some(tile) = src.read_tile(sr, sc)? else {
                    continue;
                };
                for i in 0..ts {
                    let row = sr * ts + i;
                    if row >= sg.height {
                        break;
                    }
                    let local_row = row / factor - tr * ts;
                    for j in 0..ts {
                        let col = sc * ts + j;
                        if col >= sg.width {
                            break;
                        }
                        let value = f64::from(tile[(i * ts + j) as usize]);
                        if value.is_nan() || value == sg.nodata {
                            continue;
                        }
                        let idx = (local_row * ts + (col / factor - tc * ts)) as usize;
                        sum[idx] += value;
                        count[idx] += 1;
                    }
                }
            }
        }

        if count.iter().all(|c| *c == 0) {
            continue;
        }
        let nodata = dst.grid().nodata as f32;
        let data: Vec<f32> = sum
            .iter()
            .zip(&count)
            .map(|(&s, &n)| match (n, op) {
                (0, _) => nodata,
                (_, PoolOp::Sum) => s as f32,
                (n, PoolOp::Mean) => (s / n as f64) as f32,
            })
            .collect();
        dst.write_tile(tr, tc, &data)?;
    }
    Ok(())
}
