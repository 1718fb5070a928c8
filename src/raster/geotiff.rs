//! Single-band GeoTIFF reading and writing.
//!
//! Reading goes chunk by chunk (strip or tile) so callers can stream rasters
//! of any size. Writing produces LZW-compressed strips, switches to BigTIFF
//! for outputs past the classic 4 GiB offset range, and may append reduced
//! resolution images after the first one as overviews.

use anyhow::{Context, Result, bail, ensure};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::compression::{CompressionAlgorithm, Lzw};
use tiff::encoder::{TiffEncoder, TiffKind};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, SampleFormat, Tag};

use super::geo::{Crs, GeoTransform};

const KEY_GT_MODEL_TYPE: u16 = 1024;
const KEY_GT_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u32 = 2048;
const KEY_PROJECTED_CS_TYPE: u32 = 3072;

/// Sample type written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    F32,
    F64,
}

impl SampleType {
    fn byte_len(self) -> u64 {
        match self {
            SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    /// Appends `values` in the writer's native byte order
    fn encode(self, values: &[f64], out: &mut Vec<u8>) {
        match self {
            SampleType::F32 => {
                for v in values {
                    out.extend_from_slice(&(*v as f32).to_ne_bytes());
                }
            }
            SampleType::F64 => {
                for v in values {
                    out.extend_from_slice(&v.to_ne_bytes());
                }
            }
        }
    }
}

/// Shape and georeferencing of a raster
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSpec {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: Option<f64>,
    pub sample: SampleType,
}

/// Metadata of a raster opened for reading
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub crs: Option<Crs>,
    pub nodata: Option<f64>,
    /// Closest writable sample type
    pub sample: SampleType,
}

/// One decoded chunk of a raster
#[derive(Debug, Clone)]
pub struct Block {
    pub col0: u32,
    pub row0: u32,
    pub width: u32,
    pub height: u32,
    pub values: Vec<f64>,
}

pub struct RasterReader {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    info: RasterInfo,
    chunk_width: u32,
    chunk_height: u32,
    chunks_across: u32,
    chunks_down: u32,
}

impl RasterReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open raster {}", path.display()))?;
        let mut decoder = Decoder::new(BufReader::new(file))
            .with_context(|| format!("Failed to decode TIFF header of {}", path.display()))?
            .with_limits(Limits::unlimited());

        let sample = match decoder.colortype()? {
            ColorType::Gray(64) => SampleType::F64,
            ColorType::Gray(_) => SampleType::F32,
            other => bail!(
                "{} has color type {:?}; only single-band rasters are supported",
                path.display(),
                other
            ),
        };

        let (width, height) = decoder.dimensions()?;
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        ensure!(
            chunk_width > 0 && chunk_height > 0,
            "{} has an empty chunk layout",
            path.display()
        );

        let transform = read_transform(&mut decoder)
            .with_context(|| format!("{} is not georeferenced", path.display()))?;
        let crs = read_crs(&mut decoder)?;
        let nodata = read_nodata(&mut decoder)?;

        Ok(Self {
            path: path.to_path_buf(),
            decoder,
            info: RasterInfo {
                width,
                height,
                transform,
                crs,
                nodata,
                sample,
            },
            chunk_width,
            chunk_height,
            chunks_across: width.div_ceil(chunk_width),
            chunks_down: height.div_ceil(chunk_height),
        })
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks_across * self.chunks_down
    }

    /// Rows covered by one row of chunks
    pub fn chunk_height(&self) -> u32 {
        self.chunk_height
    }

    /// Decode one chunk, cropped to the raster extent
    pub fn read_block(&mut self, index: u32) -> Result<Block> {
        ensure!(
            index < self.chunk_count(),
            "chunk {} out of range for {}",
            index,
            self.path.display()
        );
        let cx = index % self.chunks_across;
        let cy = index / self.chunks_across;
        let col0 = cx * self.chunk_width;
        let row0 = cy * self.chunk_height;
        let width = self.chunk_width.min(self.info.width - col0);
        let height = self.chunk_height.min(self.info.height - row0);

        let raw = self
            .decoder
            .read_chunk(index)
            .with_context(|| format!("Failed to read chunk {} of {}", index, self.path.display()))?;
        let data = samples_to_f64(raw)?;

        let wanted = (width * height) as usize;
        let values = if data.len() == wanted {
            data
        } else if data.len() == (self.chunk_width * self.chunk_height) as usize {
            // padded edge tile
            let stride = self.chunk_width as usize;
            let mut cropped = Vec::with_capacity(wanted);
            for r in 0..height as usize {
                cropped.extend_from_slice(&data[r * stride..r * stride + width as usize]);
            }
            cropped
        } else {
            bail!(
                "chunk {} of {} holds {} samples, expected {}; multi-band rasters are not supported",
                index,
                self.path.display(),
                data.len(),
                wanted
            );
        };

        Ok(Block {
            col0,
            row0,
            width,
            height,
            values,
        })
    }

    /// Read `nrows` full-width rows starting at `row0`
    pub fn read_rows(&mut self, row0: u32, nrows: u32) -> Result<Vec<f64>> {
        ensure!(
            row0 + nrows <= self.info.height,
            "rows {}..{} out of range for {}",
            row0,
            row0 + nrows,
            self.path.display()
        );
        let width = self.info.width as usize;
        let mut out = vec![0.0; width * nrows as usize];
        if nrows == 0 {
            return Ok(out);
        }

        let first = row0 / self.chunk_height;
        let last = (row0 + nrows - 1) / self.chunk_height;
        for cy in first..=last {
            for cx in 0..self.chunks_across {
                let block = self.read_block(cy * self.chunks_across + cx)?;
                for r in 0..block.height {
                    let row = block.row0 + r;
                    if row < row0 || row >= row0 + nrows {
                        continue;
                    }
                    let src = (r * block.width) as usize;
                    let dst = (row - row0) as usize * width + block.col0 as usize;
                    out[dst..dst + block.width as usize]
                        .copy_from_slice(&block.values[src..src + block.width as usize]);
                }
            }
        }
        Ok(out)
    }

    pub fn read_all(&mut self) -> Result<Vec<f64>> {
        let height = self.info.height;
        self.read_rows(0, height)
    }
}

fn samples_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    #[allow(unreachable_patterns)]
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => bail!("unsupported sample format"),
    };
    Ok(values)
}

fn read_transform(decoder: &mut Decoder<BufReader<File>>) -> Result<GeoTransform> {
    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)?
        .context("missing ModelPixelScale tag")?
        .into_f64_vec()?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)?
        .context("missing ModelTiepoint tag")?
        .into_f64_vec()?;
    ensure!(scale.len() >= 2, "malformed ModelPixelScale tag");
    ensure!(tiepoint.len() >= 6, "malformed ModelTiepoint tag");

    let (sx, sy) = (scale[0], scale[1]);
    Ok(GeoTransform::new(
        tiepoint[3] - tiepoint[0] * sx,
        sx,
        tiepoint[4] + tiepoint[1] * sy,
        -sy,
    ))
}

fn read_crs(decoder: &mut Decoder<BufReader<File>>) -> Result<Option<Crs>> {
    let Some(value) = decoder.find_tag(Tag::GeoKeyDirectoryTag)? else {
        return Ok(None);
    };
    let keys = value.into_u32_vec()?;
    if keys.len() < 4 {
        return Ok(None);
    }

    let mut geographic = None;
    let mut projected = None;
    for entry in keys[4..].chunks_exact(4).take(keys[3] as usize) {
        // only inline (location 0) values carry EPSG codes
        if entry[1] != 0 {
            continue;
        }
        match entry[0] {
            KEY_GEOGRAPHIC_TYPE => geographic = Some(entry[3]),
            KEY_PROJECTED_CS_TYPE => projected = Some(entry[3]),
            _ => {}
        }
    }
    Ok(projected.or(geographic).and_then(Crs::from_epsg))
}

fn read_nodata(decoder: &mut Decoder<BufReader<File>>) -> Result<Option<f64>> {
    let Some(value) = decoder.find_tag(Tag::GdalNodata)? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    Ok(text.trim_matches(char::from(0)).trim().parse::<f64>().ok())
}

#[rustfmt::skip]
fn geo_keys(crs: Crs) -> Vec<u16> {
    let (model_type, key, code) = match crs {
        Crs::Wgs84 => (2, KEY_GEOGRAPHIC_TYPE, crs.epsg()),
        Crs::Utm { .. } => (1, KEY_PROJECTED_CS_TYPE, crs.epsg()),
    };
    vec![
        1, 1, 0, 3,
        KEY_GT_MODEL_TYPE, 0, 1, model_type,
        KEY_GT_RASTER_TYPE, 0, 1, 1,
        key as u16, 0, 1, code as u16,
    ]
}

/// Produces `nrows` full-width rows starting at a row offset
pub type BandSource<'a> = Box<dyn FnMut(u32, u32) -> Result<Vec<f64>> + 'a>;

/// One image of a GeoTIFF file
pub struct ImageLayer<'a> {
    pub spec: RasterSpec,
    /// Marks the image as a reduced-resolution overview
    pub reduced: bool,
    pub rows_per_strip: u32,
    pub source: BandSource<'a>,
}

/// Sample bytes above which a file is written as BigTIFF. LZW can expand
/// incompressible strips, so this sits well below the classic offset range.
const BIG_TIFF_THRESHOLD: u64 = u32::MAX as u64 / 2;

/// Write all layers into one GeoTIFF, atomically replacing `path`
///
/// Files whose samples may not fit 32-bit offsets are written as BigTIFF.
pub fn write_geotiff(path: &Path, layers: Vec<ImageLayer<'_>>) -> Result<()> {
    let big = sample_bytes(&layers) > BIG_TIFF_THRESHOLD;
    write_geotiff_as(path, layers, big)
}

fn sample_bytes(layers: &[ImageLayer<'_>]) -> u64 {
    layers
        .iter()
        .map(|layer| {
            let spec = &layer.spec;
            u64::from(spec.width) * u64::from(spec.height) * spec.sample.byte_len()
        })
        .sum()
}

fn write_geotiff_as(path: &Path, layers: Vec<ImageLayer<'_>>, big: bool) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;

    {
        let mut writer = BufWriter::new(tmp.as_file());
        if big {
            let mut encoder = TiffEncoder::new_big(&mut writer)?;
            for mut layer in layers {
                write_image(&mut encoder, &mut layer)?;
            }
        } else {
            let mut encoder = TiffEncoder::new(&mut writer)?;
            for mut layer in layers {
                write_image(&mut encoder, &mut layer)?;
            }
        }
        writer.flush()?;
    }

    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move raster into place at {}", path.display()))?;
    Ok(())
}

/// Writes one image directory with LZW-compressed strips
///
/// Strips are compressed here and stored raw through the directory encoder,
/// so the strip offsets and byte counts are tracked by hand.
fn write_image<W, K>(encoder: &mut TiffEncoder<W, K>, layer: &mut ImageLayer<'_>) -> Result<()>
where
    W: Write + Seek,
    K: TiffKind,
{
    let spec = &layer.spec;
    ensure!(
        spec.width > 0 && spec.height > 0,
        "cannot write an empty raster"
    );
    let (width, height) = (spec.width, spec.height);
    let rows_per_strip = layer.rows_per_strip.clamp(1, height);
    let bits_per_sample = (spec.sample.byte_len() * 8) as u16;

    let mut dir = encoder.new_directory()?;
    let mut strip_offsets = Vec::new();
    let mut strip_byte_counts = Vec::new();
    let mut raw = Vec::new();
    let mut compressed = Vec::new();
    let mut row = 0;
    while row < height {
        let nrows = rows_per_strip.min(height - row);
        let values = (layer.source)(row, nrows)?;
        ensure!(
            values.len() == (width * nrows) as usize,
            "band source returned {} samples for {} rows of width {}",
            values.len(),
            nrows,
            width
        );
        raw.clear();
        spec.sample.encode(&values, &mut raw);
        compressed.clear();
        Lzw.write_to(&mut compressed, &raw)?;

        let offset = dir.write_data(&compressed[..])?;
        strip_offsets.push(K::convert_offset(offset)?);
        strip_byte_counts.push(K::convert_offset(compressed.len() as u64)?);
        row += nrows;
    }

    dir.write_tag(Tag::ImageWidth, width)?;
    dir.write_tag(Tag::ImageLength, height)?;
    dir.write_tag(Tag::BitsPerSample, bits_per_sample)?;
    dir.write_tag(Tag::Compression, CompressionMethod::LZW.to_u16())?;
    dir.write_tag(
        Tag::PhotometricInterpretation,
        PhotometricInterpretation::BlackIsZero.to_u16(),
    )?;
    dir.write_tag(Tag::SamplesPerPixel, 1u16)?;
    dir.write_tag(Tag::RowsPerStrip, rows_per_strip)?;
    dir.write_tag(Tag::SampleFormat, SampleFormat::IEEEFP.to_u16())?;
    dir.write_tag(Tag::StripOffsets, K::convert_slice(&strip_offsets))?;
    dir.write_tag(Tag::StripByteCounts, K::convert_slice(&strip_byte_counts))?;
    if layer.reduced {
        dir.write_tag(Tag::NewSubfileType, 1u32)?;
    }

    let t = &spec.transform;
    let scale = [t.pixel_width, -t.pixel_height, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];
    let keys = geo_keys(spec.crs);
    dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    dir.write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    dir.write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;
    if let Some(nodata) = spec.nodata {
        dir.write_tag(Tag::GdalNodata, nodata.to_string().as_str())?;
    }
    dir.finish()?;
    Ok(())
}

/// Write an in-memory raster as a single-image GeoTIFF
pub fn write_raster(path: &Path, spec: &RasterSpec, values: &[f64]) -> Result<()> {
    ensure!(
        values.len() == (spec.width * spec.height) as usize,
        "raster of {}x{} needs {} values, got {}",
        spec.width,
        spec.height,
        spec.width * spec.height,
        values.len()
    );
    let width = spec.width as usize;
    let layer = ImageLayer {
        spec: spec.clone(),
        reduced: false,
        rows_per_strip: 256,
        source: Box::new(move |row0, nrows| {
            let start = row0 as usize * width;
            Ok(values[start..start + nrows as usize * width].to_vec())
        }),
    };
    write_geotiff(path, vec![layer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wgs84_spec(width: u32, height: u32, sample: SampleType) -> RasterSpec {
        RasterSpec {
            width,
            height,
            transform: GeoTransform::new(10.0, 0.5, 20.0, -0.5),
            crs: Crs::Wgs84,
            nodata: Some(-9999.0),
            sample,
        }
    }

    #[test]
    fn test_write_then_read_metadata_and_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tif");
        let spec = wgs84_spec(5, 3, SampleType::F32);
        let values: Vec<f64> = (0..15).map(|v| v as f64 * 1.5).collect();
        write_raster(&path, &spec, &values).unwrap();

        let mut reader = RasterReader::open(&path).unwrap();
        let info = reader.info().clone();
        assert_eq!((info.width, info.height), (5, 3));
        assert_eq!(info.transform, spec.transform);
        assert_eq!(info.crs, Some(Crs::Wgs84));
        assert_eq!(info.nodata, Some(-9999.0));
        assert_eq!(reader.read_all().unwrap(), values);
        assert_eq!(reader.read_rows(1, 1).unwrap(), values[5..10].to_vec());
    }

    #[test]
    fn test_utm_and_f64_samples_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("utm.tif");
        let spec = RasterSpec {
            width: 2,
            height: 2,
            transform: GeoTransform::new(400_000.0, 30.0, 5_000_000.0, -30.0),
            crs: Crs::Utm {
                zone: 33,
                north: false,
            },
            nodata: None,
            sample: SampleType::F64,
        };
        let values = vec![-9999.0001, 1.0, 2.0, 3.0];
        write_raster(&path, &spec, &values).unwrap();

        let mut reader = RasterReader::open(&path).unwrap();
        assert_eq!(
            reader.info().crs,
            Some(Crs::Utm {
                zone: 33,
                north: false
            })
        );
        assert_eq!(reader.info().nodata, None);
        assert_eq!(reader.info().sample, SampleType::F64);
        assert_eq!(reader.read_all().unwrap(), values);
    }

    #[test]
    fn test_blocks_follow_strips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strips.tif");
        let spec = wgs84_spec(4, 5, SampleType::F32);
        let values: Vec<f64> = (0..20).map(f64::from).collect();
        let layer = ImageLayer {
            spec: spec.clone(),
            reduced: false,
            rows_per_strip: 2,
            source: Box::new(|row0, nrows| {
                Ok(values[(row0 * 4) as usize..((row0 + nrows) * 4) as usize].to_vec())
            }),
        };
        write_geotiff(&path, vec![layer]).unwrap();

        let mut reader = RasterReader::open(&path).unwrap();
        assert_eq!(reader.chunk_count(), 3);
        let last = reader.read_block(2).unwrap();
        assert_eq!((last.row0, last.height), (4, 1));
        assert_eq!(last.values, vec![16.0, 17.0, 18.0, 19.0]);
    }

    fn strip_source(values: &[f64], width: u32) -> BandSource<'_> {
        Box::new(move |row0, nrows| {
            Ok(values[(row0 * width) as usize..((row0 + nrows) * width) as usize].to_vec())
        })
    }

    #[test]
    fn test_lzw_strips_and_overviews_decode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layers.tif");
        let full: Vec<f64> = (0..300 * 40).map(|v| f64::from(v % 97) * 0.25).collect();
        let reduced: Vec<f64> = (0..150 * 20).map(|v| f64::from(v % 13)).collect();
        let mut overview = wgs84_spec(150, 20, SampleType::F32);
        overview.transform = GeoTransform::new(10.0, 1.0, 20.0, -1.0);
        let layers = vec![
            ImageLayer {
                spec: wgs84_spec(300, 40, SampleType::F32),
                reduced: false,
                rows_per_strip: 7,
                source: strip_source(&full, 300),
            },
            ImageLayer {
                spec: overview,
                reduced: true,
                rows_per_strip: 3,
                source: strip_source(&reduced, 150),
            },
        ];
        write_geotiff(&path, layers).unwrap();

        let mut reader = RasterReader::open(&path).unwrap();
        assert_eq!(reader.chunk_count(), 6);
        assert_eq!(reader.read_all().unwrap(), full);

        let mut decoder = Decoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(
            decoder.get_tag_u32(Tag::Compression).unwrap(),
            u32::from(CompressionMethod::LZW.to_u16())
        );
        assert!(decoder.more_images());
        decoder.next_image().unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (150, 20));
        assert_eq!(decoder.get_tag_u32(Tag::NewSubfileType).unwrap(), 1);
        let DecodingResult::F32(second) = decoder.read_image().unwrap() else {
            panic!("overview is not f32");
        };
        let expected: Vec<f32> = reduced.iter().map(|v| *v as f32).collect();
        assert_eq!(second, expected);
    }

    #[test]
    fn test_constant_raster_is_compressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flat.tif");
        let spec = wgs84_spec(200, 200, SampleType::F32);
        let values = vec![-1.0; 200 * 200];
        write_raster(&path, &spec, &values).unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size < 200 * 200 * 4 / 4, "file is {size} bytes");
        let mut reader = RasterReader::open(&path).unwrap();
        assert_eq!(reader.read_all().unwrap(), values);
    }

    #[test]
    fn test_bigtiff_layout_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.tif");
        let values: Vec<f64> = (0..6 * 9).map(f64::from).collect();
        let layers = vec![ImageLayer {
            spec: wgs84_spec(6, 9, SampleType::F64),
            reduced: false,
            rows_per_strip: 4,
            source: strip_source(&values, 6),
        }];
        write_geotiff_as(&path, layers, true).unwrap();

        let header = std::fs::read(&path).unwrap();
        assert_eq!(u16::from_ne_bytes([header[2], header[3]]), 43);
        let mut reader = RasterReader::open(&path).unwrap();
        assert_eq!(reader.info().crs, Some(Crs::Wgs84));
        assert_eq!(reader.info().nodata, Some(-9999.0));
        assert_eq!(reader.read_all().unwrap(), values);
    }

    #[test]
    fn test_global_grid_outputs_need_bigtiff() {
        let layer = |width, height| ImageLayer {
            spec: wgs84_spec(width, height, SampleType::F32),
            reduced: false,
            rows_per_strip: 1,
            source: Box::new(|_, _| Ok(Vec::new())),
        };
        assert!(sample_bytes(&[layer(129_600, 64_800)]) > BIG_TIFF_THRESHOLD);
        assert!(sample_bytes(&[layer(4_320, 2_160)]) < BIG_TIFF_THRESHOLD);
    }
}
