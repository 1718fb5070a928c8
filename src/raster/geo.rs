//! Georeferencing: affine transforms, supported coordinate systems and
//! WGS84 cell areas.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// Semi-minor axis used for cell areas
const WGS84_B: f64 = 6_356_752.3142;
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// North-up affine transform: pixel (col,row) corner -> map (x,y)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    /// Negative for north-up rasters
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            origin_y,
            pixel_height,
        }
    }

    /// Map coordinate of a pixel centre
    pub fn pixel_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Pixel containing a map coordinate, if it falls inside `width` x `height`
    pub fn pixel_of(&self, x: f64, y: f64, width: u32, height: u32) -> Option<(u32, u32)> {
        let col = ((x - self.origin_x) / self.pixel_width).floor();
        let row = ((y - self.origin_y) / self.pixel_height).floor();
        if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
            return None;
        }
        Some((col as u32, row as u32))
    }

    /// (min_x, min_y, max_x, max_y) of a `width` x `height` raster
    pub fn extent(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let x0 = self.origin_x;
        let x1 = self.origin_x + width as f64 * self.pixel_width;
        let y0 = self.origin_y;
        let y1 = self.origin_y + height as f64 * self.pixel_height;
        (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }
}

/// Coordinate reference systems the pipeline reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    Wgs84,
    Utm { zone: u8, north: bool },
}

impl Crs {
    pub fn from_epsg(code: u32) -> Option<Self> {
        match code {
            4326 => Some(Crs::Wgs84),
            32601..=32660 => Some(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Some(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            _ => None,
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::Utm { zone, north: true } => 32600 + *zone as u32,
            Crs::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84)
    }

    /// Project a WGS84 (lon, lat) into this system
    pub fn from_lonlat(&self, lon: f64, lat: f64) -> (f64, f64) {
        match *self {
            Crs::Wgs84 => (lon, lat),
            Crs::Utm { zone, north } => utm_forward(zone, north, lon, lat),
        }
    }

    /// Inverse of [`Crs::from_lonlat`]
    pub fn to_lonlat(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Crs::Wgs84 => (x, y),
            Crs::Utm { zone, north } => utm_inverse(zone, north, x, y),
        }
    }
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

fn eccentricity_squared() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

fn meridian_arc(phi: f64) -> f64 {
    let e2 = eccentricity_squared();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

/// Transverse Mercator forward projection (series form, WGS84 ellipsoid)
fn utm_forward(zone: u8, north: bool, lon: f64, lat: f64) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let lam = (lon - central_meridian(zone)).to_radians();

    let (sin_phi, cos_phi) = phi.sin_cos();
    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = phi.tan().powi(2);
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * lam;
    let m = meridian_arc(phi);

    let x = UTM_K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let mut y = UTM_K0
        * (m + n
            * phi.tan()
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }
    (x, y)
}

fn utm_inverse(zone: u8, north: bool, x: f64, y: f64) -> (f64, f64) {
    let e2 = eccentricity_squared();
    let ep2 = e2 / (1.0 - e2);
    let x = x - UTM_FALSE_EASTING;
    let y = if north { y } else { y - UTM_FALSE_NORTHING_SOUTH };

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin1, cos1) = phi1.sin_cos();
    let n1 = WGS84_A / (1.0 - e2 * sin1 * sin1).sqrt();
    let t1 = phi1.tan().powi(2);
    let c1 = ep2 * cos1 * cos1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let lat = phi1
        - (n1 * phi1.tan() / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lon = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos1;

    (central_meridian(zone) + lon.to_degrees(), lat.to_degrees())
}

/// Area in m² of a WGS84 cell centred at `center_lat`
///
/// Integrates the authalic band between the cell's north and south edges on
/// the ellipsoid, then takes the cell's share of the full circle.
pub fn wgs84_cell_area_m2(center_lat: f64, cell_width_deg: f64, cell_height_deg: f64) -> f64 {
    let e = (1.0 - (WGS84_B / WGS84_A).powi(2)).sqrt();
    let band = |lat: f64| {
        let sin_lat = lat.to_radians().sin();
        let zm = 1.0 - e * sin_lat;
        let zp = 1.0 + e * sin_lat;
        PI * WGS84_B * WGS84_B * ((zp / zm).ln() / (2.0 * e) + sin_lat / (zp * zm))
    };
    let half = cell_height_deg.abs() / 2.0;
    let upper = band(center_lat + half);
    let lower = band(center_lat - half);
    (cell_width_deg.abs() / 360.0 * (upper - lower)).abs()
}

/// Area in m² of one pixel of a raster in `crs`, for the row containing `y`
pub fn pixel_area_m2(crs: Crs, transform: &GeoTransform, y: f64) -> f64 {
    if crs.is_geographic() {
        wgs84_cell_area_m2(y, transform.pixel_width, transform.pixel_height)
    } else {
        (transform.pixel_width * transform.pixel_height).abs()
    }
}

/// WGS84 bounding box (min_lon, min_lat, max_lon, max_lat) of a raster
///
/// Projected rasters are bounded by sampling their edges, since straight
/// edges in UTM are curves in lon/lat.
pub fn lonlat_bounds(
    crs: Crs,
    transform: &GeoTransform,
    width: u32,
    height: u32,
) -> Result<(f64, f64, f64, f64)> {
    let (min_x, min_y, max_x, max_y) = transform.extent(width, height);
    if crs.is_geographic() {
        return Ok((
            min_x.max(-180.0),
            min_y.max(-90.0),
            max_x.min(180.0),
            max_y.min(90.0),
        ));
    }

    const SAMPLES: u32 = 16;
    let mut bounds = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for i in 0..=SAMPLES {
        let fx = min_x + (max_x - min_x) * i as f64 / SAMPLES as f64;
        let fy = min_y + (max_y - min_y) * i as f64 / SAMPLES as f64;
        for (x, y) in [(fx, min_y), (fx, max_y), (min_x, fy), (max_x, fy)] {
            let (lon, lat) = crs.to_lonlat(x, y);
            bounds.0 = bounds.0.min(lon);
            bounds.1 = bounds.1.min(lat);
            bounds.2 = bounds.2.max(lon);
            bounds.3 = bounds.3.max(lat);
        }
    }
    if !bounds.0.is_finite() || !bounds.3.is_finite() {
        bail!("Could not compute geographic bounds of raster extent");
    }
    Ok((
        bounds.0.max(-180.0),
        bounds.1.max(-90.0),
        bounds.2.min(180.0),
        bounds.3.min(90.0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epsg_round_trip() {
        for code in [4326, 32601, 32633, 32660, 32701, 32755] {
            assert_eq!(Crs::from_epsg(code).unwrap().epsg(), code);
        }
        assert_eq!(Crs::from_epsg(3857), None);
    }

    #[test]
    fn test_utm_known_point() {
        // Central meridian of zone 33 at the equator maps to the false easting
        let (x, y) = Crs::Utm {
            zone: 33,
            north: true,
        }
        .from_lonlat(15.0, 0.0);
        assert!((x - 500_000.0).abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_utm_inverse_recovers_lonlat() {
        let cases = [
            (Crs::Utm { zone: 33, north: true }, 13.4, 52.5),
            (Crs::Utm { zone: 18, north: true }, -74.0, 40.7),
            (Crs::Utm { zone: 23, north: false }, -46.6, -23.5),
        ];
        for (crs, lon, lat) in cases {
            let (x, y) = crs.from_lonlat(lon, lat);
            let (lon2, lat2) = crs.to_lonlat(x, y);
            assert!((lon - lon2).abs() < 1e-5, "{lon} vs {lon2}");
            assert!((lat - lat2).abs() < 1e-5, "{lat} vs {lat2}");
        }
    }

    #[test]
    fn test_cell_area_shrinks_toward_poles() {
        let equator = wgs84_cell_area_m2(0.5, 1.0, 1.0);
        let high = wgs84_cell_area_m2(60.5, 1.0, 1.0);
        // one degree cell at the equator is roughly 111 km x 111 km
        assert!((equator / 1e6 - 12_308.0).abs() < 50.0, "{equator}");
        assert!(high < equator * 0.51);
    }

    #[test]
    fn test_pixel_of_bounds() {
        let gt = GeoTransform::new(-180.0, 1.0, 90.0, -1.0);
        assert_eq!(gt.pixel_of(-179.5, 89.5, 360, 180), Some((0, 0)));
        assert_eq!(gt.pixel_of(179.9, -89.9, 360, 180), Some((359, 179)));
        assert_eq!(gt.pixel_of(180.0, 0.0, 360, 180), None);
        assert_eq!(gt.pixel_center(0, 0), (-179.5, 89.5));
    }
}
