use geo::{Coord, Euclidean, LineString, Point, algorithm::Distance};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::DecodedGeometry;
use crate::ingest::{SourceKind, TravelDirection};

// WGS-84 ellipsoid
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
// Spherical radius used by web mercator (EPSG:3857)
const MERCATOR_R: f64 = 6_378_137.0;
// Web mercator is undefined at the poles; this is the conventional cutoff
const MERCATOR_MAX_LAT: f64 = 85.06;
// UTM is defined up to 84 degrees of latitude
const UTM_MAX_LAT: f64 = 84.0;
const UTM_SCALE: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("unrecognized EPSG code {0}")]
    UnknownEpsg(u32),
    #[error("UTM zone {0} is outside 1..=60")]
    InvalidUtmZone(u8),
    #[error("coordinate ({x}, {y}) is not finite")]
    NonFinite { x: f64, y: f64 },
    #[error("coordinate ({x}, {y}) lies outside the domain of {crs:?}")]
    OutOfDomain { crs: Crs, x: f64, y: f64 },
}

/// A coordinate reference system the engine can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// EPSG:4326, geographic lon/lat degrees.
    Wgs84,
    /// EPSG:3857, spherical web mercator meters.
    WebMercator,
    /// EPSG:326xx (north) / EPSG:327xx (south), transverse mercator meters.
    Utm { zone: u8, north: bool },
}

impl Crs {
    pub fn utm_north(zone: u8) -> Self {
        Crs::Utm { zone, north: true }
    }

    pub fn from_epsg(code: u32) -> Result<Self, ProjectionError> {
        match code {
            4326 => Ok(Crs::Wgs84),
            3857 | 900913 => Ok(Crs::WebMercator),
            32601..=32660 => Ok(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Ok(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            other => Err(ProjectionError::UnknownEpsg(other)),
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::Utm { zone, north: true } => 32600 + *zone as u32,
            Crs::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    /// Whether coordinates in this CRS are metric, so distances and
    /// intersections can be computed directly.
    pub fn is_projected(&self) -> bool {
        !matches!(self, Crs::Wgs84)
    }
}

/// Line geometry in the canonical CRS. Only the normalizer constructs
/// these, so holding one implies metric coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalGeometry {
    pub segment_id: String,
    pub source: SourceKind,
    pub line: LineString<f64>,
    pub direction: TravelDirection,
    /// Polyline length in canonical meters.
    pub length_m: f64,
}

impl CanonicalGeometry {
    pub fn bounding_box(&self) -> geo::Rect<f64> {
        let mut min_x = f64::MAX;
        let mut min_y = f64::MAX;
        let mut max_x = f64::MIN;
        let mut max_y = f64::MIN;

        for coord in &self.line.0 {
            min_x = min_x.min(coord.x);
            min_y = min_y.min(coord.y);
            max_x = max_x.max(coord.x);
            max_y = max_y.max(coord.y);
        }

        geo::Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }
}

/// Reproject a decoded geometry into the canonical CRS.
///
/// Already-canonical input is copied bit-for-bit, so re-running the
/// normalizer is a no-op.
pub fn to_canonical(
    geometry: &DecodedGeometry,
    canonical: Crs,
) -> Result<CanonicalGeometry, ProjectionError> {
    let line = reproject_line(&geometry.line, geometry.crs, canonical)?;
    let length_m = polyline_length(&line);

    Ok(CanonicalGeometry {
        segment_id: geometry.segment_id.clone(),
        source: geometry.source,
        line,
        direction: geometry.direction,
        length_m,
    })
}

pub fn reproject_line(
    line: &LineString<f64>,
    from: Crs,
    to: Crs,
) -> Result<LineString<f64>, ProjectionError> {
    validate_crs(from)?;
    validate_crs(to)?;

    if from == to {
        // Identity, preserving coordinates exactly
        for coord in &line.0 {
            check_finite(*coord)?;
        }
        return Ok(line.clone());
    }

    let coords = line
        .0
        .iter()
        .map(|&coord| {
            check_finite(coord)?;
            let geographic = to_wgs84(from, coord)?;
            from_wgs84(to, geographic)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LineString::from(coords))
}

pub fn polyline_length(line: &LineString<f64>) -> f64 {
    line.lines()
        .map(|segment| {
            Euclidean.distance(
                Point::new(segment.start.x, segment.start.y),
                Point::new(segment.end.x, segment.end.y),
            )
        })
        .sum()
}

fn validate_crs(crs: Crs) -> Result<(), ProjectionError> {
    if let Crs::Utm { zone, .. } = crs {
        if !(1..=60).contains(&zone) {
            return Err(ProjectionError::InvalidUtmZone(zone));
        }
    }
    Ok(())
}

fn check_finite(coord: Coord<f64>) -> Result<(), ProjectionError> {
    if !coord.x.is_finite() || !coord.y.is_finite() {
        return Err(ProjectionError::NonFinite {
            x: coord.x,
            y: coord.y,
        });
    }
    Ok(())
}

// All reprojection routes through geographic coordinates.
fn to_wgs84(from: Crs, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
    match from {
        Crs::Wgs84 => {
            if coord.x.abs() > 180.0 || coord.y.abs() > 90.0 {
                return Err(ProjectionError::OutOfDomain {
                    crs: from,
                    x: coord.x,
                    y: coord.y,
                });
            }
            Ok(coord)
        }
        Crs::WebMercator => {
            let limit = std::f64::consts::PI * MERCATOR_R;
            if coord.x.abs() > limit * 1.000001 {
                return Err(ProjectionError::OutOfDomain {
                    crs: from,
                    x: coord.x,
                    y: coord.y,
                });
            }
            let lon = (coord.x / MERCATOR_R).to_degrees();
            let lat = (2.0 * (coord.y / MERCATOR_R).exp().atan() - std::f64::consts::FRAC_PI_2)
                .to_degrees();
            Ok(Coord { x: lon, y: lat })
        }
        Crs::Utm { zone, north } => utm_to_wgs84(coord, zone, north),
    }
}

fn from_wgs84(to: Crs, coord: Coord<f64>) -> Result<Coord<f64>, ProjectionError> {
    let (lon, lat) = (coord.x, coord.y);
    if lon.abs() > 180.0 || lat.abs() > 90.0 {
        return Err(ProjectionError::OutOfDomain {
            crs: Crs::Wgs84,
            x: lon,
            y: lat,
        });
    }

    match to {
        Crs::Wgs84 => Ok(coord),
        Crs::WebMercator => {
            if lat.abs() > MERCATOR_MAX_LAT {
                return Err(ProjectionError::OutOfDomain {
                    crs: to,
                    x: lon,
                    y: lat,
                });
            }
            let x = MERCATOR_R * lon.to_radians();
            let y = MERCATOR_R
                * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
                    .tan()
                    .ln();
            Ok(Coord { x, y })
        }
        Crs::Utm { zone, north } => wgs84_to_utm(coord, zone, north),
    }
}

// Transverse mercator forward, standard ellipsoidal series.
fn wgs84_to_utm(coord: Coord<f64>, zone: u8, north: bool) -> Result<Coord<f64>, ProjectionError> {
    let crs = Crs::Utm { zone, north };
    if coord.y.abs() > UTM_MAX_LAT {
        return Err(ProjectionError::OutOfDomain {
            crs,
            x: coord.x,
            y: coord.y,
        });
    }

    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);

    let lat = coord.y.to_radians();
    let lon = coord.x.to_radians();
    let lon0 = utm_central_meridian(zone).to_radians();

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = ep2 * cos_lat * cos_lat;
    let a = (lon - lon0) * cos_lat;

    let m = meridional_arc(lat, e2);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let x = UTM_SCALE
        * n
        * (a + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + UTM_FALSE_EASTING;

    let mut y = UTM_SCALE
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }

    Ok(Coord { x, y })
}

// Transverse mercator inverse via the footpoint latitude.
fn utm_to_wgs84(coord: Coord<f64>, zone: u8, north: bool) -> Result<Coord<f64>, ProjectionError> {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);

    let x = coord.x - UTM_FALSE_EASTING;
    let y = if north {
        coord.y
    } else {
        coord.y - UTM_FALSE_NORTHING_SOUTH
    };

    let m = y / UTM_SCALE;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0));

    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;

    let fp = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_fp = fp.sin();
    let cos_fp = fp.cos();
    let tan_fp = fp.tan();

    let c1 = ep2 * cos_fp * cos_fp;
    let t1 = tan_fp * tan_fp;
    let n1 = WGS84_A / (1.0 - e2 * sin_fp * sin_fp).sqrt();
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_fp * sin_fp).powf(1.5);
    let d = x / (n1 * UTM_SCALE);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let lat = fp
        - (n1 * tan_fp / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                    - 252.0 * ep2
                    - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let lon = utm_central_meridian(zone).to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d5
                / 120.0)
            / cos_fp;

    let result = Coord {
        x: lon.to_degrees(),
        y: lat.to_degrees(),
    };
    if result.x.abs() > 180.0 || result.y.abs() > 90.0 {
        return Err(ProjectionError::OutOfDomain {
            crs: Crs::Utm { zone, north },
            x: coord.x,
            y: coord.y,
        });
    }
    Ok(result)
}

fn utm_central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

fn meridional_arc(lat: f64, e2: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}
