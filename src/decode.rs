use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::{GeometryEncoding, RawSegment, SourceKind, TravelDirection};
use crate::projection::Crs;

/// Packed-hex coordinates are scaled degrees, five decimal places.
pub const PACKED_SCALE: f64 = 1e5;
/// Hex digits per packed coordinate.
const PACKED_GROUP_DIGITS: usize = 8;

const EWKB_SRID_FLAG: u32 = 0x2000_0000;
const EWKB_Z_FLAG: u32 = 0x8000_0000;
const EWKB_M_FLAG: u32 = 0x4000_0000;
const WKB_LINESTRING: u32 = 2;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("hex geometry has odd length ({0} digits)")]
    OddHexLength(usize),
    #[error("invalid hex digit {digit:?} at offset {offset}")]
    InvalidHexDigit { digit: char, offset: usize },
    #[error("packed geometry has {digits} hex digits, not a whole number of lon/lat pairs")]
    RaggedCoordinates { digits: usize },
    #[error("geometry has {0} points, a segment needs at least 2")]
    TooFewPoints(usize),
    #[error("coordinate ({lon}, {lat}) is out of range after descaling")]
    CoordinateOutOfRange { lon: f64, lat: f64 },
    #[error("coordinate ({x}, {y}) is not finite")]
    NonFiniteCoordinate { x: f64, y: f64 },
    #[error("WKB payload truncated at byte {0}")]
    Truncated(usize),
    #[error("unsupported WKB byte order marker {0:#04x}")]
    UnknownByteOrder(u8),
    #[error("unsupported WKB geometry type {0:#010x}, only 2D LineString is accepted")]
    UnsupportedGeometryType(u32),
    #[error("embedded SRID {0} does not name a known CRS")]
    UnknownSrid(u32),
}

/// Decoded line geometry still tagged with its source CRS. Input to the
/// CRS normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedGeometry {
    pub segment_id: String,
    pub source: SourceKind,
    pub crs: Crs,
    pub line: LineString<f64>,
    pub direction: TravelDirection,
}

/// CRS assumed when a source record declares none.
///
/// Station geometry comes out of a PostGIS export in web mercator; TMC
/// shapefiles carry plain lon/lat.
pub fn default_crs(source: SourceKind) -> Crs {
    match source {
        SourceKind::Station => Crs::WebMercator,
        SourceKind::Tmc => Crs::Wgs84,
    }
}

/// Decode one raw segment into line geometry, dispatching on the
/// encoding variant. Pure function of the input record.
pub fn decode_segment(segment: &RawSegment) -> Result<DecodedGeometry, DecodeError> {
    let declared = segment.declared_crs.unwrap_or_else(|| default_crs(segment.source));

    let (line, crs) = match &segment.geometry {
        GeometryEncoding::PackedHex(hex) => {
            // The packed encoding is defined over scaled degrees
            (decode_packed_hex(hex)?, Crs::Wgs84)
        }
        GeometryEncoding::WkbHex(hex) => {
            let (line, embedded_srid) = decode_wkb_hex(hex)?;
            let crs = match embedded_srid {
                // An embedded SRID overrides whatever the record declared
                Some(srid) => {
                    Crs::from_epsg(srid).map_err(|_| DecodeError::UnknownSrid(srid))?
                }
                None => declared,
            };
            (line, crs)
        }
        GeometryEncoding::Vector(line) => {
            for coord in &line.0 {
                if !coord.x.is_finite() || !coord.y.is_finite() {
                    return Err(DecodeError::NonFiniteCoordinate {
                        x: coord.x,
                        y: coord.y,
                    });
                }
            }
            if line.0.len() < 2 {
                return Err(DecodeError::TooFewPoints(line.0.len()));
            }
            (line.clone(), declared)
        }
    };

    Ok(DecodedGeometry {
        segment_id: segment.id.clone(),
        source: segment.source,
        crs,
        line,
        direction: segment.direction(),
    })
}

/// Decode fixed-width packed hex: 8 hex digits per coordinate, signed
/// scaled integers, (lon, lat) pair order. Point order is preserved.
pub fn decode_packed_hex(hex: &str) -> Result<LineString<f64>, DecodeError> {
    let digits = hex.len();
    if digits % 2 != 0 {
        return Err(DecodeError::OddHexLength(digits));
    }
    if digits % PACKED_GROUP_DIGITS != 0 || (digits / PACKED_GROUP_DIGITS) % 2 != 0 {
        return Err(DecodeError::RaggedCoordinates { digits });
    }

    let mut values = Vec::with_capacity(digits / PACKED_GROUP_DIGITS);
    for (group_index, group) in hex.as_bytes().chunks(PACKED_GROUP_DIGITS).enumerate() {
        let mut word: u32 = 0;
        for (i, &byte) in group.iter().enumerate() {
            let nibble = (byte as char).to_digit(16).ok_or(DecodeError::InvalidHexDigit {
                digit: byte as char,
                offset: group_index * PACKED_GROUP_DIGITS + i,
            })?;
            word = (word << 4) | nibble;
        }
        // Two's complement: the sign bit carries through the cast
        values.push(word as i32 as f64 / PACKED_SCALE);
    }

    let coords: Vec<Coord<f64>> = values
        .chunks(2)
        .map(|pair| Coord {
            x: pair[0],
            y: pair[1],
        })
        .collect();

    if coords.len() < 2 {
        return Err(DecodeError::TooFewPoints(coords.len()));
    }
    for coord in &coords {
        if coord.x.abs() > 180.0 || coord.y.abs() > 90.0 {
            return Err(DecodeError::CoordinateOutOfRange {
                lon: coord.x,
                lat: coord.y,
            });
        }
    }

    Ok(LineString::from(coords))
}

/// Re-encode a lon/lat line into the packed hex format. The inverse of
/// [`decode_packed_hex`] up to the encoding's scale resolution.
pub fn encode_packed_hex(line: &LineString<f64>) -> String {
    let mut out = String::with_capacity(line.0.len() * 2 * PACKED_GROUP_DIGITS);
    for coord in &line.0 {
        for value in [coord.x, coord.y] {
            let scaled = (value * PACKED_SCALE).round() as i32;
            out.push_str(&format!("{:08x}", scaled as u32));
        }
    }
    out
}

/// Decode a hex (E)WKB LineString, returning the geometry and any SRID
/// embedded via the EWKB flag word.
pub fn decode_wkb_hex(hex: &str) -> Result<(LineString<f64>, Option<u32>), DecodeError> {
    let bytes = hex_to_bytes(hex)?;
    let mut reader = WkbReader::new(&bytes);

    let little_endian = match reader.read_u8()? {
        0x00 => false,
        0x01 => true,
        other => return Err(DecodeError::UnknownByteOrder(other)),
    };

    let type_word = reader.read_u32(little_endian)?;
    if type_word & (EWKB_Z_FLAG | EWKB_M_FLAG) != 0 {
        return Err(DecodeError::UnsupportedGeometryType(type_word));
    }
    let base_type = type_word & !EWKB_SRID_FLAG;
    if base_type != WKB_LINESTRING {
        return Err(DecodeError::UnsupportedGeometryType(type_word));
    }

    let srid = if type_word & EWKB_SRID_FLAG != 0 {
        Some(reader.read_u32(little_endian)?)
    } else {
        None
    };

    let num_points = reader.read_u32(little_endian)? as usize;
    if num_points < 2 {
        return Err(DecodeError::TooFewPoints(num_points));
    }

    let mut coords = Vec::with_capacity(num_points);
    for _ in 0..num_points {
        let x = reader.read_f64(little_endian)?;
        let y = reader.read_f64(little_endian)?;
        if !x.is_finite() || !y.is_finite() {
            return Err(DecodeError::NonFiniteCoordinate { x, y });
        }
        coords.push(Coord { x, y });
    }

    Ok((LineString::from(coords), srid))
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddHexLength(hex.len()));
    }
    hex.as_bytes()
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let high = (pair[0] as char)
                .to_digit(16)
                .ok_or(DecodeError::InvalidHexDigit {
                    digit: pair[0] as char,
                    offset: i * 2,
                })?;
            let low = (pair[1] as char)
                .to_digit(16)
                .ok_or(DecodeError::InvalidHexDigit {
                    digit: pair[1] as char,
                    offset: i * 2 + 1,
                })?;
            Ok(((high << 4) | low) as u8)
        })
        .collect()
}

struct WkbReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WkbReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.offset + n > self.bytes.len() {
            return Err(DecodeError::Truncated(self.offset));
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self, little_endian: bool) -> Result<u32, DecodeError> {
        let raw: [u8; 4] = self.take(4)?.try_into().expect("slice length checked");
        Ok(if little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    fn read_f64(&mut self, little_endian: bool) -> Result<f64, DecodeError> {
        let raw: [u8; 8] = self.take(8)?.try_into().expect("slice length checked");
        Ok(if little_endian {
            f64::from_le_bytes(raw)
        } else {
            f64::from_be_bytes(raw)
        })
    }
}
