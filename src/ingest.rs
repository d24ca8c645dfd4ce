use chrono::{DateTime, FixedOffset, Utc};
use geo::LineString;
use serde::{Deserialize, Serialize};

use crate::projection::Crs;

/// Which feed a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Public agency feed, keyed by sensor station.
    Station,
    /// Commercial feed, keyed by Traffic Message Channel code.
    Tmc,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Station => "station",
            SourceKind::Tmc => "tmc",
        }
    }
}

/// Direction of travel, normalized across both feeds' vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TravelDirection {
    Northbound,
    Southbound,
    Eastbound,
    Westbound,
    Unknown,
}

impl TravelDirection {
    /// Normalize a source direction label, falling back to the bound
    /// label ("NB", "SB", ...) when the primary label is unusable.
    ///
    /// The station feed carries full words with known quirks (a truncated
    /// "NORT", "CONST" for construction zones); the TMC feed carries
    /// "NORTHBOUND"-style words.
    pub fn from_labels(direction: &str, bound: Option<&str>) -> Self {
        let primary = match direction.trim().to_ascii_uppercase().as_str() {
            "NORTHBOUND" | "NORTH" | "NORT" => Some(TravelDirection::Northbound),
            "SOUTHBOUND" | "SOUTH" => Some(TravelDirection::Southbound),
            "EASTBOUND" | "EAST" => Some(TravelDirection::Eastbound),
            "WESTBOUND" | "WEST" => Some(TravelDirection::Westbound),
            // "CONST" and anything unrecognized fall through to the bound
            _ => None,
        };

        if let Some(dir) = primary {
            return dir;
        }

        match bound.map(|b| b.trim().to_ascii_uppercase()).as_deref() {
            Some("NB") => TravelDirection::Northbound,
            Some("SB") => TravelDirection::Southbound,
            Some("EB") => TravelDirection::Eastbound,
            Some("WB") => TravelDirection::Westbound,
            // "JB"/"ZB" are internal station-feed codes with no bearing
            _ => TravelDirection::Unknown,
        }
    }
}

/// Native geometry payload of one raw segment record.
///
/// Decode dispatches on the variant; every variant yields the same
/// canonical line geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GeometryEncoding {
    /// Fixed-width hex digit groups of scaled integer lon/lat pairs.
    PackedHex(String),
    /// Hex-encoded (E)WKB LineString as emitted by PostGIS exports.
    WkbHex(String),
    /// Already-structured vector geometry.
    Vector(LineString<f64>),
}

/// One segment record as ingested, before any decoding. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    pub id: String,
    pub source: SourceKind,
    pub geometry: GeometryEncoding,
    /// CRS the source declares for its coordinates. `None` falls back to
    /// the per-source default during decoding.
    pub declared_crs: Option<Crs>,
    pub direction_label: String,
    /// Secondary direction code carried by the station highway metadata.
    pub bound_label: Option<String>,
    /// Activity window of the segment definition; an open end means the
    /// segment is still active.
    pub active_from: Option<DateTime<Utc>>,
    pub active_until: Option<DateTime<Utc>>,
}

impl RawSegment {
    pub fn new(
        id: impl Into<String>,
        source: SourceKind,
        geometry: GeometryEncoding,
        direction_label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            geometry,
            declared_crs: None,
            direction_label: direction_label.into(),
            bound_label: None,
            active_from: None,
            active_until: None,
        }
    }

    pub fn direction(&self) -> TravelDirection {
        TravelDirection::from_labels(&self.direction_label, self.bound_label.as_deref())
    }

    /// Whether this segment definition was active at any point of the
    /// given window.
    pub fn active_during(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let starts_in_time = self.active_from.map(|from| from <= end).unwrap_or(true);
        let still_active = self.active_until.map(|until| until >= start).unwrap_or(true);
        starts_in_time && still_active
    }
}

/// One raw metric observation, still carrying its original UTC offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub segment_id: String,
    pub source: SourceKind,
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
}

impl RawSample {
    pub fn new(
        segment_id: impl Into<String>,
        source: SourceKind,
        timestamp: DateTime<FixedOffset>,
        value: f64,
    ) -> Self {
        Self {
            segment_id: segment_id.into(),
            source,
            timestamp,
            value,
        }
    }

    /// Rescale the metric value, e.g. minutes to seconds for station
    /// travel times that arrive in minutes.
    pub fn scaled(mut self, factor: f64) -> Self {
        self.value *= factor;
        self
    }
}

/// Repair timestamp strings whose UTC offset lacks minutes, turning a
/// trailing "-08" into "-08:00". Strings already carrying offset minutes
/// pass through untouched.
pub fn normalize_timestamp(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 3 {
        let tail = &bytes[bytes.len() - 3..];
        if (tail[0] == b'+' || tail[0] == b'-')
            && tail[1].is_ascii_digit()
            && tail[2].is_ascii_digit()
        {
            return format!("{raw}:00");
        }
    }
    raw.to_string()
}

/// Parse one source timestamp. Accepts RFC 3339 as well as the
/// space-separated "2023-10-01 08:07:00-08:00" form the station feed
/// exports, with or without fractional seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    let repaired = normalize_timestamp(raw.trim());
    DateTime::parse_from_rfc3339(&repaired)
        .or_else(|_| DateTime::parse_from_str(&repaired, "%Y-%m-%d %H:%M:%S%.f%:z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_full_words() {
        assert_eq!(
            TravelDirection::from_labels("NORTHBOUND", None),
            TravelDirection::Northbound
        );
        assert_eq!(
            TravelDirection::from_labels("south", None),
            TravelDirection::Southbound
        );
    }

    #[test]
    fn truncated_station_label_still_resolves() {
        assert_eq!(
            TravelDirection::from_labels("NORT", None),
            TravelDirection::Northbound
        );
    }

    #[test]
    fn construction_label_falls_back_to_bound() {
        assert_eq!(
            TravelDirection::from_labels("CONST", Some("EB")),
            TravelDirection::Eastbound
        );
        assert_eq!(
            TravelDirection::from_labels("CONST", Some("ZB")),
            TravelDirection::Unknown
        );
    }

    #[test]
    fn bare_hour_offset_is_repaired() {
        assert_eq!(
            normalize_timestamp("2023-10-01 08:07:00-08"),
            "2023-10-01 08:07:00-08:00"
        );
        assert_eq!(
            normalize_timestamp("2023-10-01 08:07:00-08:00"),
            "2023-10-01 08:07:00-08:00"
        );
    }

    #[test]
    fn parses_both_timestamp_shapes() {
        let a = parse_timestamp("2023-10-01T08:07:00-08:00").unwrap();
        let b = parse_timestamp("2023-10-01 08:07:00-08").unwrap();
        assert_eq!(a, b);

        let with_fraction = parse_timestamp("2023-10-01 08:07:00.250000-08").unwrap();
        assert_eq!(with_fraction.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn metric_scale_converts_minutes_to_seconds() {
        let sample = RawSample::new(
            "1091",
            SourceKind::Station,
            parse_timestamp("2023-10-01 08:00:00-08").unwrap(),
            1.5,
        )
        .scaled(60.0);
        assert_eq!(sample.value, 90.0);
    }

    #[test]
    fn activity_window_with_open_end_is_active() {
        let mut seg = RawSegment::new(
            "1091",
            SourceKind::Station,
            GeometryEncoding::PackedHex(String::new()),
            "NORTH",
        );
        seg.active_from = Some("2019-01-01T00:00:00Z".parse().unwrap());
        let start = "2023-10-01T00:00:00Z".parse().unwrap();
        let end = "2023-12-31T23:59:59Z".parse().unwrap();
        assert!(seg.active_during(start, end));

        seg.active_until = Some("2020-06-01T00:00:00Z".parse().unwrap());
        assert!(!seg.active_during(start, end));
    }
}
