use serde_json::{Value, json};
use std::collections::HashMap;

use crate::matcher::MatchCandidate;
use crate::projection::CanonicalGeometry;

/// GeoJSON dumps of the matcher's inputs and outputs, for eyeballing a
/// run in any map viewer. Rendering itself stays outside the engine.
pub struct DebugVisualizer;

impl DebugVisualizer {
    /// One feature per segment geometry, styled by source.
    pub fn segments_geojson(
        segments: &[CanonicalGeometry],
        properties: Option<HashMap<&str, Value>>,
    ) -> Value {
        let default_props = properties.unwrap_or_else(|| {
            let mut props = HashMap::new();
            props.insert("color", json!("#3388ff"));
            props.insert("weight", json!(4));
            props.insert("opacity", json!(0.8));
            props
        });

        let mut features = Vec::new();
        for segment in segments {
            let coords: Vec<Vec<f64>> = segment.line.0.iter().map(|c| vec![c.x, c.y]).collect();

            let mut props = serde_json::Map::new();
            props.insert("segment_id".to_string(), json!(segment.segment_id));
            props.insert("source".to_string(), json!(segment.source.as_str()));
            props.insert("direction".to_string(), json!(format!("{:?}", segment.direction)));
            props.insert("length_m".to_string(), json!(segment.length_m));
            for (key, value) in &default_props {
                props.insert(key.to_string(), value.clone());
            }

            features.push(json!({
                "type": "Feature",
                "properties": props,
                "geometry": {
                    "type": "LineString",
                    "coordinates": coords
                }
            }));
        }

        json!({
            "type": "FeatureCollection",
            "features": features
        })
    }

    /// The correspondence table as line features connecting each matched
    /// pair, carrying overlap and direction diagnostics.
    pub fn candidates_geojson(
        candidates: &[MatchCandidate],
        stations: &[CanonicalGeometry],
        tmcs: &[CanonicalGeometry],
    ) -> Value {
        let station_index: HashMap<&str, &CanonicalGeometry> = stations
            .iter()
            .map(|g| (g.segment_id.as_str(), g))
            .collect();
        let tmc_index: HashMap<&str, &CanonicalGeometry> =
            tmcs.iter().map(|g| (g.segment_id.as_str(), g)).collect();

        let mut features = Vec::new();
        for candidate in candidates {
            let (Some(station), Some(tmc)) = (
                station_index.get(candidate.station_id.as_str()),
                tmc_index.get(candidate.tmc_id.as_str()),
            ) else {
                continue;
            };

            let color = if candidate.direction_agreement {
                "#2ecc71"
            } else {
                "#e67e22"
            };

            for geometry in [station, tmc] {
                let coords: Vec<Vec<f64>> =
                    geometry.line.0.iter().map(|c| vec![c.x, c.y]).collect();
                features.push(json!({
                    "type": "Feature",
                    "properties": {
                        "station_id": candidate.station_id,
                        "tmc_id": candidate.tmc_id,
                        "overlap_m": candidate.overlap_m,
                        "overlap_ratio_station": candidate.overlap_ratio_station,
                        "overlap_ratio_tmc": candidate.overlap_ratio_tmc,
                        "direction_agreement": candidate.direction_agreement,
                        "source": geometry.source.as_str(),
                        "color": color,
                        "weight": 3,
                    },
                    "geometry": {
                        "type": "LineString",
                        "coordinates": coords
                    }
                }));
            }
        }

        json!({
            "type": "FeatureCollection",
            "features": features
        })
    }
}
