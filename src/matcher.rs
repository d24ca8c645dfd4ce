use geo::{Coord, LineString};
use log::debug;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::FusionConfig;
use crate::ingest::TravelDirection;
use crate::projection::CanonicalGeometry;

/// One station/TMC correspondence surviving the geometric checks.
///
/// The matcher reports every qualifying candidate; collapsing a station
/// segment to a single primary TMC is the assembler's policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub station_id: String,
    pub tmc_id: String,
    /// Length of TMC linework inside the buffered station linework, meters.
    pub overlap_m: f64,
    pub overlap_ratio_station: f64,
    pub overlap_ratio_tmc: f64,
    pub direction_agreement: bool,
}

// Wrapper so TMC geometries can live in an R-tree
struct IndexedSegment {
    position: usize,
    bbox: geo::Rect<f64>,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min().x, self.bbox.min().y],
            [self.bbox.max().x, self.bbox.max().y],
        )
    }
}

/// Compute all match candidates between station and TMC geometry sets.
///
/// Station segments are independent units of work and are matched in
/// parallel; the result order follows the station input order so runs
/// are reproducible.
pub fn match_segments(
    stations: &[CanonicalGeometry],
    tmcs: &[CanonicalGeometry],
    config: &FusionConfig,
) -> Vec<MatchCandidate> {
    let index = RTree::bulk_load(
        tmcs.iter()
            .enumerate()
            .map(|(position, tmc)| IndexedSegment {
                position,
                bbox: tmc.bounding_box(),
            })
            .collect(),
    );

    let mut candidates: Vec<MatchCandidate> = stations
        .par_iter()
        .map(|station| match_one_station(station, &index, tmcs, config))
        .flatten()
        .collect();

    sort_candidates(&mut candidates);
    debug!(
        "matched {} stations against {} TMC segments: {} candidates",
        stations.len(),
        tmcs.len(),
        candidates.len()
    );
    candidates
}

fn match_one_station(
    station: &CanonicalGeometry,
    index: &RTree<IndexedSegment>,
    tmcs: &[CanonicalGeometry],
    config: &FusionConfig,
) -> Vec<MatchCandidate> {
    if station.length_m <= 0.0 {
        return Vec::new();
    }

    // 1. Bounding-box pruning against the buffered station envelope
    let bbox = station.bounding_box();
    let buffered = AABB::from_corners(
        [
            bbox.min().x - config.buffer_distance_m,
            bbox.min().y - config.buffer_distance_m,
        ],
        [
            bbox.max().x + config.buffer_distance_m,
            bbox.max().y + config.buffer_distance_m,
        ],
    );

    let mut candidates = Vec::new();
    for hit in index.locate_in_envelope_intersecting(&buffered) {
        let tmc = &tmcs[hit.position];
        if tmc.length_m <= 0.0 {
            continue;
        }

        // 2. True overlap of TMC linework with the buffered station line
        let overlap_m = overlap_length(&tmc.line, &station.line, config.buffer_distance_m);
        if overlap_m <= 0.0 {
            // Envelope intersection alone does not qualify
            continue;
        }

        let overlap_ratio_station = (overlap_m / station.length_m).min(1.0);
        let overlap_ratio_tmc = (overlap_m / tmc.length_m).min(1.0);
        if overlap_ratio_station < config.min_overlap_ratio {
            continue;
        }

        // Disagreement is surfaced, not disqualifying: the two feeds'
        // direction vocabularies are not fully reconcilable
        let direction_agreement = station.direction != TravelDirection::Unknown
            && station.direction == tmc.direction;

        candidates.push(MatchCandidate {
            station_id: station.segment_id.clone(),
            tmc_id: tmc.segment_id.clone(),
            overlap_m,
            overlap_ratio_station,
            overlap_ratio_tmc,
            direction_agreement,
        });
    }

    candidates
}

/// Deterministic candidate ordering: higher overlap ratio vs. the
/// station first, then direction agreement, then lower TMC id.
pub fn candidate_order(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    OrderedFloat(b.overlap_ratio_station)
        .cmp(&OrderedFloat(a.overlap_ratio_station))
        .then_with(|| b.direction_agreement.cmp(&a.direction_agreement))
        .then_with(|| a.tmc_id.cmp(&b.tmc_id))
}

pub fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        a.station_id
            .cmp(&b.station_id)
            .then_with(|| candidate_order(a, b))
    });
}

/// Length of `line` lying within `tolerance` meters of `reference`,
/// computed exactly per constituent segment.
///
/// For each edge of `line`, the parameter set within tolerance of a
/// reference edge's capsule is a union of intervals found by solving
/// the point and perpendicular distance conditions; the measure of the
/// merged union scales the edge length.
pub fn overlap_length(line: &LineString<f64>, reference: &LineString<f64>, tolerance: f64) -> f64 {
    let mut total = 0.0;

    for edge in line.lines() {
        let edge_len = hypot(edge.end.x - edge.start.x, edge.end.y - edge.start.y);
        if edge_len <= 0.0 {
            continue;
        }

        let mut intervals: Vec<(f64, f64)> = Vec::new();
        for ref_edge in reference.lines() {
            capsule_intervals(
                edge.start,
                edge.end,
                ref_edge.start,
                ref_edge.end,
                tolerance,
                &mut intervals,
            );
        }

        total += merged_measure(&mut intervals) * edge_len;
    }

    total
}

// Sub-intervals of t in [0, 1] where P(t) = a + t(b - a) is within
// `tol` of the segment (c, d).
fn capsule_intervals(
    a: Coord<f64>,
    b: Coord<f64>,
    c: Coord<f64>,
    d: Coord<f64>,
    tol: f64,
    out: &mut Vec<(f64, f64)>,
) {
    let ab = (b.x - a.x, b.y - a.y);
    let cd = (d.x - c.x, d.y - c.y);
    let ac = (a.x - c.x, a.y - c.y);
    let cd_len2 = dot(cd, cd);

    if cd_len2 <= f64::EPSILON {
        // Degenerate reference edge, a point
        push_point_interval(a, ab, c, tol, 0.0, 1.0, out);
        return;
    }

    // Projection parameter of P(t) onto (c, d) is affine in t
    let s0 = dot(ac, cd) / cd_len2;
    let s1 = dot(ab, cd) / cd_len2;

    // Partition [0, 1] into regimes: nearest to c, to the interior, to d
    let mut cuts = vec![0.0, 1.0];
    if s1.abs() > f64::EPSILON {
        for boundary in [(-s0) / s1, (1.0 - s0) / s1] {
            if boundary > 0.0 && boundary < 1.0 {
                cuts.push(boundary);
            }
        }
    }
    cuts.sort_by(|x, y| x.partial_cmp(y).unwrap_or(Ordering::Equal));

    for window in cuts.windows(2) {
        let (lo, hi) = (window[0], window[1]);
        if hi - lo <= f64::EPSILON {
            continue;
        }
        let mid_s = s0 + s1 * (lo + hi) / 2.0;

        if mid_s < 0.0 {
            push_point_interval(a, ab, c, tol, lo, hi, out);
        } else if mid_s > 1.0 {
            push_point_interval(a, ab, d, tol, lo, hi, out);
        } else {
            // Interior regime: perpendicular distance to the line (c, d)
            // is affine in t
            let cd_len = cd_len2.sqrt();
            let w0 = cross(ac, cd) / cd_len;
            let w1 = cross(ab, cd) / cd_len;

            if w1.abs() <= f64::EPSILON {
                if w0.abs() <= tol {
                    out.push((lo, hi));
                }
            } else {
                let t_low = (-tol - w0) / w1;
                let t_high = (tol - w0) / w1;
                let (t0, t1) = if t_low <= t_high {
                    (t_low, t_high)
                } else {
                    (t_high, t_low)
                };
                let start = t0.max(lo);
                let end = t1.min(hi);
                if end > start {
                    out.push((start, end));
                }
            }
        }
    }
}

// Solve |a + t*ab - q|^2 <= tol^2 on [lo, hi] and push the interval.
fn push_point_interval(
    a: Coord<f64>,
    ab: (f64, f64),
    q: Coord<f64>,
    tol: f64,
    lo: f64,
    hi: f64,
    out: &mut Vec<(f64, f64)>,
) {
    let w = (a.x - q.x, a.y - q.y);
    let qa = dot(ab, ab);
    let qb = 2.0 * dot(w, ab);
    let qc = dot(w, w) - tol * tol;

    if qa <= f64::EPSILON {
        if qc <= 0.0 {
            out.push((lo, hi));
        }
        return;
    }

    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return;
    }
    let sqrt_disc = disc.sqrt();
    let t0 = (-qb - sqrt_disc) / (2.0 * qa);
    let t1 = (-qb + sqrt_disc) / (2.0 * qa);

    let start = t0.max(lo);
    let end = t1.min(hi);
    if end > start {
        out.push((start, end));
    }
}

// Total measure of a union of intervals; sorts and merges in place.
fn merged_measure(intervals: &mut Vec<(f64, f64)>) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut total = 0.0;
    let (mut current_start, mut current_end) = intervals[0];
    for &(start, end) in intervals.iter().skip(1) {
        if start > current_end {
            total += current_end - current_start;
            current_start = start;
            current_end = end;
        } else if end > current_end {
            current_end = end;
        }
    }
    total + (current_end - current_start)
}

fn dot(a: (f64, f64), b: (f64, f64)) -> f64 {
    a.0 * b.0 + a.1 * b.1
}

fn cross(a: (f64, f64), b: (f64, f64)) -> f64 {
    a.0 * b.1 - a.1 * b.0
}

fn hypot(dx: f64, dy: f64) -> f64 {
    (dx * dx + dy * dy).sqrt()
}
