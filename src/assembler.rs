use chrono::DateTime;
use chrono_tz::Tz;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{FusionConfig, MatchSelectionPolicy};
use crate::matcher::{MatchCandidate, candidate_order};
use crate::timebin::TimeBin;

/// Terminal output row of the engine, one per (pair, bin).
#[derive(Debug, Clone, Serialize)]
pub struct MergedRecord {
    pub station_id: String,
    pub tmc_id: String,
    pub bin_start: DateTime<Tz>,
    pub station_value: Option<f64>,
    pub tmc_value: Option<f64>,
    pub both_observed: bool,
    /// Coverage score of the whole pair this record belongs to.
    pub coverage_score: f64,
    /// Station minus TMC metric, where both sides were observed.
    pub value_delta: Option<f64>,
}

/// Inclusion decision for one matched pair, always reported.
#[derive(Debug, Clone, Serialize)]
pub struct PairCoverage {
    pub station_id: String,
    pub tmc_id: String,
    pub overlap_ratio_station: f64,
    pub direction_agreement: bool,
    pub coverage_score: f64,
    pub included: bool,
}

#[derive(Debug, Default)]
pub struct JoinOutput {
    pub records: Vec<MergedRecord>,
    /// Every considered pair with its score, included or not.
    pub coverage: Vec<PairCoverage>,
}

/// Join the two sources' bin series across the matched pairs.
///
/// Best-only selection keeps one primary TMC per station segment using
/// the matcher's ordering; all-candidates keeps every qualifying pair.
/// Pairs under the coverage threshold contribute no records but stay in
/// the coverage report, so exclusions are inspectable.
pub fn assemble(
    candidates: &[MatchCandidate],
    station_bins: &HashMap<String, Vec<TimeBin>>,
    tmc_bins: &HashMap<String, Vec<TimeBin>>,
    config: &FusionConfig,
) -> JoinOutput {
    let selected = select_pairs(candidates, config.selection_policy);
    debug!(
        "assembling {} pairs ({} candidates before selection)",
        selected.len(),
        candidates.len()
    );

    let mut output = JoinOutput::default();

    for candidate in selected {
        let station_series = station_bins.get(&candidate.station_id);
        let tmc_series = tmc_bins.get(&candidate.tmc_id);

        let (score, records) = match (station_series, tmc_series) {
            (Some(station), Some(tmc)) => merge_pair(candidate, station, tmc),
            // A side with no time series at all is zero coverage
            _ => (0.0, Vec::new()),
        };

        let included = score >= config.min_coverage_score;
        output.coverage.push(PairCoverage {
            station_id: candidate.station_id.clone(),
            tmc_id: candidate.tmc_id.clone(),
            overlap_ratio_station: candidate.overlap_ratio_station,
            direction_agreement: candidate.direction_agreement,
            coverage_score: score,
            included,
        });

        if included {
            output.records.extend(records);
        } else {
            info!(
                "pair ({}, {}) excluded: coverage {:.3} below minimum {:.3}",
                candidate.station_id, candidate.tmc_id, score, config.min_coverage_score
            );
        }
    }

    output
}

/// Apply the pair selection policy. Best-only keeps the top-ranked
/// candidate per station segment; ranking ties resolve exactly as in
/// the matcher, so selection is reproducible.
pub fn select_pairs(
    candidates: &[MatchCandidate],
    policy: MatchSelectionPolicy,
) -> Vec<&MatchCandidate> {
    match policy {
        MatchSelectionPolicy::AllCandidates => candidates.iter().collect(),
        MatchSelectionPolicy::BestOnly => {
            let mut best: HashMap<&str, &MatchCandidate> = HashMap::new();
            for candidate in candidates {
                best.entry(candidate.station_id.as_str())
                    .and_modify(|current| {
                        if candidate_order(candidate, *current).is_lt() {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
            let mut selected: Vec<&MatchCandidate> = best.into_values().collect();
            selected.sort_by(|a, b| a.station_id.cmp(&b.station_id));
            selected
        }
    }
}

fn merge_pair(
    candidate: &MatchCandidate,
    station: &[TimeBin],
    tmc: &[TimeBin],
) -> (f64, Vec<MergedRecord>) {
    debug_assert_eq!(station.len(), tmc.len(), "both series share one grid");

    let total = station.len().min(tmc.len());
    if total == 0 {
        return (0.0, Vec::new());
    }

    let both_count = station
        .iter()
        .zip(tmc.iter())
        .filter(|(s, t)| s.observed && t.observed)
        .count();
    let score = both_count as f64 / total as f64;

    let records = station
        .iter()
        .zip(tmc.iter())
        .map(|(s, t)| {
            let both_observed = s.observed && t.observed;
            MergedRecord {
                station_id: candidate.station_id.clone(),
                tmc_id: candidate.tmc_id.clone(),
                bin_start: s.bin_start,
                station_value: s.value,
                tmc_value: t.value,
                both_observed,
                coverage_score: score,
                value_delta: match (both_observed, s.value, t.value) {
                    (true, Some(sv), Some(tv)) => Some(sv - tv),
                    _ => None,
                },
            }
        })
        .collect();

    (score, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{RawSample, SourceKind, parse_timestamp};
    use crate::timebin::normalize_series;
    use chrono::{DateTime, Utc};

    fn utc(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap().with_timezone(&Utc)
    }

    fn candidate(station: &str, tmc: &str, ratio: f64, agreement: bool) -> MatchCandidate {
        MatchCandidate {
            station_id: station.into(),
            tmc_id: tmc.into(),
            overlap_m: ratio * 100.0,
            overlap_ratio_station: ratio,
            overlap_ratio_tmc: ratio,
            direction_agreement: agreement,
        }
    }

    // Ten 15-minute bins with samples in the first `observed` bins
    fn series(
        id: &str,
        source: SourceKind,
        observed: usize,
        config: &FusionConfig,
    ) -> Vec<TimeBin> {
        let samples: Vec<RawSample> = (0..observed)
            .map(|i| {
                let minute = i * 15;
                let stamp = format!("2023-10-01 08:{:02}:00-08:00", minute % 60);
                let hour_shift = chrono::Duration::hours((minute / 60) as i64);
                RawSample::new(
                    id,
                    source,
                    parse_timestamp(&stamp).unwrap() + hour_shift,
                    60.0 + i as f64,
                )
            })
            .collect();
        normalize_series(
            id,
            source,
            &samples,
            utc("2023-10-01 08:00:00-08:00"),
            utc("2023-10-01 10:29:59-08:00"),
            config,
        )
    }

    #[test]
    fn low_coverage_pair_is_excluded_and_reported() {
        let config = FusionConfig {
            min_coverage_score: 0.8,
            ..Default::default()
        };
        let candidates = vec![candidate("1091", "114-04609", 0.9, true)];
        let mut station_bins = HashMap::new();
        let mut tmc_bins = HashMap::new();
        // 4 of 10 bins bilaterally observed
        station_bins.insert("1091".to_string(), series("1091", SourceKind::Station, 4, &config));
        tmc_bins.insert(
            "114-04609".to_string(),
            series("114-04609", SourceKind::Tmc, 10, &config),
        );

        let output = assemble(&candidates, &station_bins, &tmc_bins, &config);
        assert!(output.records.is_empty());
        assert_eq!(output.coverage.len(), 1);
        let entry = &output.coverage[0];
        assert!(!entry.included);
        assert!((entry.coverage_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn qualifying_pair_produces_full_grid_of_records() {
        let config = FusionConfig {
            min_coverage_score: 0.8,
            ..Default::default()
        };
        let candidates = vec![candidate("1091", "114-04609", 0.9, true)];
        let mut station_bins = HashMap::new();
        let mut tmc_bins = HashMap::new();
        station_bins.insert("1091".to_string(), series("1091", SourceKind::Station, 9, &config));
        tmc_bins.insert(
            "114-04609".to_string(),
            series("114-04609", SourceKind::Tmc, 10, &config),
        );

        let output = assemble(&candidates, &station_bins, &tmc_bins, &config);
        assert_eq!(output.records.len(), 10);
        assert!(output.coverage[0].included);
        for record in &output.records {
            assert!(record.coverage_score >= config.min_coverage_score);
            if record.both_observed {
                assert!(record.station_value.is_some());
                assert!(record.tmc_value.is_some());
                assert!(record.value_delta.is_some());
            } else {
                assert_eq!(record.value_delta, None);
            }
        }
        assert_eq!(output.records.iter().filter(|r| !r.both_observed).count(), 1);
    }

    #[test]
    fn best_only_selects_highest_overlap_ratio() {
        let candidates = vec![
            candidate("1091", "114-04609", 0.9, true),
            candidate("1091", "114-04610", 0.4, true),
        ];
        let selected = select_pairs(&candidates, MatchSelectionPolicy::BestOnly);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].tmc_id, "114-04609");
    }

    #[test]
    fn all_candidates_policy_keeps_every_pair() {
        let candidates = vec![
            candidate("1091", "114-04609", 0.9, true),
            candidate("1091", "114-04610", 0.4, true),
        ];
        let selected = select_pairs(&candidates, MatchSelectionPolicy::AllCandidates);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn missing_time_series_means_zero_coverage() {
        let config = FusionConfig::default();
        let candidates = vec![candidate("1091", "114-04609", 0.9, true)];
        let station_bins = HashMap::new();
        let tmc_bins = HashMap::new();

        let output = assemble(&candidates, &station_bins, &tmc_bins, &config);
        assert!(output.records.is_empty());
        assert_eq!(output.coverage[0].coverage_score, 0.0);
        assert!(!output.coverage[0].included);
    }
}
