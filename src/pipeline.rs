use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::assembler::{self, MergedRecord, PairCoverage};
use crate::config::{ConfigurationError, FusionConfig};
use crate::decode;
use crate::ingest::{RawSample, RawSegment, SourceKind};
use crate::matcher::{self, MatchCandidate};
use crate::projection::{self, CanonicalGeometry};
use crate::timebin::{self, TimeBin};

/// Stage at which a segment fell out of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureStage {
    Decode,
    Projection,
    ActivityWindow,
}

/// One segment excluded from downstream stages, with its reason.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentFailure {
    pub segment_id: String,
    pub source: SourceKind,
    pub stage: FailureStage,
    pub reason: String,
}

/// Everything the caller needs to audit a run: per-segment failures and
/// the per-pair coverage decisions.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub segments_in: usize,
    pub segments_usable: usize,
    pub candidate_count: usize,
    pub pairs_included: usize,
    pub pairs_excluded: usize,
    pub failures: Vec<SegmentFailure>,
    pub coverage: Vec<PairCoverage>,
}

pub struct FusionOutput {
    pub records: Vec<MergedRecord>,
    /// The full correspondence table, before any selection policy.
    pub candidates: Vec<MatchCandidate>,
    pub report: RunReport,
}

/// The batch engine: one pass over fully loaded raw data.
pub struct FusionPipeline {
    config: FusionConfig,
}

impl FusionPipeline {
    /// Validates the configuration up front; an invalid configuration
    /// never touches data.
    pub fn new(config: FusionConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn run(
        &self,
        segments: &[RawSegment],
        samples: &[RawSample],
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<FusionOutput> {
        if range_end <= range_start {
            bail!("requested range is empty: {range_start} .. {range_end}");
        }

        let mut report = RunReport {
            segments_in: segments.len(),
            ..Default::default()
        };

        // 1. Decode and reproject, one fault-isolated unit per segment
        let (geometries, failures) =
            self.prepare_geometries(segments, range_start, range_end);
        report.failures = failures;
        report.segments_usable = geometries.len();
        for failure in &report.failures {
            warn!(
                "{} segment {} dropped at {:?}: {}",
                failure.source.as_str(),
                failure.segment_id,
                failure.stage,
                failure.reason
            );
        }

        let (stations, tmcs): (Vec<CanonicalGeometry>, Vec<CanonicalGeometry>) = geometries
            .into_iter()
            .partition(|g| g.source == SourceKind::Station);
        info!(
            "geometry ready: {} station segments, {} TMC segments ({} dropped)",
            stations.len(),
            tmcs.len(),
            report.failures.len()
        );

        // 2. Spatial correspondence
        let candidates = matcher::match_segments(&stations, &tmcs, &self.config);
        report.candidate_count = candidates.len();

        // 3. Temporal grids, only for segments that appear in a candidate
        let station_bins = self.bin_matched_series(
            SourceKind::Station,
            candidates.iter().map(|c| c.station_id.as_str()),
            samples,
            range_start,
            range_end,
        );
        let tmc_bins = self.bin_matched_series(
            SourceKind::Tmc,
            candidates.iter().map(|c| c.tmc_id.as_str()),
            samples,
            range_start,
            range_end,
        );

        // 4. Join and coverage-filter
        let join = assembler::assemble(&candidates, &station_bins, &tmc_bins, &self.config);
        report.pairs_included = join.coverage.iter().filter(|p| p.included).count();
        report.pairs_excluded = join.coverage.len() - report.pairs_included;
        report.coverage = join.coverage;

        info!(
            "run complete: {} merged records, {} pairs included, {} excluded",
            join.records.len(),
            report.pairs_included,
            report.pairs_excluded
        );

        Ok(FusionOutput {
            records: join.records,
            candidates,
            report,
        })
    }

    // Decode + reproject every segment; failures are collected, never
    // propagated, so one bad record cannot abort its siblings.
    fn prepare_geometries(
        &self,
        segments: &[RawSegment],
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> (Vec<CanonicalGeometry>, Vec<SegmentFailure>) {
        let progress = ProgressBar::new(segments.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        progress.set_message("decoding geometry");

        let results: Vec<Result<CanonicalGeometry, SegmentFailure>> = segments
            .par_iter()
            .map(|segment| {
                let outcome = self.prepare_one(segment, range_start, range_end);
                progress.inc(1);
                outcome
            })
            .collect();
        progress.finish_and_clear();

        let mut geometries = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(geometry) => geometries.push(geometry),
                Err(failure) => failures.push(failure),
            }
        }
        (geometries, failures)
    }

    fn prepare_one(
        &self,
        segment: &RawSegment,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<CanonicalGeometry, SegmentFailure> {
        if !segment.active_during(range_start, range_end) {
            return Err(SegmentFailure {
                segment_id: segment.id.clone(),
                source: segment.source,
                stage: FailureStage::ActivityWindow,
                reason: "segment not active during the requested range".to_string(),
            });
        }

        let decoded = decode::decode_segment(segment).map_err(|e| SegmentFailure {
            segment_id: segment.id.clone(),
            source: segment.source,
            stage: FailureStage::Decode,
            reason: e.to_string(),
        })?;

        projection::to_canonical(&decoded, self.config.canonical_crs).map_err(|e| {
            SegmentFailure {
                segment_id: segment.id.clone(),
                source: segment.source,
                stage: FailureStage::Projection,
                reason: e.to_string(),
            }
        })
    }

    // Build the fixed grid for every matched segment id of one source.
    fn bin_matched_series<'a>(
        &self,
        source: SourceKind,
        matched_ids: impl Iterator<Item = &'a str>,
        samples: &[RawSample],
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> HashMap<String, Vec<TimeBin>> {
        let ids: HashSet<&str> = matched_ids.collect();

        let mut by_segment: HashMap<&str, Vec<RawSample>> = HashMap::new();
        for sample in samples {
            if sample.source == source && ids.contains(sample.segment_id.as_str()) {
                by_segment
                    .entry(sample.segment_id.as_str())
                    .or_default()
                    .push(sample.clone());
            }
        }
        // Matched segments with no samples still get an (all-gap) grid
        for id in &ids {
            by_segment.entry(*id).or_default();
        }

        by_segment
            .into_par_iter()
            .map(|(id, segment_samples)| {
                let bins = timebin::normalize_series(
                    id,
                    source,
                    &segment_samples,
                    range_start,
                    range_end,
                    &self.config,
                );
                (id.to_string(), bins)
            })
            .collect()
    }
}
