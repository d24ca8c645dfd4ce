use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projection::Crs;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("buffer distance must be a positive, finite number of meters, got {0}")]
    InvalidBufferDistance(f64),
    #[error("{name} must lie in [0, 1], got {value}")]
    RatioOutOfRange { name: &'static str, value: f64 },
    #[error("bin width must be a positive number of seconds, got {0}s")]
    InvalidBinWidth(i64),
    #[error("canonical CRS {0:?} is not a projected coordinate system")]
    NonMetricCanonicalCrs(Crs),
}

/// How two raw samples landing in the same time bin are resolved.
///
/// Averaging changes the statistical meaning of the series, so it is
/// never applied implicitly; callers opt in per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinCollisionPolicy {
    /// The later-arriving sample replaces the earlier one.
    LastWriteWins,
    /// All colliding samples are averaged.
    Mean,
}

/// Which matched pairs the assembler emits per station segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchSelectionPolicy {
    /// One primary TMC pair per station segment.
    BestOnly,
    /// Every qualifying candidate pair, for inspection.
    AllCandidates,
}

/// Engine configuration, passed explicitly into each stage.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Projected CRS all geometry is reprojected into.
    pub canonical_crs: Crs,
    /// Timezone the temporal grid is expressed in.
    pub canonical_tz: Tz,
    /// Buffer tolerance around station linework for spatial matching (meters).
    pub buffer_distance_m: f64,
    /// Candidates with overlap-ratio-vs-station below this are dropped.
    pub min_overlap_ratio: f64,
    /// Pairs with a bilateral coverage score below this are excluded.
    pub min_coverage_score: f64,
    /// Width of one time bin.
    pub bin_width: Duration,
    /// Resolution for two samples mapping to the same bin.
    pub collision_policy: BinCollisionPolicy,
    /// Pair selection applied by the assembler.
    pub selection_policy: MatchSelectionPolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            canonical_crs: Crs::utm_north(10), // EPSG:32610, metric for the Pacific Northwest
            canonical_tz: chrono_tz::America::Los_Angeles,
            buffer_distance_m: 5.0, // Sub-lane GPS/digitization error
            min_overlap_ratio: 0.05,
            min_coverage_score: 0.8,
            bin_width: Duration::minutes(15),
            collision_policy: BinCollisionPolicy::LastWriteWins,
            selection_policy: MatchSelectionPolicy::BestOnly,
        }
    }
}

impl FusionConfig {
    /// Fail-fast validation, run once before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.buffer_distance_m.is_finite() || self.buffer_distance_m <= 0.0 {
            return Err(ConfigurationError::InvalidBufferDistance(
                self.buffer_distance_m,
            ));
        }
        if !(0.0..=1.0).contains(&self.min_overlap_ratio) {
            return Err(ConfigurationError::RatioOutOfRange {
                name: "min_overlap_ratio",
                value: self.min_overlap_ratio,
            });
        }
        if !(0.0..=1.0).contains(&self.min_coverage_score) {
            return Err(ConfigurationError::RatioOutOfRange {
                name: "min_coverage_score",
                value: self.min_coverage_score,
            });
        }
        if self.bin_width.num_seconds() <= 0 {
            return Err(ConfigurationError::InvalidBinWidth(
                self.bin_width.num_seconds(),
            ));
        }
        if !self.canonical_crs.is_projected() {
            return Err(ConfigurationError::NonMetricCanonicalCrs(
                self.canonical_crs,
            ));
        }
        Ok(())
    }
}
