use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use log::trace;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{BinCollisionPolicy, FusionConfig};
use crate::ingest::{RawSample, SourceKind};

/// One slot of the fixed temporal grid.
///
/// An unobserved bin marks a coverage gap; its value stays `None` and is
/// never interpolated here. Interpolation, if anyone wants it, is a
/// downstream policy.
#[derive(Debug, Clone, Serialize)]
pub struct TimeBin {
    pub segment_id: String,
    pub source: SourceKind,
    /// Bin start in the canonical timezone. The underlying instant is
    /// aligned to the bin width from the Unix epoch.
    pub bin_start: DateTime<Tz>,
    pub width_s: i64,
    pub value: Option<f64>,
    pub observed: bool,
}

/// Floor an instant to its bin.
///
/// Alignment is on the UTC instant from the Unix epoch; for bin widths
/// that divide one hour this coincides with wall-clock flooring in any
/// whole-quarter-hour-offset zone, and DST conversion stays exact
/// because labeling happens after flooring.
pub fn floor_to_bin(instant: DateTime<Utc>, width: Duration, tz: Tz) -> DateTime<Tz> {
    let width_s = width.num_seconds();
    let secs = instant.timestamp();
    let floored = secs - secs.rem_euclid(width_s);
    let whole = instant - Duration::nanoseconds(instant.timestamp_subsec_nanos() as i64);
    (whole + Duration::seconds(floored - secs)).with_timezone(&tz)
}

/// Rebase one segment's raw samples onto the fixed grid over
/// `[range_start, range_end]`.
///
/// Every grid slot is emitted; slots without a contributing sample come
/// out with `observed = false`. Two samples in one bin resolve by the
/// configured collision policy: last-write-wins keeps the later-arriving
/// sample, mean averages all of them.
pub fn normalize_series(
    segment_id: &str,
    source: SourceKind,
    samples: &[RawSample],
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    config: &FusionConfig,
) -> Vec<TimeBin> {
    let width_s = config.bin_width.num_seconds();
    let first_bin = range_start.timestamp() - range_start.timestamp().rem_euclid(width_s);
    // Second-aligned base so grid instants carry no sub-second part
    let base = range_start - Duration::nanoseconds(range_start.timestamp_subsec_nanos() as i64);

    // Collapse samples into their bins, honoring the collision policy
    let mut observed: HashMap<i64, (f64, usize)> = HashMap::new();
    for sample in samples {
        let instant = sample.timestamp.with_timezone(&Utc);
        if instant < range_start || instant > range_end {
            continue;
        }
        let bin = instant.timestamp() - instant.timestamp().rem_euclid(width_s);
        match config.collision_policy {
            BinCollisionPolicy::LastWriteWins => {
                if observed.insert(bin, (sample.value, 1)).is_some() {
                    trace!(
                        "segment {segment_id}: later sample replaced bin at {bin} ({})",
                        sample.value
                    );
                }
            }
            BinCollisionPolicy::Mean => {
                let slot = observed.entry(bin).or_insert((0.0, 0));
                slot.0 += sample.value;
                slot.1 += 1;
            }
        }
    }

    // Emit the full grid, gaps included
    let mut bins = Vec::new();
    let mut bin_s = first_bin;
    while bin_s <= range_end.timestamp() {
        let value = observed.get(&bin_s).map(|&(sum, count)| sum / count as f64);
        let instant = base + Duration::seconds(bin_s - base.timestamp());
        bins.push(TimeBin {
            segment_id: segment_id.to_string(),
            source,
            bin_start: instant.with_timezone(&config.canonical_tz),
            width_s,
            value,
            observed: value.is_some(),
        });
        bin_s += width_s;
    }

    bins
}
