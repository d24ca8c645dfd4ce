use chrono::{DateTime, Duration, Utc};
use geo::LineString;

use roadfuse::{
    FusionConfig, FusionPipeline, GeometryEncoding, MatchSelectionPolicy, RawSample, RawSegment,
    SourceKind,
};
use roadfuse::decode::encode_packed_hex;
use roadfuse::pipeline::FailureStage;
use roadfuse::projection::{Crs, reproject_line};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn utc(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}

// Hex EWKB builder matching the station feed's PostGIS export shape
fn ewkb_hex(line: &LineString<f64>, srid: u32) -> String {
    let mut bytes = vec![0x01u8];
    bytes.extend_from_slice(&(2u32 | 0x2000_0000).to_le_bytes());
    bytes.extend_from_slice(&srid.to_le_bytes());
    bytes.extend_from_slice(&(line.0.len() as u32).to_le_bytes());
    for coord in &line.0 {
        bytes.extend_from_slice(&coord.x.to_le_bytes());
        bytes.extend_from_slice(&coord.y.to_le_bytes());
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// A north-south line near Portland; `offset_lon` shifts it sideways a
// couple of meters, `extent` scales how far north it reaches
fn corridor_line(offset_lon: f64, extent: f64) -> LineString<f64> {
    LineString::from(vec![
        (-122.676 + offset_lon, 45.523),
        (-122.676 + offset_lon, 45.523 + 0.004 * extent),
    ])
}

fn station_segment_ewkb(id: &str) -> RawSegment {
    let mercator = reproject_line(&corridor_line(0.0, 1.0), Crs::Wgs84, Crs::WebMercator).unwrap();
    RawSegment::new(
        id,
        SourceKind::Station,
        GeometryEncoding::WkbHex(ewkb_hex(&mercator, 3857)),
        "NORTH",
    )
}

fn tmc_segment(id: &str, offset_lon: f64, extent: f64) -> RawSegment {
    RawSegment::new(
        id,
        SourceKind::Tmc,
        GeometryEncoding::Vector(corridor_line(offset_lon, extent)),
        "NORTHBOUND",
    )
}

// Evenly spaced 15-minute samples starting at `start`
fn samples(id: &str, source: SourceKind, start: DateTime<Utc>, count: usize, base: f64) -> Vec<RawSample> {
    (0..count)
        .map(|i| {
            RawSample::new(
                id,
                source,
                (start + Duration::minutes(15 * i as i64)).fixed_offset(),
                base + i as f64,
            )
        })
        .collect()
}

#[test]
fn full_pipeline_produces_bilateral_records() {
    init_logging();

    let segments = vec![
        station_segment_ewkb("1091"),
        tmc_segment("114+04609", 0.00003, 1.0),
        // Far off the corridor, should never match
        tmc_segment("114+04610", 0.2, 1.0),
    ];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let mut all_samples = samples("1091", SourceKind::Station, range_start, 8, 95.0);
    all_samples.extend(samples("114+04609", SourceKind::Tmc, range_start, 8, 60.0));

    let pipeline = FusionPipeline::new(FusionConfig::default()).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    assert_eq!(output.candidates.len(), 1);
    assert_eq!(output.candidates[0].tmc_id, "114+04609");
    assert!(output.candidates[0].direction_agreement);

    assert_eq!(output.report.pairs_included, 1);
    assert_eq!(output.report.pairs_excluded, 0);
    assert!(output.report.failures.is_empty());

    // Eight 15-minute bins, all bilaterally observed
    assert_eq!(output.records.len(), 8);
    for record in &output.records {
        assert!(record.both_observed);
        assert_eq!(record.value_delta, Some(35.0));
        assert!(record.coverage_score >= 0.999);
    }
}

#[test]
fn malformed_hex_segment_is_excluded_but_siblings_survive() {
    init_logging();

    let mut bad = station_segment_ewkb("bad-station");
    bad.geometry = GeometryEncoding::PackedHex("abc".to_string());

    let segments = vec![
        bad,
        station_segment_ewkb("1091"),
        tmc_segment("114+04609", 0.00003, 1.0),
    ];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let mut all_samples = samples("1091", SourceKind::Station, range_start, 8, 95.0);
    all_samples.extend(samples("114+04609", SourceKind::Tmc, range_start, 8, 60.0));

    let pipeline = FusionPipeline::new(FusionConfig::default()).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    assert_eq!(output.report.failures.len(), 1);
    let failure = &output.report.failures[0];
    assert_eq!(failure.segment_id, "bad-station");
    assert_eq!(failure.stage, FailureStage::Decode);
    assert!(failure.reason.contains("odd length"));

    // The healthy pair is unaffected
    assert_eq!(output.report.pairs_included, 1);
    assert_eq!(output.records.len(), 8);
}

#[test]
fn low_coverage_pair_is_excluded_and_shows_up_in_report() {
    init_logging();

    let segments = vec![
        station_segment_ewkb("1091"),
        tmc_segment("114+04609", 0.00003, 1.0),
    ];

    // Ten bins requested, the station reports only the first four
    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T17:29:59Z");

    let mut all_samples = samples("1091", SourceKind::Station, range_start, 4, 95.0);
    all_samples.extend(samples("114+04609", SourceKind::Tmc, range_start, 10, 60.0));

    let config = FusionConfig {
        min_coverage_score: 0.8,
        ..Default::default()
    };
    let pipeline = FusionPipeline::new(config).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    assert!(output.records.is_empty());
    assert_eq!(output.report.pairs_excluded, 1);
    let entry = &output.report.coverage[0];
    assert!(!entry.included);
    assert!((entry.coverage_score - 0.4).abs() < 1e-9);
}

#[test]
fn best_only_picks_the_dominant_overlap() {
    init_logging();

    let segments = vec![
        station_segment_ewkb("1091"),
        // Lower id but only 40 percent of the station's extent
        tmc_segment("114+04601", -0.00002, 0.4),
        // Higher id, 90 percent coverage, must win on overlap ratio
        tmc_segment("114+04999", 0.00002, 0.9),
    ];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let mut all_samples = samples("1091", SourceKind::Station, range_start, 8, 95.0);
    all_samples.extend(samples("114+04601", SourceKind::Tmc, range_start, 8, 50.0));
    all_samples.extend(samples("114+04999", SourceKind::Tmc, range_start, 8, 60.0));

    let pipeline = FusionPipeline::new(FusionConfig::default()).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    // The matcher surfaces both correspondences
    assert_eq!(output.candidates.len(), 2);
    // The assembler's primary selection takes the higher overlap ratio
    assert_eq!(output.report.coverage.len(), 1);
    assert_eq!(output.report.coverage[0].tmc_id, "114+04999");
    assert!(output.records.iter().all(|r| r.tmc_id == "114+04999"));
}

#[test]
fn all_candidates_policy_reports_every_pair() {
    init_logging();

    let segments = vec![
        station_segment_ewkb("1091"),
        tmc_segment("114+04601", -0.00002, 0.4),
        tmc_segment("114+04999", 0.00002, 0.9),
    ];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let mut all_samples = samples("1091", SourceKind::Station, range_start, 8, 95.0);
    all_samples.extend(samples("114+04601", SourceKind::Tmc, range_start, 8, 50.0));
    all_samples.extend(samples("114+04999", SourceKind::Tmc, range_start, 8, 60.0));

    let config = FusionConfig {
        selection_policy: MatchSelectionPolicy::AllCandidates,
        ..Default::default()
    };
    let pipeline = FusionPipeline::new(config).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    assert_eq!(output.report.coverage.len(), 2);
    let tmc_ids: Vec<&str> = output
        .report
        .coverage
        .iter()
        .map(|p| p.tmc_id.as_str())
        .collect();
    assert!(tmc_ids.contains(&"114+04601"));
    assert!(tmc_ids.contains(&"114+04999"));
}

#[test]
fn inactive_station_is_reported_and_skipped() {
    init_logging();

    let mut retired = station_segment_ewkb("1091");
    retired.active_from = Some(utc("2015-01-01T00:00:00Z"));
    retired.active_until = Some(utc("2019-06-01T00:00:00Z"));

    let segments = vec![retired, tmc_segment("114+04609", 0.00003, 1.0)];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let pipeline = FusionPipeline::new(FusionConfig::default()).unwrap();
    let output = pipeline.run(&segments, &[], range_start, range_end).unwrap();

    assert!(output.candidates.is_empty());
    assert_eq!(output.report.failures.len(), 1);
    assert_eq!(output.report.failures[0].stage, FailureStage::ActivityWindow);
}

#[test]
fn packed_hex_station_geometry_matches_too() {
    init_logging();

    let station = RawSegment::new(
        "1092",
        SourceKind::Station,
        GeometryEncoding::PackedHex(encode_packed_hex(&corridor_line(0.0, 1.0))),
        "NORTH",
    );
    let segments = vec![station, tmc_segment("114+04609", 0.00003, 1.0)];

    let range_start = utc("2023-10-01T15:00:00Z");
    let range_end = utc("2023-10-01T16:59:59Z");

    let mut all_samples = samples("1092", SourceKind::Station, range_start, 8, 95.0);
    all_samples.extend(samples("114+04609", SourceKind::Tmc, range_start, 8, 60.0));

    let pipeline = FusionPipeline::new(FusionConfig::default()).unwrap();
    let output = pipeline
        .run(&segments, &all_samples, range_start, range_end)
        .unwrap();

    assert_eq!(output.candidates.len(), 1);
    assert_eq!(output.report.pairs_included, 1);
}

#[test]
fn invalid_configuration_fails_before_touching_data() {
    let config = FusionConfig {
        buffer_distance_m: -5.0,
        ..Default::default()
    };
    assert!(FusionPipeline::new(config).is_err());
}
