//! Harmonizes two independently collected road-traffic feeds, a
//! station-based public agency feed and a TMC-segment commercial feed,
//! into one spatial-temporal frame.
//!
//! The spatial path decodes each source's native segment geometry,
//! reprojects it into one metric CRS and computes the station/TMC
//! correspondence table; the temporal path rebases both sources' samples
//! onto a fixed bin grid in one timezone. The assembler joins the two
//! paths into merged records, filtered and reported by bilateral
//! coverage. Loading files and presenting results are the caller's
//! business; this crate is the transformation in between.

pub mod assembler;
pub mod config;
pub mod debug;
pub mod decode;
pub mod ingest;
pub mod matcher;
pub mod pipeline;
pub mod projection;
pub mod timebin;

pub use assembler::{JoinOutput, MergedRecord, PairCoverage};
pub use config::{BinCollisionPolicy, ConfigurationError, FusionConfig, MatchSelectionPolicy};
pub use decode::{DecodeError, DecodedGeometry};
pub use ingest::{GeometryEncoding, RawSample, RawSegment, SourceKind, TravelDirection};
pub use matcher::MatchCandidate;
pub use pipeline::{FusionOutput, FusionPipeline, RunReport, SegmentFailure};
pub use projection::{CanonicalGeometry, Crs, ProjectionError};
pub use timebin::TimeBin;
