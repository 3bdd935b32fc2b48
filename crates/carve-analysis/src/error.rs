//! Error types for the analysis pipeline.

use thiserror::Error;

/// Error type for per-function analysis.
///
/// These errors discard the affected function; the run continues. Only a
/// rejected image aborts the pipeline, and that surfaces as
/// [`carve_pe::ParseError`] before analysis starts.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The decoder rejected the bytes at an address.
    #[error("instruction decode failed at raw offset {address:#x}")]
    Decode { address: u64 },

    /// A jump destination could not be computed.
    #[error("unresolved control flow at raw offset {address:#x}")]
    UnresolvedFlow { address: u64 },

    /// The path cover exceeded the safety threshold.
    #[error("path cover for function at {entry:#x} exceeds {limit} paths")]
    PathExplosion { entry: u64, limit: usize },

    /// Image-level failure.
    #[error(transparent)]
    Image(#[from] carve_pe::ParseError),
}
