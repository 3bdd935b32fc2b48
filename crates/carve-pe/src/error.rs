//! Error types for PE parsing.

use thiserror::Error;

/// Error type for PE image parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Invalid magic number at start of file or header.
    #[error("invalid magic number: expected {expected}, got {actual:02x?}")]
    InvalidMagic {
        expected: &'static str,
        actual: Vec<u8>,
    },

    /// File is too short to contain required data.
    #[error("file too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Machine type is not AMD64.
    #[error("unsupported architecture: machine type {0:#06x}")]
    UnsupportedArchitecture(u16),

    /// A virtual address does not fall into any section.
    #[error("virtual address {0:#x} is not mapped by any section")]
    UnmappedVirtualAddress(u32),

    /// A raw offset does not fall into any section.
    #[error("raw offset {0:#x} is not covered by any section")]
    UnmappedRawOffset(u64),

    /// The image declares no entry point.
    #[error("image has no entry point")]
    NoEntryPoint,

    /// I/O error while reading the file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Creates a new `InvalidMagic` error.
    pub fn invalid_magic(expected: &'static str, actual: &[u8]) -> Self {
        Self::InvalidMagic {
            expected,
            actual: actual.to_vec(),
        }
    }

    /// Creates a new `TooShort` error.
    pub fn too_short(expected: usize, actual: usize) -> Self {
        Self::TooShort { expected, actual }
    }
}
