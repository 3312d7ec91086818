//! Error types surfaced while opening and reading VMDK volumes.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VMDKError>;

/// Everything that can go wrong while parsing a descriptor, decoding an
/// extent or reading from the assembled image.
///
/// Errors raised during [`crate::VMDKContext::open`] are fatal: no partial
/// context is ever returned. Errors raised during reads only occur when a
/// backing reader fails outright; a short read or end-of-stream is reported
/// through the returned byte count instead.
#[derive(Debug, Error)]
pub enum VMDKError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A sparse extent data file did not start with the `KDMV` magic number.
    #[error("invalid sparse extent magic number")]
    BadMagic,

    #[error("invalid sparse header: {0}")]
    InvalidSparseHeader(&'static str),

    /// A numeric field of the descriptor could not be parsed.
    #[error("invalid descriptor: {0}")]
    DescriptorParse(String),

    /// The descriptor declared an extent of a kind this crate cannot read.
    #[error("unsupported extent type {0}")]
    UnsupportedExtentType(String),

    /// The extent uses a format feature this crate deliberately rejects,
    /// such as compressed grain data.
    #[error("unsupported sparse extent feature: {0}")]
    Unsupported(&'static str),

    /// The opener callback failed to produce a reader for an extent file.
    #[error("while opening extent {filename}: {source}")]
    ExtentOpen {
        filename: String,
        #[source]
        source: io::Error,
    },
}
