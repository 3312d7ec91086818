//! The extent catalogue.
//!
//! Every byte of the assembled image is backed by exactly one extent. The
//! set of shapes is closed: a flat window into a data file, a sparse
//! grain-allocated file, or a synthetic null extent covering a hole in the
//! declared layout.

use std::cmp::min;
use std::io;

use log::debug;
use serde::Serialize;

use crate::flat::FlatExtent;
use crate::sparse::SparseExtent;

/// Kind, size and origin of an extent, for reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtentStat {
    #[serde(rename = "type")]
    pub extent_type: &'static str,
    pub size: u64,
    pub filename: String,
}

/// A synthetic extent covering a range of the image that no declared
/// extent backs. It owns no reader; all reads return zeros.
pub struct NullExtent {
    virtual_offset: u64,
    total_size: u64,
}

impl NullExtent {
    pub fn new(virtual_offset: u64, total_size: u64) -> NullExtent {
        NullExtent {
            virtual_offset,
            total_size,
        }
    }

    pub fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        let n = min(buf.len() as u64, self.total_size - offset) as usize;
        buf[..n].fill(0);
        Ok(n)
    }

    pub fn stats(&self) -> ExtentStat {
        ExtentStat {
            extent_type: "null",
            size: self.total_size,
            filename: String::new(),
        }
    }

    pub fn debug(&self) {
        debug!(
            "[NullExtent] offset: {}, size: {}",
            self.virtual_offset, self.total_size
        );
    }
}

/// One extent of the assembled image.
pub enum Extent {
    Flat(FlatExtent),
    Sparse(SparseExtent),
    Null(NullExtent),
}

impl Extent {
    /// Byte offset of the extent's first byte within the assembled image.
    pub fn virtual_offset(&self) -> u64 {
        match self {
            Extent::Flat(extent) => extent.virtual_offset(),
            Extent::Sparse(extent) => extent.virtual_offset(),
            Extent::Null(extent) => extent.virtual_offset(),
        }
    }

    /// Byte length the extent contributes to the assembled image.
    pub fn total_size(&self) -> u64 {
        match self {
            Extent::Flat(extent) => extent.total_size(),
            Extent::Sparse(extent) => extent.total_size(),
            Extent::Null(extent) => extent.total_size(),
        }
    }

    /// Backing file name as written in the descriptor, empty for a null
    /// extent.
    pub fn filename(&self) -> &str {
        match self {
            Extent::Flat(extent) => extent.filename(),
            Extent::Sparse(extent) => extent.filename(),
            Extent::Null(_) => "",
        }
    }

    /// Reads from the extent at an offset relative to its own start.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self {
            Extent::Flat(extent) => extent.read_at(buf, offset),
            Extent::Sparse(extent) => extent.read_at(buf, offset),
            Extent::Null(extent) => extent.read_at(buf, offset),
        }
    }

    pub fn stats(&self) -> ExtentStat {
        match self {
            Extent::Flat(extent) => extent.stats(),
            Extent::Sparse(extent) => extent.stats(),
            Extent::Null(extent) => extent.stats(),
        }
    }

    pub fn debug(&self) {
        match self {
            Extent::Flat(extent) => extent.debug(),
            Extent::Sparse(extent) => extent.debug(),
            Extent::Null(extent) => extent.debug(),
        }
    }
}
