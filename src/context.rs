//! Assembling declared extents into one logical disk image.
//!
//! The context owns the ordered extent catalogue and services positioned
//! reads against the guest-visible address space, delegating each portion
//! of a request to the extent that backs it.

use std::cmp::min;
use std::io;
use std::str::FromStr;

use log::{debug, warn};

use crate::config::VMDKConfig;
use crate::descriptor::{VMDKDescriptor, VMDKExtentType};
use crate::errors::{Result, VMDKError};
use crate::extent::{Extent, ExtentStat, NullExtent};
use crate::flat::FlatExtent;
use crate::sparse::SparseExtent;
use crate::{ExtentReader, ReadAt, SECTOR_SIZE};

/// How much of the primary reader is scanned for the descriptor.
const DESCRIPTOR_SCAN_SIZE: u64 = 64 * 1024;

/// An assembled VMDK virtual disk.
///
/// After construction the context is immutable; [`VMDKContext::read_at`]
/// takes `&self` and may be called from several threads at once as long as
/// the backing readers support concurrent positioned reads (files do).
pub struct VMDKContext {
    config: VMDKConfig,
    /// Sorted by virtual offset and gap-free: each extent starts exactly
    /// where the previous one ends.
    extents: Vec<Extent>,
    total_size: u64,
}

impl std::fmt::Debug for VMDKContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VMDKContext")
            .field("config", &self.config)
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl VMDKContext {
    /// Opens a VMDK image.
    ///
    /// The descriptor is parsed from the first 64 KiB of `reader` (whose
    /// total length is `size`); `reader` is only borrowed for the duration
    /// of this call and is never closed by the context. Each declared
    /// extent file is resolved through `opener`, which receives the file
    /// name exactly as written in the descriptor; the readers it returns
    /// are owned by the context and released when it is dropped.
    ///
    /// A reader holding no descriptor yields a context with no extents and
    /// a size of zero, which callers may want to treat as a parse miss.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor is malformed, an extent kind is
    /// unsupported, the opener refuses a file, or a sparse extent cannot
    /// be decoded. No partial context is returned.
    pub fn open<R>(
        reader: &R,
        size: u64,
        mut opener: impl FnMut(&str) -> io::Result<ExtentReader>,
    ) -> Result<VMDKContext>
    where
        R: ReadAt + ?Sized,
    {
        let scan = min(size, DESCRIPTOR_SCAN_SIZE) as usize;
        let mut buf = vec![0u8; scan];
        let n = reader.read_full_at(&mut buf, 0)?;
        let descriptor = VMDKDescriptor::parse(&buf[..n])?;

        let mut extents = Vec::with_capacity(descriptor.extents.len());
        let mut total_size = 0u64;
        for declared in &descriptor.extents {
            debug!("Opening extent file: {}", declared.file_name);
            // The extent file is opened before its kind is examined, so a
            // failing opener wins over an unsupported kind token.
            let extent_reader =
                opener(&declared.file_name).map_err(|source| VMDKError::ExtentOpen {
                    filename: declared.file_name.clone(),
                    source,
                })?;

            let extent = match VMDKExtentType::from_str(&declared.extent_type) {
                Ok(VMDKExtentType::Sparse) => Extent::Sparse(SparseExtent::new(
                    extent_reader,
                    &declared.file_name,
                    total_size,
                )?),
                Ok(VMDKExtentType::Flat) | Ok(VMDKExtentType::Vmfs) => {
                    let base_offset = declared
                        .start_sector
                        .unwrap_or(0)
                        .checked_mul(SECTOR_SIZE)
                        .ok_or_else(|| {
                            VMDKError::DescriptorParse(format!(
                                "start sector out of range in {}",
                                declared.file_name
                            ))
                        })?;
                    let extent_size =
                        declared.sector_count.checked_mul(SECTOR_SIZE).ok_or_else(|| {
                            VMDKError::DescriptorParse(format!(
                                "sector count out of range in {}",
                                declared.file_name
                            ))
                        })?;
                    Extent::Flat(FlatExtent::new(
                        extent_reader,
                        &declared.file_name,
                        base_offset,
                        extent_size,
                        total_size,
                    ))
                }
                Err(_) => {
                    return Err(VMDKError::UnsupportedExtentType(
                        declared.extent_type.clone(),
                    ))
                }
            };

            total_size += extent.total_size();
            extents.push(extent);
        }

        Ok(VMDKContext::assemble(descriptor.config, extents))
    }

    /// Builds a context from extents already carrying their virtual
    /// offsets, inserting null extents over any gaps so that the catalogue
    /// is contiguous from offset 0.
    pub(crate) fn assemble(config: VMDKConfig, extents: Vec<Extent>) -> VMDKContext {
        let mut normalized = Vec::with_capacity(extents.len());
        let mut offset = 0u64;
        for extent in extents {
            if extent.virtual_offset() > offset {
                let fill = extent.virtual_offset() - offset;
                normalized.push(Extent::Null(NullExtent::new(offset, fill)));
                offset += fill;
            }
            offset += extent.total_size();
            normalized.push(extent);
        }
        VMDKContext {
            config,
            extents: normalized,
            total_size: offset,
        }
    }

    /// Size of the assembled image in bytes.
    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// A copy of the settings recognized in the descriptor.
    pub fn config(&self) -> VMDKConfig {
        self.config.clone()
    }

    /// Kind, size and backing file of every extent, in image order.
    pub fn stats(&self) -> Vec<ExtentStat> {
        self.extents.iter().map(Extent::stats).collect()
    }

    /// Logs one line per extent at debug level.
    pub fn debug(&self) {
        for extent in &self.extents {
            extent.debug();
        }
    }

    /// The extent containing `offset`, if any.
    fn extent_for_offset(&self, offset: u64) -> Option<&Extent> {
        let n = self
            .extents
            .partition_point(|extent| extent.virtual_offset() <= offset);
        let extent = &self.extents[n.checked_sub(1)?];
        if offset < extent.virtual_offset() + extent.total_size() {
            Some(extent)
        } else {
            None
        }
    }

    /// Reads from the assembled image at `offset`, composing partial reads
    /// across extents. Short counts only happen at the end of the image or
    /// when a backing reader stops making progress; `Ok(0)` at or past the
    /// end.
    ///
    /// # Errors
    ///
    /// Propagates failures of the backing readers.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        let available = self.total_size - offset;
        let len = min(buf.len() as u64, available) as usize;
        let buf = &mut buf[..len];

        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let Some(extent) = self.extent_for_offset(pos) else {
                // A normalized catalogue has no holes; if lookup misses
                // anyway, the remainder reads as zeros.
                warn!("No extent covers offset {}, zero filling", pos);
                buf[filled..].fill(0);
                return Ok(buf.len());
            };

            let index_in_extent = pos - extent.virtual_offset();
            let available = extent.total_size() - index_in_extent;
            let to_read = min((buf.len() - filled) as u64, available) as usize;

            let n = extent.read_at(&mut buf[filled..filled + to_read], index_in_extent)?;
            if n == 0 {
                // No more progress possible.
                break;
            }
            filled += n;
        }

        Ok(filled)
    }
}
