//! Sparse extent reading.
//!
//! A sparse extent data file stores the virtual disk in fixed-size *grains*
//! (typically 128 sectors, 64 KiB) that are allocated on demand. Locating a
//! grain goes through two levels of tables: the grain directory holds one
//! sector pointer per grain table, and each grain table holds one sector
//! pointer per grain. A pointer of 0 at either level means the grain was
//! never written and reads as zeros.
//!
//! Both tables are small and are loaded at construction time, so reads
//! afterwards touch the backing file only for allocated grain data.

use std::cmp::min;
use std::io;

use log::debug;

use crate::errors::{Result, VMDKError};
use crate::extent::ExtentStat;
use crate::{ExtentReader, ReadAt, SECTOR_SIZE, SPARSE_MAGICNUMBER};

// Flags used in sparse extent file headers.
const FLAG_USE_SECONDARY_GRAIN_DIRECTORY: u32 = 0x00000002;
const FLAG_HAS_COMPRESSED_GRAIN_DATA: u32 = 0x00010000;

/// The on-disk header of a `SPARSE` extent data file. Little-endian, one
/// sector long, starting with the `KDMV` magic number.
#[derive(Clone, Debug)]
pub struct VMDKSparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Capacity of the extent in sectors.
    pub capacity: u64,
    /// Grain size in sectors, typically 128 (64 KiB grains).
    pub grain_size: u64,
    /// Sector of the embedded descriptor, 0 if the file has none.
    pub descriptor_offset: u64,
    /// Length of the embedded descriptor in sectors.
    pub descriptor_size: u64,
    /// Number of entries in one grain table, typically 512.
    pub gt_entries: u32,
    /// Sector of the redundant grain directory, 0 if not present.
    pub rgd_offset: u64,
    /// Sector of the grain directory. A value of -1 means only the
    /// redundant copy is valid.
    pub gd_offset: i64,
    /// Metadata overhead in sectors; grain data starts after it.
    pub overhead: u64,
}

impl VMDKSparseHeader {
    /// Decodes the header from the first sector of an extent data file.
    ///
    /// # Errors
    ///
    /// Fails when the magic number is wrong or the grain geometry is
    /// degenerate (zero capacity, grain size or grain table entry count).
    pub fn parse(data: &[u8]) -> Result<VMDKSparseHeader> {
        if data.len() < 72 {
            return Err(VMDKError::InvalidSparseHeader("header data too short"));
        }
        if u32::from_le_bytes([data[0], data[1], data[2], data[3]]) != SPARSE_MAGICNUMBER {
            return Err(VMDKError::BadMagic);
        }

        let header = VMDKSparseHeader {
            version: le32(data, 4),
            flags: le32(data, 8),
            capacity: le64(data, 12),
            grain_size: le64(data, 20),
            descriptor_offset: le64(data, 28),
            descriptor_size: le64(data, 36),
            gt_entries: le32(data, 44),
            rgd_offset: le64(data, 48),
            gd_offset: le64(data, 56) as i64,
            overhead: le64(data, 64),
        };

        if header.capacity == 0 {
            return Err(VMDKError::InvalidSparseHeader("zero capacity"));
        }
        if header.grain_size == 0 {
            return Err(VMDKError::InvalidSparseHeader("zero grain size"));
        }
        if header.gt_entries == 0 {
            return Err(VMDKError::InvalidSparseHeader("zero grain table entry count"));
        }
        Ok(header)
    }
}

// The slice bounds are checked by the caller, from_le_bytes conversions
// cannot fail.
fn le32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn le64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

/// A sparse extent with its grain directory and grain tables resolved.
pub struct SparseExtent {
    header: VMDKSparseHeader,
    grain_directory: Vec<u32>,
    /// One table per directory entry; empty when the directory entry is 0,
    /// meaning every grain under it is a hole.
    grain_tables: Vec<Vec<u32>>,
    reader: ExtentReader,
    virtual_offset: u64,
    total_size: u64,
    filename: String,
}

impl std::fmt::Debug for SparseExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseExtent")
            .field("header", &self.header)
            .field("grain_directory", &self.grain_directory)
            .field("grain_tables", &self.grain_tables)
            .field("virtual_offset", &self.virtual_offset)
            .field("total_size", &self.total_size)
            .field("filename", &self.filename)
            .finish()
    }
}

impl SparseExtent {
    /// Reads the header, grain directory and all referenced grain tables
    /// from the start of `reader`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid header, on compressed grain data (not
    /// supported) and on any IO error while loading the tables.
    pub fn new(reader: ExtentReader, filename: &str, virtual_offset: u64) -> Result<SparseExtent> {
        let mut header_data = [0u8; SECTOR_SIZE as usize];
        reader.read_exact_at(&mut header_data, 0)?;
        let header = VMDKSparseHeader::parse(&header_data)?;
        debug!("Parsed sparse header of {}: {:?}", filename, header);

        if header.flags & FLAG_HAS_COMPRESSED_GRAIN_DATA != 0 {
            return Err(VMDKError::Unsupported("compressed grain data"));
        }

        let total_size = header
            .capacity
            .checked_mul(SECTOR_SIZE)
            .ok_or(VMDKError::InvalidSparseHeader("capacity out of range"))?;

        // Prefer the redundant grain directory when the primary one is
        // marked invalid.
        let gd_sector = if header.flags & FLAG_USE_SECONDARY_GRAIN_DIRECTORY != 0
            || header.gd_offset == -1
        {
            header.rgd_offset
        } else if header.gd_offset > 0 {
            header.gd_offset as u64
        } else {
            0
        };
        if gd_sector == 0 {
            return Err(VMDKError::InvalidSparseHeader("no grain directory"));
        }

        let sectors_per_gt = header.grain_size * u64::from(header.gt_entries);
        let gd_entry_count = header.capacity.div_ceil(sectors_per_gt);
        debug!("Grain directory entry count: {}", gd_entry_count);

        let mut gd_data = vec![0u8; gd_entry_count as usize * 4];
        reader.read_exact_at(&mut gd_data, gd_sector * SECTOR_SIZE)?;
        let grain_directory: Vec<u32> = gd_data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        let mut grain_tables = Vec::with_capacity(grain_directory.len());
        let mut gt_data = vec![0u8; header.gt_entries as usize * 4];
        for &gt_sector in &grain_directory {
            if gt_sector == 0 {
                grain_tables.push(Vec::new());
                continue;
            }
            reader.read_exact_at(&mut gt_data, u64::from(gt_sector) * SECTOR_SIZE)?;
            grain_tables.push(
                gt_data
                    .chunks_exact(4)
                    .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
                    .collect(),
            );
        }

        Ok(SparseExtent {
            header,
            grain_directory,
            grain_tables,
            reader,
            virtual_offset,
            total_size,
            filename: filename.to_string(),
        })
    }

    pub fn header(&self) -> &VMDKSparseHeader {
        &self.header
    }

    pub fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Backing file name as written in the descriptor.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Sector of the grain with the given index, or 0 when the grain is
    /// not allocated at either table level.
    fn grain_sector(&self, grain_index: u64) -> u32 {
        let gt_index = (grain_index / u64::from(self.header.gt_entries)) as usize;
        let entry_index = (grain_index % u64::from(self.header.gt_entries)) as usize;
        match self.grain_tables.get(gt_index) {
            Some(table) => table.get(entry_index).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Reads from the extent at `offset` (relative to the start of the
    /// extent). The request may straddle any number of grains; holes are
    /// filled with zeros without touching the backing file. Returns
    /// `Ok(0)` at or past the end of the extent.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        let to_read = min(buf.len() as u64, self.total_size - offset) as usize;
        let buf = &mut buf[..to_read];
        let grain_bytes = self.header.grain_size * SECTOR_SIZE;

        let mut filled = 0usize;
        while filled < buf.len() {
            let pos = offset + filled as u64;
            let grain_index = pos / grain_bytes;
            let in_grain = pos % grain_bytes;
            let chunk = min((grain_bytes - in_grain) as usize, buf.len() - filled);

            let grain_sector = self.grain_sector(grain_index);
            if grain_sector == 0 {
                buf[filled..filled + chunk].fill(0);
                filled += chunk;
                continue;
            }

            let file_offset = u64::from(grain_sector) * SECTOR_SIZE + in_grain;
            let n = self.reader.read_at(&mut buf[filled..filled + chunk], file_offset)?;
            if n == 0 {
                // Truncated backing file, report what we have.
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub fn stats(&self) -> ExtentStat {
        ExtentStat {
            extent_type: "sparse",
            size: self.total_size,
            filename: self.filename.clone(),
        }
    }

    pub fn debug(&self) {
        debug!(
            "[SparseExtent] file: {}, offset: {}, size: {}, grain size: {} sectors",
            self.filename, self.virtual_offset, self.total_size, self.header.grain_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put32(data: &mut [u8], at: usize, value: u32) {
        data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put64(data: &mut [u8], at: usize, value: u64) {
        data[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    const SECTOR: usize = SECTOR_SIZE as usize;

    /// Builds a minimal sparse extent data file: header in sector 0, grain
    /// directory next, then one grain table per directory entry, then the
    /// listed grains (index, fill byte) in order.
    fn build_sparse_image(
        capacity: u64,
        grain_size: u64,
        gt_entries: u32,
        grains: &[(u64, u8)],
    ) -> Vec<u8> {
        let sectors_per_gt = grain_size * u64::from(gt_entries);
        let gd_entry_count = capacity.div_ceil(sectors_per_gt);
        let gd_sectors = (gd_entry_count * 4).div_ceil(SECTOR_SIZE);
        let gt_sectors = (u64::from(gt_entries) * 4).div_ceil(SECTOR_SIZE);

        let gd_sector = 1u64;
        let first_gt_sector = gd_sector + gd_sectors;
        let first_grain_sector = first_gt_sector + gd_entry_count * gt_sectors;
        let file_sectors = first_grain_sector + grains.len() as u64 * grain_size;

        let mut image = vec![0u8; file_sectors as usize * SECTOR];

        // Header.
        put32(&mut image, 0, SPARSE_MAGICNUMBER);
        put32(&mut image, 4, 1); // version
        put32(&mut image, 8, 1); // flags: valid newline detection test
        put64(&mut image, 12, capacity);
        put64(&mut image, 20, grain_size);
        put32(&mut image, 44, gt_entries);
        put64(&mut image, 56, gd_sector);
        put64(&mut image, 64, first_grain_sector); // overhead

        // Grain directory.
        for i in 0..gd_entry_count {
            put32(
                &mut image,
                (gd_sector * SECTOR_SIZE) as usize + i as usize * 4,
                (first_gt_sector + i * gt_sectors) as u32,
            );
        }

        // Grain tables and grain data.
        for (slot, &(grain_index, fill)) in grains.iter().enumerate() {
            let grain_sector = first_grain_sector + slot as u64 * grain_size;
            let gt_index = grain_index / u64::from(gt_entries);
            let entry_index = grain_index % u64::from(gt_entries);
            let entry_at = ((first_gt_sector + gt_index * gt_sectors) * SECTOR_SIZE) as usize
                + entry_index as usize * 4;
            put32(&mut image, entry_at, grain_sector as u32);

            let start = (grain_sector * SECTOR_SIZE) as usize;
            let end = start + (grain_size * SECTOR_SIZE) as usize;
            image[start..end].fill(fill);
        }

        image
    }

    fn open(image: Vec<u8>) -> SparseExtent {
        SparseExtent::new(Box::new(image), "test.vmdk", 0).unwrap()
    }

    #[test]
    fn test_parse_header_fields() {
        let image = build_sparse_image(64, 16, 512, &[]);
        let header = VMDKSparseHeader::parse(&image[..SECTOR]).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.capacity, 64);
        assert_eq!(header.grain_size, 16);
        assert_eq!(header.gt_entries, 512);
        assert_eq!(header.gd_offset, 1);
        assert_eq!(header.rgd_offset, 0);
    }

    #[test]
    fn test_bad_magic() {
        let mut image = build_sparse_image(64, 16, 512, &[]);
        image[0] = b'X';
        let err = SparseExtent::new(Box::new(image), "test.vmdk", 0).unwrap_err();
        assert!(matches!(err, VMDKError::BadMagic));
    }

    #[test]
    fn test_rejects_compressed_grain_data() {
        let mut image = build_sparse_image(64, 16, 512, &[]);
        put32(&mut image, 8, 1 | FLAG_HAS_COMPRESSED_GRAIN_DATA);
        let err = SparseExtent::new(Box::new(image), "test.vmdk", 0).unwrap_err();
        assert!(matches!(err, VMDKError::Unsupported(_)));
    }

    #[test]
    fn test_rejects_degenerate_geometry() {
        let mut image = build_sparse_image(64, 16, 512, &[]);
        put64(&mut image, 20, 0); // grain size
        let err = SparseExtent::new(Box::new(image), "test.vmdk", 0).unwrap_err();
        assert!(matches!(err, VMDKError::InvalidSparseHeader(_)));
    }

    #[test]
    fn test_allocated_and_hole_grains() {
        // 64 sectors at 16 sectors per grain: grains 0 and 2 allocated,
        // grains 1 and 3 are holes.
        let extent = open(build_sparse_image(64, 16, 512, &[(0, 0xAA), (2, 0xBB)]));
        assert_eq!(extent.total_size(), 64 * SECTOR_SIZE);

        let grain_bytes = 16 * SECTOR;
        let mut buf = vec![0xFFu8; 4 * grain_bytes];
        assert_eq!(extent.read_at(&mut buf, 0).unwrap(), 4 * grain_bytes);
        assert!(buf[..grain_bytes].iter().all(|&b| b == 0xAA));
        assert!(buf[grain_bytes..2 * grain_bytes].iter().all(|&b| b == 0));
        assert!(buf[2 * grain_bytes..3 * grain_bytes].iter().all(|&b| b == 0xBB));
        assert!(buf[3 * grain_bytes..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_straddles_hole_into_allocated_grain() {
        // Grain 5 is a hole, grain 6 holds 0xCC; a read starting mid-grain
        // 5 returns zeros then 0xCC.
        let extent = open(build_sparse_image(128, 16, 512, &[(6, 0xCC)]));
        let grain_bytes = 16 * SECTOR;

        let mut buf = vec![0xFFu8; grain_bytes];
        let start = 5 * grain_bytes as u64 + grain_bytes as u64 / 2;
        assert_eq!(extent.read_at(&mut buf, start).unwrap(), grain_bytes);
        assert!(buf[..grain_bytes / 2].iter().all(|&b| b == 0));
        assert!(buf[grain_bytes / 2..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_hole_at_grain_directory_level() {
        // Small grain tables of 4 entries so the image spans several
        // directory entries; the second one is zeroed out afterwards.
        let mut image = build_sparse_image(192, 16, 4, &[(0, 0xAA), (8, 0xDD)]);
        put32(&mut image, SECTOR + 4, 0); // grain directory entry 1
        let extent = open(image);

        let grain_bytes = 16 * SECTOR;
        let mut buf = vec![0xFFu8; 4 * grain_bytes];
        // Grains 4..8 sit under the zeroed directory entry.
        assert_eq!(
            extent.read_at(&mut buf, 4 * grain_bytes as u64).unwrap(),
            4 * grain_bytes
        );
        assert!(buf.iter().all(|&b| b == 0));

        let mut buf = vec![0u8; grain_bytes];
        assert_eq!(
            extent.read_at(&mut buf, 8 * grain_bytes as u64).unwrap(),
            grain_bytes
        );
        assert!(buf.iter().all(|&b| b == 0xDD));
    }

    #[test]
    fn test_capacity_clamps_final_grain() {
        // 40 sectors at 16 per grain: the last grain only covers 8
        // sectors of the declared capacity.
        let extent = open(build_sparse_image(40, 16, 512, &[(2, 0xEE)]));
        assert_eq!(extent.total_size(), 40 * SECTOR_SIZE);

        let mut buf = vec![0u8; 16 * SECTOR];
        let n = extent.read_at(&mut buf, 2 * 16 * SECTOR_SIZE).unwrap();
        assert_eq!(n, 8 * SECTOR);
        assert!(buf[..n].iter().all(|&b| b == 0xEE));

        assert_eq!(extent.read_at(&mut buf, 40 * SECTOR_SIZE).unwrap(), 0);
    }

    #[test]
    fn test_secondary_grain_directory() {
        // gd_offset of -1 forces the redundant directory, which points at
        // the same tables here.
        let mut image = build_sparse_image(64, 16, 512, &[(1, 0x5A)]);
        put64(&mut image, 48, 1); // rgd_offset
        put64(&mut image, 56, u64::MAX); // gd_offset = -1
        let extent = open(image);

        let grain_bytes = 16 * SECTOR;
        let mut buf = vec![0u8; grain_bytes];
        assert_eq!(extent.read_at(&mut buf, grain_bytes as u64).unwrap(), grain_bytes);
        assert!(buf.iter().all(|&b| b == 0x5A));
    }
}
