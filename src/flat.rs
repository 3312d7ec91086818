//! Flat (raw) extent reading.
//!
//! A flat extent is a linear window into a backing data file: byte `n` of
//! the extent lives at `base_offset + n` in the backing reader. This covers
//! both the `FLAT` and `VMFS` extent kinds.

use std::cmp::min;
use std::io;

use log::debug;

use crate::extent::ExtentStat;
use crate::{ExtentReader, ReadAt};

pub struct FlatExtent {
    reader: ExtentReader,
    /// Byte offset of the extent's first byte within the backing file.
    base_offset: u64,
    /// Byte offset of the extent's first byte within the assembled image.
    virtual_offset: u64,
    total_size: u64,
    filename: String,
}

impl FlatExtent {
    pub fn new(
        reader: ExtentReader,
        filename: &str,
        base_offset: u64,
        total_size: u64,
        virtual_offset: u64,
    ) -> FlatExtent {
        FlatExtent {
            reader,
            base_offset,
            virtual_offset,
            total_size,
            filename: filename.to_string(),
        }
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

    /// Reads from the extent at `offset` (relative to the start of the
    /// extent), delegating to the backing reader. Returns `Ok(0)` at or
    /// past the end of the extent.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.total_size {
            return Ok(0);
        }
        let to_read = min(buf.len() as u64, self.total_size - offset) as usize;
        self.reader
            .read_at(&mut buf[..to_read], self.base_offset + offset)
    }

    pub fn stats(&self) -> ExtentStat {
        ExtentStat {
            extent_type: "flat",
            size: self.total_size,
            filename: self.filename.clone(),
        }
    }

    pub fn debug(&self) {
        debug!(
            "[FlatExtent] file: {}, offset: {}, size: {}",
            self.filename, self.virtual_offset, self.total_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECTOR_SIZE;

    fn backing() -> Vec<u8> {
        // Four sectors: 0x10, 0x11, 0x12, 0x13.
        let mut data = Vec::new();
        for i in 0..4u8 {
            data.extend_from_slice(&vec![0x10 + i; SECTOR_SIZE as usize]);
        }
        data
    }

    #[test]
    fn test_read_whole_window() {
        let extent = FlatExtent::new(Box::new(backing()), "a.vmdk", 0, 2048, 0);
        let mut buf = vec![0u8; 2048];
        assert_eq!(extent.read_at(&mut buf, 0).unwrap(), 2048);
        assert_eq!(&buf[..512], &[0x10u8; 512][..]);
        assert_eq!(&buf[1536..], &[0x13u8; 512][..]);
    }

    #[test]
    fn test_window_into_larger_file() {
        // The extent starts one sector into the backing file and spans two
        // sectors; reading the whole extent must equal reading those bytes
        // straight from the backing data.
        let data = backing();
        let extent = FlatExtent::new(Box::new(data.clone()), "a.vmdk", 512, 1024, 0);
        let mut buf = vec![0u8; 1024];
        assert_eq!(extent.read_at(&mut buf, 0).unwrap(), 1024);
        assert_eq!(&buf[..], &data[512..1536]);
    }

    #[test]
    fn test_read_clamps_to_extent_end() {
        let extent = FlatExtent::new(Box::new(backing()), "a.vmdk", 0, 1024, 0);
        let mut buf = vec![0u8; 2048];
        assert_eq!(extent.read_at(&mut buf, 1000).unwrap(), 24);
    }

    #[test]
    fn test_read_past_end_is_eof() {
        let extent = FlatExtent::new(Box::new(backing()), "a.vmdk", 0, 1024, 0);
        let mut buf = [0u8; 8];
        assert_eq!(extent.read_at(&mut buf, 1024).unwrap(), 0);
        assert_eq!(extent.read_at(&mut buf, 4096).unwrap(), 0);
    }
}
