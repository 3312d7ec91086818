//! Line-oriented parsing of the VMDK descriptor.
//!
//! The descriptor is ASCII text split into sections that are introduced by
//! comment lines (`# Disk DescriptorFile`, `# Extent description`,
//! `# The Disk Data Base`). It either occupies its own file or is embedded
//! somewhere within the header sectors of a monolithic sparse disk, in
//! which case the data file starts with the `KDMV` magic number and the
//! parser scans forward for the descriptor signature line.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use strum::EnumString;

use crate::config::VMDKConfig;
use crate::errors::{Result, VMDKError};
use crate::SPARSE_MAGICNUMBER;

const DESCRIPTOR_FILE_SIGNATURE: &str = "# Disk DescriptorFile";
const DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";

/// Access mode declared for an extent.
#[derive(Clone, Copy, Debug, EnumString, PartialEq, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VMDKExtentAccessMode {
    Rw,
    R,
}

/// The kinds of extent data files this crate can read. The kind token of
/// an extent line is only matched against these once the extent is
/// decoded; anything else fails with
/// [`VMDKError::UnsupportedExtentType`] at that point.
#[derive(Clone, Copy, Debug, EnumString, PartialEq, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VMDKExtentType {
    /// VMDK sparse extent data file, allocated in grains.
    Sparse,
    /// RAW extent data file.
    Flat,
    /// RAW extent data file on VMFS, read exactly like `FLAT`.
    Vmfs,
}

/// One extent line of the descriptor, e.g.
/// `RW 4192256 SPARSE "disk-s001.vmdk"` or
/// `RW 1024 FLAT "disk-f001.vmdk" 2048`.
#[derive(Clone, Debug, PartialEq)]
pub struct VMDKExtentDescriptor {
    pub access_mode: VMDKExtentAccessMode,
    /// Number of sectors the extent contributes to the virtual disk.
    pub sector_count: u64,
    /// The kind token exactly as written in the extent line, e.g.
    /// `SPARSE`. Validated against [`VMDKExtentType`] when the extent is
    /// decoded, not here.
    pub extent_type: String,
    /// Backing file name as written in the descriptor, without any path
    /// resolution applied.
    pub file_name: String,
    /// Start sector of the extent data within the backing file. Optional
    /// and defaults to 0; several flat extents may share one backing file
    /// at different start sectors.
    pub start_sector: Option<u64>,
}

/// A parsed descriptor: the recognized settings plus the declared extents
/// in declaration order.
#[derive(Debug)]
pub struct VMDKDescriptor {
    pub config: VMDKConfig,
    pub extents: Vec<VMDKExtentDescriptor>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Init,
    /// The buffer opened with the sparse magic number; looking for the
    /// descriptor signature somewhere within the header sectors.
    Kdmv,
    Descriptor,
    Extents,
    DiskDataBase,
}

impl VMDKDescriptor {
    /// Parses a descriptor out of the given buffer, normally the first
    /// 64 KiB of the primary file.
    ///
    /// A buffer holding no descriptor at all yields an empty extent list
    /// and an all-default configuration rather than an error.
    ///
    /// # Errors
    ///
    /// Fails on a malformed number in an extent line or an extent kind
    /// outside the supported set.
    pub fn parse(buf: &[u8]) -> Result<VMDKDescriptor> {
        let mut config = VMDKConfig::default();
        let mut extents = Vec::new();

        let mut state = State::Init;
        if buf.len() >= 4 && u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) == SPARSE_MAGICNUMBER
        {
            state = State::Kdmv;
        }

        let text = String::from_utf8_lossy(buf);
        for raw_line in text.split('\n') {
            let line = raw_line.trim();

            if line.starts_with(DESCRIPTOR_FILE_SIGNATURE) {
                state = State::Descriptor;
                continue;
            }
            if line.starts_with(DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE) {
                state = State::Extents;
                continue;
            }
            if line.starts_with(DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE) {
                state = State::DiskDataBase;
                continue;
            }

            match state {
                State::Kdmv => {
                    // The signature line is embedded mid-sector, so it may
                    // carry leading binary garbage on the same line.
                    if line.contains(DESCRIPTOR_FILE_SIGNATURE) {
                        state = State::Descriptor;
                    }
                }
                State::Descriptor | State::DiskDataBase => {
                    save_descriptor_setting(line, &mut config);
                }
                State::Extents => match parse_extent_line(line)? {
                    Some(extent) => extents.push(extent),
                    // Any non-extent line terminates the extent list.
                    None => state = State::Init,
                },
                State::Init => {}
            }
        }

        Ok(VMDKDescriptor { config, extents })
    }
}

/// Stores a `key = value` line into the configuration. Values may carry one
/// pair of surrounding double quotes. Lines without `=` and unrecognized
/// keys are ignored.
fn save_descriptor_setting(line: &str, config: &mut VMDKConfig) {
    let Some((key, value)) = line.split_once('=') else {
        return;
    };
    let key = key.trim();
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    config.apply(key, value);
}

/// Parses one line of the extent section. Returns `Ok(None)` when the line
/// is not an extent declaration at all.
fn parse_extent_line(line: &str) -> Result<Option<VMDKExtentDescriptor>> {
    static EXTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"^(RW|R)\s+(\d+)\s+([A-Z]+)\s+"([^"]+)"(?:\s+(\d+))?"#).unwrap()
    });

    let Some(captures) = EXTENT_REGEX.captures(line) else {
        return Ok(None);
    };

    // Groups 1 to 4 always match once the regex does.
    let access_mode = VMDKExtentAccessMode::from_str(&captures[1])
        .map_err(|_| VMDKError::DescriptorParse(format!("invalid access mode in {:?}", line)))?;
    let sector_count: u64 = captures[2].parse().map_err(|_| {
        VMDKError::DescriptorParse(format!("invalid sector count in {:?}", line))
    })?;
    let extent_type = captures[3].to_string();
    let file_name = captures[4].to_string();
    let start_sector = captures
        .get(5)
        .map(|m| m.as_str().parse::<u64>())
        .transpose()
        .map_err(|_| {
            VMDKError::DescriptorParse(format!("invalid start sector in {:?}", line))
        })?;

    Ok(Some(VMDKExtentDescriptor {
        access_mode,
        sector_count,
        extent_type,
        file_name,
        start_sector,
    }))
}
