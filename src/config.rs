//! Descriptor metadata recognized by the reader.

use serde::{Deserialize, Serialize};

// Values seen in the `createType` descriptor setting.
pub const MONOLITHIC_SPARSE: &str = "monolithicSparse";
pub const MONOLITHIC_FLAT: &str = "monolithicFlat";
pub const TWO_GB_MAX_EXTENT_SPARSE: &str = "twoGbMaxExtentSparse";
pub const TWO_GB_MAX_EXTENT_FLAT: &str = "twoGbMaxExtentFlat";
pub const STREAM_OPTIMIZED: &str = "streamOptimized";
pub const VMFS: &str = "vmfs";
pub const VMFS_SPARSE: &str = "vmfsSparse";
pub const VMFS_RAW: &str = "vmfsRaw";
pub const VMFS_PASSTHROUGH_RAW_DEVICE_MAP: &str = "vmfsPassthroughRawDeviceMap";
pub const FULL_DEVICE: &str = "fullDevice";
pub const PARTITIONED_DEVICE: &str = "partitionedDevice";
pub const CUSTOM: &str = "custom";
pub const UNKNOWN: &str = "unknown";

/// Settings collected from the header and disk database sections of the
/// descriptor.
///
/// Only a fixed set of keys is recognized; anything else in the descriptor
/// is silently ignored. All values are kept as the strings they appear as,
/// including the CHS geometry numbers. Serializing the struct reproduces
/// the descriptor key names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VMDKConfig {
    pub version: String,
    pub encoding: String,
    /// Content identifier of this disk state, as a hex string.
    #[serde(rename = "CID")]
    pub cid: String,
    /// Content identifier of the parent snapshot. Informational only:
    /// parent chains are not resolved.
    #[serde(rename = "parentCID")]
    pub parent_cid: String,
    #[serde(rename = "createType")]
    pub create_type: String,
    #[serde(rename = "ddb.adapterType")]
    pub adapter_type: String,
    #[serde(rename = "ddb.geometry.cylinders")]
    pub geometry_cylinders: String,
    #[serde(rename = "ddb.geometry.heads")]
    pub geometry_heads: String,
    #[serde(rename = "ddb.geometry.sectors")]
    pub geometry_sectors: String,
    #[serde(rename = "ddb.longContentID")]
    pub long_content_id: String,
    #[serde(rename = "ddb.uuid")]
    pub uuid: String,
    #[serde(rename = "ddb.virtualHWVersion")]
    pub virtual_hw_version: String,
}

impl Default for VMDKConfig {
    fn default() -> Self {
        VMDKConfig {
            version: String::from("1"),
            encoding: String::from("windows-1252"),
            cid: String::from("0"),
            parent_cid: String::from("0"),
            create_type: String::from(UNKNOWN),
            adapter_type: String::from("lsilogic"),
            geometry_cylinders: String::from("0"),
            geometry_heads: String::from("0"),
            geometry_sectors: String::from("0"),
            long_content_id: String::new(),
            uuid: String::new(),
            virtual_hw_version: String::new(),
        }
    }
}

impl VMDKConfig {
    /// Applies one `key = value` setting from the descriptor. Unrecognized
    /// keys are ignored.
    pub(crate) fn apply(&mut self, key: &str, value: &str) {
        let field = match key {
            "version" => &mut self.version,
            "encoding" => &mut self.encoding,
            "CID" => &mut self.cid,
            "parentCID" => &mut self.parent_cid,
            "createType" => &mut self.create_type,
            "ddb.adapterType" => &mut self.adapter_type,
            "ddb.geometry.cylinders" => &mut self.geometry_cylinders,
            "ddb.geometry.heads" => &mut self.geometry_heads,
            "ddb.geometry.sectors" => &mut self.geometry_sectors,
            "ddb.longContentID" => &mut self.long_content_id,
            "ddb.uuid" => &mut self.uuid,
            "ddb.virtualHWVersion" => &mut self.virtual_hw_version,
            _ => return,
        };
        *field = value.to_string();
    }

    /// Renders the configuration as pretty-printed JSON, keyed by the
    /// descriptor setting names.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VMDKConfig::default();
        assert_eq!(config.version, "1");
        assert_eq!(config.encoding, "windows-1252");
        assert_eq!(config.cid, "0");
        assert_eq!(config.parent_cid, "0");
        assert_eq!(config.create_type, "unknown");
        assert_eq!(config.adapter_type, "lsilogic");
        assert_eq!(config.geometry_cylinders, "0");
        assert_eq!(config.geometry_heads, "0");
        assert_eq!(config.geometry_sectors, "0");
        assert_eq!(config.long_content_id, "");
        assert_eq!(config.uuid, "");
        assert_eq!(config.virtual_hw_version, "");
    }

    #[test]
    fn test_apply_recognized_keys() {
        let mut config = VMDKConfig::default();
        config.apply("CID", "fffffffe");
        config.apply("createType", MONOLITHIC_SPARSE);
        config.apply("ddb.adapterType", "buslogic");
        config.apply("ddb.geometry.cylinders", "16383");
        config.apply("ddb.uuid", "60 00 C2 93");

        assert_eq!(config.cid, "fffffffe");
        assert_eq!(config.create_type, "monolithicSparse");
        assert_eq!(config.adapter_type, "buslogic");
        assert_eq!(config.geometry_cylinders, "16383");
        assert_eq!(config.uuid, "60 00 C2 93");
    }

    #[test]
    fn test_apply_ignores_unknown_keys() {
        let mut config = VMDKConfig::default();
        config.apply("ddb.thinProvisioned", "1");
        config.apply("ddb.toolsVersion", "0");
        config.apply("somethingElse", "value");
        assert_eq!(config, VMDKConfig::default());
    }

    #[test]
    fn test_json_uses_descriptor_key_names() {
        let mut config = VMDKConfig::default();
        config.apply("ddb.adapterType", "ide");
        let json = config.to_json().unwrap();
        assert!(json.contains("\"ddb.adapterType\": \"ide\""));
        assert!(json.contains("\"parentCID\": \"0\""));
    }
}
