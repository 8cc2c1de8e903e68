use arweave_gateway_types::H256;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::cdb64::Cdb64Error;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Where a partition's CDB64 bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartitionLocation {
    /// A file relative to the reader's base directory.
    File { filename: String },
    /// Served directly over HTTP range requests.
    Http { url: String },
    /// A whole transaction's data, content addressed.
    ArweaveId { id: H256 },
    /// A byte range nested inside another transaction's data, e.g. a bundle
    /// item.
    #[serde(rename_all = "camelCase")]
    ArweaveByteRange {
        root_tx_id: H256,
        data_offset_in_root_tx: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    /// Two lowercase hex chars, the first byte of every key in the
    /// partition.
    pub prefix: String,
    pub location: PartitionLocation,
    pub record_count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cdb64Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Sorted ascending by `prefix`.
    pub partitions: Vec<PartitionInfo>,
}

impl Cdb64Manifest {
    /// Schema checks beyond what serde enforces: version, prefix shape,
    /// sort order and uniqueness.
    pub fn validate(&self) -> Result<(), Cdb64Error> {
        if self.version != MANIFEST_VERSION {
            return Err(Cdb64Error::Manifest(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        let mut previous: Option<u8> = None;
        for partition in &self.partitions {
            let prefix = partition_prefix_byte(&partition.prefix)?;
            if let Some(previous) = previous {
                if prefix <= previous {
                    return Err(Cdb64Error::Manifest(format!(
                        "partitions are not sorted by prefix at {:02x}",
                        prefix
                    )));
                }
            }
            previous = Some(prefix);
        }
        Ok(())
    }
}

/// Parses a two-hex-char partition prefix into its key byte.
pub fn partition_prefix_byte(prefix: &str) -> Result<u8, Cdb64Error> {
    if prefix.len() != 2 {
        return Err(Cdb64Error::Manifest(format!(
            "partition prefix {prefix:?} is not two hex chars"
        )));
    }
    u8::from_str_radix(prefix, 16)
        .map_err(|_| Cdb64Error::Manifest(format!("partition prefix {prefix:?} is not hex")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_json() -> &'static str {
        r#"{
            "version": 1,
            "createdAt": "2025-01-01T00:00:00Z",
            "totalRecords": 160,
            "partitions": [
                {
                    "prefix": "00",
                    "location": { "type": "file", "filename": "00.cdb" },
                    "recordCount": 10,
                    "size": 4096
                },
                {
                    "prefix": "7f",
                    "location": { "type": "http", "url": "https://host/7f.cdb" },
                    "recordCount": 143,
                    "size": 8192
                },
                {
                    "prefix": "ff",
                    "location": {
                        "type": "arweave-byte-range",
                        "rootTxId": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "dataOffsetInRootTx": 1024
                    },
                    "recordCount": 7,
                    "size": 4096
                }
            ]
        }"#
    }

    #[test]
    fn manifest_round_trips_and_validates() {
        let manifest: Cdb64Manifest = serde_json::from_str(manifest_json()).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.total_records, 160);
        assert_eq!(manifest.partitions.len(), 3);
        assert!(matches!(
            manifest.partitions[2].location,
            PartitionLocation::ArweaveByteRange {
                data_offset_in_root_tx: 1024,
                ..
            }
        ));

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"arweave-byte-range\""));
        assert!(json.contains("\"rootTxId\""));
        let back: Cdb64Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn out_of_order_partitions_are_rejected() {
        let mut manifest: Cdb64Manifest = serde_json::from_str(manifest_json()).unwrap();
        manifest.partitions.swap(0, 1);
        assert!(matches!(
            manifest.validate().unwrap_err(),
            Cdb64Error::Manifest(_)
        ));
    }

    #[test]
    fn bad_prefix_is_rejected() {
        assert!(partition_prefix_byte("zz").is_err());
        assert!(partition_prefix_byte("0").is_err());
        assert_eq!(partition_prefix_byte("ff").unwrap(), 0xff);
        assert_eq!(partition_prefix_byte("00").unwrap(), 0x00);
    }
}
