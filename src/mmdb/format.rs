//! MMDB Binary Format Parsing
//!
//! Only the header fields needed for tree traversal are extracted eagerly;
//! the rest of the metadata stays in the mapped file and is decoded on demand.

use super::types::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR, METADATA_MARKER};
use crate::data_section::{DataDecoder, DataValue};
use std::collections::HashMap;

/// MMDB file header
///
/// Contains only the information needed for lookups and network walks.
#[derive(Debug, Clone, Copy)]
pub struct MmdbHeader {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits (24, 28, or 32)
    pub record_size: RecordSize,
    /// IP version (4 or 6)
    pub ip_version: IpVersion,
    /// Size of the search tree in bytes
    pub tree_size: usize,
}

impl MmdbHeader {
    /// Parse MMDB file and extract header information
    pub fn from_file(data: &[u8]) -> Result<Self, MmdbError> {
        let metadata = MmdbMetadata::from_file(data)?;
        let map = match metadata.as_value()? {
            DataValue::Map(map) => map,
            _ => {
                return Err(MmdbError::InvalidMetadata(
                    "Metadata is not a map".to_string(),
                ))
            }
        };

        let node_count = extract_uint(&map, "node_count")?;
        let record_size_bits = extract_uint(&map, "record_size")?;
        let ip_version_num = extract_uint(&map, "ip_version")?;

        let record_size = RecordSize::from_bits(record_size_bits as u16)?;
        let ip_version = match ip_version_num {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            _ => {
                return Err(MmdbError::InvalidMetadata(format!(
                    "Invalid IP version: {}",
                    ip_version_num
                )))
            }
        };

        let node_count = u32::try_from(node_count).map_err(|_| {
            MmdbError::InvalidMetadata(format!("node_count {} out of range", node_count))
        })?;
        let tree_size = (node_count as usize) * record_size.node_bytes();

        // Tree and separator must fit before the metadata marker
        if tree_size + DATA_SECTION_SEPARATOR > metadata.marker_offset {
            return Err(MmdbError::InvalidFormat(format!(
                "Search tree of {} bytes does not fit before metadata at {}",
                tree_size, metadata.marker_offset
            )));
        }

        Ok(MmdbHeader {
            node_count,
            record_size,
            ip_version,
            tree_size,
        })
    }

    /// Offset of the first byte of the data section
    pub fn data_section_start(&self) -> usize {
        self.tree_size + DATA_SECTION_SEPARATOR
    }
}

/// Optional metadata access (parses on-demand)
pub struct MmdbMetadata<'a> {
    raw_data: &'a [u8],
    marker_offset: usize,
}

impl<'a> MmdbMetadata<'a> {
    /// Create metadata accessor from mapped file data
    pub fn from_file(data: &'a [u8]) -> Result<Self, MmdbError> {
        let marker_offset = find_metadata_marker(data)?;
        Ok(MmdbMetadata {
            raw_data: data,
            marker_offset,
        })
    }

    /// Get full metadata as DataValue (allocates on-demand)
    pub fn as_value(&self) -> Result<DataValue, MmdbError> {
        let start = self.marker_offset + METADATA_MARKER.len();
        DataDecoder::new(&self.raw_data[start..], 0)
            .decode(0)
            .map_err(|e| MmdbError::InvalidMetadata(e.to_string()))
    }

    /// The `database_type` metadata field, if present
    pub fn database_type(&self) -> Option<String> {
        self.as_value()
            .ok()?
            .get_path("database_type")?
            .as_str()
            .map(str::to_string)
    }

    /// The `build_epoch` metadata field, if present
    pub fn build_epoch(&self) -> Option<u64> {
        self.as_value().ok()?.get_path("build_epoch")?.as_u64()
    }
}

/// Find the metadata marker in an MMDB file
///
/// The marker appears somewhere in the last 128KB of the file and the
/// metadata follows it. If there are several, the last one wins.
pub fn find_metadata_marker(data: &[u8]) -> Result<usize, MmdbError> {
    const SEARCH_SIZE: usize = 128 * 1024;

    if data.len() < METADATA_MARKER.len() {
        return Err(MmdbError::MetadataNotFound);
    }

    let search_start = data.len().saturating_sub(SEARCH_SIZE);
    data[search_start..]
        .windows(METADATA_MARKER.len())
        .rposition(|window| window == METADATA_MARKER)
        .map(|pos| search_start + pos)
        .ok_or(MmdbError::MetadataNotFound)
}

fn extract_uint(map: &HashMap<String, DataValue>, key: &str) -> Result<u64, MmdbError> {
    match map.get(key) {
        Some(value) => value.as_u64().ok_or_else(|| {
            MmdbError::InvalidMetadata(format!("Field '{}' is not an unsigned integer", key))
        }),
        None => Err(MmdbError::InvalidMetadata(format!(
            "Required field '{}' not found",
            key
        ))),
    }
}
