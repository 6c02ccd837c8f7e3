//! MMDB-specific Type Definitions
//!
//! Data values use the `DataValue` type from the `data_section` module.

use thiserror::Error;

/// MMDB metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Size of the zeroed separator between the search tree and the data section
pub const DATA_SECTION_SEPARATOR: usize = 16;

/// MMDB-specific error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmdbError {
    /// Invalid file format
    #[error("Invalid MMDB format: {0}")]
    InvalidFormat(String),
    /// Metadata not found
    #[error("MMDB metadata marker not found")]
    MetadataNotFound,
    /// Invalid metadata structure
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),
    /// Data decoding error
    #[error("Data decode error: {0}")]
    DecodeError(String),
    /// Address family not supported by this database
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),
}

impl From<crate::data_section::DecodeError> for MmdbError {
    fn from(err: crate::data_section::DecodeError) -> Self {
        MmdbError::DecodeError(err.to_string())
    }
}

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4 only
    V4,
    /// IPv6 (IPv4 lives in the ::/96 subtree)
    V6,
}

impl IpVersion {
    /// Numeric value stored in the metadata `ip_version` field
    pub fn as_u16(self) -> u16 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    /// 24-bit records (3 bytes per record, 6 bytes per node)
    Bits24 = 24,
    /// 28-bit records (3.5 bytes per record, 7 bytes per node)
    Bits28 = 28,
    /// 32-bit records (4 bytes per record, 8 bytes per node)
    Bits32 = 32,
}

impl RecordSize {
    /// Get the size of a node (2 records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Largest value a record of this size can hold
    pub fn max_value(self) -> u32 {
        match self {
            RecordSize::Bits24 => 0x00FF_FFFF,
            RecordSize::Bits28 => 0x0FFF_FFFF,
            RecordSize::Bits32 => u32::MAX,
        }
    }

    /// Create from bit size
    pub fn from_bits(bits: u16) -> Result<Self, MmdbError> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(MmdbError::InvalidFormat(format!(
                "Invalid record size: {} bits",
                bits
            ))),
        }
    }

    /// Record size in bits
    pub fn bits(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_round_trip() {
        for bits in [24u16, 28, 32] {
            assert_eq!(RecordSize::from_bits(bits).unwrap().bits(), bits);
        }
        assert!(RecordSize::from_bits(20).is_err());
    }

    #[test]
    fn test_node_bytes() {
        assert_eq!(RecordSize::Bits24.node_bytes(), 6);
        assert_eq!(RecordSize::Bits28.node_bytes(), 7);
        assert_eq!(RecordSize::Bits32.node_bytes(), 8);
    }
}
