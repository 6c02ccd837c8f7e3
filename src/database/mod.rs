//! Memory-mapped MaxMind databases
//!
//! A [`Database`] wraps one MMDB file (mapped with `memmap2`, or an owned
//! buffer) and answers point lookups and network walks. [`DatabaseManager`]
//! keeps the set of loaded databases current as files change on disk.
//!
//! ```rust
//! use mmdb_mcp::writer::MmdbWriter;
//! use mmdb_mcp::mmdb::{IpVersion, RecordSize};
//! use mmdb_mcp::{Database, DataValue};
//!
//! let mut writer = MmdbWriter::new(IpVersion::V4, RecordSize::Bits24);
//! writer.insert_str("198.51.100.0/24", DataValue::Bool(true))?;
//! let db = Database::from_bytes(writer.build()?)?;
//!
//! let hit = db.lookup_ip("198.51.100.20".parse()?)?.expect("inside the block");
//! assert_eq!(hit.network.to_string(), "198.51.100.0/24");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod manager;

pub use manager::{DatabaseInfo, DatabaseManager, DatabaseType};

use crate::data_section::{DataDecoder, DataValue};
use crate::iterator::{NetworkEntry, NetworkSource};
use crate::mmdb::{find_metadata_marker, MmdbError, MmdbHeader, MmdbMetadata, SearchTree};
use ipnet::IpNet;
use memmap2::Mmap;
use std::fs::File;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Result of a point lookup
#[derive(Debug, Clone, PartialEq)]
pub struct IpLookup {
    /// Network containing the address, in the address's own family
    pub network: IpNet,
    /// Record stored for that network
    pub data: DataValue,
}

/// Storage for database data - either owned or memory-mapped
enum DatabaseStorage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl DatabaseStorage {
    fn as_slice(&self) -> &[u8] {
        match self {
            DatabaseStorage::Owned(v) => v.as_slice(),
            DatabaseStorage::Mmap(m) => &m[..],
        }
    }
}

/// A loaded MaxMind database
pub struct Database {
    data: DatabaseStorage,
    header: MmdbHeader,
    /// Start of the metadata marker, which is also the end of the data section
    metadata_offset: usize,
}

impl Database {
    /// Open a database file using memory mapping
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            DatabaseError::Io(format!("Failed to open {}: {}", path.display(), e))
        })?;

        // SAFETY: the file is only read through the map. Database files are
        // replaced by rename, never rewritten in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            DatabaseError::Io(format!("Failed to mmap {}: {}", path.display(), e))
        })?;

        Self::from_storage(DatabaseStorage::Mmap(mmap))
    }

    /// Create database from raw bytes
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, DatabaseError> {
        Self::from_storage(DatabaseStorage::Owned(data))
    }

    fn from_storage(storage: DatabaseStorage) -> Result<Self, DatabaseError> {
        let data = storage.as_slice();
        let header = MmdbHeader::from_file(data)?;
        let metadata_offset = find_metadata_marker(data)?;

        Ok(Self {
            data: storage,
            header,
            metadata_offset,
        })
    }

    /// Parsed header
    pub fn header(&self) -> &MmdbHeader {
        &self.header
    }

    /// Look up an IP address
    ///
    /// Returns `Ok(None)` when the address has no record.
    pub fn lookup_ip(&self, addr: IpAddr) -> Result<Option<IpLookup>, DatabaseError> {
        let tree = SearchTree::new(self.data.as_slice(), &self.header);
        let found = match tree.lookup(addr)? {
            Some(found) => found,
            None => return Ok(None),
        };

        let network = IpNet::new(addr, found.prefix_len)
            .map_err(|e| MmdbError::InvalidFormat(e.to_string()))?
            .trunc();
        let data = self.decode_offset(found.data_offset)?;

        Ok(Some(IpLookup { network, data }))
    }

    /// Decode the record at a data section offset
    pub fn decode_offset(&self, data_offset: u32) -> Result<DataValue, DatabaseError> {
        Ok(self.decoder().decode(data_offset).map_err(MmdbError::from)?)
    }

    fn decoder(&self) -> DataDecoder<'_> {
        let data = self.data.as_slice();
        let start = self.header.data_section_start().min(self.metadata_offset);
        DataDecoder::new(&data[start..self.metadata_offset], 0)
    }

    /// Get database metadata as a map
    pub fn metadata(&self) -> Option<DataValue> {
        MmdbMetadata::from_file(self.data.as_slice())
            .ok()?
            .as_value()
            .ok()
    }

    /// The `database_type` metadata field
    pub fn database_type(&self) -> Option<String> {
        MmdbMetadata::from_file(self.data.as_slice())
            .ok()?
            .database_type()
    }

    /// Size of the underlying file or buffer in bytes
    pub fn size(&self) -> usize {
        self.data.as_slice().len()
    }
}

impl NetworkSource for Database {
    fn networks_within(
        &self,
        network: IpNet,
    ) -> Result<Box<dyn Iterator<Item = Result<NetworkEntry, MmdbError>> + '_>, MmdbError> {
        let tree = SearchTree::new(self.data.as_slice(), &self.header);
        let walk = tree.networks_within(network)?;
        Ok(Box::new(walk.map(|entry| {
            entry.map(|(network, offset)| NetworkEntry { network, offset })
        })))
    }

    fn decode(&self, entry: &NetworkEntry) -> Result<DataValue, MmdbError> {
        Ok(self.decoder().decode(entry.offset)?)
    }
}

/// Database error type
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
    /// Format error
    #[error("Format error: {0}")]
    Format(#[from] MmdbError),
}

impl DatabaseError {
    /// Stable error code for tool responses
    pub fn code(&self) -> &'static str {
        match self {
            DatabaseError::Io(_) => "io_error",
            DatabaseError::Format(MmdbError::InvalidIpAddress(_)) => "invalid_ip",
            DatabaseError::Format(_) => "lookup_failed",
        }
    }
}
