//! MMDB database writer
//!
//! Builds IPv4 or IPv6 MaxMind DB files from `(network, record)` pairs.
//! Records are deduplicated in the data section and the output is readable
//! by this crate's reader as well as by libmaxminddb.
//!
//! ```rust
//! use mmdb_mcp::writer::MmdbWriter;
//! use mmdb_mcp::mmdb::{IpVersion, RecordSize};
//! use mmdb_mcp::{Database, DataValue};
//!
//! let mut writer = MmdbWriter::new(IpVersion::V6, RecordSize::Bits24)
//!     .with_database_type("Example-Country");
//! writer.insert_str("203.0.113.0/24", DataValue::String("example".into()))?;
//!
//! let db = Database::from_bytes(writer.build()?)?;
//! assert!(db.lookup_ip("203.0.113.9".parse()?)?.is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod tree;

pub use tree::TreeBuilder;

use crate::data_section::{DataEncoder, DataValue};
use crate::mmdb::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR, METADATA_MARKER};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised while building a database
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriterError {
    /// Unparseable network or out-of-range prefix
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),
    /// Address family does not fit the tree
    #[error("Address family mismatch: {0}")]
    AddressFamily(String),
    /// Tree plus data section exceed what a record can address
    #[error("Database needs record values up to {needed}, too large for {bits}-bit records")]
    RecordOverflow {
        /// Record size in bits
        bits: u16,
        /// Largest record value required
        needed: u64,
    },
}

/// MMDB database writer
pub struct MmdbWriter {
    ip_version: IpVersion,
    record_size: RecordSize,
    database_type: Option<String>,
    description: HashMap<String, String>,
    entries: Vec<(IpNet, DataValue)>,
}

impl MmdbWriter {
    /// Create a writer for the given tree family and record size
    pub fn new(ip_version: IpVersion, record_size: RecordSize) -> Self {
        Self {
            ip_version,
            record_size,
            database_type: None,
            description: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Set the `database_type` metadata field
    ///
    /// Defaults to "MMDB-MCP-Custom".
    pub fn with_database_type(mut self, db_type: impl Into<String>) -> Self {
        self.database_type = Some(db_type.into());
        self
    }

    /// Add a description in a specific language
    pub fn with_description(
        mut self,
        language: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.description.insert(language.into(), text.into());
        self
    }

    /// Add a network. Later inserts win over earlier ones for the same
    /// prefix; more specific networks always win over less specific ones.
    pub fn insert(&mut self, network: IpNet, data: DataValue) -> Result<(), WriterError> {
        if network.addr().is_ipv6() && self.ip_version == IpVersion::V4 {
            return Err(WriterError::AddressFamily(format!(
                "IPv6 network {} in an IPv4 database",
                network
            )));
        }
        self.entries.push((network.trunc(), data));
        Ok(())
    }

    /// Add a network given as CIDR text or a bare address (host route)
    pub fn insert_str(&mut self, key: &str, data: DataValue) -> Result<(), WriterError> {
        let network = match key.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => key
                .parse::<IpAddr>()
                .map(IpNet::from)
                .map_err(|_| WriterError::InvalidNetwork(key.to_string()))?,
        };
        self.insert(network, data)
    }

    /// Number of networks added
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no networks were added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the database bytes
    pub fn build(&self) -> Result<Vec<u8>, WriterError> {
        let mut encoder = DataEncoder::new();
        let mut tree = TreeBuilder::new(self.ip_version, self.record_size);

        for (network, data) in &self.entries {
            let offset = encoder.encode(data);
            tree.insert(network.addr(), network.prefix_len(), offset)?;
        }

        let node_count = tree.node_count();
        let data_section = encoder.into_bytes();
        let tree_bytes = tree.build(data_section.len())?;

        let mut database = Vec::with_capacity(tree_bytes.len() + data_section.len() + 512);
        database.extend_from_slice(&tree_bytes);
        database.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR]);
        database.extend_from_slice(&data_section);
        database.extend_from_slice(METADATA_MARKER);

        let mut meta_encoder = DataEncoder::new();
        meta_encoder.encode(&self.metadata(node_count));
        database.extend_from_slice(&meta_encoder.into_bytes());

        Ok(database)
    }

    fn metadata(&self, node_count: u32) -> DataValue {
        let build_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let description: HashMap<String, DataValue> = if self.description.is_empty() {
            HashMap::from([(
                "en".to_string(),
                DataValue::String("Database built by mmdb-mcp".to_string()),
            )])
        } else {
            self.description
                .iter()
                .map(|(k, v)| (k.clone(), DataValue::String(v.clone())))
                .collect()
        };

        let mut languages: Vec<_> = description.keys().cloned().collect();
        languages.sort();

        let database_type = self
            .database_type
            .clone()
            .unwrap_or_else(|| "MMDB-MCP-Custom".to_string());

        DataValue::Map(HashMap::from([
            ("binary_format_major_version".to_string(), DataValue::Uint16(2)),
            ("binary_format_minor_version".to_string(), DataValue::Uint16(0)),
            ("build_epoch".to_string(), DataValue::Uint64(build_epoch)),
            ("database_type".to_string(), DataValue::String(database_type)),
            ("description".to_string(), DataValue::Map(description)),
            (
                "languages".to_string(),
                DataValue::Array(languages.into_iter().map(DataValue::String).collect()),
            ),
            (
                "ip_version".to_string(),
                DataValue::Uint16(self.ip_version.as_u16()),
            ),
            ("node_count".to_string(), DataValue::Uint32(node_count)),
            (
                "record_size".to_string(),
                DataValue::Uint16(self.record_size.bits()),
            ),
        ]))
    }
}
