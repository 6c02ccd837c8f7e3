//! mmdb-mcp - MaxMind DB lookups and network scans for MCP clients
//!
//! mmdb-mcp serves MaxMind DB (`.mmdb`) files to AI assistants over the Model
//! Context Protocol. Besides single-address lookups it can scan every network
//! inside a CIDR block, filter the records with simple predicates and hand
//! the results out in pages that can be resumed after the server restarts.
//!
//! # Quick Start
//!
//! ```rust
//! use mmdb_mcp::filter::{FilterMode, Operator, Predicate};
//! use mmdb_mcp::iterator::IteratorManager;
//! use mmdb_mcp::mmdb::{IpVersion, RecordSize};
//! use mmdb_mcp::writer::MmdbWriter;
//! use mmdb_mcp::{Database, DataValue};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let country = |code: &str| {
//!     let mut inner = HashMap::new();
//!     inner.insert("iso_code".to_string(), DataValue::String(code.to_string()));
//!     let mut record = HashMap::new();
//!     record.insert("country".to_string(), DataValue::Map(inner));
//!     DataValue::Map(record)
//! };
//!
//! let mut writer = MmdbWriter::new(IpVersion::V4, RecordSize::Bits24);
//! writer.insert_str("1.0.0.0/25", country("US"))?;
//! writer.insert_str("1.0.0.128/25", country("CA"))?;
//! let db = Arc::new(Database::from_bytes(writer.build()?)?);
//!
//! let iterators = IteratorManager::new(Duration::from_secs(600));
//! let scan = iterators.create(
//!     db,
//!     "example",
//!     "1.0.0.0/24".parse()?,
//!     vec![Predicate::new("country.iso_code", Operator::Equals, "US".into())],
//!     FilterMode::All,
//! )?;
//!
//! let batch = iterators.advance(&scan, 100)?;
//! assert_eq!(batch.results.len(), 1);
//! assert_eq!(batch.total_processed, 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Layout
//!
//! ```text
//! mcp          JSON-RPC stdio server and tool dispatch
//!  ├─ database   loaded files, hot reload (DatabaseManager)
//!  ├─ iterator   resumable filtered scans (IteratorManager)
//!  │   └─ filter predicate evaluation
//!  └─ updater    mirror refresh on a schedule
//! mmdb / data_section / writer   MMDB format read and write
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// TOML configuration
pub mod config;
/// MMDB data section encoding and decoding
pub mod data_section;
/// Opened databases and the lifecycle manager
pub mod database;
/// Record predicates
pub mod filter;
/// Resumable network scans
pub mod iterator;
/// MCP stdio front-end
pub mod mcp;
/// MMDB format reader
pub mod mmdb;
/// Interval-driven background threads
pub mod periodic;
/// Database refresh from a mirror
pub mod updater;
/// MMDB file writer
pub mod writer;

pub use crate::config::{Config, ConfigError};
pub use crate::data_section::DataValue;
pub use crate::database::{Database, DatabaseError, DatabaseInfo, DatabaseManager, IpLookup};
pub use crate::filter::{FilterEngine, FilterError, FilterMode, Operator, Predicate};
pub use crate::iterator::{Batch, IteratorError, IteratorManager, ResumeToken};
pub use crate::mcp::{McpError, McpServer};
pub use crate::updater::{MirrorSource, UpdateError, Updater};
pub use crate::writer::{MmdbWriter, WriterError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
