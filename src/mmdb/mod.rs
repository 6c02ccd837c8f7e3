//! MaxMind DB (MMDB) Reader
//!
//! The MMDB format stores a binary search tree over address bits followed by
//! a data section and a metadata map. This module parses the header, walks
//! the tree for point lookups and network scans, and leaves value decoding to
//! `crate::data_section::DataDecoder`.
//!
//! ## Architecture
//!
//! - **types**: MMDB-specific types and constants
//! - **format**: header and metadata extraction
//! - **tree**: search tree traversal

pub mod format;
pub mod tree;
pub mod types;

pub use format::{find_metadata_marker, MmdbHeader, MmdbMetadata};
pub use tree::{LookupResult, NetworkWalk, SearchTree};
pub use types::{IpVersion, MmdbError, RecordSize, METADATA_MARKER};
