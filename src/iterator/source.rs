//! Network traversal capability consumed by iterators

use crate::data_section::DataValue;
use crate::mmdb::MmdbError;
use ipnet::IpNet;

/// One network yielded by a walk, with a handle to its undecoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEntry {
    /// The sub-network
    pub network: IpNet,
    /// Opaque record handle (a data section offset for MMDB files)
    pub offset: u32,
}

/// Something that can walk the networks inside a CIDR block
///
/// Every call to [`networks_within`](NetworkSource::networks_within) starts
/// a fresh walk. For an unchanged dataset the order is stable: depth-first,
/// ascending by address.
pub trait NetworkSource: Send + Sync {
    /// Start a lazy walk over every network with data inside `network`
    #[allow(clippy::type_complexity)]
    fn networks_within(
        &self,
        network: IpNet,
    ) -> Result<Box<dyn Iterator<Item = Result<NetworkEntry, MmdbError>> + '_>, MmdbError>;

    /// Decode the record behind an entry
    fn decode(&self, entry: &NetworkEntry) -> Result<DataValue, MmdbError>;
}
