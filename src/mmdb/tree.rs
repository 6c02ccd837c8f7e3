//! MMDB Search Tree Traversal
//!
//! The tree is a binary trie over address bits. Each node holds two records
//! (left for bit 0, right for bit 1) that point to either:
//! - Another node (`record < node_count`)
//! - Nothing (`record == node_count`)
//! - The data section (`record > node_count`)
//!
//! IPv4 addresses in an IPv6 tree live under `::/96`.

use super::format::MmdbHeader;
use super::types::{IpVersion, MmdbError, RecordSize, DATA_SECTION_SEPARATOR};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Result of an IP lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    /// Offset into the data section (relative to data section start)
    pub data_offset: u32,
    /// Network prefix length (netmask) in the queried address family
    pub prefix_len: u8,
}

/// What a record points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Record {
    Node(u32),
    Empty,
    Data(u32),
}

/// Search tree for IP address lookups and network walks
#[derive(Clone, Copy)]
pub struct SearchTree<'a> {
    data: &'a [u8],
    header: &'a MmdbHeader,
}

impl<'a> SearchTree<'a> {
    /// Create a new search tree
    pub fn new(data: &'a [u8], header: &'a MmdbHeader) -> Self {
        Self { data, header }
    }

    /// Look up an IP address
    pub fn lookup(&self, ip: IpAddr) -> Result<Option<LookupResult>, MmdbError> {
        let (start, family_bits) = self.start_record(ip)?;
        let bits = ip_to_bits(ip);
        let (record, depth) = self.descend(start, bits, family_bits, family_bits)?;

        match self.classify(record)? {
            Record::Data(data_offset) => Ok(Some(LookupResult {
                data_offset,
                prefix_len: depth,
            })),
            Record::Empty => Ok(None),
            Record::Node(_) => Err(MmdbError::InvalidFormat(format!(
                "Search tree continues past {} bits",
                family_bits
            ))),
        }
    }

    /// Walk every network inside `network` that has data.
    ///
    /// Networks come out depth-first in ascending address order. If the
    /// queried network sits inside a larger block with data, that
    /// containing block is the only result.
    pub fn networks_within(&self, network: IpNet) -> Result<NetworkWalk<'a>, MmdbError> {
        let network = network.trunc();
        let (start, family_bits) = self.start_record(network.addr())?;
        let bits = ip_to_bits(network.addr());
        let (record, depth) = self.descend(start, bits, family_bits, network.prefix_len())?;

        let mut stack = Vec::with_capacity(family_bits as usize * 2);
        if self.classify(record)? != Record::Empty {
            stack.push(Pending {
                record,
                bits: mask_bits(bits, depth, family_bits),
                depth,
            });
        }

        Ok(NetworkWalk {
            tree: *self,
            stack,
            family_bits,
        })
    }

    /// Record to start from for an address, plus the family's bit width
    fn start_record(&self, ip: IpAddr) -> Result<(u32, u8), MmdbError> {
        match (ip, self.header.ip_version) {
            (IpAddr::V4(_), IpVersion::V4) => Ok((0, 32)),
            (IpAddr::V4(_), IpVersion::V6) => Ok((self.ipv4_start()?, 32)),
            (IpAddr::V6(_), IpVersion::V6) => Ok((0, 128)),
            (IpAddr::V6(addr), IpVersion::V4) => Err(MmdbError::InvalidIpAddress(format!(
                "IPv6 address {} used with an IPv4-only database",
                addr
            ))),
        }
    }

    /// Follow 96 zero bits from the root to the IPv4 subtree
    fn ipv4_start(&self) -> Result<u32, MmdbError> {
        let (record, _) = self.descend(0, 0, 128, 96)?;
        Ok(record)
    }

    /// Follow `limit` bits of `bits` from `record`, stopping early at data or
    /// an empty record. Returns the record reached and the bits consumed.
    fn descend(
        &self,
        mut record: u32,
        bits: u128,
        family_bits: u8,
        limit: u8,
    ) -> Result<(u32, u8), MmdbError> {
        let mut depth = 0u8;
        while depth < limit {
            let node = match self.classify(record)? {
                Record::Node(node) => node,
                _ => break,
            };
            let bit = ((bits >> (family_bits - 1 - depth)) & 1) as u8;
            record = self.read_record(node, bit)?;
            depth += 1;
        }
        Ok((record, depth))
    }

    fn classify(&self, record: u32) -> Result<Record, MmdbError> {
        let node_count = self.header.node_count;
        if record < node_count {
            Ok(Record::Node(record))
        } else if record == node_count {
            Ok(Record::Empty)
        } else {
            self.calculate_data_offset(record).map(Record::Data)
        }
    }

    /// Read a record from a node
    ///
    /// Each node contains two records. `side` determines which:
    /// - 0 = left record (for IP bit 0)
    /// - 1 = right record (for IP bit 1)
    fn read_record(&self, node: u32, side: u8) -> Result<u32, MmdbError> {
        if node >= self.header.node_count {
            return Err(MmdbError::InvalidFormat(format!(
                "Node index {} exceeds node count {}",
                node, self.header.node_count
            )));
        }

        let node_bytes = self.header.record_size.node_bytes();
        let offset = node as usize * node_bytes;
        if offset + node_bytes > self.header.tree_size || offset + node_bytes > self.data.len() {
            return Err(MmdbError::InvalidFormat(format!(
                "Node offset {} exceeds tree size {}",
                offset, self.header.tree_size
            )));
        }
        let b = &self.data[offset..offset + node_bytes];

        Ok(match (self.header.record_size, side) {
            (RecordSize::Bits24, 0) => be_u32(&b[0..3]),
            (RecordSize::Bits24, _) => be_u32(&b[3..6]),
            // Middle byte carries the high nibble of both records
            (RecordSize::Bits28, 0) => (((b[3] >> 4) as u32) << 24) | be_u32(&b[0..3]),
            (RecordSize::Bits28, _) => (((b[3] & 0x0F) as u32) << 24) | be_u32(&b[4..7]),
            (RecordSize::Bits32, 0) => be_u32(&b[0..4]),
            (RecordSize::Bits32, _) => be_u32(&b[4..8]),
        })
    }

    /// data_offset = (record_value - node_count) - 16
    fn calculate_data_offset(&self, record: u32) -> Result<u32, MmdbError> {
        (record - self.header.node_count)
            .checked_sub(DATA_SECTION_SEPARATOR as u32)
            .ok_or_else(|| {
                MmdbError::InvalidFormat(format!(
                    "Record {} points into the data section separator (node_count = {})",
                    record, self.header.node_count
                ))
            })
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    record: u32,
    bits: u128,
    depth: u8,
}

/// Lazy depth-first walk over the networks below a prefix
///
/// Yields `(network, data_offset)` pairs. A corrupt tree produces one error
/// and ends the walk.
pub struct NetworkWalk<'a> {
    tree: SearchTree<'a>,
    stack: Vec<Pending>,
    family_bits: u8,
}

impl NetworkWalk<'_> {
    fn fail(&mut self, err: MmdbError) -> Option<Result<(IpNet, u32), MmdbError>> {
        self.stack.clear();
        Some(Err(err))
    }

    fn to_network(&self, bits: u128, depth: u8) -> Result<IpNet, MmdbError> {
        let net = if self.family_bits == 32 {
            Ipv4Net::new(Ipv4Addr::from(bits as u32), depth).map(IpNet::V4)
        } else {
            Ipv6Net::new(Ipv6Addr::from(bits), depth).map(IpNet::V6)
        };
        net.map_err(|e| MmdbError::InvalidFormat(e.to_string()))
    }
}

impl Iterator for NetworkWalk<'_> {
    type Item = Result<(IpNet, u32), MmdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(pending) = self.stack.pop() {
            let node = match self.tree.classify(pending.record) {
                Ok(Record::Node(node)) => node,
                Ok(Record::Empty) => continue,
                Ok(Record::Data(offset)) => {
                    return Some(
                        self.to_network(pending.bits, pending.depth)
                            .map(|net| (net, offset)),
                    )
                }
                Err(e) => return self.fail(e),
            };

            if pending.depth >= self.family_bits {
                return self.fail(MmdbError::InvalidFormat(format!(
                    "Search tree continues past {} bits",
                    self.family_bits
                )));
            }

            let (left, right) = match (
                self.tree.read_record(node, 0),
                self.tree.read_record(node, 1),
            ) {
                (Ok(left), Ok(right)) => (left, right),
                (Err(e), _) | (_, Err(e)) => return self.fail(e),
            };

            let one = 1u128 << (self.family_bits - 1 - pending.depth);
            self.stack.push(Pending {
                record: right,
                bits: pending.bits | one,
                depth: pending.depth + 1,
            });
            self.stack.push(Pending {
                record: left,
                bits: pending.bits,
                depth: pending.depth + 1,
            });
        }
        None
    }
}

/// Address as an integer in its own family's width
fn ip_to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(addr) => u32::from(addr) as u128,
        IpAddr::V6(addr) => u128::from(addr),
    }
}

/// Keep the top `depth` bits of a `family_bits`-wide address
fn mask_bits(bits: u128, depth: u8, family_bits: u8) -> u128 {
    if depth == 0 {
        0
    } else {
        bits & (!0u128 << (family_bits - depth))
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}
