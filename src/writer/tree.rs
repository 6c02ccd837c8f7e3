//! Search tree builder for the MMDB format
//!
//! Nodes live in an arena and are serialized in allocation order, so the
//! root is always node 0. Addresses are handled as 128-bit values aligned to
//! the top bit; IPv4 trees only ever use the first 32 levels.

use super::WriterError;
use crate::mmdb::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR};
use std::net::IpAddr;

/// IP tree builder using arena allocation
pub struct TreeBuilder {
    record_size: RecordSize,
    nodes: Vec<Node>,
    ip_version: IpVersion,
}

#[derive(Debug, Clone)]
struct Node {
    left: NodePointer,
    right: NodePointer,
}

/// Where a record points while the tree is being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    Node(u32),
    /// Data offset plus the prefix length that produced it. The prefix
    /// length decides which insert wins when networks overlap and is
    /// dropped on serialization.
    Data(u32, u8),
    Empty,
}

impl TreeBuilder {
    /// Create a builder for the given address family
    pub fn new(ip_version: IpVersion, record_size: RecordSize) -> Self {
        Self {
            record_size,
            nodes: vec![Node::new_empty()],
            ip_version,
        }
    }

    /// Number of nodes allocated so far
    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Insert a network with its data section offset
    pub fn insert(
        &mut self,
        addr: IpAddr,
        prefix_len: u8,
        data_offset: u32,
    ) -> Result<(), WriterError> {
        let (bits, depth) = match (addr, self.ip_version) {
            (IpAddr::V4(v4), IpVersion::V4) => {
                check_prefix(prefix_len, 32)?;
                ((u32::from(v4) as u128) << 96, prefix_len)
            }
            // IPv4 goes under ::/96 in an IPv6 tree
            (IpAddr::V4(v4), IpVersion::V6) => {
                check_prefix(prefix_len, 32)?;
                (u32::from(v4) as u128, 96 + prefix_len)
            }
            (IpAddr::V6(v6), IpVersion::V6) => {
                check_prefix(prefix_len, 128)?;
                (u128::from(v6), prefix_len)
            }
            (IpAddr::V6(v6), IpVersion::V4) => {
                return Err(WriterError::AddressFamily(format!(
                    "cannot insert IPv6 network {}/{} into an IPv4 tree",
                    v6, prefix_len
                )))
            }
        };

        self.insert_bits(bits, depth, data_offset);
        Ok(())
    }

    fn insert_bits(&mut self, bits: u128, prefix_len: u8, data_offset: u32) {
        let data = NodePointer::Data(data_offset, prefix_len);

        if prefix_len == 0 {
            // The whole address space: every empty or less specific record
            // below the root takes this data
            self.backfill_less_specific(0, data_offset, 0);
            return;
        }

        let mut node_id = 0u32;
        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as u8;
            let child = self.child(node_id, bit);

            if depth + 1 == prefix_len {
                match child {
                    NodePointer::Empty => self.set_child(node_id, bit, data),
                    NodePointer::Data(_, existing_prefix) => {
                        if prefix_len >= existing_prefix {
                            self.set_child(node_id, bit, data);
                        }
                    }
                    // More specific networks already exist below this edge;
                    // fill the gaps around them
                    NodePointer::Node(child_id) => {
                        self.backfill_less_specific(child_id, data_offset, prefix_len)
                    }
                }
                return;
            }

            node_id = match child {
                NodePointer::Node(child_id) => child_id,
                NodePointer::Empty => {
                    let new_id = self.allocate_node();
                    self.set_child(node_id, bit, NodePointer::Node(new_id));
                    new_id
                }
                NodePointer::Data(existing_offset, existing_prefix) => {
                    // Split a less specific block so the new network can
                    // sit below it
                    let new_id = self.allocate_node();
                    let existing = NodePointer::Data(existing_offset, existing_prefix);
                    self.nodes[new_id as usize].left = existing;
                    self.nodes[new_id as usize].right = existing;
                    self.set_child(node_id, bit, NodePointer::Node(new_id));
                    new_id
                }
            };
        }
    }

    fn child(&self, node_id: u32, bit: u8) -> NodePointer {
        let node = &self.nodes[node_id as usize];
        if bit == 0 {
            node.left
        } else {
            node.right
        }
    }

    fn set_child(&mut self, node_id: u32, bit: u8, pointer: NodePointer) {
        let node = &mut self.nodes[node_id as usize];
        if bit == 0 {
            node.left = pointer;
        } else {
            node.right = pointer;
        }
    }

    fn allocate_node(&mut self) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node::new_empty());
        id
    }

    /// Point every empty or less specific record under `node_id` at the
    /// given data, leaving more specific data alone.
    fn backfill_less_specific(&mut self, node_id: u32, data_offset: u32, prefix_len: u8) {
        for bit in [0u8, 1] {
            match self.child(node_id, bit) {
                NodePointer::Empty => {
                    self.set_child(node_id, bit, NodePointer::Data(data_offset, prefix_len))
                }
                NodePointer::Data(_, existing_prefix) => {
                    if prefix_len > existing_prefix {
                        self.set_child(node_id, bit, NodePointer::Data(data_offset, prefix_len));
                    }
                }
                NodePointer::Node(child_id) => {
                    self.backfill_less_specific(child_id, data_offset, prefix_len)
                }
            }
        }
    }

    /// Serialize the tree
    ///
    /// `data_size` is the length of the data section, used to check that
    /// every data pointer fits in a record.
    pub fn build(&self, data_size: usize) -> Result<Vec<u8>, WriterError> {
        let node_count = self.node_count();
        let largest = node_count as u64 + DATA_SECTION_SEPARATOR as u64 + data_size as u64;
        if largest > self.record_size.max_value() as u64 {
            return Err(WriterError::RecordOverflow {
                bits: self.record_size.bits(),
                needed: largest,
            });
        }

        let node_bytes = self.record_size.node_bytes();
        let mut tree = vec![0u8; self.nodes.len() * node_bytes];

        for (node_id, node) in self.nodes.iter().enumerate() {
            let left = pointer_to_value(node.left, node_count);
            let right = pointer_to_value(node.right, node_count);
            let out = &mut tree[node_id * node_bytes..(node_id + 1) * node_bytes];

            match self.record_size {
                RecordSize::Bits24 => {
                    out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                    out[3..6].copy_from_slice(&right.to_be_bytes()[1..]);
                }
                RecordSize::Bits28 => {
                    out[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
                    out[3] = (((left >> 24) & 0x0F) as u8) << 4 | ((right >> 24) & 0x0F) as u8;
                    out[4..7].copy_from_slice(&right.to_be_bytes()[1..]);
                }
                RecordSize::Bits32 => {
                    out[0..4].copy_from_slice(&left.to_be_bytes());
                    out[4..8].copy_from_slice(&right.to_be_bytes());
                }
            }
        }

        Ok(tree)
    }
}

impl Node {
    fn new_empty() -> Self {
        Self {
            left: NodePointer::Empty,
            right: NodePointer::Empty,
        }
    }
}

/// Record value on disk; range was checked in `build`
fn pointer_to_value(pointer: NodePointer, node_count: u32) -> u32 {
    match pointer {
        NodePointer::Empty => node_count,
        NodePointer::Node(id) => id,
        NodePointer::Data(offset, _) => node_count + DATA_SECTION_SEPARATOR as u32 + offset,
    }
}

fn check_prefix(prefix_len: u8, max: u8) -> Result<(), WriterError> {
    if prefix_len > max {
        return Err(WriterError::InvalidNetwork(format!(
            "prefix length {} exceeds {}",
            prefix_len, max
        )));
    }
    Ok(())
}
