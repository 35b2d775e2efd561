//! Fixed-size on-disk codec for a `Node`, with a CRC32 trailer and an
//! optional embedded `TreeHead`.

use core::convert::TryInto;

use super::node::{NodeAddress, NodeRef, CHILDREN, ORDER_M, ORDER_N};
use super::{INodeKey, Node, TreeHead};
use crate::crc;

const KEYS_BYTES: usize = ORDER_N * 8;
const SLOT_BYTES: usize = CHILDREN * 8;

/// Bytes needed to serialize a node with no embedded head: tag + count +
/// keys + value/child slots + CRC.
pub const HEAD_NODE_SIZE_BASE: usize = 1 + 1 + KEYS_BYTES + SLOT_BYTES + 4;
/// Bytes needed when a `TreeHead` is embedded as well.
pub const HEAD_NODE_SIZE_WITH_HEAD: usize = HEAD_NODE_SIZE_BASE + 4;

pub struct NodeSerializer;

impl NodeSerializer {
    pub fn size(has_head: bool) -> usize {
        if has_head {
            HEAD_NODE_SIZE_WITH_HEAD
        } else {
            HEAD_NODE_SIZE_BASE
        }
    }

    /// Encode `node` (and `head`, if given) into `buf`, returning the
    /// number of bytes written.
    pub fn serialize<A: NodeAddress>(node: &Node<A>, head: Option<TreeHead>, buf: &mut [u8]) -> usize {
        let size = Self::size(head.is_some());
        debug_assert!(buf.len() >= size);

        buf[0] = node.depth as u8;
        buf[1] = node.number_keys as u8;
        let mut off = 2;
        for i in 0..ORDER_N {
            let k = if i < node.number_keys { node.keys[i].raw() } else { 0 };
            buf[off..off + 8].copy_from_slice(&k.to_le_bytes());
            off += 8;
        }

        if node.is_leaf() {
            for i in 0..CHILDREN {
                let v = if i < ORDER_M && i < node.number_keys {
                    node.values[i]
                } else {
                    0
                };
                buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
                off += 8;
            }
        } else {
            for i in 0..CHILDREN {
                let v = if i <= node.number_keys {
                    node.children[i].address.to_u64()
                } else {
                    0
                };
                buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
                off += 8;
            }
        }

        if let Some(head) = head {
            buf[off..off + 4].copy_from_slice(&head.timestamp.to_le_bytes());
            off += 4;
        }

        let checksum = crc::checksum(&buf[0..off]);
        buf[off..off + 4].copy_from_slice(&checksum.to_le_bytes());
        off += 4;
        off
    }

    /// Decode a node (and head, if `want_head`) from `buf`. Returns `None`
    /// on a CRC or magic mismatch — a legitimate "nothing written here
    /// yet" condition, not necessarily corruption.
    pub fn deserialize<A: NodeAddress>(
        buf: &[u8],
        want_head: bool,
    ) -> Option<(Node<A>, Option<TreeHead>)> {
        let size = Self::size(want_head);
        if buf.len() < size {
            return None;
        }
        let stored = u32::from_le_bytes(buf[size - 4..size].try_into().unwrap());
        let computed = crc::checksum(&buf[0..size - 4]);
        if stored != computed {
            return None;
        }

        let depth = buf[0] as u32;
        let number_keys = buf[1] as usize;
        if number_keys > ORDER_N {
            return None;
        }

        let mut off = 2;
        let mut keys = [INodeKey::default(); ORDER_N];
        for slot in keys.iter_mut() {
            let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            *slot = INodeKey::from_raw(v);
            off += 8;
        }

        let mut values = [0u64; ORDER_M];
        let mut children = [NodeRef::invalid(); CHILDREN];
        if depth == 0 {
            for i in 0..CHILDREN {
                let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                if i < ORDER_M {
                    values[i] = v;
                }
                off += 8;
            }
        } else {
            for slot in children.iter_mut() {
                let v = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                *slot = NodeRef::on_disk(A::from_u64(v));
                off += 8;
            }
        }

        let head = if want_head {
            let ts = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            Some(TreeHead { timestamp: ts })
        } else {
            None
        };
        let _ = off;

        Some((
            Node {
                depth,
                number_keys,
                keys,
                values,
                children,
            },
            head,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockAddress;

    #[test]
    fn leaf_round_trips_without_head() {
        let mut node: Node<BlockAddress> = Node::empty_leaf();
        node.number_keys = 2;
        node.keys[0] = INodeKey::new(1, 10);
        node.keys[1] = INodeKey::new(1, 20);
        node.values[0] = 111;
        node.values[1] = 222;

        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        let written = NodeSerializer::serialize(&node, None, &mut buf);
        assert_eq!(written, HEAD_NODE_SIZE_BASE);

        let (decoded, head) = NodeSerializer::deserialize::<BlockAddress>(&buf[..written], false).unwrap();
        assert!(head.is_none());
        assert_eq!(decoded.number_keys, 2);
        assert_eq!(decoded.keys[0], INodeKey::new(1, 10));
        assert_eq!(decoded.values[1], 222);
    }

    #[test]
    fn inner_round_trips_with_head() {
        let mut node: Node<BlockAddress> = Node::empty_inner(1);
        node.number_keys = 1;
        node.keys[0] = INodeKey::new(2, 5);
        node.children[0] = NodeRef::on_disk(BlockAddress::new(3, 512));
        node.children[1] = NodeRef::on_disk(BlockAddress::new(4, 1024));

        let head = TreeHead { timestamp: 42 };
        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        let written = NodeSerializer::serialize(&node, Some(head), &mut buf);
        assert_eq!(written, HEAD_NODE_SIZE_WITH_HEAD);

        let (decoded, decoded_head) =
            NodeSerializer::deserialize::<BlockAddress>(&buf[..written], true).unwrap();
        assert_eq!(decoded_head, Some(head));
        assert_eq!(decoded.children[0].address, BlockAddress::new(3, 512));
        assert_eq!(decoded.children[1].address, BlockAddress::new(4, 1024));
    }

    #[test]
    fn corrupted_buffer_is_rejected() {
        let node: Node<BlockAddress> = Node::empty_leaf();
        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        let written = NodeSerializer::serialize(&node, None, &mut buf);
        buf[0] ^= 0xff;
        assert!(NodeSerializer::deserialize::<BlockAddress>(&buf[..written], false).is_none());
    }
}
