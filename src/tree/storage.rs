//! Where serialized nodes actually live: an append-only sink into
//! `BlockType::Tree` blocks on a real backend, or a flat in-memory arena
//! for tests that want a tree without wiring up a backend and allocator.

use alloc::vec::Vec;

use super::node::{Node, NodeAddress};
use super::serializer::{NodeSerializer, HEAD_NODE_SIZE_WITH_HEAD};
use super::TreeHead;
use crate::allocator::BlockAllocator;
use crate::backend::StorageBackend;
use crate::block::{BlockAddress, BlockHead, BlockType};
use crate::geometry::Geometry;

/// Capability needed to persist and recover tree nodes. Two
/// implementations share this trait: one backed by a real `StorageBackend`,
/// one a plain in-memory arena for unit tests.
pub trait NodeStorage<A: NodeAddress> {
    /// Append `node` (and `head`, if this is the new root) and return the
    /// address it landed at. The node's own previous address, if any, is
    /// irrelevant — identity is the address returned here.
    fn serialize(&mut self, node: &Node<A>, head: Option<TreeHead>) -> Option<A>;

    fn deserialize(&mut self, address: A, want_head: bool) -> Option<(Node<A>, Option<TreeHead>)>;
}

/// Appends serialized nodes into `BlockType::Tree` blocks drawn from a
/// `BlockAllocator`, allocating a fresh block whenever the current one has
/// no room for the next node.
pub struct StorageBackendNodeStorage<'a> {
    backend: &'a mut dyn StorageBackend,
    allocator: &'a mut BlockAllocator,
    location: BlockAddress,
}

impl<'a> StorageBackendNodeStorage<'a> {
    pub fn new(
        backend: &'a mut dyn StorageBackend,
        allocator: &'a mut BlockAllocator,
    ) -> StorageBackendNodeStorage<'a> {
        StorageBackendNodeStorage {
            backend,
            allocator,
            location: BlockAddress::invalid(),
        }
    }

    /// Resume appending at a location recovered from a super-block (or
    /// from `find_head`), rather than starting a fresh block.
    pub fn resume_at(
        backend: &'a mut dyn StorageBackend,
        allocator: &'a mut BlockAllocator,
        location: BlockAddress,
    ) -> StorageBackendNodeStorage<'a> {
        StorageBackendNodeStorage {
            backend,
            allocator,
            location,
        }
    }

    pub fn location(&self) -> BlockAddress {
        self.location
    }

    fn geometry(&self) -> Geometry {
        self.backend.geometry()
    }

    fn allocate_block(&mut self) -> Option<BlockAddress> {
        let rec = self.allocator.allocate(BlockType::Tree);
        if !rec.is_valid() {
            return None;
        }
        if !self.backend.erase(rec.block) {
            return None;
        }
        let mut head = [0u8; BlockHead::SIZE];
        BlockHead::new(BlockType::Tree, rec.age).write_to(&mut head);
        if !self.backend.write(rec.block, 0, &head) {
            return None;
        }
        Some(BlockAddress::new(rec.block, self.geometry().sector_size))
    }

    /// Recover the current root address on cold boot by walking `block`
    /// sector by sector (skipping the header sector) and returning the
    /// last address that decoded successfully.
    pub fn find_head(&mut self, block: u32, want_head: bool) -> Option<BlockAddress> {
        let geometry = self.geometry();
        let size = NodeSerializer::size(want_head);
        let mut addr = BlockAddress::new(block, geometry.sector_size);
        let mut last_good = None;
        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        loop {
            let room = match addr.find_room(size as u32, &geometry) {
                Some(a) => a,
                None => break,
            };
            if !self.backend.read(room.block, room.offset, &mut buf[..size]) {
                break;
            }
            if NodeSerializer::deserialize::<BlockAddress>(&buf[..size], want_head).is_none() {
                break;
            }
            last_good = Some(room);
            addr = match room.add(size as u32, &geometry) {
                Some(a) => a,
                None => break,
            };
        }
        last_good
    }
}

impl<'a> NodeStorage<BlockAddress> for StorageBackendNodeStorage<'a> {
    fn serialize(&mut self, node: &Node<BlockAddress>, head: Option<TreeHead>) -> Option<BlockAddress> {
        let required = NodeSerializer::size(head.is_some()) as u32;
        let geometry = self.geometry();

        let target = if self.location.is_valid() {
            match self.location.find_room(required, &geometry) {
                Some(t) => t,
                None => self.allocate_block()?,
            }
        } else {
            self.allocate_block()?
        };

        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        let written = NodeSerializer::serialize(node, head, &mut buf);
        if !self.backend.write(target.block, target.offset, &buf[..written]) {
            return None;
        }
        self.location = target.add(written as u32, &geometry)?;
        Some(target)
    }

    fn deserialize(
        &mut self,
        address: BlockAddress,
        want_head: bool,
    ) -> Option<(Node<BlockAddress>, Option<TreeHead>)> {
        let size = NodeSerializer::size(want_head);
        let mut buf = [0u8; HEAD_NODE_SIZE_WITH_HEAD];
        if !self.backend.read(address.block, address.offset, &mut buf[..size]) {
            return None;
        }
        NodeSerializer::deserialize(&buf[..size], want_head)
    }
}

/// Address into `InMemoryNodeStorage`'s flat arena: a simple offset, with
/// `u64::MAX` reserved as "invalid".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaAddress(u64);

impl NodeAddress for ArenaAddress {
    fn invalid() -> Self {
        ArenaAddress(u64::MAX)
    }
    fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
    fn to_u64(&self) -> u64 {
        self.0
    }
    fn from_u64(v: u64) -> Self {
        ArenaAddress(v)
    }
}

/// A `NodeStorage` that never touches a `StorageBackend` at all: every
/// serialized node is appended to a growable byte arena. Exists purely so
/// `PersistedTree`'s algorithms can be exercised without a real device,
/// the way the original system's test suite exercised the tree in
/// isolation from the block layer.
#[derive(Default)]
pub struct InMemoryNodeStorage {
    arena: Vec<u8>,
}

impl InMemoryNodeStorage {
    pub fn new() -> InMemoryNodeStorage {
        InMemoryNodeStorage { arena: Vec::new() }
    }
}

impl NodeStorage<ArenaAddress> for InMemoryNodeStorage {
    fn serialize(&mut self, node: &Node<ArenaAddress>, head: Option<TreeHead>) -> Option<ArenaAddress> {
        let size = NodeSerializer::size(head.is_some());
        let at = self.arena.len();
        self.arena.resize(at + size, 0);
        let written = NodeSerializer::serialize(node, head, &mut self.arena[at..at + size]);
        debug_assert_eq!(written, size);
        Some(ArenaAddress(at as u64))
    }

    fn deserialize(
        &mut self,
        address: ArenaAddress,
        want_head: bool,
    ) -> Option<(Node<ArenaAddress>, Option<TreeHead>)> {
        let at = address.0 as usize;
        let size = NodeSerializer::size(want_head);
        if at + size > self.arena.len() {
            return None;
        }
        NodeSerializer::deserialize(&self.arena[at..at + size], want_head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RamBackend;

    #[test]
    fn backend_storage_allocates_blocks_as_needed() {
        let geometry = Geometry::new(16, 2, 2, 512).unwrap();
        let mut backend = RamBackend::new(geometry);
        let mut allocator = BlockAllocator::new(geometry);
        let mut storage = StorageBackendNodeStorage::new(&mut backend, &mut allocator);

        let node: Node<BlockAddress> = Node::empty_leaf();
        let a1 = storage.serialize(&node, None).unwrap();
        let a2 = storage.serialize(&node, None).unwrap();
        assert_eq!(a1.block, a2.block);
        assert_ne!(a1.offset, a2.offset);

        let (decoded, head) = storage.deserialize(a1, false).unwrap();
        assert!(head.is_none());
        assert_eq!(decoded.number_keys, 0);
    }

    #[test]
    fn in_memory_storage_round_trips() {
        let mut storage = InMemoryNodeStorage::new();
        let mut node: Node<ArenaAddress> = Node::empty_leaf();
        node.number_keys = 1;
        node.keys[0] = super::super::INodeKey::new(1, 1);
        node.values[0] = 99;

        let addr = storage.serialize(&node, Some(TreeHead { timestamp: 1 })).unwrap();
        let (decoded, head) = storage.deserialize(addr, true).unwrap();
        assert_eq!(head, Some(TreeHead { timestamp: 1 }));
        assert_eq!(decoded.values[0], 99);
    }
}
