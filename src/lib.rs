#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod allocator;
pub mod backend;
pub mod block;
pub mod crc;
pub mod error;
pub mod geometry;
pub mod superblock;
pub mod tree;

pub use allocator::{BlockAllocator, ReusableBlockAllocator};
pub use backend::{RamBackend, StorageBackend};
#[cfg(feature = "std")]
pub use backend::file::FileBackend;
pub use block::{BlockAddress, BlockHead, BlockType};
pub use error::Error;
pub use geometry::Geometry;
pub use superblock::SuperBlockManager;
pub use tree::{INodeKey, PersistedTree};
