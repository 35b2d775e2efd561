//! The `StorageBackend` capability the core consumes: sector-granular
//! read/write, block-granular erase, and a fixed `Geometry`. This plays the
//! role the ancestor crate's `Volume` trait played for its sector-addressed
//! reader, generalized from "read-only ext2 image" to "erase-then-write
//! flash device".

use crate::geometry::Geometry;

/// A byte-addressable backing store shaped by a fixed `Geometry`.
///
/// Implementors are not required to actually enforce erase-before-write
/// semantics (the in-memory test backend does not), but real flash/SD
/// backends will silently corrupt data written to a sector that has not
/// been erased since its last write. The allocator is the component
/// responsible for only ever handing out blocks that have been, or are
/// about to be, erased.
pub trait StorageBackend {
    fn geometry(&self) -> Geometry;

    /// Erase every byte of `block` to the backend's erased value.
    fn erase(&mut self, block: u32) -> bool;

    /// Read `dst.len()` bytes from `block` starting at `offset`.
    fn read(&mut self, block: u32, offset: u32, dst: &mut [u8]) -> bool;

    /// Write `src` to `block` starting at `offset`.
    fn write(&mut self, block: u32, offset: u32, src: &[u8]) -> bool;
}

/// Byte value an erased flash cell reads back as.
pub const ERASED_BYTE: u8 = 0xFF;

/// An in-memory `StorageBackend`, for tests and for hosts that genuinely
/// keep everything in RAM. Never rejects a write to an unerased sector —
/// callers relying on that distinction should test against `FileBackend`
/// or real hardware instead.
pub struct RamBackend {
    geometry: Geometry,
    data: alloc::vec::Vec<u8>,
}

impl RamBackend {
    pub fn new(geometry: Geometry) -> RamBackend {
        let size = geometry.number_of_blocks as usize * geometry.block_size() as usize;
        RamBackend {
            geometry,
            data: alloc::vec![ERASED_BYTE; size],
        }
    }

    fn offset_of(&self, block: u32, offset: u32) -> usize {
        block as usize * self.geometry.block_size() as usize + offset as usize
    }
}

impl StorageBackend for RamBackend {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn erase(&mut self, block: u32) -> bool {
        if block >= self.geometry.number_of_blocks {
            return false;
        }
        let start = self.offset_of(block, 0);
        let end = start + self.geometry.block_size() as usize;
        for b in &mut self.data[start..end] {
            *b = ERASED_BYTE;
        }
        true
    }

    fn read(&mut self, block: u32, offset: u32, dst: &mut [u8]) -> bool {
        if block >= self.geometry.number_of_blocks
            || offset + dst.len() as u32 > self.geometry.block_size()
        {
            return false;
        }
        let start = self.offset_of(block, offset);
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        true
    }

    fn write(&mut self, block: u32, offset: u32, src: &[u8]) -> bool {
        if block >= self.geometry.number_of_blocks
            || offset + src.len() as u32 > self.geometry.block_size()
        {
            return false;
        }
        let start = self.offset_of(block, offset);
        self.data[start..start + src.len()].copy_from_slice(src);
        true
    }
}

#[cfg(feature = "std")]
pub mod file {
    //! A `File`-backed `StorageBackend`, the way the ancestor crate's
    //! `Volume` impl for `RefCell<File>` backed an ext2 image from disk.

    use std::cell::RefCell;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::StorageBackend;
    use crate::geometry::Geometry;

    pub struct FileBackend {
        geometry: Geometry,
        file: RefCell<File>,
    }

    impl FileBackend {
        pub fn new(geometry: Geometry, file: File) -> FileBackend {
            FileBackend {
                geometry,
                file: RefCell::new(file),
            }
        }

        fn byte_offset(&self, block: u32, offset: u32) -> u64 {
            block as u64 * self.geometry.block_size() as u64 + offset as u64
        }
    }

    impl StorageBackend for FileBackend {
        fn geometry(&self) -> Geometry {
            self.geometry
        }

        fn erase(&mut self, block: u32) -> bool {
            let zeros = alloc::vec![super::ERASED_BYTE; self.geometry.block_size() as usize];
            self.write(block, 0, &zeros)
        }

        fn read(&mut self, block: u32, offset: u32, dst: &mut [u8]) -> bool {
            let pos = self.byte_offset(block, offset);
            let mut file = self.file.borrow_mut();
            let ok = file.seek(SeekFrom::Start(pos)).is_ok() && file.read_exact(dst).is_ok();
            if !ok {
                log::warn!("file backend read failed at block {} offset {}", block, offset);
            }
            ok
        }

        fn write(&mut self, block: u32, offset: u32, src: &[u8]) -> bool {
            let pos = self.byte_offset(block, offset);
            let mut file = self.file.borrow_mut();
            let ok = file.seek(SeekFrom::Start(pos)).is_ok() && file.write_all(src).is_ok();
            if !ok {
                log::warn!("file backend write failed at block {} offset {}", block, offset);
            }
            ok
        }
    }
}
