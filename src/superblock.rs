//! The wandering super-block chain: two redundant anchor blocks, a run of
//! intermediate link blocks, and the block actually holding the caller's
//! super-block payload. See `SPEC_FULL.md` §4.3 for the full algorithm
//! description this module implements.

use alloc::vec::Vec;

use crate::allocator::BlockAllocator;
use crate::backend::StorageBackend;
use crate::block::{BlockHead, BlockType, ANCHOR_BLOCKS, BLOCK_MAGIC};
use crate::error::Error;
use crate::geometry::Geometry;

const RECORD_HEADER_SIZE: usize = 4 + 4; // magic + timestamp
const LINK_RECORD_SIZE: usize = RECORD_HEADER_SIZE + 4; // + chained_block

/// Number of intermediate link tiers between the anchors and the
/// super-block payload itself.
pub const CHAIN_LENGTH: usize = 2;

/// Whether timestamp `a` is logically after `b`, tolerant of `u32` wraparound
/// the way TCP sequence numbers are compared: the difference is treated as
/// signed, so `a` wins as long as it is within half the counter's range of
/// `b`. Plain `a > b` would pick the wrong anchor the instant one side's
/// counter wraps past `b` while the other hasn't.
fn is_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn read_record_header(buf: &[u8]) -> Option<u32> {
    if buf[0..4] != BLOCK_MAGIC {
        return None;
    }
    Some(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

fn write_record_header(buf: &mut [u8], timestamp: u32) {
    buf[0..4].copy_from_slice(&BLOCK_MAGIC);
    buf[4..8].copy_from_slice(&timestamp.to_le_bytes());
}

/// Per-tier write cursor: which sector of the current block is next to
/// receive a record. Sector 0 is reserved for the block's own `BlockHead`.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    block: u32,
    next_sector: u32,
}

impl Cursor {
    fn is_full(&self, geometry: &Geometry) -> bool {
        self.next_sector >= geometry.sectors_per_block()
    }
}

/// Manages the three-tier wandering chain: `[anchor] -> link* -> superblock`.
pub struct SuperBlockManager {
    geometry: Geometry,
    timestamp: u32,
    anchor_active: usize,
    anchor_cursor: [Cursor; 2],
    link_cursor: Vec<Cursor>,
    sb_cursor: Cursor,
    payload_size: usize,
}

impl SuperBlockManager {
    /// Allocate a fresh chain: one super-block, `CHAIN_LENGTH` link blocks,
    /// and stamp both anchors to point at the first link. Writes
    /// `payload` as the initial super-block contents.
    pub fn create(
        backend: &mut dyn StorageBackend,
        allocator: &mut BlockAllocator,
        payload: &[u8],
    ) -> Result<SuperBlockManager, Error> {
        let geometry = backend.geometry();
        if payload.len() + RECORD_HEADER_SIZE > geometry.sector_size as usize {
            return Err(Error::OutOfBounds(payload.len()));
        }

        allocator.mark_live(ANCHOR_BLOCKS[0]);
        allocator.mark_live(ANCHOR_BLOCKS[1]);

        let mut links = Vec::with_capacity(CHAIN_LENGTH);
        for _ in 0..CHAIN_LENGTH {
            let rec = allocator.allocate(BlockType::SuperBlockLink);
            if !rec.is_valid() {
                return Err(Error::AllocatorExhausted);
            }
            links.push(rec.block);
        }
        let sb_rec = allocator.allocate(BlockType::SuperBlock);
        if !sb_rec.is_valid() {
            return Err(Error::AllocatorExhausted);
        }
        let sb_block = sb_rec.block;

        let mut timestamp = 0u32;

        for &anchor in &ANCHOR_BLOCKS {
            if !backend.erase(anchor) {
                return Err(Error::BackendFailure(anchor));
            }
        }
        for &block in &links {
            if !backend.erase(block) {
                return Err(Error::BackendFailure(block));
            }
            write_block_head(backend, block, BlockType::SuperBlockLink);
        }
        if !backend.erase(sb_block) {
            return Err(Error::BackendFailure(sb_block));
        }
        write_block_head(backend, sb_block, BlockType::SuperBlock);

        // Write tiers from the leaf (super-block) upward so every link
        // points at something already durable by the time it is written.
        timestamp += 1;
        write_payload_record(backend, &geometry, sb_block, 1, timestamp, payload)?;
        let sb_cursor = Cursor {
            block: sb_block,
            next_sector: 2,
        };

        let mut next_target = sb_block;
        let mut link_cursor = Vec::with_capacity(CHAIN_LENGTH);
        for &block in links.iter().rev() {
            timestamp += 1;
            write_link_record(backend, &geometry, block, 1, timestamp, next_target)?;
            link_cursor.push(Cursor {
                block,
                next_sector: 2,
            });
            next_target = block;
        }
        link_cursor.reverse();

        for &anchor in &ANCHOR_BLOCKS {
            timestamp += 1;
            write_link_record(backend, &geometry, anchor, 1, timestamp, next_target)?;
        }
        let anchor_cursor = [
            Cursor {
                block: ANCHOR_BLOCKS[0],
                next_sector: 2,
            },
            Cursor {
                block: ANCHOR_BLOCKS[1],
                next_sector: 2,
            },
        ];

        Ok(SuperBlockManager {
            geometry,
            timestamp,
            anchor_active: 1,
            anchor_cursor,
            link_cursor,
            sb_cursor,
            payload_size: payload.len(),
        })
    }

    /// The block and sector of the most recently written super-block
    /// payload record. Exists so callers (and the durability scenario
    /// tests) can observe exactly where the wandering chain currently
    /// sits without reading the payload back out.
    pub fn location(&self) -> (u32, u32) {
        (self.sb_cursor.block, self.sb_cursor.next_sector - 1)
    }

    /// Walk the chain from whichever anchor currently holds the latest
    /// timestamp and recover the current super-block payload, along with a
    /// manager instance positioned to continue appending.
    pub fn locate(
        backend: &mut dyn StorageBackend,
        allocator: &mut BlockAllocator,
        payload_size: usize,
        out: &mut [u8],
    ) -> Result<SuperBlockManager, Error> {
        let geometry = backend.geometry();
        allocator.mark_live(ANCHOR_BLOCKS[0]);
        allocator.mark_live(ANCHOR_BLOCKS[1]);

        let mut best: Option<(u32, usize, Cursor, u32)> = None; // (timestamp, anchor_index, cursor, chained_block)
        for (i, &anchor) in ANCHOR_BLOCKS.iter().enumerate() {
            if let Some((cursor, timestamp, chained)) = scan_link_tier(backend, &geometry, anchor)
            {
                let better = match &best {
                    None => true,
                    Some((best_ts, ..)) => is_after(timestamp, *best_ts),
                };
                if better {
                    best = Some((timestamp, i, cursor, chained));
                }
            }
        }
        let (_, anchor_active, anchor_cursor_active, mut next_block) = match best {
            Some(v) => v,
            None => {
                log::error!("neither anchor block decoded a valid link record");
                return Err(Error::CorruptChain);
            }
        };

        let mut anchor_cursor = [
            Cursor {
                block: ANCHOR_BLOCKS[0],
                next_sector: 2,
            },
            Cursor {
                block: ANCHOR_BLOCKS[1],
                next_sector: 2,
            },
        ];
        anchor_cursor[anchor_active] = anchor_cursor_active;

        let mut link_cursor = Vec::with_capacity(CHAIN_LENGTH);
        let mut max_timestamp = 0u32;
        for _ in 0..CHAIN_LENGTH {
            let (cursor, timestamp, chained) =
                scan_link_tier(backend, &geometry, next_block).ok_or(Error::CorruptChain)?;
            max_timestamp = max_timestamp.max(timestamp);
            link_cursor.push(cursor);
            next_block = chained;
        }

        let (sb_cursor, sb_timestamp) =
            scan_payload_tier(backend, &geometry, next_block, payload_size, out)
                .ok_or(Error::CorruptChain)?;
        max_timestamp = max_timestamp.max(sb_timestamp);

        allocator.mark_live(sb_cursor.block);
        for c in &link_cursor {
            allocator.mark_live(c.block);
        }

        Ok(SuperBlockManager {
            geometry,
            timestamp: max_timestamp,
            anchor_active,
            anchor_cursor,
            link_cursor,
            sb_cursor,
            payload_size,
        })
    }

    /// Persist a new super-block payload, rolling over into fresh blocks
    /// (and propagating the new location up the chain) as needed.
    pub fn save(
        &mut self,
        backend: &mut dyn StorageBackend,
        allocator: &mut BlockAllocator,
        payload: &[u8],
    ) -> Result<(), Error> {
        debug_assert_eq!(payload.len(), self.payload_size);
        self.timestamp += 1;
        let geometry = self.geometry;

        if !self.sb_cursor.is_full(&geometry) {
            write_payload_record(
                backend,
                &geometry,
                self.sb_cursor.block,
                self.sb_cursor.next_sector,
                self.timestamp,
                payload,
            )?;
            self.sb_cursor.next_sector += 1;
            return Ok(());
        }

        // Super-block tier is full: allocate a new block and propagate the
        // new pointer up through the link tiers (and, if those are also
        // full, the anchors).
        let old_block = self.sb_cursor.block;
        let old_age = allocator.age_of(old_block);
        let rec = allocator.allocate(BlockType::SuperBlock);
        if !rec.is_valid() {
            return Err(Error::AllocatorExhausted);
        }
        if !backend.erase(rec.block) {
            return Err(Error::BackendFailure(rec.block));
        }
        write_block_head(backend, rec.block, BlockType::SuperBlock);
        write_payload_record(backend, &geometry, rec.block, 1, self.timestamp, payload)?;
        self.sb_cursor = Cursor {
            block: rec.block,
            next_sector: 2,
        };
        allocator.free(old_block, old_age + 1);

        log::debug!("super-block tier full at block {}, rolling over to block {}", old_block, rec.block);
        self.rollover_link(backend, allocator, CHAIN_LENGTH - 1, rec.block)
    }

    /// Propagate a new `chained_block` pointer into link tier `level`
    /// (0-indexed from the anchors), allocating and chaining further up if
    /// that tier is also full.
    fn rollover_link(
        &mut self,
        backend: &mut dyn StorageBackend,
        allocator: &mut BlockAllocator,
        level: usize,
        chained_block: u32,
    ) -> Result<(), Error> {
        self.timestamp += 1;
        let geometry = self.geometry;
        let cursor = self.link_cursor[level];

        if !cursor.is_full(&geometry) {
            write_link_record(
                backend,
                &geometry,
                cursor.block,
                cursor.next_sector,
                self.timestamp,
                chained_block,
            )?;
            self.link_cursor[level].next_sector += 1;
            return Ok(());
        }

        let old_block = cursor.block;
        let old_age = allocator.age_of(old_block);
        let rec = allocator.allocate(BlockType::SuperBlockLink);
        if !rec.is_valid() {
            return Err(Error::AllocatorExhausted);
        }
        if !backend.erase(rec.block) {
            return Err(Error::BackendFailure(rec.block));
        }
        write_block_head(backend, rec.block, BlockType::SuperBlockLink);
        write_link_record(backend, &geometry, rec.block, 1, self.timestamp, chained_block)?;
        self.link_cursor[level] = Cursor {
            block: rec.block,
            next_sector: 2,
        };
        allocator.free(old_block, old_age + 1);

        log::debug!("link tier {} full at block {}, rolling over to block {}", level, old_block, rec.block);
        if level == 0 {
            self.rollover_anchor(backend, allocator, rec.block)
        } else {
            self.rollover_link(backend, allocator, level - 1, rec.block)
        }
    }

    /// Anchors have no parent tier: when both sides are exhausted we
    /// round-robin to the other anchor, erasing it first.
    fn rollover_anchor(
        &mut self,
        backend: &mut dyn StorageBackend,
        allocator: &mut BlockAllocator,
        chained_block: u32,
    ) -> Result<(), Error> {
        self.timestamp += 1;
        let geometry = self.geometry;
        let active = self.anchor_active;
        let cursor = self.anchor_cursor[active];

        if !cursor.is_full(&geometry) {
            write_link_record(
                backend,
                &geometry,
                cursor.block,
                cursor.next_sector,
                self.timestamp,
                chained_block,
            )?;
            self.anchor_cursor[active].next_sector += 1;
            return Ok(());
        }

        let other = 1 - active;
        let other_block = self.anchor_cursor[other].block;
        log::info!("both anchors full, swapping active anchor to block {}", other_block);
        if !backend.erase(other_block) {
            return Err(Error::BackendFailure(other_block));
        }
        allocator.mark_live(other_block);
        write_link_record(backend, &geometry, other_block, 1, self.timestamp, chained_block)?;
        self.anchor_cursor[other] = Cursor {
            block: other_block,
            next_sector: 2,
        };
        self.anchor_active = other;
        Ok(())
    }
}

fn write_block_head(backend: &mut dyn StorageBackend, block: u32, block_type: BlockType) {
    let mut buf = [0u8; BlockHead::SIZE];
    BlockHead::new(block_type, 0).write_to(&mut buf);
    backend.write(block, 0, &buf);
}

fn write_link_record(
    backend: &mut dyn StorageBackend,
    geometry: &Geometry,
    block: u32,
    sector: u32,
    timestamp: u32,
    chained_block: u32,
) -> Result<(), Error> {
    let mut buf = [0u8; LINK_RECORD_SIZE];
    write_record_header(&mut buf, timestamp);
    buf[8..12].copy_from_slice(&chained_block.to_le_bytes());
    let offset = sector * geometry.sector_size;
    if backend.write(block, offset, &buf) {
        Ok(())
    } else {
        Err(Error::BackendFailure(block))
    }
}

fn write_payload_record(
    backend: &mut dyn StorageBackend,
    geometry: &Geometry,
    block: u32,
    sector: u32,
    timestamp: u32,
    payload: &[u8],
) -> Result<(), Error> {
    let mut buf = alloc::vec![0u8; RECORD_HEADER_SIZE + payload.len()];
    write_record_header(&mut buf, timestamp);
    buf[RECORD_HEADER_SIZE..].copy_from_slice(payload);
    let offset = sector * geometry.sector_size;
    if backend.write(block, offset, &buf) {
        Ok(())
    } else {
        Err(Error::BackendFailure(block))
    }
}

/// Scan a link-tier block sector by sector, returning the cursor
/// positioned at the *next free* sector along with the last valid
/// record's timestamp and chained block.
fn scan_link_tier(
    backend: &mut dyn StorageBackend,
    geometry: &Geometry,
    block: u32,
) -> Option<(Cursor, u32, u32)> {
    let mut best: Option<(u32, u32)> = None; // (timestamp, chained_block)
    let mut sector = 1u32;
    let capacity = geometry.sectors_per_block();
    let mut buf = [0u8; LINK_RECORD_SIZE];
    while sector < capacity {
        if !backend.read(block, sector * geometry.sector_size, &mut buf) {
            break;
        }
        match read_record_header(&buf) {
            Some(ts) => {
                let chained = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
                best = Some((ts, chained));
                sector += 1;
            }
            None => break,
        }
    }
    best.map(|(ts, chained)| {
        (
            Cursor {
                block,
                next_sector: sector,
            },
            ts,
            chained,
        )
    })
}

fn scan_payload_tier(
    backend: &mut dyn StorageBackend,
    geometry: &Geometry,
    block: u32,
    payload_size: usize,
    out: &mut [u8],
) -> Option<(Cursor, u32)> {
    let mut best_ts: Option<u32> = None;
    let mut sector = 1u32;
    let capacity = geometry.sectors_per_block();
    let mut buf = alloc::vec![0u8; RECORD_HEADER_SIZE + payload_size];
    while sector < capacity {
        if !backend.read(block, sector * geometry.sector_size, &mut buf) {
            break;
        }
        match read_record_header(&buf) {
            Some(ts) => {
                out.copy_from_slice(&buf[RECORD_HEADER_SIZE..]);
                best_ts = Some(ts);
                sector += 1;
            }
            None => break,
        }
    }
    best_ts.map(|ts| {
        (
            Cursor {
                block,
                next_sector: sector,
            },
            ts,
        )
    })
}
