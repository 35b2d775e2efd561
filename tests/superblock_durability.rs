//! Exercises the wandering super-block chain across enough saves to force
//! several link-tier rollovers and at least one anchor swap.

use wanderfs::superblock::SuperBlockManager;
use wanderfs::{BlockAllocator, Geometry, RamBackend};

#[test]
fn many_saves_survive_repeated_rollover() {
    let geometry = Geometry::new(64, 2, 2, 512).unwrap();
    let mut backend = RamBackend::new(geometry);
    let mut allocator = BlockAllocator::new(geometry);

    let payload_len = 32;
    let mut payload = vec![0u8; payload_len];
    let mut mgr = SuperBlockManager::create(&mut backend, &mut allocator, &payload).unwrap();

    for i in 0..6000u32 {
        payload[0..4].copy_from_slice(&i.to_le_bytes());
        mgr.save(&mut backend, &mut allocator, &payload).unwrap();
    }

    let mut recovered = vec![0u8; payload_len];
    let _mgr2 = SuperBlockManager::locate(&mut backend, &mut allocator, payload_len, &mut recovered)
        .expect("chain must still be recoverable after thousands of saves");
    assert_eq!(&recovered[0..4], &5999u32.to_le_bytes());
}

/// `sectors_per_block() == 16` for this geometry: sector 0 holds the block
/// head, sector 1 the first payload record written by `create`, so saves
/// 1..14 land on sectors 2..15 before the tier rolls over to a fresh block.
fn scenario_geometry() -> Geometry {
    Geometry::new(1024, 4, 4, 512).unwrap()
}

#[test]
fn saving_a_few_revisions_lands_on_sector_six() {
    let geometry = scenario_geometry();
    let mut backend = RamBackend::new(geometry);
    let mut allocator = BlockAllocator::new(geometry);
    let mut mgr = SuperBlockManager::create(&mut backend, &mut allocator, b"v0\0\0").unwrap();

    for i in 0..5u32 {
        let payload = i.to_le_bytes();
        mgr.save(&mut backend, &mut allocator, &payload).unwrap();
    }
    assert_eq!(mgr.location().1, 6);

    let mut out = [0u8; 4];
    let mgr2 = SuperBlockManager::locate(&mut backend, &mut allocator, 4, &mut out).unwrap();
    assert_eq!(mgr2.location().1, 6);
}

#[test]
fn block_rollover_lands_on_a_new_block_at_sector_four() {
    let geometry = scenario_geometry();
    let mut backend = RamBackend::new(geometry);
    let mut allocator = BlockAllocator::new(geometry);
    let mut mgr = SuperBlockManager::create(&mut backend, &mut allocator, b"v0\0\0").unwrap();
    let old = mgr.location();

    for i in 0..18u32 {
        let payload = i.to_le_bytes();
        mgr.save(&mut backend, &mut allocator, &payload).unwrap();
    }

    let mut out = [0u8; 4];
    let mgr2 = SuperBlockManager::locate(&mut backend, &mut allocator, 4, &mut out).unwrap();
    assert_ne!(mgr2.location().0, old.0);
    assert_eq!(mgr2.location().1, 4);
}

#[test]
fn anchor_area_rollover_lands_on_a_new_block_at_sector_seven() {
    let geometry = scenario_geometry();
    let mut backend = RamBackend::new(geometry);
    let mut allocator = BlockAllocator::new(geometry);
    let mut mgr = SuperBlockManager::create(&mut backend, &mut allocator, b"v0\0\0").unwrap();
    let old = mgr.location();

    // 15^4 + 6: enough saves to roll the super-block tier, both link
    // tiers, and the anchor area over at least once.
    let iterations = 15 * 15 * 15 * 15 + 6;
    for i in 0..iterations {
        let payload = (i as u32).to_le_bytes();
        mgr.save(&mut backend, &mut allocator, &payload).unwrap();
    }

    let mut out = [0u8; 4];
    let mgr2 = SuperBlockManager::locate(&mut backend, &mut allocator, 4, &mut out).unwrap();
    assert_ne!(mgr2.location().0, old.0);
    assert_eq!(mgr2.location().1, 7);
}

#[test]
fn anchor_area_rollover_twice_lands_on_a_new_block_at_sector_thirteen() {
    let geometry = scenario_geometry();
    let mut backend = RamBackend::new(geometry);
    let mut allocator = BlockAllocator::new(geometry);
    let mut mgr = SuperBlockManager::create(&mut backend, &mut allocator, b"v0\0\0").unwrap();
    let old = mgr.location();

    let iterations = (15 * 15 * 15 * 15 + 6) * 2;
    for i in 0..iterations {
        let payload = (i as u32).to_le_bytes();
        mgr.save(&mut backend, &mut allocator, &payload).unwrap();
    }

    let mut out = [0u8; 4];
    let mgr2 = SuperBlockManager::locate(&mut backend, &mut allocator, 4, &mut out).unwrap();
    assert_ne!(mgr2.location().0, old.0);
    assert_eq!(mgr2.location().1, 13);
}
