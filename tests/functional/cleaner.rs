// vim: tw=80

use pretty_assertions::assert_eq;
use std::sync::Arc;
use zbdfs::{WriteLifetime, cleaner::Cleaner, zone::ZonePool};
use super::util::{DevBuilder, MemJournal, random_data};

// Deleting a file leaves fully dead zones, which a pass resets with zero
// copy work.
#[test]
fn reclaim_dead_zones_without_copying() {
    const CHUNK: usize = 400 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    let f = t!(h.dev.create_file("000004.sst"));
    for i in 0..3u64 {
        t!(f.append(&h.dev, &random_data(i, CHUNK), CHUNK));
    }
    t!(f.close_wr(&h.dev));
    t!(h.dev.delete_file("000004.sst"));
    assert_eq!(h.dev.io_zones()[0].used(), 0);
    assert_eq!(h.dev.io_zones()[1].used(), 0);

    let journal = Arc::new(MemJournal::default());
    let before = h.dev.total_written();
    let reclaimed = t!(h.dev.zone_cleaning(2, &*journal));
    assert_eq!(reclaimed, 2);
    assert!(h.dev.io_zones()[0].is_empty());
    assert!(h.dev.io_zones()[1].is_empty());
    // Zero copy work: nothing further hit the media
    assert_eq!(h.dev.total_written(), before);
    assert_eq!(journal.nr_records(), 0);
    assert_eq!(h.dev.reclaimable_space(), 0);
    assert_eq!(h.dev.nr_resets(), 2);
}

// Four tables pinned in one zone; two die.  The cleaner relocates the two
// live extents into reserved scratch and resets the zone, and the
// survivors read back byte-identical.
#[test]
fn relocate_live_extents() {
    const SZ: usize = 256 * 1024;
    let h = DevBuilder::new().nr_zones(5).reserved_zones(1).build();
    let keys: [(&[u8], &[u8]); 4] =
        [(b"a", b"d"), (b"b", b"e"), (b"c", b"f"), (b"d", b"g")];
    let mut files = Vec::new();
    for (i, (s, l)) in keys.iter().enumerate() {
        let f = t!(h.dev.create_file(&format!("{:06}.sst", i + 1)));
        f.set_key_range(s, l, 1);
        f.set_lifetime(WriteLifetime::Medium);
        t!(f.append(&h.dev, &random_data(100 + i as u64, SZ), SZ));
        t!(f.close_wr(&h.dev));
        files.push(f);
    }
    // Same level, overlapping keys, same hint: all four share the first
    // data zone
    let z0 = &h.dev.io_zones()[0];
    for f in &files {
        assert_eq!(f.extents()[0].zone, z0.zone_id);
    }
    assert_eq!(z0.used(), 4 * SZ as u64);

    t!(h.dev.delete_file("000002.sst"));
    t!(h.dev.delete_file("000003.sst"));
    assert_eq!(z0.used(), 2 * SZ as u64);
    assert_eq!(z0.invalid_bytes(), 2 * SZ as u64);

    let journal = Arc::new(MemJournal::default());
    let reclaimed = t!(h.dev.zone_cleaning(1, &*journal));
    assert_eq!(reclaimed, 1);
    assert!(z0.is_empty());

    // Survivors moved into the reserved zone and their metadata was
    // persisted before the reset
    assert_eq!(journal.nr_records(), 2);
    for (i, seed) in [(0usize, 100u64), (3, 103)] {
        let f = &files[i];
        let e = f.extents();
        assert_eq!(e.len(), 1);
        let zone = h.dev.reserved_zones().iter()
            .find(|z| z.zone_id == e[0].zone);
        assert!(zone.is_some(), "extent not in a reserved zone");
        assert_eq!(zone.unwrap().pool, ZonePool::Reserved);

        let expected = random_data(seed, SZ);
        let mut buf = vec![0u8; SZ];
        assert_eq!(SZ, t!(f.positioned_read(&h.dev, 0, &mut buf, false)));
        assert_eq!(&expected[..], &buf[..]);
    }
}

// The background cleaner thread does the same work on request.
#[test]
fn background_cleaner() {
    const SZ: usize = 512 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    let f = t!(h.dev.create_file("000001.sst"));
    t!(f.append(&h.dev, &random_data(1, SZ), SZ));
    t!(f.close_wr(&h.dev));
    t!(h.dev.delete_file("000001.sst"));

    let cleaner = Cleaner::new(h.dev.clone(), Arc::new(MemJournal::default()));
    let reclaimed = cleaner.clean(4).recv().unwrap();
    assert_eq!(reclaimed, Ok(1));
    cleaner.shutdown();
    assert!(h.dev.io_zones()[0].is_empty());
}

// Victim selection prefers the zone with the most invalid bytes.
#[test]
fn dirtiest_zone_first() {
    const SZ: usize = 512 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    // Zone 0: 512k dead.  Zone 1: 1M dead (two files).
    let a = t!(h.dev.create_file("000001.log"));
    a.set_lifetime(WriteLifetime::Short);
    t!(a.append(&h.dev, &random_data(1, SZ), SZ));
    t!(a.close_wr(&h.dev));
    let b = t!(h.dev.create_file("000002.log"));
    b.set_lifetime(WriteLifetime::Long);
    t!(b.append(&h.dev, &random_data(2, 2 * SZ), 2 * SZ));
    t!(b.close_wr(&h.dev));
    t!(h.dev.delete_file("000001.log"));
    t!(h.dev.delete_file("000002.log"));

    let journal = Arc::new(MemJournal::default());
    let reclaimed = t!(h.dev.zone_cleaning(1, &*journal));
    assert_eq!(reclaimed, 1);
    assert!(h.dev.io_zones()[1].is_empty());
    assert!(!h.dev.io_zones()[0].is_empty());
}

// The fast path outside a full pass: fully dead, unheld zones reset
// directly.
#[test]
fn reset_unused_io_zones() {
    const SZ: usize = 256 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    let a = t!(h.dev.create_file("000001.log"));
    t!(a.append(&h.dev, &random_data(1, SZ), SZ));
    t!(a.close_wr(&h.dev));
    let b = t!(h.dev.create_file("000002.log"));
    b.set_lifetime(WriteLifetime::Long);
    t!(b.append(&h.dev, &random_data(2, SZ), SZ));
    t!(b.close_wr(&h.dev));

    t!(h.dev.delete_file("000001.log"));
    assert_eq!(1, t!(h.dev.reset_unused_io_zones()));
    // The zone still hosting 000002.log is untouched
    assert_eq!(h.dev.used_space(), SZ as u64);
}
