// vim: tw=80

use pretty_assertions::assert_eq;
use std::sync::Arc;
use zbdfs::{
    Error,
    device::ZonedDevice,
    file::MetadataWriter,
};
use super::util::{DevBuilder, MemJournal, random_data};

// Crash consistency: after a crash, a file consists of exactly the extents
// whose records reached the journal.  Later appends are lost cleanly and
// the surviving extents' zones are non-empty.
#[test]
fn crash_replay() {
    let h = DevBuilder::new().nr_zones(6).meta_zones(1).formatted().build();
    let journal = Arc::new(MemJournal::default());

    let f = t!(h.dev.create_file("000005.sst"));
    let synced = random_data(20, 100_000);
    t!(f.append(&h.dev, &synced, synced.len()));
    t!(h.zbd.sync_all());
    t!(journal.persist(&h.dev, &f));
    f.metadata_synced();

    // One more append that never reaches the journal
    t!(f.append(&h.dev, &random_data(21, 50_000), 50_000));
    t!(h.zbd.sync_all());

    // Crash: all in-memory state is gone; the media and the journal remain
    drop(f);
    drop(h.dev);
    let dev2 = t!(ZonedDevice::open(h.zbd.clone()));
    t!(journal.replay(&dev2));

    let g = dev2.lookup_file("000005.sst").unwrap();
    assert_eq!(g.size(), 100_000);
    let mut buf = vec![0u8; 100_000];
    assert_eq!(100_000, t!(g.positioned_read(&dev2, 0, &mut buf, false)));
    assert_eq!(&synced[..], &buf[..]);

    // Every zone referenced by a surviving extent holds data
    for e in g.extents() {
        let zone = dev2.io_zones().iter()
            .find(|z| z.zone_id == e.zone)
            .unwrap();
        assert!(!zone.is_empty());
        assert!(zone.used() >= e.length);
    }

    // File ids are not reused after replay
    let nf = t!(dev2.create_file("000006.log"));
    assert!(nf.id() > g.id());
}

// The replayed registry feeds the cleaner: the lost tail is dead bytes and
// can be reclaimed, but never a zone hosting journaled extents.
#[test]
fn lost_tail_is_reclaimable() {
    let h = DevBuilder::new().nr_zones(6).meta_zones(1).formatted().build();
    let journal = Arc::new(MemJournal::default());

    let f = t!(h.dev.create_file("000001.log"));
    // Journaled extent fills one zone; the lost tail lands in the next
    let keep = random_data(22, 1 << 20);
    t!(f.append(&h.dev, &keep, keep.len()));
    t!(h.zbd.sync_all());
    t!(journal.persist(&h.dev, &f));
    t!(f.append(&h.dev, &random_data(23, 8192), 8192));
    t!(h.zbd.sync_all());

    drop(f);
    drop(h.dev);
    let dev2 = t!(ZonedDevice::open(h.zbd.clone()));
    t!(journal.replay(&dev2));

    // The tail's zone has writes but no live data
    assert_eq!(dev2.reclaimable_space(), 8192);
    assert_eq!(1, t!(dev2.reset_unused_io_zones()));
    let g = dev2.lookup_file("000001.log").unwrap();
    let mut buf = vec![0u8; 1 << 20];
    assert_eq!(1 << 20, t!(g.positioned_read(&dev2, 0, &mut buf, false)));
    assert_eq!(&keep[..], &buf[..]);
}

#[test]
fn reopen_preserves_identity() {
    let h = DevBuilder::new().nr_zones(6).meta_zones(1).formatted().build();
    let uuid = h.dev.uuid();
    let generation = h.dev.generation();
    drop(h.dev);
    let dev2 = t!(ZonedDevice::open(h.zbd.clone()));
    assert_eq!(dev2.uuid(), uuid);
    assert_eq!(dev2.generation(), generation);
    assert_eq!(dev2.meta_zones().len(), 1);
}

#[test]
fn open_unformatted_device() {
    let h = DevBuilder::new().nr_zones(6).build();
    let e = ZonedDevice::open(h.zbd.clone());
    assert_eq!(Err(Error::EINVAL), e.map(drop));
}
