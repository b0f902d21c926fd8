// vim: tw=80

use pretty_assertions::assert_eq;
use std::{thread, time::Duration};
use zbdfs::{Error, WriteLifetime, handle::ZonedWritableFile};
use super::util::{DevBuilder, random_data};

// One file appended in three 400 KiB flushes: the first two share zone 0,
// the third moves wholesale to zone 1 rather than splitting across zone 0's
// tail.
#[test]
fn sequential_fill() {
    const CHUNK: usize = 400 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    let f = t!(h.dev.create_file("000004.sst"));
    let data = random_data(0, 3 * CHUNK);
    for i in 0..3 {
        t!(f.append(&h.dev, &data[i * CHUNK..(i + 1) * CHUNK], CHUNK));
    }
    t!(h.zbd.sync_all());
    t!(f.close_wr(&h.dev));

    assert_eq!(f.size(), 1_228_800);
    let extents = f.extents();
    assert_eq!(extents.len(), 3);
    let z0 = h.dev.io_zones()[0].zone_id;
    let z1 = h.dev.io_zones()[1].zone_id;
    assert_eq!(extents[0].zone, z0);
    assert_eq!(extents[1].zone, z0);
    assert_eq!(extents[2].zone, z1);
    assert_eq!(extents[0].length + extents[1].length, 800 * 1024);
    assert_eq!(extents[2].length, 400 * 1024);

    // Zone accounting matches: 800k live in zone 0, 400k in zone 1
    assert_eq!(h.dev.io_zones()[0].used(), 800 * 1024);
    assert_eq!(h.dev.io_zones()[1].used(), 400 * 1024);

    // And the content reads back intact
    let mut buf = vec![0u8; data.len()];
    assert_eq!(data.len(),
               t!(f.positioned_read(&h.dev, 0, &mut buf, false)));
    assert_eq!(&data[..], &buf[..]);
}

// Files with different lifetime hints must not share a zone.
#[test]
fn mixed_lifetimes_get_distinct_zones() {
    const SZ: usize = 600 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();

    let short = t!(h.dev.create_file("000001.log"));
    short.set_lifetime(WriteLifetime::Short);
    t!(short.append(&h.dev, &random_data(1, SZ), SZ));
    t!(short.close_wr(&h.dev));

    let long = t!(h.dev.create_file("000002.sst"));
    long.set_lifetime(WriteLifetime::Long);
    t!(long.append(&h.dev, &random_data(2, SZ), SZ));
    t!(long.close_wr(&h.dev));

    let zs = short.extents().iter().map(|e| e.zone).collect::<Vec<_>>();
    let zl = long.extents().iter().map(|e| e.zone).collect::<Vec<_>>();
    assert!(zs.iter().all(|z| !zl.contains(z)),
        "short={zs:?} long={zl:?} share a zone");
}

// With max_open == 1, the second writer's first flush blocks until the
// first writer closes its active zone.
#[test]
fn open_cap_backpressure() {
    let h = DevBuilder::new().nr_zones(4).max_open(1).build();
    let f1 = t!(h.dev.create_file("000001.log"));
    let f2 = t!(h.dev.create_file("000002.log"));

    let mut w1 = ZonedWritableFile::new(h.dev.clone(), f1, true, None);
    t!(w1.append(&random_data(1, 8192)));
    t!(w1.flush());

    let dev2 = h.dev.clone();
    let blocked = thread::spawn(move || {
        let mut w2 = ZonedWritableFile::new(dev2, f2, true, None);
        w2.append(&random_data(2, 8192)).unwrap();
        w2.flush().unwrap();
        w2.close().unwrap();
    });
    thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished(), "second writer ran inside the cap");

    t!(w1.close());
    blocked.join().unwrap();
}

#[test]
fn space_accounting() {
    const SZ: usize = 256 * 1024;
    let h = DevBuilder::new().nr_zones(4).build();
    assert_eq!(h.dev.free_space(), 4 << 20);
    assert_eq!(h.dev.used_space(), 0);

    let f = t!(h.dev.create_file("000001.sst"));
    t!(f.append(&h.dev, &random_data(3, SZ), SZ));
    t!(f.close_wr(&h.dev));
    assert_eq!(h.dev.free_space(), (4 << 20) - SZ as u64);
    assert_eq!(h.dev.used_space(), SZ as u64);
    assert_eq!(h.dev.reclaimable_space(), 0);
    assert_eq!(h.dev.total_written(), SZ as u64);

    t!(h.dev.delete_file("000001.sst"));
    assert_eq!(h.dev.used_space(), 0);
    assert_eq!(h.dev.reclaimable_space(), SZ as u64);

    // pet the log paths
    h.dev.log_zone_stats();
    h.dev.log_zone_usage();
}

// Requests that can never be satisfied fail with ENOSPC instead of waiting.
#[test]
fn allocation_failure_when_device_is_full() {
    let h = DevBuilder::new().nr_zones(1).zone_size(1 << 20).build();
    let f = t!(h.dev.create_file("000001.log"));
    let data = random_data(4, 1 << 20);
    t!(f.append(&h.dev, &data, data.len()));
    t!(f.close_wr(&h.dev));

    let g = t!(h.dev.create_file("000002.log"));
    assert_eq!(Err(Error::ENOSPC),
               g.append(&h.dev, &random_data(5, 4096), 4096));
}

// A nearly full zone is finished on close once the threshold applies,
// trading the tail for a free active slot.
#[test]
fn finish_threshold_wastes_tail() {
    const SZ: usize = 800 * 1024;
    let h = DevBuilder::new().nr_zones(4).finish_threshold(30).build();
    let f = t!(h.dev.create_file("000001.sst"));
    t!(f.append(&h.dev, &random_data(6, SZ), SZ));
    t!(f.close_wr(&h.dev));

    let z0 = &h.dev.io_zones()[0];
    assert!(z0.is_full());
    assert_eq!(z0.capacity(), 0);
    // The finished tail is gone; only the empty zones count as free
    assert_eq!(h.dev.free_space(), 3 << 20);
    // But the data is still there
    let mut buf = vec![0u8; SZ];
    assert_eq!(SZ, t!(f.positioned_read(&h.dev, 0, &mut buf, false)));
}

// A shutdown device turns blocked allocations into ESHUTDOWN.
#[test]
fn shutdown_interrupts_blocked_writer() {
    let h = DevBuilder::new().nr_zones(4).max_open(1).build();
    let f1 = t!(h.dev.create_file("000001.log"));
    t!(f1.append(&h.dev, &random_data(1, 4096), 4096));

    let dev2 = h.dev.clone();
    let blocked = thread::spawn(move || {
        let f2 = dev2.create_file("000002.log").unwrap();
        f2.append(&dev2, &random_data(2, 4096), 4096)
    });
    thread::sleep(Duration::from_millis(100));
    h.dev.shutdown();
    assert_eq!(Err(Error::ESHUTDOWN), blocked.join().unwrap());
}
