// vim: tw=80

use rand::{RngCore, SeedableRng};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use zbdfs::{
    Result,
    device::{DeviceOptions, ZonedDevice},
    file::{MetadataWriter, ZoneFile},
    zbd::Zbd,
    zbd_file::{FileZbd, Geometry},
};

pub struct Harness {
    pub dev: Arc<ZonedDevice>,
    pub zbd: Arc<dyn Zbd>,
    pub _tempdir: TempDir,
}

/// Builds an emulated device in a tempdir.  The default is 8 data zones of
/// 1 MiB with 4 KiB blocks and no metadata or reserved zones; tests opt in
/// to what they need.
pub struct DevBuilder {
    geom: Geometry,
    opts: DeviceOptions,
    format: bool,
}

impl DevBuilder {
    pub fn new() -> Self {
        DevBuilder {
            geom: Geometry {
                block_size: 4096,
                zone_size: 1 << 20,
                nr_zones: 8,
                nr_meta_zones: 0,
            },
            opts: DeviceOptions {
                meta_zones: 0,
                reserved_zones: 0,
                ..Default::default()
            },
            format: false,
        }
    }

    pub fn zone_size(mut self, zone_size: u64) -> Self {
        self.geom.zone_size = zone_size;
        self
    }

    pub fn nr_zones(mut self, nr_zones: u32) -> Self {
        self.geom.nr_zones = nr_zones;
        self
    }

    pub fn meta_zones(mut self, n: u32) -> Self {
        self.geom.nr_meta_zones = n;
        self.opts.meta_zones = n;
        self
    }

    pub fn reserved_zones(mut self, n: u32) -> Self {
        self.opts.reserved_zones = n;
        self
    }

    pub fn max_open(mut self, n: u32) -> Self {
        self.opts.max_open = n;
        self
    }

    pub fn finish_threshold(mut self, pct: u32) -> Self {
        self.opts.finish_threshold = pct;
        self
    }

    /// Stamp a superblock and open through it, instead of opening with
    /// out-of-band geometry.
    pub fn formatted(mut self) -> Self {
        self.format = true;
        self
    }

    pub fn build(self) -> Harness {
        let tempdir = tempfile::Builder::new()
            .prefix("zbdfs_functional")
            .tempdir()
            .unwrap();
        let path = tempdir.path().join("zbd");
        let zbd: Arc<dyn Zbd> =
            Arc::new(t!(FileZbd::create(path, self.geom)));
        let dev = if self.format {
            t!(ZonedDevice::format(&zbd, &self.opts));
            t!(ZonedDevice::open(zbd.clone()))
        } else {
            t!(ZonedDevice::open_with(zbd.clone(), self.opts))
        };
        Harness { dev, zbd, _tempdir: tempdir }
    }
}

/// In-memory stand-in for the metadata journal: totally ordered, durable on
/// return, one snapshot record per file.
#[derive(Default)]
pub struct MemJournal {
    records: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl MemJournal {
    pub fn replay(&self, dev: &ZonedDevice) -> Result<usize> {
        let records = self.records.lock().unwrap();
        for rec in records.values() {
            dev.replay_record(&mut rec.as_slice())?;
        }
        Ok(records.len())
    }

    pub fn nr_records(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl MetadataWriter for MemJournal {
    fn persist(&self, dev: &ZonedDevice, file: &ZoneFile) -> Result {
        let mut rec = Vec::new();
        file.encode_snapshot_to(dev, &mut rec);
        self.records.lock().unwrap().insert(file.id().0, rec);
        Ok(())
    }
}

/// Reproducible pseudorandom file contents
pub fn random_data(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut v = vec![0u8; len];
    rng.fill_bytes(&mut v);
    v
}
