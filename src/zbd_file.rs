// vim: tw=80

use crate::{
    types::*,
    util::*,
    zbd::*,
};
use nix::{
    sys::uio::{pread, pwrite},
    unistd::fsync,
};
use std::{
    fs,
    os::unix::io::AsRawFd,
    path::Path,
    sync::Mutex,
};

/// Geometry of an emulated zoned device.
///
/// Real hardware reports these; the emulation takes them at creation time.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub block_size: u64,
    pub zone_size: u64,
    pub nr_zones: ZoneT,
    /// Zones at the front of the address space reported as metadata zones
    pub nr_meta_zones: ZoneT,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            block_size: 4096,
            zone_size: 1 << 20,
            nr_zones: 32,
            nr_meta_zones: 3,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EmuZone {
    wp: u64,
    cond: ZoneCond,
}

/// `FileZbd`: zoned block device emulation backed by a regular file.
///
/// Zones are laid out contiguously.  The emulation enforces the hardware
/// contract: writes must be block-granular and land exactly on the zone's
/// write pointer, and a full zone rejects writes until reset.  It does not
/// scrub data on reset; stale bytes beyond a write pointer may be readable,
/// just as on real media after a reset without a sanitize.
#[derive(Debug)]
pub struct FileZbd {
    file: fs::File,
    geom: Geometry,
    zones: Mutex<Vec<EmuZone>>,
}

impl FileZbd {
    /// Create a fresh emulated device backed by `path`, sized per `geom`.
    pub fn create<P: AsRef<Path>>(path: P, geom: Geometry) -> Result<Self> {
        assert!(geom.block_size.is_power_of_two());
        assert!(is_aligned(geom.zone_size, geom.block_size),
            "zone size must be a multiple of the block size");
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(geom.zone_size * u64::from(geom.nr_zones))?;
        let zones = (0..geom.nr_zones).map(|i| {
            EmuZone {
                wp: u64::from(i) * geom.zone_size,
                cond: ZoneCond::Empty,
            }
        }).collect();
        Ok(FileZbd { file, geom, zones: Mutex::new(zones) })
    }

    fn zone_index(&self, offset: u64) -> Result<usize> {
        let idx = offset / self.geom.zone_size;
        if idx >= u64::from(self.geom.nr_zones) {
            Err(Error::EINVAL)
        } else {
            Ok(idx as usize)
        }
    }

    fn zone_end(&self, idx: usize) -> u64 {
        (idx as u64 + 1) * self.geom.zone_size
    }
}

impl Zbd for FileZbd {
    fn block_size(&self) -> u64 {
        self.geom.block_size
    }

    fn zone_size(&self) -> u64 {
        self.geom.zone_size
    }

    fn nr_zones(&self) -> ZoneT {
        self.geom.nr_zones
    }

    fn report_zones(&self) -> Result<Vec<ZoneReport>> {
        let zones = self.zones.lock().unwrap();
        Ok(zones.iter().enumerate().map(|(i, z)| {
            let start = i as u64 * self.geom.zone_size;
            let ztype = if (i as ZoneT) < self.geom.nr_meta_zones {
                ZoneType::Meta
            } else {
                ZoneType::Data
            };
            ZoneReport {
                start,
                len: self.geom.zone_size,
                capacity: self.zone_end(i) - z.wp,
                wp: z.wp,
                cond: z.cond,
                ztype,
            }
        }).collect())
    }

    fn open_zone(&self, start: u64) -> Result {
        let idx = self.zone_index(start)?;
        let zones = self.zones.lock().unwrap();
        if zones[idx].cond == ZoneCond::Full {
            Err(Error::EBUSY)
        } else {
            Ok(())
        }
    }

    fn close_zone(&self, start: u64) -> Result {
        self.zone_index(start).map(drop)
    }

    fn finish_zone(&self, start: u64) -> Result {
        let idx = self.zone_index(start)?;
        let mut zones = self.zones.lock().unwrap();
        zones[idx].wp = self.zone_end(idx);
        zones[idx].cond = ZoneCond::Full;
        Ok(())
    }

    fn reset_zone(&self, start: u64) -> Result {
        let idx = self.zone_index(start)?;
        let mut zones = self.zones.lock().unwrap();
        zones[idx].wp = start;
        zones[idx].cond = ZoneCond::Empty;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result {
        if !is_aligned(buf.len() as u64, self.geom.block_size) ||
           !is_aligned(offset, self.geom.block_size)
        {
            return Err(Error::EINVAL);
        }
        let idx = self.zone_index(offset)?;
        // Hold the lock across the pwrite so the wp check and the write are
        // one atomic step, like the hardware's.
        let mut zones = self.zones.lock().unwrap();
        let z = &mut zones[idx];
        if z.cond == ZoneCond::Full || offset != z.wp {
            return Err(Error::EINVAL);
        }
        if offset + buf.len() as u64 > self.zone_end(idx) {
            return Err(Error::ENOSPC);
        }
        let fd = self.file.as_raw_fd();
        let mut written = 0;
        while written < buf.len() {
            let n = pwrite(fd, &buf[written..],
                           (offset + written as u64) as libc::off_t)?;
            if n == 0 {
                return Err(Error::EIO);
            }
            written += n;
        }
        z.wp += buf.len() as u64;
        z.cond = if z.wp == self.zone_end(idx) {
            ZoneCond::Full
        } else {
            ZoneCond::Open
        };
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64, _direct: bool)
        -> Result<usize>
    {
        // The emulation serves direct reads from the same descriptor; the
        // flag matters only on real hardware backends.
        let fd = self.file.as_raw_fd();
        let mut read = 0;
        while read < buf.len() {
            let n = pread(fd, &mut buf[read..],
                          (offset + read as u64) as libc::off_t)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn sync_all(&self) -> Result {
        fsync(self.file.as_raw_fd())?;
        Ok(())
    }
}

// LCOV_EXCL_STOP
