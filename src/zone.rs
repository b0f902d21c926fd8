// vim: tw=80

use crate::{
    types::*,
    zbd::{Zbd, ZoneCond, ZoneReport},
};
use num_traits::ToPrimitive;
use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Which pool a zone belongs to.
///
/// Only Io zones count against the device's active/open caps; Meta zones are
/// the journal's, and Reserved zones are scratch space for the cleaner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZonePool {
    Meta,
    Reserved,
    Io,
}

/// A contiguous run of bytes within one zone, owned by one file.
///
/// `length` counts valid data only; padding written to round the run up to
/// the block size lies between `start + length` and the next extent's start.
/// Immutable after creation, except that the cleaner may replace an extent
/// wholesale with a relocated copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneExtent {
    /// Absolute device byte offset of the first byte
    pub start: u64,
    /// Valid data length in bytes
    pub length: u64,
    /// Id of the hosting zone
    pub zone: ZoneT,
}

/// GC index entry, one per extent, owned by the hosting zone.
///
/// Carries a non-owning file id; resolve the owner through the device's file
/// registry.  `valid` flips true to false exactly once, when the extent dies.
#[derive(Clone, Debug)]
pub struct ExtentInfo {
    pub file_id: FileId,
    pub fname: String,
    pub start: u64,
    pub length: u64,
    pub valid: bool,
    pub lifetime: WriteLifetime,
    pub level: Option<u32>,
}

#[derive(Debug)]
struct ZoneInner {
    /// Absolute byte offset of the next write.  Monotonic between resets.
    wp: u64,
    /// Bytes remaining ahead of the write pointer
    capacity: u64,
    /// Exclusive append token; held by at most one writer at a time
    open_for_write: bool,
    /// Set when the device failed an append.  The zone stays readable but
    /// accepts no further writes until reset.
    faulted: bool,
    lifetime: WriteLifetime,
    /// Running length-weighted mean of the hints of data written here.
    /// Consulted only by GC-time allocation.
    secondary_lifetime: f64,
    extents: Vec<ExtentInfo>,
}

/// One physical zone.
///
/// Between any two atomic steps: `wp - start == max_capacity - capacity`,
/// and the sum of the valid extents' lengths (`used`) never exceeds
/// `wp - start`.  A zone with `used == 0` is safe to reset.
#[derive(Debug)]
pub struct Zone {
    pub zone_id: ZoneT,
    pub start: u64,
    pub max_capacity: u64,
    pub pool: ZonePool,
    /// Sum of the lengths of currently-valid extents hosted here
    used: AtomicU64,
    /// Serializes appends within this zone.  Concurrent appenders indicate
    /// an allocator bug; this trips the assertion.
    is_append: AtomicBool,
    inner: Mutex<ZoneInner>,
}

impl Zone {
    pub fn new(zone_id: ZoneT, report: &ZoneReport, pool: ZonePool) -> Self {
        let inner = ZoneInner {
            wp: report.wp,
            capacity: match report.cond {
                ZoneCond::Full => 0,
                _ => report.capacity,
            },
            open_for_write: false,
            faulted: false,
            lifetime: WriteLifetime::NotSet,
            secondary_lifetime: 0.0,
            extents: Vec::new(),
        };
        Zone {
            zone_id,
            start: report.start,
            max_capacity: report.len,
            pool,
            used: AtomicU64::new(0),
            is_append: AtomicBool::new(false),
            inner: Mutex::new(inner),
        }
    }

    /// Append `buf` at the write pointer.  The caller must hold the zone's
    /// write token and `buf` must be block-granular and fit in the remaining
    /// capacity.
    ///
    /// On success returns the device offset the data landed at.  On a device
    /// error the zone is marked unusable for further appends, but its
    /// existing contents stay readable.
    pub fn append(&self, zbd: &dyn Zbd, buf: &[u8]) -> Result<u64> {
        let already = self.is_append.swap(true, Ordering::Acquire);
        assert!(!already, "concurrent appends to zone {}", self.zone_id);
        let r = self.append_locked(zbd, buf);
        self.is_append.store(false, Ordering::Release);
        r
    }

    fn append_locked(&self, zbd: &dyn Zbd, buf: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.open_for_write,
            "append to zone {} without the write token", self.zone_id);
        if inner.faulted {
            return Err(Error::EIO);
        }
        if buf.len() as u64 > inner.capacity ||
           buf.len() as u64 % zbd.block_size() != 0
        {
            return Err(Error::EINVAL);
        }
        let wp = inner.wp;
        match zbd.write_at(buf, wp) {
            Ok(()) => {
                inner.wp += buf.len() as u64;
                inner.capacity -= buf.len() as u64;
                Ok(wp)
            },
            Err(e) => {
                tracing::warn!(zone = self.zone_id, error = ?e,
                    "append failed; zone faulted");
                inner.faulted = true;
                Err(Error::EIO)
            }
        }
    }

    /// Reset the zone to empty.  Fails with `EBUSY` if it still hosts valid
    /// data or a writer holds its token.
    pub fn reset(&self, zbd: &dyn Zbd) -> Result {
        let mut inner = self.inner.lock().unwrap();
        if self.used.load(Ordering::Acquire) != 0 || inner.open_for_write {
            return Err(Error::EBUSY);
        }
        zbd.reset_zone(self.start)?;
        inner.wp = self.start;
        inner.capacity = self.max_capacity;
        inner.faulted = false;
        inner.lifetime = WriteLifetime::NotSet;
        inner.secondary_lifetime = 0.0;
        inner.extents.clear();
        Ok(())
    }

    /// Force the zone to Full, wasting the unwritten remainder.
    pub fn finish(&self, zbd: &dyn Zbd) -> Result {
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity == 0 {
            return Ok(());
        }
        zbd.finish_zone(self.start)?;
        inner.wp = self.start + self.max_capacity;
        inner.capacity = 0;
        Ok(())
    }

    /// Take the exclusive write token, if the zone can accept appends.
    pub fn claim_write(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.open_for_write || inner.faulted || inner.capacity == 0 {
            false
        } else {
            inner.open_for_write = true;
            true
        }
    }

    /// Release the exclusive write token.
    pub fn release_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.open_for_write);
        inner.open_for_write = false;
    }

    /// Record a freshly written extent in the zone's GC index.
    pub fn push_extent_info(&self, info: ExtentInfo) {
        debug_assert!(info.valid);
        let length = info.length;
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(info.start >= self.start &&
                      info.start + length <= inner.wp);
        inner.extents.push(info);
        drop(inner);
        self.used.fetch_add(length, Ordering::AcqRel);
    }

    /// Flip the matching extent's GC entry to invalid and give back its
    /// bytes.  Returns `ENOENT` if no valid entry matches, which means the
    /// caller's bookkeeping is stale.
    pub fn invalidate(&self, file_id: FileId, extent: &ZoneExtent) -> Result {
        debug_assert_eq!(extent.zone, self.zone_id);
        let mut inner = self.inner.lock().unwrap();
        let info = inner.extents.iter_mut().find(|i| {
            i.valid && i.file_id == file_id && i.start == extent.start
        });
        match info {
            Some(info) => {
                debug_assert_eq!(info.length, extent.length);
                info.valid = false;
                drop(inner);
                self.used.fetch_sub(extent.length, Ordering::AcqRel);
                Ok(())
            },
            None => Err(Error::ENOENT)
        }
    }

    /// Fold a new write's hint into the running weighted mean.
    pub fn update_secondary_lifetime(&self, hint: WriteLifetime, length: u64) {
        let mut inner = self.inner.lock().unwrap();
        let used = self.used.load(Ordering::Acquire) as f64;
        let h = hint.to_u64().unwrap() as f64;
        let l = length as f64;
        inner.secondary_lifetime =
            (inner.secondary_lifetime * used + h * l) / (used + l);
    }

    /// Clone the still-valid GC entries, for the cleaner.
    pub fn valid_extents(&self) -> Vec<ExtentInfo> {
        let inner = self.inner.lock().unwrap();
        inner.extents.iter().filter(|i| i.valid).cloned().collect()
    }

    pub fn set_lifetime(&self, lifetime: WriteLifetime) {
        self.inner.lock().unwrap().lifetime = lifetime;
    }

    pub fn lifetime(&self) -> WriteLifetime {
        self.inner.lock().unwrap().lifetime
    }

    pub fn secondary_lifetime(&self) -> f64 {
        self.inner.lock().unwrap().secondary_lifetime
    }

    pub fn wp(&self) -> u64 {
        self.inner.lock().unwrap().wp
    }

    pub fn capacity(&self) -> u64 {
        self.inner.lock().unwrap().capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes written but no longer live, padding included
    pub fn invalid_bytes(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let written = inner.wp - self.start;
        written - self.used.load(Ordering::Acquire).min(written)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().wp == self.start
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().capacity == 0
    }

    pub fn is_open_for_write(&self) -> bool {
        self.inner.lock().unwrap().open_for_write
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.lock().unwrap().faulted
    }
}

// LCOV_EXCL_STOP
