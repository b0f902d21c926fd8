// vim: tw=80

use crate::types::*;
#[cfg(test)] use mockall::automock;

/// What a zone is for, as reported by the device.
///
/// Metadata zones host the superblock and the metadata journal; data zones
/// host file extents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneType {
    Data,
    Meta,
}

/// A zone's condition, as reported by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneCond {
    /// Nothing written since the last reset
    Empty,
    /// Partially written; the write pointer is valid
    Open,
    /// No further writes are possible until the zone is reset
    Full,
}

/// One entry of a device zone report.
#[derive(Clone, Copy, Debug)]
pub struct ZoneReport {
    /// Device byte offset of the first byte of the zone
    pub start: u64,
    /// Address span of the zone in bytes
    pub len: u64,
    /// Bytes still writable ahead of the write pointer
    pub capacity: u64,
    /// Absolute byte offset of the next legal write
    pub wp: u64,
    pub cond: ZoneCond,
    pub ztype: ZoneType,
}

/// The raw zoned block device.
///
/// This is the narrow syscall surface the file system consumes.  Writes
/// succeed only at the current write pointer of the containing zone and
/// advance it by exactly the bytes submitted.  Whole zones are reclaimed with
/// `reset_zone`; there is no other way to free space.
///
/// All lengths and the write offset must be multiples of `block_size`.
#[cfg_attr(test, automock)]
pub trait Zbd: Send + Sync {
    /// The device's minimum write granule in bytes
    fn block_size(&self) -> u64;

    /// Address span of every zone.  Zones are uniformly sized.
    fn zone_size(&self) -> u64;

    /// Total number of zones on the device
    fn nr_zones(&self) -> ZoneT;

    /// Enumerate all zones in address order
    fn report_zones(&self) -> Result<Vec<ZoneReport>>;

    /// Explicitly open the zone beginning at `start` for writing
    fn open_zone(&self, start: u64) -> Result;

    /// Close an explicitly opened zone
    fn close_zone(&self, start: u64) -> Result;

    /// Transition the zone to Full, wasting any unwritten capacity
    fn finish_zone(&self, start: u64) -> Result;

    /// Return the zone to Empty, discarding its contents
    fn reset_zone(&self, start: u64) -> Result;

    /// Write `buf` at `offset`, which must equal the containing zone's write
    /// pointer.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result;

    /// Read into `buf` from `offset`.  `direct` bypasses the host page cache
    /// where the backend supports it.
    fn read_at(&self, buf: &mut [u8], offset: u64, direct: bool)
        -> Result<usize>;

    /// Ensure all completed writes have reached stable media
    fn sync_all(&self) -> Result;
}
