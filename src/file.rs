// vim: tw=80

use crate::{
    device::ZonedDevice,
    types::*,
    util::*,
    zone::{ExtentInfo, ZoneExtent},
};
use num_traits::{FromPrimitive, ToPrimitive};
use std::{
    cmp,
    sync::{
        Mutex, RwLock, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

// Metadata record field tags.  The record is a flat sequence of
// (tag, length, value) tuples; all three are varint-framed.  Unknown tags are
// rejected, so adding one is a format revision.
const TAG_FILE_ID: u64      = 1;
const TAG_FILENAME: u64     = 2;
const TAG_LIFETIME: u64     = 3;
const TAG_LEVEL: u64        = 4;
const TAG_SMALLEST_KEY: u64 = 5;
const TAG_LARGEST_KEY: u64  = 6;
const TAG_IS_SST: u64       = 7;
const TAG_EXTENT: u64       = 8;

/// Interface for persisting a file's metadata record.
///
/// The journal behind this is totally ordered and the record must be durable
/// when `persist` returns; the cleaner relies on that ordering to reset a
/// source zone only after the records naming the relocated extents are safe.
pub trait MetadataWriter: Send + Sync {
    fn persist(&self, dev: &ZonedDevice, file: &ZoneFile) -> Result;
}

/// Engine-supplied attributes of a file.  For sorted tables the key range
/// and level feed the allocator's placement policy.
#[derive(Clone, Debug, Default)]
pub struct FileAttrs {
    pub lifetime: WriteLifetime,
    pub level: Option<u32>,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub is_sst: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FileInner {
    /// Ordered extent list.  The i-th extent covers logical bytes
    /// [sum of lengths before i, plus its own length).
    pub extents: Vec<ZoneExtent>,
    /// Sum of extent lengths
    pub size: u64,
    /// Length of the extent prefix already persisted to the journal
    pub synced_extents: usize,
}

/// A write staged for the next drain, padded out to the block size.
/// `valid` counts the logical bytes; the tail padding lands on media but is
/// not part of the file.
struct WriteBuffer {
    data: IoVec,
    valid: usize,
}

impl WriteBuffer {
    fn new(data: &[u8], valid: usize, block_sz: u64) -> Self {
        debug_assert!(valid <= data.len());
        let padded = roundup(data.len() as u64, block_sz) as usize;
        let mut v = Vec::with_capacity(padded);
        v.extend_from_slice(data);
        v.resize(padded, 0);
        let dbs = divbuf::DivBufShared::from(v);
        WriteBuffer { data: dbs.try_const().unwrap(), valid }
    }
}

#[derive(Default)]
struct ActiveState {
    /// Zone currently held for appends, if any
    zone: Option<ZoneT>,
    /// Buffers staged but not yet written
    pending: Vec<WriteBuffer>,
}

/// One logical file: physically an ordered list of extents, logically a
/// byte-addressable append-only stream.
pub struct ZoneFile {
    file_id: FileId,
    /// Device generation, for `unique_id`.  Stable across cleaning.
    gen: u32,
    filename: Mutex<String>,
    attrs: Mutex<FileAttrs>,
    inner: RwLock<FileInner>,
    active: Mutex<ActiveState>,
    is_appending: AtomicBool,
    marked_for_del: AtomicBool,
}

impl ZoneFile {
    pub(crate) fn new(file_id: FileId, gen: u32, filename: String) -> Self {
        ZoneFile {
            file_id,
            gen,
            filename: Mutex::new(filename),
            attrs: Mutex::new(FileAttrs::default()),
            inner: RwLock::new(FileInner::default()),
            active: Mutex::new(ActiveState::default()),
            is_appending: AtomicBool::new(false),
            marked_for_del: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> FileId {
        self.file_id
    }

    pub fn filename(&self) -> String {
        self.filename.lock().unwrap().clone()
    }

    pub fn rename(&self, name: String) {
        *self.filename.lock().unwrap() = name;
    }

    pub fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    pub fn extents(&self) -> Vec<ZoneExtent> {
        self.inner.read().unwrap().extents.clone()
    }

    pub fn synced_extents(&self) -> usize {
        self.inner.read().unwrap().synced_extents
    }

    pub fn attrs(&self) -> FileAttrs {
        self.attrs.lock().unwrap().clone()
    }

    pub fn set_lifetime(&self, lifetime: WriteLifetime) {
        self.attrs.lock().unwrap().lifetime = lifetime;
    }

    /// Declare this file a sorted table with the given key range and level.
    /// The allocator uses these to co-locate tables that will die together.
    pub fn set_key_range(&self, smallest: &[u8], largest: &[u8], level: u32) {
        let mut attrs = self.attrs.lock().unwrap();
        attrs.smallest_key = smallest.to_vec();
        attrs.largest_key = largest.to_vec();
        attrs.level = Some(level);
        attrs.is_sst = true;
    }

    pub fn is_appending(&self) -> bool {
        self.is_appending.load(Ordering::Acquire)
    }

    pub(crate) fn set_appending(&self, v: bool) {
        self.is_appending.store(v, Ordering::Release);
    }

    pub fn is_marked_for_del(&self) -> bool {
        self.marked_for_del.load(Ordering::Acquire)
    }

    pub(crate) fn mark_for_del(&self) {
        self.marked_for_del.store(true, Ordering::Release);
    }

    pub(crate) fn write_extents(&self) -> RwLockWriteGuard<FileInner> {
        self.inner.write().unwrap()
    }

    /// Encode `(generation, file_id)` into `out`.  Returns the number of
    /// bytes written, or 0 if `out` is too small.  At most 16 bytes.
    pub fn unique_id(&self, out: &mut [u8]) -> usize {
        let mut v = Vec::with_capacity(16);
        put_varint64(&mut v, u64::from(self.gen));
        put_varint64(&mut v, self.file_id.0);
        if out.len() < v.len() {
            0
        } else {
            out[..v.len()].copy_from_slice(&v);
            v.len()
        }
    }

    /// Stage `data` for a later drain without writing anything yet.  Lets a
    /// table builder accumulate a whole file and flush it in one pass on
    /// sync or close.
    pub fn buffer_write(&self, dev: &ZonedDevice, data: &[u8], valid: usize)
        -> Result
    {
        if valid > data.len() {
            return Err(Error::EINVAL);
        }
        let wb = WriteBuffer::new(data, valid, dev.block_size());
        self.active.lock().unwrap().pending.push(wb);
        Ok(())
    }

    /// Stage `data` and immediately drain all pending buffers to the device.
    ///
    /// `valid` of the `data.len()` staged bytes count toward the file size;
    /// the block-alignment padding lands on media but is dead on arrival.
    /// Fails with `ENOSPC` if no zone can be allocated.
    pub fn append(&self, dev: &ZonedDevice, data: &[u8], valid: usize)
        -> Result
    {
        self.buffer_write(dev, data, valid)?;
        self.append_buffer(dev)
    }

    /// Drain pending buffers, allocating zones as needed and recording one
    /// extent per contiguous run written.
    pub fn append_buffer(&self, dev: &ZonedDevice) -> Result {
        let mut act = self.active.lock().unwrap();
        while !act.pending.is_empty() {
            let wb = act.pending.remove(0);
            self.append_one(dev, &mut act, wb)?;
        }
        Ok(())
    }

    /// Write one staged buffer, splitting it across zones if the active zone
    /// fills mid-way.
    fn append_one(&self, dev: &ZonedDevice, act: &mut ActiveState,
                  wb: WriteBuffer) -> Result
    {
        let mut data = wb.data;
        let mut valid_left = wb.valid as u64;
        while !data.is_empty() {
            let mut fresh = false;
            let zone = match act.zone {
                Some(id) => dev.zone(id).clone(),
                None => {
                    let attrs = self.attrs();
                    let z = dev.allocate_zone(
                        attrs.lifetime,
                        &attrs.smallest_key,
                        &attrs.largest_key,
                        attrs.level)?;
                    act.zone = Some(z.zone_id);
                    fresh = true;
                    z
                },
            };
            let cap = zone.capacity();
            // A buffer that would spill over the carried-over zone's tail
            // but fits in one zone moves wholesale; splitting is for
            // buffers bigger than any zone
            let whole_zone = data.len() as u64 <= zone.max_capacity;
            if cap == 0 || (!fresh && cap < data.len() as u64 && whole_zone) {
                dev.release_zone(&zone);
                act.zone = None;
                continue;
            }
            let n = cmp::min(cap, data.len() as u64);
            let chunk = data.split_to(n as usize);
            let wp_before = match zone.append(dev.zbd(), &chunk[..]) {
                Ok(off) => off,
                Err(e) => {
                    // The zone is faulted; give it up.  Extents recorded so
                    // far remain valid and readable.
                    dev.release_zone(&zone);
                    act.zone = None;
                    return Err(e);
                },
            };
            let chunk_valid = cmp::min(valid_left, n);
            valid_left -= chunk_valid;
            if chunk_valid > 0 {
                let attrs = self.attrs();
                zone.update_secondary_lifetime(attrs.lifetime, chunk_valid);
                zone.push_extent_info(ExtentInfo {
                    file_id: self.file_id,
                    fname: self.filename(),
                    start: wp_before,
                    length: chunk_valid,
                    valid: true,
                    lifetime: attrs.lifetime,
                    level: attrs.level,
                });
                self.push_extent(ZoneExtent {
                    start: wp_before,
                    length: chunk_valid,
                    zone: zone.zone_id,
                });
                dev.note_extent(self.file_id, attrs.is_sst, &zone, n);
            }
            if zone.capacity() == 0 {
                dev.notify_zone_full();
                dev.release_zone(&zone);
                act.zone = None;
            }
        }
        Ok(())
    }

    /// Atomically record a completed extent in the file's logical space.
    fn push_extent(&self, extent: ZoneExtent) {
        let mut inner = self.inner.write().unwrap();
        inner.size += extent.length;
        inner.extents.push(extent);
    }

    /// Finish writing: drain anything staged, then give the active zone
    /// back.
    pub fn close_wr(&self, dev: &ZonedDevice) -> Result {
        let r = self.append_buffer(dev);
        let taken = self.active.lock().unwrap().zone.take();
        if let Some(zid) = taken {
            let zone = dev.zone(zid).clone();
            dev.maybe_finish_active(&zone)?;
            dev.release_zone(&zone);
        }
        self.set_appending(false);
        // swap makes the reap exactly-once even if close is retried
        if self.marked_for_del.swap(false, Ordering::AcqRel) {
            dev.reap_deleted(self);
        }
        r
    }

    /// Read up to `buf.len()` bytes at logical `offset`.  Returns the byte
    /// count actually read, which is short only at end of file.
    pub fn positioned_read(&self, dev: &ZonedDevice, offset: u64,
                           buf: &mut [u8], direct: bool) -> Result<usize>
    {
        let inner = self.inner.read().unwrap();
        if offset >= inner.size {
            return Ok(0);
        }
        let want = cmp::min(buf.len() as u64, inner.size - offset) as usize;
        let mut done = 0;
        let mut off = offset;
        let mut logical = 0u64;
        for e in &inner.extents {
            let end = logical + e.length;
            if off < end && done < want {
                let within = off - logical;
                let n = cmp::min((e.length - within) as usize, want - done);
                let devoff = e.start + within;
                let got = dev.zbd()
                    .read_at(&mut buf[done..done + n], devoff, direct)?;
                if got < n {
                    // A hole inside a recorded extent is a device problem
                    return Err(Error::EIO);
                }
                done += n;
                off += n as u64;
            }
            logical = end;
            if done == want {
                break;
            }
        }
        Ok(done)
    }

    /// Write a self-describing metadata record covering the extents from
    /// `first_extent` on, plus the file attributes.
    fn encode_to(&self, dev: &ZonedDevice, out: &mut Vec<u8>,
                 first_extent: usize)
    {
        let mut scratch = Vec::new();
        put_varint64(&mut scratch, self.file_id.0);
        put_field(out, TAG_FILE_ID, &scratch);
        put_field(out, TAG_FILENAME, self.filename().as_bytes());

        let attrs = self.attrs();
        put_field(out, TAG_LIFETIME,
                  &[attrs.lifetime.to_u8().unwrap()]);
        if let Some(level) = attrs.level {
            scratch.clear();
            put_varint64(&mut scratch, u64::from(level));
            put_field(out, TAG_LEVEL, &scratch);
        }
        if !attrs.smallest_key.is_empty() {
            put_field(out, TAG_SMALLEST_KEY, &attrs.smallest_key);
        }
        if !attrs.largest_key.is_empty() {
            put_field(out, TAG_LARGEST_KEY, &attrs.largest_key);
        }
        put_field(out, TAG_IS_SST, &[u8::from(attrs.is_sst)]);

        let inner = self.inner.read().unwrap();
        for e in inner.extents.iter().skip(first_extent) {
            // Offsets are zone-relative so that zone relocation remains
            // possible in principle
            let zstart = dev.zone(e.zone).start;
            scratch.clear();
            put_varint64(&mut scratch, u64::from(e.zone));
            put_varint64(&mut scratch, e.start - zstart);
            put_varint64(&mut scratch, e.length);
            put_field(out, TAG_EXTENT, &scratch);
        }
    }

    /// Incremental record: extents not yet absorbed by the journal.
    pub fn encode_update_to(&self, dev: &ZonedDevice, out: &mut Vec<u8>) {
        let synced = self.inner.read().unwrap().synced_extents;
        self.encode_to(dev, out, synced)
    }

    /// Full record: every extent, for snapshots and post-GC persists.
    pub fn encode_snapshot_to(&self, dev: &ZonedDevice, out: &mut Vec<u8>) {
        self.encode_to(dev, out, 0)
    }

    /// Note that the journal has durably absorbed everything encoded so far.
    pub fn metadata_synced(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.synced_extents = inner.extents.len();
    }

    /// Inverse of `encode_to`.  Zone references resolve through the device
    /// registry; a record naming an unknown zone or lying outside its write
    /// pointer is corrupt.
    pub fn decode_from(dev: &ZonedDevice, input: &mut &[u8])
        -> Result<ZoneFile>
    {
        let mut file_id = None;
        let mut filename = None;
        let mut attrs = FileAttrs::default();
        let mut extents = Vec::new();
        let mut size = 0;
        while !input.is_empty() {
            let tag = get_varint64(input)?;
            let len = get_varint64(input)? as usize;
            if len > input.len() {
                return Err(Error::EINTEGRITY);
            }
            let (mut value, rest) = input.split_at(len);
            *input = rest;
            match tag {
                TAG_FILE_ID => {
                    file_id = Some(FileId(get_varint64(&mut value)?));
                },
                TAG_FILENAME => {
                    let s = String::from_utf8(value.to_vec())
                        .map_err(|_| Error::EINTEGRITY)?;
                    filename = Some(s);
                },
                TAG_LIFETIME => {
                    if value.len() != 1 {
                        return Err(Error::EINTEGRITY);
                    }
                    attrs.lifetime = WriteLifetime::from_u8(value[0])
                        .ok_or(Error::EINTEGRITY)?;
                },
                TAG_LEVEL => {
                    let level = get_varint64(&mut value)?;
                    attrs.level = Some(
                        u32::try_from(level).map_err(|_| Error::EINTEGRITY)?
                    );
                },
                TAG_SMALLEST_KEY => attrs.smallest_key = value.to_vec(),
                TAG_LARGEST_KEY => attrs.largest_key = value.to_vec(),
                TAG_IS_SST => {
                    if value.len() != 1 || value[0] > 1 {
                        return Err(Error::EINTEGRITY);
                    }
                    attrs.is_sst = value[0] == 1;
                },
                TAG_EXTENT => {
                    let zone_id = get_varint64(&mut value)?;
                    let rel = get_varint64(&mut value)?;
                    let length = get_varint64(&mut value)?;
                    let zone_id = ZoneT::try_from(zone_id)
                        .map_err(|_| Error::EINTEGRITY)?;
                    let zone = dev.checked_zone(zone_id)
                        .ok_or(Error::EINTEGRITY)?;
                    let start = zone.start + rel;
                    if start + length > zone.wp() {
                        return Err(Error::EINTEGRITY);
                    }
                    size += length;
                    extents.push(ZoneExtent { start, length,
                                              zone: zone_id });
                },
                _ => return Err(Error::EINTEGRITY),
            }
        }
        let file_id = file_id.ok_or(Error::EINTEGRITY)?;
        let filename = filename.ok_or(Error::EINTEGRITY)?;
        let nextents = extents.len();
        let file = ZoneFile::new(file_id, dev.generation(), filename);
        *file.attrs.lock().unwrap() = attrs;
        *file.inner.write().unwrap() = FileInner {
            extents,
            size,
            synced_extents: nextents,
        };
        Ok(file)
    }

    /// Reconcile an incremental update read from the journal with this file.
    /// The update's extents continue this file's synced prefix.  Returns the
    /// extents appended, so the caller can index them in their zones.
    pub fn merge_update(&self, update: ZoneFile) -> Result<Vec<ZoneExtent>> {
        if update.file_id != self.file_id {
            return Err(Error::EINTEGRITY);
        }
        let upd_inner = update.inner.into_inner().unwrap();
        let upd_attrs = update.attrs.into_inner().unwrap();
        let upd_name = update.filename.into_inner().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.extents.len() != inner.synced_extents {
            // Updates may only continue a fully synced extent list
            return Err(Error::EINVAL);
        }
        for e in &upd_inner.extents {
            inner.size += e.length;
            inner.extents.push(*e);
        }
        inner.synced_extents = inner.extents.len();
        drop(inner);
        *self.filename.lock().unwrap() = upd_name;
        *self.attrs.lock().unwrap() = upd_attrs;
        Ok(upd_inner.extents)
    }

}

impl std::fmt::Debug for ZoneFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ZoneFile")
            .field("file_id", &self.file_id)
            .field("filename", &self.filename())
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

fn put_field(out: &mut Vec<u8>, tag: u64, value: &[u8]) {
    put_varint64(out, tag);
    put_varint64(out, value.len() as u64);
    out.extend_from_slice(value);
}

// LCOV_EXCL_STOP
