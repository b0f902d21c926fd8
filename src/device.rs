// vim: tw=80

use crate::{
    file::{FileInner, MetadataWriter, ZoneFile},
    label::Label,
    types::*,
    util::*,
    zbd::Zbd,
    zone::{ExtentInfo, Zone, ZoneExtent, ZonePool},
};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BTreeSet, BinaryHeap},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

/// Knobs fixed at format time.
#[derive(Clone, Copy, Debug)]
pub struct DeviceOptions {
    /// Zones at the front of the address space given to the superblock and
    /// the metadata journal
    pub meta_zones: ZoneT,
    /// Zones after the metadata zones kept back as cleaner scratch space
    pub reserved_zones: ZoneT,
    /// Device cap on concurrently active (written, unfinished) zones
    pub max_active: u32,
    /// Device cap on concurrently open (write token held) zones
    pub max_open: u32,
    /// Finish a zone on close once less than this percentage of its
    /// capacity remains.  0 disables early finishing.
    pub finish_threshold: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            meta_zones: 3,
            reserved_zones: 2,
            max_active: 10,
            max_open: 10,
            finish_threshold: 0,
        }
    }
}

/// Entry in the cleaner's victim queue.  Most invalid bytes first.
#[derive(Debug, Eq, PartialEq)]
struct GcVictim {
    zone: ZoneT,
    invalid_bytes: u64,
}

impl Ord for GcVictim {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.invalid_bytes.cmp(&other.invalid_bytes)
            .then_with(|| other.zone.cmp(&self.zone))
    }
}

impl PartialOrd for GcVictim {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Entry in the GC-time allocation queue.  Fewest valid bytes first; ties go
/// to the zone with more invalid bytes.
#[derive(Debug, Eq, PartialEq)]
struct AllocVictim {
    zone: ZoneT,
    valid_bytes: u64,
    invalid_bytes: u64,
}

impl Ord for AllocVictim {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.valid_bytes.cmp(&self.valid_bytes)
            .then(self.invalid_bytes.cmp(&other.invalid_bytes))
            .then_with(|| other.zone.cmp(&self.zone))
    }
}

impl PartialOrd for AllocVictim {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct ZoneResources {
    /// Zones in the written-but-unfinished state
    active: u32,
    /// Write tokens outstanding
    open: u32,
}

/// Outcome of one allocation policy evaluation
enum Pick {
    /// A zone was claimed.  The flag records whether it was empty, which
    /// costs an active slot.
    Zone(Arc<Zone>, bool),
    /// A suitable zone exists but is held or gated by the caps; wait
    Busy,
    /// Nothing can ever satisfy this request
    NoSpace,
}

/// The pool of zones, the file registry, and the allocation and reclamation
/// machinery.  One per device; explicitly threaded through the system.
pub struct ZonedDevice {
    zbd: Arc<dyn Zbd>,
    block_sz: u64,
    uuid: Uuid,
    generation: u32,
    /// All zones, dense by id
    zones: Vec<Arc<Zone>>,
    meta_zones: Vec<Arc<Zone>>,
    reserved_zones: Vec<Arc<Zone>>,
    io_zones: Vec<Arc<Zone>>,
    /// Serializes allocation policy evaluation.  Never held across a device
    /// write.
    io_zones_mtx: Mutex<()>,
    resources: Mutex<ZoneResources>,
    resources_cv: Condvar,
    max_active: u32,
    max_open: u32,
    finish_threshold: u32,
    tracker_exit: AtomicBool,
    files: Mutex<BTreeMap<FileId, Arc<ZoneFile>>>,
    /// Deleted while still appending; reaped on close
    del_pending: Mutex<Vec<Arc<ZoneFile>>>,
    /// Which zones host extents of which sorted table
    sst_to_zone: Mutex<BTreeMap<FileId, Vec<ZoneT>>>,
    gc_queue: Mutex<BinaryHeap<GcVictim>>,
    allocate_queue: Mutex<BinaryHeap<AllocVictim>>,
    /// Serializes cleaning passes
    zone_cleaning_mtx: Mutex<()>,
    next_file_id: AtomicU64,
    meta_rr: AtomicUsize,
    wr_data: AtomicU64,
    last_wr_data: AtomicU64,
    nr_resets: AtomicU64,
    nr_cleanings: AtomicU64,
}

impl ZonedDevice {
    /// Initialize the device: reset every zone and stamp a fresh superblock
    /// into the first metadata zone.
    pub fn format(zbd: &Arc<dyn Zbd>, opts: &DeviceOptions) -> Result<Uuid> {
        if opts.meta_zones < 1 ||
           zbd.nr_zones() <= opts.meta_zones + opts.reserved_zones
        {
            return Err(Error::EINVAL);
        }
        for report in zbd.report_zones()? {
            zbd.reset_zone(report.start)?;
        }
        let label = Label {
            uuid: Uuid::new_v4(),
            generation: 1,
            block_sz: zbd.block_size(),
            zone_sz: zbd.zone_size(),
            nr_zones: zbd.nr_zones(),
            meta_zones: opts.meta_zones,
            reserved_zones: opts.reserved_zones,
            max_active: opts.max_active,
            max_open: opts.max_open,
            finish_threshold: opts.finish_threshold,
        };
        let block = crate::label::write_label(&label, zbd.block_size())?;
        zbd.write_at(&block, 0)?;
        zbd.sync_all()?;
        Ok(label.uuid)
    }

    /// Open a formatted device, validating its superblock.
    pub fn open(zbd: Arc<dyn Zbd>) -> Result<Arc<Self>> {
        let mut buf = vec![0u8; zbd.block_size() as usize];
        zbd.read_at(&mut buf, 0, false)?;
        let label = crate::label::read_label(&buf)?;
        if label.block_sz != zbd.block_size() ||
           label.zone_sz != zbd.zone_size() ||
           label.nr_zones != zbd.nr_zones()
        {
            return Err(Error::EINVAL);
        }
        let opts = DeviceOptions {
            meta_zones: label.meta_zones,
            reserved_zones: label.reserved_zones,
            max_active: label.max_active,
            max_open: label.max_open,
            finish_threshold: label.finish_threshold,
        };
        Self::build(zbd, opts, label.uuid, label.generation)
    }

    /// Open a device whose geometry is known out of band, skipping the
    /// superblock.  Identity is fresh, so `unique_id`s are not stable across
    /// reopen; prefer `format` + `open` for that.
    pub fn open_with(zbd: Arc<dyn Zbd>, opts: DeviceOptions)
        -> Result<Arc<Self>>
    {
        Self::build(zbd, opts, Uuid::new_v4(), 1)
    }

    fn build(zbd: Arc<dyn Zbd>, opts: DeviceOptions, uuid: Uuid,
             generation: u32) -> Result<Arc<Self>>
    {
        if zbd.nr_zones() <= opts.meta_zones + opts.reserved_zones {
            return Err(Error::EINVAL);
        }
        let reports = zbd.report_zones()?;
        let zones = reports.iter().enumerate().map(|(i, report)| {
            let id = i as ZoneT;
            let pool = if id < opts.meta_zones {
                ZonePool::Meta
            } else if id < opts.meta_zones + opts.reserved_zones {
                ZonePool::Reserved
            } else {
                ZonePool::Io
            };
            Arc::new(Zone::new(id, report, pool))
        }).collect::<Vec<_>>();
        let meta_zones = zones.iter()
            .filter(|z| z.pool == ZonePool::Meta)
            .cloned()
            .collect::<Vec<_>>();
        let reserved_zones = zones.iter()
            .filter(|z| z.pool == ZonePool::Reserved)
            .cloned()
            .collect::<Vec<_>>();
        let io_zones = zones.iter()
            .filter(|z| z.pool == ZonePool::Io)
            .cloned()
            .collect::<Vec<_>>();
        let active = io_zones.iter()
            .filter(|z| !z.is_empty() && !z.is_full())
            .count() as u32;
        let block_sz = zbd.block_size();
        Ok(Arc::new(ZonedDevice {
            zbd,
            block_sz,
            uuid,
            generation,
            zones,
            meta_zones,
            reserved_zones,
            io_zones,
            io_zones_mtx: Mutex::new(()),
            resources: Mutex::new(ZoneResources { active, open: 0 }),
            resources_cv: Condvar::new(),
            max_active: opts.max_active,
            max_open: opts.max_open,
            finish_threshold: opts.finish_threshold,
            tracker_exit: AtomicBool::new(false),
            files: Mutex::new(BTreeMap::new()),
            del_pending: Mutex::new(Vec::new()),
            sst_to_zone: Mutex::new(BTreeMap::new()),
            gc_queue: Mutex::new(BinaryHeap::new()),
            allocate_queue: Mutex::new(BinaryHeap::new()),
            zone_cleaning_mtx: Mutex::new(()),
            next_file_id: AtomicU64::new(1),
            meta_rr: AtomicUsize::new(0),
            wr_data: AtomicU64::new(0),
            last_wr_data: AtomicU64::new(0),
            nr_resets: AtomicU64::new(0),
            nr_cleanings: AtomicU64::new(0),
        }))
    }

    pub fn block_size(&self) -> u64 {
        self.block_sz
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    pub fn meta_zones(&self) -> &[Arc<Zone>] {
        &self.meta_zones
    }

    pub fn reserved_zones(&self) -> &[Arc<Zone>] {
        &self.reserved_zones
    }

    pub(crate) fn zbd(&self) -> &dyn Zbd {
        &*self.zbd
    }

    pub(crate) fn zone(&self, id: ZoneT) -> &Arc<Zone> {
        &self.zones[id as usize]
    }

    pub(crate) fn checked_zone(&self, id: ZoneT) -> Option<&Arc<Zone>> {
        self.zones.get(id as usize)
    }

    /// Stop admitting new work.  Blocked allocators fail with `ESHUTDOWN`;
    /// the cleaner exits between victims.
    pub fn shutdown(&self) {
        self.tracker_exit.store(true, Ordering::Release);
        let _r = self.resources.lock().unwrap();
        self.resources_cv.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.tracker_exit.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // File registry
    // ------------------------------------------------------------------

    pub fn create_file(&self, filename: &str) -> Result<Arc<ZoneFile>> {
        let mut files = self.files.lock().unwrap();
        if files.values().any(|f| f.filename() == filename) {
            return Err(Error::EEXIST);
        }
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::AcqRel));
        let file = Arc::new(ZoneFile::new(id, self.generation,
                                          filename.to_string()));
        files.insert(id, file.clone());
        Ok(file)
    }

    pub fn file(&self, id: FileId) -> Option<Arc<ZoneFile>> {
        self.files.lock().unwrap().get(&id).cloned()
    }

    pub fn lookup_file(&self, filename: &str) -> Option<Arc<ZoneFile>> {
        self.files.lock().unwrap()
            .values()
            .find(|f| f.filename() == filename)
            .cloned()
    }

    pub fn rename_file(&self, from: &str, to: &str) -> Result {
        let files = self.files.lock().unwrap();
        if files.values().any(|f| f.filename() == to) {
            return Err(Error::EEXIST);
        }
        let file = files.values()
            .find(|f| f.filename() == from)
            .ok_or(Error::ENOENT)?;
        file.rename(to.to_string());
        Ok(())
    }

    /// Delete a file, invalidating every extent it owns.  A file still being
    /// appended to is only marked; its space comes back when the writer
    /// closes.
    pub fn delete_file(&self, filename: &str) -> Result {
        let file = {
            let mut files = self.files.lock().unwrap();
            let id = files.values()
                .find(|f| f.filename() == filename)
                .map(|f| f.id())
                .ok_or(Error::ENOENT)?;
            files.remove(&id).unwrap()
        };
        if file.is_appending() {
            file.mark_for_del();
            self.del_pending.lock().unwrap().push(file);
        } else {
            self.invalidate_file(&file);
        }
        Ok(())
    }

    /// Invalidate a marked file once its writer has closed.
    pub(crate) fn reap_deleted(&self, file: &ZoneFile) {
        self.invalidate_file(file);
        self.del_pending.lock().unwrap().retain(|f| f.id() != file.id());
    }

    fn invalidate_file(&self, file: &ZoneFile) {
        let extents = file.extents();
        let mut touched = BTreeSet::new();
        for e in &extents {
            let zone = self.zone(e.zone);
            // ENOENT here means the extent was already dropped, which only
            // the cleaner does, and it holds the file's extent lock
            zone.invalidate(file.id(), e).unwrap_or_else(Error::unhandled);
            touched.insert(e.zone);
        }
        for zid in touched {
            self.note_invalidation(self.zone(zid));
        }
        self.sst_to_zone.lock().unwrap().remove(&file.id());
    }

    /// Feed the GC queues after a zone lost live data.
    fn note_invalidation(&self, zone: &Arc<Zone>) {
        let invalid = zone.invalid_bytes();
        self.gc_queue.lock().unwrap().push(GcVictim {
            zone: zone.zone_id,
            invalid_bytes: invalid,
        });
        if zone.capacity() >= self.block_sz && !zone.is_faulted() {
            self.allocate_queue.lock().unwrap().push(AllocVictim {
                zone: zone.zone_id,
                valid_bytes: zone.used(),
                invalid_bytes: invalid,
            });
        }
    }

    /// Apply one journal record during replay: create or update the named
    /// file and index its extents in their zones.
    ///
    /// Records must be applied in journal order; an update record continues
    /// the extent list its predecessors built.
    pub fn replay_record(&self, input: &mut &[u8]) -> Result<Arc<ZoneFile>> {
        let decoded = ZoneFile::decode_from(self, input)?;
        let id = decoded.id();
        let existing = self.files.lock().unwrap().get(&id).cloned();
        let file = match existing {
            Some(f) => {
                let appended = f.merge_update(decoded)?;
                self.index_recovered_extents(&f, &appended);
                f
            },
            None => {
                let extents = decoded.extents();
                let f = Arc::new(decoded);
                self.files.lock().unwrap().insert(id, f.clone());
                // File ids are never reused, even across restarts
                self.next_file_id.fetch_max(id.0 + 1, Ordering::AcqRel);
                self.index_recovered_extents(&f, &extents);
                f
            },
        };
        Ok(file)
    }

    fn index_recovered_extents(&self, file: &Arc<ZoneFile>,
                               extents: &[ZoneExtent])
    {
        let attrs = file.attrs();
        for e in extents {
            let zone = self.zone(e.zone);
            zone.push_extent_info(ExtentInfo {
                file_id: file.id(),
                fname: file.filename(),
                start: e.start,
                length: e.length,
                valid: true,
                lifetime: attrs.lifetime,
                level: attrs.level,
            });
            self.note_extent(file.id(), attrs.is_sst, zone, 0);
        }
    }

    /// Bookkeeping for a freshly recorded extent.
    pub(crate) fn note_extent(&self, file_id: FileId, is_sst: bool,
                              zone: &Zone, written: u64)
    {
        self.wr_data.fetch_add(written, Ordering::Relaxed);
        if is_sst {
            let mut s2z = self.sst_to_zone.lock().unwrap();
            let zones = s2z.entry(file_id).or_default();
            if !zones.contains(&zone.zone_id) {
                zones.push(zone.zone_id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Choose and claim a writable zone for new data.
    ///
    /// The policy prefers, in order: a zone already hosting same-level
    /// tables whose key range overlaps; a zone hosting any table of the same
    /// level; the lowest-numbered empty zone; any open zone with the same
    /// lifetime hint.  If a suitable zone exists but is held or gated by the
    /// device caps, block until a zone closes, finishes, or resets.
    pub fn allocate_zone(&self, lifetime: WriteLifetime, smallest: &[u8],
                         largest: &[u8], level: Option<u32>)
        -> Result<Arc<Zone>>
    {
        let mut r = self.resources.lock().unwrap();
        loop {
            if self.tracker_exit.load(Ordering::Acquire) {
                return Err(Error::ESHUTDOWN);
            }
            match self.pick_zone(&r, lifetime, smallest, largest, level) {
                Pick::Zone(zone, was_empty) => {
                    if was_empty {
                        if let Err(e) = self.zbd.open_zone(zone.start) {
                            zone.release_write();
                            return Err(e);
                        }
                        r.active += 1;
                    }
                    r.open += 1;
                    return Ok(zone);
                },
                Pick::Busy => {
                    r = self.resources_cv.wait(r).unwrap();
                },
                Pick::NoSpace => return Err(Error::ENOSPC),
            }
        }
    }

    /// One evaluation of the five-step policy.  Called with the resource
    /// lock held; claims the returned zone's write token but leaves the
    /// counters to the caller.
    fn pick_zone(&self, r: &MutexGuard<ZoneResources>,
                 lifetime: WriteLifetime, smallest: &[u8], largest: &[u8],
                 level: Option<u32>) -> Pick
    {
        let _policy = self.io_zones_mtx.lock().unwrap();
        let can_open = r.open < self.max_open;
        let mut busy = false;

        if let Some(level) = level {
            // Step 1: zones hosting same-level tables with overlapping keys
            let fids = self.adjacent_file_list(smallest, largest, level);
            if let Some(z) = self.claim_affine(&fids, lifetime, can_open,
                                               &mut busy)
            {
                return Pick::Zone(z, false);
            }
            // Step 2: zones hosting any same-level table
            let fids = self.same_level_file_list(level);
            if let Some(z) = self.claim_affine(&fids, lifetime, can_open,
                                               &mut busy)
            {
                return Pick::Zone(z, false);
            }
        }

        // Step 3: the lowest-numbered empty zone
        let empty = self.io_zones.iter().find(|z| {
            z.is_empty() && !z.is_open_for_write() && !z.is_faulted()
        });
        if let Some(z) = empty {
            if can_open && r.active < self.max_active {
                if z.claim_write() {
                    z.set_lifetime(lifetime);
                    return Pick::Zone(z.clone(), true);
                }
            }
            busy = true;
        }

        // Step 4: a hint-compatible partially-written zone, most remaining
        // capacity first
        let mut best: Option<&Arc<Zone>> = None;
        for z in &self.io_zones {
            if z.is_empty() || z.is_full() || z.is_faulted() {
                continue;
            }
            if !z.lifetime().compatible(lifetime) ||
               z.capacity() < self.block_sz
            {
                continue;
            }
            if z.is_open_for_write() {
                busy = true;
                continue;
            }
            // Strict > keeps the lower-numbered zone on ties
            if best.map_or(true, |b| z.capacity() > b.capacity()) {
                best = Some(z);
            }
        }
        if let Some(z) = best {
            if can_open && z.claim_write() {
                return Pick::Zone(z.clone(), false);
            }
            busy = true;
        }

        // Step 5: wait, unless nothing could ever match
        if busy {
            Pick::Busy
        } else {
            Pick::NoSpace
        }
    }

    /// Claim the best zone among those hosting `fids`' extents: enough
    /// room, compatible hint, largest remaining capacity, lowest id on ties.
    fn claim_affine(&self, fids: &[FileId], lifetime: WriteLifetime,
                    can_open: bool, busy: &mut bool) -> Option<Arc<Zone>>
    {
        let zone_ids: BTreeSet<ZoneT> = {
            let s2z = self.sst_to_zone.lock().unwrap();
            fids.iter()
                .filter_map(|f| s2z.get(f))
                .flatten()
                .cloned()
                .collect()
        };
        let mut best: Option<&Arc<Zone>> = None;
        for zid in zone_ids {
            let z = self.zone(zid);
            if z.pool != ZonePool::Io || z.is_full() || z.is_faulted() {
                continue;
            }
            if !z.lifetime().compatible(lifetime) ||
               z.capacity() < self.block_sz
            {
                continue;
            }
            if z.is_open_for_write() {
                *busy = true;
                continue;
            }
            if best.map_or(true, |b| z.capacity() > b.capacity()) {
                best = Some(z);
            }
        }
        match best {
            Some(z) if can_open && z.claim_write() => Some(z.clone()),
            Some(_) => {
                *busy = true;
                None
            },
            None => None,
        }
    }

    /// Ids of sorted tables at `level` whose key range overlaps
    /// `[smallest, largest]`
    fn adjacent_file_list(&self, smallest: &[u8], largest: &[u8],
                          level: u32) -> Vec<FileId>
    {
        if smallest.is_empty() && largest.is_empty() {
            return Vec::new();
        }
        let files = self.files.lock().unwrap();
        files.values()
            .filter(|f| {
                let attrs = f.attrs();
                attrs.is_sst && attrs.level == Some(level) &&
                    attrs.smallest_key.as_slice() <= largest &&
                    smallest <= attrs.largest_key.as_slice()
            })
            .map(|f| f.id())
            .collect()
    }

    /// Ids of all sorted tables at `level`
    fn same_level_file_list(&self, level: u32) -> Vec<FileId> {
        let files = self.files.lock().unwrap();
        files.values()
            .filter(|f| {
                let attrs = f.attrs();
                attrs.is_sst && attrs.level == Some(level)
            })
            .map(|f| f.id())
            .collect()
    }

    /// Claim a destination zone with at least `min_free` writable bytes for
    /// relocated data: reserved scratch first, then the allocation-queue
    /// victim with the fewest valid bytes, then any empty zone.  Never
    /// blocks on the active/open caps; the reserved pool exists so cleaning
    /// cannot deadlock against writers.
    pub(crate) fn allocate_zone_for_cleaning(&self, exclude: ZoneT,
                                             min_free: u64)
        -> Result<Arc<Zone>>
    {
        // Claim under the policy lock, but defer the counter updates until
        // it drops; the engine allocator takes these locks in the opposite
        // nesting.
        let (zone, was_empty) = self.pick_zone_for_cleaning(exclude,
                                                            min_free)?;
        if zone.pool == ZonePool::Io {
            let mut r = self.resources.lock().unwrap();
            r.open += 1;
            if was_empty {
                r.active += 1;
            }
        }
        Ok(zone)
    }

    fn pick_zone_for_cleaning(&self, exclude: ZoneT, min_free: u64)
        -> Result<(Arc<Zone>, bool)>
    {
        let _policy = self.io_zones_mtx.lock().unwrap();
        for z in &self.reserved_zones {
            if z.zone_id != exclude && z.capacity() >= min_free &&
               z.claim_write()
            {
                return Ok((z.clone(), false));
            }
        }
        {
            let mut q = self.allocate_queue.lock().unwrap();
            while let Some(v) = q.pop() {
                if v.zone == exclude {
                    continue;
                }
                let z = self.zone(v.zone);
                if z.capacity() >= min_free && !z.is_faulted() &&
                   z.claim_write()
                {
                    return Ok((z.clone(), false));
                }
            }
        }
        for z in &self.io_zones {
            if z.zone_id != exclude && z.is_empty() && z.claim_write() {
                z.set_lifetime(WriteLifetime::NotSet);
                return Ok((z.clone(), true));
            }
        }
        Err(Error::ENOSPC)
    }

    /// Round-robin over the metadata zones, for the journal.
    pub fn allocate_meta_zone(&self) -> Result<Arc<Zone>> {
        for _ in 0..self.meta_zones.len() {
            let i = self.meta_rr.fetch_add(1, Ordering::AcqRel)
                % self.meta_zones.len();
            let z = &self.meta_zones[i];
            if z.claim_write() {
                return Ok(z.clone());
            }
        }
        Err(Error::ENOSPC)
    }

    // ------------------------------------------------------------------
    // Zone transitions
    // ------------------------------------------------------------------

    /// Give back a zone's write token and wake any blocked allocators.
    pub(crate) fn release_zone(&self, zone: &Zone) {
        zone.release_write();
        if zone.pool == ZonePool::Io {
            let mut r = self.resources.lock().unwrap();
            r.open = r.open.saturating_sub(1);
        }
        self.resources_cv.notify_all();
    }

    /// An append just consumed a zone's last capacity: Open becomes Full
    /// and an active slot comes back.
    pub(crate) fn notify_zone_full(&self) {
        let mut r = self.resources.lock().unwrap();
        debug_assert!(r.active > 0);
        r.active = r.active.saturating_sub(1);
        self.resources_cv.notify_all();
    }

    /// Apply the finish threshold to a nearly full zone on close.
    pub(crate) fn maybe_finish_active(&self, zone: &Arc<Zone>) -> Result {
        if self.finish_threshold == 0 || zone.is_full() {
            return Ok(());
        }
        let nearly_full = zone.capacity() * 100 <
            zone.max_capacity * u64::from(self.finish_threshold);
        if nearly_full {
            self.finish_zone(zone)?;
        }
        Ok(())
    }

    /// Force a zone to Full, releasing its active slot.
    pub(crate) fn finish_zone(&self, zone: &Arc<Zone>) -> Result {
        zone.finish(&*self.zbd)?;
        if zone.pool == ZonePool::Io {
            let mut r = self.resources.lock().unwrap();
            r.active = r.active.saturating_sub(1);
        }
        self.resources_cv.notify_all();
        Ok(())
    }

    /// Reset a drained zone, returning it to the empty pool.
    pub(crate) fn reset_zone(&self, zone: &Arc<Zone>) -> Result {
        if zone.is_empty() {
            return Ok(());
        }
        let was_full = zone.is_full();
        zone.reset(&*self.zbd)?;
        self.nr_resets.fetch_add(1, Ordering::Relaxed);
        if zone.pool == ZonePool::Io && !was_full {
            let mut r = self.resources.lock().unwrap();
            r.active = r.active.saturating_sub(1);
        }
        self.resources_cv.notify_all();
        Ok(())
    }

    /// Fast-path reclamation: reset every zone that holds no live data and
    /// no write token.  Returns the number reclaimed.
    pub fn reset_unused_io_zones(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for z in &self.io_zones {
            if !z.is_empty() && !z.is_open_for_write() && z.used() == 0 {
                match self.reset_zone(z) {
                    Ok(()) => reclaimed += 1,
                    // Lost a race with a writer; skip it
                    Err(Error::EBUSY) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(reclaimed)
    }

    // ------------------------------------------------------------------
    // Cleaning
    // ------------------------------------------------------------------

    /// Reclaim up to `nr_zones` zones: pick the victims with the most
    /// invalid bytes, relocate their live extents, persist the owners'
    /// metadata, and reset them.  Returns the number of zones reset.
    ///
    /// A source zone is reset only after the journal has durably recorded
    /// the replacement extents; a crash in between leaves the old copies
    /// readable.
    pub fn zone_cleaning(&self, nr_zones: usize, journal: &dyn MetadataWriter)
        -> Result<usize>
    {
        let _pass = self.zone_cleaning_mtx.lock().unwrap();
        self.nr_cleanings.fetch_add(1, Ordering::Relaxed);
        let victims = {
            let mut q = self.gc_queue.lock().unwrap();
            let mut seen = BTreeSet::new();
            let mut victims = Vec::new();
            while victims.len() < nr_zones {
                match q.pop() {
                    Some(v) => {
                        if seen.insert(v.zone) {
                            victims.push(v.zone);
                        }
                    },
                    None => break,
                }
            }
            victims
        };
        let mut reclaimed = 0;
        for zid in victims {
            if self.tracker_exit.load(Ordering::Acquire) {
                break;
            }
            let zone = self.zone(zid).clone();
            if zone.is_empty() || zone.is_open_for_write() {
                continue;
            }
            let r = if zone.used() == 0 {
                // Nothing live: reset without any copy work
                self.reset_zone(&zone).map(|_| true)
            } else {
                self.clean_zone(&zone, journal)
            };
            match r {
                Ok(true) => reclaimed += 1,
                Ok(false) => {},
                Err(e) => {
                    // Abort the pass; the victim stays queued for retry
                    self.gc_queue.lock().unwrap().push(GcVictim {
                        zone: zone.zone_id,
                        invalid_bytes: zone.invalid_bytes(),
                    });
                    return Err(e);
                },
            }
        }
        tracing::debug!(reclaimed, "cleaning pass done");
        Ok(reclaimed)
    }

    /// Relocate everything live out of `zone`, then reset it.  Returns
    /// whether the zone was actually reset.
    fn clean_zone(&self, zone: &Arc<Zone>, journal: &dyn MetadataWriter)
        -> Result<bool>
    {
        let infos = zone.valid_extents();
        let fids: BTreeSet<FileId> = infos.iter()
            .map(|i| i.file_id)
            .collect();
        // Owners, ascending by file id so concurrent cleaners (serialized
        // today, but the order is the deadlock-freedom argument) lock
        // consistently
        let files: Vec<Arc<ZoneFile>> = {
            let registry = self.files.lock().unwrap();
            fids.iter().filter_map(|f| registry.get(f).cloned()).collect()
        };
        let mut guards: Vec<RwLockWriteGuard<crate::file::FileInner>> =
            files.iter().map(|f| f.write_extents()).collect();
        let mut dest: Option<Arc<Zone>> = None;
        let r = self.relocate_extents(zone, &infos, &files, &mut guards,
                                      &mut dest);
        drop(guards);
        if let Some(d) = dest.take() {
            if d.pool == ZonePool::Io && d.capacity() == 0 {
                self.notify_zone_full();
            }
            self.release_zone(&d);
        }
        r?;
        // Make the new copies durable, then their metadata.  The reset must
        // come last.
        self.zbd.sync_all()?;
        for f in &files {
            journal.persist(self, f)?;
            f.metadata_synced();
        }
        if zone.used() == 0 {
            self.reset_zone(zone)?;
            Ok(true)
        } else {
            // Extents of files deleted mid-pass are still draining; a later
            // pass will finish the job
            Ok(false)
        }
    }

    fn relocate_extents<'a>(&self, zone: &Arc<Zone>, infos: &[ExtentInfo],
                            files: &'a [Arc<ZoneFile>],
                            guards: &mut [RwLockWriteGuard<'a, FileInner>],
                            dest: &mut Option<Arc<Zone>>) -> Result
    {
        for info in infos {
            let fi = match files.iter().position(|f| f.id() == info.file_id) {
                Some(fi) => fi,
                // Owner is being deleted; leave its extents to that path
                None => continue,
            };
            let ei = match guards[fi].extents.iter().position(|e| {
                e.zone == zone.zone_id && e.start == info.start
            }) {
                Some(ei) => ei,
                None => continue,
            };
            let padded = roundup(info.length, self.block_sz);
            if let Some(d) = dest.as_ref() {
                if d.capacity() < padded {
                    // Won't fit; trade it for one that will
                    let d = dest.take().unwrap();
                    if d.pool == ZonePool::Io && d.capacity() == 0 {
                        self.notify_zone_full();
                    }
                    self.release_zone(&d);
                }
            }
            let d = match dest.as_ref() {
                Some(d) => d.clone(),
                None => {
                    let d = self.allocate_zone_for_cleaning(zone.zone_id,
                                                            padded)?;
                    *dest = Some(d.clone());
                    d
                },
            };
            let mut buf = vec![0u8; padded as usize];
            self.zbd.read_at(&mut buf, info.start, false)?;
            let new_start = d.append(&*self.zbd, &buf)?;

            guards[fi].extents[ei] = ZoneExtent {
                start: new_start,
                length: info.length,
                zone: d.zone_id,
            };
            d.update_secondary_lifetime(info.lifetime, info.length);
            let mut ninfo = info.clone();
            ninfo.start = new_start;
            d.push_extent_info(ninfo);

            let old = ZoneExtent {
                start: info.start,
                length: info.length,
                zone: zone.zone_id,
            };
            zone.invalidate(info.file_id, &old)?;
            self.note_sst_moved(info.file_id, &guards[fi], zone.zone_id,
                                d.zone_id);
        }
        Ok(())
    }

    /// Keep `sst_to_zone` truthful after a relocation.
    fn note_sst_moved(&self, file_id: FileId, inner: &FileInner, from: ZoneT,
                      to: ZoneT)
    {
        let mut s2z = self.sst_to_zone.lock().unwrap();
        if let Some(zones) = s2z.get_mut(&file_id) {
            if !inner.extents.iter().any(|e| e.zone == from) {
                zones.retain(|&z| z != from);
            }
            if !zones.contains(&to) {
                zones.push(to);
            }
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Bytes still writable across the data zones
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity()).sum()
    }

    /// Bytes of live data across the data zones
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used()).sum()
    }

    /// Bytes written but dead, reclaimable by cleaning
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.invalid_bytes()).sum()
    }

    /// Total bytes ever appended to data zones, padding included
    pub fn total_written(&self) -> u64 {
        self.wr_data.load(Ordering::Relaxed)
    }

    pub fn nr_resets(&self) -> u64 {
        self.nr_resets.load(Ordering::Relaxed)
    }

    /// Log totals plus the write volume since the last call.
    pub fn log_zone_stats(&self) {
        let written = self.wr_data.load(Ordering::Relaxed);
        let last = self.last_wr_data.swap(written, Ordering::Relaxed);
        tracing::info!(
            free = self.free_space(),
            used = self.used_space(),
            reclaimable = self.reclaimable_space(),
            written_delta = written - last,
            resets = self.nr_resets.load(Ordering::Relaxed),
            cleanings = self.nr_cleanings.load(Ordering::Relaxed),
            "zone stats");
    }

    /// Per-zone occupancy dump, for debugging.
    pub fn log_zone_usage(&self) {
        for z in &self.io_zones {
            if z.is_empty() {
                continue;
            }
            tracing::debug!(
                zone = z.zone_id,
                wp = z.wp() - z.start,
                used = z.used(),
                invalid = z.invalid_bytes(),
                lifetime = ?z.lifetime(),
                "zone usage");
        }
    }
}

impl std::fmt::Debug for ZonedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ZonedDevice")
            .field("uuid", &self.uuid)
            .field("nr_zones", &self.zones.len())
            .field("block_sz", &self.block_sz)
            .finish_non_exhaustive()
    }
}

// LCOV_EXCL_STOP
