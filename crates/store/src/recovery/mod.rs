//! Recovery scanner.
//!
//! Rebuilds in-memory state from persisted generations under a memory
//! budget. Recovery runs in four phases:
//!
//! ```text
//! init ──► start ──► iteration ──► terminate
//!  │         │           │
//!  │         │           └─ next_generation / next_record / next_reference / ...
//!  │         └─ index mgmt, pin active gens, size files, read-ahead, wipe orphans
//!  └─ install the management image
//! ```
//!
//! Generations are read on demand by [`Recovery::get_generation`], the only
//! call that blocks. Reads complete on the disk worker thread, which relinks
//! reference chunks, records what the generation holds and wakes waiters.
//!
//! Lock order: the generation table, then the disk scheduler's queue. Disk
//! callbacks hold only a weak reference to the recovery state.

mod iter;
mod mgmt;
mod relink;

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
};

pub use iter::{
    GenCursor, OwnerCursor, RecordCursor, RecordInfo, ReferenceCursor, ReferenceInfo, ReferenceOwner,
    StateCursor, StateInfo,
};
pub use relink::{LinkSummary, RefGen, link_ref_chunks};
use genstore_types::{GenId, Handle, config::StoreConfig};
use parking_lot::{Condvar, Mutex, MutexGuard};

use self::{mgmt::MgmtIndex, relink::scan_generation};
use crate::{
    bitmap::PoolBitmaps,
    cache::{CacheStats, GenCache, Residency},
    compaction::{self, CompactionParams},
    disk::{DiskJob, DiskScheduler, JobOutcome, JobOutput},
    error::{Error, Result},
    layout::{DataType, GenImage},
};

/// Priority of reads a caller waits for.
const DEMAND_PRIORITY: u8 = 1;

/// Priority of speculative reads.
const READ_AHEAD_PRIORITY: u8 = 2;

/// Priority of compaction and write-back jobs.
const COMPACT_PRIORITY: u8 = 1;

/// Lifecycle of a [`Recovery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Management image installed; nothing scanned yet.
    Initialized,
    /// Generations are being iterated.
    Started,
    /// Memory released; only [`Recovery::phase`] still answers.
    Terminated,
}

/// Per-generation recovery bookkeeping.
#[derive(Debug, Default)]
struct GenInfo {
    /// Position in the generation id chain.
    seq: usize,
    /// Length of the generation file.
    disk_size: u64,
    /// In memory since before recovery; never read, evicted or compacted.
    active: bool,
    /// "Already in memory" has been logged.
    traced: bool,
    /// Iteration moved past this generation.
    processed: bool,
    /// Ranges and record types were collected.
    scanned: bool,
    /// Live granules reported while a read was in flight.
    pending_live: Option<PoolBitmaps>,
    /// Granules the iterators found live.
    live: Option<PoolBitmaps>,
    /// Record types present.
    record_types: BTreeSet<DataType>,
    /// Owners with a current reference chain here, per owner type.
    ref_owners: BTreeMap<DataType, Vec<u64>>,
    /// Reads of this generation that failed.
    read_failures: u64,
}

struct Tables {
    phase: Phase,
    cache: GenCache,
    gens: BTreeMap<GenId, GenInfo>,
    index: Arc<MgmtIndex>,
    /// Reference ranges per owner (management offset), ascending sequence.
    ref_gens: BTreeMap<u64, Vec<RefGen>>,
    /// Highest order id per owner rounded up to whole chunks.
    owner_highest: BTreeMap<u64, u64>,
    /// Active images handed to `init`, installed by `start`.
    active: Vec<GenImage>,
    /// Generations handed out by `next_generation`.
    visited: usize,
}

pub(crate) struct RecoveryShared {
    tables: Mutex<Tables>,
    loaded: Condvar,
    disk: Arc<DiskScheduler>,
    mgmt: Arc<GenImage>,
    params: CompactionParams,
}

/// Recovery scanner over the generations of one store.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use genstore::{disk::DiskScheduler, layout::GenImage, recovery::Recovery};
/// # use genstore_types::config::StoreConfig;
/// # fn demo(config: &StoreConfig, mgmt: GenImage) -> genstore::Result<()> {
/// let disk = Arc::new(DiskScheduler::start(config)?);
/// let recovery = Recovery::init(config, disk, mgmt, Vec::new())?;
/// recovery.start()?;
/// let mut gens = None;
/// while let Ok(gen_id) = recovery.next_generation(&mut gens) {
///     let mut records = None;
///     let mut buf = vec![0u8; 4096];
///     while let Ok(info) =
///         recovery.next_record(&mut records, genstore::layout::DataType::MESSAGE, gen_id, &mut buf)
///     {
///         println!("{} holds {} bytes", info.handle, info.data_len);
///     }
/// }
/// recovery.terminate();
/// # Ok(())
/// # }
/// ```
pub struct Recovery {
    shared: Arc<RecoveryShared>,
}

impl Recovery {
    /// Installs the management image and holds the active images until
    /// [`Self::start`].
    ///
    /// Compacted images are expanded first. The management image is pinned
    /// and charged against the budget even if it does not fit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadParameter`] if `mgmt` is not the management
    /// generation or an active image is.
    pub fn init(
        config: &StoreConfig,
        disk: Arc<DiskScheduler>,
        mgmt: GenImage,
        active: Vec<GenImage>,
    ) -> Result<Self> {
        if !mgmt.gen_id().is_mgmt() {
            return Err(Error::bad_parameter(format!(
                "generation {} is not the management generation",
                mgmt.gen_id()
            )));
        }
        if let Some(image) = active.iter().find(|i| i.gen_id().is_mgmt() || i.gen_id().is_null()) {
            return Err(Error::bad_parameter(format!(
                "generation {} cannot be an active data generation",
                image.gen_id()
            )));
        }
        let mgmt = if mgmt.is_compacted() { compaction::expand_image(&mgmt)? } else { mgmt };
        let active = active
            .into_iter()
            .map(|i| if i.is_compacted() { compaction::expand_image(&i) } else { Ok(i) })
            .collect::<Result<Vec<_>>>()?;

        let mut cache = GenCache::from_config(config);
        cache.admit(GenId::MGMT, mgmt.len() as u64, true)?;
        let mgmt = cache.install(mgmt);
        cache.set_pinned(GenId::MGMT, true);

        tracing::info!(
            budget = config.memory_budget_bytes,
            mgmt_bytes = mgmt.len(),
            active = active.len(),
            "Recovery initialized"
        );
        let tables = Tables {
            phase: Phase::Initialized,
            cache,
            gens: BTreeMap::new(),
            index: Arc::new(MgmtIndex::default()),
            ref_gens: BTreeMap::new(),
            owner_highest: BTreeMap::new(),
            active,
            visited: 0,
        };
        Ok(Self {
            shared: Arc::new(RecoveryShared {
                tables: Mutex::new(tables),
                loaded: Condvar::new(),
                disk,
                mgmt,
                params: CompactionParams::from_config(config),
            }),
        })
    }

    /// Indexes the management generation and prepares iteration.
    ///
    /// Assigns every generation of the id chain its sequence index, pins
    /// and scans the active generations, cancels stale compaction jobs,
    /// sizes the generation files, starts read-ahead and schedules removal
    /// of generation files the chain does not name.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAvailable`] if called twice
    /// - [`Error::BudgetTooSmall`] if the largest generation exceeds the budget
    /// - [`Error::Corrupted`] if the management generation does not index
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let mut t = shared.tables.lock();
        if t.phase != Phase::Initialized {
            return Err(Error::NotAvailable { reason: "recovery already started" });
        }
        let index = Arc::new(MgmtIndex::build(&shared.mgmt)?);
        for (seq, &gen_id) in index.chain.iter().enumerate() {
            t.gens.insert(gen_id, GenInfo { seq, ..GenInfo::default() });
            t.cache.register(gen_id);
        }
        t.index = Arc::clone(&index);

        for mut image in std::mem::take(&mut t.active) {
            let gen_id = image.gen_id();
            if !t.gens.contains_key(&gen_id) {
                tracing::warn!(gen_id = %gen_id, "Active generation missing from the chain");
                let seq = t.gens.len();
                t.gens.insert(gen_id, GenInfo { seq, ..GenInfo::default() });
            }
            link_ref_chunks(&mut image, &shared.mgmt)?;
            t.cache.admit(gen_id, image.len() as u64, true)?;
            let image = t.cache.install(image);
            t.cache.set_pinned(gen_id, true);
            shared.absorb_scan(&mut t, &image);
            if let Some(info) = t.gens.get_mut(&gen_id) {
                info.active = true;
                info.disk_size = image.len() as u64;
            }
        }
        shared.disk.remove_compact_tasks();

        let mut largest: Option<(GenId, u64)> = None;
        let ids: Vec<GenId> = t.gens.keys().copied().collect();
        for gen_id in ids {
            if t.gens.get(&gen_id).is_some_and(|i| i.active) {
                continue;
            }
            let size = shared.disk.generation_size(gen_id)?;
            if size == 0 {
                tracing::warn!(gen_id = %gen_id, "Generation in the chain has no file");
            }
            if let Some(info) = t.gens.get_mut(&gen_id) {
                info.disk_size = size;
            }
            if largest.is_none_or(|(_, s)| size > s) {
                largest = Some((gen_id, size));
            }
        }
        if let Some((gen_id, required)) = largest {
            let budget = t.cache.budget();
            if required > budget {
                tracing::error!(gen_id = %gen_id, required, budget, "Memory budget too small for recovery");
                return Err(Error::BudgetTooSmall { gen_id, required, budget });
            }
        }

        t.phase = Phase::Started;
        shared.read_ahead(&mut t);
        shared.schedule_wipe(&index, &t);
        tracing::info!(
            generations = index.chain.len(),
            owners = index.owners.len(),
            in_use = t.cache.in_use(),
            "Recovery started"
        );
        Ok(())
    }

    /// Ends recovery and releases every generation held.
    pub fn terminate(&self) {
        let mut t = self.shared.tables.lock();
        if t.phase == Phase::Terminated {
            return;
        }
        t.phase = Phase::Terminated;
        let stats = t.cache.stats();
        t.cache.clear();
        t.gens.clear();
        t.ref_gens.clear();
        t.owner_highest.clear();
        t.active.clear();
        drop(t);
        self.shared.loaded.notify_all();
        tracing::info!(
            evictions = stats.evictions,
            hits = stats.hits,
            misses = stats.misses,
            "Recovery terminated"
        );
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.shared.tables.lock().phase
    }

    /// The management image.
    pub fn mgmt(&self) -> Arc<GenImage> {
        Arc::clone(&self.shared.mgmt)
    }

    /// Image of `gen_id`, reading it if it is not resident.
    ///
    /// Blocks until the read completes. A read that failed while this call
    /// waited is not retried; one that succeeded but was evicted before the
    /// caller woke is submitted again.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAvailable`] outside the started phase
    /// - [`Error::ArgNotValid`] if the chain does not name `gen_id`
    /// - [`Error::AllocateError`] if no memory can be freed for it
    /// - [`Error::ReadFailed`] if the read failed
    pub fn get_generation(&self, gen_id: GenId) -> Result<Arc<GenImage>> {
        self.shared.get_generation(gen_id)
    }

    /// Reports the live granules of `gen_id` and compacts it.
    ///
    /// A resident generation is compacted in memory on the calling thread
    /// and written back with an alloc-write job. One being read keeps the
    /// granules until the read completes; the disk worker then compacts and
    /// writes it, and the compacted image replaces the one read. One only on
    /// disk gets a compact job. Active and pinned generations are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgNotValid`] for an unknown generation and any
    /// error of the in-memory compaction or of job submission other than
    /// [`Error::DiskTaskExists`].
    pub fn update_generation(&self, gen_id: GenId, live: &PoolBitmaps) -> Result<()> {
        let mut t = self.shared.lock_started()?;
        self.shared.update_locked(&mut t, gen_id, live.clone())
    }

    /// Compacts `gen_id` using the granules the iterators marked live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAvailable`] if nothing was marked live in the
    /// generation, otherwise as [`Self::update_generation`].
    pub fn compact_generation(&self, gen_id: GenId) -> Result<()> {
        let mut t = self.shared.lock_started()?;
        let info = t.gens.get(&gen_id).ok_or(Error::ArgNotValid { name: "gen_id" })?;
        let live = info
            .live
            .clone()
            .ok_or(Error::NotAvailable { reason: "no live granules recorded for the generation" })?;
        self.shared.update_locked(&mut t, gen_id, live)
    }

    /// Adds a generation created after recovery started.
    ///
    /// With an `image` the generation is installed at once: expanded images
    /// get their reference chunks relinked, and `active` pins the image and
    /// charges it even over budget. Without one its file is sized and a read
    /// is started. A generation already resident or being read is left as
    /// is. New generations sort after every known one in
    /// [`Self::compare_handles`].
    ///
    /// # Errors
    ///
    /// - [`Error::ArgNotValid`] for the null or management id, or when no
    ///   file exists for an image-less generation
    /// - [`Error::BadParameter`] if `image` belongs to another generation
    /// - [`Error::AllocateError`] if an unpinned image does not fit
    pub fn add_generation(&self, gen_id: GenId, image: Option<GenImage>, active: bool) -> Result<()> {
        if gen_id.is_null() || gen_id.is_mgmt() {
            return Err(Error::ArgNotValid { name: "gen_id" });
        }
        if let Some(image) = &image {
            if image.gen_id() != gen_id {
                return Err(Error::bad_parameter(format!(
                    "image of generation {} added as {gen_id}",
                    image.gen_id()
                )));
            }
        }
        let shared = &self.shared;
        let mut t = shared.lock_started()?;
        if !t.gens.contains_key(&gen_id) {
            let seq = t.gens.values().map(|i| i.seq + 1).max().unwrap_or(0);
            t.gens.insert(gen_id, GenInfo { seq, ..GenInfo::default() });
            t.cache.register(gen_id);
        }
        if matches!(t.cache.residency(gen_id), Some(Residency::InMemory | Residency::ReadRequested)) {
            tracing::debug!(gen_id = %gen_id, "Added generation already present");
            return Ok(());
        }

        match image {
            Some(mut image) => {
                if !image.is_compacted() {
                    link_ref_chunks(&mut image, &shared.mgmt)?;
                }
                let len = image.len() as u64;
                t.cache.admit(gen_id, len, active)?;
                let image = t.cache.install(image);
                if active {
                    t.cache.set_pinned(gen_id, true);
                }
                shared.absorb_scan(&mut t, &image);
                if let Some(info) = t.gens.get_mut(&gen_id) {
                    info.active = active;
                    info.disk_size = len;
                }
                tracing::info!(gen_id = %gen_id, bytes = len, active, "Generation added from memory");
            }
            None => {
                let size = shared.disk.generation_size(gen_id)?;
                if size == 0 {
                    return Err(Error::ArgNotValid { name: "gen_id" });
                }
                if let Some(info) = t.gens.get_mut(&gen_id) {
                    info.disk_size = size;
                }
                t.cache.admit(gen_id, size, false)?;
                if let Err(e) = shared.submit_read(gen_id, DEMAND_PRIORITY) {
                    t.cache.cancel(gen_id);
                    return Err(e);
                }
                tracing::info!(gen_id = %gen_id, bytes = size, "Generation added from disk");
            }
        }
        Ok(())
    }

    /// Forgets a deleted generation.
    ///
    /// Frees its image and map, drops its reference ranges and resets what
    /// recovery knew about it; the generation keeps its place in the
    /// sequence. Read-ahead then continues with the freed memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgNotValid`] for the management or an unknown
    /// generation.
    pub fn del_generation(&self, gen_id: GenId) -> Result<()> {
        let shared = &self.shared;
        let mut t = shared.lock_started()?;
        if gen_id.is_mgmt() {
            return Err(Error::ArgNotValid { name: "gen_id" });
        }
        let info = t.gens.get_mut(&gen_id).ok_or(Error::ArgNotValid { name: "gen_id" })?;
        *info = GenInfo { seq: info.seq, processed: true, ..GenInfo::default() };
        t.cache.set_pinned(gen_id, false);
        t.cache.cancel(gen_id);
        t.ref_gens.retain(|_, ranges| {
            ranges.retain(|r| r.gen_id != gen_id);
            !ranges.is_empty()
        });
        tracing::info!(gen_id = %gen_id, in_use = t.cache.in_use(), "Generation deleted");
        shared.read_ahead(&mut t);
        drop(t);
        shared.loaded.notify_all();
        Ok(())
    }

    /// Granules the iterators marked live in `gen_id`.
    pub fn live_granules(&self, gen_id: GenId) -> Option<PoolBitmaps> {
        self.shared.tables.lock().gens.get(&gen_id).and_then(|i| i.live.clone())
    }

    /// Orders two handles by generation sequence, then offset.
    ///
    /// A management handle must name a split item and sorts with the
    /// generation holding its data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAvailable`] before [`Self::start`] and
    /// [`Error::ArgNotValid`] for a handle whose generation is unknown.
    pub fn compare_handles(&self, a: Handle, b: Handle) -> Result<Ordering> {
        let t = self.shared.lock_started()?;
        let key = |h: Handle| -> Result<(usize, u64)> {
            let gen_id = if h.gen_id().is_mgmt() {
                t.index.owner(h).ok_or(Error::ArgNotValid { name: "handle" })?.data_gen
            } else {
                h.gen_id()
            };
            let seq = t.gens.get(&gen_id).ok_or(Error::ArgNotValid { name: "handle" })?.seq;
            Ok((seq, h.offset()))
        };
        Ok(key(a)?.cmp(&key(b)?))
    }

    /// Progress of generation iteration, in `1..=99` once started.
    pub fn completion_pct(&self) -> Option<u8> {
        let t = self.shared.tables.lock();
        if t.phase != Phase::Started {
            return None;
        }
        let total = t.index.chain.len().max(1);
        Some((t.visited * 100 / total).clamp(1, 99) as u8)
    }

    /// Reference ranges still held for `owner`, in sequence order.
    pub fn reference_ranges(&self, owner: Handle) -> Vec<RefGen> {
        if !owner.gen_id().is_mgmt() {
            return Vec::new();
        }
        self.shared.tables.lock().ref_gens.get(&owner.offset()).cloned().unwrap_or_default()
    }

    /// Highest order id `owner` has in any generation, rounded up to whole
    /// chunks.
    pub fn highest_order_id(&self, owner: Handle) -> Option<u64> {
        if !owner.gen_id().is_mgmt() {
            return None;
        }
        self.shared.tables.lock().owner_highest.get(&owner.offset()).copied()
    }

    /// Memory accounting.
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.tables.lock().cache.stats()
    }

    /// Residency of `gen_id`.
    pub fn residency(&self, gen_id: GenId) -> Option<Residency> {
        self.shared.tables.lock().cache.residency(gen_id)
    }
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.shared.tables.lock();
        f.debug_struct("Recovery")
            .field("phase", &t.phase)
            .field("generations", &t.gens.len())
            .field("in_use", &t.cache.in_use())
            .finish()
    }
}

impl RecoveryShared {
    fn lock_started(&self) -> Result<MutexGuard<'_, Tables>> {
        let t = self.tables.lock();
        match t.phase {
            Phase::Started => Ok(t),
            Phase::Initialized => Err(Error::NotAvailable { reason: "recovery not started" }),
            Phase::Terminated => Err(Error::NotAvailable { reason: "recovery terminated" }),
        }
    }

    fn get_generation(self: &Arc<Self>, gen_id: GenId) -> Result<Arc<GenImage>> {
        if gen_id.is_mgmt() {
            return Ok(Arc::clone(&self.mgmt));
        }
        let mut t = self.lock_started()?;
        let info = t.gens.get(&gen_id).ok_or(Error::ArgNotValid { name: "gen_id" })?;
        let failures = info.read_failures;
        loop {
            if t.phase != Phase::Started {
                return Err(Error::NotAvailable { reason: "recovery terminated" });
            }
            match t.cache.residency(gen_id) {
                Some(Residency::InMemory) => {
                    let image = t.cache.get(gen_id).ok_or(Error::ReadFailed { gen_id })?;
                    if let Some(info) = t.gens.get_mut(&gen_id) {
                        if !info.traced {
                            info.traced = true;
                            tracing::trace!(gen_id = %gen_id, "Generation already in memory");
                        }
                    }
                    return Ok(image);
                }
                Some(Residency::ReadRequested) => self.loaded.wait(&mut t),
                _ => {
                    let Some(info) = t.gens.get(&gen_id) else {
                        return Err(Error::ArgNotValid { name: "gen_id" });
                    };
                    if info.read_failures != failures {
                        return Err(Error::ReadFailed { gen_id });
                    }
                    let size = info.disk_size;
                    t.cache.admit(gen_id, size, false)?;
                    if let Err(e) = self.submit_read(gen_id, DEMAND_PRIORITY) {
                        t.cache.cancel(gen_id);
                        return Err(e);
                    }
                    tracing::debug!(gen_id = %gen_id, bytes = size, "Reading generation on demand");
                }
            }
        }
    }

    fn submit_read(self: &Arc<Self>, gen_id: GenId, priority: u8) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.disk.submit(
            DiskJob::read(gen_id)
                .priority(priority)
                .cancel_on_terminate(true)
                .on_complete(move |outcome| on_read(&weak, outcome)),
        )
    }

    /// Starts reads along the chain while the budget has headroom.
    ///
    /// Read-ahead never evicts.
    fn read_ahead(self: &Arc<Self>, t: &mut Tables) {
        if t.phase != Phase::Started {
            return;
        }
        let index = Arc::clone(&t.index);
        for &gen_id in &index.chain {
            if !t.cache.has_read_ahead_room() {
                break;
            }
            let Some(info) = t.gens.get(&gen_id) else { continue };
            if info.processed || info.active || info.disk_size == 0 || gen_id.is_mgmt() {
                continue;
            }
            if !matches!(t.cache.residency(gen_id), None | Some(Residency::NotRequested)) {
                continue;
            }
            let size = info.disk_size;
            if !t.cache.fits(size) || t.cache.admit(gen_id, size, false).is_err() {
                break;
            }
            if let Err(e) = self.submit_read(gen_id, READ_AHEAD_PRIORITY) {
                tracing::debug!(gen_id = %gen_id, error = %e, "Read-ahead stopped");
                t.cache.cancel(gen_id);
                break;
            }
            tracing::debug!(gen_id = %gen_id, bytes = size, in_use = t.cache.in_use(), "Read-ahead");
        }
    }

    /// Folds a generation's reference ranges and record types into the tables.
    fn absorb_scan(&self, t: &mut Tables, image: &GenImage) {
        let gen_id = image.gen_id();
        if t.gens.get(&gen_id).is_none_or(|i| i.scanned) {
            return;
        }
        let scan = scan_generation(image, &t.index);
        for (owner, highest) in scan.rounded_highest {
            let entry = t.owner_highest.entry(owner).or_insert(0);
            *entry = (*entry).max(highest);
        }
        for (owner, range) in scan.ref_gens {
            let seq_of = |g: GenId| t.gens.get(&g).map_or(usize::MAX, |i| i.seq);
            let seq = seq_of(range.gen_id);
            let list = t.ref_gens.entry(owner).or_default();
            let at = list.partition_point(|r| seq_of(r.gen_id) <= seq);
            list.insert(at, range);
        }
        if let Some(info) = t.gens.get_mut(&gen_id) {
            info.record_types = scan.record_types;
            info.ref_owners = scan.ref_owners;
            info.scanned = true;
        }
    }

    fn update_locked(self: &Arc<Self>, t: &mut Tables, gen_id: GenId, live: PoolBitmaps) -> Result<()> {
        let info = t.gens.get_mut(&gen_id).ok_or(Error::ArgNotValid { name: "gen_id" })?;
        if info.active || t.cache.is_pinned(gen_id) {
            tracing::debug!(gen_id = %gen_id, "Skipping compaction of pinned generation");
            return Ok(());
        }
        match t.cache.residency(gen_id) {
            Some(Residency::InMemory) => {
                let image = t.cache.peek(gen_id).ok_or(Error::ReadFailed { gen_id })?;
                let old_len = image.len();
                let compacted = compaction::compact((*image).clone(), &live, &self.params)?;
                drop(image);
                let image = t.cache.replace(compacted);
                tracing::debug!(
                    gen_id = %gen_id,
                    old_len,
                    new_len = image.len(),
                    in_use = t.cache.in_use(),
                    "Compacted generation in memory"
                );
                let weak = Arc::downgrade(self);
                let job = DiskJob::alloc_write(gen_id, move || Ok(image.as_bytes().to_vec()))
                    .priority(COMPACT_PRIORITY)
                    .on_complete(move |outcome| on_compacted(&weak, outcome));
                self.submit_tolerant(job)
            }
            Some(Residency::ReadRequested) => {
                match &mut info.pending_live {
                    Some(pending) => pending.union_with(&live),
                    None => info.pending_live = Some(live),
                }
                tracing::debug!(gen_id = %gen_id, "Deferring compaction until the read completes");
                Ok(())
            }
            _ => {
                let weak = Arc::downgrade(self);
                let job = DiskJob::compact(gen_id, live, self.params)
                    .priority(COMPACT_PRIORITY)
                    .cancel_on_terminate(true)
                    .on_complete(move |outcome| on_compacted(&weak, outcome));
                self.submit_tolerant(job)
            }
        }
    }

    /// Compacts a resident image on the disk worker and writes it back.
    ///
    /// The job's provider compacts a copy without the tables lock; its
    /// completion installs the result if the cache still holds `image`.
    fn compact_on_worker(self: &Arc<Self>, image: Arc<GenImage>, live: PoolBitmaps) -> Result<()> {
        let gen_id = image.gen_id();
        let params = self.params;
        let source = Arc::downgrade(&image);
        let produced: Arc<Mutex<Option<GenImage>>> = Arc::default();
        let slot = Arc::clone(&produced);
        let provider = move || {
            let compacted = compaction::compact((*image).clone(), &live, &params)?;
            let bytes = compacted.as_bytes().to_vec();
            *slot.lock() = Some(compacted);
            Ok(bytes)
        };
        let weak = Arc::downgrade(self);
        let job = DiskJob::alloc_write(gen_id, provider)
            .priority(COMPACT_PRIORITY)
            .cancel_on_terminate(true)
            .on_complete(move |outcome| {
                if outcome.result.is_ok() {
                    install_compacted(&weak, gen_id, &source, &produced);
                }
                on_compacted(&weak, outcome);
            });
        tracing::debug!(gen_id = %gen_id, "Compaction handed to the disk worker");
        self.submit_tolerant(job)
    }

    fn submit_tolerant(&self, job: DiskJob) -> Result<()> {
        let gen_id = job.gen_id();
        match self.disk.submit(job) {
            Err(Error::DiskTaskExists { .. }) => {
                tracing::debug!(gen_id = %gen_id, "Compaction merged into a queued job");
                Ok(())
            }
            other => other,
        }
    }

    fn schedule_wipe(&self, index: &MgmtIndex, t: &Tables) {
        let mut keep: BTreeSet<GenId> = index.chain.iter().copied().collect();
        keep.insert(GenId::MGMT);
        keep.extend(t.gens.iter().filter(|(_, i)| i.active).map(|(g, _)| *g));
        let job = DiskJob::wipe(keep).priority(0).cancel_on_terminate(true).on_complete(|outcome| {
            match outcome.result {
                Ok(JobOutput::Wiped(removed)) if !removed.is_empty() => {
                    tracing::info!(removed = ?removed, "Removed orphan generation files");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Orphan wipe failed"),
            }
        });
        if let Err(e) = self.disk.submit(job) {
            tracing::warn!(error = %e, "Could not schedule orphan wipe");
        }
    }
}

/// Marks the item headed at canonical `offset` of `image` live.
fn mark_live(t: &mut Tables, image: &GenImage, offset: u64) {
    let header = image.header();
    if let Some(info) = t.gens.get_mut(&header.gen_id) {
        let live = info.live.get_or_insert_with(|| PoolBitmaps::for_header(header));
        if !live.mark_item(header, offset) {
            tracing::debug!(gen_id = %header.gen_id, offset, "Live mark outside any pool");
        }
    }
}

fn on_read(weak: &Weak<RecoveryShared>, outcome: JobOutcome) {
    let Some(shared) = weak.upgrade() else { return };
    let gen_id = outcome.gen_id;
    let mut t = shared.tables.lock();
    let waiting =
        t.phase == Phase::Started && t.cache.residency(gen_id) == Some(Residency::ReadRequested);
    let failed = match outcome.result {
        Ok(JobOutput::Read(image)) if waiting => match install_read(&shared, &mut t, gen_id, image) {
            Ok(()) => false,
            Err(e) => {
                tracing::error!(gen_id = %gen_id, error = %e, "Generation unusable after read");
                true
            }
        },
        Ok(_) => {
            tracing::debug!(gen_id = %gen_id, "Discarding read nobody waits for");
            false
        }
        Err(e) if e.is_cancellation() => {
            tracing::debug!(gen_id = %gen_id, "Generation read cancelled");
            if waiting {
                t.cache.cancel(gen_id);
            }
            false
        }
        Err(e) => {
            tracing::error!(gen_id = %gen_id, error = %e, "Generation read failed");
            waiting
        }
    };
    if failed {
        t.cache.cancel(gen_id);
        if let Some(info) = t.gens.get_mut(&gen_id) {
            info.read_failures += 1;
        }
    }
    drop(t);
    shared.loaded.notify_all();
}

fn install_read(
    shared: &Arc<RecoveryShared>,
    t: &mut Tables,
    gen_id: GenId,
    mut image: GenImage,
) -> Result<()> {
    if image.gen_id() != gen_id {
        return Err(Error::corrupted(format!("file of generation {gen_id} holds {}", image.gen_id())));
    }
    if !image.is_compacted() {
        link_ref_chunks(&mut image, &shared.mgmt)?;
    }
    shared.absorb_scan(t, &image);
    let image = t.cache.install(image);
    tracing::debug!(gen_id = %gen_id, bytes = image.len(), in_use = t.cache.in_use(), "Generation loaded");

    let pending = t.gens.get_mut(&gen_id).and_then(|i| i.pending_live.take());
    if let Some(live) = pending {
        if let Err(e) = shared.compact_on_worker(image, live) {
            tracing::warn!(gen_id = %gen_id, error = %e, "Deferred compaction not scheduled");
        }
    }
    Ok(())
}

/// Swaps in an image compacted on the disk worker, unless the cache moved
/// on from the image it was built from.
fn install_compacted(
    weak: &Weak<RecoveryShared>,
    gen_id: GenId,
    source: &Weak<GenImage>,
    produced: &Mutex<Option<GenImage>>,
) {
    let Some(shared) = weak.upgrade() else { return };
    let Some(compacted) = produced.lock().take() else { return };
    let mut t = shared.tables.lock();
    let current = t.phase == Phase::Started
        && t.cache.residency(gen_id) == Some(Residency::InMemory)
        && t.cache.peek(gen_id).is_some_and(|cur| Weak::ptr_eq(&Arc::downgrade(&cur), source));
    if !current {
        tracing::debug!(gen_id = %gen_id, "Dropping compaction of a replaced image");
        return;
    }
    let image = t.cache.replace(compacted);
    tracing::debug!(
        gen_id = %gen_id,
        new_len = image.len(),
        in_use = t.cache.in_use(),
        "Compacted generation in memory"
    );
}

fn on_compacted(weak: &Weak<RecoveryShared>, outcome: JobOutcome) {
    let Some(shared) = weak.upgrade() else { return };
    let gen_id = outcome.gen_id;
    let mut t = shared.tables.lock();
    let new_len = match outcome.result {
        Ok(JobOutput::Written { bytes }) => Some(bytes),
        Ok(JobOutput::Compacted { old_len, new_len, .. }) => {
            tracing::debug!(gen_id = %gen_id, old_len, new_len, "Generation file compacted");
            Some(new_len)
        }
        Ok(_) => None,
        Err(e) if e.is_cancellation() => None,
        Err(e) => {
            tracing::error!(gen_id = %gen_id, error = %e, "Generation compaction failed");
            None
        }
    };
    if let (Some(len), Some(info)) = (new_len, t.gens.get_mut(&gen_id)) {
        info.disk_size = len;
    }
    shared.read_ahead(&mut t);
}
