//! Disk scheduler behaviour seen from outside the crate.
//!
//! Most tests first occupy the worker with an alloc-write whose provider
//! blocks, queue jobs behind it, then release it:
//!
//! ```text
//! test ──► alloc-write(gen 2, blocks) ──► worker busy
//!      ──► queue jobs / supersede / terminate
//!      ──► release ──► worker drains the queues ──► callbacks
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    time::Duration,
};

use genstore::{
    CompactionParams, DiskJob, DiskScheduler, Error, FileIo, GenImage, GenMap, JobOutcome,
    JobOutput, OsFileIo, PoolBitmaps,
    compaction::read_chain,
    disk::{JobTag, gen_file_name},
    layout::{DataType, GenerationBuilder, GranuleAllocator, NewItem},
};
use genstore_test_utils::{FaultPoint, IoFault, IoFaultInjector, StoreDir, test_store_config};
use genstore_types::{GenId, Handle};

const TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

/// Generation `gen_id` holding one message per payload.
fn image_with(gen_id: GenId, payloads: &[&[u8]]) -> (GenImage, Vec<Handle>) {
    let mut img = GenerationBuilder::new(gen_id).pool(256, 32).build().unwrap();
    let mut alloc = GranuleAllocator::scan(&img).unwrap();
    let handles = payloads
        .iter()
        .map(|&payload| {
            alloc
                .store(&mut img, NewItem { data_type: DataType::MESSAGE, attribute: 0, state: 0, payload })
                .unwrap()
        })
        .collect();
    (img, handles)
}

fn empty_image(gen_id: GenId) -> Vec<u8> {
    GenerationBuilder::new(gen_id).pool(64, 4).build().unwrap().as_bytes().to_vec()
}

fn report(tx: &Sender<JobOutcome>) -> impl FnOnce(JobOutcome) + Send + 'static {
    let tx = tx.clone();
    move |outcome| {
        tx.send(outcome).ok();
    }
}

/// Occupies the worker with an alloc-write of `gen_id` until the returned
/// sender is used or dropped.
fn block_worker(disk: &DiskScheduler, gen_id: GenId, outcomes: &Sender<JobOutcome>) -> Sender<()> {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let bytes = empty_image(gen_id);
    disk.submit(
        DiskJob::alloc_write(gen_id, move || {
            entered_tx.send(()).ok();
            release_rx.recv().ok();
            Ok(bytes.clone())
        })
        .priority(0)
        .on_complete(report(outcomes)),
    )
    .unwrap();
    entered_rx.recv_timeout(TIMEOUT).expect("worker entered the provider");
    release_tx
}

/// Collects `count` outcomes keyed by (generation, tag).
fn collect(rx: &Receiver<JobOutcome>, count: usize) -> BTreeMap<(u16, String), Vec<JobOutcome>> {
    let mut out: BTreeMap<(u16, String), Vec<JobOutcome>> = BTreeMap::new();
    for _ in 0..count {
        let outcome = rx.recv_timeout(TIMEOUT).expect("job outcome");
        out.entry((outcome.gen_id.0, outcome.tag.to_string())).or_default().push(outcome);
    }
    out
}

fn read_back(disk: &DiskScheduler, gen_id: GenId) -> GenImage {
    let (tx, rx) = mpsc::channel();
    disk.submit(DiskJob::read(gen_id).on_complete(report(&tx))).unwrap();
    match rx.recv_timeout(TIMEOUT).unwrap().result {
        Ok(JobOutput::Read(image)) => image,
        other => panic!("unexpected read outcome: {other:?}"),
    }
}

// =============================================================================
// Terminate and shutdown
// =============================================================================

#[test]
fn test_terminate_with_ten_jobs_over_three_priorities() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (tx, rx) = mpsc::channel();
    let release = block_worker(&disk, GenId(2), &tx);

    for i in 0..10u16 {
        let gen_id = GenId(10 + i);
        disk.submit(
            DiskJob::write(gen_id, empty_image(gen_id))
                .priority((i % 3) as u8)
                .cancel_on_terminate(i == 4)
                .on_complete(report(&tx)),
        )
        .unwrap();
    }
    disk.submit(DiskJob::terminate().priority(1).on_complete(report(&tx))).unwrap();
    assert!(!disk.is_running());
    assert!(matches!(
        disk.submit(DiskJob::read(GenId(10))),
        Err(Error::DiskIsNotOn)
    ));

    release.send(()).unwrap();
    let outcomes = collect(&rx, 12);
    disk.join();
    assert!(rx.try_recv().is_err(), "every callback runs exactly once");

    let written = |g: u16| {
        matches!(outcomes[&(g, "write".to_string())][0].result, Ok(JobOutput::Written { .. }))
    };
    let cancelled = |g: u16| {
        matches!(outcomes[&(g, "write".to_string())][0].result, Err(Error::DiskTaskCancelled))
    };
    // priority 0: all ran before the terminate job
    for g in [10, 13, 16, 19] {
        assert!(written(g), "gen {g} should be written");
    }
    // priority 1: queued ahead of the terminate job, except the cancellable one
    for g in [11, 17] {
        assert!(written(g), "gen {g} should be written");
    }
    assert!(cancelled(14));
    // priority 2: left in the queue at shutdown
    for g in [12, 15, 18] {
        assert!(cancelled(g), "gen {g} should be cancelled");
    }
    assert!(matches!(
        outcomes[&(0, "terminate".to_string())][0].result,
        Ok(JobOutput::Terminated)
    ));
    assert!(matches!(
        outcomes[&(2, "alloc-write".to_string())][0].result,
        Ok(JobOutput::Written { .. })
    ));

    for g in [10, 11, 13, 16, 17, 19] {
        assert!(dir.gen_path(GenId(g)).exists());
    }
    for g in [12, 14, 15, 18] {
        assert!(!dir.gen_path(GenId(g)).exists());
    }
}

// =============================================================================
// Superseding
// =============================================================================

#[test]
fn test_alloc_write_supersedes_queued_and_rejects_running() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (tx, rx) = mpsc::channel();
    let release = block_worker(&disk, GenId(2), &tx);

    let again = DiskJob::alloc_write(GenId(2), || Ok(empty_image(GenId(2))));
    assert!(matches!(disk.submit(again), Err(Error::DiskTaskExists { gen_id }) if gen_id == GenId(2)));

    let (old, _) = image_with(GenId(3), &[b"old"]);
    let (new, _) = image_with(GenId(3), &[b"new", b"newer"]);
    let old_bytes = old.as_bytes().to_vec();
    let new_bytes = new.as_bytes().to_vec();
    disk.submit(
        DiskJob::alloc_write(GenId(3), move || Ok(old_bytes.clone())).priority(1).on_complete(report(&tx)),
    )
    .unwrap();
    disk.submit(
        DiskJob::alloc_write(GenId(3), move || Ok(new_bytes.clone())).priority(2).on_complete(report(&tx)),
    )
    .unwrap();

    release.send(()).unwrap();
    let outcomes = collect(&rx, 3);
    let gen3 = &outcomes[&(3, "alloc-write".to_string())];
    assert_eq!(gen3.len(), 2);
    assert_eq!(gen3.iter().filter(|o| matches!(o.result, Err(Error::DiskTaskCancelled))).count(), 1);
    assert_eq!(gen3.iter().filter(|o| matches!(o.result, Ok(JobOutput::Written { .. }))).count(), 1);
    assert_eq!(read_back(&disk, GenId(3)), new);
}

#[test]
fn test_compact_jobs_merge_live_granules() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (image, handles) = image_with(GenId(3), &[b"zero", b"one", b"two"]);
    disk.submit(DiskJob::write(GenId(3), image.as_bytes().to_vec())).unwrap();

    let (tx, rx) = mpsc::channel();
    let release = block_worker(&disk, GenId(2), &tx);
    let live = |item: usize| {
        let mut live = PoolBitmaps::for_header(image.header());
        assert!(live.mark_item(image.header(), handles[item].offset()));
        live
    };
    let params = CompactionParams { disk_block_size: 512, trim_references: false };

    disk.submit(DiskJob::compact(GenId(3), live(0), params).priority(2).on_complete(report(&tx))).unwrap();
    let merged = disk.submit(DiskJob::compact(GenId(3), live(1), params).priority(2));
    assert!(matches!(merged, Err(Error::DiskTaskExists { .. })));
    assert_eq!(disk.compact_tasks_count(2), 1);

    // a more urgent job takes the queued bitmaps over
    disk.submit(DiskJob::compact(GenId(3), live(0), params).priority(1).on_complete(report(&tx))).unwrap();
    assert_eq!(disk.compact_tasks_count(2), 0);
    assert_eq!(disk.compact_tasks_count(1), 1);

    release.send(()).unwrap();
    let outcomes = collect(&rx, 3);
    let compacts = &outcomes[&(3, "compact".to_string())];
    assert_eq!(compacts.iter().filter(|o| matches!(o.result, Err(Error::DiskTaskCancelled))).count(), 1);
    assert!(compacts.iter().any(|o| matches!(
        o.result,
        Ok(JobOutput::Compacted { old_len, new_len, .. }) if new_len < old_len
    )));

    let compacted = read_back(&disk, GenId(3));
    assert!(compacted.is_compacted());
    let map = GenMap::build(&compacted).unwrap();
    assert_eq!(read_chain(&compacted, Some(&map), handles[0]).unwrap().payload, b"zero");
    assert_eq!(read_chain(&compacted, Some(&map), handles[1]).unwrap().payload, b"one");
    assert!(read_chain(&compacted, Some(&map), handles[2]).is_err());
}

#[test]
fn test_delete_cancels_queued_jobs_for_the_generation() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (image, handles) = image_with(GenId(4), &[b"doomed"]);
    disk.submit(DiskJob::write(GenId(4), image.as_bytes().to_vec())).unwrap();

    let (tx, rx) = mpsc::channel();
    let release = block_worker(&disk, GenId(2), &tx);
    let mut live = PoolBitmaps::for_header(image.header());
    live.mark_item(image.header(), handles[0].offset());
    disk.submit(DiskJob::read(GenId(4)).priority(1).on_complete(report(&tx))).unwrap();
    disk.submit(
        DiskJob::compact(GenId(4), live, CompactionParams::default()).priority(2).on_complete(report(&tx)),
    )
    .unwrap();
    disk.submit(DiskJob::write(GenId(5), empty_image(GenId(5))).priority(2).on_complete(report(&tx)))
        .unwrap();
    disk.submit(DiskJob::delete(GenId(4)).priority(2).on_complete(report(&tx))).unwrap();

    release.send(()).unwrap();
    let outcomes = collect(&rx, 5);
    assert!(matches!(outcomes[&(4, "read".to_string())][0].result, Err(Error::DiskTaskCancelled)));
    assert!(matches!(outcomes[&(4, "compact".to_string())][0].result, Err(Error::DiskTaskCancelled)));
    assert!(matches!(outcomes[&(4, "delete".to_string())][0].result, Ok(JobOutput::Deleted)));
    assert!(matches!(outcomes[&(5, "write".to_string())][0].result, Ok(JobOutput::Written { .. })));
    assert_eq!(disk.generation_size(GenId(4)).unwrap(), 0);
}

#[test]
fn test_remove_compact_tasks_cancels_queued_rewrites() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (tx, rx) = mpsc::channel();
    let release = block_worker(&disk, GenId(2), &tx);
    disk.submit(DiskJob::alloc_write(GenId(6), || Ok(empty_image(GenId(6)))).on_complete(report(&tx)))
        .unwrap();
    disk.submit(
        DiskJob::compact(GenId(7), PoolBitmaps::new(1), CompactionParams::default())
            .priority(1)
            .on_complete(report(&tx)),
    )
    .unwrap();
    assert_eq!(disk.remove_compact_tasks(), 2);
    assert_eq!(disk.compact_tasks_count(1), 0);

    release.send(()).unwrap();
    let outcomes = collect(&rx, 3);
    assert!(matches!(outcomes[&(6, "alloc-write".to_string())][0].result, Err(Error::DiskTaskCancelled)));
    assert!(matches!(outcomes[&(7, "compact".to_string())][0].result, Err(Error::DiskTaskCancelled)));
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn test_list_reports_headers_and_skips_empty_files() {
    let dir = StoreDir::new();
    let disk = DiskScheduler::start(&test_store_config(dir.path())).unwrap();
    let (a, _) = image_with(GenId(3), &[b"a"]);
    let (b, _) = image_with(GenId(8), &[b"b"]);
    for img in [&a, &b] {
        disk.submit(DiskJob::write(img.gen_id(), img.as_bytes().to_vec())).unwrap();
    }
    let (tx, rx) = mpsc::channel();
    disk.submit(DiskJob::list().on_complete(report(&tx))).unwrap();
    let listed = rx.recv_timeout(TIMEOUT).unwrap();
    dir.write_gen(GenId(9), b"");
    disk.submit(DiskJob::list().on_complete(report(&tx))).unwrap();
    let listed_again = rx.recv_timeout(TIMEOUT).unwrap();

    for outcome in [listed, listed_again] {
        assert_eq!(outcome.tag, JobTag::List);
        match outcome.result {
            Ok(JobOutput::Listed(files)) => {
                let ids: Vec<GenId> = files.iter().map(|f| f.gen_id).collect();
                assert_eq!(ids, vec![GenId(3), GenId(8)]);
                assert_eq!(files[1].header, *b.header());
                assert_eq!(files[0].file_size, a.len() as u64);
            }
            other => panic!("unexpected list outcome: {other:?}"),
        }
    }
}

// =============================================================================
// Fault injection
// =============================================================================

/// Real file I/O filtered through an [`IoFaultInjector`].
struct FaultyIo {
    injector: Arc<IoFaultInjector>,
}

impl FileIo for FaultyIo {
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        match self.injector.on_read(buf.len()) {
            IoFault::Pass => OsFileIo.read_at(file, buf, offset),
            IoFault::Short(n) => OsFileIo.read_at(file, &mut buf[..n.max(1)], offset),
            IoFault::Interrupt => Err(io::Error::from(io::ErrorKind::Interrupted)),
            IoFault::Fail => Err(io::Error::other("injected read failure")),
        }
    }

    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        match self.injector.on_write(buf.len()) {
            IoFault::Pass => OsFileIo.write_at(file, buf, offset),
            IoFault::Short(n) => OsFileIo.write_at(file, &buf[..n.max(1)], offset),
            IoFault::Interrupt => Err(io::Error::from(io::ErrorKind::Interrupted)),
            IoFault::Fail => Err(io::Error::other("injected write failure")),
        }
    }
}

fn faulty_disk(dir: &StoreDir, point: FaultPoint, times: u32) -> (DiskScheduler, Arc<IoFaultInjector>) {
    let injector = IoFaultInjector::new(point, times);
    let io = Arc::new(FaultyIo { injector: Arc::clone(&injector) });
    let disk = DiskScheduler::start_with_io(&test_store_config(dir.path()), io).unwrap();
    (disk, injector)
}

fn write_and_wait(disk: &DiskScheduler, image: &GenImage) -> JobOutcome {
    let (tx, rx) = mpsc::channel();
    disk.submit(DiskJob::write(image.gen_id(), image.as_bytes().to_vec()).on_complete(report(&tx)))
        .unwrap();
    rx.recv_timeout(TIMEOUT).unwrap()
}

#[test]
fn test_short_and_interrupted_transfers_are_retried() {
    let body = vec![0xa5u8; 700];
    let (image, handles) = image_with(GenId(3), &[&body, b"tail"]);

    for point in [
        FaultPoint::ShortWrite,
        FaultPoint::InterruptedWrite,
        FaultPoint::ShortRead,
        FaultPoint::InterruptedRead,
    ] {
        let dir = StoreDir::new();
        let (disk, injector) = faulty_disk(&dir, point, 6);
        injector.arm();
        assert!(matches!(write_and_wait(&disk, &image).result, Ok(JobOutput::Written { .. })));
        let read = read_back(&disk, GenId(3));
        assert_eq!(read, image, "{point:?}");
        assert_eq!(read_chain(&read, None, handles[0]).unwrap().payload, body);
        assert_eq!(injector.injected(), 6, "{point:?}");
    }
}

#[test]
fn test_hard_write_failure_keeps_previous_file() {
    let dir = StoreDir::new();
    let (disk, injector) = faulty_disk(&dir, FaultPoint::FailedWrite, 1);
    let (old, _) = image_with(GenId(3), &[b"old"]);
    assert!(matches!(write_and_wait(&disk, &old).result, Ok(JobOutput::Written { .. })));

    injector.arm();
    let (new, _) = image_with(GenId(3), &[b"new"]);
    match write_and_wait(&disk, &new).result {
        Err(Error::FileIo { offset, .. }) => assert_eq!(offset, 0),
        other => panic!("expected FileIo, got {other:?}"),
    }
    injector.disarm();
    assert_eq!(read_back(&disk, GenId(3)), old);
    assert_eq!(dir.gen_ids(), vec![GenId(3)]);
    assert!(dir.gen_path(GenId(3)).ends_with(gen_file_name(GenId(3))));
    assert!(dir.temp_files().is_empty());
}

#[test]
fn test_retry_limit_fails_the_read() {
    let dir = StoreDir::new();
    let (disk, injector) = faulty_disk(&dir, FaultPoint::InterruptedRead, 1000);
    let (image, _) = image_with(GenId(3), &[b"x"]);
    assert!(matches!(write_and_wait(&disk, &image).result, Ok(JobOutput::Written { .. })));
    injector.arm();

    let (tx, rx) = mpsc::channel();
    disk.submit(DiskJob::read(GenId(3)).on_complete(report(&tx))).unwrap();
    let outcome = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(outcome.result, Err(Error::FileIo { .. })));
    // the first attempt plus the configured retries
    assert_eq!(injector.read_count(), 17);
}

// =============================================================================
// Atomic replacement
// =============================================================================

/// Pauses the first write after being armed until the test has looked
/// at the directory.
struct PausingIo {
    armed: AtomicBool,
    barrier: Arc<Barrier>,
}

impl FileIo for PausingIo {
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        OsFileIo.read_at(file, buf, offset)
    }

    fn write_at(&self, file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.barrier.wait();
            self.barrier.wait();
        }
        OsFileIo.write_at(file, buf, offset)
    }
}

#[test]
fn test_partial_image_never_visible_at_canonical_name() {
    let dir = StoreDir::new();
    let barrier = Arc::new(Barrier::new(2));
    let io = Arc::new(PausingIo { armed: AtomicBool::new(false), barrier: Arc::clone(&barrier) });
    let disk = DiskScheduler::start_with_io(&test_store_config(dir.path()), Arc::clone(&io) as Arc<dyn FileIo>)
        .unwrap();
    let (old, _) = image_with(GenId(5), &[b"old contents"]);
    assert!(matches!(write_and_wait(&disk, &old).result, Ok(JobOutput::Written { .. })));

    let big = vec![0x3cu8; 2000];
    let (new, _) = image_with(GenId(5), &[&big, &big]);
    io.armed.store(true, Ordering::SeqCst);
    let (tx, rx) = mpsc::channel();
    disk.submit(DiskJob::write(GenId(5), new.as_bytes().to_vec()).on_complete(report(&tx))).unwrap();

    barrier.wait();
    let canonical = dir.gen_path(GenId(5));
    assert_eq!(std::fs::read(&canonical).unwrap(), old.as_bytes());
    let temps = dir.temp_files();
    assert_eq!(temps.len(), 1);
    assert!(genstore::disk::is_temp_name(&temps[0]));
    barrier.wait();

    assert!(matches!(rx.recv_timeout(TIMEOUT).unwrap().result, Ok(JobOutput::Written { .. })));
    assert_eq!(std::fs::read(&canonical).unwrap(), new.as_bytes());
    assert_eq!(dir.gen_ids(), vec![GenId(5)]);
    assert!(dir.temp_files().is_empty());
}
