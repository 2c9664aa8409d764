//! End-to-end VFS tests: handles over a real worker service, serialized
//! writes, metadata batches, and listing pagination.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use entropy_core::{ContractGroup, WorkService, WorkServiceConfig};
use entropy_vfs::{
    AdvisoryFallback, CopyOptions, FileError, FileOpStatus, ListDirectoryOptions, SortOrder,
    VfsConfig, VirtualFileSystem, WriteOptions,
};

struct Harness {
    service: Arc<WorkService>,
    group: Arc<ContractGroup>,
    vfs: Arc<VirtualFileSystem>,
    dir: PathBuf,
}

impl Harness {
    fn new(name: &str) -> Self {
        let dir =
            std::env::temp_dir().join(format!("entropy_vfs_suite_{name}_{}", std::process::id()));
        if dir.exists() {
            fs::remove_dir_all(&dir).ok();
        }
        fs::create_dir_all(&dir).expect("create tmp dir");

        let group = ContractGroup::new(64, "vfs-suite");
        let service = Arc::new(WorkService::new(WorkServiceConfig::with_threads(2)));
        service.add_group(&group).unwrap();
        service.start().unwrap();
        let vfs = VirtualFileSystem::new(Arc::clone(&group));
        Self {
            service,
            group,
            vfs,
            dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.group.stop();
        self.service.stop();
        fs::remove_dir_all(&self.dir).ok();
    }
}

#[test]
fn write_then_read_returns_identical_bytes() {
    let h = Harness::new("round_trip");
    let file = h.vfs.create_file_handle(h.dir.join("blob.bin"));

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    assert_eq!(file.write_all(payload.clone()).wait(), FileOpStatus::Complete);

    let read = file.read_all();
    assert_eq!(read.wait(), FileOpStatus::Complete);
    assert_eq!(read.contents_bytes(), payload);
}

#[test]
fn read_range_returns_partial_past_eof() {
    let h = Harness::new("partial");
    let file = h.vfs.create_file_handle(h.dir.join("short.txt"));
    file.write_all("0123456789").wait();

    let read = file.read_range(6, 10);
    assert_eq!(read.wait(), FileOpStatus::Partial);
    assert_eq!(read.contents_bytes(), b"6789");
}

#[test]
fn missing_file_read_fails_with_code() {
    let h = Harness::new("missing");
    let file = h.vfs.create_file_handle(h.dir.join("ghost.txt"));

    let read = file.read_all();
    assert_eq!(read.wait(), FileOpStatus::Failed);
    assert_eq!(read.error_code(), Some(FileError::FileNotFound));
    let info = read.error_info().unwrap();
    assert!(info.path.is_some());
}

#[test]
fn write_line_and_read_line_round_trip() {
    let h = Harness::new("lines");
    let file = h.vfs.create_file_handle(h.dir.join("lines.txt"));
    file.write_all("alpha\nbeta\ngamma\n").wait();

    assert_eq!(file.write_line(1, "BETA").wait(), FileOpStatus::Complete);
    let line = file.read_line(1);
    line.wait();
    assert_eq!(line.contents_text(), "BETA");

    // The rest of the file is untouched.
    let all = file.read_all();
    all.wait();
    assert_eq!(all.contents_text(), "alpha\nBETA\ngamma\n");
}

#[test]
fn concurrent_write_line_to_one_path_never_tears() {
    // Two writers race on line 0 of the same file; serialization plus
    // atomic replace must leave exactly one intact value.
    let h = Harness::new("serialized");
    let path = h.dir.join("contended.txt");
    let file_a = h.vfs.create_file_handle(&path);
    let file_b = h.vfs.create_file_handle(&path);
    file_a.write_all("seed\n").wait();

    let wa = file_a.write_line(0, "AAAAAAAAAA");
    let wb = file_b.write_line(0, "BBBBBBBBBB");
    assert_eq!(wa.wait(), FileOpStatus::Complete);
    assert_eq!(wb.wait(), FileOpStatus::Complete);

    let read = file_a.read_line(0);
    read.wait();
    let line = read.contents_text();
    assert!(
        line == "AAAAAAAAAA" || line == "BBBBBBBBBB",
        "line must be one writer's value, got {:?}",
        line
    );

    // Exactly one line, and no temp files left behind.
    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 1);
    let leftovers: Vec<_> = fs::read_dir(&h.dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
}

#[test]
fn handles_with_equivalent_spellings_are_equal() {
    let h = Harness::new("identity");
    fs::create_dir_all(h.dir.join("sub")).unwrap();
    let plain = h.vfs.create_file_handle(h.dir.join("f.txt"));
    let dotted = h.vfs.create_file_handle(h.dir.join("sub/../f.txt"));
    assert_eq!(plain, dotted);
    assert_eq!(plain.key(), dotted.key());
}

#[test]
fn metadata_batch_preserves_order_and_reports_missing() {
    let h = Harness::new("batch");
    let a = h.dir.join("a.txt");
    let b = h.dir.join("b.txt");
    let c = h.dir.join("c.txt");
    fs::write(&a, "1").unwrap();
    fs::write(&b, "22").unwrap();
    fs::write(&c, "333").unwrap();

    let op = h
        .vfs
        .get_metadata_batch(vec![a, b, c, h.dir.join("missing.txt")]);
    assert_eq!(op.wait(), FileOpStatus::Complete);
    let batch = op.metadata_batch();
    assert_eq!(batch.len(), 4);
    assert!(batch[0].exists && batch[0].size == 1);
    assert!(batch[1].exists && batch[1].size == 2);
    assert!(batch[2].exists && batch[2].size == 3);
    assert!(!batch[3].exists);
}

#[test]
fn directory_listing_sorts_and_paginates() {
    let h = Harness::new("listing");
    fs::write(h.dir.join("a.txt"), "1").unwrap();
    fs::write(h.dir.join("b.txt"), "22").unwrap();
    fs::write(h.dir.join("c.txt"), "333").unwrap();
    let dir = h.vfs.create_directory_handle(&h.dir);

    let op = dir.list(ListDirectoryOptions {
        sort_by: SortOrder::ByName,
        max_results: 2,
        ..Default::default()
    });
    op.wait();
    let names: Vec<String> = op.directory_entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);

    let op = dir.list(ListDirectoryOptions {
        sort_by: SortOrder::BySize,
        max_results: 2,
        ..Default::default()
    });
    op.wait();
    let names: Vec<String> = op.directory_entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["a.txt", "b.txt"]);

    let op = dir.list(ListDirectoryOptions {
        sort_by: SortOrder::BySize,
        ..Default::default()
    });
    op.wait();
    let names: Vec<String> = op.directory_entries().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
}

#[test]
fn directory_create_and_remove() {
    let h = Harness::new("dirs");
    let nested = h.dir.join("deep/nested/dir");
    let dir = h.vfs.create_directory_handle(&nested);

    assert_eq!(dir.create(false).wait(), FileOpStatus::Complete);
    assert!(nested.is_dir());

    let meta = dir.get_metadata();
    meta.wait();
    assert!(meta.metadata().unwrap().is_directory);

    assert_eq!(dir.remove(true).wait(), FileOpStatus::Complete);
    assert!(!nested.exists());
}

#[test]
fn create_empty_and_remove_file() {
    let h = Harness::new("empty");
    let file = h.vfs.create_file_handle(h.dir.join("touch.txt"));
    assert!(!file.exists());

    assert_eq!(file.create_empty().wait(), FileOpStatus::Complete);
    assert!(file.exists());

    assert_eq!(file.remove().wait(), FileOpStatus::Complete);
    assert!(!file.exists());
}

#[test]
fn fsync_write_option_is_accepted() {
    let h = Harness::new("fsync");
    let file = h.vfs.create_file_handle(h.dir.join("durable.txt"));
    let op = file.write_all_with(
        "must hit the platter",
        WriteOptions {
            fsync: true,
            ..Default::default()
        },
    );
    assert_eq!(op.wait(), FileOpStatus::Complete);
}

#[test]
fn streams_work_through_handles() {
    let h = Harness::new("streams");
    let file = h.vfs.create_file_handle(h.dir.join("s.txt"));
    file.write_all("streamed data").wait();

    let mut stream = file.open_read_stream().unwrap();
    assert_eq!(stream.read_to_end().unwrap(), b"streamed data");

    let mut out = file.open_write_stream(true).unwrap();
    out.write(b"!").unwrap();
    out.flush().unwrap();
    drop(out);

    let read = file.read_all();
    read.wait();
    assert_eq!(read.contents_text(), "streamed data!");

    let mut buffered = file.open_buffered_stream(128).unwrap();
    assert_eq!(buffered.read_to_end().unwrap(), b"streamed data!");
}

#[test]
fn copy_and_move_through_handles() {
    let h = Harness::new("copy_move");
    let src = h.vfs.create_file_handle(h.dir.join("src.txt"));
    src.write_all("portable payload").wait();

    let copy_dst = h.dir.join("copied.txt");
    let op = src.copy_to(&copy_dst, CopyOptions::default());
    assert_eq!(op.wait(), FileOpStatus::Complete);
    assert_eq!(op.bytes_written(), 16);
    assert_eq!(fs::read_to_string(&copy_dst).unwrap(), "portable payload");

    // Copy again without overwrite: destination exists.
    let op = src.copy_to(&copy_dst, CopyOptions::default());
    assert_eq!(op.wait(), FileOpStatus::Failed);
    assert_eq!(op.error_code(), Some(FileError::Conflict));

    let move_dst = h.dir.join("moved.txt");
    let op = src.move_to(&move_dst, false);
    assert_eq!(op.wait(), FileOpStatus::Complete);
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(&move_dst).unwrap(), "portable payload");
}

#[test]
fn bounded_fallback_config_still_serializes_writes() {
    // Sanity check of the FallbackWithTimeout policy under a real service:
    // uncontended writes acquire the bounded lock and complete normally.
    let dir = std::env::temp_dir().join(format!(
        "entropy_vfs_suite_advisory_{}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    let group = ContractGroup::new(32, "advisory");
    let service = Arc::new(WorkService::new(WorkServiceConfig::with_threads(2)));
    service.add_group(&group).unwrap();
    service.start().unwrap();
    let vfs = VirtualFileSystem::with_config(
        Arc::clone(&group),
        VfsConfig {
            advisory_fallback: AdvisoryFallback::FallbackWithTimeout,
            advisory_acquire_timeout: Duration::from_millis(250),
            ..Default::default()
        },
    );

    let path = dir.join("bounded.txt");
    let file = vfs.create_file_handle(&path);
    for i in 0..10 {
        let op = file.write_line(0, format!("round {}", i));
        assert_eq!(op.wait(), FileOpStatus::Complete);
    }
    let read = file.read_line(0);
    read.wait();
    assert_eq!(read.contents_text(), "round 9");

    group.stop();
    service.stop();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn lock_file_mode_creates_sidecars_through_the_facade() {
    let dir = std::env::temp_dir().join(format!(
        "entropy_vfs_suite_lockfile_{}",
        std::process::id()
    ));
    if dir.exists() {
        fs::remove_dir_all(&dir).ok();
    }
    fs::create_dir_all(&dir).unwrap();
    let group = ContractGroup::new(32, "lockfile");
    let service = Arc::new(WorkService::new(WorkServiceConfig::with_threads(2)));
    service.add_group(&group).unwrap();
    service.start().unwrap();
    let vfs = VirtualFileSystem::with_config(
        Arc::clone(&group),
        VfsConfig {
            default_use_lock_file: true,
            lock_acquire_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );

    let path = dir.join("guarded.txt");
    let file = vfs.create_file_handle(&path);
    assert_eq!(file.write_all("cross-process safe").wait(), FileOpStatus::Complete);
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "cross-process safe"
    );
    // The write went through the sidecar lock configured as the default.
    assert!(dir.join("guarded.txt.lock").exists());

    group.stop();
    service.stop();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn wait_from_inside_a_worker_does_not_deadlock() {
    // A contract that issues a VFS operation and waits on it exercises the
    // cooperative progress pump.
    let h = Harness::new("self_wait");
    let vfs = Arc::clone(&h.vfs);
    let path = h.dir.join("inner.txt");

    let (tx, rx) = std::sync::mpsc::channel::<FileOpStatus>();
    let handle = h.group.create_contract(
        Box::new(move || {
            let file = vfs.create_file_handle(&path);
            let status = file.write_all("written from a worker").wait();
            tx.send(status).ok();
        }),
        entropy_core::ExecutionType::AnyThread,
    );
    handle.schedule();

    let status = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("worker-issued wait must complete");
    assert_eq!(status, FileOpStatus::Complete);
}
