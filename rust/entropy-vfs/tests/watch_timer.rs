//! The polling watcher driven end-to-end by the core timer service.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use entropy_core::{TimerService, TimerServiceConfig, WorkService, WorkServiceConfig};
use entropy_vfs::{FileWatchEvent, FileWatchManager, LocalFileSystemBackend};

#[test]
fn timer_driven_watcher_reports_file_changes() {
    let dir = std::env::temp_dir().join(format!(
        "entropy_watch_timer_test_{}",
        std::process::id()
    ));
    if dir.exists() {
        fs::remove_dir_all(&dir).ok();
    }
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("observed.txt");

    let service = Arc::new(WorkService::new(WorkServiceConfig::with_threads(2)));
    service.start().unwrap();
    let timers = TimerService::new(TimerServiceConfig::default());
    timers.set_work_service(&service).unwrap();

    let manager = FileWatchManager::new(Arc::new(LocalFileSystemBackend::new()));
    let created = Arc::new(AtomicUsize::new(0));
    let modified = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&created);
    let m = Arc::clone(&modified);
    manager.watch(
        &path,
        Arc::new(move |event: &FileWatchEvent| match event {
            FileWatchEvent::Created(_) => {
                c.fetch_add(1, Ordering::Relaxed);
            }
            FileWatchEvent::Modified(_) => {
                m.fetch_add(1, Ordering::Relaxed);
            }
            FileWatchEvent::Removed(_) => {}
        }),
    );
    manager
        .start_polling(&timers, Duration::from_millis(20))
        .unwrap();

    let wait_until = |counter: &AtomicUsize| {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) == 0 {
            if Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        counter.load(Ordering::Relaxed)
    };

    fs::write(&path, "v1").unwrap();
    assert_eq!(wait_until(&created), 1, "creation must be observed");

    fs::write(&path, "a much longer second version").unwrap();
    assert!(wait_until(&modified) >= 1, "modification must be observed");

    manager.stop_polling();
    timers.stop();
    service.stop();
    fs::remove_dir_all(&dir).ok();
}
