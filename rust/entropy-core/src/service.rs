//! Worker-thread service that drives contract groups.
//!
//! A [`WorkService`] owns a pool of OS worker threads plus the coordination
//! needed for the application's main-thread pump. Each worker loops:
//!
//! 1. Ask the [`SchedulerStrategy`] for a group. No group → park briefly on
//!    the service condvar (woken by `notify_work_available`).
//! 2. Select a ready contract from that group's signal tree.
//! 3. Execute it and rotate the worker's selection bias, or report the empty
//!    visit back to the strategy.
//!
//! Groups are attached with [`add_group`](WorkService::add_group), which also
//! installs the service as the group's concurrency provider so schedules wake
//! parked workers. [`remove_group`](WorkService::remove_group) follows a
//! lock-and-drain discipline: the group leaves the strategy first, then the
//! call blocks until no worker still sits inside one of the group's selection
//! calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::error::CoreError;
use crate::group::{ConcurrencyProvider, ContractGroup};
use crate::strategy::{AdaptiveRanking, SchedulerStrategy};

/// How long a worker parks when the strategy reports nothing to do.
const PARK_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`WorkService::new`].
pub struct WorkServiceConfig {
    /// Worker thread count; `0` selects the hardware concurrency.
    pub thread_count: usize,
    /// Group-selection policy; defaults to [`AdaptiveRanking`].
    pub strategy: Arc<dyn SchedulerStrategy>,
}

impl Default for WorkServiceConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            strategy: Arc::new(AdaptiveRanking::new()),
        }
    }
}

impl WorkServiceConfig {
    /// Config with an explicit thread count and the default strategy.
    pub fn with_threads(thread_count: usize) -> Self {
        Self {
            thread_count,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared worker state
// ---------------------------------------------------------------------------

struct ServiceInner {
    strategy: Arc<dyn SchedulerStrategy>,
    groups: Mutex<Vec<Arc<ContractGroup>>>,
    stopping: AtomicBool,
    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl ServiceInner {
    fn wake_workers(&self) {
        let _guard = self.park_lock.lock().unwrap();
        self.park_cv.notify_all();
    }

    fn worker_loop(&self, index: usize) {
        tracing::trace!(worker = index, "worker started");
        // Seed each worker with a distinct bias so selection pressure spreads
        // across the signal trees from the first iteration.
        let mut bias: u64 = (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;

        while !self.stopping.load(Ordering::Acquire) {
            let Some(group) = self.strategy.select_next_group() else {
                let guard = self.park_lock.lock().unwrap();
                // Re-check under the lock so a wake between the strategy call
                // and here is not lost.
                if !self.stopping.load(Ordering::Acquire) {
                    let _ = self
                        .park_cv
                        .wait_timeout(guard, PARK_INTERVAL)
                        .unwrap();
                }
                continue;
            };

            let handle = group.select_for_execution(&mut bias);
            if handle.valid() {
                group.execute_contract(&handle);
                bias = bias.rotate_left(1);
                self.strategy.notify_selection_result(&group, true);
            } else {
                self.strategy.notify_selection_result(&group, false);
            }
        }
        tracing::trace!(worker = index, "worker exiting");
    }
}

impl ConcurrencyProvider for ServiceInner {
    fn notify_work_available(&self, group: &Arc<ContractGroup>) {
        self.strategy.notify_work_available(group);
        self.wake_workers();
    }
}

// ---------------------------------------------------------------------------
// WorkService
// ---------------------------------------------------------------------------

/// Lifecycle phase of a [`WorkService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    /// Constructed; no threads yet.
    Created,
    /// Workers are running.
    Started,
    /// Workers have been joined; groups remain attached.
    Stopped,
}

/// Thread pool executing contracts from registered groups.
pub struct WorkService {
    inner: Arc<ServiceInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_count: usize,
    phase: Mutex<ServicePhase>,
}

impl WorkService {
    /// Create a service; call [`start`](Self::start) to spawn workers.
    pub fn new(config: WorkServiceConfig) -> Self {
        let thread_count = if config.thread_count == 0 {
            num_cpus::get().max(1)
        } else {
            config.thread_count
        };
        Self {
            inner: Arc::new(ServiceInner {
                strategy: config.strategy,
                groups: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                park_lock: Mutex::new(()),
                park_cv: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
            thread_count,
            phase: Mutex::new(ServicePhase::Created),
        }
    }

    /// Number of worker threads this service runs when started.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ServicePhase {
        *self.phase.lock().unwrap()
    }

    /// Spawn the worker threads.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut phase = self.phase.lock().unwrap();
        if *phase == ServicePhase::Started {
            return Err(CoreError::ServiceAlreadyStarted);
        }
        self.inner.stopping.store(false, Ordering::Release);

        let mut workers = self.workers.lock().unwrap();
        for index in 0..self.thread_count {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("entropy-worker-{}", index))
                .spawn(move || inner.worker_loop(index))
                .map_err(|e| CoreError::ThreadSpawn(e.to_string()))?;
            workers.push(handle);
        }
        *phase = ServicePhase::Started;
        tracing::debug!(threads = self.thread_count, "work service started");
        Ok(())
    }

    /// Signal workers to exit and join them.
    ///
    /// Contracts still scheduled in attached groups remain scheduled; they
    /// run if the service is started again or drained manually.
    pub fn stop(&self) {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != ServicePhase::Started {
                return;
            }
            *phase = ServicePhase::Stopped;
        }
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wake_workers();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("work service stopped");
    }

    // -- group management ---------------------------------------------------

    /// Attach a group: it joins the strategy and the service becomes its
    /// concurrency provider.
    pub fn add_group(&self, group: &Arc<ContractGroup>) -> Result<(), CoreError> {
        let mut groups = self.inner.groups.lock().unwrap();
        if groups.iter().any(|g| Arc::ptr_eq(g, group)) {
            return Err(CoreError::GroupAlreadyRegistered(group.name().to_string()));
        }
        groups.push(Arc::clone(group));
        drop(groups);

        self.inner.strategy.notify_group_added(group);
        let inner_dyn: Arc<dyn ConcurrencyProvider> = self.inner.clone();
        let provider: Weak<dyn ConcurrencyProvider> = Arc::downgrade(&inner_dyn);
        group.set_concurrency_provider(Some(provider));
        self.inner.wake_workers();
        Ok(())
    }

    /// Detach a group.
    ///
    /// The group leaves the strategy immediately; the call then blocks until
    /// no worker is inside one of the group's selection calls, so the caller
    /// may safely tear the group down afterwards.
    pub fn remove_group(&self, group: &Arc<ContractGroup>) -> Result<(), CoreError> {
        {
            let mut groups = self.inner.groups.lock().unwrap();
            let before = groups.len();
            groups.retain(|g| !Arc::ptr_eq(g, group));
            if groups.len() == before {
                return Err(CoreError::GroupNotRegistered(group.name().to_string()));
            }
        }
        self.inner.strategy.notify_group_removed(group);
        group.set_concurrency_provider(None);

        // Drain: workers that already picked the group finish their current
        // selection call, then can never see it again.
        while group.selecting_count() > 0 {
            thread::yield_now();
        }
        Ok(())
    }

    /// Number of currently attached groups.
    pub fn group_count(&self) -> usize {
        self.inner.groups.lock().unwrap().len()
    }

    // -- main-thread pumping ------------------------------------------------

    /// Drain up to `max` main-thread contracts across all attached groups.
    ///
    /// Intended to be called from the application's event loop. Returns the
    /// number executed.
    pub fn execute_main_thread_work(&self, max: usize) -> usize {
        let groups: Vec<Arc<ContractGroup>> =
            self.inner.groups.lock().unwrap().iter().cloned().collect();
        let mut executed = 0;
        for group in &groups {
            if executed >= max {
                break;
            }
            executed += group.execute_main_thread_work(max - executed);
        }
        executed
    }

    /// Drain main-thread contracts until every attached group is empty.
    pub fn execute_all_main_thread_work(&self) -> usize {
        let mut total = 0;
        loop {
            let executed = self.execute_main_thread_work(usize::MAX);
            total += executed;
            if executed == 0 {
                break;
            }
        }
        total
    }
}

impl Drop for WorkService {
    fn drop(&mut self) {
        self.stop();
        // Detach provider pointers so groups outliving the service do not
        // notify a dead service.
        let groups = self.inner.groups.lock().unwrap();
        for group in groups.iter() {
            group.set_concurrency_provider(None);
        }
    }
}

impl std::fmt::Debug for WorkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkService")
            .field("thread_count", &self.thread_count)
            .field("phase", &self.phase())
            .field("groups", &self.group_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ExecutionType;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(counter: &AtomicUsize, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        while counter.load(Ordering::Relaxed) < expected {
            if Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        counter.load(Ordering::Relaxed)
    }

    #[test]
    fn service_executes_scheduled_contracts() {
        let service = WorkService::new(WorkServiceConfig::with_threads(2));
        let group = ContractGroup::new(32, "svc");
        service.add_group(&group).unwrap();
        service.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let n = 100;
        let mut submitted = 0;
        while submitted < n {
            let ctr = Arc::clone(&counter);
            let h = group.create_contract(
                Box::new(move || {
                    ctr.fetch_add(1, Ordering::Relaxed);
                }),
                ExecutionType::AnyThread,
            );
            if h.valid() {
                h.schedule();
                submitted += 1;
            } else {
                // Pool momentarily full; the workers are draining it.
                thread::sleep(Duration::from_millis(1));
            }
        }

        let seen = wait_for(&counter, n, Duration::from_secs(5));
        service.stop();
        assert_eq!(seen, n, "workers must have executed every contract");
    }

    #[test]
    fn auto_thread_count_is_nonzero() {
        let service = WorkService::new(WorkServiceConfig::default());
        assert!(service.thread_count() >= 1);
    }

    #[test]
    fn start_twice_fails() {
        let service = WorkService::new(WorkServiceConfig::with_threads(1));
        service.start().unwrap();
        assert!(matches!(
            service.start(),
            Err(CoreError::ServiceAlreadyStarted)
        ));
        service.stop();
    }

    #[test]
    fn schedule_wakes_parked_workers() {
        let service = WorkService::new(WorkServiceConfig::with_threads(2));
        let group = ContractGroup::new(8, "wake");
        service.add_group(&group).unwrap();
        service.start().unwrap();

        // Give workers time to park.
        thread::sleep(Duration::from_millis(20));

        let counter = Arc::new(AtomicUsize::new(0));
        let ctr = Arc::clone(&counter);
        let h = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::AnyThread,
        );
        h.schedule();

        let seen = wait_for(&counter, 1, Duration::from_secs(5));
        service.stop();
        assert_eq!(seen, 1);
    }

    #[test]
    fn workers_never_run_main_thread_contracts() {
        let service = WorkService::new(WorkServiceConfig::with_threads(2));
        let group = ContractGroup::new(8, "main-only");
        service.add_group(&group).unwrap();
        service.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let ctr = Arc::clone(&counter);
        let h = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::MainThread,
        );
        h.schedule();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        // The pump runs it on the calling thread.
        assert_eq!(service.execute_main_thread_work(4), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        service.stop();
    }

    #[test]
    fn add_group_twice_fails() {
        let service = WorkService::new(WorkServiceConfig::with_threads(1));
        let group = ContractGroup::new(4, "dup");
        service.add_group(&group).unwrap();
        assert!(matches!(
            service.add_group(&group),
            Err(CoreError::GroupAlreadyRegistered(_))
        ));
    }

    #[test]
    fn remove_group_drains_and_detaches() {
        let service = WorkService::new(WorkServiceConfig::with_threads(2));
        let group = ContractGroup::new(8, "detach");
        service.add_group(&group).unwrap();
        service.start().unwrap();

        service.remove_group(&group).unwrap();
        assert_eq!(service.group_count(), 0);
        assert_eq!(group.selecting_count(), 0);

        // Work scheduled after removal is never picked up by the service.
        let counter = Arc::new(AtomicUsize::new(0));
        let ctr = Arc::clone(&counter);
        let h = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::AnyThread,
        );
        h.schedule();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        service.stop();
    }

    #[test]
    fn remove_unknown_group_fails() {
        let service = WorkService::new(WorkServiceConfig::with_threads(1));
        let group = ContractGroup::new(4, "unknown");
        assert!(matches!(
            service.remove_group(&group),
            Err(CoreError::GroupNotRegistered(_))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let service = WorkService::new(WorkServiceConfig::with_threads(1));
        service.start().unwrap();
        service.stop();
        service.stop();
        assert_eq!(service.phase(), ServicePhase::Stopped);
    }
}
