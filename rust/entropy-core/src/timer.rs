//! Delayed and repeating work expressed as yielding graph nodes.
//!
//! A timer is a yieldable node in a private [`WorkGraph`]: each invocation
//! checks the clock, runs the user callback when due, and either completes
//! (one-shot) or computes the next fire time and parks itself with
//! [`NodeResult::YieldUntil`]. No dedicated timer thread exists — progress
//! comes from a **pump contract**, a self-rescheduling any-thread contract
//! that drains the graph's timed-deferred queue and requeues itself.
//!
//! Guarantees:
//!
//! * one-shot timers fire at most once;
//! * cancellation is exactly-once and idempotent;
//! * a repeating timer that falls behind skips the missed intervals and
//!   resumes on its original cadence — it never burst-fires to catch up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::graph::{NodeHandle, NodeResult, WorkGraph};
use crate::group::{ContractGroup, ExecutionType};
use crate::handle::ContractHandle;
use crate::service::WorkService;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`TimerService::new`].
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// Capacity of the contract group backing timer nodes and the pump.
    pub group_capacity: usize,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            group_capacity: 128,
        }
    }
}

// ---------------------------------------------------------------------------
// TimerData / Timer
// ---------------------------------------------------------------------------

struct TimerData {
    fire_time: Mutex<Instant>,
    interval: Duration,
    work: Box<dyn Fn() + Send + Sync>,
    repeating: bool,
    cancelled: AtomicBool,
}

/// Handle to a scheduled timer.
///
/// Dropping a `Timer` does not cancel it; call
/// [`invalidate`](Timer::invalidate).
#[derive(Clone)]
pub struct Timer {
    data: Weak<TimerData>,
    node: NodeHandle,
    interval: Duration,
    repeating: bool,
}

impl Timer {
    /// Cancel the timer. The stop takes effect at the node's next wake; the
    /// flag flips exactly once no matter how many times this is called.
    pub fn invalidate(&self) {
        if let Some(data) = self.data.upgrade() {
            let _ = data
                .cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// `true` while the timer is live: not cancelled and its node has not
    /// reached a terminal state.
    pub fn is_valid(&self) -> bool {
        let Some(data) = self.data.upgrade() else {
            return false;
        };
        if data.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.node
            .state()
            .is_some_and(|state| !state.is_terminal())
    }

    /// The interval this timer was scheduled with.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `true` for repeating timers.
    pub fn is_repeating(&self) -> bool {
        self.repeating
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("interval", &self.interval)
            .field("repeating", &self.repeating)
            .field("valid", &self.is_valid())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TimerService
// ---------------------------------------------------------------------------

/// Schedules one-shot and repeating callbacks on top of a work service.
pub struct TimerService {
    group: Arc<ContractGroup>,
    graph: Arc<WorkGraph>,
    timers: Mutex<HashMap<u32, Arc<TimerData>>>,
    work_service: Mutex<Option<Arc<WorkService>>>,
    pump_should_stop: AtomicBool,
    /// Contract management lock: guards the pump handle.
    pump_contract: Mutex<ContractHandle>,
    /// Held for the full duration of each pump run so `stop` can synchronize
    /// with in-flight pumping.
    pump_execution: Mutex<()>,
    me: Weak<TimerService>,
}

impl TimerService {
    /// Create the service with its private group and graph.
    pub fn new(config: TimerServiceConfig) -> Arc<Self> {
        let group = ContractGroup::new(config.group_capacity, "timer-service");
        let graph = WorkGraph::new(Arc::clone(&group));
        Arc::new_cyclic(|me| Self {
            group,
            graph,
            timers: Mutex::new(HashMap::new()),
            work_service: Mutex::new(None),
            pump_should_stop: AtomicBool::new(false),
            pump_contract: Mutex::new(ContractHandle::invalid()),
            pump_execution: Mutex::new(()),
            me: me.clone(),
        })
    }

    /// Attach the work service that will execute timer contracts.
    ///
    /// Registers the timer group with the service, starts the graph, and
    /// launches the pump contract.
    pub fn set_work_service(self: &Arc<Self>, service: &Arc<WorkService>) -> Result<(), CoreError> {
        service.add_group(&self.group)?;
        *self.work_service.lock().unwrap() = Some(Arc::clone(service));
        self.graph.execute();
        self.restart_pump();
        Ok(())
    }

    /// Schedule a callback to run after `interval` (and every `interval`
    /// thereafter when `repeating`).
    pub fn schedule_timer(
        self: &Arc<Self>,
        interval: Duration,
        work: impl Fn() + Send + Sync + 'static,
        repeating: bool,
        execution_type: ExecutionType,
    ) -> Result<Timer, CoreError> {
        if self.work_service.lock().unwrap().is_none() {
            return Err(CoreError::TimerServiceNotStarted);
        }

        let data = Arc::new(TimerData {
            fire_time: Mutex::new(Instant::now() + interval),
            interval,
            work: Box::new(work),
            repeating,
            cancelled: AtomicBool::new(false),
        });

        let body_data = Arc::clone(&data);
        let node = self.graph.add_yieldable_node(
            move || timer_body(&body_data),
            Some("timer"),
            execution_type,
            None,
        );

        self.timers
            .lock()
            .unwrap()
            .insert(node.index(), Arc::clone(&data));

        // Make sure the pump is alive for the new timer.
        self.restart_pump();

        Ok(Timer {
            data: Arc::downgrade(&data),
            node,
            interval,
            repeating,
        })
    }

    /// Timers scheduled and not yet cancelled.
    pub fn active_timer_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap()
            .values()
            .filter(|t| !t.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Promote every due timed-deferral. Called by the pump; also available
    /// to applications that drive timers manually.
    pub fn process_ready_timers(&self) -> usize {
        self.graph.check_timed_deferrals()
    }

    /// Stop pumping, cancel every timer, and detach from the work service.
    pub fn stop(&self) {
        self.pump_should_stop.store(true, Ordering::Release);

        // Cancel the pump contract so no new pump run starts.
        {
            let mut pump = self.pump_contract.lock().unwrap();
            if pump.valid() {
                pump.release();
            }
            *pump = ContractHandle::invalid();
        }

        // Synchronize with an in-flight pump run.
        drop(self.pump_execution.lock().unwrap());

        for timer in self.timers.lock().unwrap().values() {
            timer.cancelled.store(true, Ordering::Release);
        }
        self.graph.suspend();

        if let Some(service) = self.work_service.lock().unwrap().take() {
            let _ = service.remove_group(&self.group);
        }
        tracing::debug!("timer service stopped");
    }

    // -- pump ---------------------------------------------------------------

    /// Start the pump contract if it is not already running.
    fn restart_pump(&self) {
        let mut pump = self.pump_contract.lock().unwrap();
        if pump.valid() || self.pump_should_stop.load(Ordering::Acquire) {
            return;
        }
        let weak = self.me.clone();
        let contract = self.group.create_contract(
            Box::new(move || pump_body(&weak)),
            ExecutionType::AnyThread,
        );
        if contract.valid() {
            contract.schedule();
            *pump = contract;
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        // Normal teardown goes through stop(); this covers services dropped
        // without one. No pump can run here (its weak upgrade fails).
        self.pump_should_stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("active_timers", &self.active_timer_count())
            .field(
                "pump_stopped",
                &self.pump_should_stop.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Yieldable node body shared by every timer.
fn timer_body(data: &Arc<TimerData>) -> NodeResult {
    if data.cancelled.load(Ordering::Acquire) {
        return NodeResult::Complete;
    }

    let now = Instant::now();
    let fire_time = *data.fire_time.lock().unwrap();
    if now < fire_time {
        return NodeResult::YieldUntil(fire_time);
    }

    (data.work)();

    if data.repeating && !data.cancelled.load(Ordering::Acquire) {
        // Advance by whole intervals past `now` so a stalled timer resumes
        // its cadence instead of burst-firing the missed ticks.
        let mut fire_time = data.fire_time.lock().unwrap();
        while *fire_time <= now {
            *fire_time += data.interval;
        }
        return NodeResult::YieldUntil(*fire_time);
    }

    NodeResult::Complete
}

/// Body of the self-rescheduling pump contract.
fn pump_body(service: &Weak<TimerService>) {
    let Some(service) = service.upgrade() else {
        return;
    };
    let _exec = service.pump_execution.lock().unwrap();

    if service.pump_should_stop.load(Ordering::Acquire) {
        return;
    }
    service.process_ready_timers();
    if service.pump_should_stop.load(Ordering::Acquire) {
        return;
    }

    // Requeue ourselves. The contract slot was freed before this body ran,
    // so the new contract may even reuse it.
    let weak = service.me.clone();
    let mut pump = service.pump_contract.lock().unwrap();
    let contract = service.group.create_contract(
        Box::new(move || pump_body(&weak)),
        ExecutionType::AnyThread,
    );
    if contract.valid() {
        contract.schedule();
        *pump = contract;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{WorkService, WorkServiceConfig};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn start_service() -> Arc<WorkService> {
        let service = Arc::new(WorkService::new(WorkServiceConfig::with_threads(2)));
        service.start().unwrap();
        service
    }

    #[test]
    fn schedule_without_service_fails() {
        let timers = TimerService::new(TimerServiceConfig::default());
        let result = timers.schedule_timer(
            Duration::from_millis(5),
            || {},
            false,
            ExecutionType::AnyThread,
        );
        assert!(matches!(result, Err(CoreError::TimerServiceNotStarted)));
    }

    #[test]
    fn one_shot_timer_fires_exactly_once() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = timers
            .schedule_timer(
                Duration::from_millis(20),
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                false,
                ExecutionType::AnyThread,
            )
            .unwrap();
        assert!(!timer.is_repeating());

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // It must not fire again.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        timers.stop();
        service.stop();
    }

    #[test]
    fn repeating_timer_cadence_within_bounds() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = timers
            .schedule_timer(
                Duration::from_millis(50),
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                true,
                ExecutionType::AnyThread,
            )
            .unwrap();
        assert!(timer.is_repeating());
        assert_eq!(timer.interval(), Duration::from_millis(50));

        thread::sleep(Duration::from_millis(250));
        timer.invalidate();
        let fired = count.load(Ordering::Relaxed);
        // ~250ms / 50ms = 5 expected; generous bounds for loaded machines.
        assert!(
            (2..=7).contains(&fired),
            "expected 2..=7 firings, saw {}",
            fired
        );

        // After cancellation the count settles (at most one in-flight fire).
        thread::sleep(Duration::from_millis(150));
        let after = count.load(Ordering::Relaxed);
        assert!(after <= fired + 1, "timer kept firing after invalidate");

        timers.stop();
        service.stop();
    }

    #[test]
    fn invalidate_is_idempotent() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = timers
            .schedule_timer(
                Duration::from_millis(10),
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                true,
                ExecutionType::AnyThread,
            )
            .unwrap();

        for _ in 0..5 {
            timer.invalidate();
        }
        assert!(!timer.is_valid());

        timers.stop();
        service.stop();
    }

    #[test]
    fn cancel_before_first_fire_prevents_callback() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = timers
            .schedule_timer(
                Duration::from_millis(100),
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                false,
                ExecutionType::AnyThread,
            )
            .unwrap();

        timer.invalidate();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::Relaxed), 0);

        timers.stop();
        service.stop();
    }

    #[test]
    fn active_timer_count_tracks_cancellation() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let t1 = timers
            .schedule_timer(
                Duration::from_secs(60),
                || {},
                true,
                ExecutionType::AnyThread,
            )
            .unwrap();
        let _t2 = timers
            .schedule_timer(
                Duration::from_secs(60),
                || {},
                true,
                ExecutionType::AnyThread,
            )
            .unwrap();
        assert_eq!(timers.active_timer_count(), 2);

        t1.invalidate();
        assert_eq!(timers.active_timer_count(), 1);

        timers.stop();
        service.stop();
    }

    #[test]
    fn stop_halts_pumping_and_detaches() {
        let service = start_service();
        let timers = TimerService::new(TimerServiceConfig::default());
        timers.set_work_service(&service).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _timer = timers
            .schedule_timer(
                Duration::from_millis(10),
                move || {
                    c.fetch_add(1, Ordering::Relaxed);
                },
                true,
                ExecutionType::AnyThread,
            )
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        timers.stop();
        let at_stop = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(60));
        assert!(count.load(Ordering::Relaxed) <= at_stop + 1);

        service.stop();
    }
}
