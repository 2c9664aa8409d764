//! Dependency-resolving work graph over a contract group.
//!
//! A [`WorkGraph`] holds nodes (closures plus metadata) and directed edges
//! between them. When [`execute`](WorkGraph::execute) is called, every node
//! with no unmet dependencies is handed to the [`NodeScheduler`], which
//! turns it into a contract in the backing group. As nodes complete, their
//! dependents' pending counts fall; any that reach zero are scheduled in
//! turn. A failing node cancels all of its transitive dependents without
//! running them.
//!
//! Yieldable nodes return a [`NodeResult`] from each invocation: `Complete`
//! finishes the node, `Yield` requeues it immediately, and `YieldUntil(t)`
//! parks it on the scheduler's timed queue until `t` passes. A panic in any
//! node body is caught at the wrapper boundary and converted into a `Failed`
//! terminal state carrying the panic message.
//!
//! Nodes are addressed by stamped handles (`index` + `generation`, same
//! discipline as contract handles), so a handle held after its node is
//! removed simply reports invalid.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::group::{panic_message, CapacityCallbackId, ContractGroup, ExecutionType, Work};
use crate::handle::ContractHandle;
use crate::node_scheduler::{NodeScheduler, NodeSchedulerConfig, SchedulerStats};

/// Wait-loop polling granularity; bounds how late a timed deferral can fire
/// while a caller is blocked in [`WorkGraph::wait`].
const WAIT_POLL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Node state / results
// ---------------------------------------------------------------------------

/// Lifecycle state of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies met; not yet handed to the group.
    Ready,
    /// Backed by a scheduled contract.
    Scheduled,
    /// Its body is running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Its body panicked or it exceeded its reschedule budget.
    Failed,
    /// A dependency failed; this node will never run.
    Cancelled,
    /// Parked on the timed queue awaiting its wake time.
    Yielded,
}

impl NodeState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Cancelled
        )
    }
}

/// What a yieldable node body asks for after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeResult {
    /// The node is done.
    Complete,
    /// Requeue immediately (cooperative yield).
    Yield,
    /// Requeue once the given instant has passed.
    YieldUntil(Instant),
}

enum NodeWork {
    Once(Box<dyn FnOnce() + Send + 'static>),
    Yieldable(Box<dyn FnMut() -> NodeResult + Send + 'static>),
    /// Temporarily moved out while the body runs.
    Taken,
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// Stamped, value-semantic reference to a graph node.
#[derive(Clone)]
pub struct NodeHandle {
    graph: Weak<WorkGraph>,
    index: u32,
    generation: u32,
}

impl NodeHandle {
    fn new(graph: Weak<WorkGraph>, index: u32, generation: u32) -> Self {
        Self {
            graph,
            index,
            generation,
        }
    }

    /// The null handle.
    pub fn invalid() -> Self {
        Self {
            graph: Weak::new(),
            index: u32::MAX,
            generation: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// `true` when the handle refers to a live node.
    pub fn valid(&self) -> bool {
        self.state().is_some()
    }

    /// Current state of the node, or `None` when the handle is stale.
    pub fn state(&self) -> Option<NodeState> {
        self.graph.upgrade().and_then(|g| g.node_state(self))
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Callbacks / configuration
// ---------------------------------------------------------------------------

type NodeCallback = Arc<dyn Fn(&NodeHandle) + Send + Sync>;

/// Observer hooks fired as nodes move through the graph.
///
/// Callbacks run on whichever thread drives the transition (usually a
/// worker) and must not block.
#[derive(Default, Clone)]
pub struct WorkGraphCallbacks {
    pub on_node_scheduled: Option<NodeCallback>,
    pub on_node_completed: Option<NodeCallback>,
    pub on_node_failed: Option<NodeCallback>,
    pub on_node_cancelled: Option<NodeCallback>,
    pub on_node_yielded: Option<NodeCallback>,
    pub on_node_dropped: Option<NodeCallback>,
}

/// Configuration for [`WorkGraph::with_config`].
#[derive(Default, Clone)]
pub struct WorkGraphConfig {
    pub scheduler: NodeSchedulerConfig,
    pub callbacks: WorkGraphCallbacks,
}

// ---------------------------------------------------------------------------
// Node storage
// ---------------------------------------------------------------------------

struct NodeData {
    name: Option<String>,
    work: NodeWork,
    execution_type: ExecutionType,
    state: NodeState,
    dependencies: Vec<u32>,
    dependents: Vec<u32>,
    pending_deps: u32,
    contract: ContractHandle,
    max_reschedules: Option<u32>,
    reschedules: u32,
    failure: Option<String>,
}

struct NodeSlot {
    generation: u32,
    data: Option<NodeData>,
}

struct GraphInner {
    slots: Vec<NodeSlot>,
    free: Vec<u32>,
    /// Nodes not yet in a terminal state.
    remaining: usize,
    running: bool,
    suspended: bool,
}

impl GraphInner {
    fn data(&self, index: u32) -> Option<&NodeData> {
        self.slots.get(index as usize).and_then(|s| s.data.as_ref())
    }

    fn data_mut(&mut self, index: u32) -> Option<&mut NodeData> {
        self.slots
            .get_mut(index as usize)
            .and_then(|s| s.data.as_mut())
    }

    fn validate(&self, handle: &NodeHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|s| s.generation == handle.generation && s.data.is_some())
    }
}

// ---------------------------------------------------------------------------
// WorkGraph
// ---------------------------------------------------------------------------

/// A DAG of work nodes executed through a contract group.
pub struct WorkGraph {
    group: Arc<ContractGroup>,
    inner: Mutex<GraphInner>,
    wait_cv: Condvar,
    scheduler: NodeScheduler,
    callbacks: WorkGraphCallbacks,
    capacity_callback: Mutex<Option<CapacityCallbackId>>,
    me: Weak<WorkGraph>,
}

impl WorkGraph {
    /// Create a graph over `group` with default configuration.
    pub fn new(group: Arc<ContractGroup>) -> Arc<Self> {
        Self::with_config(group, WorkGraphConfig::default())
    }

    /// Create a graph with explicit scheduler limits and callbacks.
    pub fn with_config(group: Arc<ContractGroup>, config: WorkGraphConfig) -> Arc<Self> {
        let graph = Arc::new_cyclic(|me: &Weak<WorkGraph>| Self {
            group: Arc::clone(&group),
            inner: Mutex::new(GraphInner {
                slots: Vec::new(),
                free: Vec::new(),
                remaining: 0,
                running: false,
                suspended: false,
            }),
            wait_cv: Condvar::new(),
            scheduler: NodeScheduler::new(me.clone(), config.scheduler),
            callbacks: config.callbacks,
            capacity_callback: Mutex::new(None),
            me: me.clone(),
        });

        // Freed group capacity drains our deferred queue.
        let weak = Arc::downgrade(&graph);
        let id = group.add_on_capacity_available(move || {
            if let Some(graph) = weak.upgrade() {
                graph.scheduler.process_deferred_nodes(0);
            }
        });
        *graph.capacity_callback.lock().unwrap() = Some(id);
        graph
    }

    /// The contract group this graph schedules into.
    pub fn group(&self) -> &Arc<ContractGroup> {
        &self.group
    }

    /// The scheduler's lifetime counters.
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Nodes waiting for group capacity.
    pub fn deferred_count(&self) -> usize {
        self.scheduler.deferred_count()
    }

    // -- construction -------------------------------------------------------

    /// Add a run-once node.
    pub fn add_node(
        &self,
        work: impl FnOnce() + Send + 'static,
        name: Option<&str>,
        execution_type: ExecutionType,
    ) -> NodeHandle {
        self.add_node_inner(NodeWork::Once(Box::new(work)), name, execution_type, None)
    }

    /// Add a yieldable node whose body runs repeatedly until it returns
    /// [`NodeResult::Complete`].
    ///
    /// `max_reschedules` bounds livelock: a node yielding more than that
    /// many times transitions to `Failed`.
    pub fn add_yieldable_node(
        &self,
        work: impl FnMut() -> NodeResult + Send + 'static,
        name: Option<&str>,
        execution_type: ExecutionType,
        max_reschedules: Option<u32>,
    ) -> NodeHandle {
        self.add_node_inner(
            NodeWork::Yieldable(Box::new(work)),
            name,
            execution_type,
            max_reschedules,
        )
    }

    fn add_node_inner(
        &self,
        work: NodeWork,
        name: Option<&str>,
        execution_type: ExecutionType,
        max_reschedules: Option<u32>,
    ) -> NodeHandle {
        let (handle, schedule_now) = {
            let mut inner = self.inner.lock().unwrap();
            let index = match inner.free.pop() {
                Some(index) => index,
                None => {
                    inner.slots.push(NodeSlot {
                        generation: 0,
                        data: None,
                    });
                    (inner.slots.len() - 1) as u32
                }
            };
            let generation = inner.slots[index as usize].generation;
            // A node added to a running, unsuspended graph with no
            // dependencies becomes ready immediately.
            let schedule_now = inner.running && !inner.suspended;
            inner.slots[index as usize].data = Some(NodeData {
                name: name.map(str::to_owned),
                work,
                execution_type,
                state: if schedule_now {
                    NodeState::Ready
                } else {
                    NodeState::Pending
                },
                dependencies: Vec::new(),
                dependents: Vec::new(),
                pending_deps: 0,
                contract: ContractHandle::invalid(),
                max_reschedules,
                reschedules: 0,
                failure: None,
            });
            inner.remaining += 1;
            (
                NodeHandle::new(self.me.clone(), index, generation),
                schedule_now,
            )
        };
        if schedule_now {
            self.scheduler.schedule_node(&handle);
        }
        handle
    }

    /// Add edge `from → to`: `to` will not run until `from` is terminal.
    ///
    /// Fails when either handle is stale, when `to` has already been
    /// scheduled, or when the edge would create a cycle.
    pub fn add_dependency(&self, from: &NodeHandle, to: &NodeHandle) -> Result<(), CoreError> {
        let cancel_target = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.validate(from) || !inner.validate(to) {
                return Err(CoreError::InvalidNodeHandle);
            }
            if from.index == to.index {
                return Err(CoreError::DependencyCycle);
            }

            let to_state = inner.data(to.index).unwrap().state;
            if !matches!(to_state, NodeState::Pending | NodeState::Ready) {
                return Err(CoreError::NodeAlreadyScheduled);
            }

            // Cycle check: `from` must not be reachable by walking dependent
            // edges out of `to`.
            if self.reaches(&inner, to.index, from.index) {
                return Err(CoreError::DependencyCycle);
            }

            let from_state = inner.data(from.index).unwrap().state;
            inner
                .data_mut(from.index)
                .unwrap()
                .dependents
                .push(to.index);
            let to_data = inner.data_mut(to.index).unwrap();
            to_data.dependencies.push(from.index);

            match from_state {
                // Already satisfied; the edge adds bookkeeping only.
                NodeState::Completed => false,
                // Depending on a failed or cancelled node dooms the target.
                NodeState::Failed | NodeState::Cancelled => true,
                _ => {
                    to_data.pending_deps += 1;
                    if to_data.state == NodeState::Ready {
                        to_data.state = NodeState::Pending;
                    }
                    false
                }
            }
        };

        if cancel_target {
            self.cancel_node_and_subtree(to);
        }
        Ok(())
    }

    /// DFS over dependent edges: can `target` be reached from `start`?
    fn reaches(&self, inner: &GraphInner, start: u32, target: u32) -> bool {
        let mut stack = vec![start];
        let mut visited = vec![false; inner.slots.len()];
        while let Some(index) = stack.pop() {
            if index == target {
                return true;
            }
            if std::mem::replace(&mut visited[index as usize], true) {
                continue;
            }
            if let Some(data) = inner.data(index) {
                stack.extend(data.dependents.iter().copied());
            }
        }
        false
    }

    /// Remove a terminal node, invalidating every handle to it.
    pub fn remove_node(&self, handle: &NodeHandle) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return Err(CoreError::InvalidNodeHandle);
        }
        let state = inner.data(handle.index).unwrap().state;
        if !state.is_terminal() {
            return Err(CoreError::NodeNotTerminal);
        }
        let slot = &mut inner.slots[handle.index as usize];
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        Ok(())
    }

    // -- execution control --------------------------------------------------

    /// Start executing: every node with no unmet dependencies is scheduled.
    pub fn execute(&self) {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            inner.running = true;
            if inner.suspended {
                Vec::new()
            } else {
                self.collect_ready(&mut inner)
            }
        };
        for node in &ready {
            self.scheduler.schedule_node(node);
        }
    }

    /// Pause scheduling of new nodes. In-flight contracts are unaffected.
    pub fn suspend(&self) {
        self.inner.lock().unwrap().suspended = true;
    }

    /// Undo [`suspend`](Self::suspend) and schedule everything that became
    /// ready in the meantime.
    pub fn resume(&self) {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            inner.suspended = false;
            if inner.running {
                self.collect_ready(&mut inner)
            } else {
                Vec::new()
            }
        };
        for node in &ready {
            self.scheduler.schedule_node(node);
        }
    }

    fn collect_ready(&self, inner: &mut GraphInner) -> Vec<NodeHandle> {
        let mut ready = Vec::new();
        for index in 0..inner.slots.len() as u32 {
            let generation = inner.slots[index as usize].generation;
            if let Some(data) = inner.data_mut(index) {
                let eligible = data.pending_deps == 0
                    && matches!(data.state, NodeState::Pending | NodeState::Ready);
                if eligible {
                    data.state = NodeState::Ready;
                    ready.push(NodeHandle::new(self.me.clone(), index, generation));
                }
            }
        }
        ready
    }

    /// Block until every node is terminal.
    ///
    /// The wait loop doubles as a pump for the timed-deferred queue so
    /// yielding nodes make progress even without a timer service attached.
    pub fn wait(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.remaining == 0 {
                    return;
                }
                let (inner, _) = self.wait_cv.wait_timeout(inner, WAIT_POLL).unwrap();
                if inner.remaining == 0 {
                    return;
                }
            }
            self.scheduler.process_timed_deferred_nodes(0);
            self.scheduler.process_deferred_nodes(0);
        }
    }

    /// `true` when every node is terminal.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().remaining == 0
    }

    /// Drain due entries from the timed-deferred queue. Returns the number
    /// scheduled. Called periodically by the timer service's pump.
    pub fn check_timed_deferrals(&self) -> usize {
        self.scheduler.process_timed_deferred_nodes(0)
    }

    // -- queries ------------------------------------------------------------

    /// State of the node, or `None` for a stale handle.
    pub fn node_state(&self, handle: &NodeHandle) -> Option<NodeState> {
        let inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return None;
        }
        inner.data(handle.index).map(|d| d.state)
    }

    /// Failure message of a `Failed` node.
    pub fn failure_message(&self, handle: &NodeHandle) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return None;
        }
        inner.data(handle.index).and_then(|d| d.failure.clone())
    }

    /// Debug name given at creation.
    pub fn node_name(&self, handle: &NodeHandle) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return None;
        }
        inner.data(handle.index).and_then(|d| d.name.clone())
    }

    // -- scheduler plumbing (crate-internal) --------------------------------

    pub(crate) fn node_execution_type(&self, handle: &NodeHandle) -> Option<ExecutionType> {
        let inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return None;
        }
        let data = inner.data(handle.index)?;
        // Terminal and executing nodes have nothing left to schedule.
        if data.state.is_terminal() || data.state == NodeState::Executing {
            return None;
        }
        Some(data.execution_type)
    }

    /// Build the contract closure for a node.
    pub(crate) fn work_wrapper(&self, handle: &NodeHandle) -> Work {
        let graph = self.me.clone();
        let node = handle.clone();
        Box::new(move || {
            // The graph being gone means teardown already happened; the
            // wrapper silently retires.
            if let Some(graph) = graph.upgrade() {
                graph.run_node(&node);
            }
        })
    }

    pub(crate) fn mark_node_scheduled(&self, handle: &NodeHandle, contract: ContractHandle) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return;
        }
        if let Some(data) = inner.data_mut(handle.index) {
            data.state = NodeState::Scheduled;
            data.contract = contract;
        }
    }

    pub(crate) fn clear_schedule_attempt(&self, handle: &NodeHandle) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.validate(handle) {
            return;
        }
        if let Some(data) = inner.data_mut(handle.index) {
            if data.state == NodeState::Scheduled {
                data.state = NodeState::Ready;
            }
            data.contract = ContractHandle::invalid();
        }
    }

    pub(crate) fn mark_node_dropped(&self, handle: &NodeHandle) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.validate(handle) {
                return;
            }
            if let Some(data) = inner.data_mut(handle.index) {
                if data.state.is_terminal() {
                    return;
                }
                data.state = NodeState::Cancelled;
            }
            self.retire_one(&mut inner);
        }
        self.fire(&self.callbacks.on_node_dropped, handle);
    }

    pub(crate) fn fire_node_scheduled(&self, handle: &NodeHandle) {
        self.fire(&self.callbacks.on_node_scheduled, handle);
    }

    fn fire(&self, callback: &Option<NodeCallback>, handle: &NodeHandle) {
        if let Some(callback) = callback {
            callback(handle);
        }
    }

    /// Decrement `remaining`, waking waiters at zero. Caller holds the lock.
    fn retire_one(&self, inner: &mut GraphInner) {
        inner.remaining -= 1;
        if inner.remaining == 0 {
            self.wait_cv.notify_all();
        }
    }

    // -- node execution -----------------------------------------------------

    /// Body of every node contract: run the node's work and dispatch on the
    /// outcome. Runs on a worker (or the main-thread pump) with no graph
    /// lock held while user code executes.
    fn run_node(self: &Arc<Self>, node: &NodeHandle) {
        let work = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.validate(node) {
                return;
            }
            let Some(data) = inner.data_mut(node.index) else {
                return;
            };
            if data.state.is_terminal() {
                return;
            }
            data.state = NodeState::Executing;
            data.contract = ContractHandle::invalid();
            std::mem::replace(&mut data.work, NodeWork::Taken)
        };

        enum Outcome {
            Completed,
            Failed(String),
            Yielded {
                work: NodeWork,
                until: Option<Instant>,
            },
        }

        let outcome = match work {
            NodeWork::Taken => return,
            NodeWork::Once(body) => match catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => Outcome::Completed,
                Err(payload) => Outcome::Failed(panic_message(payload.as_ref())),
            },
            NodeWork::Yieldable(mut body) => {
                match catch_unwind(AssertUnwindSafe(move || {
                    let result = body();
                    (result, body)
                })) {
                    Ok((NodeResult::Complete, _)) => Outcome::Completed,
                    Ok((NodeResult::Yield, body)) => Outcome::Yielded {
                        work: NodeWork::Yieldable(body),
                        until: None,
                    },
                    Ok((NodeResult::YieldUntil(wake), body)) => {
                        // A wake time already in the past is a plain yield.
                        let until = if wake <= Instant::now() {
                            None
                        } else {
                            Some(wake)
                        };
                        Outcome::Yielded {
                            work: NodeWork::Yieldable(body),
                            until,
                        }
                    }
                    Err(payload) => Outcome::Failed(panic_message(payload.as_ref())),
                }
            }
        };

        match outcome {
            Outcome::Completed => self.finish_node(node),
            Outcome::Failed(message) => self.fail_node(node, message),
            Outcome::Yielded { work, until } => self.yield_node(node, work, until),
        }
    }

    /// Mark the node complete and schedule newly unblocked dependents.
    fn finish_node(self: &Arc<Self>, node: &NodeHandle) {
        let to_schedule = {
            let mut inner = self.inner.lock().unwrap();
            let Some(data) = inner.data_mut(node.index) else {
                return;
            };
            data.state = NodeState::Completed;
            let dependents = data.dependents.clone();
            self.retire_one(&mut inner);

            let mut unblocked = Vec::new();
            for dep_index in dependents {
                let generation = inner.slots[dep_index as usize].generation;
                if let Some(dep) = inner.data_mut(dep_index) {
                    dep.pending_deps -= 1;
                    if dep.pending_deps == 0 && dep.state == NodeState::Pending {
                        dep.state = NodeState::Ready;
                        unblocked.push(NodeHandle::new(self.me.clone(), dep_index, generation));
                    }
                }
            }
            if inner.suspended || !inner.running {
                // They stay Ready; resume()/execute() will pick them up.
                Vec::new()
            } else {
                unblocked
            }
        };

        self.fire(&self.callbacks.on_node_completed, node);
        for dependent in &to_schedule {
            self.scheduler.schedule_node(dependent);
        }
    }

    /// Mark the node failed and cancel every transitive dependent.
    fn fail_node(self: &Arc<Self>, node: &NodeHandle, message: String) {
        tracing::warn!(node = node.index, %message, "graph node failed");
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(data) = inner.data_mut(node.index) else {
                return;
            };
            data.state = NodeState::Failed;
            data.failure = Some(message);
            self.retire_one(&mut inner);
        }
        self.fire(&self.callbacks.on_node_failed, node);
        self.cancel_subtree(node);
    }

    /// Cancel `node` itself (when not already terminal), then every
    /// transitive dependent. Used when a node gains a dependency on an
    /// already-failed or cancelled node: the target must never run.
    fn cancel_node_and_subtree(&self, node: &NodeHandle) {
        let newly_cancelled = {
            let mut inner = self.inner.lock().unwrap();
            let mut newly_cancelled = false;
            if let Some(data) = inner.data_mut(node.index) {
                if !data.state.is_terminal() {
                    data.state = NodeState::Cancelled;
                    newly_cancelled = true;
                }
            }
            if newly_cancelled {
                self.retire_one(&mut inner);
            }
            newly_cancelled
        };
        if newly_cancelled {
            self.fire(&self.callbacks.on_node_cancelled, node);
        }
        self.cancel_subtree(node);
    }

    /// Cancel all non-terminal transitive dependents of `node`.
    fn cancel_subtree(&self, node: &NodeHandle) {
        let cancelled = {
            let mut inner = self.inner.lock().unwrap();
            let mut stack: Vec<u32> = match inner.data(node.index) {
                Some(data) => data.dependents.clone(),
                None => return,
            };
            let mut cancelled = Vec::new();
            while let Some(index) = stack.pop() {
                let generation = inner.slots[index as usize].generation;
                let mut newly_cancelled = false;
                if let Some(data) = inner.data_mut(index) {
                    if !data.state.is_terminal() {
                        data.state = NodeState::Cancelled;
                        stack.extend(data.dependents.iter().copied());
                        cancelled.push(NodeHandle::new(self.me.clone(), index, generation));
                        newly_cancelled = true;
                    }
                }
                if newly_cancelled {
                    self.retire_one(&mut inner);
                }
            }
            cancelled
        };
        for handle in &cancelled {
            self.fire(&self.callbacks.on_node_cancelled, handle);
        }
    }

    /// Requeue a yielded node, bounded by its reschedule budget.
    fn yield_node(self: &Arc<Self>, node: &NodeHandle, work: NodeWork, until: Option<Instant>) {
        enum Next {
            Reschedule,
            Defer(Instant),
            Exhausted,
            Parked,
        }

        let next = {
            let mut inner = self.inner.lock().unwrap();
            let suspended = inner.suspended;
            let Some(data) = inner.data_mut(node.index) else {
                return;
            };
            data.work = work;
            data.reschedules += 1;
            if data
                .max_reschedules
                .is_some_and(|max| data.reschedules > max)
            {
                Next::Exhausted
            } else {
                match until {
                    Some(wake) => {
                        data.state = NodeState::Yielded;
                        Next::Defer(wake)
                    }
                    None => {
                        data.state = NodeState::Ready;
                        if suspended {
                            Next::Parked
                        } else {
                            Next::Reschedule
                        }
                    }
                }
            }
        };

        match next {
            Next::Reschedule => {
                self.fire(&self.callbacks.on_node_yielded, node);
                self.scheduler.schedule_node(node);
            }
            Next::Defer(wake) => {
                self.fire(&self.callbacks.on_node_yielded, node);
                self.scheduler.defer_node_until(node, wake);
            }
            Next::Parked => {
                self.fire(&self.callbacks.on_node_yielded, node);
            }
            Next::Exhausted => {
                self.fail_node(node, "exceeded maximum reschedules".to_string());
            }
        }
    }
}

impl Drop for WorkGraph {
    fn drop(&mut self) {
        if let Some(id) = self.capacity_callback.lock().unwrap().take() {
            self.group.remove_on_capacity_available(id);
        }
    }
}

impl std::fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("WorkGraph")
            .field("nodes", &inner.slots.len())
            .field("remaining", &inner.remaining)
            .field("running", &inner.running)
            .field("suspended", &inner.suspended)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
