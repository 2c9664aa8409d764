//! Mediates between a work graph and its contract group.
//!
//! The node scheduler turns ready graph nodes into scheduled contracts while
//! respecting the group's capacity. Nodes that cannot be placed right away
//! go to one of two queues:
//!
//! * the **deferred queue** — a FIFO of nodes waiting for group capacity,
//!   drained by [`process_deferred_nodes`](NodeScheduler::process_deferred_nodes)
//!   whenever the group reports capacity again;
//! * the **timed queue** — a min-heap of `(wake_time, node)` pairs fed by
//!   yieldable nodes returning a wake deadline, drained by
//!   [`process_timed_deferred_nodes`](NodeScheduler::process_timed_deferred_nodes).
//!
//! The deferred queue may be capped; overflow drops the node and reports it
//! through the graph's drop callback — never silently.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};
use std::time::Instant;

use crate::graph::{NodeHandle, WorkGraph};
use crate::group::ScheduleResult;

// ---------------------------------------------------------------------------
// Configuration / statistics
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`NodeScheduler`].
#[derive(Debug, Clone, Default)]
pub struct NodeSchedulerConfig {
    /// Cap on the deferred queue; `0` means unlimited. Overflow drops the
    /// node (with the drop callback fired).
    pub max_deferred_nodes: usize,
}

/// Counters maintained across the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Nodes successfully handed to the contract group.
    pub nodes_scheduled: u64,
    /// Nodes pushed to the deferred queue (including re-deferrals).
    pub nodes_deferred: u64,
    /// Nodes dropped because the deferred queue was full.
    pub nodes_dropped: u64,
    /// High-water mark of the deferred queue.
    pub peak_deferred: usize,
}

/// How a scheduling attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduleOutcome {
    /// A contract was created and scheduled.
    Scheduled,
    /// No capacity; the node sits in the deferred queue.
    Deferred,
    /// The deferred queue was full; the node was dropped.
    Dropped,
}

// ---------------------------------------------------------------------------
// Timed queue entry
// ---------------------------------------------------------------------------

struct TimedEntry {
    wake: Instant,
    /// Insertion sequence; keeps the heap total-ordered and FIFO among equal
    /// wake times.
    seq: u64,
    node: NodeHandle,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.seq == other.seq
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap acts as a min-heap on wake time.
        other
            .wake
            .cmp(&self.wake)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// NodeScheduler
// ---------------------------------------------------------------------------

/// Feeds graph nodes into a contract group, deferring when capacity runs out.
pub struct NodeScheduler {
    graph: Weak<WorkGraph>,
    config: NodeSchedulerConfig,
    deferred: RwLock<VecDeque<NodeHandle>>,
    timed: Mutex<BinaryHeap<TimedEntry>>,
    stats: Mutex<SchedulerStats>,
    timed_seq: AtomicU64,
}

impl NodeScheduler {
    pub(crate) fn new(graph: Weak<WorkGraph>, config: NodeSchedulerConfig) -> Self {
        Self {
            graph,
            config,
            deferred: RwLock::new(VecDeque::new()),
            timed: Mutex::new(BinaryHeap::new()),
            stats: Mutex::new(SchedulerStats::default()),
            timed_seq: AtomicU64::new(0),
        }
    }

    /// Nodes currently waiting for capacity.
    pub fn deferred_count(&self) -> usize {
        self.deferred.read().unwrap().len()
    }

    /// Nodes currently waiting on the timed queue.
    pub fn timed_deferred_count(&self) -> usize {
        self.timed.lock().unwrap().len()
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock().unwrap()
    }

    // -- scheduling ---------------------------------------------------------

    /// Place a ready node: schedule it as a contract if the group has room,
    /// otherwise defer it.
    pub(crate) fn schedule_node(&self, node: &NodeHandle) -> ScheduleOutcome {
        let Some(graph) = self.graph.upgrade() else {
            return ScheduleOutcome::Dropped;
        };
        if !graph.group().has_capacity() {
            return self.defer_node(node);
        }
        if self.try_schedule_direct(&graph, node) {
            ScheduleOutcome::Scheduled
        } else {
            self.defer_node(node)
        }
    }

    /// Attempt contract creation + scheduling without any deferral fallback.
    fn try_schedule_direct(&self, graph: &std::sync::Arc<WorkGraph>, node: &NodeHandle) -> bool {
        let Some(execution_type) = graph.node_execution_type(node) else {
            // Node vanished (removed or already terminal): nothing to place.
            return true;
        };
        let wrapper = graph.work_wrapper(node);
        let contract = graph.group().create_contract(wrapper, execution_type);
        if !contract.valid() {
            return false;
        }

        // Publish the handle and the Scheduled state before the ready bit is
        // set; a worker may pick the contract up immediately.
        graph.mark_node_scheduled(node, contract.clone());
        if contract.schedule() != ScheduleResult::Scheduled {
            graph.clear_schedule_attempt(node);
            contract.release();
            return false;
        }

        self.stats.lock().unwrap().nodes_scheduled += 1;
        graph.fire_node_scheduled(node);
        true
    }

    fn defer_node(&self, node: &NodeHandle) -> ScheduleOutcome {
        {
            let mut queue = self.deferred.write().unwrap();
            if self.config.max_deferred_nodes == 0 || queue.len() < self.config.max_deferred_nodes
            {
                queue.push_back(node.clone());
                let mut stats = self.stats.lock().unwrap();
                stats.nodes_deferred += 1;
                stats.peak_deferred = stats.peak_deferred.max(queue.len());
                return ScheduleOutcome::Deferred;
            }
        }

        // Queue full: the node is dropped, loudly.
        tracing::warn!(
            max = self.config.max_deferred_nodes,
            "deferred queue full, dropping node"
        );
        self.stats.lock().unwrap().nodes_dropped += 1;
        if let Some(graph) = self.graph.upgrade() {
            graph.mark_node_dropped(node);
        }
        ScheduleOutcome::Dropped
    }

    /// Park a node until `wake` passes; drained by
    /// [`process_timed_deferred_nodes`](Self::process_timed_deferred_nodes).
    pub(crate) fn defer_node_until(&self, node: &NodeHandle, wake: Instant) {
        let seq = self.timed_seq.fetch_add(1, Ordering::Relaxed);
        self.timed.lock().unwrap().push(TimedEntry {
            wake,
            seq,
            node: node.clone(),
        });
    }

    // -- queue draining -----------------------------------------------------

    /// Pop and schedule deferred nodes while capacity lasts.
    ///
    /// `max == 0` means "up to the group's available capacity". Processing
    /// stops as soon as a popped node re-defers (capacity is gone again).
    /// Returns the number scheduled.
    pub fn process_deferred_nodes(&self, max: usize) -> usize {
        let Some(graph) = self.graph.upgrade() else {
            return 0;
        };
        let budget = if max == 0 {
            graph
                .group()
                .capacity()
                .saturating_sub(graph.group().active_count())
        } else {
            max
        };

        let mut scheduled = 0;
        while scheduled < budget {
            let node = {
                let mut queue = self.deferred.write().unwrap();
                match queue.pop_front() {
                    Some(node) => node,
                    None => break,
                }
            };
            match self.schedule_node(&node) {
                ScheduleOutcome::Scheduled => scheduled += 1,
                // Re-deferred or dropped: capacity is exhausted, stop.
                ScheduleOutcome::Deferred | ScheduleOutcome::Dropped => break,
            }
        }
        scheduled
    }

    /// Schedule timed-deferred nodes whose wake time has passed.
    ///
    /// `max == 0` means unlimited. Nodes that cannot be placed are pushed
    /// back with their *original* wake time so later pumps retry them.
    /// Returns the number scheduled.
    pub fn process_timed_deferred_nodes(&self, max: usize) -> usize {
        let now = Instant::now();

        let mut ready = Vec::new();
        {
            let mut timed = self.timed.lock().unwrap();
            while let Some(top) = timed.peek() {
                if top.wake > now {
                    break;
                }
                ready.push(timed.pop().unwrap());
                if max > 0 && ready.len() >= max {
                    break;
                }
            }
        }
        if ready.is_empty() {
            return 0;
        }

        let Some(graph) = self.graph.upgrade() else {
            return 0;
        };

        let mut scheduled = 0;
        let mut index = 0;
        while index < ready.len() {
            let placed = graph.group().has_capacity()
                && self.try_schedule_direct(&graph, &ready[index].node);
            if placed {
                scheduled += 1;
                index += 1;
                continue;
            }
            // No room: re-push this entry and everything after it, keeping
            // the original wake times.
            let mut timed = self.timed.lock().unwrap();
            for entry in ready.drain(index..) {
                timed.push(entry);
            }
            break;
        }
        scheduled
    }
}

impl std::fmt::Debug for NodeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeScheduler")
            .field("deferred", &self.deferred_count())
            .field("timed_deferred", &self.timed_deferred_count())
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests (timed-entry ordering; end-to-end coverage lives in graph tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timed_entries_pop_earliest_first() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(TimedEntry {
            wake: base + Duration::from_millis(30),
            seq: 0,
            node: NodeHandle::invalid(),
        });
        heap.push(TimedEntry {
            wake: base + Duration::from_millis(10),
            seq: 1,
            node: NodeHandle::invalid(),
        });
        heap.push(TimedEntry {
            wake: base + Duration::from_millis(20),
            seq: 2,
            node: NodeHandle::invalid(),
        });

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.seq).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn equal_wake_times_pop_in_insertion_order() {
        let wake = Instant::now() + Duration::from_millis(5);
        let mut heap = BinaryHeap::new();
        for seq in 0..4u64 {
            heap.push(TimedEntry {
                wake,
                seq,
                node: NodeHandle::invalid(),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
