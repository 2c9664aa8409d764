//! EntropyCore — the work execution core.
//!
//! A foundation for concurrent applications built from a small set of
//! tightly-coupled pieces:
//!
//! * [`SignalTree`](signal_tree::SignalTree) — lock-free ready bitmap with
//!   popcount internal nodes and fair biased selection.
//! * [`ContractGroup`](group::ContractGroup) — fixed-capacity pool of work
//!   slots with generation-stamped [`ContractHandle`](handle::ContractHandle)s.
//! * [`WorkService`](service::WorkService) — worker threads plus a
//!   main-thread pump, selecting across groups via pluggable
//!   [`SchedulerStrategy`](strategy::SchedulerStrategy) policies.
//! * [`WorkGraph`](graph::WorkGraph) — dependency-resolving DAG of nodes
//!   scheduled through a group, with deferred and time-deferred queues.
//! * [`TimerService`](timer::TimerService) — delayed/repeating callbacks
//!   expressed as yielding graph nodes, driven by a pump contract.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use entropy_core::{ContractGroup, ExecutionType, ScheduleResult};
//!
//! let group = ContractGroup::new(8, "example");
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! let ctr = Arc::clone(&counter);
//! let handle = group.create_contract(
//!     Box::new(move || {
//!         ctr.fetch_add(1, Ordering::Relaxed);
//!     }),
//!     ExecutionType::AnyThread,
//! );
//! assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
//!
//! // Normally a WorkService drains the group; here we pump it directly.
//! group.execute_all_background_work();
//! assert_eq!(counter.load(Ordering::Relaxed), 1);
//! assert!(!handle.valid(), "handles go stale once execution begins");
//! ```
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod group;
pub mod handle;
pub mod node_scheduler;
pub mod service;
pub mod signal_tree;
pub mod strategy;
pub mod timer;

pub use error::CoreError;
pub use graph::{NodeHandle, NodeResult, NodeState, WorkGraph, WorkGraphCallbacks, WorkGraphConfig};
pub use group::{
    CapacityCallbackId, ConcurrencyProvider, ContractGroup, ExecutionType, ScheduleResult,
    SlotState, Work,
};
pub use handle::ContractHandle;
pub use node_scheduler::{NodeScheduler, NodeSchedulerConfig, SchedulerStats};
pub use service::{ServicePhase, WorkService, WorkServiceConfig};
pub use signal_tree::{SignalTree, INVALID_SIGNAL_INDEX};
pub use strategy::{AdaptiveRanking, Direct, Random, RoundRobin, SchedulerStrategy, SpinningDirect};
pub use timer::{Timer, TimerService, TimerServiceConfig};
