//! Fixed-capacity pool of schedulable work contracts.
//!
//! A [`ContractGroup`] owns `capacity` slots, each able to hold one unit of
//! work (a *contract*). Slots move through a small atomic state machine:
//!
//! ```text
//! Free ──create_contract──▶ Allocated ──schedule──▶ Scheduled ──select──▶ Executing
//!   ▲                           │                       │                    │
//!   └────────release────────────┴──────release──────────┘  (slot freed before
//!                                                           the closure runs)
//! ```
//!
//! Ready contracts are tracked in two [`SignalTree`]s — one for any-thread
//! work, one for work pinned to the main thread — so selectors can find a
//! ready slot without scanning. Free slots live on a lock-free stack whose
//! packed 64-bit head carries a tag that increments on every push, defeating
//! ABA under concurrent pop/push.
//!
//! # Handle discipline
//!
//! Every slot carries a monotonically increasing generation. Handles stamp
//! `(owner, index, generation)` and validate against the live slot, so a
//! handle goes stale the moment its slot is recycled. The generation is
//! bumped inside [`execute_contract`](ContractGroup::execute_contract) right
//! before the closure runs: the handle returned from selection stays valid
//! up to that point and no longer.
//!
//! # Ready-bit clearing
//!
//! The ready trees are cleared in three redundant layers so a stale bit can
//! never survive: selection clears on a successful CAS (layer 1), releasing
//! a still-scheduled slot clears on the release path (layer 2), and the
//! execute path clears defensively (layer 3) to cover a selector preempted
//! between its CAS and its own clear.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use crate::handle::ContractHandle;
use crate::signal_tree::{SignalTree, INVALID_SIGNAL_INDEX};

/// Free-list terminator.
pub(crate) const INVALID_INDEX: u32 = u32::MAX;

/// A unit of work held by a contract slot.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// SlotState / ExecutionType
// ---------------------------------------------------------------------------

/// Lifecycle state of a contract slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// On the free list; holds no work.
    Free = 0,
    /// Popped and holding work, but not yet scheduled.
    Allocated = 1,
    /// Ready to run; its bit is set in a signal tree.
    Scheduled = 2,
    /// Claimed by a selector; transient until the execute path frees it.
    Executing = 3,
}

impl SlotState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SlotState::Allocated,
            2 => SlotState::Scheduled,
            3 => SlotState::Executing,
            _ => SlotState::Free,
        }
    }
}

/// Where a contract is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExecutionType {
    /// Any worker thread may run it.
    #[default]
    AnyThread = 0,
    /// Only the application's main-thread pump may run it.
    MainThread = 1,
}

/// Outcome of schedule / unschedule requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// The contract is now scheduled.
    Scheduled,
    /// It was already scheduled; nothing changed.
    AlreadyScheduled,
    /// The contract is no longer scheduled (unschedule succeeded, or it was
    /// never scheduled).
    NotScheduled,
    /// Too late — execution has started (or already recycled the slot).
    Executing,
    /// The handle does not refer to a live contract in this group.
    Invalid,
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

struct Slot {
    state: AtomicU8,
    generation: AtomicU32,
    next_free: AtomicU32,
    execution_type: AtomicU8,
    /// The stored closure. Uncontended: the state machine grants exclusive
    /// access to whoever owns the current transition.
    work: Mutex<Option<Work>>,
}

impl Slot {
    fn new(next_free: u32) -> Self {
        Self {
            state: AtomicU8::new(SlotState::Free as u8),
            generation: AtomicU32::new(0),
            next_free: AtomicU32::new(next_free),
            execution_type: AtomicU8::new(ExecutionType::AnyThread as u8),
            work: Mutex::new(None),
        }
    }

    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn execution_type(&self) -> ExecutionType {
        if self.execution_type.load(Ordering::Acquire) == ExecutionType::MainThread as u8 {
            ExecutionType::MainThread
        } else {
            ExecutionType::AnyThread
        }
    }

    fn cas_state(&self, from: SlotState, to: SlotState) -> Result<(), SlotState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SlotState::from_u8)
    }
}

// ---------------------------------------------------------------------------
// Provider hook
// ---------------------------------------------------------------------------

/// Implemented by whoever drives workers for a group (the work service).
///
/// `notify_work_available` is invoked on every successful schedule so parked
/// workers can wake.
pub trait ConcurrencyProvider: Send + Sync {
    fn notify_work_available(&self, group: &Arc<ContractGroup>);
}

/// Cookie returned by [`ContractGroup::add_on_capacity_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapacityCallbackId(u64);

type CapacityCallback = Box<dyn Fn() + Send>;

// ---------------------------------------------------------------------------
// ContractGroup
// ---------------------------------------------------------------------------

/// A fixed-capacity, lock-free pool of work contracts with dual ready trees.
pub struct ContractGroup {
    name: String,
    capacity: u32,
    slots: Box<[Slot]>,
    /// Packed `(tag << 32) | head_index`; the tag increments on every push.
    free_head: AtomicU64,

    ready: SignalTree,
    ready_main: SignalTree,

    active: AtomicU32,
    scheduled: AtomicU32,
    executing: AtomicU32,
    selecting: AtomicU32,
    scheduled_main: AtomicU32,
    executing_main: AtomicU32,
    selecting_main: AtomicU32,

    stopping: AtomicBool,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,

    provider: RwLock<Option<Weak<dyn ConcurrencyProvider>>>,
    capacity_callbacks: Mutex<Vec<(u64, CapacityCallback)>>,
    next_callback_id: AtomicU64,

    /// Self-reference used to stamp handles.
    me: Weak<ContractGroup>,
}

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn head_index(head: u64) -> u32 {
    (head & 0xFFFF_FFFF) as u32
}

#[inline]
fn head_tag(head: u64) -> u32 {
    (head >> 32) as u32
}

impl ContractGroup {
    /// Create a group with `capacity` slots, all free.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or would not fit a `u32` index space.
    pub fn new(capacity: usize, name: impl Into<String>) -> Arc<Self> {
        assert!(capacity > 0, "contract group capacity must be nonzero");
        assert!(
            capacity < INVALID_INDEX as usize,
            "contract group capacity too large"
        );
        let capacity = capacity as u32;
        let slots: Box<[Slot]> = (0..capacity)
            .map(|i| {
                // Thread the initial free list through the slots in order.
                let next = if i + 1 < capacity { i + 1 } else { INVALID_INDEX };
                Slot::new(next)
            })
            .collect();

        Arc::new_cyclic(|me| Self {
            name: name.into(),
            capacity,
            slots,
            free_head: AtomicU64::new(pack_head(0, 0)),
            ready: SignalTree::new(capacity),
            ready_main: SignalTree::new(capacity),
            active: AtomicU32::new(0),
            scheduled: AtomicU32::new(0),
            executing: AtomicU32::new(0),
            selecting: AtomicU32::new(0),
            scheduled_main: AtomicU32::new(0),
            executing_main: AtomicU32::new(0),
            selecting_main: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
            provider: RwLock::new(None),
            capacity_callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    /// Debug name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Contracts currently allocated (including scheduled and executing).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire) as usize
    }

    /// Contracts currently scheduled on the any-thread tree.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::Acquire) as usize
    }

    /// Contracts currently scheduled for the main thread.
    pub fn main_thread_scheduled_count(&self) -> usize {
        self.scheduled_main.load(Ordering::Acquire) as usize
    }

    /// Contracts currently executing on worker threads.
    pub fn executing_count(&self) -> usize {
        self.executing.load(Ordering::Acquire) as usize
    }

    /// Threads currently inside a selection call.
    pub fn selecting_count(&self) -> usize {
        (self.selecting.load(Ordering::Acquire) + self.selecting_main.load(Ordering::Acquire))
            as usize
    }

    /// `true` once [`stop`](Self::stop) has been called (until resumed).
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// `true` when the group can accept at least one more contract.
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.capacity()
    }

    // -- contract creation --------------------------------------------------

    /// Allocate a slot and install `work` in it.
    ///
    /// Returns an invalid handle when the pool is exhausted; the handle's
    /// `schedule` will report [`ScheduleResult::Invalid`].
    pub fn create_contract(&self, work: Work, execution_type: ExecutionType) -> ContractHandle {
        let Some(index) = self.pop_free_slot() else {
            return ContractHandle::invalid();
        };
        let slot = &self.slots[index as usize];

        // Generation snapshot before the slot becomes visible; this is the
        // stamp every handle to this allocation carries.
        let generation = slot.generation.load(Ordering::Acquire);

        *slot.work.lock().unwrap() = Some(work);
        slot.execution_type
            .store(execution_type as u8, Ordering::Release);

        // Active count rises before the Allocated store so anyone who
        // observes the state also observes the count.
        self.active.fetch_add(1, Ordering::AcqRel);
        slot.state.store(SlotState::Allocated as u8, Ordering::Release);

        ContractHandle::new(self.me.clone(), index, generation)
    }

    fn pop_free_slot(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == INVALID_INDEX {
                return None;
            }
            let next = self.slots[index as usize].next_free.load(Ordering::Acquire);
            let new_head = pack_head(next, head_tag(head).wrapping_add(1));
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn push_free_slot(&self, index: u32) {
        let slot = &self.slots[index as usize];
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            slot.next_free.store(head_index(head), Ordering::Release);
            let new_head = pack_head(index, head_tag(head).wrapping_add(1));
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    // -- handle validation --------------------------------------------------

    pub(crate) fn validate_handle(&self, handle: &ContractHandle) -> bool {
        if !handle.is_owned_by(self) {
            return false;
        }
        let index = handle.index();
        if index >= self.capacity {
            return false;
        }
        self.slots[index as usize].generation.load(Ordering::Acquire) == handle.generation()
    }

    /// Current state of the slot the handle refers to, or `Free` when the
    /// handle is stale.
    pub fn contract_state(&self, handle: &ContractHandle) -> SlotState {
        if !self.validate_handle(handle) {
            return SlotState::Free;
        }
        self.slots[handle.index() as usize].state()
    }

    // -- scheduling ---------------------------------------------------------

    /// Transition `Allocated → Scheduled` and publish the ready bit.
    pub fn schedule(&self, handle: &ContractHandle) -> ScheduleResult {
        if !self.validate_handle(handle) {
            return ScheduleResult::Invalid;
        }
        let index = handle.index();
        let slot = &self.slots[index as usize];

        if let Err(current) = slot.cas_state(SlotState::Allocated, SlotState::Scheduled) {
            return match current {
                SlotState::Scheduled => ScheduleResult::AlreadyScheduled,
                SlotState::Executing => ScheduleResult::Executing,
                _ => ScheduleResult::Invalid,
            };
        }

        match slot.execution_type() {
            ExecutionType::MainThread => {
                self.ready_main.set(index);
                self.scheduled_main.fetch_add(1, Ordering::AcqRel);
            }
            ExecutionType::AnyThread => {
                self.ready.set(index);
                self.scheduled.fetch_add(1, Ordering::AcqRel);
            }
        }

        self.notify_provider();
        ScheduleResult::Scheduled
    }

    fn notify_provider(&self) {
        let provider = self.provider.read().unwrap().clone();
        if let Some(weak) = provider {
            if let (Some(provider), Some(me)) = (weak.upgrade(), self.me.upgrade()) {
                provider.notify_work_available(&me);
            }
        }
    }

    /// Transition `Scheduled → Allocated`, pulling the contract back out of
    /// the ready set.
    ///
    /// A handle whose generation has advanced because execution began (the
    /// slot is freed before the closure runs) reports
    /// [`ScheduleResult::Executing`] while any contract is still in flight,
    /// rather than `Invalid`: from the caller's perspective the work could
    /// not be stopped.
    pub fn unschedule(&self, handle: &ContractHandle) -> ScheduleResult {
        if !handle.is_owned_by(self) {
            return ScheduleResult::Invalid;
        }
        let index = handle.index();
        if index >= self.capacity {
            return ScheduleResult::Invalid;
        }
        let slot = &self.slots[index as usize];

        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            let state = slot.state();
            if state == SlotState::Executing {
                return ScheduleResult::Executing;
            }
            if state == SlotState::Free {
                let in_flight = self.executing.load(Ordering::Acquire)
                    + self.executing_main.load(Ordering::Acquire);
                if in_flight > 0 {
                    return ScheduleResult::Executing;
                }
            }
            return ScheduleResult::Invalid;
        }

        match slot.state() {
            SlotState::Scheduled => {
                if slot.cas_state(SlotState::Scheduled, SlotState::Allocated).is_err() {
                    // Lost the race to a selector.
                    return ScheduleResult::Executing;
                }
                let remaining = match slot.execution_type() {
                    ExecutionType::MainThread => {
                        self.ready_main.clear(index);
                        self.scheduled_main.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                    ExecutionType::AnyThread => {
                        self.ready.clear(index);
                        self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                };
                if remaining == 0 {
                    self.notify_waiters();
                }
                ScheduleResult::NotScheduled
            }
            SlotState::Executing => ScheduleResult::Executing,
            SlotState::Allocated => ScheduleResult::NotScheduled,
            SlotState::Free => ScheduleResult::Invalid,
        }
    }

    /// Give up a contract that has not started executing.
    ///
    /// `Allocated` and `Scheduled` slots are recycled (their generation
    /// advances, invalidating every outstanding handle). `Executing` and
    /// `Free` slots are left alone — the execute path owns their cleanup.
    pub fn release(&self, handle: &ContractHandle) {
        if !self.validate_handle(handle) {
            return;
        }
        let index = handle.index();
        let slot = &self.slots[index as usize];

        let mut current = slot.state();
        loop {
            match current {
                SlotState::Allocated | SlotState::Scheduled => {
                    match slot.cas_state(current, SlotState::Free) {
                        Ok(()) => {
                            self.return_slot_to_free_list(index, current);
                            return;
                        }
                        Err(observed) => current = observed,
                    }
                }
                // Executing or already Free: nothing for this thread to do.
                _ => return,
            }
        }
    }

    // -- selection ----------------------------------------------------------

    /// Pick a ready any-thread contract and claim it for execution.
    ///
    /// Returns an invalid handle when nothing is ready or the group is
    /// stopping. `bias` steers tie-breaking inside the signal tree and is
    /// rotated on success so repeated callers spread across the tree.
    pub fn select_for_execution(&self, bias: &mut u64) -> ContractHandle {
        self.select_inner(bias, ExecutionType::AnyThread)
    }

    /// Main-thread variant of [`select_for_execution`](Self::select_for_execution).
    pub fn select_for_main_thread_execution(&self, bias: &mut u64) -> ContractHandle {
        self.select_inner(bias, ExecutionType::MainThread)
    }

    fn select_inner(&self, bias: &mut u64, which: ExecutionType) -> ContractHandle {
        let _guard = SelectingGuard::enter(self, which);

        if self.stopping.load(Ordering::SeqCst) {
            return ContractHandle::invalid();
        }

        let tree = match which {
            ExecutionType::AnyThread => &self.ready,
            ExecutionType::MainThread => &self.ready_main,
        };

        let index = tree.select(*bias);
        if index == INVALID_SIGNAL_INDEX {
            return ContractHandle::invalid();
        }
        let slot = &self.slots[index as usize];

        if slot.cas_state(SlotState::Scheduled, SlotState::Executing).is_err() {
            // Someone else claimed or released the slot between our tree
            // select and the CAS.
            return ContractHandle::invalid();
        }

        // Layer 1 clear: drop the ready bit as soon as the claim lands.
        tree.clear(index);

        // The stamp uses the pre-execution generation: the handle stays
        // valid until execute_contract bumps it.
        let generation = slot.generation.load(Ordering::Acquire);

        match which {
            ExecutionType::AnyThread => {
                self.scheduled.fetch_sub(1, Ordering::AcqRel);
                self.executing.fetch_add(1, Ordering::AcqRel);
            }
            ExecutionType::MainThread => {
                self.scheduled_main.fetch_sub(1, Ordering::AcqRel);
                self.executing_main.fetch_add(1, Ordering::AcqRel);
            }
        }

        *bias = bias.rotate_left(1);
        ContractHandle::new(self.me.clone(), index, generation)
    }

    // -- execution ----------------------------------------------------------

    /// Run a contract previously claimed by a selection call.
    ///
    /// The slot is recycled *before* the closure runs: the generation is
    /// bumped (invalidating the issuer's handle and all aliases), the state
    /// is stored `Free`, the ready bit gets a defensive clear, and the slot
    /// rejoins the free list. This lets the closure create and schedule new
    /// contracts — including one that reuses the very slot it came from.
    ///
    /// A panic unwinding out of the closure is caught at this boundary and
    /// logged; the group's bookkeeping completes normally.
    pub fn execute_contract(&self, handle: &ContractHandle) {
        if !self.validate_handle(handle) {
            return;
        }
        let index = handle.index();
        let slot = &self.slots[index as usize];
        let is_main = slot.execution_type() == ExecutionType::MainThread;

        // Point of no return: take the work out of the slot.
        let task = slot.work.lock().unwrap().take();

        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.state.store(SlotState::Free as u8, Ordering::Release);

        // Layer 3 clear: covers a selector preempted before its own clear.
        if is_main {
            self.ready_main.clear(index);
        } else {
            self.ready.clear(index);
        }

        self.push_free_slot(index);

        // Run without holding any slot identity.
        if let Some(task) = task {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!(
                    group = %self.name,
                    contract = index,
                    "contract panicked: {}",
                    panic_message(&payload)
                );
            }
        }

        let remaining_exec = if is_main {
            self.executing_main.fetch_sub(1, Ordering::AcqRel) - 1
        } else {
            self.executing.fetch_sub(1, Ordering::AcqRel) - 1
        };
        if remaining_exec == 0 {
            self.notify_waiters();
        }

        let new_active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if new_active < self.capacity {
            self.fire_capacity_callbacks();
        }
    }

    /// Drain and run ready main-thread contracts, up to `max`.
    ///
    /// Returns the number executed. Intended to be called from the
    /// application's event loop.
    pub fn execute_main_thread_work(&self, max: usize) -> usize {
        let mut executed = 0;
        let mut bias = 0u64;
        while executed < max {
            let handle = self.select_for_main_thread_execution(&mut bias);
            if !handle.valid() {
                break;
            }
            self.execute_contract(&handle);
            executed += 1;
        }
        executed
    }

    /// Drain the main-thread ready set completely.
    pub fn execute_all_main_thread_work(&self) -> usize {
        self.execute_main_thread_work(usize::MAX)
    }

    /// Select and run any-thread contracts on the calling thread until none
    /// remain ready. Useful in tests and single-threaded pumping.
    pub fn execute_all_background_work(&self) -> usize {
        let mut executed = 0;
        let mut bias = 0u64;
        loop {
            let handle = self.select_for_execution(&mut bias);
            if !handle.valid() {
                break;
            }
            self.execute_contract(&handle);
            executed += 1;
        }
        executed
    }

    // -- lifecycle ----------------------------------------------------------

    /// Refuse further selection and wake all waiters.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify_waiters();
    }

    /// Allow selection again after a [`stop`](Self::stop).
    pub fn resume(&self) {
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Block until the group is quiescent.
    ///
    /// Normally that means no contract is scheduled or executing. While
    /// stopping, the predicate instead waits for executing *and* selecting
    /// threads to drain so teardown can proceed safely.
    pub fn wait(&self) {
        let guard = self.wait_lock.lock().unwrap();
        let _guard = self
            .wait_cv
            .wait_while(guard, |_| {
                if self.stopping.load(Ordering::SeqCst) {
                    !(self.executing.load(Ordering::Acquire) == 0
                        && self.selecting.load(Ordering::Acquire) == 0
                        && self.executing_main.load(Ordering::Acquire) == 0
                        && self.selecting_main.load(Ordering::Acquire) == 0)
                } else {
                    !(self.scheduled.load(Ordering::Acquire) == 0
                        && self.executing.load(Ordering::Acquire) == 0
                        && self.scheduled_main.load(Ordering::Acquire) == 0
                        && self.executing_main.load(Ordering::Acquire) == 0)
                }
            })
            .unwrap();
    }

    fn notify_waiters(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cv.notify_all();
    }

    /// Move every `Scheduled` slot back to `Allocated` and clear its bit.
    pub fn unschedule_all(&self) {
        for index in 0..self.capacity {
            let slot = &self.slots[index as usize];
            if slot.state() != SlotState::Scheduled {
                continue;
            }
            if slot.cas_state(SlotState::Scheduled, SlotState::Allocated).is_ok() {
                let remaining = match slot.execution_type() {
                    ExecutionType::MainThread => {
                        self.ready_main.clear(index);
                        self.scheduled_main.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                    ExecutionType::AnyThread => {
                        self.ready.clear(index);
                        self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
                    }
                };
                if remaining == 0 {
                    self.notify_waiters();
                }
            }
            // A failed CAS means the slot raced into execution; fine.
        }
    }

    /// Recycle every slot that is not `Free` or `Executing`.
    pub fn release_all(&self) {
        for index in 0..self.capacity {
            let slot = &self.slots[index as usize];
            let current = slot.state();
            if current == SlotState::Allocated || current == SlotState::Scheduled {
                if slot.cas_state(current, SlotState::Free).is_ok() {
                    self.return_slot_to_free_list(index, current);
                }
            }
        }
    }

    /// Shared cleanup for slots recycled without executing.
    fn return_slot_to_free_list(&self, index: u32, previous: SlotState) {
        let slot = &self.slots[index as usize];
        let is_main = slot.execution_type() == ExecutionType::MainThread;

        // Invalidate every outstanding handle, then drop the work.
        slot.generation.fetch_add(1, Ordering::AcqRel);
        *slot.work.lock().unwrap() = None;

        if previous == SlotState::Scheduled {
            // Layer 2 clear: released while still scheduled.
            let remaining = if is_main {
                self.ready_main.clear(index);
                self.scheduled_main.fetch_sub(1, Ordering::AcqRel) - 1
            } else {
                self.ready.clear(index);
                self.scheduled.fetch_sub(1, Ordering::AcqRel) - 1
            };
            if remaining == 0 {
                self.notify_waiters();
            }
        }

        let new_active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.push_free_slot(index);

        if new_active < self.capacity {
            self.fire_capacity_callbacks();
        }
    }

    // -- provider & callbacks -----------------------------------------------

    /// Attach (or with `None`, detach) the provider notified on schedule.
    pub fn set_concurrency_provider(&self, provider: Option<Weak<dyn ConcurrencyProvider>>) {
        *self.provider.write().unwrap() = provider;
    }

    /// Register a callback fired whenever a slot is recycled and the group
    /// has spare capacity again.
    pub fn add_on_capacity_available(
        &self,
        callback: impl Fn() + Send + 'static,
    ) -> CapacityCallbackId {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.capacity_callbacks
            .lock()
            .unwrap()
            .push((id, Box::new(callback)));
        CapacityCallbackId(id)
    }

    /// Remove a callback registered with
    /// [`add_on_capacity_available`](Self::add_on_capacity_available).
    pub fn remove_on_capacity_available(&self, id: CapacityCallbackId) {
        self.capacity_callbacks
            .lock()
            .unwrap()
            .retain(|(cookie, _)| *cookie != id.0);
    }

    fn fire_capacity_callbacks(&self) {
        let callbacks = self.capacity_callbacks.lock().unwrap();
        for (_, callback) in callbacks.iter() {
            callback();
        }
    }
}

impl Drop for ContractGroup {
    fn drop(&mut self) {
        // No other thread can reach the group here (the last Arc is gone and
        // Weak upgrades already fail), but contracts may still sit allocated
        // or scheduled: recycle them so their closures drop.
        self.stopping.store(true, Ordering::SeqCst);
        self.unschedule_all();
        self.release_all();
        tracing::debug!(group = %self.name, "contract group dropped");
    }
}

impl std::fmt::Debug for ContractGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractGroup")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("scheduled", &self.scheduled.load(Ordering::Relaxed))
            .field("executing", &self.executing.load(Ordering::Relaxed))
            .field(
                "scheduled_main",
                &self.scheduled_main.load(Ordering::Relaxed),
            )
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII guard tracking threads inside a selection call so teardown can wait
/// for them to leave.
struct SelectingGuard<'a> {
    group: &'a ContractGroup,
    counter: &'a AtomicU32,
}

impl<'a> SelectingGuard<'a> {
    fn enter(group: &'a ContractGroup, which: ExecutionType) -> Self {
        let counter = match which {
            ExecutionType::AnyThread => &group.selecting,
            ExecutionType::MainThread => &group.selecting_main,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        Self { group, counter }
    }
}

impl Drop for SelectingGuard<'_> {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.notify_waiters();
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn create_schedule_execute_runs_work() {
        let group = ContractGroup::new(4, "basic");
        let counter = Arc::new(AtomicUsize::new(0));

        let ctr = Arc::clone(&counter);
        let handle = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::AnyThread,
        );
        assert!(handle.valid());
        assert_eq!(group.schedule(&handle), ScheduleResult::Scheduled);
        assert_eq!(group.execute_all_background_work(), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn full_group_returns_invalid_handle() {
        let group = ContractGroup::new(2, "full");
        let h1 = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        let h2 = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert!(h1.valid() && h2.valid());

        let h3 = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert!(!h3.valid());
        assert_eq!(group.schedule(&h3), ScheduleResult::Invalid);

        // Releasing one slot makes room again.
        group.release(&h1);
        let h4 = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert!(h4.valid());
    }

    #[test]
    fn capacity_four_runs_all_four() {
        // Group capacity 4: create four contracts, schedule all, drain.
        let group = ContractGroup::new(4, "s1");
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctr = Arc::clone(&counter);
                group.create_contract(
                    Box::new(move || {
                        ctr.fetch_add(1, Ordering::Relaxed);
                    }),
                    ExecutionType::AnyThread,
                )
            })
            .collect();
        for h in &handles {
            assert_eq!(group.schedule(h), ScheduleResult::Scheduled);
        }
        group.execute_all_background_work();
        group.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        for h in &handles {
            assert!(!h.valid(), "handles must be stale after execution");
        }
    }

    #[test]
    fn double_schedule_reports_already_scheduled() {
        let group = ContractGroup::new(2, "dup");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert_eq!(group.schedule(&h), ScheduleResult::Scheduled);
        assert_eq!(group.schedule(&h), ScheduleResult::AlreadyScheduled);
    }

    #[test]
    fn unschedule_before_selection_cancels() {
        let group = ContractGroup::new(2, "cancel");
        let counter = Arc::new(AtomicUsize::new(0));
        let ctr = Arc::clone(&counter);
        let h = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::AnyThread,
        );
        group.schedule(&h);
        assert_eq!(group.unschedule(&h), ScheduleResult::NotScheduled);
        assert_eq!(group.scheduled_count(), 0);

        // Nothing ready: nothing runs.
        assert_eq!(group.execute_all_background_work(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        // The contract is back to Allocated and can be rescheduled.
        assert_eq!(group.schedule(&h), ScheduleResult::Scheduled);
        group.execute_all_background_work();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unschedule_after_execution_begins_reports_executing() {
        let group = ContractGroup::new(2, "late-cancel");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&h);

        let mut bias = 0;
        let selected = group.select_for_execution(&mut bias);
        assert!(selected.valid());

        // Selected but not yet executing the closure: state is Executing.
        assert_eq!(group.unschedule(&h), ScheduleResult::Executing);

        group.execute_contract(&selected);
        assert!(!h.valid());
    }

    #[test]
    fn unschedule_with_stale_handle_while_work_in_flight() {
        // The generation advances the moment execution begins; while the
        // closure is still running, a stale handle reports Executing.
        let group = ContractGroup::new(2, "stale");
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let h = group.create_contract(
            Box::new(move || {
                started_tx.send(()).unwrap();
                rx.recv().unwrap();
            }),
            ExecutionType::AnyThread,
        );
        group.schedule(&h);

        let runner = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                group.execute_all_background_work();
            })
        };

        started_rx.recv().unwrap();
        // The closure is running; the slot is already freed and the
        // generation bumped.
        assert_eq!(group.unschedule(&h), ScheduleResult::Executing);

        tx.send(()).unwrap();
        runner.join().unwrap();

        // Once nothing is in flight, the stale handle is just invalid.
        assert_eq!(group.unschedule(&h), ScheduleResult::Invalid);
    }

    #[test]
    fn release_invalidates_outstanding_handles() {
        let group = ContractGroup::new(2, "release");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        let alias = h.clone();
        assert!(alias.valid());

        group.release(&h);
        assert!(!h.valid());
        assert!(!alias.valid());
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn release_scheduled_clears_ready_bit() {
        let group = ContractGroup::new(2, "release-sched");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&h);
        assert_eq!(group.scheduled_count(), 1);

        group.release(&h);
        assert_eq!(group.scheduled_count(), 0);
        assert_eq!(group.execute_all_background_work(), 0);
    }

    #[test]
    fn handle_valid_until_execution_begins() {
        let group = ContractGroup::new(2, "window");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&h);

        let mut bias = 0;
        let selected = group.select_for_execution(&mut bias);
        // Selection does not bump the generation: both handles still match.
        assert!(h.valid());
        assert!(selected.valid());

        group.execute_contract(&selected);
        // Execution bumped the generation before the closure ran.
        assert!(!h.valid());
        assert!(!selected.valid());
    }

    #[test]
    fn contract_can_reschedule_into_its_own_slot() {
        // The slot returns to the free list before the closure runs, so a
        // contract can create a successor that lands in the same slot.
        let group = ContractGroup::new(1, "reentrant");
        let counter = Arc::new(AtomicUsize::new(0));

        let group_inner = Arc::clone(&group);
        let ctr = Arc::clone(&counter);
        let h = group.create_contract(
            Box::new(move || {
                ctr.fetch_add(1, Ordering::Relaxed);
                let ctr2 = Arc::clone(&ctr);
                let follow_up = group_inner.create_contract(
                    Box::new(move || {
                        ctr2.fetch_add(1, Ordering::Relaxed);
                    }),
                    ExecutionType::AnyThread,
                );
                assert!(follow_up.valid(), "slot must be reusable mid-execution");
                group_inner.schedule(&follow_up);
            }),
            ExecutionType::AnyThread,
        );
        group.schedule(&h);

        group.execute_all_background_work();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn executing_counter_increments_and_decrements_once() {
        let group = ContractGroup::new(4, "counters");
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let group2 = Arc::clone(&group);
            let peak2 = Arc::clone(&peak);
            let h = group.create_contract(
                Box::new(move || {
                    let now = group2.executing_count();
                    peak2.fetch_max(now, Ordering::Relaxed);
                }),
                ExecutionType::AnyThread,
            );
            group.schedule(&h);
        }
        group.execute_all_background_work();
        assert_eq!(group.executing_count(), 0);
        assert!(peak.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn main_thread_work_is_separate_from_background() {
        let group = ContractGroup::new(4, "main");
        let main_runs = Arc::new(AtomicUsize::new(0));
        let any_runs = Arc::new(AtomicUsize::new(0));

        let m = Arc::clone(&main_runs);
        let h1 = group.create_contract(
            Box::new(move || {
                m.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::MainThread,
        );
        let a = Arc::clone(&any_runs);
        let h2 = group.create_contract(
            Box::new(move || {
                a.fetch_add(1, Ordering::Relaxed);
            }),
            ExecutionType::AnyThread,
        );
        group.schedule(&h1);
        group.schedule(&h2);

        // Background drain must not touch main-thread work.
        group.execute_all_background_work();
        assert_eq!(any_runs.load(Ordering::Relaxed), 1);
        assert_eq!(main_runs.load(Ordering::Relaxed), 0);
        assert_eq!(group.main_thread_scheduled_count(), 1);

        assert_eq!(group.execute_main_thread_work(8), 1);
        assert_eq!(main_runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn execute_main_thread_work_respects_limit() {
        let group = ContractGroup::new(8, "main-limit");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ctr = Arc::clone(&counter);
            let h = group.create_contract(
                Box::new(move || {
                    ctr.fetch_add(1, Ordering::Relaxed);
                }),
                ExecutionType::MainThread,
            );
            group.schedule(&h);
        }
        assert_eq!(group.execute_main_thread_work(2), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(group.execute_all_main_thread_work(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn stop_blocks_selection_and_resume_restores_it() {
        let group = ContractGroup::new(2, "stop");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&h);

        group.stop();
        let mut bias = 0;
        assert!(!group.select_for_execution(&mut bias).valid());

        group.resume();
        assert!(group.select_for_execution(&mut bias).valid());
    }

    #[test]
    fn capacity_callbacks_fire_on_slot_recycle() {
        let group = ContractGroup::new(1, "callbacks");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let id = group.add_on_capacity_available(move || {
            f.fetch_add(1, Ordering::Relaxed);
        });

        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&h);
        group.execute_all_background_work();
        assert!(fired.load(Ordering::Relaxed) >= 1);

        let before = fired.load(Ordering::Relaxed);
        group.remove_on_capacity_available(id);
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.release(&h);
        assert_eq!(fired.load(Ordering::Relaxed), before);
    }

    #[test]
    fn panicking_contract_frees_slot_and_bookkeeping() {
        let group = ContractGroup::new(1, "panics");
        let h = group.create_contract(
            Box::new(|| panic!("closure exploded")),
            ExecutionType::AnyThread,
        );
        group.schedule(&h);
        group.execute_all_background_work();

        assert_eq!(group.active_count(), 0);
        assert_eq!(group.executing_count(), 0);
        // Slot is usable again.
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert!(h.valid());
    }

    #[test]
    fn wait_returns_once_scheduled_and_executing_drain() {
        let group = ContractGroup::new(4, "wait");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ctr = Arc::clone(&counter);
            let h = group.create_contract(
                Box::new(move || {
                    thread::sleep(Duration::from_millis(2));
                    ctr.fetch_add(1, Ordering::Relaxed);
                }),
                ExecutionType::AnyThread,
            );
            group.schedule(&h);
        }

        let drainer = {
            let group = Arc::clone(&group);
            thread::spawn(move || {
                group.execute_all_background_work();
            })
        };
        group.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        drainer.join().unwrap();
    }

    #[test]
    fn concurrent_create_schedule_execute_stress() {
        let group = ContractGroup::new(64, "stress");
        let counter = Arc::new(AtomicUsize::new(0));
        let target = 2_000usize;
        let produced = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for _ in 0..3 {
            let group = Arc::clone(&group);
            let counter = Arc::clone(&counter);
            let produced = Arc::clone(&produced);
            producers.push(thread::spawn(move || loop {
                if produced.load(Ordering::Relaxed) >= target {
                    break;
                }
                let ctr = Arc::clone(&counter);
                let h = group.create_contract(
                    Box::new(move || {
                        ctr.fetch_add(1, Ordering::Relaxed);
                    }),
                    ExecutionType::AnyThread,
                );
                if h.valid() {
                    produced.fetch_add(1, Ordering::Relaxed);
                    group.schedule(&h);
                } else {
                    thread::yield_now();
                }
            }));
        }

        let mut consumers = Vec::new();
        for t in 0..3u64 {
            let group = Arc::clone(&group);
            let counter = Arc::clone(&counter);
            consumers.push(thread::spawn(move || {
                let mut bias = t.wrapping_mul(0x9e37_79b9_7f4a_7c15);
                while counter.load(Ordering::Relaxed) < target {
                    let h = group.select_for_execution(&mut bias);
                    if h.valid() {
                        group.execute_contract(&h);
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        group.execute_all_background_work();
        assert_eq!(counter.load(Ordering::Relaxed), target);
        assert_eq!(group.active_count(), 0);
        assert_eq!(group.scheduled_count(), 0);
        assert_eq!(group.executing_count(), 0);
    }

    #[test]
    fn unschedule_all_returns_contracts_to_allocated() {
        let group = ContractGroup::new(4, "unschedule-all");
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
                group.schedule(&h);
                h
            })
            .collect();
        assert_eq!(group.scheduled_count(), 3);

        group.unschedule_all();
        assert_eq!(group.scheduled_count(), 0);
        // Slots stay allocated and can be rescheduled.
        assert_eq!(group.active_count(), 3);
        for h in &handles {
            assert!(h.valid());
            assert_eq!(group.schedule(h), ScheduleResult::Scheduled);
        }
    }

    #[test]
    fn release_all_recycles_everything_not_executing() {
        let group = ContractGroup::new(4, "release-all");
        let allocated = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        let scheduled = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        group.schedule(&scheduled);

        group.release_all();
        assert_eq!(group.active_count(), 0);
        assert_eq!(group.scheduled_count(), 0);
        assert!(!allocated.valid());
        assert!(!scheduled.valid());

        // The whole pool is free again.
        for _ in 0..4 {
            assert!(group
                .create_contract(Box::new(|| {}), ExecutionType::AnyThread)
                .valid());
        }
    }

    #[test]
    fn debug_format_shows_name_and_capacity() {
        let group = ContractGroup::new(3, "dbg");
        let s = format!("{:?}", group);
        assert!(s.contains("ContractGroup"));
        assert!(s.contains("dbg"));
    }
}
