//! Pluggable policies for picking which contract group a worker draws from.
//!
//! The work service consults a [`SchedulerStrategy`] at the top of every
//! worker iteration. Strategies are notified when groups come and go, when a
//! group reports fresh work, and how each selection turned out, so they can
//! adapt. All implementations tolerate groups appearing and disappearing
//! concurrently.
//!
//! Provided policies:
//!
//! * [`RoundRobin`] — cycles through groups with an atomic cursor.
//! * [`Random`] — uniform pick among groups reporting scheduled work.
//! * [`AdaptiveRanking`] — weights groups by recent selection hit rate,
//!   aging down groups that repeatedly come up empty. The default.
//! * [`Direct`] / [`SpinningDirect`] — single-group fast paths; the spinning
//!   variant always reports the group so the worker never parks.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::group::ContractGroup;

/// Policy deciding which group a worker should draw from next.
pub trait SchedulerStrategy: Send + Sync {
    /// A group joined the service.
    fn notify_group_added(&self, group: &Arc<ContractGroup>);

    /// A group left the service; it must never be returned again.
    fn notify_group_removed(&self, group: &Arc<ContractGroup>);

    /// A group reported newly scheduled work.
    fn notify_work_available(&self, group: &Arc<ContractGroup>) {
        let _ = group;
    }

    /// Feedback from the worker: did the last selection on `group` yield a
    /// contract?
    fn notify_selection_result(&self, group: &Arc<ContractGroup>, had_work: bool) {
        let _ = (group, had_work);
    }

    /// Pick the next group to draw from, or `None` when there is nothing
    /// worth visiting and the worker should park.
    fn select_next_group(&self) -> Option<Arc<ContractGroup>>;
}

// ---------------------------------------------------------------------------
// RoundRobin
// ---------------------------------------------------------------------------

/// Cycles through registered groups in insertion order.
#[derive(Default)]
pub struct RoundRobin {
    groups: RwLock<Vec<Arc<ContractGroup>>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerStrategy for RoundRobin {
    fn notify_group_added(&self, group: &Arc<ContractGroup>) {
        self.groups.write().unwrap().push(Arc::clone(group));
    }

    fn notify_group_removed(&self, group: &Arc<ContractGroup>) {
        self.groups
            .write()
            .unwrap()
            .retain(|g| !Arc::ptr_eq(g, group));
    }

    fn select_next_group(&self) -> Option<Arc<ContractGroup>> {
        let groups = self.groups.read().unwrap();
        if groups.is_empty() {
            return None;
        }
        // Visit up to one full cycle, skipping groups with nothing scheduled.
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..groups.len() {
            let group = &groups[(start + offset) % groups.len()];
            if group.scheduled_count() > 0 {
                return Some(Arc::clone(group));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Picks uniformly among groups that report scheduled work.
pub struct Random {
    groups: RwLock<Vec<Arc<ContractGroup>>>,
    rng: AtomicU64,
}

impl Random {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            rng: AtomicU64::new(0x2545_f491_4f6c_dd1d),
        }
    }

    /// xorshift64 step shared across callers; uniformity is approximate and
    /// good enough for load spreading.
    fn next(&self) -> u64 {
        let mut x = self.rng.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.store(x.max(1), Ordering::Relaxed);
        x
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerStrategy for Random {
    fn notify_group_added(&self, group: &Arc<ContractGroup>) {
        self.groups.write().unwrap().push(Arc::clone(group));
    }

    fn notify_group_removed(&self, group: &Arc<ContractGroup>) {
        self.groups
            .write()
            .unwrap()
            .retain(|g| !Arc::ptr_eq(g, group));
    }

    fn select_next_group(&self) -> Option<Arc<ContractGroup>> {
        let groups = self.groups.read().unwrap();
        let ready: Vec<&Arc<ContractGroup>> = groups
            .iter()
            .filter(|g| g.scheduled_count() > 0)
            .collect();
        if ready.is_empty() {
            return None;
        }
        let pick = (self.next() as usize) % ready.len();
        Some(Arc::clone(ready[pick]))
    }
}

// ---------------------------------------------------------------------------
// AdaptiveRanking
// ---------------------------------------------------------------------------

/// Per-group weight bounds for [`AdaptiveRanking`].
const WEIGHT_FLOOR: u32 = 1;
const WEIGHT_START: u32 = 16;
const WEIGHT_CEIL: u32 = 64;
/// Added on a hit, subtracted on a miss.
const WEIGHT_HIT_BOOST: u32 = 4;

struct RankedGroup {
    group: Arc<ContractGroup>,
    weight: AtomicU32,
}

/// Prefers groups whose recent selections actually produced work.
///
/// Each group carries a bounded weight: selection hits boost it, empty
/// visits age it down. Workers visit the heaviest group that currently
/// reports scheduled work; with nothing scheduled anywhere the worker is
/// told to park.
pub struct AdaptiveRanking {
    groups: Mutex<Vec<RankedGroup>>,
}

impl AdaptiveRanking {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
        }
    }
}

impl Default for AdaptiveRanking {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerStrategy for AdaptiveRanking {
    fn notify_group_added(&self, group: &Arc<ContractGroup>) {
        self.groups.lock().unwrap().push(RankedGroup {
            group: Arc::clone(group),
            weight: AtomicU32::new(WEIGHT_START),
        });
    }

    fn notify_group_removed(&self, group: &Arc<ContractGroup>) {
        self.groups
            .lock()
            .unwrap()
            .retain(|r| !Arc::ptr_eq(&r.group, group));
    }

    fn notify_work_available(&self, group: &Arc<ContractGroup>) {
        let groups = self.groups.lock().unwrap();
        if let Some(entry) = groups.iter().find(|r| Arc::ptr_eq(&r.group, group)) {
            // A fresh schedule is as good as a hit.
            bump(&entry.weight, WEIGHT_HIT_BOOST);
        }
    }

    fn notify_selection_result(&self, group: &Arc<ContractGroup>, had_work: bool) {
        let groups = self.groups.lock().unwrap();
        if let Some(entry) = groups.iter().find(|r| Arc::ptr_eq(&r.group, group)) {
            if had_work {
                bump(&entry.weight, WEIGHT_HIT_BOOST);
            } else {
                age(&entry.weight);
            }
        }
    }

    fn select_next_group(&self) -> Option<Arc<ContractGroup>> {
        let groups = self.groups.lock().unwrap();
        if groups.is_empty() {
            return None;
        }

        fn heaviest<'a>(
            candidates: &mut dyn Iterator<Item = &'a RankedGroup>,
        ) -> Option<&'a RankedGroup> {
            candidates.max_by_key(|r| r.weight.load(Ordering::Relaxed))
        }

        let mut with_work = groups.iter().filter(|r| r.group.scheduled_count() > 0);
        if let Some(entry) = heaviest(&mut with_work) {
            return Some(Arc::clone(&entry.group));
        }
        None
    }
}

fn bump(weight: &AtomicU32, by: u32) {
    let mut current = weight.load(Ordering::Relaxed);
    loop {
        let next = (current + by).min(WEIGHT_CEIL);
        match weight.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn age(weight: &AtomicU32) {
    let mut current = weight.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_sub(1).max(WEIGHT_FLOOR);
        match weight.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

// ---------------------------------------------------------------------------
// Direct / SpinningDirect
// ---------------------------------------------------------------------------

/// Single-group optimization: returns its group while work is scheduled,
/// `None` otherwise so the worker can park.
#[derive(Default)]
pub struct Direct {
    group: Mutex<Option<Arc<ContractGroup>>>,
}

impl Direct {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerStrategy for Direct {
    fn notify_group_added(&self, group: &Arc<ContractGroup>) {
        *self.group.lock().unwrap() = Some(Arc::clone(group));
    }

    fn notify_group_removed(&self, group: &Arc<ContractGroup>) {
        let mut slot = self.group.lock().unwrap();
        if slot.as_ref().is_some_and(|g| Arc::ptr_eq(g, group)) {
            *slot = None;
        }
    }

    fn select_next_group(&self) -> Option<Arc<ContractGroup>> {
        let slot = self.group.lock().unwrap();
        slot.as_ref()
            .filter(|g| g.scheduled_count() > 0)
            .map(Arc::clone)
    }
}

/// Like [`Direct`], but always reports the group so workers never park.
///
/// Trades CPU for latency; suited to dedicated soft-realtime groups.
#[derive(Default)]
pub struct SpinningDirect {
    group: Mutex<Option<Arc<ContractGroup>>>,
}

impl SpinningDirect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchedulerStrategy for SpinningDirect {
    fn notify_group_added(&self, group: &Arc<ContractGroup>) {
        *self.group.lock().unwrap() = Some(Arc::clone(group));
    }

    fn notify_group_removed(&self, group: &Arc<ContractGroup>) {
        let mut slot = self.group.lock().unwrap();
        if slot.as_ref().is_some_and(|g| Arc::ptr_eq(g, group)) {
            *slot = None;
        }
    }

    fn select_next_group(&self) -> Option<Arc<ContractGroup>> {
        self.group.lock().unwrap().as_ref().map(Arc::clone)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
