//! Lock-free signal tree: an atomic bitmap with hierarchical popcounts.
//!
//! A [`SignalTree`] tracks up to `capacity` ready flags ("signals") and
//! supports three operations, all lock-free:
//!
//! * [`set`](SignalTree::set) — raise signal `i`.
//! * [`clear`](SignalTree::clear) — lower signal `i`.
//! * [`select`](SignalTree::select) — find *some* raised signal, atomically
//!   lower it, and return its index.
//!
//! # Layout
//!
//! The tree is a perfect binary tree stored as a flat array of `AtomicU64`
//! in the classic 1-based heap layout (`nodes[1]` is the root, children of
//! `n` are `2n` and `2n+1`). The bottom level holds `L` leaf words, where
//! `L` is the smallest power of two with `L * 64 >= capacity` and `L >= 2`
//! (so the root is always an internal node). Each leaf bit represents one
//! signal; every internal node stores the number of raised bits in its
//! subtree.
//!
//! # Selection
//!
//! `select` descends from the root. At each internal node it inspects both
//! children's weights; when both subtrees contain signals it picks a side
//! from the caller-supplied `bias` (one bit per level), which distributes
//! selection pressure across concurrent selectors. At the leaf it picks a
//! set bit (starting from a bias-derived rotation), attempts to clear it
//! with `fetch_and`, and propagates the decrement upward on success. Losing
//! a race to another selector retries from the root a bounded number of
//! times before reporting "no signal" so the caller can back off.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel index meaning "no signal found".
pub const INVALID_SIGNAL_INDEX: u32 = u32::MAX;

/// Bounded retries in [`SignalTree::select`] before giving up on races.
const SELECT_RETRIES: usize = 8;

/// A fixed-capacity atomic signal bitmap with popcount internal nodes.
pub struct SignalTree {
    /// Number of addressable signals. Bits at or beyond `capacity` are
    /// never set.
    capacity: u32,
    /// Number of 64-bit leaf words; a power of two, at least 2.
    leaf_count: usize,
    /// `nodes[1..leaf_count]` are internal popcounts; `nodes[leaf_count..]`
    /// are leaf bitmap words. `nodes[0]` is unused padding.
    nodes: Vec<AtomicU64>,
}

impl SignalTree {
    /// Create a tree able to track `capacity` signals, all initially clear.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "signal tree capacity must be nonzero");
        let words = (capacity as usize).div_ceil(64);
        let leaf_count = words.next_power_of_two().max(2);
        let nodes = (0..leaf_count * 2).map(|_| AtomicU64::new(0)).collect();
        Self {
            capacity,
            leaf_count,
            nodes,
        }
    }

    /// Number of signals this tree can track.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Total number of currently-raised signals (the root popcount).
    pub fn count(&self) -> u64 {
        self.nodes[1].load(Ordering::Acquire)
    }

    /// `true` when no signal is raised.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Raise signal `i`. Returns `true` if the bit transitioned 0 → 1.
    pub fn set(&self, i: u32) -> bool {
        debug_assert!(i < self.capacity, "signal index out of range");
        let leaf = self.leaf_count + (i as usize) / 64;
        let bit = 1u64 << (i % 64);
        let prev = self.nodes[leaf].fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            self.adjust_ancestors(leaf, 1);
            true
        } else {
            false
        }
    }

    /// Lower signal `i`. Returns `true` if the bit transitioned 1 → 0.
    pub fn clear(&self, i: u32) -> bool {
        debug_assert!(i < self.capacity, "signal index out of range");
        let leaf = self.leaf_count + (i as usize) / 64;
        let bit = 1u64 << (i % 64);
        let prev = self.nodes[leaf].fetch_and(!bit, Ordering::AcqRel);
        if prev & bit != 0 {
            self.adjust_ancestors(leaf, -1);
            true
        } else {
            false
        }
    }

    /// Find a raised signal, lower it, and return its index.
    ///
    /// Returns [`INVALID_SIGNAL_INDEX`] when the tree is empty or when every
    /// bounded retry lost a race to a concurrent selector; the caller should
    /// back off and try again rather than spin here.
    pub fn select(&self, bias: u64) -> u32 {
        'retry: for _ in 0..SELECT_RETRIES {
            if self.nodes[1].load(Ordering::Acquire) == 0 {
                return INVALID_SIGNAL_INDEX;
            }

            // Descend to a leaf, steering by the bias bit for each level.
            let mut node = 1usize;
            let mut depth = 0u32;
            while node < self.leaf_count {
                let left = node * 2;
                let right = node * 2 + 1;
                let lw = self.child_weight(left);
                let rw = self.child_weight(right);
                node = if lw > 0 && rw > 0 {
                    if (bias >> (depth % 64)) & 1 == 1 {
                        right
                    } else {
                        left
                    }
                } else if lw > 0 {
                    left
                } else if rw > 0 {
                    right
                } else {
                    // Raced into a drained subtree; start over.
                    continue 'retry;
                };
                depth += 1;
            }

            let word = self.nodes[node].load(Ordering::Acquire);
            if word == 0 {
                continue 'retry;
            }

            // Pick a set bit, scanning circularly from a bias-derived start
            // so concurrent selectors spread over the word.
            let start = (bias as u32) & 63;
            let rotated = word.rotate_right(start);
            let bit_pos = (rotated.trailing_zeros() + start) % 64;
            let mask = 1u64 << bit_pos;

            let prev = self.nodes[node].fetch_and(!mask, Ordering::AcqRel);
            if prev & mask != 0 {
                self.adjust_ancestors(node, -1);
                return ((node - self.leaf_count) * 64) as u32 + bit_pos;
            }
            // Another selector cleared the bit first; retry from the root.
        }
        INVALID_SIGNAL_INDEX
    }

    /// Weight of a child node: its popcount if internal, the number of set
    /// bits if it is a leaf word.
    #[inline]
    fn child_weight(&self, idx: usize) -> u64 {
        let raw = self.nodes[idx].load(Ordering::Acquire);
        if idx < self.leaf_count {
            raw
        } else {
            u64::from(raw.count_ones())
        }
    }

    /// Walk from a leaf's parent to the root adding `delta` to each
    /// popcount.
    #[inline]
    fn adjust_ancestors(&self, leaf: usize, delta: i64) {
        let mut node = leaf / 2;
        while node >= 1 {
            if delta > 0 {
                self.nodes[node].fetch_add(delta as u64, Ordering::AcqRel);
            } else {
                self.nodes[node].fetch_sub((-delta) as u64, Ordering::AcqRel);
            }
            node /= 2;
        }
    }
}

impl std::fmt::Debug for SignalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTree")
            .field("capacity", &self.capacity)
            .field("leaf_count", &self.leaf_count)
            .field("count", &self.count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
