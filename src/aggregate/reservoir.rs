//! Bounded uniform sample of a numeric column.
//!
//! Bottom-k sampling: every offered value carries a random 64-bit key and the
//! reservoir keeps the `k` entries with the smallest keys. The union of two
//! reservoirs trimmed back to `k` is the reservoir of the combined stream, so
//! merging is exactly associative and commutative.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: u64,
    value: f64,
}

impl Entry {
    fn rank(&self) -> (u64, u64) {
        (self.key, self.value.to_bits())
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Clone, Debug)]
pub struct Reservoir {
    capacity: usize,
    // max-heap: the root is the entry evicted next
    heap: BinaryHeap<Entry>,
    seen: u64,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
            seen: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total values offered, including those not retained.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn offer(&mut self, value: f64, key: u64) {
        self.seen += 1;
        self.insert(Entry { key, value });
    }

    fn insert(&mut self, entry: Entry) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
        } else if let Some(mut top) = self.heap.peek_mut()
            && entry < *top
        {
            *top = entry;
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.seen += other.seen;
        for entry in other.heap {
            self.insert(entry);
        }
    }

    /// Retained values in ascending order.
    pub fn sorted_values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.heap.iter().map(|e| e.value).collect();
        values.sort_by(f64::total_cmp);
        values
    }
}

/// Linear-interpolation quantile of an ascending slice, `q` in `[0, 1]`.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let pos = q.clamp(0.0, 1.0) * last as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
