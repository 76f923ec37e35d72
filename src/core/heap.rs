use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

/// A candidate neighbor. Ordered by distance, then by dataset index so that
/// equidistant points always come out in ascending index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Neighbor {
    pub(crate) distance: OrderedFloat<f64>,
    pub(crate) point_index: usize,
}

impl Neighbor {
    pub(crate) fn new(distance: f64, point_index: usize) -> Self {
        Neighbor {
            distance: OrderedFloat(distance),
            point_index,
        }
    }
}

/// Sink for the points visited by a search.
pub(crate) trait ResultSet {
    fn add_point(&mut self, distance: f64, point_index: usize);

    /// Distance a point must beat to change the result.
    fn worst_distance(&self) -> f64;

    fn is_full(&self) -> bool;
}

/// Bounded max-heap keeping the `k` closest points seen so far.
pub(crate) struct TopKClosestHeap {
    heap: BinaryHeap<Neighbor>,
    length: usize,
}

impl TopKClosestHeap {
    pub(crate) fn new(top_n: usize) -> Self {
        TopKClosestHeap {
            heap: BinaryHeap::with_capacity(top_n.min(1024)),
            length: top_n,
        }
    }

    pub(crate) fn add(&mut self, element: Neighbor) -> bool {
        if self.length == 0 {
            return false;
        }
        if self.heap.len() < self.length {
            self.heap.push(element);
            return true;
        }
        match self.heap.peek() {
            Some(max) if element < *max => {
                // Remove the largest element if the new element is smaller
                self.heap.pop();
                self.heap.push(element);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get_top(&self) -> Option<(usize, f64)> {
        self.heap.peek().map(|e| (e.point_index, e.distance.0))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

impl ResultSet for TopKClosestHeap {
    fn add_point(&mut self, distance: f64, point_index: usize) {
        self.add(Neighbor::new(distance, point_index));
    }

    fn worst_distance(&self) -> f64 {
        if self.is_full() {
            self.get_top().map_or(f64::INFINITY, |(_, d)| d)
        } else {
            f64::INFINITY
        }
    }

    fn is_full(&self) -> bool {
        self.heap.len() >= self.length
    }
}

/// Collects the points within `radius`, keeping only the `max_count` closest.
///
/// It always reports itself as full, so searches stop after their check budget.
pub(crate) struct RadiusResultSet {
    radius: f64,
    closest: TopKClosestHeap,
}

impl RadiusResultSet {
    pub(crate) fn new(radius: f64, max_count: usize) -> Self {
        RadiusResultSet {
            radius,
            closest: TopKClosestHeap::new(max_count),
        }
    }

    pub(crate) fn into_sorted_vec(self) -> Vec<Neighbor> {
        self.closest.into_sorted_vec()
    }
}

impl ResultSet for RadiusResultSet {
    fn add_point(&mut self, distance: f64, point_index: usize) {
        if distance <= self.radius {
            self.closest.add(Neighbor::new(distance, point_index));
        }
    }

    fn worst_distance(&self) -> f64 {
        self.radius.min(self.closest.worst_distance())
    }

    fn is_full(&self) -> bool {
        true
    }
}

struct Branch<B> {
    key: OrderedFloat<f64>,
    sequence: u64,
    node: B,
}

impl<B> PartialEq for Branch<B> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.sequence == other.sequence
    }
}

impl<B> Eq for Branch<B> {}

impl<B> PartialOrd for Branch<B> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<B> Ord for Branch<B> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Min-heap of unexplored tree branches keyed by a lower bound on their distance.
///
/// Equal keys pop in insertion order, which keeps traversals deterministic.
pub(crate) struct BranchHeap<B> {
    heap: BinaryHeap<Reverse<Branch<B>>>,
    sequence: u64,
}

impl<B> BranchHeap<B> {
    pub(crate) fn new() -> Self {
        BranchHeap {
            heap: BinaryHeap::new(),
            sequence: 0,
        }
    }

    pub(crate) fn push(&mut self, key: f64, node: B) {
        self.heap.push(Reverse(Branch {
            key: OrderedFloat(key),
            sequence: self.sequence,
            node,
        }));
        self.sequence += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<(f64, B)> {
        self.heap.pop().map(|Reverse(b)| (b.key.0, b.node))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
