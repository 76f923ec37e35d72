use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::config::KdTreeParams;
use crate::core::heap::{BranchHeap, ResultSet};
use crate::core::Result;
use crate::metricdata::{Dataset, Element};

use super::{check_tree_shape, QueryContext, SearchScratch};

/// Points used to estimate the mean and variance at each node
const SAMPLE_MEAN: usize = 100;
/// Number of highest-variance dimensions the split dimension is drawn from
const RAND_DIM: usize = 5;

const NO_GAP: usize = usize::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum KdNode {
    Leaf {
        point: usize,
    },
    Split {
        dim: usize,
        cut: f64,
        /// Largest coordinate along `dim` in the left subtree
        low: f64,
        /// Smallest coordinate along `dim` in the right subtree
        high: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdTree {
    nodes: Vec<KdNode>,
}

/// Forest of randomized k-d trees searched together, best bin first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KdTreeForest {
    trees: Vec<KdTree>,
}

/// Lower bound contributed by one dimension on the path to a branch. Gaps form
/// parent-linked lists so that each queued branch knows the bound of every dimension
/// it was cut on.
struct Gap {
    dim: usize,
    value: f64,
    parent: usize,
}

struct ForestSearch<'s, 'a, T: Element, R: ResultSet> {
    ctx: &'s QueryContext<'a, T>,
    query: &'s [T],
    result: &'s mut R,
    scratch: &'s mut SearchScratch,
    heap: BranchHeap<(usize, usize, usize)>,
    gaps: Vec<Gap>,
    checks: usize,
}

impl KdTreeForest {
    pub(crate) fn build<T: Element>(data: Dataset<'_, T>, params: &KdTreeParams, rng: &mut StdRng) -> Result<(Self, usize)> {
        let seeds: Vec<u64> = (0..params.trees).map(|_| rng.gen()).collect();

        let built = seeds
            .into_par_iter()
            .map(|seed| build_tree(&data, &mut StdRng::seed_from_u64(seed)))
            .collect::<Result<Vec<_>>>()?;

        let cost = built.iter().map(|(_, cost)| cost).sum();
        let trees: Vec<KdTree> = built.into_iter().map(|(tree, _)| tree).collect();

        debug!(
            "Built kd-tree forest with {} trees over {} points",
            trees.len(),
            data.num_points()
        );

        Ok((KdTreeForest { trees }, cost))
    }

    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        let mut search = ForestSearch {
            ctx,
            query,
            result,
            scratch,
            heap: BranchHeap::new(),
            gaps: Vec::new(),
            checks: 0,
        };

        for (tree_idx, tree) in self.trees.iter().enumerate() {
            if !tree.nodes.is_empty() {
                search.search_level(tree, tree_idx, 0, 0.0, NO_GAP);
            }
        }

        while let Some((mindist, (tree_idx, node, gap))) = search.heap.pop() {
            if search.checks >= ctx.checks && search.result.is_full() {
                break;
            }
            search.search_level(&self.trees[tree_idx], tree_idx, node, mindist, gap);
        }
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.trees
            .iter()
            .map(|t| t.nodes.capacity() * std::mem::size_of::<KdNode>())
            .sum()
    }

    pub(crate) fn check_integrity(&self, rows: usize, cols: usize) -> std::result::Result<(), String> {
        self.trees.iter().try_for_each(|tree| tree.check_integrity(rows, cols))
    }
}

impl KdTree {
    /// Every point must sit in exactly one leaf.
    fn check_integrity(&self, rows: usize, cols: usize) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return if rows == 0 { Ok(()) } else { Err("empty kd-tree".to_string()) };
        }

        let mut seen = vec![false; rows];
        check_tree_shape(self.nodes.len(), |node, children| match self.nodes[node] {
            KdNode::Leaf { point } => {
                if point >= rows || std::mem::replace(&mut seen[point], true) {
                    return Err(format!("kd-tree leaf references point {} of {} twice or out of bounds", point, rows));
                }
                Ok(())
            }
            KdNode::Split { dim, left, right, .. } => {
                if dim >= cols {
                    return Err(format!("kd-tree splits on dimension {} of {}", dim, cols));
                }
                children.extend([left, right]);
                Ok(())
            }
        })?;

        if seen.iter().any(|&s| !s) {
            return Err("kd-tree does not index every point".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
impl KdTreeForest {
    /// A forest whose only node splits into itself.
    pub(crate) fn looping() -> Self {
        let split = KdNode::Split {
            dim: 0,
            cut: 0.0,
            low: 0.0,
            high: 0.0,
            left: 0,
            right: 0,
        };
        KdTreeForest {
            trees: vec![KdTree { nodes: vec![split] }],
        }
    }
}

impl<'s, 'a, T: Element, R: ResultSet> ForestSearch<'s, 'a, T, R> {
    fn gap_for(&self, mut gap: usize, dim: usize) -> f64 {
        while gap != NO_GAP {
            let g = &self.gaps[gap];
            if g.dim == dim {
                return g.value;
            }
            gap = g.parent;
        }
        0.0
    }

    /// Descends from `node` to a leaf, queueing every branch not taken.
    fn search_level(&mut self, tree: &KdTree, tree_idx: usize, mut node: usize, mindist: f64, gap: usize) {
        if mindist * self.ctx.eps_factor > self.result.worst_distance() {
            return;
        }

        loop {
            match tree.nodes[node] {
                KdNode::Leaf { point } => {
                    if self.checks >= self.ctx.checks && self.result.is_full() {
                        return;
                    }
                    if self.scratch.mark(point) {
                        self.checks += 1;
                        let distance = self.ctx.point_distance(point, self.query, self.scratch);
                        self.result.add_point(distance, point);
                    }
                    return;
                }
                KdNode::Split { dim, cut, low, high, left, right } => {
                    let value = self.query[dim].to_f64();
                    let metric = self.ctx.metric;

                    let (best, other, bound) = if value < cut {
                        let bound = if value < high { metric.accum_dist(value, high) } else { 0.0 };
                        (left, right, bound)
                    } else {
                        let bound = if value > low { metric.accum_dist(value, low) } else { 0.0 };
                        (right, left, bound)
                    };

                    let previous = self.gap_for(gap, dim);
                    if bound > previous {
                        let other_dist = mindist - previous + bound;
                        if other_dist * self.ctx.eps_factor <= self.result.worst_distance() {
                            self.gaps.push(Gap {
                                dim,
                                value: bound,
                                parent: gap,
                            });
                            self.heap.push(other_dist, (tree_idx, other, self.gaps.len() - 1));
                        }
                    } else {
                        self.heap.push(mindist, (tree_idx, other, gap));
                    }

                    node = best;
                }
            }
        }
    }
}

fn build_tree<T: Element>(data: &Dataset<'_, T>, rng: &mut StdRng) -> Result<(KdTree, usize)> {
    let n = data.num_points();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);

    let mut nodes: Vec<KdNode> = Vec::new();
    if n == 0 {
        return Ok((KdTree { nodes }, 0));
    }
    nodes.try_reserve_exact(2 * n)?;

    let mut cost = 0;
    nodes.push(KdNode::Leaf { point: 0 });
    let mut stack = vec![(0usize, 0usize, n)];

    while let Some((slot, start, end)) = stack.pop() {
        let count = end - start;
        if count == 1 {
            nodes[slot] = KdNode::Leaf { point: indices[start] };
            continue;
        }

        let subset = &mut indices[start..end];
        let (dim, cut) = mean_split(data, subset, rng);
        let split = plane_split(data, subset, dim, cut);
        cost += 2 * count.min(SAMPLE_MEAN + 1) + count / data.dimensions().max(1);

        let coordinate = |i: &usize| data.get_point(*i)[dim].to_f64();
        let low = subset[..split].iter().map(coordinate).fold(f64::NEG_INFINITY, f64::max);
        let high = subset[split..].iter().map(coordinate).fold(f64::INFINITY, f64::min);

        let left = nodes.len();
        let right = left + 1;
        nodes.push(KdNode::Leaf { point: 0 });
        nodes.push(KdNode::Leaf { point: 0 });
        nodes[slot] = KdNode::Split { dim, cut, low, high, left, right };

        stack.push((right, start + split, end));
        stack.push((left, start, start + split));
    }

    Ok((KdTree { nodes }, cost))
}

/// Picks the split dimension among the highest-variance ones and uses the mean as cut value.
fn mean_split<T: Element>(data: &Dataset<'_, T>, indices: &[usize], rng: &mut StdRng) -> (usize, f64) {
    let dims = data.dimensions();
    let sample = &indices[..indices.len().min(SAMPLE_MEAN + 1)];

    let mut mean = vec![0.0; dims];
    for &i in sample {
        for (m, v) in mean.iter_mut().zip(data.get_point(i)) {
            *m += v.to_f64();
        }
    }
    let div = sample.len() as f64;
    mean.iter_mut().for_each(|m| *m /= div);

    let mut var = vec![0.0; dims];
    for &i in sample {
        for ((s, m), v) in var.iter_mut().zip(&mean).zip(data.get_point(i)) {
            let d = v.to_f64() - m;
            *s += d * d;
        }
    }

    let dim = select_division(&var, rng);
    (dim, mean[dim])
}

fn select_division(var: &[f64], rng: &mut StdRng) -> usize {
    let mut order: Vec<usize> = (0..var.len()).collect();
    order.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
    let num = order.len().min(RAND_DIM);
    order[rng.gen_range(0..num)]
}

/// Reorders `indices` so that points below `cut` come first and returns the split position.
///
/// Points equal to the cut are spread over both halves to keep the tree balanced.
fn plane_split<T: Element>(data: &Dataset<'_, T>, indices: &mut [usize], dim: usize, cut: f64) -> usize {
    let count = indices.len();
    let value = |i: usize| data.get_point(i)[dim].to_f64();

    let lim1 = partition(indices, 0, |i| value(i) < cut);
    let lim2 = partition(indices, lim1, |i| value(i) <= cut);

    if lim1 == count || lim2 == 0 {
        return count / 2;
    }
    if lim1 > count / 2 {
        lim1
    } else if lim2 < count / 2 {
        lim2
    } else {
        count / 2
    }
}

/// Moves the indices in `indices[from..]` satisfying `pred` to the front of that range.
pub(crate) fn partition(indices: &mut [usize], from: usize, pred: impl Fn(usize) -> bool) -> usize {
    let mut next = from;
    for i in from..indices.len() {
        if pred(indices[i]) {
            indices.swap(next, i);
            next += 1;
        }
    }
    next
}
