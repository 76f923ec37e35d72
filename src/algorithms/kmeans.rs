use log::{debug, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::config::{CentersInit, KMeansParams};
use crate::core::heap::{BranchHeap, ResultSet};
use crate::core::Result;
use crate::metricdata::{Dataset, Element, Metric};

use super::center_chooser::choose_centers;
use super::{check_tree_shape, QueryContext, SearchScratch};

/// Iteration cap when clustering is asked to run until convergence
const MAX_CONVERGENCE_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KMeansNode {
    /// Mean of the points under this node
    pivot: Vec<f64>,
    /// Largest distance from the pivot to one of its points
    radius: f64,
    /// Mean distance from the pivot to its points
    variance: f64,
    size: usize,
    children: Vec<usize>,
    /// Points stored in a leaf, empty for inner nodes
    points: Vec<usize>,
}

/// Hierarchical k-means tree: every inner node splits its points in `branching`
/// clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KMeansTree {
    nodes: Vec<KMeansNode>,
    branching: usize,
    cluster_boundary_index: f64,
}

/// Result of clustering one node's points.
struct Clustering {
    centers: Vec<Vec<f64>>,
    assignment: Vec<usize>,
    cost: usize,
}

impl KMeansTree {
    pub(crate) fn build<T: Element>(
        data: Dataset<'_, T>,
        metric: Metric,
        params: &KMeansParams,
        rng: &mut StdRng,
    ) -> Result<(Self, usize)> {
        let n = data.num_points();
        let mut nodes: Vec<KMeansNode> = Vec::new();
        nodes.try_reserve(1 + 2 * n / params.branching.max(2))?;

        let all: Vec<usize> = (0..n).collect();
        nodes.push(node_statistics(&data, metric, &all, mean(&data, &all)));

        let mut cost = n;
        let mut stack = vec![(0usize, all)];
        while let Some((node_id, indices)) = stack.pop() {
            match cluster(&data, metric, params, &indices, rng) {
                None => nodes[node_id].points = indices,
                Some(clustering) => {
                    cost += clustering.cost;

                    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); params.branching];
                    for (&point, &c) in indices.iter().zip(&clustering.assignment) {
                        groups[c].push(point);
                    }

                    let mut children = Vec::with_capacity(params.branching);
                    for (group, center) in groups.into_iter().zip(clustering.centers) {
                        let child_id = nodes.len();
                        nodes.try_reserve(1)?;
                        nodes.push(node_statistics(&data, metric, &group, center));
                        children.push(child_id);
                        stack.push((child_id, group));
                    }
                    nodes[node_id].children = children;
                }
            }
        }

        debug!(
            "Built k-means tree with {} nodes over {} points (branching {})",
            nodes.len(),
            n,
            params.branching
        );

        Ok((
            KMeansTree {
                nodes,
                branching: params.branching,
                cluster_boundary_index: params.cluster_boundary_index,
            },
            cost,
        ))
    }

    pub(crate) fn set_cluster_boundary_index(&mut self, cb_index: f64) {
        self.cluster_boundary_index = cb_index;
    }

    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        if self.nodes.is_empty() {
            return;
        }

        let mut heap = BranchHeap::new();
        let mut checks = 0;

        self.find_nn(0, ctx, query, result, scratch, &mut heap, &mut checks);
        while let Some((_, node)) = heap.pop() {
            if checks >= ctx.checks && result.is_full() {
                break;
            }
            self.find_nn(node, ctx, query, result, scratch, &mut heap, &mut checks);
        }
    }

    /// Descends from `node` to the closest leaf, queueing the sibling clusters on the way.
    #[allow(clippy::too_many_arguments)]
    fn find_nn<T: Element, R: ResultSet>(
        &self,
        mut node: usize,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
        heap: &mut BranchHeap<usize>,
        checks: &mut usize,
    ) {
        loop {
            let current = &self.nodes[node];

            if ctx.metric.supports_ball_pruning() {
                // skip the whole ball if it lies farther than the worst result
                let bsq = ctx.vector_distance(&current.pivot, query, scratch);
                let rsq = current.radius;
                let wsq = result.worst_distance();
                let val = bsq - rsq - wsq;
                if val > 0.0 && val * val - 4.0 * rsq * wsq > 0.0 {
                    return;
                }
            }

            if current.children.is_empty() {
                if *checks >= ctx.checks && result.is_full() {
                    return;
                }
                *checks += current.size;
                for &point in &current.points {
                    if scratch.mark(point) {
                        let distance = ctx.point_distance(point, query, scratch);
                        result.add_point(distance, point);
                    }
                }
                return;
            }

            let distances: Vec<f64> = current
                .children
                .iter()
                .map(|&c| ctx.vector_distance(&self.nodes[c].pivot, query, scratch))
                .collect();
            let best = distances
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(i, _)| i);

            for (i, &child) in current.children.iter().enumerate() {
                if i != best {
                    let key = distances[i] - self.cluster_boundary_index * self.nodes[child].variance;
                    heap.push(key, child);
                }
            }
            node = current.children[best];
        }
    }

    /// Centers of the clusters obtained by splitting the tree, always expanding the node
    /// that reduces the overall variance the most, until `count` clusters are reached.
    pub(crate) fn cluster_centers(&self, count: usize) -> Array2<f64> {
        let dims = self.nodes.first().map_or(0, |n| n.pivot.len());
        if self.nodes.is_empty() || count == 0 {
            return Array2::zeros((0, dims));
        }

        let weighted = |id: usize| self.nodes[id].variance * self.nodes[id].size as f64;
        let mut clusters = vec![0usize];
        let mut mean_variance = weighted(0);

        while clusters.len() < count {
            let mut split: Option<(usize, f64)> = None;
            for (pos, &id) in clusters.iter().enumerate() {
                let node = &self.nodes[id];
                if node.children.is_empty() {
                    continue;
                }
                let variance = mean_variance - weighted(id)
                    + node.children.iter().map(|&c| weighted(c)).sum::<f64>();
                if split.map_or(true, |(_, best)| variance < best) {
                    split = Some((pos, variance));
                }
            }

            let Some((pos, variance)) = split else {
                break;
            };
            if clusters.len() + self.branching - 1 > count {
                break;
            }

            mean_variance = variance;
            let id = clusters[pos];
            let children = &self.nodes[id].children;
            clusters[pos] = children[0];
            clusters.extend_from_slice(&children[1..]);
        }

        let mut centers = Array2::zeros((clusters.len(), dims));
        for (mut row, &id) in centers.rows_mut().into_iter().zip(&clusters) {
            for (c, &v) in row.iter_mut().zip(&self.nodes[id].pivot) {
                *c = v;
            }
        }
        centers
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| {
                std::mem::size_of::<KMeansNode>()
                    + n.pivot.capacity() * std::mem::size_of::<f64>()
                    + (n.children.capacity() + n.points.capacity()) * std::mem::size_of::<usize>()
            })
            .sum()
    }

    pub(crate) fn check_integrity(&self, rows: usize, cols: usize) -> std::result::Result<(), String> {
        match self.nodes.first() {
            None => return Err("empty k-means tree".to_string()),
            Some(root) if root.size != rows => return Err("k-means tree does not index the given dataset".to_string()),
            Some(_) => {}
        }

        let mut seen = vec![false; rows];
        check_tree_shape(self.nodes.len(), |id, children| {
            let node = &self.nodes[id];
            if node.pivot.len() != cols {
                return Err("k-means pivot has the wrong dimension".to_string());
            }
            if node.children.is_empty() {
                if node.points.len() != node.size {
                    return Err(format!("k-means leaf {} holds {} points, expected {}", id, node.points.len(), node.size));
                }
                for &point in &node.points {
                    if point >= rows || std::mem::replace(&mut seen[point], true) {
                        return Err(format!("k-means leaf references point {} of {} twice or out of bounds", point, rows));
                    }
                }
                return Ok(());
            }

            if !node.points.is_empty() {
                return Err(format!("k-means inner node {} also stores points", id));
            }
            let mut total = 0usize;
            for &child in &node.children {
                let size = self.nodes.get(child).map_or(0, |c| c.size);
                total = total.saturating_add(size);
            }
            if total != node.size {
                return Err(format!("k-means children of node {} hold {} points, expected {}", id, total, node.size));
            }
            children.extend_from_slice(&node.children);
            Ok(())
        })?;

        if seen.iter().any(|&s| !s) {
            return Err("k-means tree does not index every point".to_string());
        }
        Ok(())
    }
}

fn mean<T: Element>(data: &Dataset<'_, T>, indices: &[usize]) -> Vec<f64> {
    let mut center = vec![0.0; data.dimensions()];
    for &i in indices {
        for (c, v) in center.iter_mut().zip(data.get_point(i)) {
            *c += v.to_f64();
        }
    }
    if !indices.is_empty() {
        let div = indices.len() as f64;
        center.iter_mut().for_each(|c| *c /= div);
    }
    center
}

fn node_statistics<T: Element>(data: &Dataset<'_, T>, metric: Metric, indices: &[usize], pivot: Vec<f64>) -> KMeansNode {
    let mut radius: f64 = 0.0;
    let mut total = 0.0;
    for &i in indices {
        let d = metric.distance(data.get_point(i), &pivot);
        radius = radius.max(d);
        total += d;
    }
    let size = indices.len();

    KMeansNode {
        pivot,
        radius,
        variance: if size > 0 { total / size as f64 } else { 0.0 },
        size,
        children: Vec::new(),
        points: Vec::new(),
    }
}

/// Index of the closest center, the lowest one on ties.
fn closest_center<T: Element>(point: &[T], centers: &[Vec<f64>], metric: Metric) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (c, center) in centers.iter().enumerate() {
        let d = metric.distance(point, center);
        if d < best_distance {
            best = c;
            best_distance = d;
        }
    }
    best
}

fn assign<T: Element>(data: &Dataset<'_, T>, indices: &[usize], centers: &[Vec<f64>], metric: Metric) -> Vec<usize> {
    indices
        .par_iter()
        .map(|&i| closest_center(data.get_point(i), centers, metric))
        .collect()
}

/// Runs k-means on `indices`, or returns `None` if the node should be a leaf.
fn cluster<T: Element>(
    data: &Dataset<'_, T>,
    metric: Metric,
    params: &KMeansParams,
    indices: &[usize],
    rng: &mut StdRng,
) -> Option<Clustering> {
    let branching = params.branching;
    if indices.len() < branching {
        return None;
    }

    let initial = choose_centers(params.centers_init, branching, data, indices, metric, rng);
    if initial.len() < branching {
        return None;
    }

    let mut centers: Vec<Vec<f64>> = initial
        .iter()
        .map(|&c| data.get_point(c).iter().map(|v| v.to_f64()).collect())
        .collect();
    let mut assignment = assign(data, indices, &centers, metric);
    let mut cost = indices.len() * branching;
    if params.centers_init != CentersInit::Random {
        cost += indices.len() * branching;
    }

    let max_iterations = if params.iterations < 0 {
        MAX_CONVERGENCE_ITERATIONS
    } else {
        params.iterations as usize
    };

    let mut converged = false;
    let mut iteration = 0;
    while !converged && iteration < max_iterations {
        iteration += 1;

        // move every center to the mean of its points
        let mut sums = vec![vec![0.0; data.dimensions()]; branching];
        let mut counts = vec![0usize; branching];
        for (&point, &c) in indices.iter().zip(&assignment) {
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(data.get_point(point)) {
                *s += v.to_f64();
            }
        }
        for ((center, sum), &count) in centers.iter_mut().zip(sums).zip(&counts) {
            if count > 0 {
                *center = sum.into_iter().map(|s| s / count as f64).collect();
            }
        }

        let new_assignment = assign(data, indices, &centers, metric);
        cost += indices.len() * branching;
        converged = new_assignment == assignment;
        assignment = new_assignment;

        if fill_empty_clusters(&mut assignment, branching) {
            converged = false;
        }
    }

    if !converged && params.iterations < 0 {
        warn!(
            "k-means did not converge after {} iterations on a node of {} points",
            MAX_CONVERGENCE_ITERATIONS,
            indices.len()
        );
    }

    // a cluster can still be empty when no iteration ran
    fill_empty_clusters(&mut assignment, branching);

    let centers = (0..branching)
        .map(|c| {
            let members: Vec<usize> = indices
                .iter()
                .zip(&assignment)
                .filter(|(_, &a)| a == c)
                .map(|(&p, _)| p)
                .collect();
            mean(data, &members)
        })
        .collect();

    Some(Clustering {
        centers,
        assignment,
        cost,
    })
}

/// Gives every empty cluster one point taken from the next cluster holding more than
/// one. Returns whether anything moved.
fn fill_empty_clusters(assignment: &mut [usize], branching: usize) -> bool {
    let mut counts = vec![0usize; branching];
    for &c in assignment.iter() {
        counts[c] += 1;
    }

    let mut moved = false;
    for empty in 0..branching {
        if counts[empty] != 0 {
            continue;
        }
        let mut donor = (empty + 1) % branching;
        while counts[donor] <= 1 {
            donor = (donor + 1) % branching;
        }
        if let Some(slot) = assignment.iter().position(|&c| c == donor) {
            assignment[slot] = empty;
            counts[donor] -= 1;
            counts[empty] += 1;
            moved = true;
        }
    }
    moved
}
