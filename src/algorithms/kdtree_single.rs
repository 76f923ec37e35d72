use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::config::KdTreeSingleParams;
use crate::core::heap::ResultSet;
use crate::core::Result;
use crate::metricdata::{Dataset, Element};

use super::kdtree::partition;
use super::{check_tree_shape, QueryContext, SearchScratch};

/// Relative tolerance when comparing bounding box spans
const SPAN_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum SingleNode {
    /// Points `indices[start..end]`
    Leaf { start: usize, end: usize },
    Split {
        dim: usize,
        low: f64,
        high: f64,
        left: usize,
        right: usize,
    },
}

/// A single k-d tree with bucket leaves, split at the middle of the widest
/// dimension. Searched exactly with incremental distance bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KdTreeSingle {
    nodes: Vec<SingleNode>,
    indices: Vec<usize>,
    /// Bounding box of the dataset, `(min, max)` per dimension
    root_bbox: Vec<(f64, f64)>,
    leaf_max_size: usize,
}

enum Frame {
    Visit { node: usize, mindist: f64 },
    Enter { node: usize, mindist: f64, dim: usize, bound: f64 },
    Restore { dim: usize, bound: f64 },
}

impl KdTreeSingle {
    pub(crate) fn build<T: Element>(data: Dataset<'_, T>, params: &KdTreeSingleParams) -> Result<(Self, usize)> {
        let n = data.num_points();
        let leaf_max_size = params.leaf_max_size.max(1);

        let mut indices: Vec<usize> = (0..n).collect();
        let root_bbox = bounding_box(&data, &indices);

        let mut nodes: Vec<SingleNode> = Vec::new();
        nodes.try_reserve(2 * (n / leaf_max_size + 1))?;
        nodes.push(SingleNode::Leaf { start: 0, end: n });

        let mut cost = 0;
        let mut stack = vec![(0usize, 0usize, n)];
        while let Some((slot, start, end)) = stack.pop() {
            let count = end - start;
            if count <= leaf_max_size {
                nodes[slot] = SingleNode::Leaf { start, end };
                continue;
            }

            let subset = &mut indices[start..end];
            let bbox = bounding_box(&data, subset);
            let (dim, split) = middle_split(&data, subset, &bbox);
            cost += count;

            let coordinate = |i: &usize| data.get_point(*i)[dim].to_f64();
            let low = subset[..split].iter().map(coordinate).fold(f64::NEG_INFINITY, f64::max);
            let high = subset[split..].iter().map(coordinate).fold(f64::INFINITY, f64::min);

            let left = nodes.len();
            let right = left + 1;
            nodes.push(SingleNode::Leaf { start, end: start });
            nodes.push(SingleNode::Leaf { start, end: start });
            nodes[slot] = SingleNode::Split { dim, low, high, left, right };

            stack.push((right, start + split, end));
            stack.push((left, start, start + split));
        }

        debug!("Built single kd-tree with {} nodes over {} points", nodes.len(), n);

        Ok((
            KdTreeSingle {
                nodes,
                indices,
                root_bbox,
                leaf_max_size,
            },
            cost,
        ))
    }

    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        if self.nodes.is_empty() || self.indices.is_empty() {
            return;
        }

        let metric = ctx.metric;
        let mut dists: Vec<f64> = query
            .iter()
            .zip(&self.root_bbox)
            .map(|(q, &(min, max))| {
                let q = q.to_f64();
                if q < min {
                    metric.accum_dist(q, min)
                } else if q > max {
                    metric.accum_dist(q, max)
                } else {
                    0.0
                }
            })
            .collect();
        let initial: f64 = dists.iter().sum();

        let mut stack = vec![Frame::Visit { node: 0, mindist: initial }];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit { node, mindist } => {
                    if mindist * ctx.eps_factor > result.worst_distance() {
                        continue;
                    }
                    match self.nodes[node] {
                        SingleNode::Leaf { start, end } => {
                            for &point in &self.indices[start..end] {
                                if scratch.mark(point) {
                                    let distance = ctx.point_distance(point, query, scratch);
                                    result.add_point(distance, point);
                                }
                            }
                        }
                        SingleNode::Split { dim, low, high, left, right } => {
                            let value = query[dim].to_f64();
                            let (best, other, cut_dist) = if value - low + value - high < 0.0 {
                                let cut_dist = if value < high { metric.accum_dist(value, high) } else { 0.0 };
                                (left, right, cut_dist)
                            } else {
                                let cut_dist = if value > low { metric.accum_dist(value, low) } else { 0.0 };
                                (right, left, cut_dist)
                            };

                            let previous = dists[dim];
                            let bound = cut_dist.max(previous);
                            stack.push(Frame::Restore { dim, bound: previous });
                            stack.push(Frame::Enter {
                                node: other,
                                mindist: mindist + bound - previous,
                                dim,
                                bound,
                            });
                            stack.push(Frame::Visit { node: best, mindist });
                        }
                    }
                }
                Frame::Enter { node, mindist, dim, bound } => {
                    dists[dim] = bound;
                    stack.push(Frame::Visit { node, mindist });
                }
                Frame::Restore { dim, bound } => {
                    dists[dim] = bound;
                }
            }
        }
    }

    /// Rough number of points inspected by a query: a few leaves per level.
    pub(crate) fn expected_visits(&self, rows: f64) -> f64 {
        (self.leaf_max_size as f64 * rows.log2().max(1.0)).min(rows)
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.nodes.capacity() * std::mem::size_of::<SingleNode>()
            + self.indices.capacity() * std::mem::size_of::<usize>()
            + self.root_bbox.capacity() * std::mem::size_of::<(f64, f64)>()
    }

    pub(crate) fn check_integrity(&self, rows: usize, cols: usize) -> std::result::Result<(), String> {
        let mut seen = vec![false; rows];
        if self.indices.len() != rows || self.indices.iter().any(|&i| i >= rows || std::mem::replace(&mut seen[i], true)) {
            return Err("single kd-tree does not index the given dataset".to_string());
        }
        if self.root_bbox.len() != cols {
            return Err("single kd-tree bounding box has the wrong dimension".to_string());
        }
        if self.nodes.is_empty() {
            return Err("empty single kd-tree".to_string());
        }

        // leaf ranges must tile the index array
        let mut covered = vec![false; rows];
        check_tree_shape(self.nodes.len(), |node, children| match self.nodes[node] {
            SingleNode::Leaf { start, end } => {
                if start > end || end > rows || covered[start..end].iter().any(|&c| c) {
                    return Err(format!("single kd-tree leaf {}..{} is out of bounds or overlaps", start, end));
                }
                covered[start..end].iter_mut().for_each(|c| *c = true);
                Ok(())
            }
            SingleNode::Split { dim, left, right, .. } => {
                if dim >= cols {
                    return Err(format!("single kd-tree splits on dimension {} of {}", dim, cols));
                }
                children.extend([left, right]);
                Ok(())
            }
        })?;

        if covered.iter().any(|&c| !c) {
            return Err("single kd-tree leaves do not cover every point".to_string());
        }
        Ok(())
    }
}

fn bounding_box<T: Element>(data: &Dataset<'_, T>, indices: &[usize]) -> Vec<(f64, f64)> {
    let mut bbox = vec![(f64::INFINITY, f64::NEG_INFINITY); data.dimensions()];
    for &i in indices {
        for (b, v) in bbox.iter_mut().zip(data.get_point(i)) {
            let v = v.to_f64();
            b.0 = b.0.min(v);
            b.1 = b.1.max(v);
        }
    }
    bbox
}

/// Cuts the dimension with the largest spread at the middle of the bounding box,
/// clamped to the range of the points. Returns the dimension and the split position.
fn middle_split<T: Element>(data: &Dataset<'_, T>, indices: &mut [usize], bbox: &[(f64, f64)]) -> (usize, usize) {
    let max_span = bbox.iter().map(|(min, max)| max - min).fold(0.0, f64::max);

    let mut dim = 0;
    let mut max_spread = -1.0;
    for (d, (min, max)) in bbox.iter().enumerate() {
        let span = max - min;
        if span >= (1.0 - SPAN_EPS) * max_span && span > max_spread {
            dim = d;
            max_spread = span;
        }
    }

    let (min, max) = bbox[dim];
    let cut = (min + max) / 2.0;

    let count = indices.len();
    let value = |i: usize| data.get_point(i)[dim].to_f64();
    let lim1 = partition(indices, 0, |i| value(i) < cut);
    let lim2 = partition(indices, lim1, |i| value(i) <= cut);

    let split = if lim1 > count / 2 {
        lim1
    } else if lim2 < count / 2 {
        lim2
    } else {
        count / 2
    };

    (dim, split.clamp(1, count - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::test_utils::{knn, random_points, sorted_neighbors};
    use crate::algorithms::NnIndex;
    use crate::metricdata::Metric;

    #[test]
    fn test_single_tree_is_exact() {
        let buffer = random_points(800, 6, 21);
        let data = Dataset::new(&buffer, 800, 6).unwrap();
        let queries = random_points(25, 6, 22);
        let (tree, _) = KdTreeSingle::build(data, &KdTreeSingleParams::default()).unwrap();
        let index = NnIndex::KdTreeSingle(tree);

        for metric in [Metric::Euclidean, Metric::Manhattan, Metric::Minkowski(3.0)] {
            for query in queries.chunks_exact(6) {
                // the check budget does not apply to the single tree
                let found = knn(&index, data, metric, query, 8, 1);
                assert_eq!(found, sorted_neighbors(&data, query, 8, metric));
            }
        }
    }

    #[test]
    fn test_query_outside_bounding_box() {
        let buffer = random_points(100, 3, 23);
        let data = Dataset::new(&buffer, 100, 3).unwrap();
        let (tree, _) = KdTreeSingle::build(data, &KdTreeSingleParams { leaf_max_size: 4 }).unwrap();
        let index = NnIndex::KdTreeSingle(tree);

        let query = [5.0f32, -3.0, 0.5];
        let found = knn(&index, data, Metric::Euclidean, &query, 3, 1);
        assert_eq!(found, sorted_neighbors(&data, &query, 3, Metric::Euclidean));
    }

    #[test]
    fn test_leaves_respect_max_size() {
        let buffer = random_points(500, 4, 24);
        let data = Dataset::new(&buffer, 500, 4).unwrap();
        let (tree, _) = KdTreeSingle::build(data, &KdTreeSingleParams { leaf_max_size: 7 }).unwrap();

        for node in &tree.nodes {
            if let SingleNode::Leaf { start, end } = node {
                assert!(end - start <= 7);
            }
        }
        let mut indices = tree.indices.clone();
        indices.sort_unstable();
        assert_eq!(indices, (0..500).collect::<Vec<_>>());
        assert!(tree.check_integrity(500, 4).is_ok());
        assert!(tree.check_integrity(499, 4).is_err());

        let mut cyclic = tree.clone();
        if let SingleNode::Split { ref mut left, .. } = cyclic.nodes[0] {
            *left = 0;
        }
        assert!(cyclic.check_integrity(500, 4).is_err());

        let mut overlapping = tree;
        let leaf = overlapping
            .nodes
            .iter()
            .rposition(|n| matches!(n, SingleNode::Leaf { start, end } if end > start))
            .unwrap();
        overlapping.nodes[leaf] = SingleNode::Leaf { start: 0, end: 1 };
        assert!(overlapping.check_integrity(500, 4).is_err());
    }

    #[test]
    fn test_identical_points_terminate() {
        let buffer = vec![2u8; 50 * 2];
        let data = Dataset::new(&buffer, 50, 2).unwrap();
        let (tree, _) = KdTreeSingle::build(data, &KdTreeSingleParams { leaf_max_size: 3 }).unwrap();
        let index = NnIndex::KdTreeSingle(tree);

        let found = knn(&index, data, Metric::Euclidean, &[2, 2], 2, 1);
        assert_eq!(found, vec![(0.0, 0), (0.0, 1)]);
    }
}
