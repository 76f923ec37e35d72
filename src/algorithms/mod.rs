//! Concrete index structures and the sum type the facade dispatches on.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::core::config::{Algorithm, Config, SearchParams};
use crate::core::heap::{Neighbor, ResultSet, TopKClosestHeap};
use crate::core::{IndexError, Result};
use crate::metricdata::{Dataset, Element, ElementType, Metric};

pub(crate) mod autotuned;
pub(crate) mod center_chooser;
pub(crate) mod composite;
pub(crate) mod kdtree;
pub(crate) mod kdtree_single;
pub(crate) mod kmeans;
pub(crate) mod linear;
pub(crate) mod lsh;

use composite::CompositeIndex;
use kdtree::KdTreeForest;
use kdtree_single::KdTreeSingle;
use kmeans::KMeansTree;
use linear::LinearIndex;
use lsh::LshIndex;

/// Everything a structure needs to answer one query.
#[derive(Clone, Copy)]
pub(crate) struct QueryContext<'a, T: Element> {
    pub(crate) data: Dataset<'a, T>,
    pub(crate) metric: Metric,
    pub(crate) checks: usize,
    pub(crate) eps_factor: f64,
}

impl<'a, T: Element> QueryContext<'a, T> {
    pub(crate) fn new(data: Dataset<'a, T>, metric: Metric, params: &SearchParams) -> Self {
        QueryContext {
            data,
            metric,
            checks: params.checks,
            eps_factor: 1.0 + params.eps,
        }
    }

    /// Distance from dataset point `index` to the query.
    pub(crate) fn point_distance(&self, index: usize, query: &[T], scratch: &mut SearchScratch) -> f64 {
        scratch.distance_computations += 1;
        self.metric.distance(self.data.get_point(index), query)
    }

    /// Distance from an arbitrary vector (e.g. a cluster center) to the query.
    pub(crate) fn vector_distance(&self, vector: &[f64], query: &[T], scratch: &mut SearchScratch) -> f64 {
        scratch.distance_computations += 1;
        self.metric.distance(vector, query)
    }
}

/// Per-thread state reused across queries.
///
/// Points are marked with the current query's stamp instead of clearing a bitmap,
/// so a point reached through several trees is only scored once per query.
pub(crate) struct SearchScratch {
    stamps: Vec<u32>,
    epoch: u32,
    pub(crate) distance_computations: usize,
}

impl SearchScratch {
    pub(crate) fn new(num_points: usize) -> Self {
        SearchScratch {
            stamps: vec![0; num_points],
            epoch: 0,
            distance_computations: 0,
        }
    }

    pub(crate) fn begin_query(&mut self) {
        if self.epoch == u32::MAX {
            self.stamps.iter_mut().for_each(|s| *s = 0);
            self.epoch = 0;
        }
        self.epoch += 1;
    }

    /// Marks the point as checked, returns false if it already was during this query.
    pub(crate) fn mark(&mut self, index: usize) -> bool {
        if self.stamps[index] == self.epoch {
            return false;
        }
        self.stamps[index] = self.epoch;
        true
    }
}

/// Walks a node arena from the root at slot 0. `visit` validates one node and reports its
/// children. Every node must be reached exactly once and be stored after its parent, so a
/// file describing a cycle or a shared subtree is rejected.
pub(crate) fn check_tree_shape(
    count: usize,
    mut visit: impl FnMut(usize, &mut Vec<usize>) -> std::result::Result<(), String>,
) -> std::result::Result<(), String> {
    if count == 0 {
        return Ok(());
    }
    let mut reached = vec![false; count];
    reached[0] = true;
    let mut stack = vec![0usize];
    let mut children = Vec::new();

    while let Some(node) = stack.pop() {
        children.clear();
        visit(node, &mut children)?;
        for &child in &children {
            if child <= node || child >= count || reached[child] {
                return Err(format!("node {} has an invalid child {}", node, child));
            }
            reached[child] = true;
            stack.push(child);
        }
    }

    match reached.iter().position(|&r| !r) {
        Some(node) => Err(format!("node {} is not reachable from the root", node)),
        None => Ok(()),
    }
}

pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// A built structure together with a rough count of the vector operations its build took.
pub(crate) struct BuildOutput {
    pub(crate) structure: NnIndex,
    pub(crate) cost: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum NnIndex {
    Linear(LinearIndex),
    KdTree(KdTreeForest),
    KdTreeSingle(KdTreeSingle),
    KMeans(KMeansTree),
    Composite(CompositeIndex),
    Lsh(LshIndex),
}

impl NnIndex {
    /// Builds the structure named by `config.algorithm`.
    ///
    /// Autotuned and saved indexes are resolved by the facade before reaching here.
    pub(crate) fn build<T: Element>(config: &Config, data: Dataset<'_, T>, rng: &mut StdRng) -> Result<BuildOutput> {
        let (structure, cost) = match config.algorithm {
            Algorithm::Linear => (NnIndex::Linear(LinearIndex), 0),
            Algorithm::KdTree => {
                let (forest, cost) = KdTreeForest::build(data, &config.kdtree, rng)?;
                (NnIndex::KdTree(forest), cost)
            }
            Algorithm::KdTreeSingle => {
                let (tree, cost) = KdTreeSingle::build(data, &config.kdtree_single)?;
                (NnIndex::KdTreeSingle(tree), cost)
            }
            Algorithm::KMeans => {
                let (tree, cost) = KMeansTree::build(data, config.metric, &config.kmeans, rng)?;
                (NnIndex::KMeans(tree), cost)
            }
            Algorithm::Composite => {
                let (composite, cost) = CompositeIndex::build(data, config, rng)?;
                (NnIndex::Composite(composite), cost)
            }
            Algorithm::Lsh => {
                let (lsh, cost) = LshIndex::build(data, &config.lsh, rng)?;
                (NnIndex::Lsh(lsh), cost)
            }
            Algorithm::Autotuned | Algorithm::Saved => {
                return Err(IndexError::ConfigError(format!(
                    "{:?} is not a concrete index structure",
                    config.algorithm
                )))
            }
        };

        Ok(BuildOutput { structure, cost })
    }

    pub(crate) fn algorithm(&self) -> Algorithm {
        match self {
            NnIndex::Linear(_) => Algorithm::Linear,
            NnIndex::KdTree(_) => Algorithm::KdTree,
            NnIndex::KdTreeSingle(_) => Algorithm::KdTreeSingle,
            NnIndex::KMeans(_) => Algorithm::KMeans,
            NnIndex::Composite(_) => Algorithm::Composite,
            NnIndex::Lsh(_) => Algorithm::Lsh,
        }
    }

    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        match self {
            NnIndex::Linear(index) => index.find_neighbors(ctx, query, result, scratch),
            NnIndex::KdTree(index) => index.find_neighbors(ctx, query, result, scratch),
            NnIndex::KdTreeSingle(index) => index.find_neighbors(ctx, query, result, scratch),
            NnIndex::KMeans(index) => index.find_neighbors(ctx, query, result, scratch),
            NnIndex::Composite(index) => index.find_neighbors(ctx, query, result, scratch),
            NnIndex::Lsh(index) => index.find_neighbors(ctx, query, result, scratch),
        }
    }

    /// Runs a k-nearest-neighbors query, returning the neighbors sorted by distance.
    pub(crate) fn search_knn<T: Element>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        k: usize,
        scratch: &mut SearchScratch,
    ) -> Vec<Neighbor> {
        scratch.begin_query();
        let mut result = TopKClosestHeap::new(k);
        self.find_neighbors(ctx, query, &mut result, scratch);
        result.into_sorted_vec()
    }

    /// Bytes used by the structure itself, not counting the dataset.
    pub(crate) fn used_memory(&self) -> usize {
        match self {
            NnIndex::Linear(_) => 0,
            NnIndex::KdTree(index) => index.used_memory(),
            NnIndex::KdTreeSingle(index) => index.used_memory(),
            NnIndex::KMeans(index) => index.used_memory(),
            NnIndex::Composite(index) => index.used_memory(),
            NnIndex::Lsh(index) => index.used_memory(),
        }
    }

    /// Ratio between the points a linear scan visits and the points this structure is
    /// expected to visit with the given check budget.
    pub(crate) fn estimated_speedup(&self, rows: usize, checks: usize) -> f64 {
        let rows = rows.max(1) as f64;
        let visited = match self {
            NnIndex::Linear(_) => rows,
            NnIndex::KdTree(_) | NnIndex::KMeans(_) => (checks as f64).min(rows),
            NnIndex::Composite(_) => (2.0 * checks as f64).min(rows),
            NnIndex::KdTreeSingle(index) => index.expected_visits(rows),
            NnIndex::Lsh(index) => index.expected_visits(rows),
        };
        rows / visited.max(1.0)
    }

    /// Verifies that a deserialized structure is well formed and only references points of
    /// a dataset of the given shape.
    pub(crate) fn check_integrity(&self, rows: usize, cols: usize, element_type: ElementType) -> std::result::Result<(), String> {
        match self {
            NnIndex::Linear(_) => Ok(()),
            NnIndex::KdTree(index) => index.check_integrity(rows, cols),
            NnIndex::KdTreeSingle(index) => index.check_integrity(rows, cols),
            NnIndex::KMeans(index) => index.check_integrity(rows, cols),
            NnIndex::Composite(index) => index.check_integrity(rows, cols),
            NnIndex::Lsh(index) => index.check_integrity(rows, cols, element_type),
        }
    }
}
