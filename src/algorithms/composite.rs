use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::core::heap::ResultSet;
use crate::core::{Config, Result};
use crate::metricdata::{Dataset, Element};

use super::kdtree::KdTreeForest;
use super::kmeans::KMeansTree;
use super::{QueryContext, SearchScratch};

/// A k-d forest and a k-means tree over the same points, searched into one result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CompositeIndex {
    kdtree: KdTreeForest,
    kmeans: KMeansTree,
}

impl CompositeIndex {
    pub(crate) fn build<T: Element>(data: Dataset<'_, T>, config: &Config, rng: &mut StdRng) -> Result<(Self, usize)> {
        let (kdtree, kd_cost) = KdTreeForest::build(data, &config.kdtree, rng)?;
        let (kmeans, kmeans_cost) = KMeansTree::build(data, config.metric, &config.kmeans, rng)?;
        Ok((CompositeIndex { kdtree, kmeans }, kd_cost + kmeans_cost))
    }

    pub(crate) fn kmeans_mut(&mut self) -> &mut KMeansTree {
        &mut self.kmeans
    }

    /// Each part spends its own check budget; points found by both are scored once.
    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        self.kmeans.find_neighbors(ctx, query, result, scratch);
        self.kdtree.find_neighbors(ctx, query, result, scratch);
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.kdtree.used_memory() + self.kmeans.used_memory()
    }

    pub(crate) fn check_integrity(&self, rows: usize, cols: usize) -> std::result::Result<(), String> {
        self.kdtree.check_integrity(rows, cols)?;
        self.kmeans.check_integrity(rows, cols)
    }
}
