//! Fast approximate nearest neighbor search
//!
//! rflann builds an index over a borrowed, row-major dataset and answers k-nearest-neighbor
//! and radius queries with one of several structures: randomized k-d tree forests, a single
//! exact k-d tree, hierarchical k-means trees, multi-probe LSH for binary data, a composite
//! of the first two, or a plain linear scan. The autotuned algorithm samples the dataset,
//! evaluates these candidates against exact ground truth and keeps the cheapest one that
//! reaches the requested precision.
//!
//! Indexes can be saved without their dataset and loaded again over the same points.
//!
//! ```
//! use rflann::core::config::Algorithm;
//! use rflann::core::Config;
//! use rflann::metricdata::Dataset;
//! use rflann::utils::generate_random_vectors;
//!
//! let points = generate_random_vectors(500, 8, 42);
//! let queries = generate_random_vectors(5, 8, 43);
//! let data = Dataset::from_array(points.view()).unwrap();
//!
//! let config = Config::new(Algorithm::KdTree).with_checks(64).with_seed(1);
//! let mut index = rflann::init_with_config(data, config).unwrap();
//! rflann::build(&mut index).unwrap();
//!
//! let result = index.nearest_neighbors(queries.view(), 3, None).unwrap();
//! assert_eq!(result.indices.dim(), (5, 3));
//! ```

use std::path::Path;

use ndarray::{Array2, ArrayView2};

use crate::algorithms::kmeans::KMeansTree;
use crate::algorithms::make_rng;
use crate::core::config::Algorithm;
use crate::core::index::{Index, KnnResult};
use crate::core::{Config, IndexError, Result};
use crate::metricdata::{Dataset, Element};

pub mod core;
pub mod metricdata;
pub mod utils;

mod algorithms;

pub use crate::metricdata::{distance_type, set_distance_type, Metric};

/// Creates an index over `data` with the default configuration.
pub fn init<T: Element>(data: Dataset<'_, T>) -> Result<Index<'_, T>> {
    init_with_config(data, Config::default())
}

pub fn init_with_config<T: Element>(data: Dataset<'_, T>, config: Config) -> Result<Index<'_, T>> {
    Index::with_dataset(config, data)
}

/// Opens an index saved with [`Index::save`] over the dataset it was built on.
pub fn init_from_file<P: AsRef<Path>, T: Element>(path: P, data: Dataset<'_, T>) -> Result<Index<'_, T>> {
    Index::from_file(path, data)
}

pub fn build<T: Element>(index: &mut Index<'_, T>) -> Result<f64> {
    index.build()
}

/// The `k` nearest neighbors of a single query as `(distance, index)` pairs, closest first.
pub fn search<T: Element>(index: &mut Index<'_, T>, query: &[T], k: usize) -> Result<Vec<(f64, usize)>> {
    let view = ArrayView2::from_shape((1, query.len()), query).map_err(|e| IndexError::DataError(e.to_string()))?;
    let result = index.nearest_neighbors(view, k, None)?;

    Ok(result
        .indices
        .row(0)
        .iter()
        .zip(result.distances.row(0))
        .filter(|(&i, _)| i >= 0)
        .map(|(&i, &d)| (d, i as usize))
        .collect())
}

/// Builds an index with `config`, answers one batch of queries and drops the index.
pub fn find_nearest_neighbors<T: Element>(
    data: Dataset<'_, T>,
    queries: ArrayView2<'_, T>,
    k: usize,
    config: Config,
) -> Result<KnnResult> {
    let mut index = Index::with_dataset(config, data)?;
    index.build()?;
    index.knn_query(queries, k, None)
}

/// Clusters `data` with a hierarchical k-means tree and returns the cluster centers, one
/// per row.
///
/// The tree can only be cut into `(branching - 1) * m + 1` clusters, so the result holds
/// the largest such count not above `clusters`.
///
/// # Errors
/// Returns `IndexError::ConfigError` if `clusters` is zero or the k-means parameters of
/// `config` are invalid.
pub fn compute_cluster_centers<T: Element>(data: Dataset<'_, T>, clusters: usize, config: &Config) -> Result<Array2<f64>> {
    if clusters < 1 {
        return Err(IndexError::ConfigError("Number of clusters must be at least 1".to_string()));
    }
    if data.num_points() == 0 {
        return Err(IndexError::DataError("empty dataset".to_string()));
    }

    let mut kmeans_config = config.clone();
    kmeans_config.algorithm = Algorithm::KMeans;
    kmeans_config.validate().map_err(IndexError::ConfigError)?;

    let mut rng = make_rng(kmeans_config.random_seed);
    let (tree, _) = utils::with_cores(kmeans_config.cores, || {
        KMeansTree::build(data, kmeans_config.metric, &kmeans_config.kmeans, &mut rng)
    })??;

    Ok(tree.cluster_centers(clusters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_random_vectors;

    #[test]
    fn test_search_single_query() {
        let points = generate_random_vectors(200, 4, 1);
        let data = Dataset::from_array(points.view()).unwrap();
        let mut index = init_with_config(data, Config::new(Algorithm::Linear)).unwrap();

        let found = search(&mut index, data.get_point(10), 3).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], (0.0, 10));
        assert!(found.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_find_nearest_neighbors_one_shot() {
        let points = generate_random_vectors(300, 6, 2);
        let queries = generate_random_vectors(10, 6, 3);
        let data = Dataset::from_array(points.view()).unwrap();

        let exact = find_nearest_neighbors(data, queries.view(), 4, Config::new(Algorithm::Linear)).unwrap();
        let approx = find_nearest_neighbors(
            data,
            queries.view(),
            4,
            Config::new(Algorithm::KdTree).with_checks(300).with_seed(4),
        )
        .unwrap();
        assert_eq!(exact.indices, approx.indices);
    }

    #[test]
    fn test_cluster_center_counts() {
        let points = generate_random_vectors(1000, 3, 5);
        let data = Dataset::from_array(points.view()).unwrap();
        let mut config = Config::new(Algorithm::KMeans).with_seed(6);
        config.kmeans.branching = 4;

        for (requested, expected) in [(1, 1), (4, 4), (9, 7), (10, 10)] {
            let centers = compute_cluster_centers(data, requested, &config).unwrap();
            assert_eq!(centers.dim(), (expected, 3), "requested {}", requested);
        }
    }

    #[test]
    fn test_cluster_center_errors() {
        let points = generate_random_vectors(10, 2, 7);
        let data = Dataset::from_array(points.view()).unwrap();
        let config = Config::default();

        assert!(matches!(
            compute_cluster_centers(data, 0, &config),
            Err(IndexError::ConfigError(_))
        ));

        let mut bad = config.clone();
        bad.kmeans.branching = 1;
        assert!(matches!(
            compute_cluster_centers(data, 3, &bad),
            Err(IndexError::ConfigError(_))
        ));
    }

    #[test]
    fn test_init_from_file() {
        let points = generate_random_vectors(100, 3, 8);
        let data = Dataset::from_array(points.view()).unwrap();
        let path = std::env::temp_dir().join(format!("rflann-lib-{}.idx", std::process::id()));

        let mut index = init(data).unwrap();
        build(&mut index).unwrap();
        index.save(&path).unwrap();

        let mut reopened = init_from_file(&path, data).unwrap();
        let query = data.get_point(0);
        assert_eq!(search(&mut reopened, query, 2).unwrap(), search(&mut index, query, 2).unwrap());
        std::fs::remove_file(&path).unwrap();
    }
}
