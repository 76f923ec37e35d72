use log::debug;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::core::heap::{Neighbor, TopKClosestHeap};
use crate::core::Result;
use crate::metricdata::{Dataset, Element, Metric};

pub mod metrics;

pub use metrics::RunMetrics;

/// A rayon pool sized by a `cores` setting, kept around so repeated batches reuse its
/// threads. Zero cores means the global rayon pool.
pub struct CorePool {
    cores: usize,
    pool: Option<rayon::ThreadPool>,
}

impl CorePool {
    pub fn new(cores: usize) -> Result<Self> {
        let pool = if cores == 0 {
            None
        } else {
            debug!("Starting a pool of {} threads", cores);
            Some(rayon::ThreadPoolBuilder::new().num_threads(cores).build()?)
        };
        Ok(CorePool { cores, pool })
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

/// Runs `f` on a pool of `cores` threads, or on the global rayon pool when `cores` is 0.
pub fn with_cores<R, F>(cores: usize, f: F) -> Result<R>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    Ok(CorePool::new(cores)?.install(f))
}

/// `count` distinct indices below `n`, in random order.
pub(crate) fn random_sample(n: usize, count: usize, rng: &mut StdRng) -> Vec<usize> {
    sample(rng, n, count.min(n)).into_vec()
}

/// Exact k nearest neighbors of every query by linear scan.
///
/// Returns the neighbor indices and their distances, one row per query. Rows of
/// queries with fewer than `k` neighbors are padded with `-1` and infinity.
pub fn compute_ground_truth<T: Element>(
    data: &Dataset<'_, T>,
    queries: &Dataset<'_, T>,
    k: usize,
    metric: Metric,
) -> (Array2<i64>, Array2<f64>) {
    let rows: Vec<Vec<Neighbor>> = (0..queries.num_points())
        .into_par_iter()
        .map(|q| brute_force_search(data, queries.get_point(q), k, metric))
        .collect();

    let mut indices = Array2::from_elem((rows.len(), k), -1i64);
    let mut distances = Array2::from_elem((rows.len(), k), f64::INFINITY);
    for (q, row) in rows.iter().enumerate() {
        for (j, neighbor) in row.iter().enumerate() {
            indices[[q, j]] = neighbor.point_index as i64;
            distances[[q, j]] = neighbor.distance.into_inner();
        }
    }

    debug!("Computed ground truth for {} queries", rows.len());
    (indices, distances)
}

pub(crate) fn brute_force_search<T: Element>(data: &Dataset<'_, T>, query: &[T], k: usize, metric: Metric) -> Vec<Neighbor> {
    let mut heap = TopKClosestHeap::new(k);
    for (i, point) in data.points().enumerate() {
        heap.add(Neighbor::new(metric.distance(point, query), i));
    }
    heap.into_sorted_vec()
}

fn threshold(distances: &[f64], count: usize, epsilon: f64) -> f64 {
    distances
        .iter()
        .take(count)
        .copied()
        .filter(|d| d.is_finite())
        .fold(f64::NEG_INFINITY, f64::max)
        + epsilon
}

/// Recall of a run against exact distances, counting a hit for every returned distance
/// within the `count`-th true distance (plus a small tolerance).
///
/// Returns the mean recall, its standard deviation and the hits of every query.
pub fn get_recall_values(ground_truth: &Array2<f64>, run_distances: &Array2<f64>, count: usize) -> (f64, f64, Vec<f64>) {
    let mut recalls = Vec::with_capacity(run_distances.nrows());

    for (truth, found) in ground_truth.axis_iter(Axis(0)).zip(run_distances.axis_iter(Axis(0))) {
        let truth = truth.to_vec();
        let t = threshold(&truth, count, 1e-6);
        let hits = found.iter().take(count).filter(|&&d| d <= t).count();
        recalls.push(hits as f64);
    }

    if recalls.is_empty() || count == 0 {
        return (0.0, 0.0, recalls);
    }

    let queries = recalls.len() as f64;
    let mean = recalls.iter().sum::<f64>() / queries;
    let std = (recalls.iter().map(|&r| (r - mean).powi(2)).sum::<f64>() / queries).sqrt();

    (mean / count as f64, std / count as f64, recalls)
}

/// Uniform random points in the unit hypercube.
pub fn generate_random_vectors(n: usize, dimensions: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((n, dimensions), || rng.gen::<f32>())
}

pub fn generate_random_unit_vectors(n: usize, dimensions: usize, seed: u64) -> Array2<f32> {
    let mut data = generate_random_vectors(n, dimensions, seed);

    for mut row in data.axis_iter_mut(Axis(0)) {
        let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_cores_runs_on_pool() {
        let threads = with_cores(2, rayon::current_num_threads).unwrap();
        assert_eq!(threads, 2);
        assert!(with_cores(0, || 7).unwrap() == 7);
    }

    #[test]
    fn test_core_pool_is_reusable() {
        let pool = CorePool::new(3).unwrap();
        assert_eq!(pool.cores(), 3);
        assert_eq!(pool.install(rayon::current_num_threads), 3);
        assert_eq!(pool.install(rayon::current_num_threads), 3);

        let global = CorePool::new(0).unwrap();
        assert_eq!(global.install(rayon::current_num_threads), rayon::current_num_threads());
    }

    #[test]
    fn test_random_sample_is_distinct() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut picked = random_sample(50, 20, &mut rng);
        assert_eq!(picked.len(), 20);
        picked.sort_unstable();
        picked.dedup();
        assert_eq!(picked.len(), 20);
        assert!(picked.iter().all(|&i| i < 50));

        assert_eq!(random_sample(5, 10, &mut rng).len(), 5);
    }

    #[test]
    fn test_ground_truth_pads_short_rows() {
        let buffer = vec![0.0f32, 1.0, 3.0];
        let data = Dataset::new(&buffer, 3, 1).unwrap();
        let query_buffer = vec![0.9f32];
        let queries = Dataset::new(&query_buffer, 1, 1).unwrap();

        let (indices, distances) = compute_ground_truth(&data, &queries, 4, Metric::Euclidean);
        assert_eq!(indices.row(0).to_vec(), vec![1, 0, 2, -1]);
        assert!((distances[[0, 0]] - 0.01).abs() < 1e-6);
        assert_eq!(distances[[0, 3]], f64::INFINITY);
    }

    #[test]
    fn test_recall_values() {
        let truth = ndarray::arr2(&[[1.0, 2.0], [1.0, 2.0]]);
        let found = ndarray::arr2(&[[1.0, 2.0], [1.0, 5.0]]);
        let (mean, std, per_query) = get_recall_values(&truth, &found, 2);

        assert_eq!(per_query, vec![2.0, 1.0]);
        assert!((mean - 0.75).abs() < 1e-12);
        assert!((std - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_unit_vectors_have_unit_norm() {
        let data = generate_random_unit_vectors(10, 16, 3);
        for row in data.rows() {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(generate_random_vectors(4, 3, 9), generate_random_vectors(4, 3, 9));
    }
}
