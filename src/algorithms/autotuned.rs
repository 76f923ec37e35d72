//! Picks the algorithm and parameters that reach a target precision at the lowest cost.
//!
//! Candidates are built on a sample of the dataset and queried with a held-out test set
//! whose exact nearest neighbors are known. Costs are counted in distance computations
//! and vector operations rather than wall time, so a seeded run always makes the same
//! choice.

use std::time::Instant;

use log::{debug, info};
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::core::config::{Algorithm, Config, SearchParams};
use crate::core::Result;
use crate::metricdata::{Dataset, Element, Metric};
use crate::utils::random_sample;

use super::linear::LinearIndex;
use super::{NnIndex, QueryContext, SearchScratch};

/// Largest test set used to measure precision
const SAMPLE_COUNT: usize = 1000;
/// Below this many test points autotuning falls back to linear search
const MIN_TEST_SIZE: usize = 10;

const KMEANS_ITERATIONS: [i32; 4] = [1, 5, 10, 15];
const KMEANS_BRANCHING: [usize; 5] = [16, 32, 64, 128, 256];
const KDTREE_TREES: [usize; 5] = [1, 4, 8, 16, 32];
const CB_INDEX_STEPS: usize = 5;

pub(crate) struct TunedIndex {
    pub(crate) structure: NnIndex,
    pub(crate) config: Config,
    pub(crate) speedup: f64,
}

#[derive(Debug, Clone)]
struct Candidate {
    config: Config,
    precision: f64,
    search_cost: f64,
    build_cost: f64,
    memory_ratio: f64,
}

impl Candidate {
    fn time_cost(&self, build_weight: f64) -> f64 {
        self.build_cost * build_weight + self.search_cost
    }
}

/// Result of tuning the check budget of one structure.
#[derive(Debug, Clone, Copy)]
struct CheckTuning {
    checks: usize,
    precision: f64,
    cost: f64,
}

/// Queries with known nearest-neighbor distances against a base dataset.
struct Evaluator<'e, 'a, T: Element> {
    base: Dataset<'a, T>,
    queries: Dataset<'e, T>,
    /// Distance to the true nearest neighbor of every query
    truth: Vec<f64>,
    /// Index of each query inside `base`, skipped when matching
    exclude: Option<&'e [usize]>,
    metric: Metric,
    target: f64,
}

impl<'e, 'a, T: Element> Evaluator<'e, 'a, T> {
    fn new(
        base: Dataset<'a, T>,
        queries: Dataset<'e, T>,
        exclude: Option<&'e [usize]>,
        metric: Metric,
        target: f64,
    ) -> Self {
        let truth = (0..queries.num_points())
            .into_par_iter()
            .map(|q| {
                let query = queries.get_point(q);
                let skip = exclude.map(|e| e[q]);
                base.points()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != skip)
                    .map(|(_, p)| metric.distance(p, query))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();

        Evaluator {
            base,
            queries,
            truth,
            exclude,
            metric,
            target,
        }
    }

    /// Fraction of queries whose nearest neighbor is found, and the distance computations spent.
    fn precision(&self, structure: &NnIndex, checks: usize) -> (f64, f64) {
        let params = SearchParams::new(checks);
        let ctx = QueryContext::new(self.base, self.metric, &params);
        let k = if self.exclude.is_some() { 2 } else { 1 };
        let rows = self.base.num_points();

        let (hits, computations) = (0..self.queries.num_points())
            .into_par_iter()
            .map_init(
                || SearchScratch::new(rows),
                |scratch, q| {
                    let before = scratch.distance_computations;
                    let found = structure.search_knn(&ctx, self.queries.get_point(q), k, scratch);
                    let skip = self.exclude.map(|e| e[q]);
                    let hit = found
                        .iter()
                        .find(|n| Some(n.point_index) != skip)
                        .map_or(false, |n| n.distance.0 <= self.truth[q]);
                    (hit as usize, scratch.distance_computations - before)
                },
            )
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        let total = self.queries.num_points().max(1) as f64;
        (hits as f64 / total, computations as f64)
    }

    /// Smallest number of checks reaching the target precision: double until the target is
    /// met, then bisect.
    fn tune_checks(&self, structure: &NnIndex) -> CheckTuning {
        let limit = self.base.num_points().max(1);

        let mut lo = 0;
        let mut hi = 1;
        let (mut precision, mut cost) = self.precision(structure, hi);
        while precision < self.target && hi < limit {
            lo = hi;
            hi = (hi * 2).min(limit);
            (precision, cost) = self.precision(structure, hi);
        }

        // lo never passes, hi always does
        if precision >= self.target {
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                let (p, c) = self.precision(structure, mid);
                if p >= self.target {
                    hi = mid;
                    precision = p;
                    cost = c;
                } else {
                    lo = mid;
                }
            }
        }

        CheckTuning {
            checks: hi,
            precision,
            cost,
        }
    }

    fn evaluate(&self, mut config: Config, rng: &mut StdRng) -> Result<Candidate> {
        let start = Instant::now();
        let built = NnIndex::build(&config, self.base, rng)?;
        let dataset_memory = self.base.memory_size().max(1) as f64;
        let memory_ratio = (built.structure.used_memory() as f64 + dataset_memory) / dataset_memory;

        let tuning = self.tune_checks(&built.structure);
        config.checks = tuning.checks;

        debug!(
            "{:?} candidate: checks {}, precision {:.3}, search cost {}, build cost {}, took {:?}",
            config.algorithm,
            tuning.checks,
            tuning.precision,
            tuning.cost,
            built.cost,
            start.elapsed()
        );

        Ok(Candidate {
            config,
            precision: tuning.precision,
            search_cost: tuning.cost,
            build_cost: built.cost as f64,
            memory_ratio,
        })
    }
}

/// Chooses and builds the best index for `data`.
pub(crate) fn autotune<T: Element>(data: Dataset<'_, T>, config: &Config, rng: &mut StdRng) -> Result<TunedIndex> {
    let params = config.autotuned;
    let n = data.num_points();
    let sample_size = ((params.sample_fraction * n as f64) as usize).min(n);
    let test_size = (sample_size / 10).min(SAMPLE_COUNT);

    if test_size < MIN_TEST_SIZE {
        info!("Sample of {} points too small to autotune, choosing linear search", sample_size);
        let mut tuned = config.clone();
        tuned.algorithm = Algorithm::Linear;
        return Ok(TunedIndex {
            structure: NnIndex::Linear(LinearIndex),
            config: tuned,
            speedup: 1.0,
        });
    }

    info!(
        "Autotuning on {} sample points with {} test queries, target precision {}",
        sample_size - test_size,
        test_size,
        params.target_precision
    );

    let chosen = random_sample(n, sample_size, rng);
    let (test_indices, train_indices) = chosen.split_at(test_size);
    let train_buffer = data.select(train_indices);
    let test_buffer = data.select(test_indices);
    let train = Dataset::new(&train_buffer, train_indices.len(), data.dimensions())?;
    let test = Dataset::new(&test_buffer, test_indices.len(), data.dimensions())?;

    let evaluator = Evaluator::new(train, test, None, config.metric, params.target_precision);
    let winner = select_candidate(&evaluator, config, rng)?;

    let mut tuned = winner.config;
    info!(
        "Autotune selected {:?} (precision {:.3} on the sample)",
        tuned.algorithm, winner.precision
    );

    let mut structure = NnIndex::build(&tuned, data, rng)?.structure;
    let speedup = estimate_search_params(data, &mut structure, &mut tuned, params.target_precision, rng)?;

    info!(
        "Autotuned index uses {} checks, speedup over linear search {:.2}",
        tuned.checks, speedup
    );

    Ok(TunedIndex {
        structure,
        config: tuned,
        speedup,
    })
}

fn select_candidate<T: Element>(evaluator: &Evaluator<'_, '_, T>, config: &Config, rng: &mut StdRng) -> Result<Candidate> {
    let train_rows = evaluator.base.num_points();
    let test_rows = evaluator.queries.num_points();

    let mut linear = config.clone();
    linear.algorithm = Algorithm::Linear;
    let mut candidates = vec![Candidate {
        config: linear,
        precision: 1.0,
        search_cost: (train_rows * test_rows) as f64,
        build_cost: 0.0,
        memory_ratio: 1.0,
    }];

    for &iterations in &KMEANS_ITERATIONS {
        for &branching in &KMEANS_BRANCHING {
            let mut candidate = config.clone();
            candidate.algorithm = Algorithm::KMeans;
            candidate.kmeans.iterations = iterations;
            candidate.kmeans.branching = branching;
            candidates.push(evaluator.evaluate(candidate, rng)?);
        }
    }

    for &trees in &KDTREE_TREES {
        let mut candidate = config.clone();
        candidate.algorithm = Algorithm::KdTree;
        candidate.kdtree.trees = trees;
        candidates.push(evaluator.evaluate(candidate, rng)?);
    }

    let build_weight = config.autotuned.build_weight;
    let cheapest = |algorithm: Algorithm| {
        candidates
            .iter()
            .filter(|c| c.config.algorithm == algorithm && c.precision >= evaluator.target)
            .min_by(|a, b| a.time_cost(build_weight).total_cmp(&b.time_cost(build_weight)))
            .map(|c| c.config.clone())
    };

    if let (Some(kd), Some(km)) = (cheapest(Algorithm::KdTree), cheapest(Algorithm::KMeans)) {
        let mut candidate = config.clone();
        candidate.algorithm = Algorithm::Composite;
        candidate.kdtree = kd.kdtree;
        candidate.kmeans = km.kmeans;
        let composite = evaluator.evaluate(candidate, rng)?;
        candidates.push(composite);
    }

    let best_time = candidates
        .iter()
        .map(|c| c.time_cost(build_weight))
        .fold(f64::INFINITY, f64::min)
        .max(f64::MIN_POSITIVE);
    let memory_weight = config.autotuned.memory_weight;
    let score = |c: &Candidate| c.time_cost(build_weight) / best_time + memory_weight * c.memory_ratio;

    let winner = candidates
        .iter()
        .filter(|c| c.precision >= evaluator.target)
        .min_by(|a, b| score(a).total_cmp(&score(b)))
        .or_else(|| candidates.iter().max_by(|a, b| a.precision.total_cmp(&b.precision)))
        .cloned();

    winner.ok_or_else(|| crate::core::IndexError::ConfigError("no autotune candidate".to_string()))
}

fn cluster_boundary_index(structure: &mut NnIndex, cb_index: f64) -> bool {
    match structure {
        NnIndex::KMeans(tree) => {
            tree.set_cluster_boundary_index(cb_index);
            true
        }
        NnIndex::Composite(composite) => {
            composite.kmeans_mut().set_cluster_boundary_index(cb_index);
            true
        }
        _ => false,
    }
}

/// Tunes the check budget (and the cluster boundary index of k-means trees) on the full
/// dataset, querying with dataset points. Returns the speedup over linear search.
fn estimate_search_params<T: Element>(
    data: Dataset<'_, T>,
    structure: &mut NnIndex,
    config: &mut Config,
    target: f64,
    rng: &mut StdRng,
) -> Result<f64> {
    let n = data.num_points();
    let samples = (n / 10).min(SAMPLE_COUNT);
    if samples == 0 || matches!(structure, NnIndex::Linear(_)) {
        return Ok(1.0);
    }

    let sample_indices = random_sample(n, samples, rng);
    let query_buffer = data.select(&sample_indices);
    let queries = Dataset::new(&query_buffer, samples, data.dimensions())?;
    let evaluator = Evaluator::new(data, queries, Some(&sample_indices), config.metric, target);

    let mut best: Option<(f64, CheckTuning)> = None;
    if cluster_boundary_index(structure, 0.0) {
        for step in 0..=CB_INDEX_STEPS {
            let cb_index = step as f64 / CB_INDEX_STEPS as f64;
            cluster_boundary_index(structure, cb_index);
            let tuning = evaluator.tune_checks(structure);
            debug!("cb_index {:.1}: checks {}, cost {}", cb_index, tuning.checks, tuning.cost);
            if best.map_or(true, |(_, b)| tuning.cost < b.cost) {
                best = Some((cb_index, tuning));
            }
        }
    } else {
        best = Some((config.kmeans.cluster_boundary_index, evaluator.tune_checks(structure)));
    }

    let Some((cb_index, tuning)) = best else {
        return Ok(1.0);
    };
    cluster_boundary_index(structure, cb_index);
    config.kmeans.cluster_boundary_index = cb_index;
    config.checks = tuning.checks;

    let linear_cost = (n * samples) as f64;
    Ok(linear_cost / tuning.cost.max(1.0))
}
