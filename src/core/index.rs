use std::path::Path;
use std::time::Instant;

use log::{debug, info};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::algorithms::autotuned::autotune;
use crate::algorithms::{make_rng, NnIndex, QueryContext, SearchScratch};
use crate::core::config::{Algorithm, SearchParams};
use crate::core::heap::{RadiusResultSet, ResultSet};
use crate::core::serialization::{load_index, save_index};
use crate::core::{Config, IndexError, Result};
use crate::metricdata::{Dataset, Element, Metric};
use crate::utils::{with_cores, CorePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Unbuilt,
    Built,
    Freed,
}

/// Result of a batched k-nearest-neighbors query.
///
/// Row `i` holds the neighbors of query `i`, closest first. Slots a query could not
/// fill hold index `-1` and an infinite distance.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnResult {
    pub indices: Array2<i64>,
    pub distances: Array2<f64>,
    /// Distances computed over the whole batch
    pub distance_computations: usize,
}

/// Points within a radius of one query, closest first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RadiusResult {
    pub indices: Vec<usize>,
    pub distances: Vec<f64>,
    pub distance_computations: usize,
}

impl RadiusResult {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// A nearest neighbor index over a borrowed dataset.
pub struct Index<'a, T: Element> {
    data: Option<Dataset<'a, T>>,
    config: Config,
    /// Parameters the live structure was actually built with
    effective: Config,
    structure: Option<NnIndex>,
    status: BuildStatus,
    speedup: f64,
    /// Threads of the last build, reused by queries asking for as many cores
    pool: Option<CorePool>,
}

fn check_element_type<T: Element>(config: &Config) -> Result<()> {
    if config.algorithm == Algorithm::Lsh && T::ELEMENT_TYPE.is_floating_point() {
        return Err(IndexError::UnsupportedType(format!(
            "LSH indexes binary data, got {:?} points",
            T::ELEMENT_TYPE
        )));
    }
    Ok(())
}

impl<'a, T: Element> Index<'a, T> {
    /// Creates an index without a dataset.
    ///
    /// # Errors
    /// Returns `IndexError::ConfigError` if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(IndexError::ConfigError)?;
        check_element_type::<T>(&config)?;

        info!("Initializing index with config {:?}", config);

        Ok(Index {
            data: None,
            effective: config.clone(),
            config,
            structure: None,
            status: BuildStatus::Unbuilt,
            speedup: 1.0,
            pool: None,
        })
    }

    /// Creates an index over `data`. Nothing is built until `build` or the first query.
    ///
    /// # Errors
    /// Returns `IndexError::ConfigError` for an invalid configuration and
    /// `IndexError::UnsupportedType` if the algorithm cannot index this element type.
    ///
    /// # Examples
    /// ```
    /// use rflann::core::{config::Algorithm, index::Index, Config};
    /// use rflann::metricdata::Dataset;
    ///
    /// let points = vec![0.0f32, 0.0, 1.0, 1.0, 5.0, 5.0];
    /// let data = Dataset::new(&points, 3, 2).unwrap();
    /// let mut index = Index::with_dataset(Config::new(Algorithm::Linear), data).unwrap();
    /// let result = index.radius_search(&[0.9, 0.9], 2.0, 10, None).unwrap();
    /// assert_eq!(result.indices, vec![1, 0]);
    /// ```
    pub fn with_dataset(config: Config, data: Dataset<'a, T>) -> Result<Self> {
        let mut index = Self::new(config)?;
        index.set_dataset(data);
        Ok(index)
    }

    /// Replaces the dataset, freeing any structure built over the previous one.
    pub fn set_dataset(&mut self, data: Dataset<'a, T>) {
        self.free();
        self.data = Some(data);
    }

    /// Replaces the configuration, freeing any structure built with the previous one.
    pub fn set_config(&mut self, config: Config) -> Result<()> {
        config.validate().map_err(IndexError::ConfigError)?;
        check_element_type::<T>(&config)?;
        self.free();
        self.effective = config.clone();
        self.config = config;
        Ok(())
    }

    /// Builds the structure, replacing the current one.
    ///
    /// Returns an estimate of the speedup over linear search: measured on dataset samples
    /// for autotuned indexes, derived from the check budget otherwise. On failure the
    /// index is left without a structure.
    pub fn build(&mut self) -> Result<f64> {
        let data = self.data.ok_or(IndexError::MissingDataset)?;
        self.config.validate().map_err(IndexError::ConfigError)?;
        check_element_type::<T>(&self.config)?;
        self.free();

        info!(
            "Building {:?} index over {} points of dimension {}",
            self.config.algorithm,
            data.num_points(),
            data.dimensions()
        );
        let start = Instant::now();

        let built = self
            .prepare_pool(self.config.cores)
            .and_then(|()| {
                let config = &self.config;
                let mut rng = make_rng(config.random_seed);
                self.run_with_cores(config.cores, || build_structure(data, config, &mut rng))
            })
            .and_then(|built| built);
        let (structure, effective, speedup) = match built {
            Ok(built) => built,
            Err(e) => {
                self.status = BuildStatus::Unbuilt;
                return Err(e);
            }
        };

        info!(
            "Built {:?} index in {:?}, {} bytes, estimated speedup {:.2}",
            structure.algorithm(),
            start.elapsed(),
            structure.used_memory(),
            speedup
        );

        self.structure = Some(structure);
        self.effective = effective;
        self.speedup = speedup;
        self.status = BuildStatus::Built;
        Ok(speedup)
    }

    fn prepare_pool(&mut self, cores: usize) -> Result<()> {
        if self.pool.as_ref().map_or(true, |pool| pool.cores() != cores) {
            self.pool = Some(CorePool::new(cores)?);
        }
        Ok(())
    }

    /// Runs `f` on the kept pool when it has `cores` threads, on a temporary one otherwise.
    fn run_with_cores<R, F>(&self, cores: usize, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) if pool.cores() == cores => Ok(pool.install(f)),
            _ => with_cores(cores, f),
        }
    }

    fn ensure_built(&mut self) -> Result<()> {
        if self.status != BuildStatus::Built {
            debug!("Index not built, building before searching");
            self.build()?;
        }
        Ok(())
    }

    fn live(&self) -> Result<(Dataset<'a, T>, &NnIndex)> {
        match (self.data, &self.structure) {
            (Some(data), Some(structure)) => Ok((data, structure)),
            _ => Err(IndexError::NotBuilt),
        }
    }

    fn search_params(&self, params: Option<&SearchParams>) -> Result<SearchParams> {
        let params = params.copied().unwrap_or_else(|| SearchParams::from(&self.effective));
        params.validate().map_err(IndexError::ConfigError)?;
        Ok(params)
    }

    /// Finds the `k` nearest neighbors of every row of `queries`, building the index first
    /// if needed.
    ///
    /// # Errors
    /// Returns `IndexError::MissingDataset` if there is nothing to build from and
    /// `IndexError::DimensionMismatch` if the queries and the dataset differ in columns.
    pub fn nearest_neighbors(
        &mut self,
        queries: ArrayView2<'_, T>,
        k: usize,
        params: Option<&SearchParams>,
    ) -> Result<KnnResult> {
        self.ensure_built()?;
        self.knn_query(queries, k, params)
    }

    /// Same as `nearest_neighbors` on an index that is already built.
    ///
    /// Takes `&self`, so several threads may query the same index.
    pub fn knn_query(&self, queries: ArrayView2<'_, T>, k: usize, params: Option<&SearchParams>) -> Result<KnnResult> {
        let (data, structure) = self.live()?;
        if k == 0 {
            return Err(IndexError::ConfigError("k must be at least 1".to_string()));
        }
        if queries.ncols() != data.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: data.dimensions(),
                got: queries.ncols(),
            });
        }
        let params = self.search_params(params)?;

        let queries = queries.as_standard_layout();
        let queries = Dataset::from_array(queries.view())?;
        let ctx = QueryContext::new(data, self.effective.metric, &params);
        let rows = queries.num_points();

        let results = self.run_with_cores(params.cores, || {
            (0..rows)
                .into_par_iter()
                .map_init(
                    || SearchScratch::new(data.num_points()),
                    |scratch, q| {
                        let before = scratch.distance_computations;
                        let found = structure.search_knn(&ctx, queries.get_point(q), k, scratch);
                        (found, scratch.distance_computations - before)
                    },
                )
                .collect::<Vec<_>>()
        })?;

        let mut indices = Array2::from_elem((rows, k), -1i64);
        let mut distances = Array2::from_elem((rows, k), f64::INFINITY);
        let mut distance_computations = 0;
        for (q, (found, computations)) in results.into_iter().enumerate() {
            for (j, neighbor) in found.into_iter().enumerate() {
                indices[[q, j]] = neighbor.point_index as i64;
                distances[[q, j]] = neighbor.distance.into_inner();
            }
            distance_computations += computations;
        }

        debug!(
            "Answered {} queries with {} distance computations",
            rows, distance_computations
        );

        Ok(KnnResult {
            indices,
            distances,
            distance_computations,
        })
    }

    /// Finds up to `max_count` points within `radius` of `query`, building the index
    /// first if needed. Pass `usize::MAX` for no cap.
    pub fn radius_search(
        &mut self,
        query: &[T],
        radius: f64,
        max_count: usize,
        params: Option<&SearchParams>,
    ) -> Result<RadiusResult> {
        self.ensure_built()?;
        self.radius_query(query, radius, max_count, params)
    }

    /// Same as `radius_search` on an index that is already built.
    pub fn radius_query(&self, query: &[T], radius: f64, max_count: usize, params: Option<&SearchParams>) -> Result<RadiusResult> {
        let (data, structure) = self.live()?;
        if query.len() != data.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: data.dimensions(),
                got: query.len(),
            });
        }
        if radius.is_nan() || radius < 0.0 {
            return Err(IndexError::ConfigError(format!("invalid radius {}", radius)));
        }
        let params = self.search_params(params)?;

        let ctx = QueryContext::new(data, self.effective.metric, &params);
        let mut scratch = SearchScratch::new(data.num_points());
        scratch.begin_query();
        let mut result = RadiusResultSet::new(radius, max_count.min(data.num_points()));
        structure.find_neighbors(&ctx, query, &mut result, &mut scratch);

        let (indices, distances) = result
            .into_sorted_vec()
            .into_iter()
            .map(|n| (n.point_index, n.distance.into_inner()))
            .unzip();

        Ok(RadiusResult {
            indices,
            distances,
            distance_computations: scratch.distance_computations,
        })
    }

    /// Writes the structure, not the dataset, to `path`.
    ///
    /// # Errors
    /// Returns `IndexError::NotBuilt` if there is no structure to save.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (data, structure) = self.live()?;
        save_index(path.as_ref(), &data, &self.effective, self.speedup, structure)
    }

    /// Loads a saved structure built over `data`.
    ///
    /// # Errors
    /// Returns `IndexError::Format` if the file is not an index file or was built over a
    /// dataset of another shape or element type.
    pub fn load<P: AsRef<Path>>(&mut self, path: P, data: Dataset<'a, T>) -> Result<()> {
        let saved = load_index(path.as_ref(), &data)?;
        self.free();

        info!("Loaded {:?} index over {} points", saved.structure.algorithm(), data.num_points());

        self.data = Some(data);
        self.config = saved.config.clone();
        self.effective = saved.config;
        self.structure = Some(saved.structure);
        self.speedup = saved.speedup;
        self.status = BuildStatus::Built;
        Ok(())
    }

    /// Opens a saved index over `data`.
    pub fn from_file<P: AsRef<Path>>(path: P, data: Dataset<'a, T>) -> Result<Self> {
        let mut index = Self::new(Config::default())?;
        index.load(path, data)?;
        Ok(index)
    }

    /// Drops the structure. Calling it again is a no-op.
    pub fn free(&mut self) {
        if self.structure.take().is_some() {
            debug!("Freed {:?} index", self.effective.algorithm);
            self.status = BuildStatus::Freed;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The configuration of the live structure, with autotuned parameters filled in.
    pub fn effective_config(&self) -> &Config {
        &self.effective
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn speedup(&self) -> f64 {
        self.speedup
    }

    pub fn metric(&self) -> Metric {
        self.effective.metric
    }

    pub fn dataset(&self) -> Option<Dataset<'a, T>> {
        self.data
    }

    /// Algorithm of the live structure, if any.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.structure.as_ref().map(NnIndex::algorithm)
    }

    /// Bytes used by the structure, not counting the dataset.
    pub fn used_memory(&self) -> usize {
        self.structure.as_ref().map_or(0, NnIndex::used_memory)
    }
}

fn build_structure<T: Element>(data: Dataset<'_, T>, config: &Config, rng: &mut StdRng) -> Result<(NnIndex, Config, f64)> {
    match config.algorithm {
        Algorithm::Autotuned => {
            let tuned = autotune(data, config, rng)?;
            Ok((tuned.structure, tuned.config, tuned.speedup))
        }
        Algorithm::Saved => {
            let path = config
                .saved
                .filename
                .as_ref()
                .ok_or_else(|| IndexError::ConfigError("saved index needs a filename".to_string()))?;
            let saved = load_index(path, &data)?;
            Ok((saved.structure, saved.config, saved.speedup))
        }
        _ => {
            let mut effective = config.clone();
            if effective.algorithm == Algorithm::Lsh {
                effective.metric = Metric::Hamming;
            }
            let built = NnIndex::build(&effective, data, rng)?;
            let speedup = built.structure.estimated_speedup(data.num_points(), effective.checks);
            Ok((built.structure, effective, speedup))
        }
    }
}
