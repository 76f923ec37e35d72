use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::metricdata::Metric;

/// Index structure to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Linear,
    KdTree,
    KMeans,
    Composite,
    KdTreeSingle,
    Lsh,
    Autotuned,
    Saved,
}

impl Algorithm {
    /// Stable tag written in index files.
    pub fn tag(&self) -> u8 {
        match self {
            Algorithm::Linear => 0,
            Algorithm::KdTree => 1,
            Algorithm::KMeans => 2,
            Algorithm::Composite => 3,
            Algorithm::KdTreeSingle => 4,
            Algorithm::Lsh => 6,
            Algorithm::Saved => 254,
            Algorithm::Autotuned => 255,
        }
    }
}

/// How the k-means tree picks its initial cluster centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentersInit {
    Random,
    Gonzales,
    #[serde(rename = "kmeanspp")]
    KMeansPP,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdTreeParams {
    /// Number of randomized trees in the forest
    pub trees: usize,
}

impl Default for KdTreeParams {
    fn default() -> Self {
        Self { trees: 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdTreeSingleParams {
    /// Maximum number of points stored in a leaf
    pub leaf_max_size: usize,
}

impl Default for KdTreeSingleParams {
    fn default() -> Self {
        Self { leaf_max_size: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansParams {
    /// Number of children of every inner node
    pub branching: usize,

    /// Maximum Lloyd iterations per node, -1 runs until the assignment is stable
    pub iterations: i32,

    pub centers_init: CentersInit,

    /// Weight of a cluster's variance when ranking the clusters to backtrack into
    pub cluster_boundary_index: f64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            branching: 32,
            iterations: 11,
            centers_init: CentersInit::Random,
            cluster_boundary_index: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotunedParams {
    /// Fraction of the true nearest neighbors the tuned index must find
    pub target_precision: f64,

    /// Weight of build cost relative to search cost
    pub build_weight: f64,

    /// Weight of memory usage relative to search cost
    pub memory_weight: f64,

    /// Fraction of the dataset used for tuning
    pub sample_fraction: f64,
}

impl Default for AutotunedParams {
    fn default() -> Self {
        Self {
            target_precision: 0.8,
            build_weight: 0.01,
            memory_weight: 0.0,
            sample_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LshParams {
    pub table_number: usize,

    /// Bits per hash key
    pub key_size: usize,

    /// Maximum number of flipped key bits probed per table
    pub multi_probe_level: usize,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            table_number: 12,
            key_size: 20,
            multi_probe_level: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedParams {
    /// Index file loaded when building with `Algorithm::Saved`
    pub filename: Option<PathBuf>,
}

/// Parameters for the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub algorithm: Algorithm,

    /// Number of points a search may inspect once it has found `k` candidates
    pub checks: usize,

    /// Slack on branch pruning, a branch is skipped when its bound times `1 + eps` exceeds the worst result
    pub eps: f64,

    /// Threads used for building and batched search, 0 uses every available core
    pub cores: usize,

    pub random_seed: Option<u64>,

    pub metric: Metric,

    pub kdtree: KdTreeParams,
    pub kdtree_single: KdTreeSingleParams,
    pub kmeans: KMeansParams,
    pub autotuned: AutotunedParams,
    pub lsh: LshParams,
    pub saved: SavedParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::KdTree,
            checks: 32,
            eps: 0.0,
            cores: 0,
            random_seed: None,
            metric: Metric::default(),
            kdtree: KdTreeParams::default(),
            kdtree_single: KdTreeSingleParams::default(),
            kmeans: KMeansParams::default(),
            autotuned: AutotunedParams::default(),
            lsh: LshParams::default(),
            saved: SavedParams::default(),
        }
    }
}

impl Config {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn with_checks(mut self, checks: usize) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Parses a configuration from JSON, filling missing keys with defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: Config = serde_json::from_str(json).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.checks < 1 {
            return Err("Checks must be at least 1".to_string());
        }
        if !(self.eps >= 0.0) {
            return Err("Eps must be non-negative".to_string());
        }
        if let Metric::Minkowski(order) = self.metric {
            if !(order > 0.0) {
                return Err("Minkowski order must be positive".to_string());
            }
        }

        match self.algorithm {
            Algorithm::KdTree => self.validate_kdtree()?,
            Algorithm::KdTreeSingle => self.validate_kdtree_single()?,
            Algorithm::KMeans => self.validate_kmeans()?,
            Algorithm::Composite => {
                self.validate_kdtree()?;
                self.validate_kmeans()?;
            }
            Algorithm::Lsh => self.validate_lsh()?,
            Algorithm::Autotuned => self.validate_autotuned()?,
            Algorithm::Saved => {
                if self.saved.filename.is_none() {
                    return Err("Saved algorithm requires a filename".to_string());
                }
            }
            Algorithm::Linear => {}
        }

        let hamming_capable = matches!(
            self.algorithm,
            Algorithm::Linear | Algorithm::Lsh | Algorithm::Saved
        );
        if self.metric.is_hamming() && !hamming_capable {
            return Err("Hamming distance is only supported by linear and lsh indexes".to_string());
        }

        Ok(())
    }

    fn validate_kdtree(&self) -> Result<(), String> {
        if self.kdtree.trees < 1 {
            return Err("Trees must be at least 1".to_string());
        }
        Ok(())
    }

    fn validate_kdtree_single(&self) -> Result<(), String> {
        if self.kdtree_single.leaf_max_size < 1 {
            return Err("Leaf max size must be at least 1".to_string());
        }
        Ok(())
    }

    fn validate_kmeans(&self) -> Result<(), String> {
        if self.kmeans.branching < 2 {
            return Err("Branching must be at least 2".to_string());
        }
        if self.kmeans.iterations < -1 {
            return Err("Iterations must be -1 or non-negative".to_string());
        }
        if !(self.kmeans.cluster_boundary_index >= 0.0) {
            return Err("Cluster boundary index must be non-negative".to_string());
        }
        Ok(())
    }

    fn validate_lsh(&self) -> Result<(), String> {
        if self.lsh.table_number < 1 {
            return Err("Table number must be at least 1".to_string());
        }
        if self.lsh.key_size < 1 || self.lsh.key_size > 32 {
            return Err("Key size must be between 1 and 32".to_string());
        }
        Ok(())
    }

    fn validate_autotuned(&self) -> Result<(), String> {
        let params = &self.autotuned;
        if !(0.0..=1.0).contains(&params.target_precision) {
            return Err("Target precision must be in [0, 1]".to_string());
        }
        if !(params.build_weight >= 0.0) || !(params.memory_weight >= 0.0) {
            return Err("Build and memory weights must be non-negative".to_string());
        }
        if !(params.sample_fraction > 0.0 && params.sample_fraction <= 1.0) {
            return Err("Sample fraction must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

/// Per-query overrides of the search parameters stored in `Config`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub checks: usize,
    pub eps: f64,
    pub cores: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            checks: 32,
            eps: 0.0,
            cores: 0,
        }
    }
}

impl SearchParams {
    pub fn new(checks: usize) -> Self {
        Self {
            checks,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.checks < 1 {
            return Err("Checks must be at least 1".to_string());
        }
        if !(self.eps >= 0.0) {
            return Err("Eps must be non-negative".to_string());
        }
        Ok(())
    }
}

impl From<&Config> for SearchParams {
    fn from(config: &Config) -> Self {
        Self {
            checks: config.checks,
            eps: config.eps,
            cores: config.cores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.algorithm, Algorithm::KdTree);
        assert_eq!(config.checks, 32);
        assert_eq!(config.kdtree.trees, 4);
        assert_eq!(config.kmeans.branching, 32);
        assert_eq!(config.kmeans.iterations, 11);
        assert_eq!(config.kmeans.centers_init, CentersInit::Random);
        assert_eq!(config.autotuned.target_precision, 0.8);
        assert_eq!(config.lsh.table_number, 12);
        assert_eq!(config.kdtree_single.leaf_max_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_new_config() {
        let config = Config::new(Algorithm::KMeans).with_checks(128).with_seed(7);

        assert_eq!(config.algorithm, Algorithm::KMeans);
        assert_eq!(config.checks, 128);
        assert_eq!(config.random_seed, Some(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_config() {
        let mut config = Config::new(Algorithm::KMeans);
        config.kmeans.branching = 1;
        assert_eq!(config.validate(), Err("Branching must be at least 2".to_string()));

        let mut config = Config::new(Algorithm::KdTree);
        config.kdtree.trees = 0;
        assert_eq!(config.validate(), Err("Trees must be at least 1".to_string()));

        let config = Config::new(Algorithm::Linear).with_checks(0);
        assert!(config.validate().is_err());

        let mut config = Config::new(Algorithm::Autotuned);
        config.autotuned.sample_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::new(Algorithm::Lsh);
        config.lsh.key_size = 40;
        assert!(config.validate().is_err());

        let config = Config::new(Algorithm::Saved);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hamming_requires_binary_index() {
        let config = Config::new(Algorithm::KdTree).with_metric(Metric::Hamming);
        assert!(config.validate().is_err());

        let config = Config::new(Algorithm::Lsh).with_metric(Metric::Hamming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_config() {
        let config = Config::new(Algorithm::Composite).with_seed(42);

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&serialized).unwrap();

        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let json = r#"{
            "algorithm": "kmeans",
            "kmeans": { "branching": 16, "centers_init": "kmeanspp" },
            "some_future_option": true
        }"#;
        let config = Config::from_json(json).unwrap();

        assert_eq!(config.algorithm, Algorithm::KMeans);
        assert_eq!(config.kmeans.branching, 16);
        assert_eq!(config.kmeans.centers_init, CentersInit::KMeansPP);
        assert_eq!(config.kmeans.iterations, 11);
        assert_eq!(config.checks, 32);
    }

    #[test]
    fn test_search_params_from_config() {
        let config = Config::default().with_checks(256).with_cores(2);
        let params = SearchParams::from(&config);
        assert_eq!(params.checks, 256);
        assert_eq!(params.cores, 2);
        assert!(SearchParams::new(0).validate().is_err());
    }
}
