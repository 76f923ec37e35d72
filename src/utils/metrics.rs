use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use ndarray::Array2;

use crate::core::{Config, IndexError, Result};

use super::get_recall_values;

/// Summary of one benchmark run: a build followed by a batch of queries.
pub struct RunMetrics {
    config: Config,
    dataset_len: usize,
    k: usize,
    build_time: Duration,
    speedup: f64,
    memory_used_bytes: usize,
    distance_computations: usize,
    num_queries: usize,
    total_search_time: Duration,
    queries_per_second: f64,
    recall_mean: f64,
    recall_std: f64,
}

impl RunMetrics {
    pub fn new(config: Config, dataset_len: usize, k: usize) -> Self {
        Self {
            config,
            dataset_len,
            k,
            build_time: Duration::default(),
            speedup: 1.0,
            memory_used_bytes: 0,
            distance_computations: 0,
            num_queries: 0,
            total_search_time: Duration::default(),
            queries_per_second: 0.0,
            recall_mean: 0.0,
            recall_std: 0.0,
        }
    }

    pub fn log_build(&mut self, time: Duration, speedup: f64, memory_used_bytes: usize) {
        self.build_time = time;
        self.speedup = speedup;
        self.memory_used_bytes = memory_used_bytes;
    }

    pub fn add_distance_computations(&mut self, n_comp: usize) {
        self.distance_computations += n_comp;
    }

    /// Computes recall and throughput from the distances a run returned.
    pub fn compute_run_statistics(&mut self, ground_truth: &Array2<f64>, run_distances: &Array2<f64>, total_search_time: Duration) {
        (self.recall_mean, self.recall_std, _) = get_recall_values(ground_truth, run_distances, self.k);

        self.num_queries = run_distances.nrows();
        self.total_search_time = total_search_time;
        let seconds = total_search_time.as_secs_f64();
        self.queries_per_second = if seconds > 0.0 {
            self.num_queries as f64 / seconds
        } else {
            0.0
        };
    }

    pub fn recall(&self) -> (f64, f64) {
        (self.recall_mean, self.recall_std)
    }

    pub fn queries_per_second(&self) -> f64 {
        self.queries_per_second
    }

    /// Appends one row to a CSV file, writing the header first if the file is new.
    pub fn save_to_csv(&self, path: &Path, commit: &str) -> Result<()> {
        let exists = path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        let csv_error = |e: csv::Error| IndexError::Io(e.to_string());
        if !exists {
            wtr.write_record([
                "timestamp",
                "commit",
                "algorithm",
                "config",
                "dataset_len",
                "k",
                "build_time_s",
                "speedup",
                "memory_used_bytes",
                "queries",
                "avg_distance_computations",
                "search_time_s",
                "qps",
                "recall_mean",
                "recall_std",
            ])
            .map_err(csv_error)?;
        }

        let config = serde_json::to_string(&self.config).map_err(|e| IndexError::ConfigError(e.to_string()))?;
        let avg_computations = self.distance_computations as f64 / self.num_queries.max(1) as f64;
        wtr.write_record([
            chrono::Utc::now().to_rfc3339(),
            commit.to_string(),
            format!("{:?}", self.config.algorithm),
            config,
            self.dataset_len.to_string(),
            self.k.to_string(),
            self.build_time.as_secs_f64().to_string(),
            self.speedup.to_string(),
            self.memory_used_bytes.to_string(),
            self.num_queries.to_string(),
            avg_computations.to_string(),
            self.total_search_time.as_secs_f64().to_string(),
            self.queries_per_second.to_string(),
            self.recall_mean.to_string(),
            self.recall_std.to_string(),
        ])
        .map_err(csv_error)?;

        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Algorithm;

    #[test]
    fn test_run_statistics() {
        let mut metrics = RunMetrics::new(Config::new(Algorithm::Linear), 10, 2);
        let truth = ndarray::arr2(&[[1.0, 2.0], [1.0, 2.0]]);
        metrics.compute_run_statistics(&truth, &truth, Duration::from_millis(500));

        assert_eq!(metrics.recall(), (1.0, 0.0));
        assert!((metrics.queries_per_second() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_csv_rows_are_appended() {
        let path = std::env::temp_dir().join(format!("rflann-metrics-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let metrics = RunMetrics::new(Config::new(Algorithm::KdTree), 100, 5);
        metrics.save_to_csv(&path, "abc123").unwrap();
        metrics.save_to_csv(&path, "abc123").unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[1], "commit");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "KdTree");

        std::fs::remove_file(&path).unwrap();
    }
}
