use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use ndarray::s;

use rflann::core::{Config, Result};
use rflann::metricdata::{Dataset, Metric};
use rflann::utils::{compute_ground_truth, generate_random_vectors, RunMetrics};
use rflann::{build, init_with_config};

const DATASET_SIZE: usize = 100_000;
const DIMENSIONS: usize = 64;
const NUM_QUERIES: usize = 1_000;
const K: usize = 10;
const BATCH_SIZE: usize = 100;

/// Usage: `rflann [config.json] [output.csv]`
fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Benchmark failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&String>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let json = std::fs::read_to_string(path)?;
    Config::from_json(&json).map_err(rflann::core::IndexError::ConfigError)
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = load_config(args.get(1))?;
    let output = args.get(2).map_or_else(|| PathBuf::from("results.csv"), PathBuf::from);

    info!("Starting search benchmark");
    let total_start = Instant::now();

    let data_raw = generate_random_vectors(DATASET_SIZE, DIMENSIONS, 1);
    let queries = generate_random_vectors(NUM_QUERIES, DIMENSIONS, 2);
    let data = Dataset::from_array(data_raw.view())?;
    let query_set = Dataset::from_array(queries.view())?;

    info!("Computing ground truth for {} queries", NUM_QUERIES);
    let (_, ground_truth) = compute_ground_truth(&data, &query_set, K, Metric::Euclidean);

    let mut metrics = RunMetrics::new(config.clone(), DATASET_SIZE, K);
    let mut index = init_with_config(data, config)?;

    let build_start = Instant::now();
    let speedup = build(&mut index)?;
    let build_time = build_start.elapsed();
    info!("Index built in {:?}", build_time);
    metrics.log_build(build_time, speedup, index.used_memory());

    let progress_bar = ProgressBar::new(NUM_QUERIES as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let mut distances = ndarray::Array2::<f64>::zeros((NUM_QUERIES, K));
    let mut total_search_time = Duration::ZERO;
    for start in (0..NUM_QUERIES).step_by(BATCH_SIZE) {
        let end = (start + BATCH_SIZE).min(NUM_QUERIES);
        let batch = queries.slice(s![start..end, ..]);

        let batch_start = Instant::now();
        let result = index.knn_query(batch, K, None)?;
        total_search_time += batch_start.elapsed();

        distances.slice_mut(s![start..end, ..]).assign(&result.distances);
        metrics.add_distance_computations(result.distance_computations);

        progress_bar.inc((end - start) as u64);
        progress_bar.set_message(format!("Avg: {:?}", total_search_time / end as u32));
    }
    progress_bar.finish_with_message("Search complete");

    metrics.compute_run_statistics(&ground_truth, &distances, total_search_time);
    let (recall_mean, recall_std) = metrics.recall();
    info!("All queries processed in {:?}", total_search_time);
    info!("Queries per second: {:.1}", metrics.queries_per_second());
    info!("Recall: {:.4} (std {:.4})", recall_mean, recall_std);

    info!("Saving metrics to {}", output.display());
    metrics.save_to_csv(&output, env!("GIT_COMMIT_HASH"))?;

    info!("Benchmark completed in {:?}", total_start.elapsed());
    Ok(())
}
