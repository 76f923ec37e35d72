#![allow(dead_code)]

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use rflann::core::config::Algorithm;
use rflann::core::Config;
use rflann::utils::generate_random_vectors;

pub const DATASET_SIZE: usize = 20_000;
pub const DIMENSIONS: usize = 32;
pub const NUM_QUERIES: usize = 200;
pub const K: usize = 10;

/// The configurations every bench runs, named for the report.
pub fn configs() -> Vec<(&'static str, Config)> {
    let mut kdtree = Config::new(Algorithm::KdTree).with_checks(128).with_seed(1);
    kdtree.kdtree.trees = 8;

    let mut kmeans = Config::new(Algorithm::KMeans).with_checks(128).with_seed(1);
    kmeans.kmeans.branching = 32;

    let mut composite = Config::new(Algorithm::Composite).with_checks(128).with_seed(1);
    composite.kdtree.trees = 4;

    vec![
        ("linear", Config::new(Algorithm::Linear)),
        ("kdtree", kdtree),
        ("kdtree_single", Config::new(Algorithm::KdTreeSingle)),
        ("kmeans", kmeans),
        ("composite", composite),
    ]
}

pub fn dataset() -> (Array2<f32>, Array2<f32>) {
    (
        generate_random_vectors(DATASET_SIZE, DIMENSIONS, 7),
        generate_random_vectors(NUM_QUERIES, DIMENSIONS, 8),
    )
}

pub fn print_benchmark_header(name: &str) {
    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║ {:<61} ║", name);
    println!("╚═══════════════════════════════════════════════════════════════╝");
}

pub fn create_progress_bar(name: String, total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .expect("Failed to create progress bar template")
            .progress_chars("#>-"),
    );
    pb.set_message(name);
    pb
}
