use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rflann::compute_cluster_centers;
use rflann::core::config::Algorithm;
use rflann::core::Config;
use rflann::metricdata::Dataset;
use rflann::{build, init_with_config};
use utils::{configs, dataset, print_benchmark_header};

mod utils;

pub fn build_by_algorithm(c: &mut Criterion) {
    print_benchmark_header("Index construction by algorithm");

    let (data_raw, _) = dataset();
    let data = Dataset::from_array(data_raw.view()).unwrap();

    let mut group = c.benchmark_group("build");
    group
        .sample_size(10)
        .measurement_time(Duration::from_secs(20))
        .warm_up_time(Duration::from_secs(1));

    for (name, config) in configs() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &config, |b, config| {
            b.iter(|| {
                let mut index = init_with_config(data, config.clone()).unwrap();
                build(&mut index).unwrap()
            })
        });
    }
    group.finish();
}

pub fn cluster_centers(c: &mut Criterion) {
    print_benchmark_header("k-means cluster centers");

    let (data_raw, _) = dataset();
    let data = Dataset::from_array(data_raw.view()).unwrap();
    let config = Config::new(Algorithm::KMeans).with_seed(3);

    let mut group = c.benchmark_group("cluster_centers");
    group.sample_size(10);
    for clusters in [32, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(clusters), &clusters, |b, &clusters| {
            b.iter(|| compute_cluster_centers(data, clusters, &config).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, build_by_algorithm, cluster_centers);
criterion_main!(benches);
