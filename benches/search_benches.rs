use std::time::Duration;

use criterion::{criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion, PlotConfiguration, Throughput};
use rflann::core::config::SearchParams;
use rflann::metricdata::{Dataset, Metric};
use rflann::utils::{compute_ground_truth, get_recall_values};
use rflann::{build, init_with_config};
use utils::{configs, create_progress_bar, dataset, print_benchmark_header, K};

mod utils;

pub fn search_by_algorithm(c: &mut Criterion) {
    print_benchmark_header("Batched k-NN search by algorithm");

    let (data_raw, queries) = dataset();
    let data = Dataset::from_array(data_raw.view()).unwrap();
    let query_set = Dataset::from_array(queries.view()).unwrap();
    let (_, ground_truth) = compute_ground_truth(&data, &query_set, K, Metric::Euclidean);

    let mut group = c.benchmark_group("search");
    group
        .sample_size(20)
        .measurement_time(Duration::from_secs(10))
        .warm_up_time(Duration::from_secs(1))
        .throughput(Throughput::Elements(queries.nrows() as u64));

    let configs = configs();
    let pb = create_progress_bar("building indexes".to_string(), configs.len() as u64);
    for (name, config) in configs {
        let mut index = init_with_config(data, config).unwrap();
        build(&mut index).unwrap();
        pb.inc(1);

        let result = index.knn_query(queries.view(), K, None).unwrap();
        let (recall, _, _) = get_recall_values(&ground_truth, &result.distances, K);
        println!("{}: recall {:.3}", name, recall);

        group.bench_function(BenchmarkId::new(name, queries.nrows()), |b| {
            b.iter(|| index.knn_query(queries.view(), K, None).unwrap())
        });
    }
    pb.finish_and_clear();
    group.finish();
}

pub fn search_by_checks(c: &mut Criterion) {
    print_benchmark_header("kd-forest search time against the check budget");

    let (data_raw, queries) = dataset();
    let data = Dataset::from_array(data_raw.view()).unwrap();
    let config = configs()
        .into_iter()
        .find(|(name, _)| *name == "kdtree")
        .map(|(_, config)| config)
        .unwrap();
    let mut index = init_with_config(data, config).unwrap();
    build(&mut index).unwrap();

    let plot_config = PlotConfiguration::default().summary_scale(AxisScale::Logarithmic);
    let mut group = c.benchmark_group("search_checks");
    group.plot_config(plot_config).sample_size(20);

    for checks in [16, 64, 256, 1024] {
        let params = SearchParams::new(checks);
        group.bench_with_input(BenchmarkId::from_parameter(checks), &params, |b, params| {
            b.iter(|| index.knn_query(queries.view(), K, Some(params)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, search_by_algorithm, search_by_checks);
criterion_main!(benches);
