use rflann::core::config::Algorithm;
use rflann::core::Config;
use rflann::metricdata::Dataset;
use rflann::{distance_type, set_distance_type, Metric};

// The process-wide metric is global, so everything touching it lives in a single test.
#[test]
fn test_default_metric_only_affects_new_indexes() {
    assert_eq!(distance_type(), Metric::Euclidean);

    let points = vec![0.0f32, 0.0, 3.0, 4.0, 1.0, 1.0];
    let data = Dataset::new(&points, 3, 2).unwrap();
    let mut euclidean = rflann::init_with_config(data, Config::new(Algorithm::Linear)).unwrap();
    euclidean.build().unwrap();

    set_distance_type(Metric::Manhattan);
    assert_eq!(distance_type(), Metric::Manhattan);
    assert_eq!(Config::default().metric, Metric::Manhattan);

    let mut manhattan = rflann::init_with_config(data, Config::new(Algorithm::Linear)).unwrap();
    let query = [3.0f32, 3.0];

    // existing indexes keep the metric they were configured with
    let a = rflann::search(&mut euclidean, &query, 1).unwrap();
    assert_eq!(a, vec![(1.0, 1)]);
    let b = rflann::search(&mut manhattan, &query, 1).unwrap();
    assert_eq!(b, vec![(1.0, 1)]);

    let far = [0.0f32, 2.5];
    assert_eq!(rflann::search(&mut euclidean, &far, 1).unwrap(), vec![(2.25 + 1.0, 2)]);
    assert_eq!(rflann::search(&mut manhattan, &far, 1).unwrap(), vec![(2.5, 0)]);

    set_distance_type(Metric::Euclidean);
    assert_eq!(distance_type(), Metric::Euclidean);
}
