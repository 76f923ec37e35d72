use serde::{Deserialize, Serialize};

use crate::core::heap::ResultSet;
use crate::metricdata::Element;

use super::{QueryContext, SearchScratch};

/// Brute force scan over the whole dataset. Exact, and the baseline every other
/// structure is measured against.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) struct LinearIndex;

impl LinearIndex {
    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        for index in 0..ctx.data.num_points() {
            let distance = ctx.point_distance(index, query, scratch);
            result.add_point(distance, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::test_utils::{knn, random_points, sorted_neighbors};
    use crate::algorithms::NnIndex;
    use crate::metricdata::{Dataset, Metric};

    #[test]
    fn test_linear_matches_sorted_distances_for_every_metric() {
        let buffer = random_points(200, 8, 11);
        let data = Dataset::new(&buffer, 200, 8).unwrap();
        let queries = random_points(10, 8, 12);
        let index = NnIndex::Linear(LinearIndex);

        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Minkowski(3.0),
            Metric::HistIntersection,
            Metric::Hellinger,
            Metric::ChiSquare,
            Metric::KullbackLeibler,
            Metric::Hamming,
        ] {
            for query in queries.chunks_exact(8) {
                let expected = sorted_neighbors(&data, query, 7, metric);
                assert_eq!(knn(&index, data, metric, query, 7, 1), expected, "metric {:?}", metric);
            }
        }
    }

    #[test]
    fn test_linear_returns_fewer_than_k_when_dataset_is_small() {
        let buffer = vec![0u8, 0, 1, 1, 5, 5];
        let data = Dataset::new(&buffer, 3, 2).unwrap();
        let index = NnIndex::Linear(LinearIndex);

        let result = knn(&index, data, Metric::Euclidean, &[1, 1], 10, 1);
        assert_eq!(result, vec![(0.0, 1), (2.0, 0), (32.0, 2)]);
    }

    #[test]
    fn test_ties_are_broken_by_index() {
        let buffer = vec![1.0f64, -1.0, 2.0, -2.0];
        let data = Dataset::new(&buffer, 4, 1).unwrap();
        let index = NnIndex::Linear(LinearIndex);

        let result = knn(&index, data, Metric::Euclidean, &[0.0], 3, 1);
        assert_eq!(result, vec![(1.0, 0), (1.0, 1), (4.0, 2)]);
    }
}
