use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::config::CentersInit;
use crate::metricdata::{Dataset, Element, Metric};

/// Two centers closer than this are considered the same point
const DUPLICATE_EPS: f64 = 1e-16;

/// Picks up to `k` distinct points of `indices` as initial cluster centers.
///
/// Returns fewer than `k` centers when the points do not contain `k` distinct values.
pub(crate) fn choose_centers<T: Element>(
    init: CentersInit,
    k: usize,
    data: &Dataset<'_, T>,
    indices: &[usize],
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<usize> {
    match init {
        CentersInit::Random => random_centers(k, data, indices, metric, rng),
        CentersInit::Gonzales => greedy_minimum_maximum(k, data, indices, metric, rng),
        CentersInit::KMeansPP => kmeans_pp(k, data, indices, metric, rng),
    }
}

fn random_centers<T: Element>(
    k: usize,
    data: &Dataset<'_, T>,
    indices: &[usize],
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let mut order: Vec<usize> = indices.to_vec();
    order.shuffle(rng);

    let mut centers: Vec<usize> = Vec::with_capacity(k);
    for candidate in order {
        if centers.len() == k {
            break;
        }
        let point = data.get_point(candidate);
        let duplicate = centers
            .iter()
            .any(|&c| metric.distance(data.get_point(c), point) < DUPLICATE_EPS);
        if !duplicate {
            centers.push(candidate);
        }
    }
    centers
}

fn argmax(v: &[f64]) -> usize {
    let mut i = 0;
    let mut m = v[i];
    for idx in 1..v.len() {
        if v[idx] > m {
            i = idx;
            m = v[idx];
        }
    }
    i
}

/// Gonzales' farthest-point heuristic: after a random first center, repeatedly picks the
/// point farthest from every center chosen so far.
fn greedy_minimum_maximum<T: Element>(
    k: usize,
    data: &Dataset<'_, T>,
    indices: &[usize],
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let n = indices.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }

    let first = indices[rng.gen_range(0..n)];
    let mut centers = vec![first];
    let mut distances: Vec<f64> = indices
        .iter()
        .map(|&i| metric.distance(data.get_point(first), data.get_point(i)))
        .collect();

    while centers.len() < k {
        let farthest = argmax(&distances);
        if distances[farthest] <= 0.0 {
            break;
        }
        let center = indices[farthest];
        centers.push(center);

        let center_point = data.get_point(center);
        for (d, &i) in distances.iter_mut().zip(indices) {
            let new_distance = metric.distance(center_point, data.get_point(i));
            if new_distance < *d {
                *d = new_distance;
            }
        }
    }

    centers
}

/// k-means++ seeding: every new center is sampled with probability proportional to its
/// distance to the closest center already chosen.
fn kmeans_pp<T: Element>(
    k: usize,
    data: &Dataset<'_, T>,
    indices: &[usize],
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let n = indices.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }

    let first = indices[rng.gen_range(0..n)];
    let mut centers = vec![first];
    let mut closest: Vec<f64> = indices
        .iter()
        .map(|&i| metric.distance(data.get_point(first), data.get_point(i)))
        .collect();
    let mut potential: f64 = closest.iter().sum();

    while centers.len() < k && potential > 0.0 {
        let mut target = rng.gen::<f64>() * potential;
        let mut chosen = None;
        for (pos, &weight) in closest.iter().enumerate() {
            if weight <= 0.0 {
                continue;
            }
            chosen = Some(pos);
            if target < weight {
                break;
            }
            target -= weight;
        }

        let Some(pos) = chosen else {
            break;
        };
        let center = indices[pos];
        centers.push(center);

        let center_point = data.get_point(center);
        potential = 0.0;
        for (c, &i) in closest.iter_mut().zip(indices) {
            let d = metric.distance(center_point, data.get_point(i));
            if d < *c {
                *c = d;
            }
            potential += *c;
        }
    }

    centers
}
