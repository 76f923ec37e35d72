use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::Element;

/// Distance functions understood by every index.
///
/// Euclidean and Minkowski are left un-rooted: the ordering of neighbors is the same
/// and the root is never needed to compare distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared L2 distance
    Euclidean,
    /// L1 distance
    Manhattan,
    /// Sum of `|a - b|^p` for the given order `p`
    Minkowski(f64),
    /// Histogram intersection `sum(min(a, b))`, a similarity rather than a metric
    HistIntersection,
    /// Squared Hellinger distance. Negative coordinates are treated as zero.
    Hellinger,
    ChiSquare,
    KullbackLeibler,
    /// Number of differing bits in the raw representation
    Hamming,
}

static DEFAULT_METRIC: RwLock<Metric> = RwLock::new(Metric::Euclidean);

/// Sets the process-wide metric picked up by `Config::default()`.
///
/// Indexes that were already configured keep the metric stored in their configuration;
/// rebuild them to switch.
pub fn set_distance_type(metric: Metric) {
    let mut guard = DEFAULT_METRIC.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = metric;
}

/// Returns the process-wide default metric.
pub fn distance_type() -> Metric {
    *DEFAULT_METRIC.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Metric {
    fn default() -> Self {
        distance_type()
    }
}

impl Metric {
    /// Distance between two points of possibly different element types.
    pub fn distance<A: Element, B: Element>(&self, a: &[A], b: &[B]) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        let pairs = a.iter().zip(b.iter());

        match *self {
            Metric::Euclidean => pairs
                .map(|(&x, &y)| {
                    let d = x.to_f64() - y.to_f64();
                    d * d
                })
                .sum(),
            Metric::Manhattan => pairs.map(|(&x, &y)| (x.to_f64() - y.to_f64()).abs()).sum(),
            Metric::Minkowski(order) => pairs
                .map(|(&x, &y)| (x.to_f64() - y.to_f64()).abs().powf(order))
                .sum(),
            Metric::HistIntersection => pairs.map(|(&x, &y)| x.to_f64().min(y.to_f64())).sum(),
            Metric::Hellinger => pairs
                .map(|(&x, &y)| {
                    let d = x.to_f64().max(0.0).sqrt() - y.to_f64().max(0.0).sqrt();
                    d * d
                })
                .sum(),
            Metric::ChiSquare => pairs.map(|(&x, &y)| chi_square_term(x.to_f64(), y.to_f64())).sum(),
            Metric::KullbackLeibler => pairs
                .map(|(&x, &y)| kl_term(x.to_f64(), y.to_f64()))
                .sum(),
            Metric::Hamming => {
                let mask = bit_mask(A::ELEMENT_TYPE.bits().min(B::ELEMENT_TYPE.bits()));
                pairs
                    .map(|(&x, &y)| ((x.to_bits() ^ y.to_bits()) & mask).count_ones() as f64)
                    .sum()
            }
        }
    }

    /// Contribution of a single coordinate pair to the distance.
    ///
    /// Used by the k-d trees as a lower bound on the distance to every point behind a
    /// splitting plane, so it returns zero for metrics that do not decompose into
    /// non-negative, monotone per-dimension terms.
    pub fn accum_dist(&self, a: f64, b: f64) -> f64 {
        match *self {
            Metric::Euclidean => (a - b) * (a - b),
            Metric::Manhattan => (a - b).abs(),
            Metric::Minkowski(order) => (a - b).abs().powf(order),
            Metric::Hellinger => {
                let d = a.max(0.0).sqrt() - b.max(0.0).sqrt();
                d * d
            }
            Metric::HistIntersection | Metric::ChiSquare | Metric::KullbackLeibler | Metric::Hamming => 0.0,
        }
    }

    /// Whether the triangle inequality holds, which the k-means tree relies on to prune
    /// whole clusters.
    pub fn supports_ball_pruning(&self) -> bool {
        matches!(self, Metric::Euclidean)
    }

    pub fn is_hamming(&self) -> bool {
        matches!(self, Metric::Hamming)
    }
}

fn chi_square_term(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum > 0.0 {
        let diff = a - b;
        diff * diff / sum
    } else {
        0.0
    }
}

fn kl_term(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        return 0.0;
    }
    let ratio = a / b;
    if ratio > 0.0 {
        a * ratio.ln()
    } else {
        0.0
    }
}

fn bit_mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_euclidean_is_squared() {
        let a = [0.0f32, 0.0];
        let b = [3.0f32, 4.0];
        assert!((Metric::Euclidean.distance(&a, &b) - 25.0).abs() < EPS);
    }

    #[test]
    fn test_byte_inputs_do_not_overflow() {
        let a = [0u8; 64];
        let b = [255u8; 64];
        let expected = 64.0 * 255.0 * 255.0;
        assert!((Metric::Euclidean.distance(&a, &b) - expected).abs() < EPS);
    }

    #[test]
    fn test_manhattan_and_minkowski() {
        let a = [1i32, -2, 3];
        let b = [4i32, 2, 3];
        assert!((Metric::Manhattan.distance(&a, &b) - 7.0).abs() < EPS);
        assert!((Metric::Minkowski(3.0).distance(&a, &b) - (27.0 + 64.0)).abs() < EPS);
        assert!((Metric::Minkowski(2.0).distance(&a, &b) - Metric::Euclidean.distance(&a, &b)).abs() < EPS);
    }

    #[test]
    fn test_histogram_metrics() {
        let a = [0.2f64, 0.5, 0.3];
        let b = [0.4f64, 0.4, 0.2];

        assert!((Metric::HistIntersection.distance(&a, &b) - 0.8).abs() < EPS);

        let hellinger: f64 = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x.sqrt() - y.sqrt()).powi(2))
            .sum();
        assert!((Metric::Hellinger.distance(&a, &b) - hellinger).abs() < EPS);

        let chi = 0.04 / 0.6 + 0.01 / 0.9 + 0.01 / 0.5;
        assert!((Metric::ChiSquare.distance(&a, &b) - chi).abs() < EPS);

        let kl = 0.2 * (0.5f64).ln() + 0.5 * (1.25f64).ln() + 0.3 * (1.5f64).ln();
        assert!((Metric::KullbackLeibler.distance(&a, &b) - kl).abs() < EPS);
    }

    #[test]
    fn test_zero_terms_are_skipped() {
        let a = [0.0f64, 1.0];
        let b = [0.0f64, 0.0];
        assert_eq!(Metric::ChiSquare.distance(&a, &b), 1.0);
        assert_eq!(Metric::KullbackLeibler.distance(&a, &b), 0.0);
    }

    #[test]
    fn test_hamming_counts_bits() {
        let a = [0b1010_1010u8, 0xff];
        let b = [0b0101_0101u8, 0xff];
        assert_eq!(Metric::Hamming.distance(&a, &b), 8.0);

        let c = [-1i8];
        let d = [0i8];
        assert_eq!(Metric::Hamming.distance(&c, &d), 8.0);
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_identity() {
        let a = [1.5f32, -2.0, 0.25];
        let b = [0.5f32, 4.0, 1.0];
        for metric in [
            Metric::Euclidean,
            Metric::Manhattan,
            Metric::Minkowski(3.0),
            Metric::Hamming,
        ] {
            assert!((metric.distance(&a, &b) - metric.distance(&b, &a)).abs() < EPS);
            assert_eq!(metric.distance(&a, &a), 0.0);
        }
    }

    #[test]
    fn test_mixed_element_types() {
        let point = [1u8, 2, 3];
        let center = [1.5f64, 2.0, 2.0];
        assert!((Metric::Euclidean.distance(&point, &center) - 1.25).abs() < EPS);
    }

    #[test]
    fn test_accum_dist_is_lower_bound() {
        let query = [0.3f64, 0.9];
        let point = [0.8f64, 0.1];
        for metric in [Metric::Euclidean, Metric::Manhattan, Metric::Hellinger, Metric::ChiSquare] {
            let partial = metric.accum_dist(query[0], point[0]);
            assert!(partial <= metric.distance(&query, &point) + EPS);
        }
        assert_eq!(Metric::Hamming.accum_dist(1.0, 0.0), 0.0);
    }

    #[test]
    fn test_metric_serde_names() {
        let json = serde_json::to_string(&Metric::ChiSquare).unwrap();
        assert_eq!(json, "\"chi_square\"");
        let minkowski: Metric = serde_json::from_str("{\"minkowski\":4.0}").unwrap();
        assert_eq!(minkowski, Metric::Minkowski(4.0));
    }
}
