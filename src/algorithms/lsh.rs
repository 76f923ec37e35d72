use std::collections::HashMap;

use log::debug;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

use crate::core::config::LshParams;
use crate::core::heap::ResultSet;
use crate::core::{IndexError, Result};
use crate::metricdata::{Dataset, Element, ElementType};

use super::{QueryContext, SearchScratch};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LshTable {
    /// Positions of the point bits that form the key, least significant key bit first
    bits: Vec<usize>,
    buckets: HashMap<u32, Vec<usize>>,
}

/// Multi-table, multi-probe locality sensitive hashing over the raw bits of the points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LshIndex {
    tables: Vec<LshTable>,
    /// Every key perturbation probed at search time, starting with the unperturbed key
    xor_masks: Vec<u32>,
    element_bits: usize,
}

impl LshTable {
    fn key<T: Element>(&self, point: &[T], element_bits: usize) -> u32 {
        self.bits.iter().enumerate().fold(0u32, |key, (pos, &bit)| {
            let value = point[bit / element_bits].to_bits();
            key | ((((value >> (bit % element_bits)) & 1) as u32) << pos)
        })
    }
}

impl LshIndex {
    pub(crate) fn build<T: Element>(data: Dataset<'_, T>, params: &LshParams, rng: &mut StdRng) -> Result<(Self, usize)> {
        let element_type = T::ELEMENT_TYPE;
        if element_type.is_floating_point() {
            return Err(IndexError::UnsupportedType(format!(
                "LSH needs binary data, got {:?}",
                element_type
            )));
        }

        let element_bits = element_type.bits();
        let total_bits = data.dimensions() * element_bits;
        if params.key_size > total_bits || params.key_size > 32 {
            return Err(IndexError::ConfigError(format!(
                "key size {} larger than the {} bits of a point",
                params.key_size, total_bits
            )));
        }

        let mut tables = Vec::with_capacity(params.table_number);
        for _ in 0..params.table_number {
            let bits = sample(rng, total_bits, params.key_size).into_vec();
            let mut table = LshTable {
                bits,
                buckets: HashMap::new(),
            };
            for (i, point) in data.points().enumerate() {
                let key = table.key(point, element_bits);
                let bucket = table.buckets.entry(key).or_default();
                bucket.try_reserve(1)?;
                bucket.push(i);
            }
            tables.push(table);
        }

        let level = params.multi_probe_level.min(params.key_size);
        let mut xor_masks = Vec::new();
        fill_xor_mask(0, params.key_size, level, &mut xor_masks);

        debug!(
            "Built LSH index with {} tables of {}-bit keys, {} probes per table",
            tables.len(),
            params.key_size,
            xor_masks.len()
        );

        let cost = params.table_number * data.num_points();
        Ok((
            LshIndex {
                tables,
                xor_masks,
                element_bits,
            },
            cost,
        ))
    }

    /// Probes every table around the query's key. The check budget does not apply.
    pub(crate) fn find_neighbors<T: Element, R: ResultSet>(
        &self,
        ctx: &QueryContext<'_, T>,
        query: &[T],
        result: &mut R,
        scratch: &mut SearchScratch,
    ) {
        for table in &self.tables {
            let key = table.key(query, self.element_bits);
            for &mask in &self.xor_masks {
                let Some(bucket) = table.buckets.get(&(key ^ mask)) else {
                    continue;
                };
                for &point in bucket {
                    if scratch.mark(point) {
                        let distance = ctx.point_distance(point, query, scratch);
                        result.add_point(distance, point);
                    }
                }
            }
        }
    }

    /// Expected number of colliding points, assuming keys spread evenly over the buckets.
    pub(crate) fn expected_visits(&self, rows: f64) -> f64 {
        let per_table: f64 = self
            .tables
            .iter()
            .map(|t| rows / t.buckets.len().max(1) as f64)
            .sum();
        (per_table * self.xor_masks.len() as f64).min(rows)
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.tables
            .iter()
            .map(|t| {
                t.bits.capacity() * std::mem::size_of::<usize>()
                    + t.buckets
                        .values()
                        .map(|b| std::mem::size_of::<u32>() + b.capacity() * std::mem::size_of::<usize>())
                        .sum::<usize>()
            })
            .sum::<usize>()
            + self.xor_masks.capacity() * std::mem::size_of::<u32>()
    }

    pub(crate) fn check_integrity(&self, rows: usize, cols: usize, element_type: ElementType) -> std::result::Result<(), String> {
        if element_type.is_floating_point() || self.element_bits != element_type.bits() {
            return Err(format!(
                "LSH index hashes {}-bit elements, dataset holds {:?}",
                self.element_bits, element_type
            ));
        }

        let key_size = self.tables.first().map_or(0, |t| t.bits.len());
        if key_size > 32 {
            return Err(format!("LSH key size {} exceeds 32 bits", key_size));
        }
        let total_bits = cols * self.element_bits;
        for table in &self.tables {
            if table.bits.len() != key_size {
                return Err("LSH tables use different key sizes".to_string());
            }
            if table.bits.iter().any(|&b| b >= total_bits) {
                return Err("LSH key bit outside of the point".to_string());
            }
            if table.buckets.values().flatten().any(|&p| p >= rows) {
                return Err("LSH bucket references a missing point".to_string());
            }
        }
        if self.xor_masks.iter().any(|&m| u64::from(m) >= 1u64 << key_size) {
            return Err("LSH probe mask wider than the key".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
impl LshIndex {
    pub(crate) fn with_element_bits(mut self, element_bits: usize) -> Self {
        self.element_bits = element_bits;
        self
    }
}

/// Collects every mask of `lowest_index` bits with at most `level` bits set.
fn fill_xor_mask(key: u32, lowest_index: usize, level: usize, masks: &mut Vec<u32>) {
    masks.push(key);
    if level == 0 {
        return;
    }
    for index in (0..lowest_index).rev() {
        fill_xor_mask(key | (1 << index), index, level - 1, masks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::test_utils::{knn, sorted_neighbors};
    use crate::algorithms::{make_rng, NnIndex};
    use crate::metricdata::Metric;
    use rand::{Rng, SeedableRng};

    fn binary_points(rows: usize, cols: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..rows * cols).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_xor_masks() {
        let mut masks = Vec::new();
        fill_xor_mask(0, 4, 2, &mut masks);
        // 1 + 4 + 6 masks
        assert_eq!(masks.len(), 11);
        assert_eq!(masks[0], 0);
        assert!(masks.iter().all(|m| m.count_ones() <= 2 && *m < 16));

        let mut sorted = masks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), masks.len());
    }

    #[test]
    fn test_float_data_is_rejected() {
        let buffer = vec![0.5f32; 20];
        let data = Dataset::new(&buffer, 10, 2).unwrap();
        let result = LshIndex::build(data, &LshParams::default(), &mut make_rng(Some(1)));
        assert!(matches!(result, Err(IndexError::UnsupportedType(_))));
    }

    #[test]
    fn test_key_size_larger_than_point() {
        let buffer = vec![1u8; 10];
        let data = Dataset::new(&buffer, 10, 1).unwrap();
        let params = LshParams {
            key_size: 9,
            ..LshParams::default()
        };
        let result = LshIndex::build(data, &params, &mut make_rng(Some(1)));
        assert!(matches!(result, Err(IndexError::ConfigError(_))));
    }

    #[test]
    fn test_every_point_finds_itself() {
        let buffer = binary_points(500, 8, 51);
        let data = Dataset::new(&buffer, 500, 8).unwrap();
        let (lsh, _) = LshIndex::build(data, &LshParams::default(), &mut make_rng(Some(2))).unwrap();
        assert!(lsh.check_integrity(500, 8, ElementType::UInt8).is_ok());
        let index = NnIndex::Lsh(lsh);

        for i in (0..500).step_by(25) {
            let found = knn(&index, data, Metric::Hamming, data.get_point(i), 1, 1);
            assert_eq!(found[0].0, 0.0);
        }
    }

    #[test]
    fn test_near_duplicates_are_found() {
        let mut buffer = binary_points(300, 4, 52);
        // point 300 differs from point 7 in a single bit
        let mut twin = buffer[7 * 4..8 * 4].to_vec();
        twin[2] ^= 0b0000_0100;
        buffer.extend_from_slice(&twin);
        let data = Dataset::new(&buffer, 301, 4).unwrap();

        let params = LshParams {
            table_number: 6,
            key_size: 12,
            multi_probe_level: 1,
        };
        let (lsh, _) = LshIndex::build(data, &params, &mut make_rng(Some(3))).unwrap();
        let index = NnIndex::Lsh(lsh);

        let found = knn(&index, data, Metric::Hamming, data.get_point(300), 2, 1);
        let expected = sorted_neighbors(&data, data.get_point(300), 2, Metric::Hamming);
        assert_eq!(found, expected);
    }

    #[test]
    fn test_integrity_checks_hashing_layout() {
        let buffer = binary_points(100, 2, 53);
        let data = Dataset::new(&buffer, 100, 2).unwrap();
        let params = LshParams {
            table_number: 2,
            key_size: 16,
            multi_probe_level: 2,
        };
        let (lsh, _) = LshIndex::build(data, &params, &mut make_rng(Some(4))).unwrap();
        assert!(lsh.check_integrity(100, 2, ElementType::UInt8).is_ok());
        assert!(lsh.check_integrity(100, 2, ElementType::Float32).is_err());
        assert!(lsh.check_integrity(100, 2, ElementType::Int32).is_err());

        assert!(lsh.clone().with_element_bits(1).check_integrity(100, 2, ElementType::UInt8).is_err());
        assert!(lsh.clone().with_element_bits(0).check_integrity(100, 2, ElementType::UInt8).is_err());

        let mut wide_mask = lsh.clone();
        wide_mask.xor_masks.push(1 << 16);
        assert!(wide_mask.check_integrity(100, 2, ElementType::UInt8).is_err());

        let mut uneven = lsh;
        uneven.tables[1].bits.pop();
        assert!(uneven.check_integrity(100, 2, ElementType::UInt8).is_err());
    }
}
