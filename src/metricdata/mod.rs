use std::fmt::Debug;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::core::{IndexError, Result};

pub mod distance;

pub use self::distance::{distance_type, set_distance_type, Metric};

/// Scalar types a dataset can be made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    Int8,
    UInt8,
    Int32,
    Float32,
    Float64,
}

impl ElementType {
    /// Width of one coordinate in bits.
    pub fn bits(&self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 8,
            ElementType::Int32 | ElementType::Float32 => 32,
            ElementType::Float64 => 64,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, ElementType::Float32 | ElementType::Float64)
    }
}

/// A coordinate of a point. Distances are always accumulated in `f64`.
pub trait Element: Copy + Send + Sync + PartialEq + Debug + 'static {
    const ELEMENT_TYPE: ElementType;

    fn to_f64(self) -> f64;

    /// Raw bit pattern, zero extended to 64 bits.
    fn to_bits(self) -> u64;
}

impl Element for i8 {
    const ELEMENT_TYPE: ElementType = ElementType::Int8;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn to_bits(self) -> u64 {
        self as u8 as u64
    }
}

impl Element for u8 {
    const ELEMENT_TYPE: ElementType = ElementType::UInt8;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn to_bits(self) -> u64 {
        self as u64
    }
}

impl Element for i32 {
    const ELEMENT_TYPE: ElementType = ElementType::Int32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn to_bits(self) -> u64 {
        self as u32 as u64
    }
}

impl Element for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::Float32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn to_bits(self) -> u64 {
        f32::to_bits(self) as u64
    }
}

impl Element for f64 {
    const ELEMENT_TYPE: ElementType = ElementType::Float64;

    fn to_f64(self) -> f64 {
        self
    }

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }
}

/// Non-owning, row-major view over a dataset.
///
/// The buffer is borrowed for `'a`, so an index built over a `Dataset` can
/// never outlive the points it refers to.
#[derive(Debug, Clone, Copy)]
pub struct Dataset<'a, T: Element> {
    data: &'a [T],
    rows: usize,
    cols: usize,
}

impl<'a, T: Element> Dataset<'a, T> {
    /// Wraps a contiguous buffer of `rows * cols` elements.
    ///
    /// # Errors
    /// Returns `IndexError::DataError` if the buffer length does not match the shape
    /// or if `cols` is zero.
    pub fn new(data: &'a [T], rows: usize, cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(IndexError::DataError("points must have at least one dimension".to_string()));
        }
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(IndexError::DataError(format!(
                "buffer of {} elements does not hold {} x {} points",
                data.len(),
                rows,
                cols
            )));
        }

        Ok(Self { data, rows, cols })
    }

    /// Wraps a two dimensional array view without copying it.
    ///
    /// # Errors
    /// Returns `IndexError::DataError` if the view is not in standard (row-major, contiguous) layout.
    pub fn from_array(view: ArrayView2<'a, T>) -> Result<Self> {
        let (rows, cols) = view.dim();
        let data = view
            .to_slice()
            .ok_or_else(|| IndexError::DataError("array must be contiguous and row-major".to_string()))?;

        Self::new(data, rows, cols)
    }

    pub fn num_points(&self) -> usize {
        self.rows
    }

    pub fn dimensions(&self) -> usize {
        self.cols
    }

    pub fn element_type(&self) -> ElementType {
        T::ELEMENT_TYPE
    }

    pub fn get_point(&self, i: usize) -> &'a [T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    pub fn points(&self) -> impl Iterator<Item = &'a [T]> {
        self.data.chunks_exact(self.cols)
    }

    /// Copies the given rows into a new row-major buffer.
    pub fn select(&self, indices: &[usize]) -> Vec<T> {
        let mut out = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            out.extend_from_slice(self.get_point(i));
        }
        out
    }

    /// Size of the raw point buffer in bytes.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of_val(self.data)
    }
}
