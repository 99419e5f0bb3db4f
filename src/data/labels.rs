//! Label hierarchy for CINIC-10
//!
//! This module provides:
//! - The fixed fine → coarse class mapping
//! - Selection of the primary target level
//! - Psi, the per-primary-class auxiliary split, and its softmax mask

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

/// CINIC-10 fine class → coarse group (vehicles, animals split by habitat)
const CINIC10_COARSE: [i64; 10] = [0, 1, 2, 2, 3, 2, 3, 4, 0, 1];

/// Fine and coarse labels of one batch
#[derive(Debug)]
pub struct LabelPair {
    /// Coarse group per sample
    pub coarse: Tensor,
    /// Original fine class per sample
    pub fine: Tensor,
}

/// Fixed deterministic mapping from fine classes to coarse groups
#[derive(Debug, Clone)]
pub struct CoarseMapping {
    table: Vec<i64>,
    num_coarse: i64,
}

impl CoarseMapping {
    /// The CINIC-10 mapping used for training
    pub fn cinic10() -> Self {
        Self::from_table(CINIC10_COARSE.to_vec())
    }

    fn from_table(table: Vec<i64>) -> Self {
        let num_coarse = table.iter().copied().max().map_or(0, |m| m + 1);
        Self { table, num_coarse }
    }

    /// Number of fine classes
    pub fn num_fine(&self) -> i64 {
        self.table.len() as i64
    }

    /// Number of coarse groups
    pub fn num_coarse(&self) -> i64 {
        self.num_coarse
    }

    /// Coarse group of a single fine class
    pub fn coarse_of(&self, fine: i64) -> Option<i64> {
        usize::try_from(fine)
            .ok()
            .and_then(|i| self.table.get(i))
            .copied()
    }

    /// Split a batch of raw fine labels into a label pair
    pub fn split(&self, raw: &Tensor) -> Result<LabelPair> {
        let table = Tensor::from_slice(&self.table).to_device(raw.device());
        let fine = raw.to_kind(Kind::Int64);
        let coarse = table.f_index_select(0, &fine)?;
        Ok(LabelPair { coarse, fine })
    }
}

/// Which label level acts as the primary task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryLevel {
    /// The 10 CINIC-10 classes
    #[default]
    Fine,
    /// The 5 coarse groups
    Coarse,
}

impl PrimaryLevel {
    /// Number of primary classes at this level
    pub fn num_classes(&self, mapping: &CoarseMapping) -> i64 {
        match self {
            PrimaryLevel::Fine => mapping.num_fine(),
            PrimaryLevel::Coarse => mapping.num_coarse(),
        }
    }

    /// Pick the primary target out of a label pair
    pub fn select<'a>(&self, labels: &'a LabelPair) -> &'a Tensor {
        match self {
            PrimaryLevel::Fine => &labels.fine,
            PrimaryLevel::Coarse => &labels.coarse,
        }
    }
}

/// Number of auxiliary sub-classes owned by each primary class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psi {
    counts: Vec<i64>,
    offsets: Vec<i64>,
}

impl Psi {
    /// Build a split, rejecting empty or non-positive entries
    pub fn new(counts: Vec<i64>) -> Result<Self> {
        if counts.is_empty() {
            return Err(Error::InvalidPsi("psi must not be empty".to_string()));
        }
        if let Some(bad) = counts.iter().find(|&&c| c <= 0) {
            return Err(Error::InvalidPsi(format!(
                "every primary class needs at least one auxiliary class, got {}",
                bad
            )));
        }

        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0;
        offsets.push(acc);
        for &c in &counts {
            acc += c;
            offsets.push(acc);
        }

        Ok(Self { counts, offsets })
    }

    /// The same number of auxiliary classes for every primary class
    pub fn uniform(num_primary: usize, per_class: i64) -> Result<Self> {
        Self::new(vec![per_class; num_primary])
    }

    /// Per-class counts
    pub fn counts(&self) -> &[i64] {
        &self.counts
    }

    /// Number of primary classes
    pub fn num_primary(&self) -> i64 {
        self.counts.len() as i64
    }

    /// Total number of auxiliary classes
    pub fn total(&self) -> i64 {
        self.offsets[self.counts.len()]
    }

    /// Auxiliary columns owned by primary class `class`
    pub fn range(&self, class: usize) -> Range<i64> {
        self.offsets[class]..self.offsets[class + 1]
    }

    /// Mask of shape (num_primary, total): 1 on owned columns, `epsilon` elsewhere
    pub fn mask(&self, epsilon: f64, device: Device) -> Tensor {
        let cols = self.total() as usize;
        let mut data = vec![epsilon as f32; self.counts.len() * cols];
        for class in 0..self.counts.len() {
            for col in self.range(class) {
                data[class * cols + col as usize] = 1.0;
            }
        }
        Tensor::from_slice(&data)
            .view([self.num_primary(), self.total()])
            .to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cinic10_mapping() {
        let mapping = CoarseMapping::cinic10();
        assert_eq!(mapping.num_fine(), 10);
        assert_eq!(mapping.num_coarse(), 5);
        assert_eq!(mapping.coarse_of(3), Some(2));
        assert_eq!(mapping.coarse_of(7), Some(4));
        assert_eq!(mapping.coarse_of(10), None);
        assert_eq!(mapping.coarse_of(-1), None);
    }

    #[test]
    fn test_split_batch() {
        let mapping = CoarseMapping::cinic10();
        let raw = Tensor::from_slice(&[0i64, 4, 9, 5]);
        let pair = mapping.split(&raw).unwrap();

        assert_eq!(Vec::<i64>::try_from(&pair.coarse).unwrap(), vec![0, 3, 1, 2]);
        assert_eq!(Vec::<i64>::try_from(&pair.fine).unwrap(), vec![0, 4, 9, 5]);
        assert_eq!(
            Vec::<i64>::try_from(PrimaryLevel::Coarse.select(&pair)).unwrap(),
            vec![0, 3, 1, 2]
        );
    }

    #[test]
    fn test_psi_totals() {
        let psi = Psi::uniform(10, 5).unwrap();
        assert_eq!(psi.num_primary(), 10);
        assert_eq!(psi.total(), 50);
        assert_eq!(psi.range(0), 0..5);
        assert_eq!(psi.range(9), 45..50);

        let uneven = Psi::new(vec![2, 3, 1]).unwrap();
        assert_eq!(uneven.total(), 6);
        assert_eq!(uneven.range(1), 2..5);
    }

    #[test]
    fn test_psi_rejects_invalid() {
        assert!(matches!(Psi::new(vec![]), Err(Error::InvalidPsi(_))));
        assert!(matches!(Psi::new(vec![5, 0, 5]), Err(Error::InvalidPsi(_))));
    }

    #[test]
    fn test_mask_blocks() {
        let psi = Psi::uniform(10, 5).unwrap();
        let mask = psi.mask(1e-8, Device::Cpu);
        assert_eq!(mask.size(), vec![10, 50]);

        let ones = mask.eq(1.0);
        // Each row owns exactly five columns
        let per_row = Vec::<i64>::try_from(&ones.sum_dim_intlist([1i64].as_slice(), false, Kind::Int64)).unwrap();
        assert_eq!(per_row, vec![5; 10]);
        // Each column is owned by exactly one row, so the blocks are disjoint and cover everything
        let per_col = Vec::<i64>::try_from(&ones.sum_dim_intlist([0i64].as_slice(), false, Kind::Int64)).unwrap();
        assert_eq!(per_col, vec![1; 50]);

        for row in 0..10i64 {
            for col in 0..50i64 {
                let value = mask.double_value(&[row, col]);
                if col / 5 == row {
                    assert_eq!(value, 1.0);
                } else {
                    assert!(value > 0.0 && value < 1e-7);
                }
            }
        }
    }
}
