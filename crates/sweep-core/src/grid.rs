//! Mixed-radix enumeration of the parameter grid.
//!
//! Every combination of per-dimension candidate values is addressed by a
//! single linear index, decoded most-significant dimension first through
//! precomputed suffix products. The index <-> combination mapping is a
//! bijection, so a sweep can be resumed from nothing more than the last
//! recorded combination.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One tunable coefficient: its ordered candidate values plus the stable
/// cell keys the calculation surface uses for it. Value order is fixed for
/// the lifetime of a sweep; reordering invalidates previously recorded
/// indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// Input cell the driver writes candidate values into.
    pub cell: String,
    /// Reference cell that mirrors the committed input once the surface has
    /// recomputed.
    pub check_cell: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid has no dimensions")]
    NoDimensions,
    #[error("dimension '{name}' has no candidate values")]
    EmptyDimension { name: String },
    #[error("duplicate dimension name '{name}'")]
    DuplicateDimension { name: String },
    #[error("grid size overflows u64")]
    SizeOverflow,
    #[error("sweep index {index} out of range, grid holds {total} combinations")]
    IndexOutOfRange { index: u64, total: u64 },
    #[error("position {position} out of range for dimension '{name}' of size {size}")]
    PositionOutOfRange {
        name: String,
        position: usize,
        size: usize,
    },
    #[error("expected {expected} component positions, got {got}")]
    PositionCount { expected: usize, got: usize },
}

/// One full assignment across all dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Combination {
    pub index: u64,
    /// Component position per dimension, most-significant first.
    pub positions: Vec<usize>,
    /// Candidate value per dimension, parallel to `positions`.
    pub values: Vec<f64>,
}

/// The full parameter grid. Suffix products and the total combination count
/// are computed once at construction and reused for every step.
#[derive(Debug, Clone)]
pub struct Grid {
    dims: Vec<Dimension>,
    suffix: Vec<u64>,
    total: u64,
}

impl Grid {
    pub fn new(dims: Vec<Dimension>) -> Result<Self, GridError> {
        if dims.is_empty() {
            return Err(GridError::NoDimensions);
        }
        let mut seen = BTreeSet::new();
        for dim in &dims {
            if dim.values.is_empty() {
                return Err(GridError::EmptyDimension {
                    name: dim.name.clone(),
                });
            }
            if !seen.insert(dim.name.clone()) {
                return Err(GridError::DuplicateDimension {
                    name: dim.name.clone(),
                });
            }
        }
        let mut suffix = vec![1u64; dims.len()];
        for i in (0..dims.len() - 1).rev() {
            suffix[i] = suffix[i + 1]
                .checked_mul(dims[i + 1].values.len() as u64)
                .ok_or(GridError::SizeOverflow)?;
        }
        let total = suffix[0]
            .checked_mul(dims[0].values.len() as u64)
            .ok_or(GridError::SizeOverflow)?;
        Ok(Self {
            dims,
            suffix,
            total,
        })
    }

    pub fn total_count(&self) -> u64 {
        self.total
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dims
    }

    /// Decodes a linear sweep index into its combination.
    ///
    /// Pure: the same index against an unchanged grid always yields the same
    /// combination. An out-of-range index is a caller bug and is rejected,
    /// never clamped.
    pub fn decode(&self, index: u64) -> Result<Combination, GridError> {
        if index >= self.total {
            return Err(GridError::IndexOutOfRange {
                index,
                total: self.total,
            });
        }
        let mut positions = Vec::with_capacity(self.dims.len());
        let mut rem = index;
        for weight in &self.suffix {
            positions.push((rem / weight) as usize);
            rem %= weight;
        }
        let values = positions
            .iter()
            .zip(&self.dims)
            .map(|(&p, d)| d.values[p])
            .collect();
        Ok(Combination {
            index,
            positions,
            values,
        })
    }

    /// Left inverse of [`Grid::decode`]: recovers the linear index from
    /// component positions. The resume path uses this to turn the last
    /// recorded combination back into a sweep index.
    pub fn encode(&self, positions: &[usize]) -> Result<u64, GridError> {
        if positions.len() != self.dims.len() {
            return Err(GridError::PositionCount {
                expected: self.dims.len(),
                got: positions.len(),
            });
        }
        let mut index = 0u64;
        for ((&position, dim), weight) in positions.iter().zip(&self.dims).zip(&self.suffix) {
            if position >= dim.values.len() {
                return Err(GridError::PositionOutOfRange {
                    name: dim.name.clone(),
                    position,
                    size: dim.values.len(),
                });
            }
            index += position as u64 * weight;
        }
        Ok(index)
    }
}
