//! Restriction and prolongation between two adjacent levels.
//!
//! A voxel at depth `d + 1` has exactly one parent at depth `d`, obtained by
//! halving its coordinates (rounding towards negative infinity). The two
//! operators below are transposes of each other: `<prolong(x), y> == <x, restrict(y)>`.

use crate::hgrid::HGrid;
use crate::{Error, Result};
use na::{vector, Point3};
use rayon::prelude::*;
use std::ops::AddAssign;

/// The parent of `cell`, one level coarser.
pub fn parent_cell(cell: &Point3<i64>) -> Point3<i64> {
    cell.map(|e| e >> 1)
}

/// The child of `cell` in the given octant, one level finer.
///
/// Bit 0 of `octant` is the x offset, bit 1 the y offset, bit 2 the z offset.
pub fn child_cell(cell: &Point3<i64>, octant: u8) -> Point3<i64> {
    let shift = vector![
        (octant & 1) as i64,
        ((octant >> 1) & 1) as i64,
        ((octant >> 2) & 1) as i64
    ];
    cell.map(|e| e * 2) + shift
}

/// Child-to-parent index map between two adjacent levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelTransfer {
    parents: Vec<usize>,
    coarse_len: usize,
}

impl LevelTransfer {
    /// Links every cell of `fine` (at depth `fine_depth`) to its parent in `coarse`.
    ///
    /// Fails with [`Error::NotFound`] if a parent is not occupied in `coarse`.
    pub fn new(coarse: &HGrid, fine: &HGrid, fine_depth: usize) -> Result<Self> {
        let parents = fine
            .cells()
            .par_iter()
            .map(|cell| {
                let parent = parent_cell(cell);
                coarse.get(&parent).ok_or(Error::NotFound {
                    depth: fine_depth.saturating_sub(1),
                    coord: parent.coords.into(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            parents,
            coarse_len: coarse.len(),
        })
    }

    /// Dense index of the parent of the fine cell `fine_id`.
    pub fn parent(&self, fine_id: usize) -> usize {
        self.parents[fine_id]
    }

    /// Number of cells on the fine side.
    pub fn fine_len(&self) -> usize {
        self.parents.len()
    }

    /// Number of cells on the coarse side.
    pub fn coarse_len(&self) -> usize {
        self.coarse_len
    }

    /// Accumulates each fine value into its parent.
    pub fn restrict<T>(&self, fine_values: &[T]) -> Result<Vec<T>>
    where
        T: Copy + Default + AddAssign,
    {
        if fine_values.len() != self.parents.len() {
            return Err(Error::LengthMismatch {
                what: "restricted buffer",
                expected: self.parents.len(),
                got: fine_values.len(),
            });
        }

        let mut result = vec![T::default(); self.coarse_len];
        for (parent, val) in self.parents.iter().zip(fine_values.iter()) {
            result[*parent] += *val;
        }
        Ok(result)
    }

    /// Copies each coarse value to all its children.
    pub fn prolong<T>(&self, coarse_values: &[T]) -> Result<Vec<T>>
    where
        T: Copy + Send + Sync,
    {
        if coarse_values.len() != self.coarse_len {
            return Err(Error::LengthMismatch {
                what: "prolonged buffer",
                expected: self.coarse_len,
                got: coarse_values.len(),
            });
        }

        Ok(self
            .parents
            .par_iter()
            .map(|parent| coarse_values[*parent])
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::{child_cell, parent_cell, LevelTransfer};
    use crate::hgrid::HGrid;
    use crate::Error;
    use na::point;

    #[test]
    fn parent_is_arithmetic_for_negative_coords() {
        assert_eq!(parent_cell(&point![-1, -2, -3]), point![-1, -1, -2]);
        assert_eq!(parent_cell(&point![3, 0, 1]), point![1, 0, 0]);

        for octant in 0..8 {
            let cell = point![-3, 4, -1];
            assert_eq!(parent_cell(&child_cell(&cell, octant)), cell);
        }
    }

    #[test]
    fn restrict_is_the_transpose_of_prolong() {
        let coarse = HGrid::from_cells(2.0, [point![0, 0, 0], point![-1, 0, 0]]);
        let fine = HGrid::from_cells(
            1.0,
            [
                point![0, 0, 0],
                point![1, 1, 0],
                point![-1, 0, 0],
                point![-2, 1, 1],
                point![1, 0, 1],
            ],
        );
        let transfer = LevelTransfer::new(&coarse, &fine, 1).unwrap();

        let x = [1.5, -2.0];
        let y = [0.5, 1.0, 3.0, -1.0, 2.0];
        let px = transfer.prolong(&x).unwrap();
        let ry = transfer.restrict(&y).unwrap();

        let lhs: f64 = px.iter().zip(y.iter()).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(ry.iter()).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1.0e-12);
        assert_eq!(ry, vec![3.5, 2.0]);
    }

    #[test]
    fn missing_parent_is_reported() {
        let coarse = HGrid::from_cells(2.0, [point![0, 0, 0]]);
        let fine = HGrid::from_cells(1.0, [point![4, 0, 0]]);
        assert!(matches!(
            LevelTransfer::new(&coarse, &fine, 3),
            Err(Error::NotFound { depth: 2, .. })
        ));
    }
}
