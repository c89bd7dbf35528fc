//! Compactly supported tensor-product basis functions.
//!
//! Every basis is centered at a voxel center and expressed in voxel units: a
//! displacement of `1.0` is one voxel width of the level the basis lives on.
//! The 1D profile is a uniform B-spline of degree 0 ([`BoxBasis`]), 1
//! ([`TentBasis`]) or 2 ([`BezierBasis`]), normalized to a partition of unity.

use crate::polynomial::{integrate_product, Piece, Polynomial};
use crate::{Error, Real};
use na::Vector3;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// The capability shared by every basis family.
pub trait BasisFunction {
    /// Half-width of the 1D support, in voxel units.
    fn support_radius(&self) -> Real;

    /// 1D profile value at the signed offset `x` from the basis center.
    fn weight_1d(&self, x: Real) -> Real;

    /// 1D profile derivative at the signed offset `x` from the basis center.
    fn derivative_1d(&self, x: Real) -> Real;

    /// The 1D profile as half-open polynomial pieces, centered at zero.
    fn pieces(&self) -> Vec<Piece>;

    /// Largest integer offset between two same-level basis centers whose supports overlap.
    fn stencil_radius(&self) -> i64 {
        (2.0 * self.support_radius()).ceil() as i64 - 1
    }

    /// Tensor-product value at the displacement `delta` (voxel units).
    fn weight(&self, delta: &Vector3<Real>) -> Real {
        self.weight_1d(delta.x) * self.weight_1d(delta.y) * self.weight_1d(delta.z)
    }

    /// Tensor-product gradient at the displacement `delta`, wrt. voxel units.
    ///
    /// Divide by the voxel width to obtain the gradient wrt. world units.
    fn gradient(&self, delta: &Vector3<Real>) -> Vector3<Real> {
        let val = delta.map(|e| self.weight_1d(e));
        let diff = delta.map(|e| self.derivative_1d(e));
        Vector3::new(
            diff.x * val.y * val.z,
            val.x * diff.y * val.z,
            val.x * val.y * diff.z,
        )
    }

    /// Range of the integer basis centers whose support contains the local coordinate `u`.
    ///
    /// `u` is expressed in voxel units relative to the center of voxel 0.
    fn support_range(&self, u: Real) -> RangeInclusive<i64> {
        let r = self.support_radius();
        ((u - r).floor() as i64 + 1)..=((u + r).floor() as i64)
    }

    /// Integrals between a basis and the basis `level_gap` levels coarser.
    fn integral_table(&self, level_gap: usize) -> IntegralTable {
        IntegralTable::new(&self.pieces(), self.support_radius(), level_gap)
    }
}

/// Degree-0 B-spline: the indicator of the voxel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BoxBasis;

/// Degree-1 B-spline: trilinear interpolation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TentBasis;

/// Degree-2 B-spline, the box function convolved twice with itself.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BezierBasis;

impl BasisFunction for BoxBasis {
    fn support_radius(&self) -> Real {
        0.5
    }

    fn weight_1d(&self, x: Real) -> Real {
        if (-0.5..0.5).contains(&x) {
            1.0
        } else {
            0.0
        }
    }

    fn derivative_1d(&self, _: Real) -> Real {
        0.0
    }

    fn pieces(&self) -> Vec<Piece> {
        vec![Piece::new(-0.5, 0.5, Polynomial::constant(1.0))]
    }
}

impl BasisFunction for TentBasis {
    fn support_radius(&self) -> Real {
        1.0
    }

    fn weight_1d(&self, x: Real) -> Real {
        (1.0 - x.abs()).max(0.0)
    }

    fn derivative_1d(&self, x: Real) -> Real {
        if (-1.0..0.0).contains(&x) {
            1.0
        } else if (0.0..1.0).contains(&x) {
            -1.0
        } else {
            0.0
        }
    }

    fn pieces(&self) -> Vec<Piece> {
        vec![
            Piece::new(-1.0, 0.0, Polynomial::linear(1.0, 1.0)),
            Piece::new(0.0, 1.0, Polynomial::linear(1.0, -1.0)),
        ]
    }
}

impl BasisFunction for BezierBasis {
    fn support_radius(&self) -> Real {
        1.5
    }

    fn weight_1d(&self, x: Real) -> Real {
        if x < -1.5 {
            0.0
        } else if x < -0.5 {
            0.5 * (x + 1.5) * (x + 1.5)
        } else if x < 0.5 {
            0.75 - x * x
        } else if x < 1.5 {
            0.5 * (x - 1.5) * (x - 1.5)
        } else {
            0.0
        }
    }

    fn derivative_1d(&self, x: Real) -> Real {
        if x < -1.5 {
            0.0
        } else if x < -0.5 {
            x + 1.5
        } else if x < 0.5 {
            -2.0 * x
        } else if x < 1.5 {
            x - 1.5
        } else {
            0.0
        }
    }

    fn pieces(&self) -> Vec<Piece> {
        vec![
            Piece::new(-1.5, -0.5, Polynomial::quadratic(1.125, 1.5, 0.5)),
            Piece::new(-0.5, 0.5, Polynomial::quadratic(0.75, 0.0, -1.0)),
            Piece::new(0.5, 1.5, Polynomial::quadratic(1.125, -1.5, 0.5)),
        ]
    }
}

/// The closed family of supported bases.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Basis {
    /// Nearest-voxel basis.
    Box(BoxBasis),
    /// Trilinear basis.
    Tent(TentBasis),
    /// Triquadratic B-spline basis.
    Bezier(BezierBasis),
}

impl Basis {
    /// The nearest-voxel basis.
    pub const BOX: Self = Basis::Box(BoxBasis);
    /// The trilinear basis.
    pub const TENT: Self = Basis::Tent(TentBasis);
    /// The triquadratic B-spline basis.
    pub const BEZIER: Self = Basis::Bezier(BezierBasis);

    fn inner(&self) -> &dyn BasisFunction {
        match self {
            Basis::Box(b) => b,
            Basis::Tent(b) => b,
            Basis::Bezier(b) => b,
        }
    }

    /// Polynomial degree of the 1D profile.
    pub fn degree(&self) -> usize {
        match self {
            Basis::Box(_) => 0,
            Basis::Tent(_) => 1,
            Basis::Bezier(_) => 2,
        }
    }
}

impl Default for Basis {
    fn default() -> Self {
        Self::BEZIER
    }
}

impl BasisFunction for Basis {
    fn support_radius(&self) -> Real {
        self.inner().support_radius()
    }

    fn weight_1d(&self, x: Real) -> Real {
        self.inner().weight_1d(x)
    }

    fn derivative_1d(&self, x: Real) -> Real {
        self.inner().derivative_1d(x)
    }

    fn pieces(&self) -> Vec<Piece> {
        self.inner().pieces()
    }
}

impl FromStr for Basis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "box" => Ok(Self::BOX),
            "tent" | "trilinear" => Ok(Self::TENT),
            "bezier" | "quadratic" => Ok(Self::BEZIER),
            other => Err(Error::InvalidConfig(format!("unknown basis `{other}`"))),
        }
    }
}

/// 1D integrals between a fine basis and a coarse basis at a given integer offset.
///
/// All quantities are expressed in fine voxel units; derivatives are taken
/// wrt. the fine voxel coordinate.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Integrals1d {
    /// `∫ B_fine B_coarse`
    pub value_value: Real,
    /// `∫ B_fine' B_coarse'`
    pub deriv_deriv: Real,
    /// `∫ B_fine B_coarse'`
    pub value_deriv: Real,
    /// `∫ B_fine' B_coarse`
    pub deriv_value: Real,
}

/// Lookup table of [`Integrals1d`] between a basis and the same basis `gap` levels coarser.
///
/// Entries are indexed by `o = c_fine - 2^gap * c_coarse` where `c_fine` and
/// `c_coarse` are the per-axis voxel coordinates on their respective levels.
#[derive(Clone, Debug, PartialEq)]
pub struct IntegralTable {
    gap: usize,
    scale: i64,
    offset_min: i64,
    entries: Vec<Integrals1d>,
}

impl IntegralTable {
    fn new(pieces: &[Piece], support_radius: Real, gap: usize) -> Self {
        let scale = 1i64 << gap;
        let s = scale as Real;
        let center_shift = (s - 1.0) / 2.0;
        let reach = support_radius * (1.0 + s);
        let offset_min = (center_shift - reach).floor() as i64;
        let offset_max = (center_shift + reach).ceil() as i64;

        let fine_diff: Vec<_> = pieces.iter().map(|p| p.derivative()).collect();

        let entries = (offset_min..=offset_max)
            .map(|o| {
                // Position of the coarse center, relative to the fine center.
                let delta = center_shift - o as Real;
                let coarse: Vec<_> = pieces.iter().map(|p| p.scale_shift(delta, s)).collect();
                let coarse_diff: Vec<_> = pieces
                    .iter()
                    .map(|p| {
                        let mut d = p.derivative().scale_shift(delta, s);
                        d.poly = d.poly / s;
                        d
                    })
                    .collect();

                Integrals1d {
                    value_value: integrate_product(pieces, &coarse),
                    deriv_deriv: integrate_product(&fine_diff, &coarse_diff),
                    value_deriv: integrate_product(pieces, &coarse_diff),
                    deriv_value: integrate_product(&fine_diff, &coarse),
                }
            })
            .collect();

        Self {
            gap,
            scale,
            offset_min,
            entries,
        }
    }

    /// Number of levels separating the fine and the coarse basis.
    pub fn gap(&self) -> usize {
        self.gap
    }

    /// `2^gap`: the number of fine voxels per coarse voxel along one axis.
    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// The offsets with a (potentially) non-zero entry.
    pub fn offsets(&self) -> RangeInclusive<i64> {
        self.offset_min..=(self.offset_min + self.entries.len() as i64 - 1)
    }

    /// The 1D integrals at offset `o`, or `None` if the supports don't overlap.
    pub fn get(&self, o: i64) -> Option<&Integrals1d> {
        let id = o - self.offset_min;
        if id < 0 {
            None
        } else {
            self.entries.get(id as usize)
        }
    }

    fn get3(&self, o: &Vector3<i64>) -> Option<[&Integrals1d; 3]> {
        Some([self.get(o.x)?, self.get(o.y)?, self.get(o.z)?])
    }

    /// `∫ ∇B_fine · ∇B_coarse` over unit fine voxels.
    ///
    /// Multiply by the fine voxel width to obtain the world-space integral.
    pub fn stiffness(&self, o: &Vector3<i64>) -> Real {
        match self.get3(o) {
            Some([x, y, z]) => {
                x.deriv_deriv * y.value_value * z.value_value
                    + x.value_value * y.deriv_deriv * z.value_value
                    + x.value_value * y.value_value * z.deriv_deriv
            }
            None => 0.0,
        }
    }

    /// `∫ B_fine B_coarse` over unit fine voxels.
    ///
    /// Multiply by the cube of the fine voxel width to obtain the world-space integral.
    pub fn mass(&self, o: &Vector3<i64>) -> Real {
        match self.get3(o) {
            Some([x, y, z]) => x.value_value * y.value_value * z.value_value,
            None => 0.0,
        }
    }

    /// `∫ (∇B_coarse · data) B_fine` over unit fine voxels.
    ///
    /// Multiply by the square of the fine voxel width to obtain the world-space integral.
    pub fn divergence(&self, o: &Vector3<i64>, data: &Vector3<Real>) -> Real {
        match self.get3(o) {
            Some([x, y, z]) => {
                data.x * x.value_deriv * y.value_value * z.value_value
                    + data.y * x.value_value * y.value_deriv * z.value_value
                    + data.z * x.value_value * y.value_value * z.value_deriv
            }
            None => 0.0,
        }
    }

    /// `∫ (∇B_fine · data) B_coarse` over unit fine voxels.
    ///
    /// Multiply by the square of the fine voxel width to obtain the world-space integral.
    pub fn divergence_fine(&self, o: &Vector3<i64>, data: &Vector3<Real>) -> Real {
        match self.get3(o) {
            Some([x, y, z]) => {
                data.x * x.deriv_value * y.value_value * z.value_value
                    + data.y * x.value_value * y.deriv_value * z.value_value
                    + data.z * x.value_value * y.value_value * z.deriv_value
            }
            None => 0.0,
        }
    }

    /// Coarse coordinates interacting with the fine coordinate `fine`, along one axis.
    pub fn coarse_range(&self, fine: i64) -> RangeInclusive<i64> {
        let (omin, omax) = self.offsets().into_inner();
        // ceil((fine - omax) / scale) ..= floor((fine - omin) / scale)
        let lo = -(omax - fine).div_euclid(self.scale);
        let hi = (fine - omin).div_euclid(self.scale);
        lo..=hi
    }

    /// Fine coordinates interacting with the coarse coordinate `coarse`, along one axis.
    #[cfg(test)]
    pub(crate) fn fine_range(&self, coarse: i64) -> RangeInclusive<i64> {
        let (omin, omax) = self.offsets().into_inner();
        (coarse * self.scale + omin)..=(coarse * self.scale + omax)
    }
}
