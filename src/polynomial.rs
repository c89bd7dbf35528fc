//! Dense univariate polynomials, and piecewise polynomials on intervals.

use crate::Real;
use std::ops::{Div, Mul};

/// Maximum number of coefficients of the polynomials manipulated by the basis machinery.
///
/// Products of two quadratic pieces are quartic, and their primitive is quintic.
pub const POLY_COEFFS: usize = 6;

/// A polynomial with `N` coefficients, lowest degree first.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Polynomial<const N: usize> {
    /// `coeffs[i]` multiplies `x^i`.
    pub coeffs: [Real; N],
}

impl<const N: usize> Default for Polynomial<N> {
    fn default() -> Self {
        Self { coeffs: [0.0; N] }
    }
}

impl<const N: usize> Polynomial<N> {
    /// Evaluates the polynomial at `x`.
    pub fn eval(&self, x: Real) -> Real {
        let mut result = self.coeffs[N - 1];

        for i in (0..N - 1).rev() {
            result = result * x + self.coeffs[i];
        }

        result
    }

    #[must_use]
    /// The constant polynomial `cst`.
    pub fn constant(cst: Real) -> Self {
        let mut coeffs = [0.0; N];
        coeffs[0] = cst;
        Self { coeffs }
    }

    #[must_use]
    /// The polynomial `cst + x * X`.
    pub fn linear(cst: Real, x: Real) -> Self {
        let mut coeffs = [0.0; N];
        coeffs[0] = cst;
        coeffs[1] = x;
        Self { coeffs }
    }

    #[must_use]
    /// The polynomial `cst + x * X + xx * X²`.
    pub fn quadratic(cst: Real, x: Real, xx: Real) -> Self {
        let mut coeffs = [0.0; N];
        coeffs[0] = cst;
        coeffs[1] = x;
        coeffs[2] = xx;
        Self { coeffs }
    }

    #[must_use]
    /// The derivative of `self`.
    pub fn derivative(mut self) -> Self {
        for i in 0..N - 1 {
            self.coeffs[i] = self.coeffs[i + 1] * (i as Real + 1.0);
        }
        self.coeffs[N - 1] = 0.0;
        self
    }

    #[must_use]
    /// The primitive of `self` vanishing at 0.
    pub fn primitive(mut self) -> Self {
        assert_eq!(
            self.coeffs[N - 1],
            0.0,
            "Integration coefficient overflow. Increase the polynomial degree."
        );
        for i in (1..N).rev() {
            self.coeffs[i] = self.coeffs[i - 1] / (i as Real);
        }
        self.coeffs[0] = 0.0;
        self
    }

    /// Integral of this polynomial over `[start, end]`.
    pub fn integrate(self, start: Real, end: Real) -> Real {
        let primitive = self.primitive();
        primitive.eval(end) - primitive.eval(start)
    }

    /// Computes the polynomial representation of Q(x) = P((x - center) / width).
    #[must_use]
    pub fn scale_shift(self, center: Real, width: Real) -> Self {
        let mut result = Self::default();
        // Coefficients of ((x - center) / width)^k, updated incrementally.
        let mut power = Self::constant(1.0);
        let step = Self::linear(-center / width, 1.0 / width);

        for k in 0..N {
            if self.coeffs[k] != 0.0 {
                for i in 0..N {
                    result.coeffs[i] += self.coeffs[k] * power.coeffs[i];
                }
            }

            if k + 1 < N {
                power = power.mul_truncated(step);
            }
        }

        result
    }

    // Product that silently drops the terms of degree >= N. Only used on the
    // powers of a linear term in `scale_shift`, whose high-order terms are
    // multiplied by a zero coefficient anyway.
    fn mul_truncated(self, rhs: Self) -> Self {
        let mut result = Self::default();
        for i in 0..N {
            for j in 0..N - i {
                result.coeffs[i + j] += self.coeffs[i] * rhs.coeffs[j];
            }
        }
        result
    }
}

impl<const N: usize> Div<Real> for Polynomial<N> {
    type Output = Self;
    fn div(mut self, rhs: Real) -> Self {
        for i in 0..N {
            self.coeffs[i] /= rhs;
        }
        self
    }
}

impl<const N: usize> Mul<Polynomial<N>> for Polynomial<N> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        let mut result = Self::default();
        for i in 0..N {
            for j in 0..N {
                let val = self.coeffs[i] * rhs.coeffs[j];
                if j + i >= N {
                    assert_eq!(
                        val, 0.0,
                        "The result of the product must have a degree smaller than N"
                    );
                } else {
                    result.coeffs[j + i] += self.coeffs[i] * rhs.coeffs[j];
                }
            }
        }
        result
    }
}

/// A polynomial restricted to the half-open interval `[start, end)`.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Piece {
    /// Start of the interval, included.
    pub start: Real,
    /// End of the interval, excluded.
    pub end: Real,
    /// The polynomial on `[start, end)`.
    pub poly: Polynomial<POLY_COEFFS>,
}

impl Piece {
    /// A piece equal to `poly` on `[start, end)`.
    pub fn new(start: Real, end: Real, poly: Polynomial<POLY_COEFFS>) -> Self {
        Self { start, end, poly }
    }

    #[must_use]
    /// The derivative of the piece, on the same interval.
    pub fn derivative(self) -> Self {
        Self {
            poly: self.poly.derivative(),
            ..self
        }
    }

    /// The piece of `x -> self((x - center) / width)`.
    #[must_use]
    pub fn scale_shift(self, center: Real, width: Real) -> Self {
        Self {
            start: center + self.start * width,
            end: center + self.end * width,
            poly: self.poly.scale_shift(center, width),
        }
    }
}

/// Integral of the product of two piecewise polynomials.
pub fn integrate_product(lhs: &[Piece], rhs: &[Piece]) -> Real {
    let mut result = 0.0;

    for p1 in lhs {
        for p2 in rhs {
            let start = p1.start.max(p2.start);
            let end = p1.end.min(p2.end);

            if end > start {
                result += (p1.poly * p2.poly).integrate(start, end);
            }
        }
    }

    result
}
