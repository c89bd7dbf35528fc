//! Sparse matrix-vector product and (preconditioned) conjugate gradient.

use crate::{Error, Real, Result};
use na::DVector;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

/// Summary of one conjugate-gradient run.
#[derive(Clone, Debug, PartialEq)]
pub struct CgOutcome {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Euclidean norm of the final residual `b - A x`.
    pub residual_norm: Real,
    /// Did the residual reach the tolerance before the iteration cap?
    pub converged: bool,
    /// Residual norm before the first iteration, then after each iteration.
    pub residual_history: Vec<Real>,
}

/// Computes `out = a * x`, one row per task.
///
/// The cost is proportional to the number of stored entries of `a`.
pub(crate) fn spmv(a: &CsrMatrix<Real>, x: &DVector<Real>, out: &mut DVector<Real>) {
    debug_assert_eq!(a.ncols(), x.len());
    debug_assert_eq!(a.nrows(), out.len());
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let vals = a.values();

    out.as_mut_slice()
        .par_iter_mut()
        .enumerate()
        .for_each(|(row, out)| {
            *out = (offsets[row]..offsets[row + 1])
                .map(|k| vals[k] * x[cols[k]])
                .sum();
        });
}

/// The inverse of the diagonal of `a`, with `1` wherever the diagonal is zero.
pub fn inverse_diagonal(a: &CsrMatrix<Real>) -> DVector<Real> {
    let mut diag = DVector::repeat(a.nrows(), 1.0);

    for (row, out) in diag.iter_mut().enumerate() {
        let row_view = a.row(row);
        if let Some(pos) = row_view.col_indices().iter().position(|c| *c == row) {
            let val = row_view.values()[pos];
            if val != 0.0 {
                *out = 1.0 / val;
            }
        }
    }

    diag
}

/// Solves `a * x = b` with a (preconditioned) conjugate gradient.
///
/// `x` holds the initial guess on entry and the last iterate on exit, whether
/// the solver converged or not. `preconditioner` is the inverse of a diagonal
/// approximation of `a`; `None` runs the unpreconditioned method. The solver
/// stops as soon as `|b - A x| <= tolerance * max(|b|, |b - A x0|)`.
///
/// Fails with [`Error::LengthMismatch`] if `a` is not square or if `b`, `x`
/// or the preconditioner don't have one entry per row of `a`.
pub fn solve_conjugate_gradient(
    a: &CsrMatrix<Real>,
    b: &DVector<Real>,
    x: &mut DVector<Real>,
    preconditioner: Option<&DVector<Real>>,
    max_iters: usize,
    tolerance: Real,
) -> Result<CgOutcome> {
    let n = a.nrows();
    let check = |what, got| {
        if got == n {
            Ok(())
        } else {
            Err(Error::LengthMismatch {
                what,
                expected: n,
                got,
            })
        }
    };
    check("matrix columns", a.ncols())?;
    check("right-hand side", b.len())?;
    check("solution", x.len())?;
    if let Some(inv_diag) = preconditioner {
        check("preconditioner", inv_diag.len())?;
    }

    let precondition = |r: &DVector<Real>| match preconditioner {
        Some(inv_diag) => r.component_mul(inv_diag),
        None => r.clone(),
    };

    let mut ap = DVector::zeros(b.len());
    spmv(a, x, &mut ap);
    let mut r = b - &ap;
    let mut z = precondition(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    let mut residual_norm = r.norm();
    let threshold = tolerance * b.norm().max(residual_norm);
    let mut residual_history = vec![residual_norm];
    let mut converged = residual_norm <= threshold;
    let mut iterations = 0;

    while !converged && iterations < max_iters {
        spmv(a, &p, &mut ap);
        let pap = p.dot(&ap);

        if !(pap.is_finite() && pap > 0.0) {
            log::warn!(
                "conjugate gradient breakdown (pAp = {pap:e}) after {iterations} iterations"
            );
            break;
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);
        iterations += 1;

        residual_norm = r.norm();
        residual_history.push(residual_norm);
        log::trace!("cg iteration {iterations}: residual {residual_norm:e}");

        if residual_norm <= threshold {
            converged = true;
            break;
        }

        z = precondition(&r);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p.axpy(1.0, &z, beta);
    }

    Ok(CgOutcome {
        iterations,
        residual_norm,
        converged,
        residual_history,
    })
}

#[cfg(test)]
mod test {
    use super::{inverse_diagonal, solve_conjugate_gradient, spmv};
    use crate::Error;
    use approx::assert_relative_eq;
    use na::{DMatrix, DVector};
    use nalgebra_sparse::{CooMatrix, CsrMatrix};

    // Tridiagonal, strongly diagonally dominant system.
    fn chain_matrix(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 10.0 + (i % 3) as f64);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
                coo.push(i - 1, i, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn spmv_matches_dense_product() {
        let a = chain_matrix(7);
        let x = DVector::from_fn(7, |i, _| i as f64 - 2.5);
        let mut out = DVector::zeros(7);
        spmv(&a, &x, &mut out);

        let dense = DMatrix::from(&a);
        assert_relative_eq!(out, &dense * &x, epsilon = 1.0e-12);
    }

    #[test]
    fn pcg_solves_and_residual_decreases() {
        let n = 40;
        let a = chain_matrix(n);
        let expected = DVector::from_fn(n, |i, _| (i as f64 * 0.3).sin());
        let mut b = DVector::zeros(n);
        spmv(&a, &expected, &mut b);

        let inv_diag = inverse_diagonal(&a);
        let mut x = DVector::zeros(n);
        let outcome = solve_conjugate_gradient(&a, &b, &mut x, Some(&inv_diag), 100, 1.0e-12)
            .unwrap();

        assert!(outcome.converged);
        assert_relative_eq!(x, expected, epsilon = 1.0e-9);
        assert_eq!(outcome.residual_history.len(), outcome.iterations + 1);

        for w in outcome.residual_history.windows(2) {
            assert!(w[1] <= w[0] * (1.0 + 1.0e-9) + 1.0e-14, "{:?}", w);
        }
    }

    #[test]
    fn zero_rhs_converges_immediately() {
        let a = chain_matrix(5);
        let b = DVector::zeros(5);
        let mut x = DVector::zeros(5);
        let outcome = solve_conjugate_gradient(&a, &b, &mut x, None, 10, 1.0e-8).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(x, DVector::zeros(5));
    }

    #[test]
    fn iteration_cap_keeps_last_iterate() {
        let n = 30;
        let a = chain_matrix(n);
        let b = DVector::from_element(n, 1.0);
        let mut x = DVector::zeros(n);
        let outcome = solve_conjugate_gradient(&a, &b, &mut x, None, 1, 1.0e-14).unwrap();

        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 1);
        assert!(x.norm() > 0.0);
        assert!(outcome.residual_norm < b.norm());
    }

    #[test]
    fn mismatched_lengths_are_reported() {
        let a = chain_matrix(6);
        let mut x = DVector::zeros(6);

        let b = DVector::zeros(5);
        assert_eq!(
            solve_conjugate_gradient(&a, &b, &mut x, None, 10, 1.0e-8).unwrap_err(),
            Error::LengthMismatch {
                what: "right-hand side",
                expected: 6,
                got: 5,
            }
        );

        let b = DVector::zeros(6);
        let inv_diag = DVector::repeat(7, 1.0);
        assert!(matches!(
            solve_conjugate_gradient(&a, &b, &mut x, Some(&inv_diag), 10, 1.0e-8),
            Err(Error::LengthMismatch {
                what: "preconditioner",
                ..
            })
        ));
        assert_eq!(x, DVector::zeros(6));
    }
}
