// subspace.rs
//
// Restart machinery for the randomized subspace (Arnoldi-like) iteration:
// given the overlap matrix D and the projected propagated matrix B in the
// trial-vector basis, compute the coefficients that linearly recombine the
// iterates. Columns of the returned matrix index the new iterates.

use clap::ValueEnum;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eig, Inverse, QR};
use num_complex::Complex64;

use crate::error::{FriError, Result};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartTechnique {
    /// Generalised eigenproblem B x = lambda D x; iterates recombine along
    /// the eigenvectors of the largest eigenvalues.
    #[value(name = "eig")]
    Eig,
    /// Inverse of the projected matrix B.
    #[value(name = "h_inv")]
    HInv,
    /// Inverse of the R factor from the QR factorization of B.
    #[value(name = "r_inv")]
    RInv,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormTechnique {
    #[value(name = "none")]
    None,
    /// Divide each iterate by its own one-norm.
    #[value(name = "1-norm")]
    OneNorm,
    /// Divide every iterate by the largest one-norm among them.
    #[value(name = "max-1-norm")]
    MaxOneNorm,
}

/// Linear-combination coefficients for one restart.
pub fn restart_matrix(
    technique: RestartTechnique,
    b_mat: &Array2<f64>,
    d_mat: &Array2<f64>,
) -> Result<Array2<f64>> {
    let n_trial = b_mat.nrows();
    match technique {
        RestartTechnique::Eig => {
            // Reduce B x = lambda D x to a standard eigenproblem on
            // inv(D) * B, then order the eigenvectors by descending
            // eigenvalue magnitude.
            let d_inv = d_mat
                .inv()
                .map_err(|e| FriError::Linalg(format!("overlap matrix is singular: {}", e)))?;
            let m = d_inv.dot(b_mat);
            let (eigvals, eigvecs): (Array1<Complex64>, Array2<Complex64>) = m
                .eig()
                .map_err(|e| FriError::Linalg(format!("eigendecomposition failed: {}", e)))?;
            let mut order: Vec<usize> = (0..n_trial).collect();
            order.sort_by(|&lhs, &rhs| {
                eigvals[rhs]
                    .norm()
                    .partial_cmp(&eigvals[lhs].norm())
                    .expect("eigenvalue magnitudes are comparable")
            });
            let mut coeffs = Array2::<f64>::zeros((n_trial, n_trial));
            for (new_idx, &old_idx) in order.iter().enumerate() {
                for row in 0..n_trial {
                    coeffs[(row, new_idx)] = eigvecs[(row, old_idx)].re;
                }
            }
            Ok(coeffs)
        }
        RestartTechnique::HInv => b_mat
            .inv()
            .map_err(|e| FriError::Linalg(format!("projected matrix is singular: {}", e))),
        RestartTechnique::RInv => {
            let (_, r) = b_mat
                .qr()
                .map_err(|e| FriError::Linalg(format!("QR factorization failed: {}", e)))?;
            r.inv()
                .map_err(|e| FriError::Linalg(format!("R factor is singular: {}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn eig_restart_orders_by_magnitude() {
        // D = I, B diagonal: the recombination must list the largest
        // eigenvalue's direction first.
        let d_mat = Array2::<f64>::eye(3);
        let b_mat = arr2(&[[0.2, 0.0, 0.0], [0.0, 0.9, 0.0], [0.0, 0.0, 0.5]]);
        let coeffs = restart_matrix(RestartTechnique::Eig, &b_mat, &d_mat).unwrap();
        // First column picks out the eigenvector of 0.9.
        assert!(coeffs[(1, 0)].abs() > 0.9);
        assert!(coeffs[(0, 0)].abs() < 1e-9);
        // Second column: 0.5; third: 0.2.
        assert!(coeffs[(2, 1)].abs() > 0.9);
        assert!(coeffs[(0, 2)].abs() > 0.9);
    }

    #[test]
    fn h_inv_restart_inverts_b() {
        let d_mat = Array2::<f64>::eye(2);
        let b_mat = arr2(&[[2.0, 1.0], [0.0, 4.0]]);
        let coeffs = restart_matrix(RestartTechnique::HInv, &b_mat, &d_mat).unwrap();
        let prod = b_mat.dot(&coeffs);
        for row in 0..2 {
            for col in 0..2 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert!((prod[(row, col)] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn r_inv_restart_triangularises() {
        let d_mat = Array2::<f64>::eye(2);
        let b_mat = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let coeffs = restart_matrix(RestartTechnique::RInv, &b_mat, &d_mat).unwrap();
        // B * inv(R) = Q, which has orthonormal columns.
        let q = b_mat.dot(&coeffs);
        let qtq = q.t().dot(&q);
        for row in 0..2 {
            for col in 0..2 {
                let expected = if row == col { 1.0 } else { 0.0 };
                assert!((qtq[(row, col)] - expected).abs() < 1e-9);
            }
        }
    }
}
