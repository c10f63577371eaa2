//! Validates the subspace-iteration restart machinery against a dense
//! reference: iterating k vectors under (I - eps * H) with periodic
//! eigendecomposition restarts must reproduce the spectrum of a small test
//! Hamiltonian through the generalised eigenproblem B x = lambda D x.

use ndarray::{arr2, Array1, Array2};
use ndarray_linalg::Eig;
use num_complex::Complex64;

use fri_rs::subspace::{restart_matrix, RestartTechnique};

#[test]
fn eig_restarts_recover_test_hamiltonian_spectrum() {
    let h_mat = arr2(&[
        [-4.0, 0.1, 0.0, 0.05],
        [0.1, -3.0, 0.1, 0.0],
        [0.0, 0.1, -2.0, 0.1],
        [0.05, 0.0, 0.1, -1.0],
    ]);
    let n_trial = 4;
    let eps = 0.05;
    let identity = Array2::<f64>::eye(n_trial);
    let propagator = &identity - &(eps * &h_mat);

    // Reference spectrum, computed directly.
    let (ref_vals, _): (Array1<Complex64>, Array2<Complex64>) = h_mat.eig().unwrap();
    let mut reference: Vec<f64> = ref_vals.iter().map(|v| v.re).collect();
    reference.sort_by(|a, b| a.partial_cmp(b).unwrap());

    // Trial vectors are the standard basis, so D and B are the iterate and
    // propagated-iterate matrices themselves.
    let mut iterates = Array2::<f64>::eye(n_trial);
    for iteration in 0..200 {
        let d_mat = iterates.clone();
        let b_mat = propagator.dot(&iterates);
        if (iteration + 1) % 10 == 0 {
            let coeffs = restart_matrix(RestartTechnique::Eig, &b_mat, &d_mat).unwrap();
            iterates = b_mat.dot(&coeffs);
        } else {
            iterates = b_mat.clone();
        }
        // Per-column one-norm normalisation keeps the iterates bounded.
        for col in 0..n_trial {
            let norm: f64 = iterates.column(col).iter().map(|v| v.abs()).sum();
            if norm > 0.0 {
                iterates.column_mut(col).mapv_inplace(|v| v / norm);
            }
        }
    }

    // Solve the generalised problem from the final matrices and map the
    // eigenvalues of the propagator back to energies.
    let d_mat = iterates.clone();
    let b_mat = propagator.dot(&iterates);
    let m = {
        use ndarray_linalg::Inverse;
        d_mat.inv().unwrap().dot(&b_mat)
    };
    let (lambdas, _): (Array1<Complex64>, Array2<Complex64>) = m.eig().unwrap();
    let mut energies: Vec<f64> = lambdas.iter().map(|l| (1.0 - l.re) / eps).collect();
    energies.sort_by(|a, b| a.partial_cmp(b).unwrap());

    for (found, exact) in energies.iter().zip(reference.iter()) {
        assert!(
            (found - exact).abs() < 1e-4,
            "eigenvalue {} vs reference {}",
            found,
            exact
        );
    }
}
