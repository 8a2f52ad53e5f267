//! Dense symmetric solves for the weight system.
//!
//! The weight solver works on small n×n matrices (n = atlas count), always
//! in f64. The primary path is a Cholesky factorization with a cheap
//! reciprocal-condition estimate from the factor diagonal; ill-conditioned
//! or indefinite systems fall back to an SVD pseudoinverse solve.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{get_global_parallelism, Mat, MatRef, Side};
use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("singular system: no usable singular values")]
    Singular,
}

fn to_faer(m: &Array2<f64>) -> Mat<f64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| m[[i, j]])
}

fn diag_values(diag: DiagRef<'_, f64>) -> Vec<f64> {
    let mat = diag.column_vector().as_mat();
    (0..mat.nrows()).map(|i| mat[(i, 0)]).collect()
}

/// Cholesky (LLT) factor of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    /// Reciprocal-condition estimate from the factor diagonal:
    /// `(min L_kk / max L_kk)²`. Cheap, and adequate to gate the fallback;
    /// the acceptance threshold is `sqrt(ε)`.
    pub fn rcond_estimate(&self) -> f64 {
        let d = diag_values(self.factor.L().diagonal());
        let mut min = f64::INFINITY;
        let mut max = 0.0f64;
        for &v in &d {
            min = min.min(v);
            max = max.max(v);
        }
        if !(max > 0.0) || !min.is_finite() {
            return 0.0;
        }
        let ratio = min / max;
        ratio * ratio
    }

    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let r = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let sol = self.factor.solve(r.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)])
    }
}

/// Factor a symmetric positive-definite matrix.
pub fn cholesky(m: &Array2<f64>) -> Result<CholeskyFactor, LinalgError> {
    let mat = to_faer(m);
    let factor = mat
        .as_ref()
        .llt(Side::Lower)
        .map_err(LinalgError::Cholesky)?;
    Ok(CholeskyFactor { factor })
}

fn svd_full(
    mat: MatRef<'_, f64>,
) -> Result<(Mat<f64>, Vec<f64>, Mat<f64>), LinalgError> {
    let (rows, cols) = mat.shape();
    let mut singular = Diag::<f64>::zeros(rows.min(cols));
    let mut u = Mat::<f64>::zeros(rows, rows);
    let mut v = Mat::<f64>::zeros(cols, cols);

    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::Full,
        ComputeSvdVectors::Full,
        par,
        Default::default(),
    ));
    let mut stack = MemStack::new(&mut mem);

    svd::svd(
        mat,
        singular.as_mut(),
        Some(u.as_mut()),
        Some(v.as_mut()),
        par,
        &mut stack,
        Default::default(),
    )
    .map_err(|_| LinalgError::SvdNoConvergence)?;

    Ok((u, diag_values(singular.as_ref()), v))
}

/// Solve `m·x = rhs` through the SVD pseudoinverse, zeroing singular
/// values below `n·ε·σ_max`. Errors when no singular value survives the
/// cutoff or the solution is non-finite.
pub fn svd_solve(m: &Array2<f64>, rhs: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
    let n = m.nrows();
    let mat = to_faer(m);
    let (u, sigma, v) = svd_full(mat.as_ref())?;

    let sigma_max = sigma.iter().cloned().fold(0.0f64, f64::max);
    if !(sigma_max > 0.0) || !sigma_max.is_finite() {
        return Err(LinalgError::Singular);
    }
    let cutoff = n as f64 * f64::EPSILON * sigma_max;

    // x = V Σ⁺ Uᵀ rhs
    let mut x = Array1::<f64>::zeros(n);
    let mut used = 0usize;
    for (k, &s) in sigma.iter().enumerate() {
        if s <= cutoff {
            continue;
        }
        used += 1;
        let mut ub = 0.0;
        for i in 0..n {
            ub += u[(i, k)] * rhs[i];
        }
        let coeff = ub / s;
        for i in 0..n {
            x[i] += coeff * v[(i, k)];
        }
    }
    if used == 0 || x.iter().any(|c| !c.is_finite()) {
        return Err(LinalgError::Singular);
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                a[[i, j]] = rng.gen_range(-1.0..1.0);
            }
        }
        // AᵀA + I is symmetric positive-definite
        let mut spd = a.t().dot(&a);
        for i in 0..n {
            spd[[i, i]] += 1.0;
        }
        spd
    }

    #[test]
    fn test_cholesky_solves_known_system() {
        // [[4,2],[2,3]] x = [8,7]  =>  x = [1.25, 1.5]
        let m = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let rhs = arr1(&[8.0, 7.0]);
        let f = cholesky(&m).unwrap();
        let x = f.solve_vec(&rhs);
        assert!((x[0] - 1.25).abs() < 1e-12);
        assert!((x[1] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_rcond_estimate_identity_is_one() {
        let m = Array2::<f64>::eye(4);
        let f = cholesky(&m).unwrap();
        assert!((f.rcond_estimate() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rcond_estimate_degrades_with_conditioning() {
        let mut m = Array2::<f64>::eye(3);
        m[[2, 2]] = 1e-12;
        let f = cholesky(&m).unwrap();
        assert!(f.rcond_estimate() < f64::EPSILON.sqrt());
    }

    #[test]
    fn test_svd_solve_matches_cholesky_on_well_conditioned() {
        let m = random_spd(6, 11);
        let rhs = Array1::from_elem(6, 1.0);
        let chol = cholesky(&m).unwrap().solve_vec(&rhs);
        let svd = svd_solve(&m, &rhs).unwrap();
        for i in 0..6 {
            assert!(
                (chol[i] - svd[i]).abs() < 1e-9,
                "component {} differs: {} vs {}",
                i,
                chol[i],
                svd[i]
            );
        }
    }

    #[test]
    fn test_svd_solve_rank_deficient_is_finite() {
        // Exactly singular rank-1 system: minimum-norm solution of
        // [[1,1],[1,1]] x = [1,1] is [0.5, 0.5].
        let m = arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        let rhs = arr1(&[1.0, 1.0]);
        let x = svd_solve(&m, &rhs).unwrap();
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!((x[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_svd_solve_zero_matrix_errors() {
        let m = Array2::<f64>::zeros((3, 3));
        let rhs = Array1::from_elem(3, 1.0);
        assert!(svd_solve(&m, &rhs).is_err());
    }
}
