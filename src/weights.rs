//! Atlas weight estimation from patch residuals.
//!
//! Each atlas' best-matching patch leaves an absolute-patch-difference
//! (apd) vector against the z-normalized target patch. Pairwise apd dot
//! products form the inter-atlas error covariance `Mx`; the weights solve
//! `(Mx + αI) w = 1` and are renormalized to sum to one. Negative weights
//! are legal: they cancel correlated errors.

use ndarray::{Array1, Array2};

use crate::float_trait::FusionFloat;
use crate::linalg::{self, LinalgError};
use crate::neighborhood::NeighborhoodOffsets;
use crate::patch::PatchMatch;

/// Variances of matched patches below this are clamped before
/// normalization.
pub const MIN_MATCH_VARIANCE: f64 = 1e-12;

/// Betas within this distance of 2 take the multiplication fast path.
const BETA_SQUARE_TOLERANCE: f64 = 1e-12;

/// Fill one apd row: `apd[m] = |u_m − (v_m − m̄)/σ̄|` over the winning
/// patch, with `m̄`, `σ̄` taken from the match's sufficient statistics.
pub fn fill_apd<F: FusionFloat>(
    u: &[F],
    atlas: &[F],
    m: &PatchMatch<F>,
    patch: &NeighborhoodOffsets,
    apd: &mut [f64],
) {
    debug_assert_eq!(apd.len(), patch.len());
    let n = F::usize_as(patch.len());
    let mean = m.sum / n;
    let mut var = ((m.sq_sum - n * mean * mean) / (n - F::one())).to_f64_c();
    var = var.max(MIN_MATCH_VARIANCE);
    let std = F::from_f64_c(var.sqrt());

    for ((a, &u_m), &off) in apd.iter_mut().zip(u).zip(patch.linear()) {
        let v = atlas[(m.center as isize + off) as usize];
        *a = ((v - mean) / std - u_m).abs().to_f64_c();
    }
}

/// Form the ridged covariance `Mx + αI` from the apd rows (one row per
/// atlas, one column per patch sample).
///
/// `Mx(i,j) = (Σ_m apd_i[m]·apd_j[m])/(N−1)` raised elementwise to β;
/// β = 2 multiplies instead of calling `powf`, which is semantically
/// identical. Only the upper triangle is computed and mirrored, so the
/// result is exactly symmetric.
pub fn build_mx(apd: &Array2<f64>, beta: f64, alpha: f64) -> Array2<f64> {
    let (n_atlas, n_samples) = apd.dim();
    let norm = (n_samples - 1) as f64;
    let square = (beta - 2.0).abs() < BETA_SQUARE_TOLERANCE;

    let mut mx = Array2::<f64>::zeros((n_atlas, n_atlas));
    for i in 0..n_atlas {
        let row_i = apd.row(i);
        for j in i..n_atlas {
            let row_j = apd.row(j);
            let mut dot = 0.0;
            for (a, b) in row_i.iter().zip(row_j.iter()) {
                dot += a * b;
            }
            let base = dot / norm;
            let value = if square { base * base } else { base.powf(beta) };
            mx[[i, j]] = value;
            mx[[j, i]] = value;
        }
    }
    for i in 0..n_atlas {
        mx[[i, i]] += alpha;
    }
    mx
}

/// Solve `mx_ridged · w = 1` and renormalize so `Σw = 1`.
///
/// Cholesky is attempted first; its solution is used when the
/// reciprocal-condition estimate exceeds `sqrt(ε)`. Otherwise, and when
/// the factorization itself fails, the SVD pseudoinverse path runs. A
/// non-finite or zero weight sum is a hard error; the engine maps it to
/// `NumericFailure` for the offending voxel.
pub fn solve_weights(mx_ridged: &Array2<f64>) -> Result<Array1<f64>, LinalgError> {
    let n = mx_ridged.nrows();
    let ones = Array1::from_elem(n, 1.0);

    let raw = match linalg::cholesky(mx_ridged) {
        Ok(factor) if factor.rcond_estimate() > f64::EPSILON.sqrt() => factor.solve_vec(&ones),
        _ => linalg::svd_solve(mx_ridged, &ones)?,
    };

    let sum: f64 = raw.iter().sum();
    if !sum.is_finite() || sum == 0.0 {
        return Err(LinalgError::Singular);
    }
    Ok(raw.mapv(|w| w / sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_apd(n_atlas: usize, n_samples: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n_atlas, n_samples), |_| rng.gen_range(0.0..2.0))
    }

    #[test]
    fn test_mx_is_symmetric() {
        let apd = random_apd(5, 27, 17);
        let mx = build_mx(&apd, 2.0, 0.1);
        for i in 0..5 {
            for j in 0..5 {
                assert!((mx[[i, j]] - mx[[j, i]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_beta_fast_path_matches_powf() {
        let apd = random_apd(4, 27, 23);
        let fast = build_mx(&apd, 2.0, 0.0);
        // Force the general path with a beta that is not exactly 2
        let slow = build_mx(&apd, 2.0 + 1e-9, 0.0);
        for i in 0..4 {
            for j in 0..4 {
                assert!((fast[[i, j]] - slow[[i, j]]).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn test_beta_zero_gives_ones_plus_ridge() {
        let apd = random_apd(3, 27, 5);
        let mx = build_mx(&apd, 0.0, 0.25);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.25 } else { 1.0 };
                assert!((mx[[i, j]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_ridge_lands_on_diagonal_only() {
        let apd = random_apd(3, 27, 29);
        let plain = build_mx(&apd, 2.0, 0.0);
        let ridged = build_mx(&apd, 2.0, 0.5);
        for i in 0..3 {
            for j in 0..3 {
                let expected = plain[[i, j]] + if i == j { 0.5 } else { 0.0 };
                assert!((ridged[[i, j]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let apd = random_apd(6, 27, 31);
        let mx = build_mx(&apd, 2.0, 0.1);
        let w = solve_weights(&mx).unwrap();
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_identical_atlases_share_weight_via_svd_fallback() {
        // Two identical apd rows with no ridge make Mx exactly singular:
        // Cholesky must be rejected and the SVD path must still produce
        // the symmetric solution.
        let row = random_apd(1, 27, 37);
        let mut apd = Array2::<f64>::zeros((2, 27));
        apd.row_mut(0).assign(&row.row(0));
        apd.row_mut(1).assign(&row.row(0));

        let mx = build_mx(&apd, 2.0, 0.0);
        let w = solve_weights(&mx).unwrap();
        assert!((w[0] - 0.5).abs() < 1e-9);
        assert!((w[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_equicorrelated_atlases_get_equal_weights() {
        // Symmetric Mx with constant off-diagonal: by symmetry all atlases
        // get 1/n.
        let mut mx = Array2::<f64>::from_elem((4, 4), 0.3);
        for i in 0..4 {
            mx[[i, i]] = 1.0;
        }
        let w = solve_weights(&mx).unwrap();
        for i in 0..4 {
            assert!((w[i] - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_apd_zero_for_exactly_matching_patch() {
        use crate::neighborhood::NeighborhoodOffsets;
        use crate::patch::{fill_normalized_patch, match_patch};
        use ndarray::Array3;

        let mut rng = StdRng::seed_from_u64(43);
        let vol = Array3::from_shape_fn((9, 9, 9), |_| rng.gen_range(0.0..5.0f64));
        let flat = vol.as_slice().unwrap();
        let strides = [81, 9, 1];
        let patch = NeighborhoodOffsets::new([1, 1, 1], strides);
        let search = NeighborhoodOffsets::new([1, 1, 1], strides);
        let center = 4 * 81 + 4 * 9 + 4;

        let mut u = vec![0.0f64; patch.len()];
        fill_normalized_patch(flat, center, &patch, &mut u);
        let m = match_patch(&u, flat, center, &patch, &search, true);

        let mut apd = vec![0.0f64; patch.len()];
        fill_apd(&u, flat, &m, &patch, &mut apd);
        for &a in &apd {
            assert!(a < 1e-9, "apd should vanish for an exact match, got {}", a);
        }
    }
}
