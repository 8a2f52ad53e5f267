//! Patch statistics and best-match search.
//!
//! The matcher scans a search window around the target voxel in one atlas
//! intensity image, scoring each candidate patch against the z-normalized
//! target patch with a normalized-cross-correlation surrogate, and keeps
//! the candidate's sufficient statistics for the weight solver.

use crate::float_trait::FusionFloat;
use crate::neighborhood::NeighborhoodOffsets;

/// Patch standard deviations below this are clamped so z-normalization
/// stays finite in low-contrast regions.
pub const MIN_PATCH_STD: f64 = 1e-6;

/// Unnormalized candidate variances below this are clamped before the
/// similarity division.
pub const MIN_SEARCH_VARIANCE: f64 = 1e-6;

/// Mean and standard deviation of one patch.
#[derive(Debug, Clone, Copy)]
pub struct PatchStats<F> {
    pub mean: F,
    pub std: F,
}

/// Compute patch mean and sample standard deviation at `center`.
///
/// `σ = sqrt((Σp² − N·μ²)/(N−1))`, clamped to [`MIN_PATCH_STD`] when tiny
/// or NaN.
pub fn patch_stats<F: FusionFloat>(
    buf: &[F],
    center: usize,
    patch: &NeighborhoodOffsets,
) -> PatchStats<F> {
    let n = F::usize_as(patch.len());
    let mut sum = F::zero();
    let mut sq_sum = F::zero();
    for &off in patch.linear() {
        let p = buf[(center as isize + off) as usize];
        sum += p;
        sq_sum += p * p;
    }
    let mean = sum / n;
    let var = (sq_sum - n * mean * mean) / (n - F::one());
    let mut std = var.sqrt();
    let min_std = F::from_f64_c(MIN_PATCH_STD);
    if !(std > min_std) {
        std = min_std;
    }
    PatchStats { mean, std }
}

/// Fill `out` with the z-normalized target patch at `center` and return
/// the statistics used.
pub fn fill_normalized_patch<F: FusionFloat>(
    buf: &[F],
    center: usize,
    patch: &NeighborhoodOffsets,
    out: &mut [F],
) -> PatchStats<F> {
    debug_assert_eq!(out.len(), patch.len());
    let stats = patch_stats(buf, center, patch);
    for (o, &off) in out.iter_mut().zip(patch.linear()) {
        *o = (buf[(center as isize + off) as usize] - stats.mean) / stats.std;
    }
    stats
}

/// Winning candidate of one search-window scan.
#[derive(Debug, Clone, Copy)]
pub struct PatchMatch<F> {
    /// Linear index of the winning candidate center in the atlas buffer.
    pub center: usize,
    /// Σv over the winning candidate's patch samples.
    pub sum: F,
    /// Σv² over the winning candidate's patch samples.
    pub sq_sum: F,
    /// Manhattan distance of the winning search offset from the window
    /// center. Diagnostic only.
    pub manhattan: u32,
}

impl<F: FusionFloat> Default for PatchMatch<F> {
    fn default() -> Self {
        Self {
            center: 0,
            sum: F::zero(),
            sq_sum: F::zero(),
            manhattan: 0,
        }
    }
}

/// Scan the search window in one atlas for the patch that best matches the
/// z-normalized target patch `u`.
///
/// Per candidate: `S = Σ u·v`, `var = Σv² − (Σv)²/N` (clamped), and the
/// score is `−S²/var` for positively correlated candidates. With
/// `penalize_anticorrelation` the sign flips to `+S²/var` when `S ≤ 0`,
/// so anticorrelated candidates are never selected; without it the score
/// is `−S²/var` unconditionally. The minimum score wins; ties go to the
/// first offset in table order.
pub fn match_patch<F: FusionFloat>(
    u: &[F],
    atlas: &[F],
    center: usize,
    patch: &NeighborhoodOffsets,
    search: &NeighborhoodOffsets,
    penalize_anticorrelation: bool,
) -> PatchMatch<F> {
    let n = F::usize_as(patch.len());
    let min_var = F::from_f64_c(MIN_SEARCH_VARIANCE);

    let mut best = PatchMatch::default();
    let mut best_score = F::infinity();

    for (k, &search_off) in search.linear().iter().enumerate() {
        let cand = (center as isize + search_off) as usize;

        let mut s_uv = F::zero();
        let mut s_v = F::zero();
        let mut s_vv = F::zero();
        for (&u_m, &off) in u.iter().zip(patch.linear()) {
            let v = atlas[(cand as isize + off) as usize];
            s_uv += u_m * v;
            s_v += v;
            s_vv += v * v;
        }

        let mut var = s_vv - s_v * s_v / n;
        if !(var > min_var) {
            var = min_var;
        }

        let magnitude = s_uv * s_uv / var;
        let score = if penalize_anticorrelation && s_uv <= F::zero() {
            magnitude
        } else {
            -magnitude
        };

        if score < best_score {
            best_score = score;
            best = PatchMatch {
                center: cand,
                sum: s_v,
                sq_sum: s_vv,
                manhattan: search.manhattan()[k],
            };
        }
    }

    best
}
