//! The fusion hot loop.
//!
//! Per masked voxel: normalize the target patch, find each atlas' best
//! match, solve the atlas weights, then spread each atlas' neighborhood
//! labels into the per-label posterior accumulators. Workers run over
//! disjoint chunks of the masked voxel list and own private full-size
//! accumulators; one reduce merges them before the argmax pass.

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::error::FusionError;
use crate::float_trait::FusionFloat;
use crate::fusion::CancelToken;
use crate::neighborhood::NeighborhoodOffsets;
use crate::patch::{fill_normalized_patch, match_patch, PatchMatch};
use crate::weights::{build_mx, fill_apd, solve_weights};

/// Minimum chunk length for Rayon parallel iteration. Voxel work items are
/// heavy (one solve per voxel), so chunks stay small.
const RAYON_MIN_CHUNK_LEN: usize = 16;

/// Read-only inputs of the main loop, in padded flat form.
pub(crate) struct EngineContext<'a, F: FusionFloat> {
    pub target: &'a [F],
    pub atlas_intensities: Vec<&'a [F]>,
    pub atlas_labels: Vec<&'a [i32]>,
    pub out_dims: (usize, usize, usize),
    pub margin: [usize; 3],
    pub padded_strides: [isize; 3],
    pub patch: &'a NeighborhoodOffsets,
    pub search: &'a NeighborhoodOffsets,
    /// Sorted union of labels over all atlas label images.
    pub label_set: &'a [i32],
    pub alpha: f64,
    pub beta: f64,
    pub penalize_anticorrelation: bool,
    pub record_weights: bool,
}

impl<F: FusionFloat> EngineContext<'_, F> {
    fn atlas_count(&self) -> usize {
        self.atlas_intensities.len()
    }

    #[inline]
    fn padded_center(&self, coords: [usize; 3]) -> usize {
        (coords[0] + self.margin[0]) * self.padded_strides[0] as usize
            + (coords[1] + self.margin[1]) * self.padded_strides[1] as usize
            + (coords[2] + self.margin[2]) * self.padded_strides[2] as usize
    }
}

/// Merged result of the parallel pass.
pub(crate) struct FusionAccumulators<F> {
    /// One volume per label, aligned with the context's label set.
    pub posteriors: Vec<Array3<F>>,
    pub weight_maps: Option<Vec<Array3<F>>>,
    /// Count of (voxel, atlas) matches per Manhattan distance of the
    /// winning search offset.
    pub histogram: Vec<u64>,
}

/// One worker's private accumulators plus per-voxel scratch.
struct WorkerState<F> {
    posteriors: Vec<Array3<F>>,
    weight_maps: Option<Vec<Array3<F>>>,
    histogram: Vec<u64>,
    u: Vec<F>,
    apd: Array2<f64>,
    matches: Vec<PatchMatch<F>>,
    weights: Vec<F>,
}

impl<F: FusionFloat> WorkerState<F> {
    fn new(ctx: &EngineContext<'_, F>) -> Self {
        let n = ctx.atlas_count();
        Self {
            posteriors: vec![Array3::zeros(ctx.out_dims); ctx.label_set.len()],
            weight_maps: ctx
                .record_weights
                .then(|| vec![Array3::zeros(ctx.out_dims); n]),
            histogram: vec![0; ctx.search.max_manhattan() as usize + 1],
            u: vec![F::zero(); ctx.patch.len()],
            apd: Array2::zeros((n, ctx.patch.len())),
            matches: vec![PatchMatch::default(); n],
            weights: vec![F::zero(); n],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (a, b) in self.posteriors.iter_mut().zip(&other.posteriors) {
            a.zip_mut_with(b, |x, &y| *x += y);
        }
        if let (Some(a_maps), Some(b_maps)) = (self.weight_maps.as_mut(), other.weight_maps.as_ref())
        {
            for (a, b) in a_maps.iter_mut().zip(b_maps) {
                a.zip_mut_with(b, |x, &y| *x += y);
            }
        }
        for (a, &b) in self.histogram.iter_mut().zip(&other.histogram) {
            *a += b;
        }
        self
    }

    fn into_accumulators(self) -> FusionAccumulators<F> {
        FusionAccumulators {
            posteriors: self.posteriors,
            weight_maps: self.weight_maps,
            histogram: self.histogram,
        }
    }
}

pub(crate) fn unflatten(idx: usize, dims: (usize, usize, usize)) -> [usize; 3] {
    let (_, ny, nz) = dims;
    [idx / (ny * nz), (idx / nz) % ny, idx % nz]
}

/// Fuse one voxel into the worker's accumulators. Errors only when the
/// weight system has no usable solution.
fn fuse_voxel<F: FusionFloat>(
    ctx: &EngineContext<'_, F>,
    coords: [usize; 3],
    state: &mut WorkerState<F>,
) -> Result<(), crate::linalg::LinalgError> {
    let center = ctx.padded_center(coords);

    // 1. z-normalized target patch
    fill_normalized_patch(ctx.target, center, ctx.patch, &mut state.u);

    // 2. per-atlas best match + apd residual row
    for i in 0..ctx.atlas_count() {
        let m = match_patch(
            &state.u,
            ctx.atlas_intensities[i],
            center,
            ctx.patch,
            ctx.search,
            ctx.penalize_anticorrelation,
        );
        fill_apd(
            &state.u,
            ctx.atlas_intensities[i],
            &m,
            ctx.patch,
            state
                .apd
                .row_mut(i)
                .into_slice()
                .expect("apd rows are contiguous"),
        );
        state.matches[i] = m;
    }

    // 3. atlas weights
    let mx = build_mx(&state.apd, ctx.beta, ctx.alpha);
    let w = solve_weights(&mx)?;
    for (wf, &wi) in state.weights.iter_mut().zip(w.iter()) {
        *wf = F::from_f64_c(wi);
    }

    for m in &state.matches {
        state.histogram[m.manhattan as usize] += 1;
    }
    if let Some(maps) = state.weight_maps.as_mut() {
        for (i, map) in maps.iter_mut().enumerate() {
            map[(coords[0], coords[1], coords[2])] = state.weights[i];
        }
    }

    // 4. neighborhood voting: each atlas' labels around its best match
    // spread into the posteriors of the voxels around x
    let (nx, ny, nz) = ctx.out_dims;
    for (m_idx, rel) in ctx.patch.relative().iter().enumerate() {
        let yx = coords[0] as i64 + rel[0];
        let yy = coords[1] as i64 + rel[1];
        let yz = coords[2] as i64 + rel[2];
        if yx < 0
            || yy < 0
            || yz < 0
            || yx >= nx as i64
            || yy >= ny as i64
            || yz >= nz as i64
        {
            continue;
        }
        let y = (yx as usize, yy as usize, yz as usize);
        let patch_off = ctx.patch.linear()[m_idx];

        for i in 0..ctx.atlas_count() {
            let label =
                ctx.atlas_labels[i][(state.matches[i].center as isize + patch_off) as usize];
            let lid = ctx
                .label_set
                .binary_search(&label)
                .expect("label set covers every atlas label");
            state.posteriors[lid][y] += state.weights[i];
        }
    }

    Ok(())
}

/// Run the parallel fusion pass over the masked voxel list.
///
/// Workers `try_fold` into private accumulator sets which one
/// `try_reduce` merges; a numeric failure or an observed cancellation
/// aborts the whole pass. The merge order over workers is unspecified, so
/// posterior sums are not bit-reproducible across thread counts.
pub(crate) fn run_fusion_loop<F: FusionFloat>(
    ctx: &EngineContext<'_, F>,
    voxels: &[usize],
    cancel: &CancelToken,
) -> Result<FusionAccumulators<F>, FusionError> {
    let state = voxels
        .par_iter()
        .with_min_len(RAYON_MIN_CHUNK_LEN)
        .try_fold(
            || WorkerState::new(ctx),
            |mut state, &idx| {
                if cancel.is_cancelled() {
                    return Err(FusionError::Cancelled);
                }
                let coords = unflatten(idx, ctx.out_dims);
                fuse_voxel(ctx, coords, &mut state)
                    .map_err(|_| FusionError::NumericFailure { voxel: coords })?;
                Ok(state)
            },
        )
        .try_reduce(|| WorkerState::new(ctx), |a, b| Ok(a.merge(b)))?;

    Ok(state.into_accumulators())
}

/// Final pass: per masked voxel, the first label with the maximum
/// posterior wins; labels vetoed by an exclusion mask are skipped, and a
/// fully vetoed voxel gets 0.
pub(crate) fn argmax_labels<F: FusionFloat>(
    posteriors: &[Array3<F>],
    label_set: &[i32],
    exclusions: &[Option<&Array3<u8>>],
    mask: &Array3<u8>,
    output: &mut Array3<i32>,
) {
    let (nx, ny, nz) = mask.dim();
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if mask[[x, y, z]] == 0 {
                    continue;
                }
                let mut best: Option<(i32, F)> = None;
                for (lid, &label) in label_set.iter().enumerate() {
                    if let Some(excl) = exclusions[lid] {
                        if excl[[x, y, z]] != 0 {
                            continue;
                        }
                    }
                    let p = posteriors[lid][[x, y, z]];
                    match best {
                        Some((_, best_p)) if p <= best_p => {}
                        _ => best = Some((label, p)),
                    }
                }
                output[[x, y, z]] = best.map(|(label, _)| label).unwrap_or(0);
            }
        }
    }
}
