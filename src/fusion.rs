//! Fusion configuration and the top-level entry point.
//!
//! `fuse` validates the inputs, discovers the label set, allocates every
//! buffer, runs the consensus pre-pass and the parallel main loop, and
//! finishes with the argmax pass. The contract is programmatic: callers
//! hand in prepared volumes and receive a label volume plus optional
//! diagnostics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use rayon::prelude::*;

use crate::consensus::{consensus_prepass, ConsensusResult};
use crate::engine::{argmax_labels, run_fusion_loop, EngineContext};
use crate::error::FusionError;
use crate::float_trait::FusionFloat;
use crate::image::{linear_strides, AtlasPair, Image3D};
use crate::neighborhood::NeighborhoodOffsets;

// =============================================================================
// Defaults
// =============================================================================

/// Default patch radius per axis.
const DEFAULT_PATCH_RADIUS: [usize; 3] = [2, 2, 2];

/// Default search radius per axis.
const DEFAULT_SEARCH_RADIUS: [usize; 3] = [3, 3, 3];

/// Default ridge added to the covariance diagonal.
const DEFAULT_ALPHA: f64 = 0.1;

/// Default exponent applied elementwise to the covariance.
const DEFAULT_BETA: f64 = 2.0;

// =============================================================================
// Configuration
// =============================================================================

/// Parameters of one fusion run.
///
/// Use `Default::default()` for the standard settings.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Patch radius per axis. The patch has `∏(2r+1)` samples.
    pub patch_radius: [usize; 3],
    /// Search-window radius per axis around each target voxel.
    pub search_radius: [usize; 3],
    /// Ridge `α ≥ 0` on the covariance diagonal. Default: 0.1
    pub alpha: f64,
    /// Elementwise exponent `β ≥ 0` on the covariance. `β = 2` takes a
    /// multiplication fast path. Default: 2.0
    pub beta: f64,
    /// Penalize anticorrelated candidates in the patch search (the shipped
    /// behavior of the similarity score). `false` scores `−S²/var`
    /// unconditionally. Default: true
    pub penalize_anticorrelation: bool,
    /// Run the unique-label pre-pass and skip unanimous voxels.
    /// Default: true
    pub consensus_shortcut: bool,
    /// Record per-atlas spatial weight maps. Default: false
    pub generate_weight_maps: bool,
    /// Return the per-label posterior accumulators. Default: false
    pub retain_posteriors: bool,
    /// Byte budget for the weight maps; exceeding it fails with
    /// `ResourceExhaustion` before processing. `None` = unlimited.
    pub weight_map_budget: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            patch_radius: DEFAULT_PATCH_RADIUS,
            search_radius: DEFAULT_SEARCH_RADIUS,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            penalize_anticorrelation: true,
            consensus_shortcut: true,
            generate_weight_maps: false,
            retain_posteriors: false,
            weight_map_budget: None,
        }
    }
}

/// Cooperative cancellation flag, checked between voxels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Everything a fusion run produces.
#[derive(Debug)]
pub struct FusionOutput<F> {
    /// The fused label volume, on the target grid.
    pub labels: Image3D<i32>,
    /// Per-label posterior accumulators, ascending label order. Present
    /// when `retain_posteriors` is set.
    pub posteriors: Option<Vec<(i32, Image3D<F>)>>,
    /// Per-atlas weight maps. Present when `generate_weight_maps` is set.
    pub weight_maps: Option<Vec<Image3D<F>>>,
    /// Count of (voxel, atlas) best matches per Manhattan distance of the
    /// winning search offset. Length `Σ search_radius + 1`. Diagnostic.
    pub search_histogram: Vec<u64>,
    /// Voxels resolved by the unique-label pre-pass.
    pub consensus_voxels: usize,
    /// Voxels that went through the full per-voxel solve.
    pub fused_voxels: usize,
}

// =============================================================================
// Validation
// =============================================================================

fn validate<F: FusionFloat>(
    target: &Image3D<F>,
    atlases: &[AtlasPair<F>],
    exclusions: &BTreeMap<i32, Image3D<u8>>,
    config: &FusionConfig,
) -> Result<(), FusionError> {
    if atlases.is_empty() {
        return Err(FusionError::InvalidInput("empty atlas list".into()));
    }
    if !(config.alpha >= 0.0) {
        return Err(FusionError::InvalidInput(format!(
            "alpha must be nonnegative, got {}",
            config.alpha
        )));
    }
    if !(config.beta >= 0.0) {
        return Err(FusionError::InvalidInput(format!(
            "beta must be nonnegative, got {}",
            config.beta
        )));
    }
    let patch_samples: usize = config.patch_radius.iter().map(|&r| 2 * r + 1).product();
    if patch_samples < 2 {
        return Err(FusionError::InvalidInput(
            "patch radius (0, 0, 0) leaves a single-sample patch".into(),
        ));
    }
    for (i, atlas) in atlases.iter().enumerate() {
        if !atlas.intensity.same_grid(target) {
            return Err(FusionError::InvalidInput(format!(
                "atlas {} intensity grid does not match the target",
                i
            )));
        }
        if !atlas.labels.same_grid(target) {
            return Err(FusionError::InvalidInput(format!(
                "atlas {} label grid does not match the target",
                i
            )));
        }
    }
    for (label, mask) in exclusions {
        if !mask.same_grid(target) {
            return Err(FusionError::InvalidInput(format!(
                "exclusion mask for label {} does not match the target grid",
                label
            )));
        }
    }
    Ok(())
}

/// Sorted union of label values over all atlas label images.
fn discover_labels<F: FusionFloat>(atlases: &[AtlasPair<F>]) -> Vec<i32> {
    atlases
        .par_iter()
        .map(|atlas| atlas.labels.data().iter().copied().collect::<BTreeSet<i32>>())
        .reduce(BTreeSet::new, |mut a, b| {
            a.extend(b);
            a
        })
        .into_iter()
        .collect()
}

// =============================================================================
// Entry point
// =============================================================================

/// Fuse the atlases into one label volume for the target.
///
/// Inputs are read-only for the duration of the call; outputs are freshly
/// allocated on the target grid. Posterior accumulation merges per-worker
/// buffers in an unspecified order, so sums are reproducible only up to
/// float associativity across thread counts; the selection passes are
/// deterministic.
pub fn fuse<F: FusionFloat>(
    target: &Image3D<F>,
    atlases: &[AtlasPair<F>],
    exclusions: &BTreeMap<i32, Image3D<u8>>,
    config: &FusionConfig,
    cancel: &CancelToken,
) -> Result<FusionOutput<F>, FusionError> {
    validate(target, atlases, exclusions, config)?;

    let out_dims = target.dim();
    let total = out_dims.0 * out_dims.1 * out_dims.2;
    let n_atlases = atlases.len();

    if config.generate_weight_maps {
        let requested = n_atlases * total * std::mem::size_of::<F>();
        if let Some(budget) = config.weight_map_budget {
            if requested > budget {
                return Err(FusionError::ResourceExhaustion { requested, budget });
            }
        }
    }

    let label_set = discover_labels(atlases);
    log::info!(
        "fusing {:?} volume from {} atlases, {} labels",
        out_dims,
        n_atlases,
        label_set.len()
    );

    // Widen every input so all search + patch neighborhoods are in range.
    let margin = [
        config.patch_radius[0] + config.search_radius[0],
        config.patch_radius[1] + config.search_radius[1],
        config.patch_radius[2] + config.search_radius[2],
    ];
    let padded_target = target.pad_replicate(margin);
    let padded_intensities: Vec<Array3<F>> = atlases
        .iter()
        .map(|a| a.intensity.pad_replicate(margin))
        .collect();
    let padded_labels: Vec<Array3<i32>> = atlases
        .iter()
        .map(|a| a.labels.pad_replicate(margin))
        .collect();

    let padded_strides = linear_strides(padded_target.dim());
    let patch = NeighborhoodOffsets::new(config.patch_radius, padded_strides);
    let search = NeighborhoodOffsets::new(config.search_radius, padded_strides);

    let label_flats: Vec<&[i32]> = padded_labels
        .iter()
        .map(|a| a.as_slice().expect("padded arrays are standard layout"))
        .collect();

    let ConsensusResult {
        mask,
        output: mut output_array,
        consensus_voxels,
    } = if config.consensus_shortcut {
        consensus_prepass(&label_flats, out_dims, margin, padded_strides, &search)
    } else {
        ConsensusResult {
            mask: Array3::ones(out_dims),
            output: Array3::zeros(out_dims),
            consensus_voxels: 0,
        }
    };

    let masked_voxels: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter(|(_, &m)| m == 1)
        .map(|(idx, _)| idx)
        .collect();
    log::debug!(
        "consensus pre-pass resolved {} voxels, {} remain",
        consensus_voxels,
        masked_voxels.len()
    );

    let ctx = EngineContext {
        target: padded_target
            .as_slice()
            .expect("padded arrays are standard layout"),
        atlas_intensities: padded_intensities
            .iter()
            .map(|a| a.as_slice().expect("padded arrays are standard layout"))
            .collect(),
        atlas_labels: label_flats,
        out_dims,
        margin,
        padded_strides,
        patch: &patch,
        search: &search,
        label_set: &label_set,
        alpha: config.alpha,
        beta: config.beta,
        penalize_anticorrelation: config.penalize_anticorrelation,
        record_weights: config.generate_weight_maps,
    };

    let accumulators = run_fusion_loop(&ctx, &masked_voxels, cancel)?;

    let exclusion_views: Vec<Option<&Array3<u8>>> = label_set
        .iter()
        .map(|label| exclusions.get(label).map(|img| img.data()))
        .collect();
    argmax_labels(
        &accumulators.posteriors,
        &label_set,
        &exclusion_views,
        &mask,
        &mut output_array,
    );

    log::info!(
        "fusion done: {} consensus, {} fused; search histogram {:?}",
        consensus_voxels,
        masked_voxels.len(),
        accumulators.histogram
    );

    let posteriors = config.retain_posteriors.then(|| {
        label_set
            .iter()
            .zip(accumulators.posteriors)
            .map(|(&label, p)| (label, Image3D::on_grid_of(p, target)))
            .collect()
    });
    let weight_maps = accumulators.weight_maps.map(|maps| {
        maps.into_iter()
            .map(|m| Image3D::on_grid_of(m, target))
            .collect()
    });

    Ok(FusionOutput {
        labels: Image3D::on_grid_of(output_array, target),
        posteriors,
        weight_maps,
        search_histogram: accumulators.histogram,
        consensus_voxels,
        fused_voxels: masked_voxels.len(),
    })
}
