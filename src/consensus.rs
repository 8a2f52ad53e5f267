//! Unique-label pre-pass.
//!
//! Voxels where every atlas shows a single label across the whole search
//! neighborhood are assigned directly and excluded from the main loop.
//! Background and class-interior regions resolve here, which removes the
//! bulk of the per-voxel solves.

use ndarray::Array3;
use rayon::prelude::*;

use crate::neighborhood::NeighborhoodOffsets;

/// Result of the pre-pass: the fusion mask (1 = needs fusion), the output
/// volume with consensus labels already written, and the consensus count.
pub struct ConsensusResult {
    pub mask: Array3<u8>,
    pub output: Array3<i32>,
    pub consensus_voxels: usize,
}

/// If every sample of every atlas across the search neighborhood equals
/// one scalar, return it.
#[inline]
fn unanimous_label(
    atlas_labels: &[&[i32]],
    padded_center: usize,
    search: &NeighborhoodOffsets,
) -> Option<i32> {
    let reference = atlas_labels[0][(padded_center as isize + search.linear()[0]) as usize];
    for labels in atlas_labels {
        for &off in search.linear() {
            if labels[(padded_center as isize + off) as usize] != reference {
                return None;
            }
        }
    }
    Some(reference)
}

/// Run the pre-pass over the whole output region.
///
/// `atlas_labels` are padded flat label buffers; `margin` and
/// `padded_strides` translate output coordinates into them. Idempotent:
/// inputs are read-only and each output voxel is decided independently.
pub fn consensus_prepass(
    atlas_labels: &[&[i32]],
    out_dims: (usize, usize, usize),
    margin: [usize; 3],
    padded_strides: [isize; 3],
    search: &NeighborhoodOffsets,
) -> ConsensusResult {
    let (nx, ny, nz) = out_dims;
    let total = nx * ny * nz;

    let verdicts: Vec<Option<i32>> = (0..total)
        .into_par_iter()
        .map(|idx| {
            let x = idx / (ny * nz);
            let y = (idx / nz) % ny;
            let z = idx % nz;
            let padded_center = (x + margin[0]) * padded_strides[0] as usize
                + (y + margin[1]) * padded_strides[1] as usize
                + (z + margin[2]) * padded_strides[2] as usize;
            unanimous_label(atlas_labels, padded_center, search)
        })
        .collect();

    // Consolidate
    let mut mask = Array3::<u8>::zeros(out_dims);
    let mut output = Array3::<i32>::zeros(out_dims);
    let mut consensus_voxels = 0usize;
    for (idx, verdict) in verdicts.into_iter().enumerate() {
        let coords = (idx / (ny * nz), (idx / nz) % ny, idx % nz);
        match verdict {
            Some(label) => {
                output[coords] = label;
                consensus_voxels += 1;
            }
            None => mask[coords] = 1,
        }
    }

    ConsensusResult {
        mask,
        output,
        consensus_voxels,
    }
}
