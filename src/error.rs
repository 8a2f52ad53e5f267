//! Error kinds surfaced by the fusion engine.

use thiserror::Error;

/// Failure modes of a fusion run.
///
/// Low-contrast patches are not errors; their statistics are clamped so the
/// per-voxel math stays total. Everything here is surfaced to the caller;
/// nothing is swallowed.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Mismatched grids, empty atlas list, degenerate radii, negative
    /// parameters. Raised at configuration time, before any allocation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Both the Cholesky and SVD solve paths failed for one voxel's weight
    /// system. The whole fusion aborts; partial outputs must be discarded.
    #[error("numeric failure at voxel {voxel:?}: weight system has no usable solution")]
    NumericFailure { voxel: [usize; 3] },

    /// Requested diagnostic buffers exceed the caller-supplied budget.
    /// Raised at allocation time, before processing begins.
    #[error("weight maps require {requested} bytes but the budget is {budget} bytes")]
    ResourceExhaustion { requested: usize, budget: usize },

    /// The cancellation token was observed between voxels. Buffers are left
    /// in a defined but incomplete state; the caller discards them.
    #[error("fusion cancelled")]
    Cancelled,
}
