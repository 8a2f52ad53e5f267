//! Multi-Atlas Label Fusion
//!
//! Weighted-voting label fusion for 3D volumetric images. Given a target
//! intensity image and a set of co-registered atlases (intensity + label
//! pairs), the engine picks, per voxel, the best-matching intensity patch
//! in each atlas' search window, estimates how correlated the atlases'
//! labeling errors are from the patch residuals, solves a small
//! constrained least-squares system for atlas weights, and accumulates
//! neighborhood label votes into per-label posteriors before a final
//! argmax.
//!
//! ## f32/f64 support
//!
//! Intensity processing is generic over the [`FusionFloat`] trait; the
//! weight solver always runs in f64.
//!
//! Registration, histogram matching, and image I/O are the caller's
//! concern: all inputs must already share one voxel grid.

pub mod consensus;
pub mod engine;
pub mod error;
pub mod float_trait;
pub mod fusion;
pub mod image;
pub mod linalg;
pub mod neighborhood;
pub mod patch;
pub mod weights;

// Re-export the public surface at the crate root
pub use error::FusionError;
pub use float_trait::FusionFloat;
pub use fusion::{fuse, CancelToken, FusionConfig, FusionOutput};
pub use image::{AtlasPair, Image3D, GRID_SPACING_TOLERANCE};
pub use neighborhood::NeighborhoodOffsets;
pub use patch::{PatchMatch, PatchStats};
