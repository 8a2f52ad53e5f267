//! Float trait abstraction for f32/f64 support.
//!
//! The fusion engine is generic over the intensity sample type. Patch
//! statistics and posterior accumulation run in the caller's precision;
//! the weight solver always runs in f64 (see `weights`).

use num_traits::{Float, FromPrimitive, NumAssign};
use std::fmt::Debug;
use std::iter::Sum;

/// Trait alias for floating point types supported by the fusion engine.
///
/// Combines the bounds needed across the pipeline:
/// - basic float operations (Float, NumAssign)
/// - conversion from primitive types (FromPrimitive)
/// - iteration support (Sum)
/// - thread safety for the parallel main loop
pub trait FusionFloat:
    Float + FromPrimitive + NumAssign + Sum + Debug + Send + Sync + 'static
{
    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Widen to f64 for the weight solver.
    fn to_f64_c(self) -> f64;
}

impl FusionFloat for f32 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self as f64
    }
}

impl FusionFloat for f64 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn to_f64_c(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_trait_impl() {
        let val: f32 = FusionFloat::from_f64_c(0.25);
        assert_eq!(val, 0.25f32);

        let usize_val: f32 = FusionFloat::usize_as(42);
        assert_eq!(usize_val, 42.0f32);

        assert_eq!(0.5f32.to_f64_c(), 0.5f64);
    }

    #[test]
    fn test_f64_trait_impl() {
        let val: f64 = FusionFloat::from_f64_c(0.25);
        assert_eq!(val, 0.25f64);

        let usize_val: f64 = FusionFloat::usize_as(42);
        assert_eq!(usize_val, 42.0f64);

        assert_eq!(0.5f64.to_f64_c(), 0.5f64);
    }
}
