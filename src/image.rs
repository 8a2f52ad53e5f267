//! Dense 3D images with grid metadata.
//!
//! All inputs and outputs of the engine live on one shared voxel grid:
//! identical extents, spacing and orientation. The engine checks this once
//! at configuration time and then works on flat slices with precomputed
//! linear offsets (see `neighborhood`).

use ndarray::Array3;

/// Absolute tolerance for spacing and direction-cosine comparison.
pub const GRID_SPACING_TOLERANCE: f64 = 1e-5;

const IDENTITY_DIRECTION: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// A dense 3D array of samples plus the physical grid it lives on.
///
/// The backing array is always in standard (C) layout so that neighborhood
/// access can go through one flat slice and a table of signed linear
/// offsets.
#[derive(Debug, Clone)]
pub struct Image3D<T> {
    data: Array3<T>,
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: [[f64; 3]; 3],
}

impl<T> Image3D<T> {
    /// Wrap an array on the unit grid (spacing 1, origin 0, identity
    /// orientation).
    pub fn from_array(data: Array3<T>) -> Self {
        Self {
            data,
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: IDENTITY_DIRECTION,
        }
    }

    /// Wrap an array with explicit grid metadata.
    pub fn with_grid(
        data: Array3<T>,
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: [[f64; 3]; 3],
    ) -> Self {
        Self {
            data,
            spacing,
            origin,
            direction,
        }
    }

    /// Wrap an array on the same grid as `reference`. Used for outputs,
    /// which inherit the target's grid.
    pub fn on_grid_of<U>(data: Array3<T>, reference: &Image3D<U>) -> Self {
        Self {
            data,
            spacing: reference.spacing,
            origin: reference.origin,
            direction: reference.direction,
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn extents(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn direction(&self) -> [[f64; 3]; 3] {
        self.direction
    }

    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn into_data(self) -> Array3<T> {
        self.data
    }

    /// Flat view of the samples in standard layout.
    pub fn as_slice(&self) -> &[T] {
        self.data
            .as_slice()
            .expect("image array must be standard layout")
    }

    /// Same extents, and spacing/orientation equal within
    /// [`GRID_SPACING_TOLERANCE`]. Origin is intentionally not compared:
    /// co-registered inputs share one physical frame by construction and
    /// resampling tools keep origins bit-identical or not at all.
    pub fn same_grid<U>(&self, other: &Image3D<U>) -> bool {
        if self.data.dim() != other.data.dim() {
            return false;
        }
        for d in 0..3 {
            if (self.spacing[d] - other.spacing[d]).abs() > GRID_SPACING_TOLERANCE {
                return false;
            }
        }
        for r in 0..3 {
            for c in 0..3 {
                if (self.direction[r][c] - other.direction[r][c]).abs() > GRID_SPACING_TOLERANCE {
                    return false;
                }
            }
        }
        true
    }
}

impl<T: Copy> Image3D<T> {
    /// Widen the buffered region by `margin` voxels per side on each axis,
    /// replicating edge samples. This is the request-region expansion that
    /// lets every output voxel carry a full search + patch neighborhood.
    pub fn pad_replicate(&self, margin: [usize; 3]) -> Array3<T> {
        let (nx, ny, nz) = self.data.dim();
        let dims = [nx, ny, nz];
        Array3::from_shape_fn(
            (nx + 2 * margin[0], ny + 2 * margin[1], nz + 2 * margin[2]),
            |(i, j, k)| {
                let idx = [i, j, k];
                let mut src = [0usize; 3];
                for d in 0..3 {
                    // Replicate padding: clamp to the valid index range
                    src[d] = (idx[d] as isize - margin[d] as isize)
                        .max(0)
                        .min(dims[d] as isize - 1) as usize;
                }
                self.data[[src[0], src[1], src[2]]]
            },
        )
    }
}

/// One atlas: a co-registered intensity image and its discrete labels.
///
/// Read-only for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct AtlasPair<F> {
    pub intensity: Image3D<F>,
    pub labels: Image3D<i32>,
}

impl<F> AtlasPair<F> {
    pub fn new(intensity: Image3D<F>, labels: Image3D<i32>) -> Self {
        Self { intensity, labels }
    }
}

/// Linear strides of a standard-layout array with the given extents.
pub fn linear_strides(dims: (usize, usize, usize)) -> [isize; 3] {
    let (_, ny, nz) = dims;
    [(ny * nz) as isize, nz as isize, 1]
}
