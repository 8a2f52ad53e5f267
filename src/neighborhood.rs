//! Precomputed neighborhood offset tables.
//!
//! A cubic neighborhood of radius `r` over an image with linear strides
//! `s` is addressed as `center + offset` on the flat sample buffer. The
//! table iterates the cube in lexicographic order over relative offsets
//! `(-r_d ..= r_d)`, so selection passes that tie-break on "first
//! encountered" are deterministic.
//!
//! Offsets are only valid against buffers whose every addressed voxel is
//! in range; the engine guarantees this by padding inputs by
//! `patch_radius + search_radius` before building tables.

/// Offset table for one cubic neighborhood.
#[derive(Debug, Clone)]
pub struct NeighborhoodOffsets {
    radius: [usize; 3],
    linear: Vec<isize>,
    relative: Vec<[i64; 3]>,
    manhattan: Vec<u32>,
}

impl NeighborhoodOffsets {
    /// Build the table for `radius` over an image with the given linear
    /// strides. Deterministic and total; `len() == ∏(2·radius_d + 1)`.
    pub fn new(radius: [usize; 3], strides: [isize; 3]) -> Self {
        let count = (2 * radius[0] + 1) * (2 * radius[1] + 1) * (2 * radius[2] + 1);
        let mut linear = Vec::with_capacity(count);
        let mut relative = Vec::with_capacity(count);
        let mut manhattan = Vec::with_capacity(count);

        let r = [radius[0] as i64, radius[1] as i64, radius[2] as i64];
        for dx in -r[0]..=r[0] {
            for dy in -r[1]..=r[1] {
                for dz in -r[2]..=r[2] {
                    linear.push(
                        dx as isize * strides[0] + dy as isize * strides[1] + dz as isize * strides[2],
                    );
                    relative.push([dx, dy, dz]);
                    manhattan.push((dx.unsigned_abs() + dy.unsigned_abs() + dz.unsigned_abs()) as u32);
                }
            }
        }

        Self {
            radius,
            linear,
            relative,
            manhattan,
        }
    }

    pub fn len(&self) -> usize {
        self.linear.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linear.is_empty()
    }

    pub fn radius(&self) -> [usize; 3] {
        self.radius
    }

    /// Signed linear offsets, in table order.
    pub fn linear(&self) -> &[isize] {
        &self.linear
    }

    /// Relative voxel coordinates, in table order.
    pub fn relative(&self) -> &[[i64; 3]] {
        &self.relative
    }

    /// Manhattan distance of each entry from the neighborhood center.
    pub fn manhattan(&self) -> &[u32] {
        &self.manhattan
    }

    /// Largest Manhattan distance in the table (`Σ_d radius_d`).
    pub fn max_manhattan(&self) -> u32 {
        (self.radius[0] + self.radius[1] + self.radius[2]) as u32
    }
}
