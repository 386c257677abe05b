//! Axis-aligned bounding boxes and spatial sort keys.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::fmt;

use crate::matrix::Rows3x4;

/// Bits per axis in a [`morton_key`].
pub const MORTON_BITS: u32 = 21;

/// Axis-aligned box stored as `min` then `max`, matching the 24-byte
/// bounds layout used in every node format.
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Empty box (inverted, expands on first point).
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Marker for an unused child slot. Never intersects any ray.
    pub const NAN: Self = Self {
        min: Vec3::splat(f32::NAN),
        max: Vec3::splat(f32::NAN),
    };

    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box tightly enclosing `points`.
    pub fn from_points(points: &[Vec3]) -> Self {
        let mut b = Self::EMPTY;
        for p in points {
            b.expand_by_point(*p);
        }
        b
    }

    /// Box from the `[min.xyz, max.xyz]` float layout.
    #[inline]
    pub fn from_array(v: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(v[0], v[1], v[2]),
            max: Vec3::new(v[3], v[4], v[5]),
        }
    }

    #[inline]
    pub fn to_array(&self) -> [f32; 6] {
        [self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z]
    }

    /// True for an unused slot (only `min.x` is inspected).
    #[inline]
    pub fn is_nan(&self) -> bool {
        self.min.x.is_nan()
    }

    /// Check if this box has no volume.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    #[inline]
    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Expand to include another box. NaN slots are skipped.
    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_nan() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Bounds of this box after the affine transform `rows`.
    ///
    /// Each output axis starts at the translation and accumulates the
    /// smaller/larger of the two scaled extents per input axis.
    pub fn transformed(&self, rows: &Rows3x4) -> Self {
        let mut out = Self::new(Vec3::ZERO, Vec3::ZERO);
        for j in 0..3 {
            let mut lo = rows[j][3];
            let mut hi = rows[j][3];
            for k in 0..3 {
                let a = rows[j][k] * self.min[k];
                let b = rows[j][k] * self.max[k];
                lo += a.min(b);
                hi += a.max(b);
            }
            out.min[j] = lo;
            out.max[j] = hi;
        }
        out
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aabb({:?} - {:?})", self.min, self.max)
    }
}

/// Interleaved 3-axis key of `point` normalized into `bounds`.
///
/// Bit `j * 3 + k` holds bit `j` of the quantized coordinate on axis `k`.
/// Degenerate axes quantize to zero.
pub fn morton_key(point: Vec3, bounds: &Aabb) -> u64 {
    let scale = (1u32 << MORTON_BITS) as f32;
    let extent = bounds.size();

    let mut coords = [0u32; 3];
    for k in 0..3 {
        let norm = if extent[k] > 0.0 {
            (point[k] - bounds.min[k]) / extent[k]
        } else {
            0.0
        };
        // float-to-int casts saturate and map NaN to zero
        let q = (norm * scale) as i64;
        coords[k] = q.clamp(0, (1i64 << MORTON_BITS) - 1) as u32;
    }

    let mut key = 0u64;
    for j in 0..MORTON_BITS {
        for (k, c) in coords.iter().enumerate() {
            key |= (((c >> j) & 1) as u64) << (j * 3 + k as u32);
        }
    }
    key
}
