//! Software ray intersection tests.
//!
//! These are the portable paths the traversal falls back to when no
//! box/triangle intrinsic is installed.

use glam::Vec3;

use crate::Aabb;

/// Child slot value meaning "no child" in box test results.
pub const INVALID_CHILD: u32 = 0xFFFF_FFFF;

/// `1 / dir` clamped to the finite range, so zero components do not
/// poison the slab test with `0 * inf` NaNs.
#[inline]
pub fn safe_inv_dir(dir: Vec3) -> Vec3 {
    dir.recip().clamp(Vec3::splat(-f32::MAX), Vec3::splat(f32::MAX))
}

/// Tests a ray against the four child boxes of an internal node.
///
/// A child survives when its box is not NaN, `tmax >= max(0, tmin)` and
/// `tmin < ray_tmax`. Survivors are returned nearest first; culled slots
/// hold [`INVALID_CHILD`] and sort behind every survivor.
pub fn intersect_box4(
    children: &[u32; 4],
    bounds: &[Aabb; 4],
    origin: Vec3,
    inv_dir: Vec3,
    ray_tmax: f32,
) -> [u32; 4] {
    let mut distances = [f32::INFINITY; 4];
    let mut ids = [INVALID_CHILD; 4];

    for i in 0..4 {
        let b = &bounds[i];
        if b.is_nan() {
            continue;
        }
        let b0 = (b.min - origin) * inv_dir;
        let b1 = (b.max - origin) * inv_dir;
        let tmin = b0.min(b1).max_element();
        let tmax = b0.max(b1).min_element();

        if tmax >= tmin.max(0.0) && tmin < ray_tmax {
            ids[i] = children[i];
            distances[i] = tmin;
        }
    }

    // sorting network for four lanes
    for (a, b) in [(0, 1), (2, 3), (0, 2), (1, 3), (1, 2)] {
        if distances[b] < distances[a] {
            distances.swap(a, b);
            ids.swap(a, b);
        }
    }
    ids
}

/// Slab interval of a ray against a single box.
///
/// Axes the ray runs parallel to contribute an unbounded range while the
/// origin lies inside that slab, and an empty one otherwise.
/// Returns `(t_enter, t_exit)`; the ray misses when `t_enter > t_exit`.
pub fn intersect_aabb(aabb: &Aabb, origin: Vec3, dir: Vec3, inv_dir: Vec3) -> (f32, f32) {
    let lo = (aabb.min - origin) * inv_dir;
    let hi = (aabb.max - origin) * inv_dir;
    let mut t0 = lo.min(hi);
    let mut t1 = lo.max(hi);
    for k in 0..3 {
        if dir[k] == 0.0 {
            if origin[k] < aabb.min[k] || origin[k] > aabb.max[k] {
                return (f32::INFINITY, f32::NEG_INFINITY);
            }
            t0[k] = f32::NEG_INFINITY;
            t1[k] = f32::INFINITY;
        }
    }
    (t0.max_element(), t1.min_element())
}

/// Unnormalized result of [`intersect_triangle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleHit {
    /// Scaled hit distance; divide by `det`.
    pub t: f32,
    pub det: f32,
    pub v: f32,
    pub w: f32,
}

impl TriangleHit {
    /// Ray parameter of the hit.
    #[inline]
    pub fn distance(&self) -> f32 {
        self.t / self.det
    }

    /// Barycentric weights of the second and third vertex.
    #[inline]
    pub fn barycentrics(&self) -> [f32; 2] {
        [self.v / self.det, self.w / self.det]
    }

    /// Clockwise winding as seen from the ray origin.
    #[inline]
    pub fn is_front_facing(&self) -> bool {
        self.det < 0.0
    }
}

/// Watertight ray/triangle test.
///
/// The ray is permuted so its dominant axis becomes z, then vertices are
/// sheared into ray space and tested with 2D edge functions. Any edge value
/// of exactly zero is re-evaluated in double precision. Edge values of mixed
/// sign miss; so does a hit behind the origin.
pub fn intersect_triangle(verts: &[Vec3; 3], origin: Vec3, dir: Vec3) -> Option<TriangleHit> {
    let abs = dir.abs();
    let kz = if abs.x >= abs.y {
        if abs.x >= abs.z { 0 } else { 2 }
    } else if abs.y >= abs.z {
        1
    } else {
        2
    };
    let mut kx = (kz + 1) % 3;
    let mut ky = (kx + 1) % 3;
    if dir[kz] < 0.0 {
        std::mem::swap(&mut kx, &mut ky);
    }

    let sz = 1.0 / dir[kz];
    let sx = dir[kx] * sz;
    let sy = dir[ky] * sz;

    let a = verts[0] - origin;
    let b = verts[1] - origin;
    let c = verts[2] - origin;

    let ax = a[kx] - sx * a[kz];
    let ay = a[ky] - sy * a[kz];
    let bx = b[kx] - sx * b[kz];
    let by = b[ky] - sy * b[kz];
    let cx = c[kx] - sx * c[kz];
    let cy = c[ky] - sy * c[kz];

    let mut u = cx * by - cy * bx;
    let mut v = ax * cy - ay * cx;
    let mut w = bx * ay - by * ax;

    if u == 0.0 || v == 0.0 || w == 0.0 {
        let (ax, ay, bx, by, cx, cy) = (
            ax as f64, ay as f64, bx as f64, by as f64, cx as f64, cy as f64,
        );
        u = (cx * by - cy * bx) as f32;
        v = (ax * cy - ay * cx) as f32;
        w = (bx * ay - by * ax) as f32;
    }

    let any_neg = u < 0.0 || v < 0.0 || w < 0.0;
    let any_pos = u > 0.0 || v > 0.0 || w > 0.0;
    if any_neg && any_pos {
        return None;
    }

    let det = u + v + w;
    let az = sz * a[kz];
    let bz = sz * b[kz];
    let cz = sz * c[kz];
    let t = u * az + v * bz + w * cz;

    if sign(det) * t < 0.0 {
        return None;
    }
    Some(TriangleHit { t, det, v, w })
}

/// GLSL-style sign: zero maps to zero.
#[inline]
fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
