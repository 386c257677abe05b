//! Math type re-exports.
//!
//! Vector types come from `glam`; boxes, affine helpers and the
//! intersection routines come from the `ray-math` workspace crate.

pub use glam::{DVec3, Mat3, UVec3, Vec2, Vec3, Vec3A, Vec4};

pub use ray_math::{
    intersect_aabb, intersect_box4, intersect_triangle, invert_3x3, morton_key, safe_inv_dir,
    transform_point, transform_vector, world_to_object_point, Aabb, Rows3x4, TriangleHit,
    INVALID_CHILD,
};

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Integer division rounding up.
#[inline]
pub const fn div_round_up(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(56, 128), 128);
        assert_eq!(align_up(128, 128), 128);
    }

    #[test]
    fn test_div_round_up() {
        assert_eq!(div_round_up(0, 4), 0);
        assert_eq!(div_round_up(5, 4), 2);
        assert_eq!(div_round_up(1024, 1024), 1);
    }
}
