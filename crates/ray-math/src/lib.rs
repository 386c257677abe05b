//! Ray/BVH math shared by the builders and the traversal kernel.
//!
//! Everything here is pure arithmetic on `glam` vectors:
//!
//! - [`Aabb`] - boxes in the `min`/`max` layout the node formats store
//! - [`morton_key`] - 63-bit interleaved spatial keys (21 bits per axis)
//! - [`invert_3x3`], [`transform_point`], [`transform_vector`] - affine helpers
//!   for 3x4 row-major instance transforms
//! - [`intersect_box4`], [`intersect_aabb`], [`intersect_triangle`] - the
//!   software intersection tests used when no intrinsic is available
//!
//! ## Example
//!
//! ```
//! use ray_math::{intersect_triangle, Vec3};
//!
//! let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
//! let hit = intersect_triangle(&tri, Vec3::new(0.25, 0.25, -1.0), Vec3::Z).unwrap();
//! assert_eq!(hit.distance(), 1.0);
//! ```

mod aabb;
mod intersect;
mod matrix;

pub use aabb::{morton_key, Aabb, MORTON_BITS};
pub use intersect::{intersect_aabb, intersect_box4, intersect_triangle, safe_inv_dir, TriangleHit, INVALID_CHILD};
pub use matrix::{invert_3x3, transform_point, transform_vector, world_to_object_point, Rows3x4};

pub use glam::{DVec3, Vec3, Vec4};
