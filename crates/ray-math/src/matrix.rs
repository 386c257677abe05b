//! Affine helpers for 3x4 row-major transforms.

use glam::Vec3;

/// Row-major 3x4 affine transform, the layout of instance records.
/// Column 3 holds the translation.
pub type Rows3x4 = [[f32; 4]; 3];

/// Inverse of a 3x3 matrix from its cofactors: `out[i][j] = cof[j][i] / det`.
///
/// Singular inputs produce non-finite entries, like the division they are.
pub fn invert_3x3(m: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut cof = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            let (r0, r1) = ((i + 1) % 3, (i + 2) % 3);
            let (c0, c1) = ((j + 1) % 3, (j + 2) % 3);
            // the cyclic ordering already carries the cofactor sign
            cof[i][j] = m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0];
        }
    }

    let det = m[0][0] * cof[0][0] + m[0][1] * cof[0][1] + m[0][2] * cof[0][2];

    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = cof[j][i] / det;
        }
    }
    out
}

/// `rows * (p, 1)`.
#[inline]
pub fn transform_point(rows: &Rows3x4, p: Vec3) -> Vec3 {
    Vec3::new(
        rows[0][0] * p.x + rows[0][1] * p.y + rows[0][2] * p.z + rows[0][3],
        rows[1][0] * p.x + rows[1][1] * p.y + rows[1][2] * p.z + rows[1][3],
        rows[2][0] * p.x + rows[2][1] * p.y + rows[2][2] * p.z + rows[2][3],
    )
}

/// `rows * (v, 0)`.
#[inline]
pub fn transform_vector(rows: &Rows3x4, v: Vec3) -> Vec3 {
    Vec3::new(
        rows[0][0] * v.x + rows[0][1] * v.y + rows[0][2] * v.z,
        rows[1][0] * v.x + rows[1][1] * v.y + rows[1][2] * v.z,
        rows[2][0] * v.x + rows[2][1] * v.y + rows[2][2] * v.z,
    )
}

/// Object-space position of `p` for an instance's world-to-object rows.
///
/// Those rows hold the inverse 3x3 in columns 0..3 and the *forward*
/// translation in column 3, so the translation is removed first.
#[inline]
pub fn world_to_object_point(wto: &Rows3x4, p: Vec3) -> Vec3 {
    let t = Vec3::new(wto[0][3], wto[1][3], wto[2][3]);
    transform_vector(wto, p - t)
}
