//! Packed normal unpacking.

use glam::Vec3;

/// Unpack a 2-byte octahedron-encoded normal.
///
/// Each byte maps to `[-1, 1]`; points outside the upper octahedron half are
/// folded back across the diagonals.
#[must_use]
pub fn unpack_oct16(bx: u8, by: u8) -> Vec3 {
    let u = f32::from(bx) / 255.0 * 2.0 - 1.0;
    let v = f32::from(by) / 255.0 * 2.0 - 1.0;
    let z = 1.0 - u.abs() - v.abs();

    let (x, y) = if z >= 0.0 {
        (u, v)
    } else {
        // `signum` is never zero for floats, so the folds are always defined.
        (
            -(v / v.signum() - 1.0) / u.signum(),
            -(u / u.signum() - 1.0) / v.signum(),
        )
    };

    Vec3::new(x, y, z).normalize_or_zero()
}

/// Unpack a 2-byte sphere-mapped normal.
#[must_use]
pub fn unpack_spheremapped(bx: u8, by: u8) -> Vec3 {
    let ex = f32::from(bx) / 255.0 * 4.0 - 2.0;
    let ey = f32::from(by) / 255.0 * 4.0 - 2.0;

    // Values outside the unit disk carry no valid normal; clamp to the rim.
    let l = (1.0 - (ex * ex + ey * ey)).max(0.0);
    let scale = l.sqrt();

    let nx = ex * scale * 2.0;
    let ny = ey * scale * 2.0;
    let nz = l * 2.0 - 1.0;

    Vec3::new(nx, ny, nz).normalize_or_zero()
}
