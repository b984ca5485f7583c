//! Vector helpers for agents moving on the XZ plane

use glam::Vec3;

/// Square a value (x²)
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Linear interpolation between two values
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Dot product ignoring the Y axis
#[inline]
pub fn dot_2d(a: Vec3, b: Vec3) -> f32 {
    a.x * b.x + a.z * b.z
}

/// Perp-dot product ignoring the Y axis
#[inline]
pub fn perp_2d(a: Vec3, b: Vec3) -> f32 {
    a.z * b.x - a.x * b.z
}

#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

#[inline]
pub fn dist_sqr_2d(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

#[inline]
pub fn len_2d(v: Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

/// Returns `v` with the Y component cleared
#[inline]
pub fn flatten(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

/// Signed area of triangle `abc` on the XZ plane (twice the area)
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Squared distance from `pt` to segment `pq` on the XZ plane,
/// together with the parametric position of the closest point.
pub fn dist_pt_seg_sqr_2d(pt: Vec3, p: Vec3, q: Vec3) -> (f32, f32) {
    let pqx = q.x - p.x;
    let pqz = q.z - p.z;
    let dx = pt.x - p.x;
    let dz = pt.z - p.z;
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    let dx = p.x + t * pqx - pt.x;
    let dz = p.z + t * pqz - pt.z;
    (dx * dx + dz * dz, t)
}

/// Rotates `v` around the Y axis by `angle` radians
#[inline]
pub fn rotate_y(v: Vec3, angle: f32) -> Vec3 {
    let (sn, cs) = angle.sin_cos();
    Vec3::new(v.x * cs - v.z * sn, v.y, v.x * sn + v.z * cs)
}

/// Time interval during which two moving circles overlap.
///
/// `c0` moves with relative velocity `v` toward the static circle `c1`.
/// Returns `None` when they never touch.
pub fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * a, (b + rd) * a))
}

/// Parametric hit distance of the ray `ap + t * u` against segment `bp..bq`
pub fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(v, w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}
