//! Vector and xz-plane geometry helpers on `[f32; 3]` positions
//!
//! The navigation mesh is y-up; most queries work on the horizontal xz-plane
//! and treat height separately.

/// Returns the square of the value
#[inline]
pub fn dt_sqr(a: f32) -> f32 {
    a * a
}

/// Clamps the value to the specified range
#[inline]
pub fn dt_clamp<T: PartialOrd>(v: T, mn: T, mx: T) -> T {
    if v < mn {
        mn
    } else if v > mx {
        mx
    } else {
        v
    }
}

#[inline]
pub fn dt_vadd(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn dt_vsub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn dt_vscale(v: &[f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Performs a scaled vector addition (v1 + (v2 * s))
#[inline]
pub fn dt_vmad(v1: &[f32; 3], v2: &[f32; 3], s: f32) -> [f32; 3] {
    [v1[0] + v2[0] * s, v1[1] + v2[1] * s, v1[2] + v2[2] * s]
}

/// Performs a linear interpolation between two vectors (v1 toward v2)
#[inline]
pub fn dt_vlerp(v1: &[f32; 3], v2: &[f32; 3], t: f32) -> [f32; 3] {
    [
        v1[0] + (v2[0] - v1[0]) * t,
        v1[1] + (v2[1] - v1[1]) * t,
        v1[2] + (v2[2] - v1[2]) * t,
    ]
}

#[inline]
pub fn dt_vdot(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    v1[0] * v2[0] + v1[1] * v2[1] + v1[2] * v2[2]
}

#[inline]
pub fn dt_vlen_sqr(v: &[f32; 3]) -> f32 {
    dt_vdot(v, v)
}

#[inline]
pub fn dt_vlen(v: &[f32; 3]) -> f32 {
    dt_vlen_sqr(v).sqrt()
}

#[inline]
pub fn dt_vdist_sqr(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    dt_vlen_sqr(&dt_vsub(v2, v1))
}

#[inline]
pub fn dt_vdist(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    dt_vdist_sqr(v1, v2).sqrt()
}

/// Derives the distance between the specified points on the xz-plane
#[inline]
pub fn dt_vdist_2d(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    dt_vdist_2d_sqr(v1, v2).sqrt()
}

/// Derives the square of the distance between the specified points on the xz-plane
#[inline]
pub fn dt_vdist_2d_sqr(v1: &[f32; 3], v2: &[f32; 3]) -> f32 {
    let dx = v2[0] - v1[0];
    let dz = v2[2] - v1[2];
    dx * dx + dz * dz
}

/// Normalizes the vector, leaving a zero vector untouched
#[inline]
pub fn dt_vnormalize(v: &mut [f32; 3]) {
    let len = dt_vlen(v);
    if len > 0.0 {
        let d = 1.0 / len;
        v[0] *= d;
        v[1] *= d;
        v[2] *= d;
    }
}

/// Normalizes the xz components and zeroes y
#[inline]
pub fn dt_vnormalize_2d(v: &mut [f32; 3]) {
    let len = (v[0] * v[0] + v[2] * v[2]).sqrt();
    v[1] = 0.0;
    if len > 0.0 {
        v[0] /= len;
        v[2] /= len;
    }
}

/// Performs a 'sloppy' colocation check of the specified points
#[inline]
pub fn dt_vequal(p0: &[f32; 3], p1: &[f32; 3]) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    dt_vdist_sqr(p0, p1) < THR * THR
}

/// Checks that the specified vector's components are all finite
#[inline]
pub fn dt_visfinite(v: &[f32; 3]) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// Derives the dot product of two vectors on the xz-plane
#[inline]
pub fn dt_vdot_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[0] * v[0] + u[2] * v[2]
}

/// Derives the xz-plane 2D perp product of the two vectors (uz*vx - ux*vz)
#[inline]
pub fn dt_vperp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

/// Derives the signed xz-plane area of the triangle ABC
///
/// Positive when C lies to the right of AB looking down from +y.
#[inline]
pub fn dt_tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// Determines if two axis-aligned bounding boxes overlap
#[inline]
pub fn dt_overlap_bounds(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Determines if two quantized axis-aligned bounding boxes overlap
#[inline]
pub fn dt_overlap_quant_bounds(amin: &[u16; 3], amax: &[u16; 3], bmin: &[u16; 3], bmax: &[u16; 3]) -> bool {
    !(amin[0] > bmax[0]
        || amax[0] < bmin[0]
        || amin[1] > bmax[1]
        || amax[1] < bmin[1]
        || amin[2] > bmax[2]
        || amax[2] < bmin[2])
}

/// Derives the height of a point that lies inside the triangle ABC on the xz-plane
pub fn dt_closest_height_point_triangle(p: &[f32; 3], a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let v0 = dt_vsub(c, a);
    let v1 = dt_vsub(b, a);
    let v2 = dt_vsub(p, a);

    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];

    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= 0.0 && v >= 0.0 && (u + v) <= denom {
        return Some(a[1] + (v0[1] * u + v1[1] * v) / denom);
    }

    None
}

/// Distance squared from a point to a segment on the xz-plane
///
/// Returns the squared distance and the parameter of the closest point along `p..q`.
pub fn dt_distance_pt_seg_sqr_2d(pt: &[f32; 3], p: &[f32; 3], q: &[f32; 3]) -> (f32, f32) {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = dt_clamp(t, 0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    (dx * dx + dz * dz, t)
}

/// Determines if the specified point is inside the polygon on the xz-plane
pub fn dt_point_in_polygon(pt: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let mut inside = false;
    let n = verts.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Point-in-polygon test plus squared distance to every edge
///
/// Edge `j` runs from `verts[j]` to `verts[j + 1]`.
pub fn dt_distance_pt_poly_edges_sqr(pt: &[f32; 3], verts: &[[f32; 3]]) -> (bool, Vec<f32>, Vec<f32>) {
    let n = verts.len();
    let mut ed = vec![0.0; n];
    let mut et = vec![0.0; n];
    for j in 0..n {
        let (d, t) = dt_distance_pt_seg_sqr_2d(pt, &verts[j], &verts[(j + 1) % n]);
        ed[j] = d;
        et[j] = t;
    }
    (dt_point_in_polygon(pt, verts), ed, et)
}

/// Intersection of the segment `p0..p1` with a convex polygon on the xz-plane
///
/// Returns `(tmin, tmax, seg_min, seg_max)` where the segment indices name the
/// polygon edges the segment enters and leaves through, or -1 when the
/// corresponding endpoint lies inside the polygon.
pub fn dt_intersect_segment_poly_2d(p0: &[f32; 3], p1: &[f32; 3], verts: &[[f32; 3]]) -> Option<(f32, f32, i32, i32)> {
    const EPS: f32 = 0.000_000_01;

    let mut tmin = 0.0f32;
    let mut tmax = 1.0f32;
    let mut seg_min = -1i32;
    let mut seg_max = -1i32;

    let dir = dt_vsub(p1, p0);

    let n = verts.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let edge = dt_vsub(&verts[i], &verts[j]);
        let diff = dt_vsub(p0, &verts[j]);
        let num = dt_vperp_2d(&edge, &diff);
        let den = dt_vperp_2d(&dir, &edge);
        if den.abs() < EPS {
            // Segment parallel to this edge
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            // Entering across this edge
            if t > tmin {
                tmin = t;
                seg_min = j as i32;
                if tmin > tmax {
                    return None;
                }
            }
        } else if t < tmax {
            tmax = t;
            seg_max = j as i32;
            if tmax < tmin {
                return None;
            }
        }
        j = i;
    }

    Some((tmin, tmax, seg_min, seg_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square() -> Vec<[f32; 3]> {
        vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 0.0, 0.0]]
    }

    #[test]
    fn test_point_in_polygon() {
        let square = unit_square();
        assert!(dt_point_in_polygon(&[0.5, 3.0, 0.5], &square));
        assert!(!dt_point_in_polygon(&[1.5, 0.0, 0.5], &square));
        assert!(!dt_point_in_polygon(&[0.5, 0.0, -0.1], &square));
    }

    #[test]
    fn test_segment_leaving_polygon() {
        let square = unit_square();
        let (tmin, tmax, seg_min, seg_max) =
            dt_intersect_segment_poly_2d(&[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &square).unwrap();
        assert_eq!(tmin, 0.0);
        assert!((tmax - 0.5).abs() < 1e-5);
        assert_eq!(seg_min, -1);
        // Edge 2 runs from (1,1) to (1,0)
        assert_eq!(seg_max, 2);
    }

    #[test]
    fn test_segment_inside_polygon() {
        let square = unit_square();
        let (_, tmax, _, seg_max) =
            dt_intersect_segment_poly_2d(&[0.2, 0.0, 0.2], &[0.8, 0.0, 0.8], &square).unwrap();
        assert_eq!(tmax, 1.0);
        assert_eq!(seg_max, -1);
    }

    #[test]
    fn test_distance_to_segment() {
        let (d, t) = dt_distance_pt_seg_sqr_2d(&[0.5, 9.0, 1.0], &[0.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_height_inside_triangle() {
        let a = [0.0, 1.0, 0.0];
        let b = [0.0, 1.0, 2.0];
        let c = [2.0, 3.0, 0.0];
        let h = dt_closest_height_point_triangle(&[0.5, 0.0, 0.5], &a, &b, &c).unwrap();
        assert!((h - 1.5).abs() < 1e-5);
        assert!(dt_closest_height_point_triangle(&[3.0, 0.0, 3.0], &a, &b, &c).is_none());
    }

    #[test]
    fn test_tri_area_sign_follows_winding() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        assert!(dt_tri_area_2d(&a, &b, &[0.5, 0.0, -1.0]) > 0.0);
        assert!(dt_tri_area_2d(&a, &b, &[0.5, 0.0, 1.0]) < 0.0);
    }
}
