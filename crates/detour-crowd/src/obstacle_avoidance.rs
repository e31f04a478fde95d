//! Velocity obstacle avoidance
//!
//! Candidate velocities are sampled on a polar pattern aligned with the
//! desired velocity. Each candidate is scored by how far it strays from the
//! desired and current velocities, which side of the neighbours it passes and
//! how soon it would hit a neighbour or wall. The pattern is then refined
//! around the best sample, halving its radius at each depth step.

use std::f32::consts::PI;

use detour_common::{
    dt_distance_pt_seg_sqr_2d, dt_sqr, dt_tri_area_2d, dt_vdist_2d, dt_vdot_2d, dt_vnormalize, dt_vnormalize_2d,
    dt_vperp_2d, dt_vsub,
};

pub const DT_MAX_PATTERN_DIVS: usize = 32;
pub const DT_MAX_PATTERN_RINGS: usize = 4;

/// Number of avoidance quality tiers the crowd keeps
pub const DT_CROWD_MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct DtObstacleCircle {
    pub p: [f32; 3],    // Position of the obstacle
    pub vel: [f32; 3],  // Velocity of the obstacle
    pub dvel: [f32; 3], // Desired velocity of the obstacle
    pub rad: f32,
    pub dp: [f32; 3], // Direction to the obstacle, for side selection
    pub np: [f32; 3], // Preferred passing side
}

#[derive(Debug, Clone, Default)]
pub struct DtObstacleSegment {
    pub p: [f32; 3],
    pub q: [f32; 3],
    pub touch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DtObstacleAvoidanceParams {
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    pub horiz_time: f32,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for DtObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

impl DtObstacleAvoidanceParams {
    /// Preset for quality tier 0 (cheapest) to 3 (best); higher tiers clamp to 3
    pub fn for_quality(tier: u8) -> Self {
        let (divs, rings, depth) = match tier {
            0 => (5, 2, 1),
            1 => (5, 2, 2),
            2 => (7, 2, 3),
            _ => (7, 3, 3),
        };
        Self {
            vel_bias: 0.5,
            adaptive_divs: divs,
            adaptive_rings: rings,
            adaptive_depth: depth,
            ..Self::default()
        }
    }
}

/// Sweeps circle 0 moving with `v` against static circle 1
///
/// Returns the entry and exit times, or `None` if they never touch.
fn sweep_circle_circle(c0: &[f32; 3], r0: f32, v: &[f32; 3], c1: &[f32; 3], r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = dt_vsub(c1, c0);
    let r = r0 + r1;
    let c = dt_vdot_2d(&s, &s) - r * r;
    let a = dt_vdot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dt_vdot_2d(v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * a, (b + rd) * a))
}

/// Intersects the ray `ap + t * u` with segment `bp..bq`
fn isect_ray_seg(ap: &[f32; 3], u: &[f32; 3], bp: &[f32; 3], bq: &[f32; 3]) -> Option<f32> {
    let v = dt_vsub(bq, bp);
    let w = dt_vsub(ap, bp);
    let d = dt_vperp_2d(u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = dt_vperp_2d(&v, &w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = dt_vperp_2d(u, &w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

#[inline]
fn rotate_2d(v: &[f32; 3], ang: f32) -> [f32; 3] {
    let (s, c) = ang.sin_cos();
    [v[0] * c - v[2] * s, v[1], v[0] * s + v[2] * c]
}

/// Samples safe velocities around circles and segments
#[derive(Debug)]
pub struct DtObstacleAvoidanceQuery {
    params: DtObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,
    max_circles: usize,
    max_segments: usize,
    circles: Vec<DtObstacleCircle>,
    segments: Vec<DtObstacleSegment>,
}

impl DtObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: DtObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            max_segments,
            circles: Vec::with_capacity(max_circles),
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a moving circular obstacle; ignored once the query is full
    pub fn add_circle(&mut self, pos: &[f32; 3], rad: f32, vel: &[f32; 3], dvel: &[f32; 3]) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(DtObstacleCircle {
            p: *pos,
            vel: *vel,
            dvel: *dvel,
            rad,
            ..Default::default()
        });
    }

    /// Adds a wall segment; ignored once the query is full
    pub fn add_segment(&mut self, p: &[f32; 3], q: &[f32; 3]) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(DtObstacleSegment {
            p: *p,
            q: *q,
            touch: false,
        });
    }

    pub fn obstacle_circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn obstacle_segment_count(&self) -> usize {
        self.segments.len()
    }

    fn prepare(&mut self, pos: &[f32; 3], dvel: &[f32; 3]) {
        let orig = [0.0; 3];
        for cir in &mut self.circles {
            let mut dp = dt_vsub(&cir.p, pos);
            dt_vnormalize(&mut dp);
            cir.dp = dp;
            let dv = dt_vsub(&cir.dvel, dvel);

            let a = dt_tri_area_2d(&orig, &cir.dp, &dv);
            cir.np = if a < 0.01 {
                [-cir.dp[2], 0.0, cir.dp[0]]
            } else {
                [cir.dp[2], 0.0, -cir.dp[0]]
            };
        }

        for seg in &mut self.segments {
            // Precalc if the agent is really close to the segment
            let r = 0.01;
            let (dist_sqr, _) = dt_distance_pt_seg_sqr_2d(pos, &seg.p, &seg.q);
            seg.touch = dist_sqr < dt_sqr(r);
        }
    }

    /// Scores one candidate velocity; lower is better
    ///
    /// Bails out with `min_penalty` as soon as the candidate cannot beat it.
    fn process_sample(
        &self,
        vcand: &[f32; 3],
        pos: &[f32; 3],
        rad: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        min_penalty: f32,
    ) -> f32 {
        let p = &self.params;

        let vpen = p.weight_des_vel * (dt_vdist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = p.weight_cur_vel * (dt_vdist_2d(vcand, vel) * self.inv_vmax);

        // Hit time below which the candidate is already worse than the best so far
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (p.weight_toi / min_pen - 0.1) * p.horiz_time;
        if t_threshold - p.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = p.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // RVO
            let vab = [
                vcand[0] * 2.0 - vel[0] - cir.vel[0],
                vcand[1] * 2.0 - vel[1] - cir.vel[1],
                vcand[2] * 2.0 - vel[2] - cir.vel[2],
            ];

            side += (dt_vdot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(dt_vdot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, &vab, &cir.p, cir.rad) else {
                continue;
            };

            // Overlapping agents: avoid more
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                // Only moving away from a touched wall is allowed
                let sdir = dt_vsub(&seg.q, &seg.p);
                let snorm = [-sdir[2], 0.0, sdir[0]];
                if dt_vdot_2d(&snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, &seg.p, &seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Facing walls: avoid less
            let htmin = htmin * 2.0;

            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }

        let spen = p.weight_side * side;
        let tpen = p.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));

        vpen + vcpen + spen + tpen
    }

    /// Picks a velocity close to `dvel` that avoids the registered obstacles
    ///
    /// Returns the chosen velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &DtObstacleAvoidanceParams,
    ) -> ([f32; 3], usize) {
        self.prepare(pos, dvel);

        self.params = *params;
        self.inv_horiz_time = 1.0 / self.params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };

        // Sampling pattern aligned to the desired velocity
        let nd = (params.adaptive_divs as usize).clamp(1, DT_MAX_PATTERN_DIVS);
        let nr = (params.adaptive_rings as usize).clamp(1, DT_MAX_PATTERN_RINGS);
        let depth = params.adaptive_depth as usize;
        let da = (1.0 / nd as f32) * PI * 2.0;
        let (sa, ca) = da.sin_cos();

        let mut ddir0 = *dvel;
        dt_vnormalize_2d(&mut ddir0);
        let ddir1 = rotate_2d(&ddir0, da * 0.5);
        let ddir = [ddir0, ddir1];

        let mut pat: Vec<[f32; 2]> = Vec::with_capacity(DT_MAX_PATTERN_DIVS * DT_MAX_PATTERN_RINGS + 1);
        pat.push([0.0, 0.0]);

        for j in 0..nr {
            let r = (nr - j) as f32 / nr as f32;
            let dir = ddir[j % 2];
            pat.push([dir[0] * r, dir[2] * r]);
            let mut last1 = pat.len() - 1;
            let mut last2 = last1;

            let mut i = 1;
            while i + 1 < nd {
                // Next point on the right, rotating clockwise
                let [x1, y1] = pat[last1];
                pat.push([x1 * ca + y1 * sa, -x1 * sa + y1 * ca]);
                // Next point on the left, rotating counter clockwise
                let [x2, y2] = pat[last2];
                pat.push([x2 * ca - y2 * sa, x2 * sa + y2 * ca]);

                last1 = pat.len() - 2;
                last2 = pat.len() - 1;
                i += 2;
            }

            if nd & 1 == 0 {
                let [x2, y2] = pat[last2];
                pat.push([x2 * ca - y2 * sa, x2 * sa + y2 * ca]);
            }
        }

        // Refine around the best sample
        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = [dvel[0] * params.vel_bias, 0.0, dvel[2] * params.vel_bias];
        let mut ns = 0;

        for _ in 0..depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = [0.0; 3];

            for &[px, py] in &pat {
                let vcand = [res[0] + px * cr, 0.0, res[2] + py * cr];
                if dt_sqr(vcand[0]) + dt_sqr(vcand[2]) > dt_sqr(vmax + 0.001) {
                    continue;
                }

                let penalty = self.process_sample(&vcand, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (res, ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_circle_circle() {
        let hit = sweep_circle_circle(&[0.0; 3], 0.5, &[1.0, 0.0, 0.0], &[5.0, 0.0, 0.0], 0.5);
        let (tmin, tmax) = hit.unwrap();
        assert!((tmin - 4.0).abs() < 1e-4);
        assert!((tmax - 6.0).abs() < 1e-4);

        assert!(sweep_circle_circle(&[0.0; 3], 0.5, &[0.0, 0.0, 1.0], &[5.0, 0.0, 0.0], 0.5).is_none());
        assert!(sweep_circle_circle(&[0.0; 3], 0.5, &[0.0; 3], &[5.0, 0.0, 0.0], 0.5).is_none());
    }

    #[test]
    fn test_isect_ray_seg() {
        let t = isect_ray_seg(&[0.0; 3], &[2.0, 0.0, 0.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]);
        assert!((t.unwrap() - 0.5).abs() < 1e-5);

        // Parallel
        assert!(isect_ray_seg(&[0.0; 3], &[0.0, 0.0, 1.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]).is_none());
        // Segment beyond the ray
        assert!(isect_ray_seg(&[0.0; 3], &[0.5, 0.0, 0.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]).is_none());
    }

    #[test]
    fn test_quality_tiers() {
        let low = DtObstacleAvoidanceParams::for_quality(0);
        assert_eq!((low.adaptive_divs, low.adaptive_rings, low.adaptive_depth), (5, 2, 1));
        let high = DtObstacleAvoidanceParams::for_quality(3);
        assert_eq!((high.adaptive_divs, high.adaptive_rings, high.adaptive_depth), (7, 3, 3));
        assert_eq!(DtObstacleAvoidanceParams::for_quality(9), high);
        assert_eq!(high.vel_bias, 0.5);
    }

    #[test]
    fn test_free_space_keeps_desired_velocity() {
        let mut query = DtObstacleAvoidanceQuery::new(6, 8);
        let params = DtObstacleAvoidanceParams::for_quality(3);
        let dvel = [2.0, 0.0, 0.0];
        let (nvel, ns) = query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params);
        assert!(ns > 0);
        assert!((nvel[0] - 2.0).abs() < 0.2, "nvel {nvel:?}");
        assert!(nvel[2].abs() < 0.2);
    }

    #[test]
    fn test_steers_around_oncoming_agent() {
        let mut query = DtObstacleAvoidanceQuery::new(6, 8);
        let params = DtObstacleAvoidanceParams::default();
        let dvel = [2.0, 0.0, 0.0];
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[-2.0, 0.0, 0.0], &[-2.0, 0.0, 0.0]);
        assert_eq!(query.obstacle_circle_count(), 1);

        let (nvel, _) = query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params);
        // Head-on course would collide; the chosen velocity moves well away from it
        assert!(dt_vdist_2d(&nvel, &dvel) > 0.5, "nvel {nvel:?}");
    }

    #[test]
    fn test_capacity_limits() {
        let mut query = DtObstacleAvoidanceQuery::new(1, 1);
        query.add_circle(&[0.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_circle(&[1.0; 3], 1.0, &[0.0; 3], &[0.0; 3]);
        query.add_segment(&[0.0; 3], &[1.0, 0.0, 0.0]);
        query.add_segment(&[0.0; 3], &[0.0, 0.0, 1.0]);
        assert_eq!(query.obstacle_circle_count(), 1);
        assert_eq!(query.obstacle_segment_count(), 1);

        query.reset();
        assert_eq!(query.obstacle_circle_count(), 0);
        assert_eq!(query.obstacle_segment_count(), 0);
    }
}
