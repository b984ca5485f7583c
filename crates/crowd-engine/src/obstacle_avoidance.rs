//! Sampling based velocity obstacle avoidance
//!
//! Candidate velocities are scored against nearby agents (circles) and
//! walls (segments). Two sampling strategies are available: an adaptive
//! polar pattern aligned with the desired velocity, and a custom pattern
//! of (angle, radius) samples supplied by the caller. Both refine the best
//! candidate over several depth iterations with a shrinking radius.

use std::f32::consts::PI;

use crowd_common::{
    Vec3, dist_2d, dist_pt_seg_sqr_2d, dot_2d, isect_ray_seg, rotate_y, sqr, sweep_circle_circle,
    tri_area_2d,
};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;
/// Samples used from a custom pattern
pub const MAX_CUSTOM_SAMPLES: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct ObstacleCircle {
    pub p: Vec3,
    pub vel: Vec3,
    pub dvel: Vec3,
    pub rad: f32,
    // side selection during sampling
    dp: Vec3,
    np: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct ObstacleSegment {
    pub p: Vec3,
    pub q: Vec3,
    touch: bool,
}

/// Weights and sampling layout of one avoidance quality level
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleAvoidanceParams {
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    pub horiz_time: f32,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
    /// Custom sampling pattern. `None` selects adaptive sampling.
    pub pattern_idx: Option<u8>,
}

impl Default for ObstacleAvoidanceParams {
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
            pattern_idx: None,
        }
    }
}

/// Custom sampling layout: angles in radians relative to the desired
/// velocity, radii normalized to the sampling radius.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SamplingPattern {
    pub angles: Vec<f32>,
    pub radii: Vec<f32>,
}

impl SamplingPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one sample, `angle_deg` measured from the desired velocity
    pub fn add_sample(&mut self, angle_deg: f32, radius: f32) {
        self.angles.push(angle_deg.to_radians());
        self.radii.push(radius);
    }

    /// Adds the sample and its reflection across the desired velocity.
    /// Both are always added, so a sample on the axis appears twice.
    pub fn add_sample_with_mirror(&mut self, angle_deg: f32, radius: f32) {
        self.add_sample(angle_deg, radius);
        self.add_sample(-angle_deg, radius);
    }

    pub fn len(&self) -> usize {
        self.angles.len().min(self.radii.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,
    max_circles: usize,
    circles: Vec<ObstacleCircle>,
    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment { p, q, touch: false });
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Samples around the desired velocity with a polar pattern.
    /// Returns the chosen velocity and the number of evaluated samples.
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
    ) -> (Vec3, usize) {
        self.begin(pos, dvel, vmax, params);

        let ndivs = (params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
        let nrings = (params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
        let da = (1.0 / ndivs as f32) * PI * 2.0;

        let dir0 = normalize_2d(dvel);
        let dirs = [dir0, rotate_y(dir0, da * 0.5)];

        let mut pattern = Vec::with_capacity(ndivs * nrings + 1);
        pattern.push(Vec3::ZERO);
        for j in 0..nrings {
            let r = (nrings - j) as f32 / nrings as f32;
            let first = dirs[j % 2] * r;
            pattern.push(first);
            let mut cw = first;
            let mut ccw = first;
            for _ in (1..ndivs.saturating_sub(1)).step_by(2) {
                cw = rotate_y(cw, -da);
                ccw = rotate_y(ccw, da);
                pattern.push(cw);
                pattern.push(ccw);
            }
            if ndivs % 2 == 0 {
                pattern.push(rotate_y(ccw, da));
            }
        }

        self.refine(pos, rad, vmax, vel, dvel, &pattern, params.adaptive_depth)
    }

    /// Samples a custom pattern rotated to face the desired velocity.
    pub fn sample_velocity_custom(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        custom: &SamplingPattern,
    ) -> (Vec3, usize) {
        self.begin(pos, dvel, vmax, params);

        let dir = normalize_2d(dvel);
        let mut pattern = Vec::with_capacity(MAX_CUSTOM_SAMPLES + 1);
        pattern.push(Vec3::ZERO);
        for i in 0..custom.len().min(MAX_CUSTOM_SAMPLES) {
            pattern.push(rotate_y(dir, custom.angles[i]) * custom.radii[i]);
        }

        self.refine(pos, rad, vmax, vel, dvel, &pattern, params.adaptive_depth)
    }

    fn begin(&mut self, pos: Vec3, dvel: Vec3, vmax: f32, params: &ObstacleAvoidanceParams) {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / self.params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    #[allow(clippy::too_many_arguments)]
    fn refine(
        &self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        pattern: &[Vec3],
        depth: u8,
    ) -> (Vec3, usize) {
        let mut cr = vmax * (1.0 - self.params.vel_bias);
        let mut res = Vec3::new(dvel.x * self.params.vel_bias, 0.0, dvel.z * self.params.vel_bias);
        let mut ns = 0;
        let limit = sqr(vmax + 0.001);

        for _ in 0..depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;
            for sample in pattern {
                let vcand = Vec3::new(res.x + sample.x * cr, 0.0, res.z + sample.z * cr);
                if sqr(vcand.x) + sqr(vcand.z) > limit {
                    continue;
                }
                let penalty = self.process_sample(vcand, pos, rad, vel, dvel, min_penalty);
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

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            cir.dp = normalize_2d(cir.p - pos);
            let dv = cir.dvel - dvel;
            let a = tri_area_2d(Vec3::ZERO, cir.dp, dv);
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        let r01 = sqr(0.01);
        for seg in &mut self.segments {
            let (d, _) = dist_pt_seg_sqr_2d(pos, seg.p, seg.q);
            seg.touch = d < r01;
        }
    }

    fn process_sample(
        &self,
        vcand: Vec3,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
    ) -> f32 {
        let p = &self.params;
        let vpen = p.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = p.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        // Skip samples that cannot beat the current best even with no impact
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
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5)
                .min(dot_2d(cir.np, vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad) else {
                continue;
            };

            // Already overlapping: prefer moving out quickly
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
            let mut htmin = if seg.touch {
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Walls are avoided less than agents
            htmin *= 2.0;

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
}

fn normalize_2d(v: Vec3) -> Vec3 {
    let d = (v.x * v.x + v.z * v.z).sqrt();
    if d < 1e-6 {
        return Vec3::ZERO;
    }
    Vec3::new(v.x / d, 0.0, v.z / d)
}
