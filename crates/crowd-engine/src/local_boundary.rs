use crowd_common::{PolyRef, Result, Vec3, dist_pt_seg_sqr_2d};

use crate::nav_query::{NavQuery, QueryFilter};

/// Hard cap on wall segments tracked per agent
pub const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    p: Vec3,
    q: Vec3,
    // squared distance used for pruning
    d: f32,
}

/// Wall segments around an agent, nearest first
#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: Vec3,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
    max_segs: usize,
}

impl LocalBoundary {
    pub fn new(max_segs: usize) -> Self {
        let max_segs = max_segs.min(MAX_LOCAL_SEGS);
        Self {
            center: Vec3::splat(f32::MAX),
            segs: Vec::with_capacity(max_segs),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
            max_segs,
        }
    }

    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segs.clear();
        self.polys.clear();
    }

    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        query: &dyn NavQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = pos;
        self.segs.clear();
        self.polys = query.find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
        )?;

        let range_sqr = collision_query_range * collision_query_range;
        for &poly in &self.polys {
            for (p, q) in query.poly_wall_segments(poly, filter)? {
                let (dist, _) = dist_pt_seg_sqr_2d(pos, p, q);
                if dist > range_sqr {
                    continue;
                }
                insert_sorted(&mut self.segs, self.max_segs, Segment { p, q, d: dist });
            }
        }

        Ok(())
    }

    /// False once any polygon the boundary was built from has become invalid
    pub fn is_valid(&self, query: &dyn NavQuery, filter: &QueryFilter) -> bool {
        !self.polys.is_empty()
            && self
                .polys
                .iter()
                .all(|&poly| query.is_valid_poly_ref(poly, filter))
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, i: usize) -> Option<(Vec3, Vec3)> {
        self.segs.get(i).map(|s| (s.p, s.q))
    }
}

fn insert_sorted(segs: &mut Vec<Segment>, max_segs: usize, seg: Segment) {
    let idx = segs.iter().position(|s| seg.d <= s.d).unwrap_or(segs.len());
    if idx >= max_segs {
        return;
    }
    if segs.len() >= max_segs {
        segs.pop();
    }
    segs.insert(idx, seg);
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new(MAX_LOCAL_SEGS)
    }
}
