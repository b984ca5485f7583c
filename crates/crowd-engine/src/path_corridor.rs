//! Path corridor for smooth path following
//!
//! A corridor is the polygon path from the agent's current position to its
//! target. The front of the corridor is kept in sync with the agent as it
//! moves, and the rest is shortened whenever a visibility or topology
//! shortcut is found.

use crowd_common::{Error, PolyRef, Result, Vec3, dist_2d, dist_sqr_2d, sqr};

use crate::nav_query::{LinkFilter, NavQuery, QueryFilter, StraightPathFlags, StraightPathPoint};

/// Corners closer than this to the agent are dropped
const MIN_TARGET_DIST: f32 = 0.01;
/// Polygons searched by one topology optimization
const MAX_TOPOLOGY_RES: usize = 32;

/// Path corridor for smooth path following
#[derive(Debug, Clone, Default)]
pub struct PathCorridor {
    pos: Vec3,
    target: Vec3,
    path: Vec<PolyRef>,
}

impl PathCorridor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapses the corridor to a single polygon at `pos`
    pub fn reset(&mut self, poly: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if poly.is_valid() {
            self.path.push(poly);
        }
    }

    /// Finds the corners of the straight path toward the target.
    ///
    /// Corners closer than a small threshold are pruned, and the list is
    /// cut after the first off-mesh connection.
    pub fn find_corners(
        &self,
        max_corners: usize,
        query: &dyn NavQuery,
    ) -> Result<Vec<StraightPathPoint>> {
        if self.path.is_empty() {
            return Ok(Vec::new());
        }

        let mut corners = query.find_straight_path(self.pos, self.target, &self.path, max_corners)?;

        let keep_from = corners
            .iter()
            .position(|c| {
                c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    || dist_sqr_2d(c.pos, self.pos) > sqr(MIN_TARGET_DIST)
            })
            .unwrap_or(corners.len());
        corners.drain(..keep_from);

        if let Some(i) = corners
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.truncate(i + 1);
        }

        Ok(corners)
    }

    /// Shortcuts the front of the path when `next` is directly visible.
    ///
    /// With `single_area` set the shortcut is only taken if every polygon
    /// crossed by the ray shares the area of the first polygon.
    pub fn optimize_path_visibility(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        single_area: bool,
        query: &dyn NavQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let Some(&first) = self.path.first() else {
            return Ok(());
        };

        // Clamp the ray to max distance
        let dist = dist_2d(self.pos, next);
        if dist < 0.01 {
            return Ok(());
        }
        // Overshoot a little to get past the corner
        let ray_len = (dist + 0.01).min(path_optimization_range);
        let goal = self.pos + (next - self.pos) * (ray_len / dist);

        let hit = query.raycast(first, self.pos, goal, filter)?;
        if hit.visited.len() <= 1 || hit.t <= 0.99 {
            return Ok(());
        }

        if single_area {
            let area = query.poly_area(hit.visited[0]);
            if hit.visited.iter().any(|&p| query.poly_area(p) != area) {
                return Ok(());
            }
        }

        self.path = merge_corridor_start_shortcut(&self.path, &hit.visited);
        Ok(())
    }

    /// Replans the corridor between its first and last polygon and merges
    /// the result when it is a shortcut. Returns true if a search was run.
    pub fn optimize_path_topology(
        &mut self,
        query: &dyn NavQuery,
        filter: &QueryFilter,
        link_filter: Option<&dyn LinkFilter>,
    ) -> Result<bool> {
        if self.path.len() < 3 {
            return Ok(false);
        }

        let res = query.find_path(
            self.path[0],
            self.path[self.path.len() - 1],
            self.pos,
            self.target,
            filter,
            link_filter,
            MAX_TOPOLOGY_RES,
        )?;
        if !res.is_empty() {
            self.path = merge_corridor_start_shortcut(&self.path, &res);
        }
        Ok(true)
    }

    /// Advances the corridor over the off-mesh link `link`.
    ///
    /// Returns the polygon before the link and the link's start and end
    /// points. When `prune` is set the path is advanced past the link and
    /// the corridor position moves to the link end, otherwise the corridor
    /// is left untouched until [`PathCorridor::prune_through`] is called.
    pub fn move_over_offmesh_connection(
        &mut self,
        link: PolyRef,
        prune: bool,
        query: &dyn NavQuery,
    ) -> Result<(PolyRef, Vec3, Vec3)> {
        let npos = self
            .path
            .iter()
            .position(|&p| p == link)
            .ok_or(Error::InvalidPolyRef(link))?;
        let prev = if npos > 0 { self.path[npos - 1] } else { PolyRef::NULL };

        let (start, end) = query.off_mesh_connection_end_points(prev, link)?;
        if prune {
            self.path.drain(..=npos);
            self.pos = end;
        }
        Ok((prev, start, end))
    }

    /// Drops every polygon up to and including `poly` and moves the
    /// corridor position to `pos`. No-op if `poly` is not in the path.
    pub fn prune_through(&mut self, poly: PolyRef, pos: Vec3) -> bool {
        match self.path.iter().position(|&p| p == poly) {
            Some(i) if i + 1 < self.path.len() => {
                self.path.drain(..=i);
                self.pos = pos;
                true
            }
            _ => false,
        }
    }

    /// Moves the corridor start along the surface toward `npos`.
    ///
    /// Polygons passed over are removed from the front of the path. The
    /// corridor position is the constrained result of the move.
    pub fn move_position(
        &mut self,
        npos: Vec3,
        query: &dyn NavQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        let Some(&first) = self.path.first() else {
            return Ok(false);
        };

        let (result, visited) = query.move_along_surface(first, self.pos, npos, filter)?;
        self.path = merge_corridor_start_moved(&self.path, &visited);
        self.pos = result;
        Ok(true)
    }

    /// Replaces the first polygon with a known good one
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) {
        self.pos = safe_pos;
        match self.path.iter().position(|&p| p == safe_ref) {
            Some(i) => {
                self.path.drain(..i);
            }
            None if self.path.is_empty() => self.path.push(safe_ref),
            None => self.path[0] = safe_ref,
        }
    }

    /// Cuts the path at the first invalid polygon
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        query: &dyn NavQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        let n = self
            .path
            .iter()
            .take_while(|&&p| query.is_valid_poly_ref(p, filter))
            .count();
        if n == self.path.len() {
            return Ok(());
        }
        if n == 0 {
            self.pos = safe_pos;
            self.path = vec![safe_ref];
        } else {
            self.path.truncate(n);
        }

        // Clamp target to the new last polygon
        self.target = query.closest_point_on_poly(self.path[self.path.len() - 1], self.target)?;
        Ok(())
    }

    /// True if the first `max_look_ahead` polygons are still valid
    pub fn is_valid(&self, max_look_ahead: usize, query: &dyn NavQuery, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&p| query.is_valid_poly_ref(p, filter))
    }

    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.target = target;
        self.path = path.to_vec();
    }

    pub fn get_pos(&self) -> Vec3 {
        self.pos
    }

    pub fn get_target(&self) -> Vec3 {
        self.target
    }

    pub fn get_path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn get_path_count(&self) -> usize {
        self.path.len()
    }

    pub fn get_first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn get_last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}

/// Furthest polygon of `path` that also appears in `visited`, paired with
/// the index of its first occurrence in `visited`.
fn furthest_common(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, p)| visited.iter().position(|v| v == p).map(|j| (i, j)))
}

/// Merges the polygons visited while moving the start of the corridor.
///
/// The visited polygons after the furthest common one are prepended in
/// reverse order, replacing the path up to that polygon.
pub fn merge_corridor_start_moved(path: &[PolyRef], visited: &[PolyRef]) -> Vec<PolyRef> {
    let Some((fp, fv)) = furthest_common(path, visited) else {
        return path.to_vec();
    };
    visited[fv..]
        .iter()
        .rev()
        .chain(path[(fp + 1).min(path.len())..].iter())
        .copied()
        .collect()
}

/// Merges a shortcut found from the start of the corridor
pub fn merge_corridor_start_shortcut(path: &[PolyRef], visited: &[PolyRef]) -> Vec<PolyRef> {
    match furthest_common(path, visited) {
        Some((fp, fv)) if fv > 0 => visited[..fv].iter().chain(path[fp..].iter()).copied().collect(),
        _ => path.to_vec(),
    }
}
