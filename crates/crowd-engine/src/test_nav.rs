//! Deterministic grid navigation data for tests
//!
//! Every open cell of a `width x height` grid is one square polygon on the
//! `y = 0` plane. Cells are connected to their four neighbours, and
//! off-mesh links can join arbitrary cells. Polygon references are
//! `1 + x + z * width` for cells followed by one reference per link.

use std::collections::{HashMap, HashSet, VecDeque};

use crowd_common::{Error, PolyRef, Result, Vec3, dist_sqr_2d};

use crate::nav_query::{
    LinkFilter, NavQuery, QueryFilter, RaycastHit, StraightPathFlags, StraightPathPoint,
};

const WALK_FLAG: u16 = 0x01;
const STEP: f32 = 0.02;

/// Off-mesh link between two cells
#[derive(Debug, Clone)]
pub struct GridLink {
    pub start: Vec3,
    pub end: Vec3,
    pub user_id: u32,
    pub bidirectional: bool,
}

#[derive(Debug, Clone)]
pub struct GridNavMesh {
    width: i32,
    height: i32,
    cell_size: f32,
    blocked: HashSet<(i32, i32)>,
    areas: HashMap<(i32, i32), u8>,
    flags: HashMap<(i32, i32), u16>,
    links: Vec<GridLink>,
}

impl GridNavMesh {
    pub fn new(width: i32, height: i32, cell_size: f32) -> Self {
        Self {
            width,
            height,
            cell_size,
            blocked: HashSet::new(),
            areas: HashMap::new(),
            flags: HashMap::new(),
            links: Vec::new(),
        }
    }

    pub fn with_blocked(mut self, x: i32, z: i32) -> Self {
        self.blocked.insert((x, z));
        self
    }

    pub fn with_area(mut self, x: i32, z: i32, area: u8) -> Self {
        self.areas.insert((x, z), area);
        self
    }

    pub fn with_flags(mut self, x: i32, z: i32, flags: u16) -> Self {
        self.flags.insert((x, z), flags);
        self
    }

    /// Adds a one-way link between the centers of two cells
    pub fn with_link(mut self, from: (i32, i32), to: (i32, i32), user_id: u32) -> Self {
        let start = self.cell_center(from.0, from.1);
        let end = self.cell_center(to.0, to.1);
        self.links.push(GridLink {
            start,
            end,
            user_id,
            bidirectional: false,
        });
        self
    }

    pub fn cell_ref(&self, x: i32, z: i32) -> PolyRef {
        PolyRef::new((1 + x + z * self.width) as u64)
    }

    pub fn link_ref(&self, index: usize) -> PolyRef {
        PolyRef::new((self.width * self.height) as u64 + 1 + index as u64)
    }

    pub fn link_user_id(&self, link: PolyRef) -> Option<u32> {
        self.link_index(link).map(|i| self.links[i].user_id)
    }

    pub fn cell_center(&self, x: i32, z: i32) -> Vec3 {
        Vec3::new(
            (x as f32 + 0.5) * self.cell_size,
            0.0,
            (z as f32 + 0.5) * self.cell_size,
        )
    }

    fn cell_of(&self, poly: PolyRef) -> Option<(i32, i32)> {
        let id = poly.id() as i64;
        let count = (self.width * self.height) as i64;
        if id < 1 || id > count {
            return None;
        }
        let i = (id - 1) as i32;
        Some((i % self.width, i / self.width))
    }

    fn link_index(&self, poly: PolyRef) -> Option<usize> {
        let base = (self.width * self.height) as u64 + 1;
        let id = poly.id();
        if id < base {
            return None;
        }
        let i = (id - base) as usize;
        (i < self.links.len()).then_some(i)
    }

    fn cell_at(&self, pos: Vec3) -> Option<(i32, i32)> {
        let x = (pos.x / self.cell_size).floor() as i32;
        let z = (pos.z / self.cell_size).floor() as i32;
        (x >= 0 && z >= 0 && x < self.width && z < self.height).then_some((x, z))
    }

    fn is_open(&self, cell: (i32, i32), filter: &QueryFilter) -> bool {
        cell.0 >= 0
            && cell.1 >= 0
            && cell.0 < self.width
            && cell.1 < self.height
            && !self.blocked.contains(&cell)
            && filter.passes(self.flags.get(&cell).copied().unwrap_or(WALK_FLAG))
    }

    fn cell_bounds(&self, cell: (i32, i32)) -> (Vec3, Vec3) {
        let min = Vec3::new(
            cell.0 as f32 * self.cell_size,
            0.0,
            cell.1 as f32 * self.cell_size,
        );
        (min, min + Vec3::new(self.cell_size, 0.0, self.cell_size))
    }

    fn clamp_to_cell(&self, cell: (i32, i32), pos: Vec3) -> Vec3 {
        let (min, max) = self.cell_bounds(cell);
        let eps = self.cell_size * 1e-3;
        Vec3::new(
            pos.x.clamp(min.x, max.x - eps),
            0.0,
            pos.z.clamp(min.z, max.z - eps),
        )
    }

    fn neighbours(
        &self,
        poly: PolyRef,
        filter: &QueryFilter,
        link_filter: Option<&dyn LinkFilter>,
    ) -> Vec<PolyRef> {
        let mut out = Vec::new();
        if let Some((x, z)) = self.cell_of(poly) {
            for (dx, dz) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let n = (x + dx, z + dz);
                if self.is_open(n, filter) {
                    out.push(self.cell_ref(n.0, n.1));
                }
            }
            for (i, link) in self.links.iter().enumerate() {
                let from_start = self.cell_at(link.start) == Some((x, z));
                let from_end = link.bidirectional && self.cell_at(link.end) == Some((x, z));
                let allowed = link_filter.is_none_or(|f| f.is_link_allowed(link.user_id));
                if (from_start || from_end) && allowed {
                    out.push(self.link_ref(i));
                }
            }
        } else if let Some(i) = self.link_index(poly) {
            let link = &self.links[i];
            for end in [link.start, link.end] {
                if let Some(c) = self.cell_at(end).filter(|c| self.is_open(*c, filter)) {
                    out.push(self.cell_ref(c.0, c.1));
                }
            }
        }
        out
    }

    fn walk(
        &self,
        start_ref: PolyRef,
        start: Vec3,
        end: Vec3,
        filter: &QueryFilter,
        stop_at_wall: bool,
    ) -> Result<(Vec3, Vec<PolyRef>, Option<f32>)> {
        let mut cell = self
            .cell_of(start_ref)
            .filter(|c| self.is_open(*c, filter))
            .ok_or(Error::InvalidPolyRef(start_ref))?;
        let mut pos = self.clamp_to_cell(cell, start);
        let mut visited = vec![start_ref];
        let dist = dist_sqr_2d(start, end).sqrt();
        let steps = ((dist / (self.cell_size * STEP)).ceil() as usize).max(1);
        for k in 1..=steps {
            let t = k as f32 / steps as f32;
            let p = start.lerp(end, t);
            match self.cell_at(p).filter(|c| self.is_open(*c, filter)) {
                Some(next) => {
                    if next != cell {
                        cell = next;
                        visited.push(self.cell_ref(next.0, next.1));
                    }
                    pos = Vec3::new(p.x, 0.0, p.z);
                }
                None if stop_at_wall => {
                    return Ok((pos, visited, Some((k - 1) as f32 / steps as f32)));
                }
                None => {
                    // slide along the blocking edge one axis at a time
                    for candidate in [Vec3::new(p.x, 0.0, pos.z), Vec3::new(pos.x, 0.0, p.z)] {
                        if let Some(next) = self.cell_at(candidate).filter(|c| self.is_open(*c, filter)) {
                            if next != cell {
                                cell = next;
                                visited.push(self.cell_ref(next.0, next.1));
                            }
                            pos = candidate;
                            break;
                        }
                    }
                }
            }
        }
        Ok((pos, visited, None))
    }
}

impl NavQuery for GridNavMesh {
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        if center.y.abs() > half_extents.y {
            return None;
        }
        let mut best: Option<(f32, PolyRef, Vec3)> = None;
        for z in 0..self.height {
            for x in 0..self.width {
                if !self.is_open((x, z), filter) {
                    continue;
                }
                let (min, max) = self.cell_bounds((x, z));
                let closest = Vec3::new(center.x.clamp(min.x, max.x), 0.0, center.z.clamp(min.z, max.z));
                if (closest.x - center.x).abs() > half_extents.x
                    || (closest.z - center.z).abs() > half_extents.z
                {
                    continue;
                }
                let d = dist_sqr_2d(center, closest);
                if best.is_none_or(|(bd, _, _)| d < bd) {
                    best = Some((d, self.cell_ref(x, z), closest));
                }
            }
        }
        best.map(|(_, poly, pos)| (poly, pos))
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        match self.cell_of(poly) {
            Some(cell) => self.is_open(cell, filter),
            None => self.link_index(poly).is_some() && filter.passes(WALK_FLAG),
        }
    }

    fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        _start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        link_filter: Option<&dyn LinkFilter>,
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.is_valid_poly_ref(start_ref, filter) {
            return Err(Error::InvalidPolyRef(start_ref));
        }
        let mut parent: HashMap<PolyRef, PolyRef> = HashMap::new();
        let mut open = VecDeque::from([start_ref]);
        parent.insert(start_ref, PolyRef::NULL);
        let mut found = start_ref == end_ref;
        while let Some(cur) = open.pop_front() {
            if found {
                break;
            }
            for n in self.neighbours(cur, filter, link_filter) {
                if parent.contains_key(&n) {
                    continue;
                }
                parent.insert(n, cur);
                if n == end_ref {
                    found = true;
                    break;
                }
                open.push_back(n);
            }
        }

        let last = if found {
            end_ref
        } else {
            parent
                .keys()
                .filter(|p| self.cell_of(**p).is_some())
                .min_by(|a, b| {
                    let da = self.poly_center(**a).map_or(f32::MAX, |c| dist_sqr_2d(c, end_pos));
                    let db = self.poly_center(**b).map_or(f32::MAX, |c| dist_sqr_2d(c, end_pos));
                    da.total_cmp(&db).then(a.cmp(b))
                })
                .copied()
                .unwrap_or(start_ref)
        };

        let mut path = vec![last];
        let mut cur = last;
        while let Some(&p) = parent.get(&cur) {
            if !p.is_valid() {
                break;
            }
            path.push(p);
            cur = p;
        }
        path.reverse();
        path.truncate(max_path.max(1));
        Ok(path)
    }

    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        let first = *path.first().ok_or(Error::NavQuery("empty path".into()))?;
        let mut points = vec![StraightPathPoint {
            pos: start_pos,
            flags: StraightPathFlags::START,
            poly: first,
        }];
        for i in 1..path.len() {
            if self.link_index(path[i]).is_some() {
                let (s, _) = self.off_mesh_connection_end_points(path[i - 1], path[i])?;
                points.push(StraightPathPoint {
                    pos: s,
                    flags: StraightPathFlags::OFFMESH_CONNECTION,
                    poly: path[i],
                });
                continue;
            }
            let (Some(prev), Some(cur)) = (self.cell_of(path[i - 1]), self.cell_of(path[i])) else {
                continue;
            };
            let Some(next) = path.get(i + 1).and_then(|n| self.cell_of(*n)) else {
                continue;
            };
            let dir_in = (cur.0 - prev.0, cur.1 - prev.1);
            let dir_out = (next.0 - cur.0, next.1 - cur.1);
            if dir_in != dir_out {
                points.push(StraightPathPoint {
                    pos: self.cell_center(cur.0, cur.1),
                    flags: StraightPathFlags::default(),
                    poly: path[i + 1],
                });
            }
        }
        let last = path[path.len() - 1];
        let end = self.closest_point_on_poly(last, end_pos).unwrap_or(end_pos);
        points.push(StraightPathPoint {
            pos: end,
            flags: StraightPathFlags::END,
            poly: PolyRef::NULL,
        });
        points.truncate(max_points.max(1));
        Ok(points)
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        let (pos, visited, _) = self.walk(start_ref, start_pos, end_pos, filter, false)?;
        Ok((pos, visited))
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        let (_, visited, hit) = self.walk(start_ref, start_pos, end_pos, filter, true)?;
        Ok(RaycastHit {
            t: hit.unwrap_or(f32::MAX),
            visited,
        })
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        let start = self
            .cell_of(start_ref)
            .filter(|c| self.is_open(*c, filter))
            .ok_or(Error::InvalidPolyRef(start_ref))?;
        let mut result = vec![start_ref];
        let mut seen = HashSet::from([start]);
        let mut open = VecDeque::from([start]);
        while let Some((x, z)) = open.pop_front() {
            for (dx, dz) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let n = (x + dx, z + dz);
                if !self.is_open(n, filter) || !seen.insert(n) {
                    continue;
                }
                let closest = self.clamp_to_cell(n, center);
                if dist_sqr_2d(closest, center) > radius * radius {
                    continue;
                }
                if result.len() >= max_result {
                    return Ok(result);
                }
                result.push(self.cell_ref(n.0, n.1));
                open.push_back(n);
            }
        }
        Ok(result)
    }

    fn poly_wall_segments(&self, poly: PolyRef, filter: &QueryFilter) -> Result<Vec<(Vec3, Vec3)>> {
        let (x, z) = self.cell_of(poly).ok_or(Error::InvalidPolyRef(poly))?;
        let (min, max) = self.cell_bounds((x, z));
        let c00 = Vec3::new(min.x, 0.0, min.z);
        let c10 = Vec3::new(max.x, 0.0, min.z);
        let c11 = Vec3::new(max.x, 0.0, max.z);
        let c01 = Vec3::new(min.x, 0.0, max.z);
        let edges = [
            ((x, z - 1), (c10, c00)),
            ((x - 1, z), (c00, c01)),
            ((x, z + 1), (c01, c11)),
            ((x + 1, z), (c11, c10)),
        ];
        Ok(edges
            .into_iter()
            .filter(|(n, _)| !self.is_open(*n, filter))
            .map(|(_, seg)| seg)
            .collect())
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        if let Some(cell) = self.cell_of(poly) {
            let (min, max) = self.cell_bounds(cell);
            return Ok(Vec3::new(pos.x.clamp(min.x, max.x), 0.0, pos.z.clamp(min.z, max.z)));
        }
        self.link_index(poly)
            .map(|i| self.links[i].start)
            .ok_or(Error::InvalidPolyRef(poly))
    }

    fn poly_center(&self, poly: PolyRef) -> Option<Vec3> {
        if let Some((x, z)) = self.cell_of(poly) {
            return Some(self.cell_center(x, z));
        }
        self.link_index(poly)
            .map(|i| (self.links[i].start + self.links[i].end) * 0.5)
    }

    fn poly_area(&self, poly: PolyRef) -> Option<u8> {
        if let Some(cell) = self.cell_of(poly) {
            return Some(self.areas.get(&cell).copied().unwrap_or(0));
        }
        self.link_index(poly).map(|_| 0)
    }

    fn off_mesh_connection_end_points(&self, prev_ref: PolyRef, link: PolyRef) -> Result<(Vec3, Vec3)> {
        let i = self.link_index(link).ok_or(Error::InvalidPolyRef(link))?;
        let l = &self.links[i];
        let prev = self.cell_of(prev_ref);
        if l.bidirectional && prev.is_some() && prev == self.cell_at(l.end) {
            Ok((l.end, l.start))
        } else {
            Ok((l.start, l.end))
        }
    }
}
