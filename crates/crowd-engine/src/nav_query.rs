//! Navigation query boundary used by the crowd
//!
//! The crowd never owns navigation data. Every stage that needs path
//! search, surface movement or wall extraction receives a [`NavQuery`]
//! implementation for the duration of the call.

use crowd_common::{PolyRef, Result, Vec3};

/// Number of area types a [`QueryFilter`] can weight
pub const MAX_AREAS: usize = 64;

/// Flags attached to the points of a straight path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StraightPathFlags(pub u8);

impl StraightPathFlags {
    pub const START: Self = Self(0x01);
    pub const END: Self = Self(0x02);
    pub const OFFMESH_CONNECTION: Self = Self(0x04);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for StraightPathFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One corner of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon (or off-mesh link) entered at this corner
    pub poly: PolyRef,
}

/// Result of a walkability raycast
#[derive(Debug, Clone, Default)]
pub struct RaycastHit {
    /// Hit parameter along the ray. `f32::MAX` when the ray reached its end.
    pub t: f32,
    pub visited: Vec<PolyRef>,
}

/// Polygon filter passed to every navigation query
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryFilter {
    pub include_flags: u16,
    pub exclude_flags: u16,
    #[cfg_attr(feature = "serialization", serde(with = "area_cost_serde"))]
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: 0xffff,
            exclude_flags: 0,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_include_flags(mut self, flags: u16) -> Self {
        self.include_flags = flags;
        self
    }

    pub fn with_exclude_flags(mut self, flags: u16) -> Self {
        self.exclude_flags = flags;
        self
    }

    pub fn with_area_cost(mut self, area: u8, cost: f32) -> Self {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
        self
    }

    /// Returns true if a polygon with `flags` may be traversed
    pub fn passes(&self, flags: u16) -> bool {
        (flags & self.include_flags) != 0 && (flags & self.exclude_flags) == 0
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }
}

#[cfg(feature = "serialization")]
mod area_cost_serde {
    use super::MAX_AREAS;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

    pub fn serialize<S: Serializer>(costs: &[f32; MAX_AREAS], s: S) -> Result<S::Ok, S::Error> {
        costs.as_slice().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[f32; MAX_AREAS], D::Error> {
        let costs = Vec::<f32>::deserialize(d)?;
        let len = costs.len();
        costs
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {MAX_AREAS} area costs, got {len}")))
    }
}

/// Decides which special (custom) links an agent may path through
pub trait LinkFilter: Send + Sync {
    fn is_link_allowed(&self, link_user_id: u32) -> bool;
}

/// Read-only access to navigation data
pub trait NavQuery {
    /// Nearest polygon inside the box `center ± half_extents`
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)>;

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool;

    /// Polygon path from `start_ref` toward `end_ref`.
    ///
    /// When the end is unreachable the path ends at the polygon closest to
    /// `end_pos` and its last element differs from `end_ref`.
    #[allow(clippy::too_many_arguments)]
    fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        link_filter: Option<&dyn LinkFilter>,
        max_path: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Corners of the string-pulled path through `path`
    fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>>;

    /// Slides from `start_pos` toward `end_pos` along the surface.
    /// Returns the reached position and the visited polygons in order.
    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<(Vec3, Vec<PolyRef>)>;

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit>;

    /// Connected polygons whose centers are within `radius` of `center`
    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Polygon edges that are not shared with a passable neighbour
    fn poly_wall_segments(&self, poly: PolyRef, filter: &QueryFilter) -> Result<Vec<(Vec3, Vec3)>>;

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3>;

    fn poly_center(&self, poly: PolyRef) -> Option<Vec3>;

    fn poly_area(&self, poly: PolyRef) -> Option<u8>;

    /// Start and end of an off-mesh link entered from `prev_ref`
    fn off_mesh_connection_end_points(&self, prev_ref: PolyRef, link: PolyRef) -> Result<(Vec3, Vec3)>;
}
