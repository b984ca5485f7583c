//! Crowd simulation over shared navigation data
//!
//! The crowd update is split into stages that are meant to run in order
//! once per frame:
//!
//! 1. [`Crowd::update_step_corridor`]: sync corridors with agent positions
//! 2. [`Crowd::update_step_paths`]: validity checks, move requests, topology
//! 3. [`Crowd::update_step_proximity_data`]: neighbours and wall boundaries
//! 4. [`Crowd::update_step_next_move_point`]: corners and off-mesh triggers
//! 5. [`Crowd::update_step_steering`]: desired velocities
//! 6. [`Crowd::update_step_avoidance`]: sampled collision free velocities
//! 7. [`Crowd::update_step_move`]: integration and collision resolution
//! 8. [`Crowd::update_step_offmesh_velocity`]: off-mesh link animation
//!
//! Callers that let another system move the agents skip stage 7 and copy
//! positions into the agents before stage 1.

use std::fmt;
use std::sync::Arc;

use crowd_common::{
    Error, PolyRef, Result, Vec3, dist_2d, dist_sqr_2d, flatten, len_2d, sqr, tri_area_2d,
};

use crate::local_boundary::LocalBoundary;
use crate::nav_query::{LinkFilter, NavQuery, QueryFilter, StraightPathFlags, StraightPathPoint};
use crate::obstacle_avoidance::{ObstacleAvoidanceParams, ObstacleAvoidanceQuery, SamplingPattern};
use crate::path_corridor::PathCorridor;
use crate::proximity_grid::ProximityGrid;

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const CROWDAGENT_MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
pub const CROWDAGENT_MAX_CORNERS: usize = 4;

/// The maximum number of avoidance configurations supported by the crowd.
pub const CROWD_MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

/// The maximum number of custom sampling patterns supported by the crowd.
pub const CROWD_MAX_SAMPLING_PATTERNS: usize = 8;

const MAX_PATH_RESULT: usize = 256;
const MAX_ITEMS_PER_QUERY: usize = 32;
/// Corridor polygons revalidated ahead of the agent
const CHECK_LOOKAHEAD: usize = 10;
/// Seconds before a path that ends short of the target is replanned
const TARGET_REPLAN_DELAY: f32 = 1.0;
/// Seconds between topology optimizations of one agent
const OPT_TIME_THR: f32 = 0.5;
const COLLISION_RESOLVE_ITERATIONS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;

/// State of a crowd agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not on the navigation data
    #[default]
    Invalid,
    /// The agent is following its corridor
    Walking,
    /// The agent is traversing an off-mesh connection
    OffMesh,
    /// The agent is held in place until released
    Waiting,
}

/// Move request state for agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    Velocity,
}

/// Update flags for crowd agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct UpdateFlags(pub u8);

impl UpdateFlags {
    pub const ANTICIPATE_TURNS: UpdateFlags = UpdateFlags(1);
    pub const OBSTACLE_AVOIDANCE: UpdateFlags = UpdateFlags(2);
    pub const SEPARATION: UpdateFlags = UpdateFlags(4);
    pub const OPTIMIZE_VIS: UpdateFlags = UpdateFlags(8);
    pub const OPTIMIZE_TOPO: UpdateFlags = UpdateFlags(16);
    pub const OFFSET_PATH: UpdateFlags = UpdateFlags(32);
    pub const SLOWDOWN_AT_GOAL: UpdateFlags = UpdateFlags(64);

    pub const fn empty() -> Self {
        UpdateFlags(0)
    }

    /// Check if flags contain the specified flag
    pub fn contains(&self, other: UpdateFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: UpdateFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: UpdateFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: UpdateFlags, enabled: bool) {
        if enabled {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for UpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        UpdateFlags(self.0 | rhs.0)
    }
}

/// Agent parameters for crowd
#[derive(Clone)]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    /// Zero disables acceleration limits
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Agents and walls closer than this affect steering
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    pub separation_weight: f32,
    pub update_flags: UpdateFlags,
    /// Index into the avoidance configurations
    pub obstacle_avoidance_type: u8,
    /// Scales `collision_query_range` for avoidance only
    pub avoidance_query_multiplier: f32,
    pub avoidance_group: u32,
    pub groups_to_avoid: u32,
    pub groups_to_ignore: u32,
    /// Filter for special links used during path searches
    pub link_filter: Option<Arc<dyn LinkFilter>>,
    pub user_data: usize,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: 0.6,
            height: 2.0,
            max_acceleration: 0.0,
            max_speed: 3.5,
            collision_query_range: 12.0,
            path_optimization_range: 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::ANTICIPATE_TURNS
                | UpdateFlags::OBSTACLE_AVOIDANCE
                | UpdateFlags::SEPARATION,
            obstacle_avoidance_type: 0,
            avoidance_query_multiplier: 1.0,
            avoidance_group: 1,
            groups_to_avoid: u32::MAX,
            groups_to_ignore: 0,
            link_filter: None,
            user_data: 0,
        }
    }
}

impl fmt::Debug for AgentParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentParams")
            .field("radius", &self.radius)
            .field("height", &self.height)
            .field("max_speed", &self.max_speed)
            .field("collision_query_range", &self.collision_query_range)
            .field("update_flags", &self.update_flags)
            .field("obstacle_avoidance_type", &self.obstacle_avoidance_type)
            .field("avoidance_group", &self.avoidance_group)
            .field("has_link_filter", &self.link_filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Neighbour of an agent, `dist` is the squared XZ distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    pub idx: usize,
    pub dist: f32,
}

/// Progress of an agent across an off-mesh connection
#[derive(Debug, Clone, Copy, Default)]
pub struct OffMeshAnimation {
    pub active: bool,
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

/// Agent in the crowd
#[derive(Debug, Clone, Default)]
pub struct CrowdAgent {
    pub active: bool,
    pub state: CrowdAgentState,
    /// The path ends short of the requested target
    pub partial: bool,
    pub corridor: PathCorridor,
    pub boundary: LocalBoundary,
    pub topology_opt_time: f32,
    pub neighbours: Vec<CrowdNeighbour>,
    pub desired_speed: f32,
    /// Current position
    pub npos: Vec3,
    /// Desired velocity
    pub dvel: Vec3,
    /// Velocity chosen by avoidance
    pub nvel: Vec3,
    /// Actual velocity
    pub vel: Vec3,
    pub params: AgentParams,
    pub corners: Vec<StraightPathPoint>,
    pub target_state: MoveRequestState,
    pub target_ref: PolyRef,
    /// Target position, or the requested velocity for velocity moves
    pub target_pos: Vec3,
    pub target_replan: bool,
    pub target_replan_time: f32,
    pub filter: QueryFilter,
    pub anim: OffMeshAnimation,
}

impl CrowdAgent {
    fn new(max_walls: usize) -> Self {
        Self {
            boundary: LocalBoundary::new(max_walls),
            ..Default::default()
        }
    }

    fn has_path_target(&self) -> bool {
        !matches!(
            self.target_state,
            MoveRequestState::None | MoveRequestState::Velocity
        )
    }

    fn request_replan(&mut self) {
        self.target_replan = true;
        self.target_state = MoveRequestState::Requesting;
    }
}

/// Crowd configuration
#[derive(Debug, Clone)]
pub struct CrowdConfig {
    pub max_agents: usize,
    pub max_agent_radius: f32,
    /// Circles considered by one avoidance query
    pub max_avoided_agents: usize,
    /// Segments considered by one avoidance query
    pub max_avoided_walls: usize,
    /// Seconds between revalidation of agent positions and corridors
    pub agent_check_interval: f32,
    /// Remove an off-mesh link from the corridor when it is entered
    pub prune_started_offmesh_connections: bool,
    /// Only take visibility shortcuts through a single area type
    pub single_area_visibility_optimization: bool,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            max_agents: 50,
            max_agent_radius: 100.0,
            max_avoided_agents: 6,
            max_avoided_walls: 8,
            agent_check_interval: 1.0,
            prune_started_offmesh_connections: false,
            single_area_visibility_optimization: true,
        }
    }
}

impl CrowdConfig {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Self {
        Self {
            max_agents,
            max_agent_radius,
            ..Default::default()
        }
    }

    pub fn with_avoidance_limits(mut self, agents: usize, walls: usize) -> Self {
        self.max_avoided_agents = agents;
        self.max_avoided_walls = walls;
        self
    }

    pub fn with_agent_check_interval(mut self, interval: f32) -> Self {
        self.agent_check_interval = interval;
        self
    }

    pub fn with_prune_started_offmesh_connections(mut self, prune: bool) -> Self {
        self.prune_started_offmesh_connections = prune;
        self
    }

    pub fn with_single_area_visibility_optimization(mut self, enable: bool) -> Self {
        self.single_area_visibility_optimization = enable;
        self
    }
}

/// Crowd of agents sharing one navigation data set
#[derive(Debug)]
pub struct Crowd {
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    grid: ProximityGrid,
    obstacle_query: ObstacleAvoidanceQuery,
    avoidance_params: [ObstacleAvoidanceParams; CROWD_MAX_OBSTAVOIDANCE_PARAMS],
    sampling_patterns: Vec<SamplingPattern>,
    query_extents: Vec3,
    check_time: f32,
    velocity_sample_count: usize,
}

impl Crowd {
    pub fn new(config: CrowdConfig) -> Result<Self> {
        if config.max_agents == 0 {
            return Err(Error::InvalidParam("max_agents must be positive".into()));
        }
        if config.max_agent_radius <= 0.0 {
            return Err(Error::InvalidParam(
                "max_agent_radius must be positive".into(),
            ));
        }

        let r = config.max_agent_radius;
        let agents = (0..config.max_agents)
            .map(|_| CrowdAgent::new(config.max_avoided_walls))
            .collect();

        log::info!(
            "Created crowd with {} agent slots (max radius {})",
            config.max_agents,
            r
        );

        Ok(Self {
            grid: ProximityGrid::new(r * 3.0),
            obstacle_query: ObstacleAvoidanceQuery::new(
                config.max_avoided_agents,
                config.max_avoided_walls,
            ),
            avoidance_params: [ObstacleAvoidanceParams::default(); CROWD_MAX_OBSTAVOIDANCE_PARAMS],
            sampling_patterns: vec![SamplingPattern::default(); CROWD_MAX_SAMPLING_PATTERNS],
            query_extents: Vec3::new(r * 2.0, r * 1.5, r * 2.0),
            check_time: 0.0,
            velocity_sample_count: 0,
            agents,
            config,
        })
    }

    pub fn config(&self) -> &CrowdConfig {
        &self.config
    }

    /// Half extents used to place agents and targets on the navigation data
    pub fn query_extents(&self) -> Vec3 {
        self.query_extents
    }

    pub fn set_prune_started_offmesh_connections(&mut self, prune: bool) {
        self.config.prune_started_offmesh_connections = prune;
    }

    pub fn set_single_area_visibility_optimization(&mut self, enable: bool) {
        self.config.single_area_visibility_optimization = enable;
    }

    pub fn set_agent_check_interval(&mut self, interval: f32) {
        self.config.agent_check_interval = interval;
    }

    pub fn set_obstacle_avoidance_params(
        &mut self,
        idx: usize,
        params: &ObstacleAvoidanceParams,
    ) -> Result<()> {
        let slot = self
            .avoidance_params
            .get_mut(idx)
            .ok_or_else(|| Error::InvalidParam(format!("avoidance config index {idx}")))?;
        *slot = *params;
        Ok(())
    }

    pub fn obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.avoidance_params.get(idx)
    }

    pub fn set_sampling_pattern(&mut self, idx: usize, pattern: SamplingPattern) -> Result<()> {
        if pattern.angles.len() != pattern.radii.len() {
            return Err(Error::InvalidParam(format!(
                "sampling pattern {idx} has {} angles and {} radii",
                pattern.angles.len(),
                pattern.radii.len()
            )));
        }
        let slot = self
            .sampling_patterns
            .get_mut(idx)
            .ok_or_else(|| Error::InvalidParam(format!("sampling pattern index {idx}")))?;
        *slot = pattern;
        Ok(())
    }

    pub fn sampling_pattern(&self, idx: usize) -> Option<&SamplingPattern> {
        self.sampling_patterns.get(idx)
    }

    /// Velocity samples evaluated by the last avoidance step
    pub fn velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    pub fn agent_capacity(&self) -> usize {
        self.agents.len()
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents.iter().filter(|a| a.active).count()
    }

    pub fn agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx)
    }

    pub fn agent_mut(&mut self, idx: usize) -> Option<&mut CrowdAgent> {
        self.agents.get_mut(idx)
    }

    fn active_agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        self.agents
            .get_mut(idx)
            .filter(|a| a.active)
            .ok_or(Error::InvalidAgent(idx))
    }

    /// Adds an agent at the nearest navigable position to `pos`
    pub fn add_agent(
        &mut self,
        pos: Vec3,
        params: &AgentParams,
        filter: &QueryFilter,
        query: &dyn NavQuery,
    ) -> Result<usize> {
        let idx = self
            .agents
            .iter()
            .position(|a| !a.active)
            .ok_or_else(|| Error::CapacityExceeded(format!("{} agents", self.agents.len())))?;

        let (poly, npos) = query
            .find_nearest_poly(pos, self.query_extents, filter)
            .unwrap_or((PolyRef::NULL, pos));

        let ag = &mut self.agents[idx];
        *ag = CrowdAgent::new(self.config.max_avoided_walls);
        ag.params = params.clone();
        ag.filter = filter.clone();
        ag.corridor.reset(poly, npos);
        ag.npos = npos;
        ag.state = if poly.is_valid() {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        ag.active = true;

        Ok(idx)
    }

    /// Removes an agent and releases its link filter
    pub fn remove_agent(&mut self, idx: usize) {
        if let Some(ag) = self.agents.get_mut(idx) {
            ag.active = false;
            ag.params.link_filter = None;
            ag.neighbours.clear();
            ag.corners.clear();
            ag.anim = OffMeshAnimation::default();
        }
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: &AgentParams) -> Result<()> {
        self.active_agent_mut(idx)?.params = params.clone();
        Ok(())
    }

    pub fn update_agent_filter(&mut self, idx: usize, filter: &QueryFilter) -> Result<()> {
        self.active_agent_mut(idx)?.filter = filter.clone();
        Ok(())
    }

    /// Requests a path toward `pos` on polygon `poly`
    pub fn request_move_target(&mut self, idx: usize, poly: PolyRef, pos: Vec3) -> Result<()> {
        if !poly.is_valid() {
            return Err(Error::InvalidPolyRef(poly));
        }
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = poly;
        ag.target_pos = pos;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Requesting;
        Ok(())
    }

    /// Moves the agent with a fixed velocity instead of a path
    pub fn request_move_velocity(&mut self, idx: usize, vel: Vec3) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = vel;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Velocity;
        Ok(())
    }

    pub fn reset_move_target(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = Vec3::ZERO;
        ag.dvel = Vec3::ZERO;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::None;
        Ok(())
    }

    /// Replaces the corridor with an externally computed path toward the
    /// current target
    pub fn set_agent_corridor(&mut self, idx: usize, path: &[PolyRef]) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidParam("empty corridor".into()));
        }
        let ag = self.active_agent_mut(idx)?;
        let target = ag.target_pos;
        ag.corridor.set_corridor(target, path);
        ag.boundary.reset();
        ag.partial = false;
        ag.target_replan_time = 0.0;
        ag.target_state = MoveRequestState::Valid;
        Ok(())
    }

    pub fn set_agent_waiting(&mut self, idx: usize) -> Result<()> {
        self.active_agent_mut(idx)?.state = CrowdAgentState::Waiting;
        Ok(())
    }

    /// Derives the agent state from its corridor, optionally requesting a
    /// fresh path toward the current target
    pub fn update_agent_state(&mut self, idx: usize, replan: bool) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.state = if ag.anim.active {
            CrowdAgentState::OffMesh
        } else if ag.corridor.get_path_count() > 0 {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        if replan && ag.has_path_target() && ag.target_ref.is_valid() {
            ag.request_replan();
        }
        Ok(())
    }

    pub fn reset_agent_velocity(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        ag.vel = Vec3::ZERO;
        ag.nvel = Vec3::ZERO;
        ag.dvel = Vec3::ZERO;
        Ok(())
    }

    /// Ends an off-mesh traversal that was handed to the caller and puts the
    /// agent back on its corridor past the link
    pub fn set_agent_back_on_link(&mut self, idx: usize) -> Result<()> {
        let ag = self.active_agent_mut(idx)?;
        if ag.anim.active {
            ag.corridor.prune_through(ag.anim.poly_ref, ag.anim.end_pos);
            ag.anim.active = false;
        }
        ag.state = if ag.corridor.get_path_count() > 0 {
            CrowdAgentState::Walking
        } else {
            CrowdAgentState::Invalid
        };
        Ok(())
    }

    /// Runs every stage, including integration and collision resolution
    pub fn update(&mut self, dt: f32, query: &dyn NavQuery) {
        self.update_step_corridor(dt, query);
        self.update_step_paths(dt, query);
        self.update_step_proximity_data(dt, query);
        self.update_step_next_move_point(dt, query);
        self.update_step_steering(dt);
        self.update_step_avoidance(dt);
        self.update_step_move(dt, query);
        self.update_step_offmesh_velocity(dt);
    }

    pub fn update_step_corridor(&mut self, _dt: f32, query: &dyn NavQuery) {
        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            sync_corridor(ag, query);
        }
    }

    pub fn update_step_paths(&mut self, dt: f32, query: &dyn NavQuery) {
        self.check_path_validity(dt, query);
        self.update_move_requests(query);
        self.update_topology_optimization(dt, query);
    }

    fn check_path_validity(&mut self, dt: f32, query: &dyn NavQuery) {
        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            ag.target_replan_time += dt;
        }

        self.check_time += dt;
        if self.check_time < self.config.agent_check_interval {
            return;
        }
        self.check_time = 0.0;

        let ext = self.query_extents;
        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            let mut replan = false;

            // First check that the current location is valid
            let mut agent_ref = ag.corridor.get_first_poly();
            let mut agent_pos = ag.npos;
            if !query.is_valid_poly_ref(agent_ref, &ag.filter) {
                match query.find_nearest_poly(ag.npos, ext, &ag.filter) {
                    Some((poly, pos)) => {
                        agent_ref = poly;
                        agent_pos = pos;
                    }
                    None => {
                        log::debug!("Agent left the navigation data at {:?}", ag.npos);
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.partial = false;
                        ag.boundary.reset();
                        ag.state = CrowdAgentState::Invalid;
                        continue;
                    }
                }
                ag.corridor.fix_path_start(agent_ref, agent_pos);
                ag.boundary.reset();
                ag.npos = agent_pos;
                replan = true;
            }

            if !ag.has_path_target() {
                continue;
            }

            // Try to recover the move request position
            if ag.target_state != MoveRequestState::Failed
                && !query.is_valid_poly_ref(ag.target_ref, &ag.filter)
            {
                match query.find_nearest_poly(ag.target_pos, ext, &ag.filter) {
                    Some((poly, pos)) => {
                        ag.target_ref = poly;
                        ag.target_pos = pos;
                        replan = true;
                    }
                    None => {
                        ag.corridor.reset(agent_ref, agent_pos);
                        ag.partial = false;
                        ag.target_ref = PolyRef::NULL;
                        ag.target_state = MoveRequestState::None;
                        continue;
                    }
                }
            }

            if !ag.corridor.is_valid(CHECK_LOOKAHEAD, query, &ag.filter) {
                if let Err(err) = ag.corridor.trim_invalid_path(agent_ref, agent_pos, query, &ag.filter) {
                    log::debug!("Failed to trim corridor: {err}");
                }
                ag.boundary.reset();
                replan = true;
            }

            // The end of the path is near and it is not the requested location
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > TARGET_REPLAN_DELAY
                && ag.corridor.get_path_count() < CHECK_LOOKAHEAD
                && ag.corridor.get_last_poly() != ag.target_ref
            {
                replan = true;
            }

            if replan {
                ag.request_replan();
            }
        }
    }

    fn update_move_requests(&mut self, query: &dyn NavQuery) {
        for ag in self.agents.iter_mut() {
            if !ag.active || ag.target_state != MoveRequestState::Requesting {
                continue;
            }

            let start = ag.corridor.get_first_poly();
            if !start.is_valid() {
                ag.target_state = MoveRequestState::Failed;
                continue;
            }

            let result = query.find_path(
                start,
                ag.target_ref,
                ag.npos,
                ag.target_pos,
                &ag.filter,
                ag.params.link_filter.as_deref(),
                MAX_PATH_RESULT,
            );
            let path = match result {
                Ok(path) if !path.is_empty() => path,
                Ok(_) => {
                    ag.target_state = MoveRequestState::Failed;
                    continue;
                }
                Err(err) => {
                    log::debug!("Path request to {} failed: {err}", ag.target_ref);
                    ag.target_state = MoveRequestState::Failed;
                    continue;
                }
            };

            let last = path[path.len() - 1];
            ag.partial = last != ag.target_ref;
            let target = if ag.partial {
                query
                    .closest_point_on_poly(last, ag.target_pos)
                    .unwrap_or(ag.target_pos)
            } else {
                ag.target_pos
            };

            ag.corridor.set_corridor(target, &path);
            ag.boundary.reset();
            ag.target_replan = false;
            ag.target_replan_time = 0.0;
            ag.target_state = MoveRequestState::Valid;
        }
    }

    fn update_topology_optimization(&mut self, dt: f32, query: &dyn NavQuery) {
        let mut candidate: Option<(usize, f32)> = None;
        for (i, ag) in self.agents.iter_mut().enumerate() {
            if !is_walking(ag)
                || !ag.has_path_target()
                || !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= OPT_TIME_THR
                && candidate.is_none_or(|(_, t)| ag.topology_opt_time > t)
            {
                candidate = Some((i, ag.topology_opt_time));
            }
        }

        if let Some((i, _)) = candidate {
            let ag = &mut self.agents[i];
            if let Err(err) =
                ag.corridor
                    .optimize_path_topology(query, &ag.filter, ag.params.link_filter.as_deref())
            {
                log::debug!("Topology optimization failed: {err}");
            }
            ag.topology_opt_time = 0.0;
        }
    }

    pub fn update_step_proximity_data(&mut self, _dt: f32, query: &dyn NavQuery) {
        self.grid.clear();
        for (i, ag) in self.agents.iter().enumerate().filter(|(_, a)| a.active) {
            let r = Vec3::new(ag.params.radius, 0.0, ag.params.radius);
            self.grid.add_item(i, ag.npos - r, ag.npos + r);
        }

        let bodies: Vec<(Vec3, f32)> = self
            .agents
            .iter()
            .map(|a| (a.npos, a.params.height))
            .collect();

        let grid = &self.grid;
        for (i, ag) in self.agents.iter_mut().enumerate() {
            if !is_walking(ag) {
                continue;
            }

            // Update the collision boundary after certain distance has been
            // passed or if it has become invalid
            let range = ag.params.collision_query_range;
            let update_thr = range * 0.25;
            if dist_sqr_2d(ag.npos, ag.boundary.center()) > sqr(update_thr)
                || !ag.boundary.is_valid(query, &ag.filter)
            {
                let first = ag.corridor.get_first_poly();
                if let Err(err) = ag.boundary.update(first, ag.npos, range, query, &ag.filter) {
                    log::debug!("Boundary update failed: {err}");
                }
            }

            ag.neighbours = find_neighbours(i, ag.npos, ag.params.height, range, &bodies, grid);
        }
    }

    pub fn update_step_next_move_point(&mut self, _dt: f32, query: &dyn NavQuery) {
        let single_area = self.config.single_area_visibility_optimization;
        let prune = self.config.prune_started_offmesh_connections;

        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            if !ag.has_path_target() {
                ag.corners.clear();
                continue;
            }

            ag.corners = ag
                .corridor
                .find_corners(CROWDAGENT_MAX_CORNERS, query)
                .unwrap_or_else(|err| {
                    log::debug!("Corner search failed: {err}");
                    Vec::new()
                });

            if ag.params.update_flags.contains(UpdateFlags::OFFSET_PATH) {
                offset_corners(ag.npos, ag.params.radius, &mut ag.corners);
            }

            // Shortcut to the corner after the next one if it is visible
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty() {
                let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                if let Err(err) = ag.corridor.optimize_path_visibility(
                    target,
                    ag.params.path_optimization_range,
                    single_area,
                    query,
                    &ag.filter,
                ) {
                    log::debug!("Visibility optimization failed: {err}");
                }
            }
        }

        // Trigger off-mesh connections
        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            let trigger_radius = ag.params.radius * 2.25;
            let Some(link) = over_offmesh_connection(ag, trigger_radius) else {
                continue;
            };
            match ag.corridor.move_over_offmesh_connection(link, prune, query) {
                Ok((_, start_pos, end_pos)) => {
                    let tmax = if ag.params.max_speed > 0.0 {
                        (dist_2d(start_pos, end_pos) / ag.params.max_speed) * 0.5
                    } else {
                        0.0
                    };
                    ag.anim = OffMeshAnimation {
                        active: true,
                        init_pos: ag.npos,
                        start_pos,
                        end_pos,
                        poly_ref: link,
                        t: 0.0,
                        tmax,
                    };
                    ag.state = CrowdAgentState::OffMesh;
                    ag.corners.clear();
                    ag.neighbours.clear();
                }
                // Path validity checks replan around bad links
                Err(err) => log::debug!("Could not enter off-mesh link {link}: {err}"),
            }
        }
    }

    pub fn update_step_steering(&mut self, _dt: f32) {
        let positions: Vec<Vec3> = self.agents.iter().map(|a| a.npos).collect();

        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            let mut dvel = if ag.target_state == MoveRequestState::Velocity {
                ag.desired_speed = len_2d(ag.target_pos);
                ag.target_pos
            } else {
                let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    smooth_steer_direction(ag)
                } else {
                    straight_steer_direction(ag)
                };

                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = if ag.params.update_flags.contains(UpdateFlags::SLOWDOWN_AT_GOAL)
                    && slow_down_radius > 0.0
                {
                    distance_to_goal(ag, slow_down_radius) / slow_down_radius
                } else {
                    1.0
                };

                ag.desired_speed = ag.params.max_speed;
                dir * (ag.desired_speed * speed_scale)
            };

            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let mut disp = Vec3::ZERO;
                let mut w = 0.0;

                for nei in &ag.neighbours {
                    let diff = flatten(ag.npos - positions[nei.idx]);
                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 || dist_sqr > sqr(separation_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight =
                        ag.params.separation_weight * (1.0 - sqr(dist * inv_separation_dist));
                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel += disp * (1.0 / w);
                    // Clamp desired velocity to desired speed
                    let speed_sqr = dvel.length_squared();
                    let desired_sqr = sqr(ag.desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel *= desired_sqr / speed_sqr;
                    }
                }
            }

            ag.dvel = dvel;
        }
    }

    pub fn update_step_avoidance(&mut self, _dt: f32) {
        struct Body {
            pos: Vec3,
            radius: f32,
            vel: Vec3,
            dvel: Vec3,
            group: u32,
        }

        let bodies: Vec<Body> = self
            .agents
            .iter()
            .map(|a| Body {
                pos: a.npos,
                radius: a.params.radius,
                vel: a.vel,
                dvel: a.dvel,
                group: a.params.avoidance_group,
            })
            .collect();

        let Self {
            agents,
            obstacle_query,
            avoidance_params,
            sampling_patterns,
            velocity_sample_count,
            ..
        } = self;
        *velocity_sample_count = 0;

        for ag in agents.iter_mut().filter(|a| is_walking(a)) {
            if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                ag.nvel = ag.dvel;
                continue;
            }

            obstacle_query.reset();

            let range = ag.params.collision_query_range * ag.params.avoidance_query_multiplier;
            for nei in &ag.neighbours {
                let other = &bodies[nei.idx];
                let ignored = ag.params.groups_to_ignore & other.group != 0;
                let avoided = ag.params.groups_to_avoid & other.group != 0;
                if ignored || !avoided || nei.dist > sqr(range) {
                    continue;
                }
                obstacle_query.add_circle(other.pos, other.radius, other.vel, other.dvel);
            }

            for j in 0..ag.boundary.segment_count() {
                let Some((p, q)) = ag.boundary.segment(j) else {
                    continue;
                };
                if tri_area_2d(ag.npos, p, q) < 0.0 {
                    continue;
                }
                obstacle_query.add_segment(p, q);
            }

            let params = avoidance_params
                .get(ag.params.obstacle_avoidance_type as usize)
                .copied()
                .unwrap_or_default();
            let pattern = params
                .pattern_idx
                .and_then(|i| sampling_patterns.get(i as usize))
                .filter(|p| !p.is_empty());

            let (nvel, ns) = match pattern {
                Some(pattern) => obstacle_query.sample_velocity_custom(
                    ag.npos,
                    ag.params.radius,
                    ag.desired_speed,
                    ag.vel,
                    ag.dvel,
                    &params,
                    pattern,
                ),
                None => obstacle_query.sample_velocity_adaptive(
                    ag.npos,
                    ag.params.radius,
                    ag.desired_speed,
                    ag.vel,
                    ag.dvel,
                    &params,
                ),
            };
            ag.nvel = nvel;
            *velocity_sample_count += ns;
        }
    }

    /// Integrates velocities, resolves overlaps and moves the corridors
    pub fn update_step_move(&mut self, dt: f32, query: &dyn NavQuery) {
        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            integrate(ag, dt);
        }

        for _ in 0..COLLISION_RESOLVE_ITERATIONS {
            let bodies: Vec<(Vec3, f32)> = self
                .agents
                .iter()
                .map(|a| (a.npos, a.params.radius))
                .collect();

            let mut disps = vec![Vec3::ZERO; self.agents.len()];
            for (idx0, ag) in self.agents.iter().enumerate() {
                if !is_walking(ag) {
                    continue;
                }
                let mut disp = Vec3::ZERO;
                let mut w = 0.0;

                for nei in &ag.neighbours {
                    let (other_pos, other_radius) = bodies[nei.idx];
                    let mut diff = flatten(ag.npos - other_pos);
                    let dist_sqr = diff.length_squared();
                    let combined = ag.params.radius + other_radius;
                    if dist_sqr > sqr(combined) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // Agents on top of each other, try to choose
                        // diverging separation directions
                        diff = if idx0 > nei.idx {
                            Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
                        } else {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((combined - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
                    };
                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disps[idx0] = disp * (1.0 / w);
                }
            }

            for (ag, disp) in self.agents.iter_mut().zip(disps) {
                if is_walking(ag) {
                    ag.npos += disp;
                }
            }
        }

        for ag in self.agents.iter_mut().filter(|a| is_walking(a)) {
            sync_corridor(ag, query);
        }
    }

    /// Advances off-mesh animations and derives the velocity that follows them
    pub fn update_step_offmesh_velocity(&mut self, dt: f32) {
        let prune = self.config.prune_started_offmesh_connections;

        for ag in self.agents.iter_mut() {
            if !ag.active || !ag.anim.active || ag.state != CrowdAgentState::OffMesh {
                continue;
            }

            ag.anim.t += dt;
            if ag.anim.t > ag.anim.tmax {
                ag.anim.active = false;
                if !prune {
                    ag.corridor.prune_through(ag.anim.poly_ref, ag.anim.end_pos);
                }
                ag.state = CrowdAgentState::Walking;
                continue;
            }

            let ta = ag.anim.tmax * 0.15;
            let tb = ag.anim.tmax;
            let target = if ag.anim.t < ta {
                ag.anim
                    .init_pos
                    .lerp(ag.anim.start_pos, tween(ag.anim.t, 0.0, ta))
            } else {
                ag.anim
                    .start_pos
                    .lerp(ag.anim.end_pos, tween(ag.anim.t, ta, tb))
            };

            ag.nvel = if dt > 0.0 {
                (target - ag.npos) / dt
            } else {
                Vec3::ZERO
            };
            ag.dvel = ag.nvel;
        }
    }
}

fn is_walking(ag: &CrowdAgent) -> bool {
    ag.active && ag.state == CrowdAgentState::Walking
}

/// Moves the corridor start to the agent position and constrains the
/// position to the navigation data
fn sync_corridor(ag: &mut CrowdAgent, query: &dyn NavQuery) {
    match ag.corridor.move_position(ag.npos, query, &ag.filter) {
        Ok(true) => ag.npos = ag.corridor.get_pos(),
        Ok(false) => {}
        Err(err) => log::debug!("Corridor move failed: {err}"),
    }

    // Without a path target the corridor is just the current polygon
    if !ag.has_path_target() {
        let first = ag.corridor.get_first_poly();
        ag.corridor.reset(first, ag.npos);
        ag.partial = false;
    }
}

fn find_neighbours(
    skip: usize,
    pos: Vec3,
    height: f32,
    range: f32,
    bodies: &[(Vec3, f32)],
    grid: &ProximityGrid,
) -> Vec<CrowdNeighbour> {
    let ext = Vec3::new(range, 0.0, range);
    let mut result: Vec<CrowdNeighbour> = Vec::with_capacity(CROWDAGENT_MAX_NEIGHBOURS);

    for id in grid.query_items(pos - ext, pos + ext, MAX_ITEMS_PER_QUERY) {
        if id == skip {
            continue;
        }
        let (other_pos, other_height) = bodies[id];

        // Check for overlap
        let diff = pos - other_pos;
        if diff.y.abs() >= (height + other_height) / 2.0 {
            continue;
        }
        let dist = dist_sqr_2d(pos, other_pos);
        if dist > sqr(range) {
            continue;
        }

        let at = result
            .iter()
            .position(|n| dist <= n.dist)
            .unwrap_or(result.len());
        if at >= CROWDAGENT_MAX_NEIGHBOURS {
            continue;
        }
        if result.len() >= CROWDAGENT_MAX_NEIGHBOURS {
            result.pop();
        }
        result.insert(at, CrowdNeighbour { idx: id, dist });
    }

    result
}

/// Link entered at the last corner if the agent is close enough to it
fn over_offmesh_connection(ag: &CrowdAgent, radius: f32) -> Option<PolyRef> {
    let last = ag.corners.last()?;
    if last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
        && dist_sqr_2d(ag.npos, last.pos) < sqr(radius)
    {
        Some(last.poly)
    } else {
        None
    }
}

/// Pushes inner corners outward so agents keep clear of the walls they
/// turn around
fn offset_corners(pos: Vec3, radius: f32, corners: &mut [StraightPathPoint]) {
    let mut prev = pos;
    for i in 0..corners.len().saturating_sub(1) {
        let next = corners[i + 1].pos;
        let corner = &mut corners[i];
        if corner.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) {
            break;
        }
        let dir_in = flatten(corner.pos - prev).normalize_or_zero();
        let dir_out = flatten(next - corner.pos).normalize_or_zero();
        let current = corner.pos;
        corner.pos += (dir_in - dir_out).normalize_or_zero() * radius;
        prev = current;
    }
}

fn smooth_steer_direction(ag: &CrowdAgent) -> Vec3 {
    if ag.corners.is_empty() {
        return Vec3::ZERO;
    }
    let ip1 = 1.min(ag.corners.len() - 1);
    let dir0 = flatten(ag.corners[0].pos - ag.npos);
    let mut dir1 = flatten(ag.corners[ip1].pos - ag.npos);

    let len0 = dir0.length();
    let len1 = dir1.length();
    if len1 > 0.001 {
        dir1 *= 1.0 / len1;
    }

    (dir0 - dir1 * (len0 * 0.5)).normalize_or_zero()
}

fn straight_steer_direction(ag: &CrowdAgent) -> Vec3 {
    match ag.corners.first() {
        Some(corner) => flatten(corner.pos - ag.npos).normalize_or_zero(),
        None => Vec3::ZERO,
    }
}

fn distance_to_goal(ag: &CrowdAgent, range: f32) -> f32 {
    match ag.corners.last() {
        Some(last) if last.flags.contains(StraightPathFlags::END) => {
            dist_2d(ag.npos, last.pos).min(range)
        }
        _ => range,
    }
}

fn integrate(ag: &mut CrowdAgent, dt: f32) {
    if ag.params.max_acceleration > 0.0 {
        // Fake dynamic constraint
        let max_delta = ag.params.max_acceleration * dt;
        let mut dv = ag.nvel - ag.vel;
        let ds = dv.length();
        if ds > max_delta {
            dv *= max_delta / ds;
        }
        ag.vel += dv;
    } else {
        ag.vel = ag.nvel;
    }

    if ag.vel.length() > 0.0001 {
        ag.npos += ag.vel * dt;
    } else {
        ag.vel = Vec3::ZERO;
    }
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= 0.0 {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}
