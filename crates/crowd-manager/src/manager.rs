//! Per-tick crowd manager
//!
//! [`CrowdManager`] owns the crowd engine, the registry of agents and the
//! avoidance tables. [`CrowdManager::tick`] runs the simulation stages in a
//! fixed order inside one batched navigation query:
//!
//! 1. snapshot of agent locations, velocities and speeds
//! 2. corridor update
//! 3. path update
//! 4. proximity update, followed by the backend hook
//! 5. next move point
//! 6. steering
//! 7. avoidance
//! 8. collision resolution, if enabled
//! 9. polygon change and custom link notifications
//! 10. off-mesh link velocities
//! 11. results applied to the agents
//!
//! All mutators take `&mut self` and agent callbacks get no manager access,
//! so nothing can re-enter the manager while a tick runs.

use std::sync::Arc;

use crowd_common::{PolyRef, Vec3};
use crowd_engine::{
    CROWD_MAX_OBSTAVOIDANCE_PARAMS, CROWD_MAX_SAMPLING_PATTERNS, Crowd, CrowdAgentState,
    QueryFilter, SamplingPattern, UpdateFlags,
};

use crate::agent::{CrowdAgent, derive_params};
use crate::backend::{CrowdBackend, CrowdEngineBackend};
use crate::config::{AvoidanceConfig, CrowdManagerConfig};
use crate::error::{RequestError, RequestResult, report};
use crate::nav_data::{BatchQuery, NavDataAdapter, NavMeshPath};
use crate::registry::{AgentKey, AgentRegistry, AgentSlot};

type TickObserver = Box<dyn FnMut(&CrowdManager)>;

pub struct CrowdManager {
    config: CrowdManagerConfig,
    backend: Box<dyn CrowdBackend>,
    nav_data: Option<Arc<dyn NavDataAdapter>>,
    crowd: Option<Crowd>,
    registry: AgentRegistry,
    avoidance_configs: Vec<AvoidanceConfig>,
    sampling_patterns: Vec<SamplingPattern>,
    tick_observer: Option<TickObserver>,
}

impl CrowdManager {
    pub fn new(config: CrowdManagerConfig) -> Self {
        Self::with_backend(config, Box::new(CrowdEngineBackend))
    }

    pub fn with_backend(config: CrowdManagerConfig, backend: Box<dyn CrowdBackend>) -> Self {
        let mut manager = Self {
            config: CrowdManagerConfig::default(),
            backend,
            nav_data: None,
            crowd: None,
            registry: AgentRegistry::default(),
            avoidance_configs: Vec::new(),
            sampling_patterns: Vec::new(),
            tick_observer: None,
        };
        manager.load_config(config);
        manager
    }

    fn load_config(&mut self, config: CrowdManagerConfig) {
        self.avoidance_configs = config.validated_avoidance_configs();
        self.sampling_patterns = config
            .sampling_patterns
            .iter()
            .take(CROWD_MAX_SAMPLING_PATTERNS)
            .cloned()
            .collect();
        self.config = config;
    }

    pub fn config(&self) -> &CrowdManagerConfig {
        &self.config
    }

    /// True once the engine exists
    pub fn is_ready(&self) -> bool {
        self.crowd.is_some()
    }

    pub fn crowd(&self) -> Option<&Crowd> {
        self.crowd.as_ref()
    }

    pub fn active_agent_count(&self) -> usize {
        self.crowd.as_ref().map_or(0, Crowd::active_agent_count)
    }

    /// Binds navigation data, building the engine if the data is ready
    pub fn set_nav_data(&mut self, nav: Arc<dyn NavDataAdapter>) {
        self.destroy_crowd();
        self.nav_data = Some(nav);
        self.create_crowd();
    }

    /// Rebuilds the engine against the current navigation data and places
    /// every registered agent again
    pub fn on_nav_data_updated(&mut self) {
        self.destroy_crowd();
        self.create_crowd();
    }

    /// Replaces the engine settings and tables, then rebuilds
    pub fn set_config(&mut self, config: CrowdManagerConfig) {
        self.load_config(config);
        self.on_nav_data_updated();
    }

    pub fn set_offmesh_connection_pruning(&mut self, prune: bool) {
        self.config.prune_started_offmesh_connections = prune;
        if let Some(crowd) = self.crowd.as_mut() {
            crowd.set_prune_started_offmesh_connections(prune);
        }
    }

    pub fn set_single_area_visibility_optimization(&mut self, enable: bool) {
        self.config.single_area_visibility_optimization = enable;
        if let Some(crowd) = self.crowd.as_mut() {
            crowd.set_single_area_visibility_optimization(enable);
        }
    }

    /// Called once per tick after every stage has run
    pub fn set_tick_observer(&mut self, observer: impl FnMut(&CrowdManager) + 'static) {
        self.tick_observer = Some(Box::new(observer));
    }

    pub fn clear_tick_observer(&mut self) {
        self.tick_observer = None;
    }

    fn create_crowd(&mut self) {
        if self.crowd.is_some() {
            return;
        }
        let Some(nav) = self.nav_data.as_deref() else {
            return;
        };
        if !nav.is_ready() {
            log::debug!("Navigation data not ready, crowd creation deferred");
            return;
        }
        let Some(mut crowd) = self.backend.create_crowd(&self.config.crowd_config()) else {
            return;
        };
        release_dropped_agents(None, &mut self.registry);

        for (i, config) in self.avoidance_configs.iter().enumerate() {
            if let Err(err) = crowd.set_obstacle_avoidance_params(i, &config.to_params()) {
                log::warn!("Skipping avoidance config {i}: {err}");
            }
        }
        for (i, pattern) in self.sampling_patterns.iter().enumerate() {
            if pattern.is_empty() {
                log::warn!("Skipping empty sampling pattern {i}");
                continue;
            }
            if let Err(err) = crowd.set_sampling_pattern(i, pattern.clone()) {
                log::warn!("Skipping sampling pattern {i}: {err}");
            }
        }

        for slot in self.registry.slots_mut() {
            if let Some(agent) = slot.handle.upgrade() {
                add_to_crowd(&mut crowd, nav, slot, agent.as_ref());
            }
        }

        log::info!(
            "Crowd simulation created with {} registered agents",
            self.registry.len()
        );
        self.crowd = Some(crowd);
    }

    fn destroy_crowd(&mut self) {
        if self.crowd.take().is_none() {
            return;
        }
        for slot in self.registry.slots_mut() {
            slot.engine_idx = None;
        }
        log::info!("Crowd simulation destroyed");
    }

    /// Registers an agent, placing it in the engine when one exists.
    /// Returns false if the agent is already registered.
    pub fn register_agent(&mut self, agent: &Arc<dyn CrowdAgent>) -> bool {
        release_dropped_agents(self.crowd.as_mut(), &mut self.registry);
        let key = AgentKey::of(agent.as_ref());
        if self.registry.contains(key) {
            log::debug!("register_agent rejected: agent already registered");
            return false;
        }
        self.registry.insert(key, AgentSlot::new(agent));

        if self.crowd.is_none() {
            self.create_crowd();
            return true;
        }

        if let (Some(crowd), Some(nav), Some(slot)) = (
            self.crowd.as_mut(),
            self.nav_data.as_deref(),
            self.registry.get_mut(key),
        ) {
            add_to_crowd(crowd, nav, slot, agent.as_ref());
        }
        true
    }

    /// Removes the agent and releases its link filter
    pub fn unregister_agent(&mut self, agent: &dyn CrowdAgent) -> bool {
        let Some(mut slot) = self.registry.remove(AgentKey::of(agent)) else {
            return false;
        };
        if let (Some(crowd), Some(idx)) = (self.crowd.as_mut(), slot.index()) {
            crowd.remove_agent(idx);
        }
        slot.clear_filter();
        true
    }

    pub fn is_agent_valid(&self, agent: &dyn CrowdAgent) -> bool {
        self.registry
            .get(AgentKey::of(agent))
            .is_some_and(|slot| slot.is_valid)
    }

    pub fn is_agent_simulated(&self, agent: &dyn CrowdAgent) -> bool {
        self.registry
            .get(AgentKey::of(agent))
            .is_some_and(|slot| slot.is_simulated)
    }

    pub fn registered_agent_count(&self) -> usize {
        self.registry.len()
    }

    /// Engine index of the agent, `None` until it is placed in the engine
    pub fn agent_index(&self, agent: &dyn CrowdAgent) -> Option<usize> {
        self.engine_index(agent).ok()
    }

    /// Pushes the agent's current parameters into the engine
    pub fn update_agent_params(&mut self, agent: &dyn CrowdAgent) -> bool {
        report("update_agent_params", self.push_agent_params(agent))
    }

    fn push_agent_params(&mut self, agent: &dyn CrowdAgent) -> RequestResult<()> {
        let slot = self
            .registry
            .get_mut(AgentKey::of(agent))
            .ok_or(RequestError::InvalidAgent)?;
        let was_simulated = slot.is_simulated;
        slot.refresh(agent);

        let crowd = self.crowd.as_mut().ok_or(RequestError::NotReady)?;
        let idx = slot.index().ok_or(RequestError::InvalidAgent)?;

        let mut params = derive_params(agent);
        params.link_filter = slot.link_filter.clone();
        crowd.update_agent_parameters(idx, &params)?;
        if was_simulated && !slot.is_simulated {
            crowd.reset_move_target(idx)?;
        }
        Ok(())
    }

    /// Recomputes the engine state of the agent from its corridor
    pub fn update_agent_state(&mut self, agent: &dyn CrowdAgent, force_replan: bool) -> bool {
        let result = self.engine_index(agent).and_then(|idx| {
            self.crowd_mut()?.update_agent_state(idx, force_replan)?;
            Ok(())
        });
        report("update_agent_state", result)
    }

    fn crowd_mut(&mut self) -> RequestResult<&mut Crowd> {
        self.crowd.as_mut().ok_or(RequestError::NotReady)
    }

    fn engine_index(&self, agent: &dyn CrowdAgent) -> RequestResult<usize> {
        let slot = self
            .registry
            .get(AgentKey::of(agent))
            .ok_or(RequestError::InvalidAgent)?;
        if self.crowd.is_none() {
            return Err(RequestError::NotReady);
        }
        slot.index().ok_or(RequestError::InvalidAgent)
    }

    fn simulated_index(&self, agent: &dyn CrowdAgent) -> RequestResult<usize> {
        let slot = self
            .registry
            .get(AgentKey::of(agent))
            .ok_or(RequestError::InvalidAgent)?;
        if !slot.is_simulated {
            return Err(RequestError::NotSimulated);
        }
        self.engine_index(agent)
    }

    /// Projects `dest` onto the navigation data and requests a path to it.
    /// Without a filter the navigation data's default filter is used.
    pub fn set_agent_move_target(
        &mut self,
        agent: &dyn CrowdAgent,
        dest: Vec3,
        filter: Option<&QueryFilter>,
    ) -> bool {
        let result = self.request_move_target(agent, dest, filter);
        report("set_agent_move_target", result)
    }

    fn request_move_target(
        &mut self,
        agent: &dyn CrowdAgent,
        dest: Vec3,
        filter: Option<&QueryFilter>,
    ) -> RequestResult<()> {
        let idx = self.simulated_index(agent)?;
        let nav = self.nav_data.as_deref().ok_or(RequestError::NotReady)?;
        let crowd = self.crowd.as_mut().ok_or(RequestError::NotReady)?;

        let filter = filter
            .cloned()
            .unwrap_or_else(|| nav.default_query_filter());
        let (location, poly) = nav
            .project_point(dest, nav.default_query_extent(), &filter)
            .ok_or_else(|| RequestError::NavQueryFailure(format!("cannot project {dest}")))?;

        crowd.update_agent_filter(idx, &filter)?;
        crowd.update_agent_state(idx, false)?;
        crowd.request_move_target(idx, poly, location)?;
        Ok(())
    }

    /// Moves the agent along `direction` at its maximum speed
    pub fn set_agent_move_direction(&mut self, agent: &dyn CrowdAgent, direction: Vec3) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            let velocity = direction * agent.max_speed();
            let crowd = self.crowd_mut()?;
            crowd.update_agent_state(idx, false)?;
            crowd.request_move_velocity(idx, velocity)?;
            Ok(())
        });
        report("set_agent_move_direction", result)
    }

    /// Seeds the corridor with `path.corridor[start..=end]`
    pub fn set_agent_move_path(
        &mut self,
        agent: &dyn CrowdAgent,
        path: &NavMeshPath,
        start: usize,
        end: usize,
    ) -> bool {
        let result = self.request_move_path(agent, path, start, end);
        report("set_agent_move_path", result)
    }

    fn request_move_path(
        &mut self,
        agent: &dyn CrowdAgent,
        path: &NavMeshPath,
        start: usize,
        end: usize,
    ) -> RequestResult<()> {
        let idx = self.simulated_index(agent)?;
        let Some(&last_point) = path.points.last() else {
            return Err(RequestError::InvalidPath("no path points".into()));
        };
        if path.points.len() < 2 {
            return Err(RequestError::InvalidPath("path too short".into()));
        }
        if start > end || end >= path.corridor.len() {
            return Err(RequestError::InvalidPath(format!(
                "section {start}..={end} outside corridor of {}",
                path.corridor.len()
            )));
        }

        let nav = self.nav_data.as_deref().ok_or(RequestError::NotReady)?;
        let crowd = self.crowd.as_mut().ok_or(RequestError::NotReady)?;

        let end_poly = path.corridor[end];
        let target = if end == path.corridor.len() - 1 {
            last_point
        } else {
            nav.query().poly_center(end_poly).unwrap_or(last_point)
        };
        let filter = path
            .filter
            .clone()
            .unwrap_or_else(|| nav.default_query_filter());

        crowd.update_agent_filter(idx, &filter)?;
        crowd.update_agent_state(idx, false)?;
        crowd.request_move_target(idx, end_poly, target)?;
        crowd.set_agent_corridor(idx, &path.corridor[start..=end])?;
        Ok(())
    }

    /// Advances `start` to the agent's current polygon in `path`
    pub fn adjust_agent_path_start(
        &self,
        agent: &dyn CrowdAgent,
        path: &NavMeshPath,
        start: &mut usize,
    ) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            let crowd = self.crowd.as_ref().ok_or(RequestError::NotReady)?;
            let first = crowd
                .agent(idx)
                .map_or(PolyRef::NULL, |ag| ag.corridor.get_first_poly());
            let offset = path
                .corridor
                .iter()
                .skip(*start)
                .position(|&poly| poly == first)
                .ok_or_else(|| RequestError::InvalidPath(format!("polygon {first} not on path")))?;
            *start += offset;
            Ok(())
        });
        report("adjust_agent_path_start", result)
    }

    /// Drops the current target and stops the agent
    pub fn clear_agent_move_target(&mut self, agent: &dyn CrowdAgent) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            let crowd = self.crowd_mut()?;
            crowd.reset_move_target(idx)?;
            crowd.reset_agent_velocity(idx)?;
            Ok(())
        });
        report("clear_agent_move_target", result)
    }

    pub fn pause_agent(&mut self, agent: &dyn CrowdAgent) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            let crowd = self.crowd_mut()?;
            crowd.set_agent_waiting(idx)?;
            crowd.reset_agent_velocity(idx)?;
            Ok(())
        });
        report("pause_agent", result)
    }

    pub fn resume_agent(&mut self, agent: &dyn CrowdAgent, force_replan: bool) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            self.crowd_mut()?.update_agent_state(idx, force_replan)?;
            Ok(())
        });
        report("resume_agent", result)
    }

    /// Puts an agent that finished a custom link back on its corridor
    pub fn on_agent_finished_custom_link(&mut self, agent: &dyn CrowdAgent) -> bool {
        let result = self.simulated_index(agent).and_then(|idx| {
            self.crowd_mut()?.set_agent_back_on_link(idx)?;
            Ok(())
        });
        report("on_agent_finished_custom_link", result)
    }

    /// Neighbours found by the last proximity update
    pub fn num_nearby_agents(&self, agent: &dyn CrowdAgent) -> usize {
        self.engine_index(agent)
            .ok()
            .and_then(|idx| self.crowd.as_ref()?.agent(idx))
            .map_or(0, |ag| ag.neighbours.len())
    }

    pub fn nearby_agent_locations(&self, agent: &dyn CrowdAgent) -> Vec<Vec3> {
        let (Ok(idx), Some(crowd)) = (self.engine_index(agent), self.crowd.as_ref()) else {
            return Vec::new();
        };
        let Some(ag) = crowd.agent(idx) else {
            return Vec::new();
        };
        ag.neighbours
            .iter()
            .filter_map(|nei| crowd.agent(nei.idx).map(|other| other.npos))
            .collect()
    }

    pub fn avoidance_config(&self, idx: usize) -> Option<&AvoidanceConfig> {
        self.avoidance_configs.get(idx)
    }

    pub fn avoidance_config_count(&self) -> usize {
        self.avoidance_configs.len()
    }

    /// Replaces config `idx`, or appends it when `idx` is the table size
    pub fn set_avoidance_config(&mut self, idx: usize, config: &AvoidanceConfig) -> bool {
        let result = self.store_avoidance_config(idx, config);
        report("set_avoidance_config", result)
    }

    fn store_avoidance_config(&mut self, idx: usize, config: &AvoidanceConfig) -> RequestResult<()> {
        let len = self.avoidance_configs.len();
        if idx > len || idx >= CROWD_MAX_OBSTAVOIDANCE_PARAMS {
            return Err(RequestError::ConfigOutOfRange(format!(
                "avoidance config {idx} with {len} stored"
            )));
        }
        if !config.has_valid_weights() {
            return Err(RequestError::ConfigOutOfRange(
                "negative avoidance weight".into(),
            ));
        }
        if let Some(pattern) = config.custom_pattern {
            if pattern as usize >= self.sampling_patterns.len() {
                return Err(RequestError::ConfigOutOfRange(format!(
                    "sampling pattern {pattern} does not exist"
                )));
            }
        }

        if idx == len {
            self.avoidance_configs.push(*config);
        } else {
            self.avoidance_configs[idx] = *config;
        }

        if let Some(crowd) = self.crowd.as_mut() {
            for (i, config) in self.avoidance_configs.iter().enumerate() {
                crowd.set_obstacle_avoidance_params(i, &config.to_params())?;
            }
        }
        Ok(())
    }

    pub fn sampling_pattern(&self, idx: usize) -> Option<&SamplingPattern> {
        self.sampling_patterns.get(idx)
    }

    pub fn sampling_pattern_count(&self) -> usize {
        self.sampling_patterns.len()
    }

    /// Advances the simulation by `dt` seconds
    pub fn tick(&mut self, dt: f32) {
        let Self {
            config,
            backend,
            nav_data,
            crowd,
            registry,
            ..
        } = self;
        release_dropped_agents(crowd.as_mut(), registry);
        let (Some(crowd), Some(nav)) = (crowd.as_mut(), nav_data.as_deref()) else {
            return;
        };
        if crowd.active_agent_count() == 0 {
            return;
        }

        {
            let _batch = BatchQuery::begin(nav);
            let query = nav.query();

            snapshot_agents(crowd, registry, config.path_optimization_interval, dt);
            crowd.update_step_corridor(dt, query);
            crowd.update_step_paths(dt, query);
            crowd.update_step_proximity_data(dt, query);
            backend.post_proximity_update(crowd, dt);
            crowd.update_step_next_move_point(dt, query);
            crowd.update_step_steering(dt);
            crowd.update_step_avoidance(dt);
            if config.resolve_collisions {
                crowd.update_step_move(dt, query);
            }
            sync_agent_components(crowd, registry, nav);
            crowd.update_step_offmesh_velocity(dt);
            apply_agent_results(crowd, registry, config.resolve_collisions);
        }

        if let Some(mut observer) = self.tick_observer.take() {
            observer(&*self);
            if self.tick_observer.is_none() {
                self.tick_observer = Some(observer);
            }
        }
    }
}

fn add_to_crowd(
    crowd: &mut Crowd,
    nav: &dyn NavDataAdapter,
    slot: &mut AgentSlot,
    agent: &dyn CrowdAgent,
) {
    slot.refresh(agent);
    let mut params = derive_params(agent);
    params.link_filter = slot.link_filter.clone();

    let filter = nav.default_query_filter();
    match crowd.add_agent(agent.location(), &params, &filter, nav.query()) {
        Ok(idx) => {
            slot.engine_idx = Some(idx);
            slot.is_valid = true;
            slot.path_opt_remaining = 0.0;
            slot.prev_poly = crowd
                .agent(idx)
                .map_or(PolyRef::NULL, |ag| ag.corridor.get_first_poly());
        }
        Err(err) => {
            log::warn!("Failed to add agent to crowd: {err}");
            slot.engine_idx = None;
            slot.is_valid = false;
        }
    }
}

/// Frees the engine slots of agents dropped without being unregistered
fn release_dropped_agents(mut crowd: Option<&mut Crowd>, registry: &mut AgentRegistry) {
    let dropped = registry.take_dropped();
    if dropped.is_empty() {
        return;
    }
    log::debug!("Releasing {} dropped agents", dropped.len());
    for mut slot in dropped {
        if let (Some(crowd), Some(idx)) = (crowd.as_deref_mut(), slot.index()) {
            crowd.remove_agent(idx);
        }
        slot.clear_filter();
    }
}

/// Copies the external agent state into the engine
fn snapshot_agents(crowd: &mut Crowd, registry: &mut AgentRegistry, opt_interval: f32, dt: f32) {
    for slot in registry.slots_mut() {
        let Some(idx) = slot.index() else {
            continue;
        };
        let Some(agent) = slot.handle.upgrade() else {
            continue;
        };
        let Some(ag) = crowd.agent_mut(idx).filter(|ag| ag.active) else {
            continue;
        };

        ag.npos = agent.location();
        ag.vel = agent.velocity();
        ag.params.max_speed = agent.max_speed();

        // Visibility optimization only runs on the tick the timer expires
        if slot.wants_path_optimization {
            slot.path_opt_remaining -= dt;
            let optimize = slot.path_opt_remaining <= 0.0;
            if optimize {
                slot.path_opt_remaining = opt_interval;
            }
            ag.params.update_flags.set(UpdateFlags::OPTIMIZE_VIS, optimize);
        }
    }
}

/// Reports polygon changes and hands custom links over to the agents
fn sync_agent_components(crowd: &mut Crowd, registry: &mut AgentRegistry, nav: &dyn NavDataAdapter) {
    for slot in registry.slots_mut() {
        if !slot.is_simulated {
            continue;
        }
        let (Some(idx), Some(agent)) = (slot.index(), slot.handle.upgrade()) else {
            continue;
        };
        let Some(sim) = agent.as_simulated() else {
            continue;
        };
        let Some(ag) = crowd.agent(idx).filter(|ag| ag.active) else {
            continue;
        };

        // A link being traversed counts as the current node
        let poly = if ag.anim.active {
            ag.anim.poly_ref
        } else {
            ag.corridor.get_first_poly()
        };
        if poly != slot.prev_poly {
            sim.on_nav_node_changed(poly, slot.prev_poly, ag.corridor.get_path_count());
            slot.prev_poly = poly;
        }

        // Link traversal that started during this tick
        let started_link =
            ag.state == CrowdAgentState::OffMesh && ag.anim.active && ag.anim.t == 0.0;
        if !started_link {
            continue;
        }
        let dest = ag.anim.end_pos;
        let Some(link_id) = nav.custom_link_id(ag.anim.poly_ref) else {
            continue;
        };

        if let Err(err) = crowd
            .set_agent_waiting(idx)
            .and_then(|_| crowd.reset_agent_velocity(idx))
        {
            log::debug!("Failed to hand custom link {link_id} to agent: {err}");
            continue;
        }
        sim.start_using_custom_link(link_id, dest);
    }
}

fn apply_agent_results(crowd: &Crowd, registry: &AgentRegistry, apply_position: bool) {
    for slot in registry.slots() {
        if !slot.is_simulated {
            continue;
        }
        let (Some(idx), Some(agent)) = (slot.index(), slot.handle.upgrade()) else {
            continue;
        };
        let Some(sim) = agent.as_simulated() else {
            continue;
        };
        let Some(ag) = crowd.agent(idx).filter(|ag| ag.active) else {
            continue;
        };

        let using_link = ag.anim.active;
        let dest = if using_link {
            ag.anim.end_pos
        } else {
            ag.corners.first().map_or(ag.npos, |corner| corner.pos)
        };
        sim.apply_crowd_agent_velocity(ag.nvel, dest, using_link);
        if apply_position {
            sim.apply_crowd_agent_position(ag.npos);
        }
    }
}
