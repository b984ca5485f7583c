//! Capabilities of the game objects driven by the crowd manager
//!
//! Every registered object implements [`CrowdAgent`]. Objects that should
//! be steered, not just avoided, also implement [`SimulatedCrowdAgent`]
//! and expose it through [`CrowdAgent::as_simulated`].

use std::sync::Arc;

use crowd_common::{PolyRef, Vec3};
use crowd_engine::{AgentParams, LinkFilter, UpdateFlags};

/// Avoidance configuration used by agents that do not pick one
pub const DEFAULT_AVOIDANCE_QUALITY: u8 = 3;

/// Minimal capability set: what other agents need to avoid this one
pub trait CrowdAgent {
    fn location(&self) -> Vec3;

    fn velocity(&self) -> Vec3;

    fn max_speed(&self) -> f32;

    /// Collision radius and half height
    fn collision_radii(&self) -> (f32, f32);

    fn as_simulated(&self) -> Option<&dyn SimulatedCrowdAgent> {
        None
    }
}

/// Agents moved by the simulation
///
/// The callbacks are invoked during [`crate::CrowdManager::tick`] and get
/// no access to the manager.
pub trait SimulatedCrowdAgent: CrowdAgent {
    /// Zero makes the agent an obstacle only
    fn collision_query_range(&self) -> f32;

    fn path_optimization_range(&self) -> f32;

    fn separation_weight(&self) -> f32 {
        2.0
    }

    /// Index into the avoidance configuration table
    fn avoidance_quality(&self) -> u8 {
        DEFAULT_AVOIDANCE_QUALITY
    }

    fn avoidance_range_multiplier(&self) -> f32 {
        1.0
    }

    fn update_flags(&self) -> UpdateFlags {
        UpdateFlags::ANTICIPATE_TURNS
            | UpdateFlags::OBSTACLE_AVOIDANCE
            | UpdateFlags::SEPARATION
            | UpdateFlags::OPTIMIZE_VIS
            | UpdateFlags::OPTIMIZE_TOPO
    }

    fn avoidance_group(&self) -> u32 {
        1
    }

    fn groups_to_avoid(&self) -> u32 {
        u32::MAX
    }

    fn groups_to_ignore(&self) -> u32 {
        0
    }

    /// Disabled agents keep their slot but are not steered
    fn is_crowd_simulation_enabled(&self) -> bool {
        true
    }

    fn link_filter(&self) -> Option<Arc<dyn LinkFilter>> {
        None
    }

    /// New velocity, the point the agent is heading for, and whether that
    /// point is the end of an off-mesh link
    fn apply_crowd_agent_velocity(&self, new_velocity: Vec3, dest: Vec3, is_using_link: bool);

    fn apply_crowd_agent_position(&self, new_position: Vec3);

    fn on_nav_node_changed(&self, new_poly: PolyRef, prev_poly: PolyRef, corridor_size: usize);

    fn start_using_custom_link(&self, link_id: u32, dest: Vec3);
}

/// True if the agent is steered by the simulation
pub(crate) fn is_simulated(agent: &dyn CrowdAgent) -> bool {
    agent
        .as_simulated()
        .is_some_and(|sim| sim.collision_query_range() > 0.0 && sim.is_crowd_simulation_enabled())
}

/// Engine parameters derived from the agent's current state
pub(crate) fn derive_params(agent: &dyn CrowdAgent) -> AgentParams {
    let (radius, half_height) = agent.collision_radii();
    let mut params = AgentParams {
        radius,
        height: half_height * 2.0,
        max_acceleration: 0.0,
        max_speed: agent.max_speed(),
        collision_query_range: radius * 12.0,
        path_optimization_range: radius * 30.0,
        update_flags: UpdateFlags::empty(),
        obstacle_avoidance_type: DEFAULT_AVOIDANCE_QUALITY,
        avoidance_query_multiplier: 1.0,
        avoidance_group: 1,
        groups_to_avoid: u32::MAX,
        groups_to_ignore: 0,
        ..Default::default()
    };

    if let Some(sim) = agent.as_simulated() {
        params.collision_query_range = sim.collision_query_range();
        params.path_optimization_range = sim.path_optimization_range();
        params.separation_weight = sim.separation_weight();
        params.obstacle_avoidance_type = sim.avoidance_quality();
        params.avoidance_query_multiplier = sim.avoidance_range_multiplier();
        if sim.is_crowd_simulation_enabled() {
            params.update_flags = sim.update_flags();
        }
        params.avoidance_group = sim.avoidance_group();
        params.groups_to_avoid = sim.groups_to_avoid();
        params.groups_to_ignore = sim.groups_to_ignore();
        params.link_filter = sim.link_filter();
    }

    params
}
