//! Configuration of the crowd manager and its avoidance tables

use crowd_engine::{
    CROWD_MAX_OBSTAVOIDANCE_PARAMS, CROWD_MAX_SAMPLING_PATTERNS, CrowdConfig,
    ObstacleAvoidanceParams, SamplingPattern,
};

/// Quality profile of the velocity sampling avoidance
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct AvoidanceConfig {
    pub velocity_bias: f32,
    pub desired_velocity_weight: f32,
    pub current_velocity_weight: f32,
    pub side_bias_weight: f32,
    pub impact_time_weight: f32,
    /// Seconds ahead that collisions are considered
    pub impact_time_range: f32,
    /// Sampling pattern index, `None` for adaptive sampling
    pub custom_pattern: Option<u8>,
    pub adaptive_divisions: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for AvoidanceConfig {
    fn default() -> Self {
        Self {
            velocity_bias: 0.4,
            desired_velocity_weight: 2.0,
            current_velocity_weight: 0.75,
            side_bias_weight: 0.75,
            impact_time_weight: 2.5,
            impact_time_range: 2.5,
            custom_pattern: None,
            adaptive_divisions: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

impl AvoidanceConfig {
    /// Adaptive profile with the default weights
    pub fn adaptive(divisions: u8, rings: u8, depth: u8) -> Self {
        Self {
            adaptive_divisions: divisions,
            adaptive_rings: rings,
            adaptive_depth: depth,
            ..Default::default()
        }
    }

    pub fn with_custom_pattern(mut self, pattern: u8) -> Self {
        self.custom_pattern = Some(pattern);
        self
    }

    pub(crate) fn has_valid_weights(&self) -> bool {
        [
            self.velocity_bias,
            self.desired_velocity_weight,
            self.current_velocity_weight,
            self.side_bias_weight,
            self.impact_time_weight,
            self.impact_time_range,
        ]
        .iter()
        .all(|w| *w >= 0.0)
    }

    pub(crate) fn to_params(self) -> ObstacleAvoidanceParams {
        ObstacleAvoidanceParams {
            vel_bias: self.velocity_bias,
            weight_des_vel: self.desired_velocity_weight,
            weight_cur_vel: self.current_velocity_weight,
            weight_side: self.side_bias_weight,
            weight_toi: self.impact_time_weight,
            horiz_time: self.impact_time_range,
            adaptive_divs: self.adaptive_divisions,
            adaptive_rings: self.adaptive_rings,
            adaptive_depth: self.adaptive_depth,
            pattern_idx: self.custom_pattern,
        }
    }
}

/// The four stock quality levels: 11, 22, 45 and 66 samples
pub fn default_avoidance_configs() -> Vec<AvoidanceConfig> {
    [(5, 2, 1), (5, 2, 2), (7, 2, 3), (7, 3, 3)]
        .into_iter()
        .map(|(divisions, rings, depth)| AvoidanceConfig {
            velocity_bias: 0.5,
            ..AvoidanceConfig::adaptive(divisions, rings, depth)
        })
        .collect()
}

/// Crowd manager configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CrowdManagerConfig {
    pub max_agents: usize,
    pub max_agent_radius: f32,
    pub max_avoided_agents: usize,
    pub max_avoided_walls: usize,
    /// Seconds between checks of agent positions and corridors
    pub navmesh_check_interval: f32,
    /// Seconds between visibility optimizations of one agent's path
    pub path_optimization_interval: f32,
    pub single_area_visibility_optimization: bool,
    pub prune_started_offmesh_connections: bool,
    /// Resolve overlaps inside the crowd and report positions to agents
    pub resolve_collisions: bool,
    pub avoidance_configs: Vec<AvoidanceConfig>,
    pub sampling_patterns: Vec<SamplingPattern>,
}

impl Default for CrowdManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 50,
            max_agent_radius: 100.0,
            max_avoided_agents: 6,
            max_avoided_walls: 8,
            navmesh_check_interval: 1.0,
            path_optimization_interval: 0.5,
            single_area_visibility_optimization: true,
            prune_started_offmesh_connections: false,
            resolve_collisions: false,
            avoidance_configs: default_avoidance_configs(),
            sampling_patterns: Vec::new(),
        }
    }
}

impl CrowdManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }

    pub fn with_max_agent_radius(mut self, radius: f32) -> Self {
        self.max_agent_radius = radius;
        self
    }

    pub fn with_resolve_collisions(mut self, resolve: bool) -> Self {
        self.resolve_collisions = resolve;
        self
    }

    pub fn with_navmesh_check_interval(mut self, interval: f32) -> Self {
        self.navmesh_check_interval = interval;
        self
    }

    pub fn with_path_optimization_interval(mut self, interval: f32) -> Self {
        self.path_optimization_interval = interval;
        self
    }

    pub fn with_avoidance_configs(mut self, configs: Vec<AvoidanceConfig>) -> Self {
        self.avoidance_configs = configs;
        self
    }

    pub fn with_sampling_pattern(mut self, pattern: SamplingPattern) -> Self {
        self.sampling_patterns.push(pattern);
        self
    }

    /// Engine settings, avoidance limits clamped to the engine capacity
    pub(crate) fn crowd_config(&self) -> CrowdConfig {
        CrowdConfig::new(self.max_agents, self.max_agent_radius)
            .with_avoidance_limits(self.max_avoided_agents, self.max_avoided_walls)
            .with_agent_check_interval(self.navmesh_check_interval)
            .with_prune_started_offmesh_connections(self.prune_started_offmesh_connections)
            .with_single_area_visibility_optimization(self.single_area_visibility_optimization)
    }

    /// Avoidance profiles the tables accept: at most the engine capacity,
    /// valid weights, and custom patterns that exist
    pub(crate) fn validated_avoidance_configs(&self) -> Vec<AvoidanceConfig> {
        let pattern_count = self.sampling_patterns.len().min(CROWD_MAX_SAMPLING_PATTERNS);
        let mut accepted = Vec::with_capacity(CROWD_MAX_OBSTAVOIDANCE_PARAMS);
        for (i, config) in self.avoidance_configs.iter().enumerate() {
            if accepted.len() >= CROWD_MAX_OBSTAVOIDANCE_PARAMS {
                log::warn!("Dropping avoidance config {i}, table is full");
                break;
            }
            let pattern_ok = config.custom_pattern.is_none_or(|p| (p as usize) < pattern_count);
            if !config.has_valid_weights() || !pattern_ok {
                log::warn!("Dropping invalid avoidance config {i}: {config:?}");
                continue;
            }
            accepted.push(*config);
        }
        accepted
    }
}
