//! Multi-agent crowd simulation on navigation data
//!
//! This crate steps a fixed-capacity set of agents that share one
//! navigation data set. It handles path corridors, local steering,
//! velocity sampling avoidance and off-mesh link traversal. The
//! navigation data itself stays behind the [`NavQuery`] trait.
//!
//! # Features
//!
//! - **Agent Management**: Fixed slot table with per-agent parameters and filters
//! - **Collision Avoidance**: Adaptive or custom velocity sampling patterns
//! - **Path Following**: Corridors with visibility and topology optimization
//! - **Proximity Queries**: Spatial grid for neighbour lookups
//! - **Off-Mesh Links**: Timed traversal with optional early pruning
//!
//! # Example
//!
//! ```rust,ignore
//! use crowd_engine::{AgentParams, Crowd, CrowdConfig, QueryFilter};
//!
//! let mut crowd = Crowd::new(CrowdConfig::new(64, 1.0))?;
//! let agent = crowd.add_agent(start_pos, &AgentParams::default(), &QueryFilter::default(), &nav)?;
//! crowd.request_move_target(agent, target_poly, target_pos)?;
//!
//! crowd.update(delta_time, &nav);
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: Agent table and the staged update
//! - [`PathCorridor`]: Polygon corridor followed by one agent
//! - [`LocalBoundary`]: Nearby wall segments
//! - [`ObstacleAvoidanceQuery`]: Velocity sampling against circles and segments
//! - [`ProximityGrid`]: Spatial indexing for neighbour queries

pub mod crowd;
pub mod local_boundary;
pub mod nav_query;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_nav;

pub use crowd::*;
pub use local_boundary::*;
pub use nav_query::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;
