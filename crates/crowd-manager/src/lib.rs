//! Crowd simulation manager for game agents
//!
//! This crate drives a [`crowd_engine::Crowd`] on behalf of externally owned
//! game objects. Agents register through the [`CrowdAgent`] capability
//! trait, are steered once per frame by [`CrowdManager::tick`], and receive
//! their new velocities through [`SimulatedCrowdAgent`] callbacks.
//!
//! # Features
//!
//! - **Agent Registry**: Weak handles, shared link filters, lazy placement
//! - **Avoidance Tables**: Up to eight quality profiles and sampling patterns
//! - **Move Requests**: Targets, directions, external paths, pause and resume
//! - **Custom Links**: Off-mesh links handed over to the agents
//! - **Rebuilds**: Engine recreation on navigation data changes
//!
//! # Example
//!
//! ```rust,ignore
//! use crowd_manager::{CrowdManager, CrowdManagerConfig};
//!
//! let mut manager = CrowdManager::new(CrowdManagerConfig::default());
//! manager.set_nav_data(nav_data.clone());
//! manager.register_agent(&agent);
//! manager.set_agent_move_target(agent.as_ref(), destination, None);
//!
//! manager.tick(delta_time);
//! ```

pub mod agent;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod nav_data;
mod registry;

pub use agent::*;
pub use backend::*;
pub use config::*;
pub use error::*;
pub use manager::*;
pub use nav_data::*;

#[cfg(test)]
mod crowd_manager_tests;
