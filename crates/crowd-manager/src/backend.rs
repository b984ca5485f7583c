//! Swappable simulation backends
//!
//! The manager never builds a [`Crowd`] itself. A backend decides whether an
//! engine exists at all, and may hook into the tick after neighbours have
//! been gathered.

use crowd_engine::{Crowd, CrowdConfig};

pub trait CrowdBackend {
    /// Builds an engine, `None` leaves the manager permanently not ready
    fn create_crowd(&self, config: &CrowdConfig) -> Option<Crowd>;

    /// Runs between the proximity update and the next move point search
    fn post_proximity_update(&self, _crowd: &mut Crowd, _dt: f32) {}
}

/// Backend running the bundled crowd engine
#[derive(Debug, Default, Clone, Copy)]
pub struct CrowdEngineBackend;

impl CrowdBackend for CrowdEngineBackend {
    fn create_crowd(&self, config: &CrowdConfig) -> Option<Crowd> {
        match Crowd::new(config.clone()) {
            Ok(crowd) => Some(crowd),
            Err(err) => {
                log::warn!("Failed to create crowd: {err}");
                None
            }
        }
    }
}

/// Backend without an engine, every request reports not ready
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl CrowdBackend for NullBackend {
    fn create_crowd(&self, _config: &CrowdConfig) -> Option<Crowd> {
        None
    }
}
