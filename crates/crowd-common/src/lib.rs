//! Common types shared by the crowd engine and the crowd manager

mod math;
mod poly_ref;

pub use math::*;
pub use poly_ref::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid polygon reference: {0}")]
    InvalidPolyRef(PolyRef),

    #[error("invalid agent index: {0}")]
    InvalidAgent(usize),

    #[error("navigation query failed: {0}")]
    NavQuery(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
}

/// Result type for crowd operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::InvalidPolyRef(PolyRef::new(42));
        assert_eq!(err.to_string(), "invalid polygon reference: 42");

        let err = Error::CapacityExceeded("agents".into());
        assert_eq!(err.to_string(), "capacity exceeded: agents");
    }
}
