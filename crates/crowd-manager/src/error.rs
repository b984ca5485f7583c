use crowd_common::Error;
use thiserror::Error;

/// Reasons a manager request was rejected
///
/// Public mutators report these as `false` and log them at debug level.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("crowd simulation is not ready")]
    NotReady,

    #[error("agent is not registered or has no simulation slot")]
    InvalidAgent,

    #[error("agent is not simulated")]
    NotSimulated,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("configuration out of range: {0}")]
    ConfigOutOfRange(String),

    #[error("navigation query failed: {0}")]
    NavQueryFailure(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Collapses a request into the boolean contract of the public API
pub(crate) fn report<T>(op: &str, result: RequestResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => {
            log::debug!("{op} rejected: {err}");
            false
        }
    }
}
