use crate::frame::FrameError;
use std::fmt;

/// Failures outside the simulated protocol.
///
/// Rejected sends, lost arbitrations and bit errors are protocol outcomes
/// and never show up here.
#[derive(Debug)]
pub enum SimError {
    /// Frame could not be built
    InvalidFrame(FrameError),
    /// Configuration value out of range or unknown
    InvalidConfig(String),
    /// Node outlived the bus it was attached to
    BusDetached(String),
    /// Config or log file access failed
    Io(std::io::Error),
    /// Config or log entry (de)serialization failed
    Json(serde_json::Error),
    /// Background round scheduler failed
    Scheduler(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::InvalidFrame(e) => write!(f, "Invalid frame: {}", e),
            SimError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            SimError::BusDetached(node) => write!(f, "Node {} is no longer attached to a bus", node),
            SimError::Io(e) => write!(f, "I/O error: {}", e),
            SimError::Json(e) => write!(f, "JSON error: {}", e),
            SimError::Scheduler(msg) => write!(f, "Round scheduler failed: {}", msg),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimError::InvalidFrame(e) => Some(e),
            SimError::Io(e) => Some(e),
            SimError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FrameError> for SimError {
    fn from(e: FrameError) -> Self {
        SimError::InvalidFrame(e)
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError::Io(e)
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
