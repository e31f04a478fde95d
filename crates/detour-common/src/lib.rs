//! Common types shared by the navigation mesh, crowd and service crates

mod geometry;
mod status;

pub use geometry::*;
pub use status::Status;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the navigation crates
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid navigation mesh: {0}")]
    InvalidMesh(String),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("crowd error: {0}")]
    Crowd(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("detour error: {0}")]
    Detour(#[from] Status),
}

impl Error {
    /// Returns the Detour status carried by this error, if any
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Detour(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result type for navigation operations
pub type Result<T> = std::result::Result<T, Error>;
