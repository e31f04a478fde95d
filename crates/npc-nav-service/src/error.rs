use detour::LoadError;
use detour_common::{Error, Status};
use thiserror::Error;

/// Outcome of a failed service operation
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no navigable polygon near {0:?}")]
    QueryNotFound([f32; 3]),

    #[error("unknown agent {0}")]
    UnknownAgent(String),

    #[error("agent {0} is not active")]
    InactiveAgent(String),

    #[error("crowd is full ({0} agents)")]
    CrowdFull(usize),

    #[error("agent {0} already exists")]
    DuplicateAgent(String),

    #[error("failed to load navigation mesh: {0}")]
    Load(#[from] LoadError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] Error),
}

impl ServiceError {
    /// True for outcomes callers run into in normal operation
    ///
    /// Expected outcomes are logged at debug level, everything else is a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ServiceError::QueryNotFound(_)
                | ServiceError::UnknownAgent(_)
                | ServiceError::InactiveAgent(_)
                | ServiceError::CrowdFull(_)
                | ServiceError::DuplicateAgent(_)
        )
    }

    pub(crate) fn log(&self, operation: &str) {
        if self.is_expected() {
            log::debug!("{} failed: {}", operation, self);
        } else {
            log::error!("{} failed: {}", operation, self);
        }
    }
}

/// Maps a nearest-polygon failure to [`ServiceError::QueryNotFound`]
pub(crate) fn not_found_at(pos: &[f32; 3]) -> impl FnOnce(Error) -> ServiceError + '_ {
    move |e| match e.status() {
        Some(Status::NotFound) => ServiceError::QueryNotFound(*pos),
        _ => ServiceError::Internal(e),
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_outcomes() {
        assert!(ServiceError::QueryNotFound([0.0; 3]).is_expected());
        assert!(ServiceError::UnknownAgent("npc-7".into()).is_expected());
        assert!(ServiceError::CrowdFull(50).is_expected());
        assert!(!ServiceError::Load(LoadError::NoTiles).is_expected());
        assert!(!ServiceError::Internal(Error::Detour(Status::Failure)).is_expected());
    }

    #[test]
    fn test_not_found_mapping() {
        let pos = [1.0, 2.0, 3.0];
        assert!(matches!(
            not_found_at(&pos)(Error::Detour(Status::NotFound)),
            ServiceError::QueryNotFound(p) if p == pos
        ));
        assert!(matches!(
            not_found_at(&pos)(Error::Detour(Status::InvalidParam)),
            ServiceError::Internal(_)
        ));
    }
}
