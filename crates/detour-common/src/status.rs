//! Status codes for Detour operations

/// Status enum for Detour operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation was successful
    Success,
    /// Operation failed due to an unknown reason
    Failure,
    /// Provided parameter was invalid
    InvalidParam,
    /// Operation ran out of memory or capacity
    OutOfMemory,
    /// Output buffer was too small to hold the full result
    BufferTooSmall,
    /// Search ran out of nodes before completing
    OutOfNodes,
    /// Operation partially succeeded
    PartialResult,
    /// Value does not exist or is not found
    NotFound,
    /// A tile already occupies the requested grid location
    AlreadyOccupied,
    /// Input data is corrupted or truncated
    DataCorrupted,
    /// Data has wrong magic number
    WrongMagic,
    /// Data has wrong version
    WrongVersion,
    /// Every crowd slot is in use
    CrowdFull,
    /// Specified agent does not exist
    AgentNotFound,
}

impl Status {
    /// Checks if the status is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::PartialResult)
    }

    /// Checks if the status is a failure
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Converts status to a result
    pub fn to_result<T>(self, value: T) -> std::result::Result<T, Status> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl std::error::Error for Status {}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "Success"),
            Status::Failure => write!(f, "Failure"),
            Status::InvalidParam => write!(f, "Invalid parameter"),
            Status::OutOfMemory => write!(f, "Out of memory"),
            Status::BufferTooSmall => write!(f, "Buffer too small"),
            Status::OutOfNodes => write!(f, "Out of search nodes"),
            Status::PartialResult => write!(f, "Partial result"),
            Status::NotFound => write!(f, "Value not found"),
            Status::AlreadyOccupied => write!(f, "Tile location already occupied"),
            Status::DataCorrupted => write!(f, "Data corrupted"),
            Status::WrongMagic => write!(f, "Wrong magic number"),
            Status::WrongVersion => write!(f, "Wrong version"),
            Status::CrowdFull => write!(f, "Crowd is full"),
            Status::AgentNotFound => write!(f, "Agent not found"),
        }
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Status::DataCorrupted,
            _ => Status::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_result_is_success() {
        assert!(Status::PartialResult.is_success());
        assert!(Status::NotFound.is_failure());
        assert_eq!(Status::Success.to_result(3), Ok(3));
        assert_eq!(Status::CrowdFull.to_result(()), Err(Status::CrowdFull));
    }

    #[test]
    fn test_truncated_read_maps_to_corrupted() {
        let err = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Status::from(err), Status::DataCorrupted);
    }
}
