//! Error types for the Memoria storage engine.

use alloc::string::String;
use core::fmt;

/// Result type alias for Memoria operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for Memoria operations.
///
/// Corruption found while decoding packed data is not represented here:
/// it is a programmer error and panics at the point of detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A packed structure or block has no room for the requested growth.
    Capacity {
        requested: usize,
        available: usize,
    },
    /// The snapshot (or node) is in a state that forbids the operation.
    InvalidState {
        message: String,
    },
    /// A block, snapshot, container or type is unknown.
    NotFound {
        what: &'static str,
        id: String,
    },
    /// The target already holds an entity with the same id.
    AlreadyExists {
        what: &'static str,
        id: String,
    },
    /// Invalid operation.
    InvalidOperation {
        message: String,
    },
    /// A structural check or a byte image failed validation.
    Corrupted {
        message: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Capacity {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Not enough space: requested {} bytes, {} available",
                    requested, available
                )
            }
            Error::InvalidState { message } => {
                write!(f, "Invalid state: {}", message)
            }
            Error::NotFound { what, id } => {
                write!(f, "{} is not found: {}", what, id)
            }
            Error::AlreadyExists { what, id } => {
                write!(f, "{} already exists: {}", what, id)
            }
            Error::InvalidOperation { message } => {
                write!(f, "Invalid operation: {}", message)
            }
            Error::Corrupted { message } => {
                write!(f, "Corrupted data: {}", message)
            }
        }
    }
}

impl Error {
    /// Creates a capacity error.
    pub fn capacity(requested: usize, available: usize) -> Self {
        Error::Capacity {
            requested,
            available,
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: &'static str, id: impl fmt::Display) -> Self {
        Error::NotFound {
            what,
            id: alloc::format!("{}", id),
        }
    }

    /// Creates an already exists error.
    pub fn already_exists(what: &'static str, id: impl fmt::Display) -> Self {
        Error::AlreadyExists {
            what,
            id: alloc::format!("{}", id),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::Corrupted {
            message: message.into(),
        }
    }

    /// Returns true if the error signals that a structure is full.
    ///
    /// Node level code reacts to this by splitting instead of failing.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_display() {
        let err = Error::capacity(128, 16);
        assert!(err.to_string().contains("128"));

        let err = Error::not_found("Block", 42);
        assert_eq!(err.to_string(), "Block is not found: 42");

        let err = Error::invalid_state("Snapshot is committed");
        assert!(err.to_string().contains("committed"));
    }

    #[test]
    fn test_error_constructors() {
        let err = Error::already_exists("Container", "abc");
        match err {
            Error::AlreadyExists { what, id } => {
                assert_eq!(what, "Container");
                assert_eq!(id, "abc");
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_is_capacity() {
        assert!(Error::capacity(1, 0).is_capacity());
        assert!(!Error::corrupted("bad").is_capacity());
    }
}
