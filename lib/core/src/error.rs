use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Database already exists: {0}")]
    DatabaseExists(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

/// Status codes reported across the C boundary. Zero is success.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidArgument = 1,
    InternalError = 2,
    MemoryError = 3,
    NotFound = 4,
    ValidationError = 5,
    InvalidIdentifier = 6,
    NotImplemented = 7,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Validation(_)
            | Error::InvalidDimension { .. }
            | Error::DatabaseExists(_)
            | Error::CollectionExists(_) => ErrorCode::ValidationError,
            Error::InvalidIdentifier(_) => ErrorCode::InvalidIdentifier,
            Error::DatabaseNotFound(_) | Error::CollectionNotFound(_) => ErrorCode::NotFound,
            Error::Internal(_) | Error::Storage(_) | Error::Io(_) | Error::Serialization(_) => {
                ErrorCode::InternalError
            }
            Error::Memory(_) => ErrorCode::MemoryError,
            Error::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
