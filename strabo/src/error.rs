use thiserror::Error;
use wire::WireError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hash: {0}")]
    Hash(String),
    #[error("partition: {0}")]
    Partition(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("filesystem: {0}")]
    Filesystem(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
}

impl From<WireError> for Error {
    fn from(error: WireError) -> Error {
        match error {
            WireError::Io(error) => Error::Io(error),
            WireError::TypeMismatch { .. }
                | WireError::Incomparable(_, _) =>
                    Error::Validation(error.to_string()),
            x => Error::Serialization(x.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Error {
        Error::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Serialization(error.to_string())
    }
}
