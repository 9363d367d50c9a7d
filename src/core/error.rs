use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PlumeError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Format error: {0}")]
    FormatError(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Capacity error: {0}")]
    CapacityError(String),
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),
    #[error("Invalid argument: {0}")]
    InvalidError(String),
}

impl From<std::io::Error> for PlumeError {
    fn from(err: std::io::Error) -> Self {
        PlumeError::IoError(err.to_string())
    }
}
