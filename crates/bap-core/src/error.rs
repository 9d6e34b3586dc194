use thiserror::Error;

#[derive(Error, Debug)]
pub enum BapError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed metadata at line {line}: expected `key = value`")]
    MalformedMetadata { line: usize },

    #[error("Missing metadata field: {0}")]
    MissingField(String),

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid person string: {0:?}")]
    InvalidPerson(String),
}

pub type Result<T> = std::result::Result<T, BapError>;
