//! Error types for the meta auxiliary training library

use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// A functional forward pass asked for a parameter the mapping does not hold
    #[error("missing weight for parameter `{0}`")]
    MissingWeight(String),

    /// A checkpoint does not line up with the network it is loaded into
    #[error("checkpoint {path} does not match the network: {reason}")]
    CheckpointMismatch { path: String, reason: String },

    /// Gradient list does not line up with the tensors it belongs to
    #[error("expected {expected} gradients, got {found}")]
    GradientMismatch { expected: usize, found: usize },

    /// Invalid task split
    #[error("invalid psi: {0}")]
    InvalidPsi(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Data source error
    #[error("data source error: {0}")]
    DataSource(String),

    /// libtorch error
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a data source error
    pub fn data_source(msg: impl Into<String>) -> Self {
        Error::DataSource(msg.into())
    }

    /// Create a checkpoint mismatch error
    pub fn checkpoint_mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CheckpointMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
