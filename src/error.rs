use thiserror::Error;

/// Failures the admission layer recognizes.
///
/// Only `ConfigInvalid` ever reaches the process boundary, and only at startup.
/// The others are recovered inside the layer by letting the request through.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Bucket registry full: {len} entries, limit {max}")]
    RegistryFull { len: usize, max: usize },

    #[error("Unable to resolve caller identity")]
    ResolverFailure,

    #[error("Failed to write response: {0}")]
    DownstreamIo(String),
}

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for AdmissionError {
    fn from(err: serde_json::Error) -> Self {
        AdmissionError::ConfigInvalid(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
