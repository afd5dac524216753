use reqwest::StatusCode;
use thiserror::Error;

use crate::config::{ApiVersion, ConfigError};
use crate::device::DeviceInfoError;
use crate::extract::ExtractError;
use crate::job::JobStatus;
use crate::token::TokenError;
use crate::transport::TransportError;

/// Everything the client operations can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("token generation failed: {0}")]
    Auth(#[from] TokenError),

    #[error(transparent)]
    NoDevice(#[from] DeviceInfoError),

    /// The server replied, but not with the status the operation requires.
    #[error("server replied with unexpected status: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("malformed job response: {0}")]
    Parse(#[from] ExtractError),

    #[error("job has no id")]
    MissingJobId,

    #[error("job status {0:?} has no wire representation in the {1:?} vocabulary")]
    UnknownStatus(JobStatus, ApiVersion),
}
