//! Error types for hub lifecycle management
//!
//! `InfraError` classifies failures coming back from the container engine or
//! the cluster API. `HubError` is what the manager and facade hand to callers.

use thiserror::Error;

/// Classified failure from an infrastructure API call
#[derive(Debug, Clone, Error)]
pub enum InfraError {
    /// The resource does not exist. Expected during existence checks.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same name already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The call or a wait on it ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Any other API or transport failure.
    #[error("api error: {0}")]
    Api(String),
}

impl InfraError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InfraError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, InfraError::Conflict(_))
    }
}

impl From<bollard::errors::Error> for InfraError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => InfraError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => InfraError::Conflict(message),
            bollard::errors::Error::RequestTimeoutError => {
                InfraError::Timeout("docker request timed out".to_string())
            }
            other => InfraError::Api(other.to_string()),
        }
    }
}

impl From<kube::Error> for InfraError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => InfraError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => InfraError::Conflict(resp.message),
            other => InfraError::Api(other.to_string()),
        }
    }
}

/// Errors surfaced by the hub manager and facade
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("Unsupported browser type: {browser_type}. Available: {available:?}")]
    UnsupportedBrowser {
        browser_type: String,
        available: Vec<String>,
    },

    #[error("Browser count must be positive")]
    InvalidCount,

    #[error("Maximum browser instances exceeded: {requested} > {max}")]
    CapacityExceeded { requested: u32, max: u32 },

    /// A resource specification failed the pre-submission gate.
    #[error("invalid {kind} specification: {reason}")]
    InvalidSpec { kind: &'static str, reason: String },

    #[error("Failed to ensure Selenium Hub is running")]
    HubUnavailable,

    #[error("Selenium Hub is not initialized; settings are required on first use")]
    Uninitialized,

    #[error(transparent)]
    Infra(#[from] InfraError),
}

impl HubError {
    /// True for caller or operator errors that must never be retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            HubError::Settings(_)
                | HubError::Validation(_)
                | HubError::UnsupportedBrowser { .. }
                | HubError::InvalidCount
                | HubError::CapacityExceeded { .. }
                | HubError::InvalidSpec { .. }
        )
    }
}

pub type HubResult<T> = std::result::Result<T, HubError>;
