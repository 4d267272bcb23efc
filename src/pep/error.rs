//! Failure taxonomy for the access-decision pipeline.
//!
//! Every variant means the incoming request must not be forwarded; the
//! variants differ only in what gets logged and which status the proxy
//! answers with.

use http::StatusCode;
use thiserror::Error;

/// Boxed transport cause carried by [`PepError::Connection`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PepError {
    /// The request template is missing, empty or references unknown placeholders.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The decision endpoint could not be reached.
    #[error("Connection to decision service failed: {source}")]
    Connection {
        #[source]
        source: BoxError,
    },

    /// The decision endpoint answered with a status other than 200.
    #[error("Decision service returned status {status}")]
    Validation { status: u16 },

    /// The response body is not well-formed XML.
    #[error("Malformed decision response: {0}")]
    MalformedResponse(String),

    /// The response parsed but carried no decision text.
    #[error("Decision element not found in response")]
    DecisionNotFound,

    /// The decision service returned anything other than Permit.
    #[error("Access denied: {0}")]
    AccessDenied(String),
}

pub type PepResult<T> = std::result::Result<T, PepError>;

impl PepError {
    pub fn connection<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        PepError::Connection {
            source: source.into(),
        }
    }

    /// Label used for the `outcome` dimension of the decision metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            PepError::Configuration(_) => "configuration_error",
            PepError::Connection { .. } => "connection_error",
            PepError::Validation { .. } => "validation_error",
            PepError::MalformedResponse(_) => "malformed_response",
            PepError::DecisionNotFound => "decision_not_found",
            PepError::AccessDenied(_) => "deny",
        }
    }

    /// Status returned downstream when this error blocks a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PepError::AccessDenied(_) => StatusCode::FORBIDDEN,
            PepError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PepError::Connection { .. }
            | PepError::Validation { .. }
            | PepError::MalformedResponse(_)
            | PepError::DecisionNotFound => StatusCode::BAD_GATEWAY,
        }
    }
}
