use std::time::Duration;

use thiserror::Error;

use crate::http_client::HttpError;
use crate::protocol::RemoteJobId;
use crate::rate_budget::ServiceFamily;

/// Validation and contract errors exposed by `chemgate-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identifier batch must contain at least one identifier")]
    EmptyBatch,
    #[error("identifier at index {index} is empty")]
    EmptyIdentifier { index: usize },
    #[error("registry number must be a positive integer: '{value}'")]
    InvalidRegistryNumber { value: String },

    #[error("invalid identifier type '{value}', expected one of smiles, cid, inchi")]
    InvalidIdentifierKind { value: String },
    #[error("invalid output field '{value}', expected one of cid, inchi, iupac, smiles")]
    InvalidOutputField { value: String },
    #[error("invalid primary identifier '{value}', expected one of cid, smiles, inchi")]
    InvalidPrimaryIdentifier { value: String },

    #[error("search query cannot be empty")]
    EmptyQuery,
    #[error("export row limit must be greater than zero")]
    ZeroRowLimit,
    #[error("export must request at least one field")]
    EmptyExportFields,
    #[error("export field '{value}' must be lowercase ASCII letters, digits or '_'")]
    InvalidExportField { value: String },

    #[error("compound is missing its primary identifier '{field}'")]
    MissingPrimaryIdentifier { field: &'static str },

    #[error("'{field}' must be greater than zero")]
    ZeroLimit { field: &'static str },
}

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("admission to the '{family}' rate budget timed out after {waited:?}")]
    AdmissionTimeout {
        family: ServiceFamily,
        waited: Duration,
    },

    #[error("job submission failed: {message}")]
    Submission { message: String },

    #[error("malformed job result at line {line_number}: {reason}")]
    MalformedResult { line_number: usize, reason: String },

    #[error("could not fetch result from '{location}': {message}")]
    Fetch { location: String, message: String },

    #[error("remote job {job_id} failed: {reason}")]
    JobFailed { job_id: RemoteJobId, reason: String },

    #[error("remote job {job_id} did not finish within {elapsed:?} ({poll_attempts} polls)")]
    JobTimedOut {
        job_id: RemoteJobId,
        elapsed: Duration,
        poll_attempts: u32,
    },

    #[error("search query failed: {message}")]
    Query { message: String },

    #[error("cache key resolution failed: {message}")]
    CacheResolution { message: String },

    #[error("bulk export failed: {message}")]
    Export { message: String },

    #[error("lookup for '{identifier}' failed: {message}")]
    Lookup { identifier: String, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable machine-readable code used in CLI output.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AdmissionTimeout { .. } => "gateway.admission_timeout",
            Self::Submission { .. } => "gateway.submission",
            Self::MalformedResult { .. } => "gateway.malformed_result",
            Self::Fetch { .. } => "gateway.fetch",
            Self::JobFailed { .. } => "gateway.job_failed",
            Self::JobTimedOut { .. } => "gateway.job_timed_out",
            Self::Query { .. } => "gateway.query",
            Self::CacheResolution { .. } => "gateway.cache_resolution",
            Self::Export { .. } => "gateway.export",
            Self::Lookup { .. } => "gateway.lookup",
            Self::Transport(_) => "gateway.transport",
            Self::Config { .. } => "gateway.config",
            Self::Validation(_) => "gateway.validation",
            Self::Serialization(_) => "gateway.serialization",
            Self::Io(_) => "gateway.io",
        }
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::AdmissionTimeout { .. } | Self::JobTimedOut { .. } => true,
            Self::Transport(error) => error.retryable(),
            _ => false,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
