use chemgate_core::GatewayError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] chemgate_core::ValidationError),

    #[error("[{code}] {0}", code = .0.code())]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Gateway(GatewayError::Validation(_) | GatewayError::Config { .. }) => 2,
            Self::Gateway(GatewayError::JobTimedOut { .. } | GatewayError::AdmissionTimeout { .. }) => 5,
            Self::Gateway(_) => 3,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chemgate_core::RemoteJobId;

    use super::*;

    #[test]
    fn timeouts_have_their_own_exit_code() {
        let error = CliError::from(GatewayError::JobTimedOut {
            job_id: RemoteJobId::new("1"),
            elapsed: Duration::from_secs(30),
            poll_attempts: 3,
        });

        assert_eq!(error.exit_code(), 5);
        assert!(error.to_string().starts_with("[gateway.job_timed_out]"));
    }

    #[test]
    fn gateway_errors_display_code_then_message() {
        let query = GatewayError::Query {
            message: String::from("invalid term"),
        };
        let expected = format!("[gateway.query] {query}");

        let error = CliError::from(query);

        assert_eq!(error.to_string(), expected);
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn wrapped_validation_is_a_usage_error() {
        let error = CliError::from(GatewayError::from(chemgate_core::ValidationError::EmptyBatch));
        assert_eq!(error.exit_code(), 2);
    }
}
