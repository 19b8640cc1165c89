mod convert;
mod identify;
mod lookup;
mod vendors;

use std::time::Instant;

use chemgate_core::{Gateway, GatewayConfig};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::Envelope;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Default → `--config` file → `CHEMGATE_*` environment → command-line flags.
pub fn load_config(cli: &Cli) -> Result<GatewayConfig, CliError> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::from_json_file(path)?,
        None => GatewayConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(interval) = cli.poll_interval_ms {
        config.poll.interval_ms = interval;
    }
    if let Some(timeout) = cli.job_timeout_ms {
        config.poll.timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(cli: &Cli) -> Result<Envelope, CliError> {
    let config = load_config(cli)?;
    debug!(?config, "configuration loaded");
    let gateway = Gateway::reqwest(config)?;
    let started = Instant::now();

    let (name, result) = match &cli.command {
        Command::Identify(args) => ("identify", identify::run(args, &gateway).await?),
        Command::Convert(args) => ("convert", convert::run(args, &gateway).await?),
        Command::Vendors(args) => ("vendors", vendors::run(args, &gateway).await?),
        Command::Cas(args) => ("cas", lookup::cas(args, &gateway).await?),
        Command::VendorLinks(args) => ("vendor-links", lookup::vendor_links(args, &gateway).await?),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    Ok(Envelope::new(name, result.data, result.warnings, latency_ms))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;

    #[test]
    fn command_line_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"poll": {{"interval_ms": 2000, "timeout_ms": 60000}}}}"#).expect("write");
        let path = file.path().to_string_lossy().into_owned();

        let cli = Cli::parse_from([
            "chemgate",
            "--config",
            path.as_str(),
            "--poll-interval-ms",
            "500",
            "cas",
            "2244",
        ]);
        let config = load_config(&cli).expect("valid config");

        assert_eq!(config.poll.interval_ms, 500);
        assert_eq!(config.poll.timeout_ms, 60_000);
    }

    #[test]
    fn zero_timeout_flag_is_rejected() {
        let cli = Cli::parse_from(["chemgate", "--job-timeout-ms", "0", "cas", "1"]);
        let error = load_config(&cli).expect_err("zero timeout");
        assert_eq!(error.exit_code(), 2);
    }
}
