//! Gateway configuration.
//!
//! Layering: [`GatewayConfig::default`] → optional JSON file
//! ([`GatewayConfig::from_json_file`]) → `CHEMGATE_*` environment overrides
//! ([`GatewayConfig::with_env_overrides`]) → caller-side adjustments.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CHEMGATE_PUBCHEM_BASE_URL` | `pubchem_base_url` |
//! | `CHEMGATE_EUTILS_BASE_URL` | `eutils_base_url` |
//! | `CHEMGATE_CALLS_PER_SECOND` | `pubchem_limits.calls_per_second` |
//! | `CHEMGATE_CALLS_PER_MINUTE` | `pubchem_limits.calls_per_minute` |
//! | `CHEMGATE_ACTIVE_SECONDS_PER_MINUTE` | `pubchem_limits.active_seconds_per_minute` |
//! | `CHEMGATE_EUTILS_CALLS_PER_SECOND` | `eutils_limits.calls_per_second` |
//! | `CHEMGATE_POLL_INTERVAL_MS` | `poll.interval_ms` |
//! | `CHEMGATE_JOB_TIMEOUT_MS` | `poll.timeout_ms` |
//! | `CHEMGATE_POLL_JITTER` | `poll.jitter` |
//! | `CHEMGATE_EXPORT_ROW_CAP` | `export_row_cap` |
//! | `CHEMGATE_REQUEST_TIMEOUT_MS` | `request_timeout_ms` |
//! | `CHEMGATE_PRIMARY_IDENTIFIER` | `primary_identifier` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compound::PrimaryIdentifier;
use crate::error::{GatewayError, ValidationError};
use crate::retry::{Backoff, PollSchedule};

/// Call budget for one service family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub calls_per_second: u32,
    pub calls_per_minute: Option<u32>,
    pub active_seconds_per_minute: Option<u64>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            calls_per_second: 4,
            calls_per_minute: None,
            active_seconds_per_minute: None,
        }
    }
}

impl RateLimits {
    pub fn eutils_default() -> Self {
        Self::default()
    }

    /// NCBI usage policy: 5 requests/second, 400 requests/minute and 300
    /// seconds of running time per minute.
    pub fn pubchem_default() -> Self {
        Self {
            calls_per_second: 5,
            calls_per_minute: Some(400),
            active_seconds_per_minute: Some(300),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.calls_per_second == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "calls_per_second",
            });
        }
        if self.calls_per_minute == Some(0) {
            return Err(ValidationError::ZeroLimit {
                field: "calls_per_minute",
            });
        }
        if self.active_seconds_per_minute == Some(0) {
            return Err(ValidationError::ZeroLimit {
                field: "active_seconds_per_minute",
            });
        }
        Ok(())
    }
}

/// Job polling timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// When set, the poll interval grows by this factor after every attempt.
    pub backoff_factor: Option<f64>,
    pub max_interval_ms: u64,
    /// Spreads growing intervals so concurrent jobs do not poll in lockstep.
    pub jitter: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            interval_ms: 10_000,
            timeout_ms: 500_000,
            backoff_factor: None,
            max_interval_ms: 60_000,
            jitter: false,
        }
    }
}

impl PollConfig {
    pub fn schedule(&self) -> PollSchedule {
        let interval = Duration::from_millis(self.interval_ms);
        let backoff = match self.backoff_factor {
            Some(factor) => Backoff::Exponential {
                base: interval,
                factor,
                max: Duration::from_millis(self.max_interval_ms.max(self.interval_ms)),
                jitter: self.jitter,
            },
            None => Backoff::Fixed { delay: interval },
        };
        PollSchedule {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pubchem_base_url: String,
    pub eutils_base_url: String,
    pub eutils_limits: RateLimits,
    pub pubchem_limits: RateLimits,
    pub poll: PollConfig,
    /// Upper bound applied to every bulk export.
    pub export_row_cap: usize,
    pub request_timeout_ms: u64,
    pub primary_identifier: PrimaryIdentifier,
    /// Match type for single-identifier lookups.
    pub identity_type: String,
    /// Depositor names used by vendor searches and vendor link lookups.
    pub vendor_sources: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pubchem_base_url: String::from("https://pubchem.ncbi.nlm.nih.gov"),
            eutils_base_url: String::from("https://eutils.ncbi.nlm.nih.gov/entrez/eutils"),
            eutils_limits: RateLimits::eutils_default(),
            pubchem_limits: RateLimits::pubchem_default(),
            poll: PollConfig::default(),
            export_row_cap: 1_000_000,
            request_timeout_ms: 30_000,
            primary_identifier: PrimaryIdentifier::default(),
            identity_type: String::from("same_stereo_isotope"),
            vendor_sources: vec![
                String::from("Sigma-Aldrich"),
                String::from("Thermo Fisher Scientific"),
            ],
        }
    }
}

impl GatewayConfig {
    /// Loads a JSON document; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self, GatewayError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `CHEMGATE_*` overrides resolved through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHEMGATE_PUBCHEM_BASE_URL") {
            self.pubchem_base_url = url;
        }
        if let Some(url) = lookup("CHEMGATE_EUTILS_BASE_URL") {
            self.eutils_base_url = url;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_CALLS_PER_SECOND")? {
            self.pubchem_limits.calls_per_second = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_CALLS_PER_MINUTE")? {
            self.pubchem_limits.calls_per_minute = Some(value);
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_ACTIVE_SECONDS_PER_MINUTE")? {
            self.pubchem_limits.active_seconds_per_minute = Some(value);
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_EUTILS_CALLS_PER_SECOND")? {
            self.eutils_limits.calls_per_second = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_POLL_INTERVAL_MS")? {
            self.poll.interval_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_JOB_TIMEOUT_MS")? {
            self.poll.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_POLL_JITTER")? {
            self.poll.jitter = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_EXPORT_ROW_CAP")? {
            self.export_row_cap = value;
        }
        if let Some(value) = parse_var(&lookup, "CHEMGATE_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = value;
        }
        if let Some(value) = lookup("CHEMGATE_PRIMARY_IDENTIFIER") {
            self.primary_identifier = PrimaryIdentifier::parse(&value)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.eutils_limits.validate()?;
        self.pubchem_limits.validate()?;
        if self.poll.interval_ms == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "poll.interval_ms",
            });
        }
        if self.poll.timeout_ms == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "poll.timeout_ms",
            });
        }
        if self.export_row_cap == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "export_row_cap",
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ValidationError::ZeroLimit {
                field: "request_timeout_ms",
            });
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>, GatewayError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| GatewayError::config(format!("{name} has invalid value '{raw}'"))),
    }
}
