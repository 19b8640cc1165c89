use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::CliError;

/// Metadata printed alongside every command result.
#[derive(Debug, Serialize)]
pub struct Meta {
    pub command: &'static str,
    pub generated_at: String,
    pub latency_ms: u64,
    pub warnings: Vec<String>,
}

/// Top-level JSON document written to stdout.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub meta: Meta,
    pub data: Value,
}

impl Envelope {
    pub fn new(command: &'static str, data: Value, warnings: Vec<String>, latency_ms: u64) -> Self {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            meta: Meta {
                command,
                generated_at,
                latency_ms,
                warnings,
            },
            data,
        }
    }
}

pub fn render(envelope: &Envelope, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(envelope)?
    } else {
        serde_json::to_string(envelope)?
    };
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_carries_command_and_warnings() {
        let envelope = Envelope::new(
            "identify",
            json!({"compounds": {}}),
            vec![String::from("'x' dropped")],
            12,
        );

        let value = serde_json::to_value(&envelope).expect("serializable");

        assert_eq!(value["meta"]["command"], "identify");
        assert_eq!(value["meta"]["warnings"][0], "'x' dropped");
        assert_eq!(value["meta"]["latency_ms"], 12);
        assert!(value["meta"]["generated_at"].as_str().is_some_and(|ts| ts.ends_with('Z')));
    }
}
