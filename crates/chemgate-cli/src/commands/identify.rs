use chemgate_core::{
    Compound, ExchangeReport, Gateway, GatewayError, Identifier, IdentifierBatch,
    IdentifierExchange, IdentifierKind,
};
use indexmap::IndexMap;
use serde::Serialize;

use crate::cli::IdentifyArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct IdentifyResponseData {
    compounds: IndexMap<String, Compound>,
    dropped: Vec<String>,
}

pub async fn run(args: &IdentifyArgs, gateway: &Gateway) -> Result<CommandResult, CliError> {
    let kind = IdentifierKind::from(args.input_type);
    let batch = IdentifierBatch::new(kind, &args.identifiers)?;
    let exchange = gateway.exchange();

    let (report, mut warnings) = if args.fast {
        identify_each(&exchange, &batch).await?
    } else {
        (exchange.identify(&batch).await?, Vec::new())
    };

    if !args.fast {
        warnings.extend(
            report
                .dropped
                .iter()
                .map(|input| format!("'{input}' has no registry number; dropped")),
        );
    }
    let data = serde_json::to_value(IdentifyResponseData {
        compounds: report.compounds,
        dropped: report.dropped,
    })?;
    Ok(CommandResult::ok(data).with_warnings(warnings))
}

/// One exact-match lookup per identifier; lookup misses become warnings.
async fn identify_each(
    exchange: &IdentifierExchange,
    batch: &IdentifierBatch,
) -> Result<(ExchangeReport, Vec<String>), CliError> {
    let mut report = ExchangeReport::default();
    let mut warnings = Vec::new();
    for value in batch.values() {
        let identifier = Identifier::new(batch.kind(), value)?;
        match exchange.identify_one(&identifier).await {
            Ok(compound) => {
                report.compounds.insert(value.clone(), compound);
            }
            Err(error @ GatewayError::Lookup { .. }) => {
                warnings.push(error.to_string());
                report.dropped.push(value.clone());
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok((report, warnings))
}
