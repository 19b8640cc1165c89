use chemgate_core::{Gateway, IdentifierBatch, IdentifierKind, JobOutcome, OutputField};

use crate::cli::ConvertArgs;
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &ConvertArgs, gateway: &Gateway) -> Result<CommandResult, CliError> {
    let batch = IdentifierBatch::new(IdentifierKind::from(args.input_type), &args.identifiers)?;
    let output = OutputField::from(args.output_type);

    let outcome = gateway.exchange().convert(&batch, output).await?;

    let warning = match &outcome {
        JobOutcome::Ready(mapping) => {
            let unresolved = mapping.values().filter(|value| value.is_none()).count();
            (unresolved > 0).then(|| format!("{unresolved} identifier(s) have no {output}"))
        }
        JobOutcome::Failed { job_id, reason } => Some(format!("job {job_id} failed: {reason}")),
        JobOutcome::TimedOut {
            job_id,
            poll_attempts,
            ..
        } => Some(format!(
            "job {job_id} did not finish after {poll_attempts} status checks; it may still complete on the server"
        )),
    };

    let mut result = CommandResult::ok(serde_json::to_value(&outcome)?);
    if let Some(warning) = warning {
        result = result.with_warning(warning);
    }
    Ok(result)
}
