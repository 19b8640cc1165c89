use std::collections::BTreeMap;

use chemgate_core::Gateway;
use serde::Serialize;

use crate::cli::CompoundArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct CasResponseData {
    cid: u64,
    cas_number: Option<String>,
}

#[derive(Debug, Serialize)]
struct VendorLinksResponseData {
    cid: u64,
    links: BTreeMap<String, String>,
}

pub async fn cas(args: &CompoundArgs, gateway: &Gateway) -> Result<CommandResult, CliError> {
    let cas_number = gateway.view().cas_number(args.cid).await?;
    let missing = cas_number.is_none();

    let mut result = CommandResult::ok(serde_json::to_value(CasResponseData {
        cid: args.cid,
        cas_number,
    })?);
    if missing {
        result = result.with_warning(format!("no CAS registry number found for cid {}", args.cid));
    }
    Ok(result)
}

pub async fn vendor_links(args: &CompoundArgs, gateway: &Gateway) -> Result<CommandResult, CliError> {
    let links = gateway.view().vendor_links(args.cid).await?;
    let data = serde_json::to_value(VendorLinksResponseData {
        cid: args.cid,
        links,
    })?;
    Ok(CommandResult::ok(data))
}
