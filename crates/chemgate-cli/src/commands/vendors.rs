use std::path::{Path, PathBuf};

use chemgate_core::{ExportOptions, Gateway, SearchQuery};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cli::VendorsArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct VendorsResponseData {
    term: String,
    estimated_count: u64,
    row_limit: usize,
    cache_key: Option<String>,
    export_url: Option<String>,
    output: Option<PathBuf>,
    rows: Option<usize>,
}

pub async fn run(args: &VendorsArgs, gateway: &Gateway) -> Result<CommandResult, CliError> {
    let vendors = if args.vendors.is_empty() {
        gateway.config().vendor_sources.clone()
    } else {
        args.vendors.clone()
    };
    let query = SearchQuery::vendor_sources(&vendors);
    let options = ExportOptions {
        row_limit: args.limit,
        fields: parse_fields(&args.fields),
        dry_run: args.dry_run,
    };

    let path = args.output.clone().unwrap_or_else(default_output_path);
    let run = if args.dry_run {
        gateway
            .search()
            .run(&query, &options, &mut tokio::io::sink())
            .await?
    } else {
        let partial = partial_path(&path);
        let mut file = create_export_file(&partial).await?;
        let result = gateway.search().run(&query, &options, &mut file).await;
        drop(file);
        match result {
            Ok(run) if run.export.is_some() => {
                tokio::fs::rename(&partial, &path).await?;
                run
            }
            Ok(run) => {
                tokio::fs::remove_file(&partial).await?;
                run
            }
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), %cleanup, "could not remove partial export");
                }
                return Err(error.into());
            }
        }
    };

    let mut warnings = Vec::new();
    if run.row_limit == 0 {
        warnings.push(String::from("search matched no compounds; nothing exported"));
    } else if (run.row_limit as u64) < run.estimated_count {
        warnings.push(format!(
            "export limited to {} of {} matching compounds",
            run.row_limit, run.estimated_count
        ));
    }

    let mut output = None;
    let mut rows = None;
    if let Some(export) = &run.export {
        info!(path = %path.display(), rows = export.len(), bytes = export.bytes(), "export written");
        rows = Some(export.len());
        output = Some(path);
    }

    let data = VendorsResponseData {
        term: query.term().to_owned(),
        estimated_count: run.estimated_count,
        row_limit: run.row_limit,
        cache_key: run.cache_key.map(|key| key.as_str().to_owned()),
        export_url: run.export_url,
        output,
        rows,
    };
    Ok(CommandResult::ok(serde_json::to_value(data)?).with_warnings(warnings))
}

fn parse_fields(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_owned)
        .collect()
}

fn default_output_path() -> PathBuf {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    PathBuf::from(format!("PubchemVendorCompounds_{millis}.csv"))
}

/// `path` with `.part` appended; the export is renamed into place once complete.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn create_export_file(path: &Path) -> Result<tokio::fs::File, CliError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::File::create(path).await?)
}
