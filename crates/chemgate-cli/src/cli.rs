//! CLI argument definitions for chemgate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `identify` | Resolve identifiers to compounds (all fields) |
//! | `convert` | Convert identifiers to one output type |
//! | `vendors` | Export vendor-deposited compounds as CSV |
//! | `cas` | Look up the CAS registry number of a compound |
//! | `vendor-links` | List vendor record URLs of a compound |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | JSON configuration file |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--verbose` | `false` | Debug-level logging on stderr |
//! | `--poll-interval-ms` | from config | Job poll interval |
//! | `--job-timeout-ms` | from config | Job wall-clock ceiling |
//!
//! # Examples
//!
//! ```bash
//! chemgate identify "CC(=O)OC1=CC=CC=C1C(=O)O" --pretty
//! chemgate convert 2244 702 --input-type cid --output-type inchi
//! chemgate vendors --vendor Sigma-Aldrich --limit 100 --dry-run
//! ```

use std::path::PathBuf;

use chemgate_core::{IdentifierKind, OutputField};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// chemgate - rate-limited client for PubChem identifier services
#[derive(Debug, Parser)]
#[command(
    name = "chemgate",
    author,
    version,
    about = "Rate-limited client for PubChem identifier services",
    long_about = "chemgate resolves chemical identifiers through PubChem's asynchronous \
identifier exchange, exports vendor compound lists through cached searches, and looks up \
per-compound annotations. Every request shares one NCBI-compliant rate budget.\n\
\n\
Use 'chemgate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// JSON configuration file; `CHEMGATE_*` variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log at debug level. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Delay between job status checks in milliseconds.
    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Give up on a job after this many milliseconds.
    #[arg(long, global = true)]
    pub job_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve identifiers to compounds with registry number, InChI, name and SMILES.
    Identify(IdentifyArgs),
    /// Convert identifiers to a single output type.
    Convert(ConvertArgs),
    /// Export compounds deposited by chemical vendors.
    Vendors(VendorsArgs),
    /// Look up the CAS registry number of a compound.
    Cas(CompoundArgs),
    /// List vendor record URLs of a compound.
    VendorLinks(CompoundArgs),
}

/// Input identifier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputType {
    Smiles,
    Cid,
    Inchi,
}

impl From<InputType> for IdentifierKind {
    fn from(value: InputType) -> Self {
        match value {
            InputType::Smiles => Self::Smiles,
            InputType::Cid => Self::Cid,
            InputType::Inchi => Self::Inchi,
        }
    }
}

/// Output identifier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputType {
    Cid,
    Inchi,
    Iupac,
    Smiles,
}

impl From<OutputType> for OutputField {
    fn from(value: OutputType) -> Self {
        match value {
            OutputType::Cid => Self::Cid,
            OutputType::Inchi => Self::Inchi,
            OutputType::Iupac => Self::Iupac,
            OutputType::Smiles => Self::Smiles,
        }
    }
}

#[derive(Debug, Args)]
pub struct IdentifyArgs {
    /// Identifiers, all of the same type.
    #[arg(required = true)]
    pub identifiers: Vec<String>,

    #[arg(long, value_enum, default_value_t = InputType::Smiles)]
    pub input_type: InputType,

    /// Use one exact-match lookup per identifier instead of batch jobs.
    #[arg(long, default_value_t = false)]
    pub fast: bool,
}

#[derive(Debug, Args)]
pub struct ConvertArgs {
    #[arg(required = true)]
    pub identifiers: Vec<String>,

    #[arg(long, value_enum, default_value_t = InputType::Smiles)]
    pub input_type: InputType,

    #[arg(long, value_enum, default_value_t = OutputType::Cid)]
    pub output_type: OutputType,
}

#[derive(Debug, Args)]
pub struct VendorsArgs {
    /// Vendor source name (repeatable). Defaults to the configured vendors.
    #[arg(long = "vendor")]
    pub vendors: Vec<String>,

    /// Maximum rows to export. Defaults to the search's estimated count.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Comma-separated export columns.
    #[arg(long, default_value = "cid,mw,isosmiles")]
    pub fields: String,

    /// CSV destination. Defaults to `PubchemVendorCompounds_<unix ms>.csv`.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Resolve the cache key and print the export URL without downloading.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct CompoundArgs {
    /// PubChem compound id.
    pub cid: u64,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "chemgate",
            "convert",
            "2244",
            "--input-type",
            "cid",
            "--output-type",
            "iupac",
            "--job-timeout-ms",
            "30000",
        ])
        .expect("valid arguments");

        assert_eq!(cli.job_timeout_ms, Some(30_000));
        match cli.command {
            Command::Convert(args) => {
                assert_eq!(IdentifierKind::from(args.input_type), IdentifierKind::Cid);
                assert_eq!(OutputField::from(args.output_type), OutputField::Iupac);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn identify_requires_identifiers() {
        assert!(Cli::try_parse_from(["chemgate", "identify"]).is_err());
    }
}
