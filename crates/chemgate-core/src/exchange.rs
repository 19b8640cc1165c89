//! Batched identifier exchange and per-compound aggregation.
//!
//! Every output field is its own remote job over the same input batch. Job
//! artifacts are line oriented:
//!
//! | Tokens per line | Meaning |
//! |-----------------|---------|
//! | 1 | input only; the value itself when input and output kinds coincide, otherwise no result |
//! | 2 | `<input> <output>` |
//! | 3+ | protocol violation, [`GatewayError::MalformedResult`] |
//!
//! Per-field mappings are merged by input identifier into
//! [`IdentifierRecord`]s, and records carrying a registry number are promoted
//! to [`Compound`]s. Records without one are dropped and reported.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::try_join_all;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compound::{Compound, PrimaryIdentifier};
use crate::error::GatewayError;
use crate::identifier::{parse_registry_number, Identifier, IdentifierBatch, IdentifierKind, OutputField};
use crate::job::{JobEngine, JobOutcome};
use crate::protocol::Protocol;
use crate::rate_budget::ServiceFamily;
use crate::transport::GatedTransport;

/// Input identifier → output value (`None` when the service had no result).
pub type ExchangeMapping = IndexMap<String, Option<String>>;

/// Parses one exchange artifact. The first line for a repeated input wins.
pub fn parse_exchange_result(
    body: &str,
    input: IdentifierKind,
    output: OutputField,
) -> Result<ExchangeMapping, GatewayError> {
    let identity = output.kind() == Some(input);
    let mut mapping = ExchangeMapping::new();

    for (index, line) in body.lines().enumerate() {
        let line_number = index + 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (key, value) = match tokens.as_slice() {
            [] => continue,
            [only] => (*only, identity.then_some(*only)),
            [key, value] => (*key, Some(*value)),
            _ => {
                return Err(GatewayError::MalformedResult {
                    line_number,
                    reason: format!("expected at most 2 tokens, found {}", tokens.len()),
                })
            }
        };

        let key = match input {
            IdentifierKind::Cid => canonical_registry_number(key, line_number)?,
            IdentifierKind::Smiles | IdentifierKind::Inchi => key.to_owned(),
        };
        let value = match (output, value) {
            (OutputField::Cid, Some(value)) => Some(canonical_registry_number(value, line_number)?),
            (_, value) => value.map(str::to_owned),
        };

        if mapping.contains_key(&key) {
            debug!(input = %key, line_number, "repeated input line ignored");
            continue;
        }
        mapping.insert(key, value);
    }
    Ok(mapping)
}

fn canonical_registry_number(token: &str, line_number: usize) -> Result<String, GatewayError> {
    parse_registry_number(token)
        .map(|cid| cid.to_string())
        .map_err(|_| GatewayError::MalformedResult {
            line_number,
            reason: format!("'{token}' is not a registry number"),
        })
}

/// All values collected for one input identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierRecord {
    input: String,
    fields: BTreeMap<OutputField, Option<String>>,
}

impl IdentifierRecord {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Value of `field`, or `None` when absent or reported as no result.
    pub fn get(&self, field: OutputField) -> Option<&str> {
        self.fields.get(&field).and_then(|value| value.as_deref())
    }

    /// Whether any job reported on `field` for this input.
    pub fn has_field(&self, field: OutputField) -> bool {
        self.fields.contains_key(&field)
    }

    fn set(&mut self, field: OutputField, value: Option<String>) {
        self.fields.entry(field).or_insert(value);
    }

    /// Promotes the record when it carries a registry number and the
    /// configured primary identifier.
    pub fn to_compound(&self, primary: PrimaryIdentifier) -> Option<Compound> {
        let cid = parse_registry_number(self.get(OutputField::Cid)?).ok()?;
        let mut builder = Compound::builder(cid);
        if let Some(smiles) = self.get(OutputField::Smiles) {
            builder = builder.smiles(smiles);
        }
        if let Some(inchi) = self.get(OutputField::Inchi) {
            builder = builder.inchi(inchi);
        }
        if let Some(iupac) = self.get(OutputField::Iupac) {
            builder = builder.iupac(iupac);
        }
        builder.build(primary).ok()
    }
}

/// Merges per-field mappings by input identifier.
///
/// Records follow first-seen input order across the mappings.
pub fn merge_field_mappings<I>(mappings: I) -> IndexMap<String, IdentifierRecord>
where
    I: IntoIterator<Item = (OutputField, ExchangeMapping)>,
{
    let mut records = IndexMap::new();
    merge_into(&mut records, mappings);
    records
}

fn merge_into<I>(records: &mut IndexMap<String, IdentifierRecord>, mappings: I)
where
    I: IntoIterator<Item = (OutputField, ExchangeMapping)>,
{
    for (field, mapping) in mappings {
        for (input, value) in mapping {
            records
                .entry(input.clone())
                .or_insert_with(|| IdentifierRecord::new(input))
                .set(field, value);
        }
    }
}

/// Result of a multi-field exchange.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeReport {
    /// Input identifier → resolved compound, in input order.
    pub compounds: IndexMap<String, Compound>,
    /// Inputs with no registry number or primary identifier.
    pub dropped: Vec<String>,
}

impl ExchangeReport {
    /// Promotes every record; unpromotable ones are logged and listed in
    /// `dropped`.
    pub fn from_records<I>(records: I, primary: PrimaryIdentifier) -> Self
    where
        I: IntoIterator<Item = IdentifierRecord>,
    {
        let mut report = Self::default();
        for record in records {
            match record.to_compound(primary) {
                Some(compound) => {
                    report.compounds.insert(record.input, compound);
                }
                None => {
                    warn!(
                        input = record.input(),
                        cid = ?record.get(OutputField::Cid),
                        primary = primary.as_str(),
                        "record has no usable primary identifier; dropped"
                    );
                    report.dropped.push(record.input);
                }
            }
        }
        report
    }

    /// Resolved compounds with duplicates collapsed, in primary-key order.
    pub fn distinct_compounds(&self) -> BTreeSet<&Compound> {
        self.compounds.values().collect()
    }
}

/// Resolves identifier batches through exchange jobs and single lookups.
#[derive(Clone)]
pub struct IdentifierExchange {
    engine: JobEngine,
    transport: GatedTransport,
    protocol: Arc<dyn Protocol>,
    primary: PrimaryIdentifier,
}

impl IdentifierExchange {
    pub fn new(
        engine: JobEngine,
        transport: GatedTransport,
        protocol: Arc<dyn Protocol>,
        primary: PrimaryIdentifier,
    ) -> Self {
        Self {
            engine,
            transport,
            protocol,
            primary,
        }
    }

    /// One exchange job from `batch` to `output`.
    pub async fn convert(
        &self,
        batch: &IdentifierBatch,
        output: OutputField,
    ) -> Result<JobOutcome<ExchangeMapping>, GatewayError> {
        info!(
            input = batch.kind().as_str(),
            output = output.as_str(),
            identifiers = batch.len(),
            "starting identifier exchange"
        );
        let outcome = self.engine.run(self.protocol.exchange(batch, output)).await?;
        outcome.try_map(|body| parse_exchange_result(&body, batch.kind(), output))
    }

    /// Resolves every output field and merges the results.
    pub async fn identify(&self, batch: &IdentifierBatch) -> Result<ExchangeReport, GatewayError> {
        self.identify_fields(batch, &OutputField::ALL).await
    }

    /// Resolves `fields` (the registry number is always added) with one
    /// concurrent job per field. Any failed or timed out job fails the call.
    pub async fn identify_fields(
        &self,
        batch: &IdentifierBatch,
        fields: &[OutputField],
    ) -> Result<ExchangeReport, GatewayError> {
        let mut wanted = vec![OutputField::Cid];
        for field in fields {
            if !wanted.contains(field) {
                wanted.push(*field);
            }
        }

        let mappings = try_join_all(wanted.iter().map(|&field| async move {
            let mapping = self.convert(batch, field).await?.into_result()?;
            Ok::<_, GatewayError>((field, mapping))
        }))
        .await?;

        // Seeded with the batch so inputs missing from every artifact are reported.
        let mut records: IndexMap<String, IdentifierRecord> = batch
            .values()
            .iter()
            .map(|input| (input.clone(), IdentifierRecord::new(input.clone())))
            .collect();
        merge_into(&mut records, mappings);

        let report = ExchangeReport::from_records(records.into_values(), self.primary);
        info!(
            resolved = report.compounds.len(),
            dropped = report.dropped.len(),
            "identifier exchange finished"
        );
        Ok(report)
    }

    /// Exact-structure lookup of one identifier. Not meant for bulk use.
    pub async fn identify_one(&self, identifier: &Identifier) -> Result<Compound, GatewayError> {
        let lookup_error = |message: String| GatewayError::Lookup {
            identifier: identifier.to_string(),
            message,
        };
        let response = self
            .transport
            .send(ServiceFamily::PubChem, self.protocol.fast_identity(identifier), None)
            .await
            .map_err(|error| error.into_gateway(lookup_error))?;

        let mut matches = self
            .protocol
            .identity_matches(&response.body)
            .map_err(lookup_error)?;
        if matches.len() > 1 {
            warn!(
                identifier = %identifier,
                matches = matches.len(),
                "multiple compounds matched; using the first"
            );
        }
        if matches.is_empty() {
            return Err(lookup_error(String::from("no compound matched")));
        }
        let hit = matches.swap_remove(0);

        let mut builder = Compound::builder(hit.cid);
        if let Some(smiles) = hit.smiles {
            builder = builder.smiles(smiles);
        }
        if let Some(inchi) = hit.inchi {
            builder = builder.inchi(inchi);
        }
        if let Some(iupac) = hit.iupac {
            builder = builder.iupac(iupac);
        }
        Ok(builder.build(self.primary)?)
    }
}
