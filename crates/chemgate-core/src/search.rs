//! Search → cache key → bulk export.
//!
//! ```text
//! SearchQuery ──search──▶ SearchSession ──resolve_cache_key──▶ CacheKey ──export──▶ CsvExport
//!                (eutils)                     (pubchem)                   (pubchem)
//! ```
//!
//! A [`SearchSession`] is moved into [`SearchCachePipeline::resolve_cache_key`]
//! and cannot be reused. Exports are synchronous and stream straight into a
//! caller sink; ordering is whatever the server returns for a
//! relevance-descending request.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, ValidationError};
use crate::protocol::Protocol;
use crate::rate_budget::ServiceFamily;
use crate::transport::{snippet, GatedTransport};

/// Fields exported when the caller names none.
pub const DEFAULT_EXPORT_FIELDS: [&str; 3] = ["cid", "mw", "isosmiles"];

/// Full-text query against the compound database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    term: String,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>) -> Result<Self, ValidationError> {
        let term = term.into();
        if term.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        Ok(Self { term })
    }

    /// Compounds deposited by any of `vendors`, or by any vendor at all when
    /// the list is empty.
    pub fn vendor_sources<S: AsRef<str>>(vendors: &[S]) -> Self {
        let mut term = String::from("\"has src vendor\"[Filter]");
        let sources: Vec<String> = vendors
            .iter()
            .map(|vendor| vendor.as_ref().trim())
            .filter(|vendor| !vendor.is_empty())
            .map(|vendor| format!("\"{vendor}\"[SourceName]"))
            .collect();
        if !sources.is_empty() {
            term.push_str(" AND (");
            term.push_str(&sources.join(" OR "));
            term.push(')');
        }
        Self { term }
    }

    pub fn term(&self) -> &str {
        &self.term
    }
}

/// Server-side result set of one search. Consumed by cache-key resolution.
#[derive(Debug, PartialEq, Eq)]
pub struct SearchSession {
    query_key: String,
    environment_token: String,
    estimated_count: u64,
}

impl SearchSession {
    pub fn new(
        query_key: impl Into<String>,
        environment_token: impl Into<String>,
        estimated_count: u64,
    ) -> Self {
        Self {
            query_key: query_key.into(),
            environment_token: environment_token.into(),
            estimated_count,
        }
    }

    pub fn query_key(&self) -> &str {
        &self.query_key
    }

    pub fn environment_token(&self) -> &str {
        &self.environment_token
    }

    pub const fn estimated_count(&self) -> u64 {
        self.estimated_count
    }
}

/// Opaque export handle issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row limit and column list of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSpec {
    row_limit: usize,
    fields: Vec<String>,
}

impl ExportSpec {
    pub fn new<I, S>(row_limit: usize, fields: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if row_limit == 0 {
            return Err(ValidationError::ZeroRowLimit);
        }
        let fields = fields
            .into_iter()
            .map(|field| {
                let field = field.as_ref().trim().to_ascii_lowercase();
                let valid = !field.is_empty()
                    && field
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
                if valid {
                    Ok(field)
                } else {
                    Err(ValidationError::InvalidExportField { value: field })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if fields.is_empty() {
            return Err(ValidationError::EmptyExportFields);
        }
        Ok(Self { row_limit, fields })
    }

    pub fn with_default_fields(row_limit: usize) -> Result<Self, ValidationError> {
        Self::new(row_limit, DEFAULT_EXPORT_FIELDS)
    }

    pub const fn row_limit(&self) -> usize {
        self.row_limit
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Comma-joined column list as sent on the wire.
    pub fn field_list(&self) -> String {
        self.fields.join(",")
    }
}

/// Summary of an export that streamed through to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    header: Vec<String>,
    rows: usize,
    bytes: u64,
}

impl CsvExport {
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Number of data rows, header excluded.
    pub const fn len(&self) -> usize {
        self.rows
    }

    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Bytes written to the sink.
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Line-by-line validation of an export as its chunks arrive.
///
/// The header must name the requested fields in order and every later row
/// must have as many cells. Quoted cells may contain commas and doubled
/// quotes but not line breaks.
#[derive(Debug)]
struct CsvStreamCheck<'a> {
    fields: &'a [String],
    header: Option<Vec<String>>,
    partial: Vec<u8>,
    rows: usize,
}

impl<'a> CsvStreamCheck<'a> {
    fn new(fields: &'a [String]) -> Self {
        Self {
            fields,
            header: None,
            partial: Vec::new(),
            rows: 0,
        }
    }

    /// Checks every line completed by `chunk` and hands those lines back.
    ///
    /// A trailing partial line is kept until a later chunk completes it.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>, GatewayError> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        complete
            .split(|byte| *byte == b'\n')
            .try_for_each(|line| self.check_line(line))?;
        Ok(complete)
    }

    /// Checks the line left over when the body does not end with a newline.
    ///
    /// Returns that line with the summary; `passed` counts the bytes already
    /// handed back by [`CsvStreamCheck::feed`].
    fn finish(mut self, passed: u64) -> Result<(Vec<u8>, CsvExport), GatewayError> {
        let rest = std::mem::take(&mut self.partial);
        self.check_line(&rest)?;
        let header = self
            .header
            .ok_or_else(|| export_error("export body is empty"))?;
        let export = CsvExport {
            header,
            rows: self.rows,
            bytes: passed + rest.len() as u64,
        };
        Ok((rest, export))
    }

    fn check_line(&mut self, line: &[u8]) -> Result<(), GatewayError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| export_error(format!("row {} is not valid UTF-8", self.rows + 1)))?;
        if line.trim().is_empty() {
            return Ok(());
        }
        let cells = split_csv_line(line);

        if let Some(header) = &self.header {
            if cells.len() != header.len() {
                return Err(export_error(format!(
                    "row {} has {} columns, expected {}",
                    self.rows + 1,
                    cells.len(),
                    header.len()
                )));
            }
            self.rows += 1;
            return Ok(());
        }

        let matches = cells.len() == self.fields.len()
            && cells
                .iter()
                .zip(self.fields)
                .all(|(column, field)| column.trim().eq_ignore_ascii_case(field));
        if !matches {
            return Err(export_error(format!(
                "header [{}] does not match requested fields [{}]",
                cells.join(","),
                self.fields.join(",")
            )));
        }
        self.header = Some(cells);
        Ok(())
    }
}

fn export_error(message: impl Into<String>) -> GatewayError {
    GatewayError::Export {
        message: message.into(),
    }
}

async fn write_chunk<W>(sink: &mut W, chunk: &[u8]) -> Result<(), GatewayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    sink.write_all(chunk)
        .await
        .map_err(|error| export_error(format!("writing export failed: {error}")))
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(ch),
        }
    }
    cells.push(cell);
    cells
}

/// Caller choices for [`SearchCachePipeline::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Defaults to the session's estimated count.
    pub row_limit: Option<usize>,
    pub fields: Vec<String>,
    /// Stop after cache-key resolution and report the export request.
    pub dry_run: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            row_limit: None,
            fields: DEFAULT_EXPORT_FIELDS.iter().map(|field| field.to_string()).collect(),
            dry_run: false,
        }
    }
}

/// Outcome of a full search-and-export run.
#[derive(Debug, Clone)]
pub struct ExportRun {
    pub estimated_count: u64,
    /// Rows requested after applying the row cap. Zero means nothing to export.
    pub row_limit: usize,
    pub cache_key: Option<CacheKey>,
    pub export_url: Option<String>,
    /// Absent on dry runs and empty result sets.
    pub export: Option<CsvExport>,
}

/// Turns searches into reusable cache keys and bulk exports.
#[derive(Clone)]
pub struct SearchCachePipeline {
    transport: GatedTransport,
    protocol: Arc<dyn Protocol>,
    row_cap: usize,
}

impl SearchCachePipeline {
    pub fn new(transport: GatedTransport, protocol: Arc<dyn Protocol>, row_cap: usize) -> Self {
        Self {
            transport,
            protocol,
            row_cap,
        }
    }

    pub const fn row_cap(&self) -> usize {
        self.row_cap
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchSession, GatewayError> {
        info!(term = query.term(), "submitting search");
        let response = self
            .transport
            .send(ServiceFamily::Eutils, self.protocol.search(query), None)
            .await
            .map_err(|error| error.into_gateway(|message| GatewayError::Query { message }))?;

        let session = self
            .protocol
            .search_session(&response.body)
            .ok_or_else(|| GatewayError::Query {
                message: format!(
                    "response lacks a query key and environment token: {}",
                    snippet(&response.body)
                ),
            })?;
        debug!(
            query_key = session.query_key(),
            estimated_count = session.estimated_count(),
            "search session created"
        );
        Ok(session)
    }

    pub async fn resolve_cache_key(&self, session: SearchSession) -> Result<CacheKey, GatewayError> {
        let response = self
            .transport
            .send(ServiceFamily::PubChem, self.protocol.cache_key_request(&session), None)
            .await
            .map_err(|error| {
                error.into_gateway(|message| GatewayError::CacheResolution { message })
            })?;

        let key = self
            .protocol
            .cache_key(&response.body)
            .ok_or_else(|| GatewayError::CacheResolution {
                message: format!("no cache key in response: {}", snippet(&response.body)),
            })?;
        debug!(cache_key = key.as_str(), "cache key resolved");
        Ok(key)
    }

    /// URL of the export request, without sending it.
    pub fn export_url(&self, key: &CacheKey, spec: &ExportSpec) -> String {
        self.protocol.export(key, spec).url
    }

    /// Streams the export into `sink`, checking it line by line.
    ///
    /// Only complete, checked lines reach the sink, so nothing is written
    /// unless the header matches `spec`. A row that fails its check aborts
    /// the export with the rows before it already written.
    pub async fn export<W>(
        &self,
        key: &CacheKey,
        spec: &ExportSpec,
        sink: &mut W,
    ) -> Result<CsvExport, GatewayError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if spec.row_limit() > self.row_cap {
            return Err(export_error(format!(
                "row limit {} exceeds the configured cap of {}",
                spec.row_limit(),
                self.row_cap
            )));
        }
        info!(
            cache_key = key.as_str(),
            row_limit = spec.row_limit(),
            fields = %spec.field_list(),
            "requesting bulk export"
        );
        let mut body = self
            .transport
            .send_streaming(ServiceFamily::PubChem, self.protocol.export(key, spec), None)
            .await
            .map_err(|error| error.into_gateway(|message| GatewayError::Export { message }))?;

        let mut check = CsvStreamCheck::new(spec.fields());
        let mut passed = 0u64;
        while let Some(chunk) = body.next_chunk().await {
            let chunk = chunk.map_err(|error| export_error(error.to_string()))?;
            let lines = check.feed(&chunk)?;
            if !lines.is_empty() {
                write_chunk(sink, &lines).await?;
                passed += lines.len() as u64;
            }
        }
        drop(body);

        let (rest, export) = check.finish(passed)?;
        if !rest.is_empty() {
            write_chunk(sink, &rest).await?;
        }
        sink.flush()
            .await
            .map_err(|error| export_error(format!("writing export failed: {error}")))?;
        info!(rows = export.len(), bytes = export.bytes(), "bulk export streamed");
        Ok(export)
    }

    /// Search, resolve, and export into `sink` in one call.
    ///
    /// The effective row limit is the requested limit (or the estimated count)
    /// capped by the pipeline's row cap. The sink is left untouched on dry runs
    /// and when the search matched nothing.
    pub async fn run<W>(
        &self,
        query: &SearchQuery,
        options: &ExportOptions,
        sink: &mut W,
    ) -> Result<ExportRun, GatewayError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if options.row_limit == Some(0) {
            return Err(ValidationError::ZeroRowLimit.into());
        }
        let session = self.search(query).await?;
        let estimated_count = session.estimated_count();
        let wanted = options
            .row_limit
            .unwrap_or_else(|| usize::try_from(estimated_count).unwrap_or(usize::MAX));
        let row_limit = wanted.min(self.row_cap);

        if row_limit == 0 {
            warn!(term = query.term(), "search matched nothing; skipping export");
            return Ok(ExportRun {
                estimated_count,
                row_limit,
                cache_key: None,
                export_url: None,
                export: None,
            });
        }
        if wanted > self.row_cap {
            warn!(
                requested = wanted,
                cap = self.row_cap,
                "row limit exceeds cap; export truncated"
            );
        }

        let spec = ExportSpec::new(row_limit, &options.fields)?;
        let key = self.resolve_cache_key(session).await?;
        let export_url = self.export_url(&key, &spec);

        let export = if options.dry_run {
            info!(url = %export_url, "dry run; export not requested");
            None
        } else {
            Some(self.export(&key, &spec, sink).await?)
        };

        Ok(ExportRun {
            estimated_count,
            row_limit,
            cache_key: Some(key),
            export_url: Some(export_url),
            export,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        DEFAULT_EXPORT_FIELDS.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn vendor_query_names_each_source() {
        let query = SearchQuery::vendor_sources(&["Sigma-Aldrich", "Thermo Fisher Scientific"]);
        assert_eq!(
            query.term(),
            "\"has src vendor\"[Filter] AND (\"Sigma-Aldrich\"[SourceName] OR \"Thermo Fisher Scientific\"[SourceName])"
        );

        let any: [&str; 0] = [];
        assert_eq!(SearchQuery::vendor_sources(&any).term(), "\"has src vendor\"[Filter]");
    }

    #[test]
    fn blank_query_is_rejected() {
        assert_eq!(SearchQuery::new("  "), Err(ValidationError::EmptyQuery));
    }

    #[test]
    fn export_spec_validates_limit_and_fields() {
        assert_eq!(
            ExportSpec::new(0, ["cid"]),
            Err(ValidationError::ZeroRowLimit)
        );
        let none: [&str; 0] = [];
        assert_eq!(ExportSpec::new(5, none), Err(ValidationError::EmptyExportFields));
        assert_eq!(
            ExportSpec::new(5, ["cid", "mw;drop"]),
            Err(ValidationError::InvalidExportField {
                value: String::from("mw;drop")
            })
        );

        let spec = ExportSpec::new(5, ["CID", " mw "]).expect("valid");
        assert_eq!(spec.field_list(), "cid,mw");
    }

    fn check_chunks(chunks: &[&str]) -> Result<CsvExport, GatewayError> {
        let fields = fields();
        let mut check = CsvStreamCheck::new(&fields);
        let mut passed = Vec::new();
        for chunk in chunks {
            passed.extend(check.feed(chunk.as_bytes())?);
        }
        let (rest, export) = check.finish(passed.len() as u64)?;
        passed.extend(rest);
        assert_eq!(passed, chunks.concat().into_bytes());
        Ok(export)
    }

    #[test]
    fn csv_check_handles_lines_split_across_chunks() {
        let export = check_chunks(&[
            "\"cid\",\"mw\",\"isos",
            "miles\"\n2244,180.16,\"CC(=O)OC1=CC=CC=C1C(=O)O\"\n702,46.07,",
            "\"C(C)O, \"\"x\"\"\"",
        ])
        .expect("valid export");

        assert_eq!(export.header(), fields().as_slice());
        assert_eq!(export.len(), 2);
        assert_eq!(export.bytes(), 86);
    }

    #[test]
    fn csv_check_rejects_unexpected_header() {
        let error = check_chunks(&["cid,mw\n1,2\n"]).expect_err("missing column");
        assert!(matches!(error, GatewayError::Export { .. }));

        let error = check_chunks(&["", "\n"]).expect_err("empty body");
        assert!(error.to_string().contains("empty"));
    }

    #[test]
    fn csv_check_holds_back_partial_lines() {
        let fields = fields();
        let mut check = CsvStreamCheck::new(&fields);

        assert!(check.feed(b"cid,mw,").expect("partial header").is_empty());
        assert_eq!(
            check.feed(b"isosmiles\n1,2").expect("header"),
            b"cid,mw,isosmiles\n".to_vec()
        );
        assert_eq!(check.feed(b",C\n").expect("row"), b"1,2,C\n".to_vec());
    }

    #[test]
    fn csv_check_rejects_ragged_rows() {
        let error = check_chunks(&["cid,mw,isosmiles\n1,2\n"]).expect_err("ragged");
        assert!(error.to_string().contains("row 1 has 2 columns"));
    }

    #[test]
    fn split_csv_line_unquotes_cells() {
        assert_eq!(
            split_csv_line("702,\"C(C)O, \"\"x\"\"\"\r"),
            vec!["702", "C(C)O, \"x\""]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_written_when_the_header_does_not_match() {
        let http = crate::http_client::ScriptedHttpClient::new()
            .with_chunk_bytes(3)
            .respond("sdqagent.cgi", crate::http_client::HttpResponse::ok("cid,inchikey\n2244,X\n"));
        let budget = crate::rate_budget::RateBudget::new().with_limiter(
            ServiceFamily::PubChem,
            crate::rate_budget::LimiterSpec::new(
                vec![crate::rate_budget::WindowQuota::per_second(5)],
                None,
            )
            .expect("valid spec"),
        );
        let pipeline = SearchCachePipeline::new(
            GatedTransport::new(Arc::new(http), Arc::new(budget)),
            Arc::new(crate::protocol::PubChemProtocol::default()),
            100,
        );
        let spec = ExportSpec::new(10, DEFAULT_EXPORT_FIELDS).expect("valid spec");
        let mut sink = Vec::new();

        let error = pipeline
            .export(&CacheKey::new("key"), &spec, &mut sink)
            .await
            .expect_err("header mismatch");

        assert_eq!(error.code(), "gateway.export");
        assert!(sink.is_empty());
    }
}
