//! Wire-level request construction and response reading.
//!
//! The gateway core never formats a payload or inspects a raw body itself.
//! It goes through [`RequestBuilder`] and [`ResponseParser`], which keeps the
//! vendor encoding (XML, JSON, query strings) in one place. Builders are pure:
//! the same logical request always yields the same [`HttpRequest`], so a
//! retried call sends identical bytes.

mod pubchem;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub use pubchem::PubChemProtocol;

use crate::http_client::HttpRequest;
use crate::identifier::{Identifier, IdentifierBatch, OutputField};
use crate::search::{CacheKey, ExportSpec, SearchQuery, SearchSession};

/// Server-issued handle of a submitted asynchronous job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteJobId(String);

impl RemoteJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteJobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a finished job's artifact can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultLocation(String);

impl ResultLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResultLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What one status check revealed about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPollReport {
    /// Still running, or the response did not say anything usable.
    Pending,
    Ready(ResultLocation),
    /// The server reported a terminal error for the job.
    Failed(String),
}

/// Annotation documents available per compound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Registry-number annotations (CAS heading).
    Cas,
    /// Depositor categories, including chemical vendors.
    Categories,
}

/// One hit of a single-identifier lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub cid: u64,
    pub smiles: Option<String>,
    pub inchi: Option<String>,
    pub iupac: Option<String>,
}

/// Builds transport-ready requests for every logical gateway operation.
pub trait RequestBuilder: Send + Sync {
    /// Full-text search that leaves a reusable session on the server.
    fn search(&self, query: &SearchQuery) -> HttpRequest;

    /// Converts a search session into an export cache key.
    fn cache_key_request(&self, session: &SearchSession) -> HttpRequest;

    /// Synchronous bulk export of a cached search.
    fn export(&self, key: &CacheKey, spec: &ExportSpec) -> HttpRequest;

    /// Submits an identifier-exchange job for one output field.
    fn exchange(&self, batch: &IdentifierBatch, output: OutputField) -> HttpRequest;

    /// Checks the status of a submitted job.
    fn status_request(&self, job_id: &RemoteJobId) -> HttpRequest;

    /// Retrieves a finished job's artifact.
    fn download(&self, location: &ResultLocation) -> HttpRequest;

    /// Exact-structure lookup of a single identifier.
    fn fast_identity(&self, identifier: &Identifier) -> HttpRequest;

    /// Annotation document for one compound.
    fn compound_view(&self, cid: u64, kind: ViewKind) -> HttpRequest;
}

/// Extracts the handles the core depends on from raw response bodies.
pub trait ResponseParser: Send + Sync {
    fn job_id(&self, body: &str) -> Option<RemoteJobId>;

    fn job_status(&self, body: &str) -> JobPollReport;

    fn search_session(&self, body: &str) -> Option<SearchSession>;

    fn cache_key(&self, body: &str) -> Option<CacheKey>;

    fn identity_matches(&self, body: &str) -> Result<Vec<IdentityMatch>, String>;

    /// Registry number found in a [`ViewKind::Cas`] document.
    fn cas_number(&self, body: &str) -> Option<String>;

    /// Record URLs per depositor in a [`ViewKind::Categories`] document,
    /// restricted to `vendors`.
    fn vendor_links(&self, body: &str, vendors: &[String]) -> BTreeMap<String, String>;
}

/// A complete protocol: request construction plus response reading.
pub trait Protocol: RequestBuilder + ResponseParser {}

impl<T: RequestBuilder + ResponseParser> Protocol for T {}
