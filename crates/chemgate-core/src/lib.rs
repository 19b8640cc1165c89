//! Core contracts for chemgate.
//!
//! This crate contains:
//! - A shared, explicitly passed rate budget for every outbound call
//! - The submit/poll/fetch job engine for asynchronous remote jobs
//! - The search → cache key → bulk export pipeline
//! - Batched identifier exchange and aggregation into compounds
//! - Wire encoding for the PubChem family of services
//!
//! ```text
//! caller ─▶ Gateway ─┬─▶ SearchCachePipeline ─┐
//!                    ├─▶ IdentifierExchange ──┼─▶ JobEngine ─┐
//!                    └─▶ CompoundView ────────┘              ▼
//!                                          GatedTransport (RateBudget) ─▶ HttpClient
//! ```

pub mod compound;
pub mod config;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod http_client;
pub mod identifier;
pub mod job;
pub mod protocol;
pub mod rate_budget;
pub mod retry;
pub mod search;
pub mod transport;
pub mod view;

pub use compound::{Compound, CompoundBuilder, CompoundKey, PrimaryIdentifier};
pub use config::{GatewayConfig, PollConfig, RateLimits};
pub use error::{GatewayError, ValidationError};
pub use exchange::{
    merge_field_mappings, parse_exchange_result, ExchangeMapping, ExchangeReport,
    IdentifierExchange, IdentifierRecord,
};
pub use gateway::Gateway;
pub use http_client::{
    BodyChunks, HttpBodyStream, HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient, ScriptedHttpClient,
};
pub use identifier::{parse_registry_number, Identifier, IdentifierBatch, IdentifierKind, OutputField};
pub use job::{Job, JobEngine, JobOutcome, JobStatus};
pub use protocol::{
    IdentityMatch, JobPollReport, Protocol, PubChemProtocol, RemoteJobId, RequestBuilder,
    ResponseParser, ResultLocation, ViewKind,
};
pub use rate_budget::{
    ActiveTimeCap, AdmissionPermit, Limiter, LimiterSpec, RateBudget, ServiceFamily, WindowQuota,
};
pub use retry::{Backoff, PollSchedule};
pub use search::{
    CacheKey, CsvExport, ExportOptions, ExportRun, ExportSpec, SearchCachePipeline, SearchQuery,
    SearchSession, DEFAULT_EXPORT_FIELDS,
};
pub use transport::{GatedBody, GatedTransport, SendError};
pub use view::CompoundView;
