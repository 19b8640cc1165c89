use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::exchange::IdentifierExchange;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::job::JobEngine;
use crate::protocol::{Protocol, PubChemProtocol};
use crate::rate_budget::RateBudget;
use crate::search::SearchCachePipeline;
use crate::transport::GatedTransport;
use crate::view::CompoundView;

/// Wires one rate budget, one transport and one protocol into the gateway
/// components. Every component handed out shares the same budget.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    transport: GatedTransport,
    protocol: Arc<dyn Protocol>,
}

impl Gateway {
    /// Validates `config` and builds a gateway speaking the PubChem protocol.
    pub fn new(config: GatewayConfig, http: Arc<dyn HttpClient>) -> Result<Self, GatewayError> {
        let protocol = Arc::new(PubChemProtocol::new(&config));
        Self::with_protocol(config, http, protocol)
    }

    pub fn with_protocol(
        config: GatewayConfig,
        http: Arc<dyn HttpClient>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let budget = Arc::new(RateBudget::from_config(&config)?);
        Ok(Self {
            config: Arc::new(config),
            transport: GatedTransport::new(http, budget),
            protocol,
        })
    }

    /// Gateway over the production reqwest transport.
    pub fn reqwest(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::new(config, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        self.transport.budget()
    }

    pub fn transport(&self) -> &GatedTransport {
        &self.transport
    }

    pub fn job_engine(&self) -> JobEngine {
        JobEngine::new(
            self.transport.clone(),
            Arc::clone(&self.protocol),
            self.config.poll.schedule(),
        )
    }

    pub fn search(&self) -> SearchCachePipeline {
        SearchCachePipeline::new(
            self.transport.clone(),
            Arc::clone(&self.protocol),
            self.config.export_row_cap,
        )
    }

    pub fn exchange(&self) -> IdentifierExchange {
        IdentifierExchange::new(
            self.job_engine(),
            self.transport.clone(),
            Arc::clone(&self.protocol),
            self.config.primary_identifier,
        )
    }

    pub fn view(&self) -> CompoundView {
        CompoundView::new(
            self.transport.clone(),
            Arc::clone(&self.protocol),
            self.config.vendor_sources.clone(),
        )
    }
}
