use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::GatewayError;
use crate::protocol::{Protocol, ViewKind};
use crate::rate_budget::ServiceFamily;
use crate::transport::{GatedTransport, SendError};

/// Per-compound annotation lookups.
///
/// An error status from the server means "no data". Transport failures and
/// rate-budget errors are returned to the caller.
#[derive(Clone)]
pub struct CompoundView {
    transport: GatedTransport,
    protocol: Arc<dyn Protocol>,
    vendor_sources: Vec<String>,
}

impl CompoundView {
    pub fn new(
        transport: GatedTransport,
        protocol: Arc<dyn Protocol>,
        vendor_sources: Vec<String>,
    ) -> Self {
        Self {
            transport,
            protocol,
            vendor_sources,
        }
    }

    pub fn vendor_sources(&self) -> &[String] {
        &self.vendor_sources
    }

    async fn document(&self, cid: u64, kind: ViewKind) -> Result<Option<String>, GatewayError> {
        let request = self.protocol.compound_view(cid, kind);
        match self.transport.send(ServiceFamily::PubChem, request, None).await {
            Ok(response) => Ok(Some(response.body)),
            Err(SendError::Status { status, .. }) => {
                debug!(cid, ?kind, status, "no annotation document");
                Ok(None)
            }
            Err(SendError::Transport(error)) => Err(GatewayError::Transport(error)),
            Err(SendError::Admission(error)) => Err(error),
        }
    }

    /// Registry number linked from the compound's CAS annotations.
    pub async fn cas_number(&self, cid: u64) -> Result<Option<String>, GatewayError> {
        let Some(body) = self.document(cid, ViewKind::Cas).await? else {
            return Ok(None);
        };
        Ok(self.protocol.cas_number(&body))
    }

    /// Record URLs of the configured vendors that list the compound.
    pub async fn vendor_links(&self, cid: u64) -> Result<BTreeMap<String, String>, GatewayError> {
        let Some(body) = self.document(cid, ViewKind::Categories).await? else {
            return Ok(BTreeMap::new());
        };
        Ok(self.protocol.vendor_links(&body, &self.vendor_sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpError, HttpResponse, ScriptedHttpClient};
    use crate::protocol::PubChemProtocol;
    use crate::rate_budget::RateBudget;
    use crate::GatewayConfig;

    fn view(http: ScriptedHttpClient) -> CompoundView {
        let config = GatewayConfig::default();
        let budget = RateBudget::from_config(&config).expect("valid limits");
        CompoundView::new(
            GatedTransport::new(Arc::new(http), Arc::new(budget)),
            Arc::new(PubChemProtocol::new(&config)),
            config.vendor_sources,
        )
    }

    #[tokio::test]
    async fn missing_document_means_no_cas_number() {
        let view = view(
            ScriptedHttpClient::new().respond("heading=CAS", HttpResponse::new(404, "{}")),
        );

        assert_eq!(view.cas_number(1).await.expect("no error"), None);
    }

    #[tokio::test]
    async fn cas_number_is_read_from_annotations() {
        let view = view(ScriptedHttpClient::new().respond(
            "/compound/2244/JSON?heading=CAS",
            HttpResponse::ok(
                r#"{"Record":{"Reference":[{"URL":"https://commonchemistry.cas.org/detail?cas_rn=50-78-2"}]}}"#,
            ),
        ));

        assert_eq!(
            view.cas_number(2244).await.expect("lookup"),
            Some(String::from("50-78-2"))
        );
    }

    #[tokio::test]
    async fn transport_failure_is_not_swallowed() {
        let view = view(
            ScriptedHttpClient::new().fail("categories", HttpError::new("connection reset")),
        );

        let error = view.vendor_links(2244).await.expect_err("transport error");

        assert_eq!(error.code(), "gateway.transport");
    }
}
