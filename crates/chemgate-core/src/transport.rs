use std::sync::Arc;

use futures::StreamExt;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::http_client::{BodyChunks, HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::rate_budget::{AdmissionPermit, RateBudget, ServiceFamily};

/// Why a gated call produced no usable response.
#[derive(Debug)]
pub enum SendError {
    /// The rate budget could not admit the call in time.
    Admission(GatewayError),
    Transport(HttpError),
    /// The server answered with a status above 3xx.
    Status { status: u16, body: String },
}

impl SendError {
    /// Maps transport and status failures through `wrap`; admission errors
    /// keep their own type.
    pub fn into_gateway<F>(self, wrap: F) -> GatewayError
    where
        F: FnOnce(String) -> GatewayError,
    {
        match self {
            Self::Admission(error) => error,
            Self::Transport(error) => wrap(error.to_string()),
            Self::Status { status, body } => {
                wrap(format!("upstream returned status {status}: {}", snippet(&body)))
            }
        }
    }
}

/// HTTP transport that admits every request through the shared rate budget.
///
/// This is the only path to the network used by the gateway components.
#[derive(Clone)]
pub struct GatedTransport {
    http: Arc<dyn HttpClient>,
    budget: Arc<RateBudget>,
}

impl GatedTransport {
    pub fn new(http: Arc<dyn HttpClient>, budget: Arc<RateBudget>) -> Self {
        Self { http, budget }
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// Admits, executes, and checks the status of one request.
    ///
    /// The admission permit is held for the duration of the exchange so the
    /// call's active time is accounted.
    pub async fn send(
        &self,
        family: ServiceFamily,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> Result<HttpResponse, SendError> {
        let permit = self
            .budget
            .admit_until(family, deadline)
            .await
            .map_err(SendError::Admission)?;
        let result = self.http.execute(request).await;
        drop(permit);

        let response = result.map_err(SendError::Transport)?;
        if !response.is_success() {
            return Err(SendError::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response)
    }
}

/// Successful response body still being received.
///
/// Holds the admission permit until dropped, so a long download keeps
/// counting against the active-time cap.
pub struct GatedBody {
    status: u16,
    chunks: BodyChunks,
    _permit: AdmissionPermit,
}

impl GatedBody {
    pub const fn status(&self) -> u16 {
        self.status
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, HttpError>> {
        self.chunks.next().await
    }
}

impl GatedTransport {
    /// Admits and executes one request, returning its body unread.
    ///
    /// Error statuses are read in full and reported like [`GatedTransport::send`].
    pub async fn send_streaming(
        &self,
        family: ServiceFamily,
        request: HttpRequest,
        deadline: Option<Instant>,
    ) -> Result<GatedBody, SendError> {
        let permit = self
            .budget
            .admit_until(family, deadline)
            .await
            .map_err(SendError::Admission)?;
        let stream = self
            .http
            .execute_streaming(request)
            .await
            .map_err(SendError::Transport)?;

        if !stream.is_success() {
            let status = stream.status;
            let body = stream.into_text().await.map_err(SendError::Transport)?;
            return Err(SendError::Status { status, body });
        }
        Ok(GatedBody {
            status: stream.status,
            chunks: stream.chunks,
            _permit: permit,
        })
    }
}

/// First 200 characters of a body, for error messages.
pub(crate) fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((end, _)) => format!("{}...", &trimmed[..end]),
        None => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::ScriptedHttpClient;
    use crate::rate_budget::{ActiveTimeCap, LimiterSpec, WindowQuota};

    fn transport(http: ScriptedHttpClient) -> GatedTransport {
        let budget = RateBudget::new().with_limiter(
            ServiceFamily::PubChem,
            LimiterSpec::new(vec![WindowQuota::per_second(2)], None).expect("valid spec"),
        );
        GatedTransport::new(Arc::new(http), Arc::new(budget))
    }

    #[tokio::test(start_paused = true)]
    async fn every_send_consumes_rate_budget() {
        let transport = transport(
            ScriptedHttpClient::new().respond("example", HttpResponse::ok("fine")),
        );
        let start = Instant::now();

        for _ in 0..3 {
            transport
                .send(ServiceFamily::PubChem, HttpRequest::get("https://example.test"), None)
                .await
                .expect("ok");
        }

        assert_eq!(Instant::now() - start, std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn error_status_is_reported_with_body_snippet() {
        let transport = transport(
            ScriptedHttpClient::new().respond("example", HttpResponse::new(503, "busy")),
        );

        let error = transport
            .send(ServiceFamily::PubChem, HttpRequest::get("https://example.test"), None)
            .await
            .expect_err("503");
        let mapped = error.into_gateway(|message| GatewayError::Query { message });

        assert_eq!(
            mapped.to_string(),
            "search query failed: upstream returned status 503: busy"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_body_holds_its_permit_until_dropped() {
        let http = ScriptedHttpClient::new().respond("export", HttpResponse::ok("a,b\n1,2\n"));
        let budget = RateBudget::new().with_limiter(
            ServiceFamily::PubChem,
            LimiterSpec::new(
                vec![WindowQuota::per_second(10)],
                Some(ActiveTimeCap {
                    max_active: std::time::Duration::from_secs(1),
                    window: std::time::Duration::from_secs(10),
                    call_reserve: std::time::Duration::from_secs(1),
                }),
            )
            .expect("valid spec"),
        );
        let transport = GatedTransport::new(Arc::new(http), Arc::new(budget));

        let mut body = transport
            .send_streaming(ServiceFamily::PubChem, HttpRequest::get("https://example.test/export"), None)
            .await
            .expect("streaming");
        let blocked = transport
            .budget()
            .admit_until(ServiceFamily::PubChem, Some(Instant::now()))
            .await;
        assert!(matches!(blocked, Err(GatewayError::AdmissionTimeout { .. })));

        let mut received = Vec::new();
        while let Some(chunk) = body.next_chunk().await {
            received.extend(chunk.expect("chunk"));
        }
        assert_eq!(body.status(), 200);
        assert_eq!(received, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn streamed_error_status_reads_the_body_for_the_message() {
        let transport = transport(
            ScriptedHttpClient::new().respond("example", HttpResponse::new(404, "no such key")),
        );

        let error = transport
            .send_streaming(ServiceFamily::PubChem, HttpRequest::get("https://example.test"), None)
            .await
            .err()
            .expect("404");

        assert!(matches!(error, SendError::Status { status: 404, ref body } if body == "no such key"));
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let body = "x".repeat(500);
        assert_eq!(snippet(&body).len(), 203);
    }
}
