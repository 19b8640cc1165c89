use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};

/// Minimal HTTP method set needed by the gateway protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// HTTP request envelope used by gateway transport calls.
///
/// Requests are plain values so that a retried call sends identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: 30_000,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches a `application/x-www-form-urlencoded` body.
    pub fn with_form(self, pairs: &[(&str, &str)]) -> Self {
        let body = pairs
            .iter()
            .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        self.with_header("content-type", "application/x-www-form-urlencoded")
            .with_body(body)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    /// 2xx and 3xx responses are successes; anything above is a transport error.
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 400
    }
}

/// Response body delivered in chunks as it arrives.
pub type BodyChunks = BoxStream<'static, Result<Vec<u8>, HttpError>>;

/// Status line plus a body that has not been read yet.
pub struct HttpBodyStream {
    pub status: u16,
    pub chunks: BodyChunks,
}

impl HttpBodyStream {
    /// Serves an already buffered body in chunks of at most `chunk_bytes`.
    pub fn buffered(status: u16, body: impl Into<String>, chunk_bytes: usize) -> Self {
        let chunks: Vec<Result<Vec<u8>, HttpError>> = body
            .into()
            .into_bytes()
            .chunks(chunk_bytes.max(1))
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Self {
            status,
            chunks: stream::iter(chunks).boxed(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 400
    }

    /// Reads the rest of the body, replacing invalid UTF-8.
    pub async fn into_text(mut self) -> Result<String, HttpError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunks.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl std::fmt::Debug for HttpBodyStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBodyStream")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    message: String,
    retryable: bool,
}

impl HttpError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Transport contract shared by every gateway component.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

    /// Like [`HttpClient::execute`] but hands the body over unread.
    ///
    /// The default buffers the whole body and serves it as one chunk.
    fn execute_streaming<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpBodyStream, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.execute(request).await?;
            Ok(HttpBodyStream::buffered(response.status, response.body, usize::MAX))
        })
    }
}

/// Production HTTP client using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("chemgate/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<reqwest::Response, HttpError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = builder.timeout(std::time::Duration::from_millis(request.timeout_ms));

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::new(format!("request timeout: {e}"))
            } else if e.is_connect() {
                HttpError::new(format!("connection failed: {e}"))
            } else if e.is_builder() {
                HttpError::non_retryable(format!("invalid request: {e}"))
            } else {
                HttpError::new(format!("request failed: {e}"))
            }
        })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.send(request).await?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| HttpError::new(format!("failed to read response body: {e}")))?;

            Ok(HttpResponse { status, body })
        })
    }

    fn execute_streaming<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpBodyStream, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.send(request).await?;
            let status = response.status().as_u16();
            let chunks = response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| HttpError::new(format!("failed to read response body: {e}")))
                })
                .boxed();

            Ok(HttpBodyStream { status, chunks })
        })
    }
}

#[derive(Debug)]
struct ScriptedRoute {
    fragment: String,
    replies: VecDeque<Result<HttpResponse, HttpError>>,
}

/// Deterministic offline transport for tests and dry runs.
///
/// A request is matched against routes in registration order; a route matches
/// when its fragment occurs in the request URL or body. Each route answers
/// from its queue and keeps repeating its last reply once the queue is down
/// to one entry. Every executed request is recorded. Streamed bodies arrive
/// in small chunks so that readers see lines split across chunk boundaries.
#[derive(Debug)]
pub struct ScriptedHttpClient {
    routes: Mutex<Vec<ScriptedRoute>>,
    requests: Mutex<Vec<HttpRequest>>,
    chunk_bytes: usize,
}

impl Default for ScriptedHttpClient {
    fn default() -> Self {
        Self {
            routes: Mutex::default(),
            requests: Mutex::default(),
            chunk_bytes: 16,
        }
    }
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the chunks streamed bodies are cut into.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    pub fn respond(self, fragment: impl Into<String>, response: HttpResponse) -> Self {
        self.push_reply(fragment.into(), Ok(response));
        self
    }

    pub fn fail(self, fragment: impl Into<String>, error: HttpError) -> Self {
        self.push_reply(fragment.into(), Err(error));
        self
    }

    fn push_reply(&self, fragment: String, reply: Result<HttpResponse, HttpError>) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.iter_mut().find(|route| route.fragment == fragment) {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(ScriptedRoute {
                fragment,
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// All requests executed so far, in call order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of executed requests whose URL or body contains `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request_contains(request, fragment))
            .count()
    }

    fn reply_for(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .iter_mut()
            .find(|route| request_contains(request, &route.fragment))
            .ok_or_else(|| {
                HttpError::non_retryable(format!("no scripted response for {}", request.url))
            })?;

        if route.replies.len() > 1 {
            route
                .replies
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::non_retryable("scripted route drained")))
        } else {
            route
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| Err(HttpError::non_retryable("scripted route drained")))
        }
    }
}

fn request_contains(request: &HttpRequest, fragment: &str) -> bool {
    request.url.contains(fragment)
        || request
            .body
            .as_deref()
            .is_some_and(|body| body.contains(fragment))
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let reply = self.reply_for(&request);
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            reply
        })
    }

    fn execute_streaming<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpBodyStream, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.execute(request).await?;
            Ok(HttpBodyStream::buffered(
                response.status,
                response.body,
                self.chunk_bytes,
            ))
        })
    }
}
