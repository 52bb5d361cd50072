// crates/shapegate-client/src/http.rs
// ============================================================================
// Module: HTTP Transports
// Description: reqwest-backed mutation and shape transports.
// Purpose: Talk to the gateway's mutation routes and shape proxy.
// Dependencies: reqwest, url, shapegate-core
// ============================================================================

//! ## Overview
//! Both transports share one [`HttpEndpoint`]: a normalized base URL plus a
//! bearer token. The shape transport reads the resume position from the
//! `electric-*` response headers and maps `409` to a must-refetch batch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use serde_json::Value;
use shapegate_core::Control;
use shapegate_core::ControlHeaders;
use shapegate_core::ShapeCursor;
use shapegate_core::ShapeMessage;
use shapegate_core::Table;
use shapegate_core::stream::HEADER_CURSOR;
use shapegate_core::stream::HEADER_HANDLE;
use shapegate_core::stream::HEADER_OFFSET;
use url::Url;

use crate::error::ClientError;
use crate::error::rejection;
use crate::transport::MutationReceipt;
use crate::transport::MutationRequest;
use crate::transport::MutationTransport;
use crate::transport::ShapeBatch;
use crate::transport::ShapeLog;

// ============================================================================
// SECTION: Endpoint
// ============================================================================

/// Gateway base URL and credentials.
///
/// # Invariants
/// - `base_url` has no query and no trailing slash in its path.
#[derive(Clone)]
pub struct HttpEndpoint {
    /// Gateway base URL.
    base_url: Url,
    /// Bearer token presented on every request.
    token: String,
    /// HTTP client.
    client: Client,
}

impl HttpEndpoint {
    /// Builds an endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when the URL is not http(s) or the
    /// client cannot be built.
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| ClientError::Config(format!("invalid base url: {err}")))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.query().is_some() {
            return Err(ClientError::Config("base url must be http(s) without a query".to_string()));
        }
        let path = base_url.path().trim_end_matches('/').to_string();
        base_url.set_path(&path);
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| ClientError::Config(err.to_string()))?;
        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    /// Resolves an absolute gateway path.
    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{path}", self.base_url.path().trim_end_matches('/'));
        url.set_path(&joined);
        url
    }

    /// Starts a request carrying the bearer token.
    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ClientError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| ClientError::Config("invalid bearer token".to_string()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(self.client.request(method, url).headers(headers))
    }
}

/// Reads a JSON body, tolerating an empty one.
async fn json_body(response: Response) -> Result<Value, ClientError> {
    let bytes = response.bytes().await.map_err(|err| ClientError::Transport(err.to_string()))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| ClientError::Protocol(format!("invalid JSON body: {err}")))
}

// ============================================================================
// SECTION: Mutation Transport
// ============================================================================

/// Sends mutations to the gateway over HTTP.
#[derive(Clone)]
pub struct HttpMutationTransport {
    /// Gateway endpoint.
    endpoint: HttpEndpoint,
}

impl HttpMutationTransport {
    /// Creates a transport for an endpoint.
    #[must_use]
    pub const fn new(endpoint: HttpEndpoint) -> Self {
        Self {
            endpoint,
        }
    }
}

#[async_trait]
impl MutationTransport for HttpMutationTransport {
    async fn send(&self, request: &MutationRequest) -> Result<MutationReceipt, ClientError> {
        let (method, path, body) = request.http_parts()?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        let mut builder = self.endpoint.request(method, self.endpoint.url(&path))?;
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status();
        let body = json_body(response).await?;
        if !status.is_success() {
            return Err(rejection(status.as_u16(), &body));
        }
        MutationReceipt::from_body(&body)
    }
}

// ============================================================================
// SECTION: Shape Transport
// ============================================================================

/// Polls shapes through the gateway's shape proxy.
#[derive(Clone)]
pub struct HttpShapeLog {
    /// Gateway endpoint.
    endpoint: HttpEndpoint,
}

impl HttpShapeLog {
    /// Creates a shape log for an endpoint.
    #[must_use]
    pub const fn new(endpoint: HttpEndpoint) -> Self {
        Self {
            endpoint,
        }
    }
}

#[async_trait]
impl ShapeLog for HttpShapeLog {
    async fn poll(
        &self,
        table: Table,
        cursor: &ShapeCursor,
        filter: Option<&str>,
    ) -> Result<ShapeBatch, ClientError> {
        let mut url = self.endpoint.url(&format!("/api/shape/{}", table.route()));
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in cursor.query_pairs() {
                query.append_pair(name, &value);
            }
            if let Some(filter) = filter {
                query.append_pair("where", filter);
            }
        }
        let response = self
            .endpoint
            .request(Method::GET, url)?
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(ShapeBatch {
                messages: vec![ShapeMessage::Control {
                    headers: ControlHeaders {
                        control: Control::MustRefetch,
                    },
                }],
                next: ShapeCursor::initial(),
            });
        }
        if !status.is_success() {
            let body = json_body(response).await.unwrap_or(Value::Null);
            return Err(rejection(status.as_u16(), &body));
        }
        let next = next_cursor(cursor, response.headers())?;
        let bytes = response.bytes().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let messages: Vec<ShapeMessage> = if bytes.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|err| ClientError::Protocol(format!("invalid shape body: {err}")))?
        };
        let caught_up = messages.iter().any(|message| {
            matches!(message, ShapeMessage::Control { headers } if headers.control == Control::UpToDate)
        });
        Ok(ShapeBatch {
            messages,
            next: ShapeCursor {
                live: next.live || caught_up,
                ..next
            },
        })
    }
}

/// Derives the resume cursor from response headers.
fn next_cursor(previous: &ShapeCursor, headers: &HeaderMap) -> Result<ShapeCursor, ClientError> {
    let text = |name: &str| headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string);
    let offset = text(HEADER_OFFSET)
        .ok_or_else(|| ClientError::Protocol(format!("response lacks {HEADER_OFFSET}")))?;
    Ok(ShapeCursor {
        offset,
        handle: text(HEADER_HANDLE).or_else(|| previous.handle.clone()),
        cursor: text(HEADER_CURSOR).or_else(|| previous.cursor.clone()),
        live: previous.live,
    })
}
