//! HTTP transport.
//!
//! A transport executes one signed GET and hands back the raw status, body
//! and headers; classification happens later in [`crate::classify`]. The
//! production [`HttpTransport`] builds a fresh `reqwest` client for every
//! call so that no connection is ever shared between concurrent requests,
//! and drops it (with its pool) before returning.

use crate::config::EndpointContext;
use crate::error::{CsError, CsResult};
use crate::wire::WireObserver;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::collections::BTreeMap;
use std::time::Duration;

/// Content type sent with every request.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Status, body and headers of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// `None` when the server sent no body.
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl RawResponse {
    pub fn new(status: u16, body: Option<&str>) -> Self {
        Self {
            status,
            body: body.map(|b| b.to_string()),
            headers: BTreeMap::new(),
        }
    }
}

/// Executes signed request URLs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        url: &str,
        ctx: &EndpointContext,
        wire: Option<&dyn WireObserver>,
    ) -> CsResult<RawResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_client(&self, url: &str, ctx: &EndpointContext) -> CsResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .user_agent(ctx.user_agent.as_str())
            .connect_timeout(Duration::from_secs(ctx.connect_timeout_secs))
            .timeout(Duration::from_secs(ctx.request_timeout_secs))
            .pool_max_idle_per_host(0);

        builder = match proxy_url(url, ctx) {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy.as_str())
                    .map_err(|e| CsError::internal(format!("Invalid proxy {}: {}", proxy, e)))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| CsError::internal(format!("Unable to create HTTP client: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        url: &str,
        ctx: &EndpointContext,
        wire: Option<&dyn WireObserver>,
    ) -> CsResult<RawResponse> {
        let client = self.build_client(url, ctx)?;

        if let Some(wire) = wire {
            wire.request("GET", url, &[("Content-Type", FORM_CONTENT_TYPE)]);
        }

        let response = client
            .get(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| {
                log::error!("I/O error from server communications: {}", e);
                CsError::from(e)
            })?;

        let status = response.status().as_u16();
        log::debug!("execute(): HTTP Status {}", status);

        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.trim().to_string());
            }
        }
        if let Some(wire) = wire {
            wire.response(status, &headers);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CsError::communication(format!("Error reading response body: {}", e)))?;
        let body = decode_body(status, &bytes)?;

        Ok(RawResponse {
            status,
            body,
            headers,
        })
    }
}

/// Response body as text; an empty body is `None`.
pub fn decode_body(status: u16, bytes: &[u8]) -> CsResult<Option<String>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(Some(text.to_string())),
        Err(e) => {
            log::error!("execute(): body of HTTP {} response is not UTF-8: {}", status, e);
            Err(CsError::communication(format!(
                "Received a response body from server [{}] that is not valid UTF-8: {}",
                status, e
            )))
        }
    }
}

/// Proxy URL for a request, with the scheme matched to the request's own.
pub fn proxy_url(url: &str, ctx: &EndpointContext) -> Option<String> {
    let proxy = ctx.proxy.as_ref()?;
    let scheme = if url.starts_with("https") { "https" } else { "http" };
    Some(match proxy.port {
        Some(port) => format!("{}://{}:{}", scheme, proxy.host, port),
        None => format!("{}://{}", scheme, proxy.host),
    })
}
