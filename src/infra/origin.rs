//! Upstream HTTP origin: forwards requests the page cache cannot answer.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::{Client, redirect};
use tracing::{debug, warn};
use url::Url;

use crate::config::OriginSettings;

use super::error::InfraError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Reverse-proxy client for the configured upstream.
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
    upstream: Url,
    preserve_host: bool,
    max_request_bytes: usize,
}

impl HttpOrigin {
    pub fn new(settings: &OriginSettings, max_request_bytes: usize) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::origin(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            upstream: settings.upstream.clone(),
            preserve_host: settings.preserve_host,
            max_request_bytes,
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Upstream URL for a request path and query.
    pub fn target(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        url
    }

    /// Forward `request` upstream and relay the answer.
    pub async fn forward(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let target = self.target(parts.uri.path(), parts.uri.query());

        let body = match axum::body::to_bytes(body, self.max_request_bytes).await {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "rejecting oversized request body");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let mut headers = strip_hop_by_hop(&parts.headers);
        // Identity encoding keeps upstream bodies cacheable as text.
        headers.remove(header::ACCEPT_ENCODING);
        if !self.preserve_host {
            headers.remove(header::HOST);
        }

        let sent = self
            .client
            .request(parts.method.clone(), target.clone())
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match sent {
            Ok(response) => response,
            Err(err) => return upstream_failure(&target, &err),
        };

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return upstream_failure(&target, &err),
        };

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        forwarded.remove(name);
    }
    forwarded
}

fn upstream_failure(target: &Url, err: &reqwest::Error) -> Response {
    let status = if err.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    };
    warn!(
        upstream = %target,
        status = status.as_u16(),
        error = %err,
        "upstream request failed"
    );

    let mut response = (status, status.canonical_reason().unwrap_or("Bad Gateway")).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
