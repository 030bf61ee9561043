//! Page cache middleware.
//!
//! Wraps any axum handler stack with a [`CacheEngine`]; the inner handlers act
//! as the origin. Responses the engine serves straight from the origin keep the
//! handler's own header map, so repeated headers such as `Set-Cookie` survive.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header, response::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use super::context::{ContextOptions, RequestContext};
use super::engine::{CacheEngine, CacheOutcome, ServedResponse};
use super::entry::HeaderSet;
use super::lock::mutex_lock;
use super::origin::{Origin, OriginError, OriginResponse};

const SOURCE: &str = "cache::middleware";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub engine: Arc<CacheEngine>,
    pub context: ContextOptions,
}

impl CacheState {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        let context = ContextOptions::from(engine.config());
        Self { engine, context }
    }
}

/// Middleware serving cacheable pages through the engine.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_parts(&parts, remote, &cache.context);
    let request = Request::from_parts(parts, body);

    if let Some(reason) = cache.engine.exclusion(&ctx) {
        debug!(cache = "page", outcome = "skip", reason, "request excluded from page cache");
        return next.run(request).await;
    }

    let origin = NextOrigin::new(request, next, cache.engine.config().max_body_bytes);
    let served = cache.engine.handle(&ctx, &origin).await;
    origin.finish(served, &cache.engine.config().outcome_header)
}

/// What the inner handler returned, kept for responses served without the cache's copy.
enum Captured {
    /// Headers of a text response whose body was handed to the engine.
    Text(Parts),
    /// A response the engine could not hold; relayed as-is.
    Raw(Response),
}

/// Runs the rest of the middleware stack at most once, on demand.
struct NextOrigin {
    pending: Mutex<Option<(Request<Body>, Next)>>,
    captured: Mutex<Option<Captured>>,
    max_body_bytes: usize,
}

impl NextOrigin {
    fn new(request: Request<Body>, next: Next, max_body_bytes: usize) -> Self {
        Self {
            pending: Mutex::new(Some((request, next))),
            captured: Mutex::new(None),
            max_body_bytes,
        }
    }

    fn capture(&self, captured: Captured) {
        *mutex_lock(&self.captured, SOURCE, "capture") = Some(captured);
    }

    fn finish(self, served: ServedResponse, outcome_header: &str) -> Response {
        let captured = mutex_lock(&self.captured, SOURCE, "finish").take();
        let from_origin = served.outcome.is_origin_response();
        match captured {
            Some(Captured::Raw(response)) if served.outcome == CacheOutcome::Relayed => response,
            Some(Captured::Text(parts)) if from_origin => rebuild(parts, served, outcome_header),
            _ => served.into_response(),
        }
    }

    fn relays(&self, headers: &HeaderMap) -> Option<&'static str> {
        if headers.contains_key(header::CONTENT_ENCODING) {
            return Some("encoded body");
        }
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Some("body too large");
        }
        let textual = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_none_or(is_textual);
        (!textual).then_some("binary content type")
    }
}

#[async_trait]
impl Origin for NextOrigin {
    async fn generate(&self, _ctx: &RequestContext) -> Result<OriginResponse, OriginError> {
        let pending = mutex_lock(&self.pending, SOURCE, "generate").take();
        let Some((request, next)) = pending else {
            return Err(OriginError::upstream("inner handler already ran"));
        };

        let (parts, body) = next.run(request).await.into_parts();
        if let Some(reason) = self.relays(&parts.headers) {
            self.capture(Captured::Raw(Response::from_parts(parts, body)));
            return Err(OriginError::Relayed(reason.to_string()));
        }

        let bytes = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|error| OriginError::upstream(format!("failed to read handler body: {error}")))?;

        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => {
                let response = OriginResponse {
                    status: parts.status.as_u16(),
                    headers: header_set(&parts.headers),
                    body: text,
                };
                self.capture(Captured::Text(parts));
                Ok(response)
            }
            Err(error) => {
                let raw = Body::from(error.into_bytes());
                self.capture(Captured::Raw(Response::from_parts(parts, raw)));
                Err(OriginError::Relayed("body is not UTF-8".to_string()))
            }
        }
    }
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || mime.ends_with("+json")
        || matches!(
            mime.as_str(),
            "application/json" | "application/xml" | "application/javascript"
        )
}

fn header_set(headers: &HeaderMap) -> HeaderSet {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
        .collect()
}

/// Serve `served.body` under the handler's own headers, refreshing the ones the engine owns.
fn rebuild(mut parts: Parts, served: ServedResponse, outcome_header: &str) -> Response {
    parts.headers.remove(header::CONTENT_LENGTH);
    for name in [header::CACHE_CONTROL.as_str(), outcome_header] {
        if name.is_empty() {
            continue;
        }
        if let Some(value) = served.headers.get(name) {
            insert_header(&mut parts.headers, name, value);
        }
    }
    Response::from_parts(parts, Body::from(served.body))
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

impl IntoResponse for ServedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        for (name, value) in self.headers.iter() {
            insert_header(headers, name, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_content_types() {
        assert!(is_textual("text/html; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(is_textual("application/rss+xml"));
        assert!(!is_textual("image/png"));
        assert!(!is_textual("application/octet-stream"));
    }

    #[test]
    fn served_response_keeps_status_and_headers() {
        let mut headers = HeaderSet::new();
        headers.insert("content-type", "text/html");
        headers.insert("x-pagefront-cache", "HIT");
        let response = ServedResponse {
            status: 404,
            headers,
            body: "missing".to_string(),
            outcome: CacheOutcome::Hit,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("text/html")
        );
        assert_eq!(
            response.headers().get("x-pagefront-cache").and_then(|v| v.to_str().ok()),
            Some("HIT")
        );
    }
}
