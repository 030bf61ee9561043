//! The content generator behind the cache.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::context::RequestContext;
use super::entry::HeaderSet;

/// What the origin produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: HeaderSet,
    pub body: String,
}

impl OriginResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderSet::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Shared-cache lifetime announced by the origin: `s-maxage`, else `max-age`.
    pub fn max_age(&self) -> Option<u64> {
        let cache_control = self.headers.get("cache-control")?;
        directive(cache_control, "s-maxage").or_else(|| directive(cache_control, "max-age"))
    }
}

fn directive(cache_control: &str, name: &str) -> Option<u64> {
    cache_control.split(',').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').parse().ok())
            .flatten()
    })
}

#[derive(Debug, Clone, Error)]
pub enum OriginError {
    #[error("origin failed: {0}")]
    Upstream(String),
    #[error("origin timed out after {0:?}")]
    Timeout(Duration),
    /// The origin answered with something the cache cannot hold as text, such
    /// as a binary or oversized body. The caller relays it unchanged.
    #[error("origin response is not cacheable: {0}")]
    Relayed(String),
}

impl OriginError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }
}

/// Generates a fresh response for a request the cache cannot answer.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn generate(&self, ctx: &RequestContext) -> Result<OriginResponse, OriginError>;
}

/// Adapts an async closure into an [`Origin`].
pub struct FnOrigin<F> {
    generate: F,
}

impl<F, Fut> FnOrigin<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OriginResponse, OriginError>> + Send,
{
    pub fn new(generate: F) -> Self {
        Self { generate }
    }
}

#[async_trait]
impl<F, Fut> Origin for FnOrigin<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OriginResponse, OriginError>> + Send,
{
    async fn generate(&self, ctx: &RequestContext) -> Result<OriginResponse, OriginError> {
        (self.generate)(ctx.clone()).await
    }
}
