//! Rules deciding whether a fresh origin response may be stored.

use std::sync::Arc;

use super::context::RequestContext;
use super::origin::OriginResponse;

pub trait ResponseRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `false` keeps the response out of the store; it is still served.
    fn is_cacheable(&self, ctx: &RequestContext, response: &OriginResponse) -> bool;
}

/// Never store server errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerErrorRule;

impl ResponseRule for ServerErrorRule {
    fn name(&self) -> &'static str {
        "server_error"
    }

    fn is_cacheable(&self, _ctx: &RequestContext, response: &OriginResponse) -> bool {
        !(500..600).contains(&response.status)
    }
}

/// Never store responses that set cookies; they are usually per-visitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetCookieRule;

impl ResponseRule for SetCookieRule {
    fn name(&self) -> &'static str {
        "set_cookie"
    }

    fn is_cacheable(&self, _ctx: &RequestContext, response: &OriginResponse) -> bool {
        !response.headers.contains("set-cookie")
    }
}

/// Ordered rule set; a response is cacheable only if every rule agrees.
#[derive(Clone)]
pub struct ResponseRules {
    rules: Vec<Arc<dyn ResponseRule>>,
}

impl ResponseRules {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with(mut self, rule: impl ResponseRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// The first rule refusing the response, if any.
    pub fn refusal(&self, ctx: &RequestContext, response: &OriginResponse) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| !rule.is_cacheable(ctx, response))
            .map(|rule| rule.name())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }
}

impl Default for ResponseRules {
    fn default() -> Self {
        Self::empty().with(ServerErrorRule)
    }
}
