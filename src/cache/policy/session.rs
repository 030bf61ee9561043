use super::{Policy, PolicyError, PolicyOutcome};
use crate::cache::config::DEFAULT_SESSION_COOKIE_PREFIXES;
use crate::cache::context::RequestContext;

/// Vetoes caching for visitors carrying an authenticated-session cookie.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    prefixes: Vec<String>,
}

impl SessionPolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|prefix: &String| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, cookie_name: &str) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| cookie_name.starts_with(prefix.as_str()))
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_COOKIE_PREFIXES.iter().copied())
    }
}

impl Policy for SessionPolicy {
    fn name(&self) -> &'static str {
        "session"
    }

    fn evaluate(&self, ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
        if ctx.cookies().keys().any(|name| self.matches(name)) {
            Ok(PolicyOutcome::Veto)
        } else {
            Ok(PolicyOutcome::pass())
        }
    }
}
