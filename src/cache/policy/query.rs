use url::form_urlencoded;

use super::{Policy, PolicyError, PolicyOutcome};
use crate::cache::context::RequestContext;

/// Splits cached pages by selected query parameters.
///
/// The query string is otherwise ignored by the cache key, so `?page=2` and
/// `?page=3` share an entry unless `page` is listed here.
#[derive(Debug, Clone)]
pub struct QueryVariantPolicy {
    params: Vec<String>,
}

impl QueryVariantPolicy {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
        }
    }
}

impl Policy for QueryVariantPolicy {
    fn name(&self) -> &'static str {
        "query"
    }

    fn evaluate(&self, ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
        // Re-encode decoded values so `&` or `=` inside one cannot forge another pair.
        let mut fragment = form_urlencoded::Serializer::new(String::new());
        for name in &self.params {
            if let Some(value) = ctx.query_param(name) {
                fragment.append_pair(name, value);
            }
        }
        Ok(PolicyOutcome::Continue(fragment.finish()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;

    fn ctx(query: &str) -> RequestContext {
        RequestContext::builder(Method::GET, "host", "/list")
            .query_string(query)
            .build()
    }

    #[test]
    fn listed_params_form_the_fragment() {
        let policy = QueryVariantPolicy::new(["page", "sort"]);
        assert_eq!(
            policy.evaluate(&ctx("sort=asc&utm=x&page=2")).expect("evaluates"),
            PolicyOutcome::fragment("page=2&sort=asc")
        );
    }

    #[test]
    fn encoded_separators_stay_inside_their_value() {
        let policy = QueryVariantPolicy::new(["a", "b"]);
        let smuggled = policy.evaluate(&ctx("a=x%26b%3Dy")).expect("evaluates");
        let split = policy.evaluate(&ctx("a=x&b=y")).expect("evaluates");

        assert_eq!(smuggled, PolicyOutcome::fragment("a=x%26b%3Dy"));
        assert_eq!(split, PolicyOutcome::fragment("a=x&b=y"));
        assert_ne!(smuggled, split);
    }

    #[test]
    fn unlisted_params_are_ignored() {
        let policy = QueryVariantPolicy::new(["page"]);
        assert_eq!(
            policy.evaluate(&ctx("utm=x")).expect("evaluates"),
            PolicyOutcome::pass()
        );
    }
}
