//! Cache policies and the chain that runs them.
//!
//! Each [`Policy`] inspects the request and either contributes a variant
//! fragment, vetoes caching, or overrides the response outright. The chain
//! stops at the first veto or override; otherwise the fragments are folded
//! into the request's variant key.

mod maintenance;
mod query;
mod session;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::context::RequestContext;
use super::entry::ResponseEntry;
use super::keys::variant_key;

pub use maintenance::{MaintenancePage, MaintenancePolicy, MaintenanceSwitch};
pub use query::QueryVariantPolicy;
pub use session::SessionPolicy;

/// What a single policy decided for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Keep going, mixing this fragment (possibly empty) into the variant key.
    Continue(String),
    /// Do not cache; serve straight from the origin.
    Veto,
    /// Serve this response instead of consulting the store or the origin.
    Override(Box<ResponseEntry>),
}

impl PolicyOutcome {
    /// Continue without contributing to the variant key.
    pub fn pass() -> Self {
        Self::Continue(String::new())
    }

    pub fn fragment(fragment: impl Into<String>) -> Self {
        Self::Continue(fragment.into())
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy `{policy}` failed: {reason}")]
    Failed { policy: &'static str, reason: String },
}

impl PolicyError {
    pub fn failed(policy: &'static str, reason: impl Into<String>) -> Self {
        Self::Failed {
            policy,
            reason: reason.into(),
        }
    }
}

/// A pluggable rule evaluated against every cacheable request.
pub trait Policy: Send + Sync {
    /// Stable identifier, also used as the outcome code for overrides.
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError>;
}

/// Result of running the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResult {
    /// No policy short-circuited; `""` addresses the canonical entry.
    Variant(String),
    Veto { policy: &'static str },
    Override {
        policy: &'static str,
        entry: Box<ResponseEntry>,
    },
}

/// Ordered, immutable list of policies.
#[derive(Clone, Default)]
pub struct PolicyChain {
    policies: Vec<Arc<dyn Policy>>,
}

impl PolicyChain {
    pub fn builder() -> PolicyChainBuilder {
        PolicyChainBuilder::default()
    }

    /// The built-in chain: session veto first, then the maintenance override.
    pub fn with_defaults<I, S>(session_prefixes: I, maintenance: MaintenanceSwitch) -> PolicyChainBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder()
            .policy(SessionPolicy::new(session_prefixes))
            .policy(MaintenancePolicy::new(maintenance))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|policy| policy.name()).collect()
    }

    pub fn evaluate(&self, ctx: &RequestContext) -> ChainResult {
        let mut fragments = Vec::with_capacity(self.policies.len());

        for policy in &self.policies {
            let name = policy.name();
            let outcome = match catch_unwind(AssertUnwindSafe(|| policy.evaluate(ctx))) {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(error)) => {
                    warn!(policy = name, error = %error, url = ctx.full_url(), "policy failed, bypassing cache");
                    PolicyOutcome::Veto
                }
                Err(_) => {
                    warn!(policy = name, url = ctx.full_url(), "policy panicked, bypassing cache");
                    PolicyOutcome::Veto
                }
            };

            match outcome {
                PolicyOutcome::Continue(fragment) => fragments.push(fragment),
                PolicyOutcome::Veto => {
                    debug!(policy = name, "policy vetoed caching");
                    return ChainResult::Veto { policy: name };
                }
                PolicyOutcome::Override(entry) => {
                    debug!(policy = name, "policy overrode response");
                    return ChainResult::Override {
                        policy: name,
                        entry,
                    };
                }
            }
        }

        ChainResult::Variant(variant_key(&fragments))
    }
}

/// Collects policies in evaluation order; the chain is frozen by [`build`](Self::build).
#[derive(Default)]
pub struct PolicyChainBuilder {
    policies: Vec<Arc<dyn Policy>>,
}

impl PolicyChainBuilder {
    pub fn policy(mut self, policy: impl Policy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn shared(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn build(self) -> PolicyChain {
        PolicyChain {
            policies: self.policies,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::Method;

    use super::*;

    struct Fixed(&'static str, PolicyOutcome);

    impl Policy for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn evaluate(&self, _ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
            Ok(self.1.clone())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Policy for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn evaluate(&self, _ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(PolicyOutcome::fragment("counted"))
        }
    }

    struct Failing;

    impl Policy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn evaluate(&self, _ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
            Err(PolicyError::failed("failing", "lookup unavailable"))
        }
    }

    struct Panicking;

    impl Policy for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn evaluate(&self, _ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
            panic!("policy bug");
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::builder(Method::GET, "host", "/page").build()
    }

    #[test]
    fn empty_chain_yields_canonical_variant() {
        let chain = PolicyChain::builder().build();
        assert_eq!(chain.evaluate(&ctx()), ChainResult::Variant(String::new()));
    }

    #[test]
    fn passing_policies_keep_canonical_variant() {
        let chain = PolicyChain::builder()
            .policy(Fixed("a", PolicyOutcome::pass()))
            .policy(Fixed("b", PolicyOutcome::pass()))
            .build();
        assert_eq!(chain.evaluate(&ctx()), ChainResult::Variant(String::new()));
    }

    #[test]
    fn fragments_hash_in_order() {
        let chain = PolicyChain::builder()
            .policy(Fixed("device", PolicyOutcome::fragment("mobile")))
            .policy(Fixed("locale", PolicyOutcome::fragment("fr")))
            .build();

        assert_eq!(
            chain.evaluate(&ctx()),
            ChainResult::Variant(variant_key(["mobile", "fr"]))
        );
    }

    #[test]
    fn first_veto_wins_and_stops_evaluation() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = PolicyChain::builder()
            .policy(Fixed("session", PolicyOutcome::Veto))
            .policy(Fixed("maintenance", PolicyOutcome::Override(Box::new(ResponseEntry::new("down")))))
            .policy(Counting(Arc::clone(&later)))
            .build();

        assert_eq!(chain.evaluate(&ctx()), ChainResult::Veto { policy: "session" });
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn override_short_circuits_remaining_policies() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = PolicyChain::builder()
            .policy(Fixed("maintenance", PolicyOutcome::Override(Box::new(ResponseEntry::new("down")))))
            .policy(Counting(Arc::clone(&later)))
            .build();

        match chain.evaluate(&ctx()) {
            ChainResult::Override { policy, entry } => {
                assert_eq!(policy, "maintenance");
                assert_eq!(entry.body, "down");
            }
            other => panic!("expected override, got {other:?}"),
        }
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_policy_is_a_veto() {
        let chain = PolicyChain::builder().policy(Failing).build();
        assert_eq!(chain.evaluate(&ctx()), ChainResult::Veto { policy: "failing" });
    }

    #[test]
    fn panicking_policy_is_a_veto() {
        let chain = PolicyChain::builder().policy(Panicking).build();
        assert_eq!(chain.evaluate(&ctx()), ChainResult::Veto { policy: "panicking" });
    }

    #[test]
    fn defaults_run_session_before_maintenance() {
        let chain = PolicyChain::with_defaults(["wp_user"], MaintenanceSwitch::new()).build();
        assert_eq!(chain.names(), vec!["session", "maintenance"]);
    }
}
