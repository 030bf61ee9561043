//! Per-request orchestration of the page cache.
//!
//! [`CacheEngine::handle`] runs the protocol exclusions, the policy chain,
//! the store lookup and, on a miss, the origin. Store writes run on detached
//! tasks so a client hanging up never cancels cache population.

use std::sync::Arc;
use std::time::Instant;

use axum::http::Method;
use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::context::{RequestContext, normalize_full_url};
use super::entry::{HeaderSet, InstructionRef, NEVER_EXPIRES, ResponseEntry, http_date, now_unix};
use super::instruction::InstructionPipeline;
use super::keys::{entry_key, url_hash};
use super::origin::{Origin, OriginError, OriginResponse};
use super::policy::{ChainResult, MaintenanceSwitch, PolicyChain, QueryVariantPolicy};
use super::records::{InvalidationReport, RecordBook};
use super::rules::{ResponseRules, SetCookieRule};
use super::store::{Store, StoreError, bounded};

const METRIC_HIT: &str = "pagefront_cache_hit_total";
const METRIC_MISS: &str = "pagefront_cache_miss_total";
const METRIC_BYPASS: &str = "pagefront_cache_bypass_total";
const METRIC_OVERRIDE: &str = "pagefront_cache_override_total";
const METRIC_STORE_ERROR: &str = "pagefront_cache_store_error_total";
const METRIC_ORIGIN_MS: &str = "pagefront_origin_ms";

/// Headers describing one transfer or one visitor; never replayed from the store.
const UNSTORED_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "set-cookie",
    "transfer-encoding",
];

/// How a request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Excluded before any policy ran; the origin response is passed through.
    Skipped { reason: &'static str },
    Hit,
    Miss,
    Bypass { policy: &'static str },
    Override { policy: &'static str },
    /// Generated on a miss but refused by a response rule.
    Uncached { reason: &'static str },
    OriginTimeout,
    OriginFailed,
    /// The origin produced a body the cache does not handle.
    Relayed,
}

impl CacheOutcome {
    /// Value of the diagnostic outcome header, if one is sent.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::Skipped { .. } | Self::Relayed => None,
            Self::Hit => Some("HIT".to_string()),
            Self::Miss => Some("MISS".to_string()),
            Self::Bypass { .. } => Some("BYPASS".to_string()),
            Self::Override { policy } => Some(policy.to_ascii_uppercase()),
            Self::Uncached { .. } => Some("DYNAMIC".to_string()),
            Self::OriginTimeout => Some("TIMEOUT".to_string()),
            Self::OriginFailed => Some("ERROR".to_string()),
        }
    }

    /// Whether the served body is exactly what the origin produced for this request.
    pub fn is_origin_response(&self) -> bool {
        matches!(
            self,
            Self::Skipped { .. } | Self::Miss | Self::Bypass { .. } | Self::Uncached { .. }
        )
    }
}

/// The response the engine decided to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedResponse {
    pub status: u16,
    pub headers: HeaderSet,
    pub body: String,
    pub outcome: CacheOutcome,
}

impl ServedResponse {
    fn from_origin(response: OriginResponse, outcome: CacheOutcome) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            outcome,
        }
    }

    fn gateway_error(status: u16, message: &str, outcome: CacheOutcome) -> Self {
        let mut headers = HeaderSet::new();
        headers.insert("content-type", "text/plain; charset=utf-8");
        headers.insert("cache-control", "no-store");
        Self {
            status,
            headers,
            body: message.to_string(),
            outcome,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("no ephemeral instruction registered as `{0}`")]
    UnknownInstruction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CacheEngine {
    config: CacheConfig,
    store: Arc<dyn Store>,
    records: Arc<RecordBook>,
    chain: PolicyChain,
    pipeline: InstructionPipeline,
    rules: ResponseRules,
    maintenance: MaintenanceSwitch,
}

impl CacheEngine {
    pub fn builder(config: CacheConfig, store: Arc<dyn Store>) -> CacheEngineBuilder {
        CacheEngineBuilder {
            config,
            store,
            chain: None,
            pipeline: None,
            rules: None,
            maintenance: MaintenanceSwitch::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn chain(&self) -> &PolicyChain {
        &self.chain
    }

    pub fn pipeline(&self) -> &InstructionPipeline {
        &self.pipeline
    }

    pub fn records(&self) -> &RecordBook {
        &self.records
    }

    /// The switch read by the built-in maintenance policy.
    pub fn maintenance(&self) -> &MaintenanceSwitch {
        &self.maintenance
    }

    /// Protocol-level reason to keep `ctx` away from the cache entirely.
    pub fn exclusion(&self, ctx: &RequestContext) -> Option<&'static str> {
        if !self.config.enabled {
            return Some("disabled");
        }
        if ctx.method() != Method::GET && ctx.method() != Method::HEAD {
            return Some("method");
        }
        if ctx.has_basic_auth() {
            return Some("authorization");
        }
        let excluded = self
            .config
            .excluded_path_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && ctx.path().starts_with(prefix.as_str()));
        excluded.then_some("path")
    }

    /// Answer one request, consulting `origin` only when the cache cannot.
    #[instrument(skip_all, fields(cache = "page", url = %ctx.full_url()))]
    pub async fn handle(&self, ctx: &RequestContext, origin: &dyn Origin) -> ServedResponse {
        let mut served = self.resolve(ctx, origin).await;
        if !self.config.outcome_header.is_empty() {
            if let Some(value) = served.outcome.header_value() {
                served.headers.insert(&self.config.outcome_header, value);
            }
        }
        served
    }

    async fn resolve(&self, ctx: &RequestContext, origin: &dyn Origin) -> ServedResponse {
        if let Some(reason) = self.exclusion(ctx) {
            debug!(outcome = "skip", reason, "request excluded from page cache");
            return self.relay(ctx, origin, CacheOutcome::Skipped { reason }).await;
        }

        let variant = match self.chain.evaluate(ctx) {
            ChainResult::Variant(variant) => variant,
            ChainResult::Veto { policy } => {
                counter!(METRIC_BYPASS).increment(1);
                return self.bypass(ctx, origin, policy).await;
            }
            ChainResult::Override { policy, entry } => {
                counter!(METRIC_OVERRIDE).increment(1);
                return self.serve_override(ctx, policy, *entry);
            }
        };

        let cache_key = url_hash(ctx.full_url());
        match self.records.load(&cache_key).await {
            Ok(Some(record)) if !record.is_cacheable => {
                debug!(outcome = "skip", reason = "record", "url marked uncacheable");
                return self
                    .relay(ctx, origin, CacheOutcome::Skipped { reason: "record" })
                    .await;
            }
            Ok(_) => {}
            Err(error) => store_failed("record_get", &error),
        }

        let key = entry_key(&cache_key, &variant);
        match self.lookup(&key).await {
            Some(entry) => self.serve_hit(ctx, cache_key, variant, entry).await,
            None => self.serve_miss(ctx, origin, cache_key, variant, key).await,
        }
    }

    async fn relay(
        &self,
        ctx: &RequestContext,
        origin: &dyn Origin,
        outcome: CacheOutcome,
    ) -> ServedResponse {
        match self.generate(ctx, origin).await {
            Ok(response) => ServedResponse::from_origin(response, outcome),
            Err(error) => self.origin_failed(ctx, error),
        }
    }

    async fn bypass(
        &self,
        ctx: &RequestContext,
        origin: &dyn Origin,
        policy: &'static str,
    ) -> ServedResponse {
        debug!(outcome = "bypass", policy, "serving origin without cache");
        match self.generate(ctx, origin).await {
            Ok(mut response) => {
                response.body = self.pipeline.apply_perpetual(response.body, ctx);
                ServedResponse::from_origin(response, CacheOutcome::Bypass { policy })
            }
            Err(error) => self.origin_failed(ctx, error),
        }
    }

    fn serve_override(
        &self,
        ctx: &RequestContext,
        policy: &'static str,
        mut entry: ResponseEntry,
    ) -> ServedResponse {
        debug!(outcome = "override", policy, "serving policy response");
        let (body, _) = self.pipeline.apply(&mut entry, ctx);
        ServedResponse {
            status: entry.status,
            headers: entry.headers,
            body,
            outcome: CacheOutcome::Override { policy },
        }
    }

    async fn serve_hit(
        &self,
        ctx: &RequestContext,
        cache_key: String,
        variant: String,
        mut entry: ResponseEntry,
    ) -> ServedResponse {
        counter!(METRIC_HIT).increment(1);
        debug!(
            outcome = "hit",
            cache_key = %cache_key,
            variant = %variant,
            "serving cached page"
        );

        let (body, drained) = self.pipeline.apply(&mut entry, ctx);
        let now = now_unix();
        if drained.needs_persist() {
            debug!(
                applied = drained.applied,
                failed = drained.failed,
                "persisting drained instructions"
            );
            self.write_entry(cache_key, variant, &entry, now).await;
        }

        let max_age = entry.max_age_at(now, self.config.never_expires_max_age);
        let mut headers = entry.headers;
        headers.insert("cache-control", format!("max-age={max_age}"));
        if let Some(date) = http_date(entry.last_modified) {
            headers.insert("last-modified", date);
        }

        ServedResponse {
            status: entry.status,
            headers,
            body,
            outcome: CacheOutcome::Hit,
        }
    }

    async fn serve_miss(
        &self,
        ctx: &RequestContext,
        origin: &dyn Origin,
        cache_key: String,
        variant: String,
        key: String,
    ) -> ServedResponse {
        counter!(METRIC_MISS).increment(1);
        let mut response = match self.generate(ctx, origin).await {
            Ok(response) => response,
            Err(error) => return self.origin_failed(ctx, error),
        };

        let now = now_unix();
        let expiry = self.config.expiry_for(now, response.max_age());
        let refusal = if ctx.method() == Method::HEAD {
            Some("head")
        } else if expiry != NEVER_EXPIRES && expiry <= now {
            Some("expired")
        } else {
            self.rules.refusal(ctx, &response)
        };

        if let Some(reason) = refusal {
            debug!(outcome = "uncached", reason, status = response.status, "not storing origin response");
            response.body = self.pipeline.apply_perpetual(response.body, ctx);
            return ServedResponse::from_origin(response, CacheOutcome::Uncached { reason });
        }

        let mut entry = ResponseEntry::new(response.body.clone())
            .with_status(response.status)
            .with_expiry(expiry);
        entry.headers = storable_headers(&response.headers);
        entry.last_modified = now;

        debug!(outcome = "miss", key = %key, expiry, "storing origin response");
        self.populate(cache_key, variant, &entry, now).await;

        let max_age = entry.max_age_at(now, self.config.never_expires_max_age);
        response
            .headers
            .insert("cache-control", format!("max-age={max_age}"));
        response.body = self.pipeline.apply_perpetual(response.body, ctx);
        ServedResponse::from_origin(response, CacheOutcome::Miss)
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        origin: &dyn Origin,
    ) -> Result<OriginResponse, OriginError> {
        let timeout = self.config.origin_timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, origin.generate(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Timeout(timeout)),
        };
        histogram!(METRIC_ORIGIN_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    fn origin_failed(&self, ctx: &RequestContext, error: OriginError) -> ServedResponse {
        match error {
            OriginError::Timeout(after) => {
                warn!(url = ctx.full_url(), ?after, "origin timed out");
                ServedResponse::gateway_error(504, "Gateway Timeout", CacheOutcome::OriginTimeout)
            }
            OriginError::Relayed(reason) => {
                debug!(url = ctx.full_url(), reason = %reason, "origin response relayed unchanged");
                ServedResponse::gateway_error(502, "Bad Gateway", CacheOutcome::Relayed)
            }
            OriginError::Upstream(reason) => {
                warn!(url = ctx.full_url(), reason = %reason, "origin failed");
                ServedResponse::gateway_error(502, "Bad Gateway", CacheOutcome::OriginFailed)
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<ResponseEntry> {
        let fetched = bounded(
            "entry_get",
            self.config.store_timeout(),
            self.store.get(&self.config.group, key),
        )
        .await;

        let raw = match fetched {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                store_failed("entry_get", &error);
                return None;
            }
        };

        match ResponseEntry::from_bytes(&raw) {
            Ok(entry) if entry.has_expired() => {
                debug!(key, expiry = entry.expiry, "cached page expired");
                None
            }
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(key, error = %error, "discarding malformed cache entry");
                None
            }
        }
    }

    /// Record the variant and store its entry under the record lock, so a
    /// concurrent full invalidation either sees the variant or runs first.
    async fn populate(
        &self,
        cache_key: String,
        variant: String,
        entry: &ResponseEntry,
        now: i64,
    ) {
        let Some(raw) = encode(entry) else {
            return;
        };
        let ttl = entry.store_ttl_at(now);
        let records = Arc::clone(&self.records);

        settle(tokio::spawn(async move {
            records
                .store_entry(&cache_key, &variant, raw, ttl)
                .await
                .map_err(|error| ("entry_store", error))
        }))
        .await;
    }

    /// Persist a drained entry unless it was invalidated since the lookup.
    async fn write_entry(
        &self,
        cache_key: String,
        variant: String,
        entry: &ResponseEntry,
        now: i64,
    ) {
        let Some(raw) = encode(entry) else {
            return;
        };
        let ttl = entry.store_ttl_at(now);
        let records = Arc::clone(&self.records);

        settle(tokio::spawn(async move {
            records
                .replace_entry(&cache_key, &variant, raw, ttl)
                .await
                .map(|_| ())
                .map_err(|error| ("entry_replace", error))
        }))
        .await;
    }

    /// Delete cached pages for `url`: one variant, or every recorded one.
    pub async fn invalidate_url(
        &self,
        url: &str,
        variant: Option<&str>,
    ) -> Result<InvalidationReport, AdminError> {
        let cache_key = url_hash(&normalize_full_url(url)?);
        let report = self.records.invalidate(&cache_key, variant).await?;
        debug!(url, cache_key, ?variant, entries = report.entries_deleted, "invalidated page");
        Ok(report)
    }

    /// Mark `url` as never cached (or cacheable again).
    pub async fn set_cacheable(&self, url: &str, cacheable: bool) -> Result<(), AdminError> {
        let cache_key = url_hash(&normalize_full_url(url)?);
        self.records.set_cacheable(&cache_key, cacheable).await?;
        Ok(())
    }

    /// Queue an ephemeral instruction on a stored page.
    ///
    /// Returns `false` when no live entry exists for the page.
    pub async fn queue_instruction(
        &self,
        url: &str,
        variant: Option<&str>,
        instruction: InstructionRef,
    ) -> Result<bool, AdminError> {
        if !self.pipeline.knows_ephemeral(&instruction.name) {
            return Err(AdminError::UnknownInstruction(instruction.name));
        }
        let cache_key = url_hash(&normalize_full_url(url)?);
        let variant = variant.unwrap_or_default();
        let Some(mut entry) = self.lookup(&entry_key(&cache_key, variant)).await else {
            return Ok(false);
        };

        entry.instructions.push_back(instruction);
        let raw = entry
            .to_bytes()
            .map_err(|error| StoreError::Encode(error.to_string()))?;
        let queued = self
            .records
            .replace_entry(
                &cache_key,
                variant,
                Bytes::from(raw),
                entry.store_ttl_at(now_unix()),
            )
            .await?;
        Ok(queued)
    }
}

/// Assembles a [`CacheEngine`]; unset parts fall back to the configured defaults.
pub struct CacheEngineBuilder {
    config: CacheConfig,
    store: Arc<dyn Store>,
    chain: Option<PolicyChain>,
    pipeline: Option<InstructionPipeline>,
    rules: Option<ResponseRules>,
    maintenance: MaintenanceSwitch,
}

impl CacheEngineBuilder {
    pub fn chain(mut self, chain: PolicyChain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn pipeline(mut self, pipeline: InstructionPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn rules(mut self, rules: ResponseRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Share a maintenance switch; only the default chain reads it.
    pub fn maintenance(mut self, switch: MaintenanceSwitch) -> Self {
        self.maintenance = switch;
        self
    }

    pub fn build(self) -> CacheEngine {
        let chain = self
            .chain
            .unwrap_or_else(|| default_chain(&self.config, self.maintenance.clone()));
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| InstructionPipeline::with_defaults().build());
        let rules = self.rules.unwrap_or_else(|| default_rules(&self.config));
        let records = Arc::new(RecordBook::new(Arc::clone(&self.store), &self.config));

        CacheEngine {
            config: self.config,
            store: self.store,
            records,
            chain,
            pipeline,
            rules,
            maintenance: self.maintenance,
        }
    }
}

fn default_chain(config: &CacheConfig, maintenance: MaintenanceSwitch) -> PolicyChain {
    let builder = PolicyChain::with_defaults(config.session_cookie_prefixes.iter().cloned(), maintenance);
    if config.variant_query_params.is_empty() {
        builder.build()
    } else {
        builder
            .policy(QueryVariantPolicy::new(config.variant_query_params.iter().cloned()))
            .build()
    }
}

fn default_rules(config: &CacheConfig) -> ResponseRules {
    let rules = ResponseRules::default();
    if config.skip_set_cookie_responses {
        rules.with(SetCookieRule)
    } else {
        rules
    }
}

fn storable_headers(headers: &HeaderSet) -> HeaderSet {
    headers
        .iter()
        .filter(|(name, _)| !UNSTORED_HEADERS.contains(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn encode(entry: &ResponseEntry) -> Option<Bytes> {
    match entry.to_bytes() {
        Ok(raw) => Some(Bytes::from(raw)),
        Err(error) => {
            store_failed("entry_encode", &StoreError::Encode(error.to_string()));
            None
        }
    }
}

async fn settle(task: JoinHandle<Result<(), (&'static str, StoreError)>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err((op, error))) => store_failed(op, &error),
        Err(error) => warn!(error = %error, "cache write task failed"),
    }
}

fn store_failed(op: &'static str, error: &StoreError) {
    counter!(METRIC_STORE_ERROR).increment(1);
    warn!(op, error = %error, "page cache store call failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::origin::FnOrigin;
    use crate::cache::store::MemoryStore;

    fn engine(config: CacheConfig) -> CacheEngine {
        CacheEngine::builder(config, Arc::new(MemoryStore::default())).build()
    }

    fn get(path: &str) -> RequestContext {
        RequestContext::builder(Method::GET, "example.com", path).build()
    }

    #[test]
    fn outcome_header_values() {
        assert_eq!(CacheOutcome::Hit.header_value().as_deref(), Some("HIT"));
        assert_eq!(
            CacheOutcome::Override { policy: "maintenance" }
                .header_value()
                .as_deref(),
            Some("MAINTENANCE")
        );
        assert_eq!(CacheOutcome::Skipped { reason: "method" }.header_value(), None);
    }

    #[test]
    fn protocol_exclusions() {
        let engine = engine(CacheConfig::default());

        assert_eq!(engine.exclusion(&get("/page")), None);
        assert_eq!(
            engine.exclusion(&RequestContext::builder(Method::HEAD, "example.com", "/").build()),
            None
        );
        assert_eq!(
            engine.exclusion(&RequestContext::builder(Method::POST, "example.com", "/").build()),
            Some("method")
        );
        assert_eq!(engine.exclusion(&get("/wp-admin/edit.php")), Some("path"));
        let authorized = RequestContext::builder(Method::GET, "example.com", "/")
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .build();
        assert_eq!(engine.exclusion(&authorized), Some("authorization"));
    }

    #[test]
    fn disabled_cache_excludes_everything() {
        let engine = engine(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert_eq!(engine.exclusion(&get("/")), Some("disabled"));
    }

    #[test]
    fn query_policy_joins_default_chain_when_configured() {
        let engine = engine(CacheConfig {
            variant_query_params: vec!["page".to_string()],
            ..CacheConfig::default()
        });
        assert_eq!(engine.chain().names(), vec!["session", "maintenance", "query"]);
    }

    #[test]
    fn unstored_headers_are_dropped() {
        let headers: HeaderSet = [
            ("Content-Type", "text/html"),
            ("Content-Length", "12"),
            ("Set-Cookie", "sid=1"),
        ]
        .into_iter()
        .collect();

        let stored = storable_headers(&headers);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.get("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn origin_timeout_is_served_as_gateway_timeout() {
        let engine = engine(CacheConfig {
            origin_timeout_ms: 10,
            ..CacheConfig::default()
        });
        let origin = FnOrigin::new(|_ctx: RequestContext| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(OriginResponse::ok("late"))
        });

        let served = engine.handle(&get("/slow"), &origin).await;

        assert_eq!(served.status, 504);
        assert_eq!(served.outcome, CacheOutcome::OriginTimeout);
        assert_eq!(served.headers.get("x-pagefront-cache"), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn head_miss_is_not_stored() {
        let engine = engine(CacheConfig::default());
        let origin = FnOrigin::new(|_ctx: RequestContext| async { Ok(OriginResponse::ok("")) });
        let head = RequestContext::builder(Method::HEAD, "example.com", "/page").build();

        let served = engine.handle(&head, &origin).await;
        assert_eq!(served.outcome, CacheOutcome::Uncached { reason: "head" });

        let served = engine.handle(&get("/page"), &origin).await;
        assert_eq!(served.outcome, CacheOutcome::Miss);
    }
}
