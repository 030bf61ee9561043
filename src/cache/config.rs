//! Page cache configuration.
//!
//! Controls the engine via the `[cache]` table of `pagefront.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_GROUP: &str = "pagefront";
const DEFAULT_RECORD_GROUP: &str = "pagefront-records";
const DEFAULT_STORE_CAPACITY: usize = 2_000;
const DEFAULT_NEVER_EXPIRES_MAX_AGE: u64 = 365 * 24 * 60 * 60;
const DEFAULT_OUTCOME_HEADER: &str = "x-pagefront-cache";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_ORIGIN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_SCHEME: &str = "http";

/// Cookie name prefixes that mark an authenticated session.
pub const DEFAULT_SESSION_COOKIE_PREFIXES: &[&str] = &[
    "wp_user",
    "wordpress_logged_in_",
    "wordpress_sec_",
    "wp-postpass_",
    "comment_author_",
];

/// Operational endpoints that are never cached.
pub const DEFAULT_EXCLUDED_PATH_PREFIXES: &[&str] = &[
    "/wp-admin/",
    "/wp-login.php",
    "/wp-cron.php",
    "/xmlrpc.php",
];

/// Page cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off every request goes straight to the origin.
    pub enabled: bool,
    /// Store namespace holding response entries.
    pub group: String,
    /// Store namespace holding origin records.
    pub record_group: String,
    /// Maximum values kept by the in-memory store.
    pub store_capacity: usize,
    /// Lifetime applied when the origin gives none; `0` keeps entries until invalidated.
    pub default_ttl_seconds: u64,
    /// `max-age` advertised for entries that never expire.
    pub never_expires_max_age: u64,
    /// Diagnostic response header carrying the cache outcome.
    pub outcome_header: String,
    pub session_cookie_prefixes: Vec<String>,
    pub excluded_path_prefixes: Vec<String>,
    /// Query parameters folded into the variant key; empty disables the policy.
    pub variant_query_params: Vec<String>,
    /// Refuse to cache origin responses that set cookies.
    pub skip_set_cookie_responses: bool,
    /// Honor `X-Forwarded-For` / `X-Forwarded-Proto`.
    pub trust_forwarded_headers: bool,
    /// Scheme assumed when neither the request URI nor a trusted proxy names one.
    pub default_scheme: String,
    pub store_timeout_ms: u64,
    pub origin_timeout_ms: u64,
    /// Largest origin body the middleware buffers for caching.
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_GROUP.to_string(),
            record_group: DEFAULT_RECORD_GROUP.to_string(),
            store_capacity: DEFAULT_STORE_CAPACITY,
            default_ttl_seconds: 0,
            never_expires_max_age: DEFAULT_NEVER_EXPIRES_MAX_AGE,
            outcome_header: DEFAULT_OUTCOME_HEADER.to_string(),
            session_cookie_prefixes: to_owned(DEFAULT_SESSION_COOKIE_PREFIXES),
            excluded_path_prefixes: to_owned(DEFAULT_EXCLUDED_PATH_PREFIXES),
            variant_query_params: Vec::new(),
            skip_set_cookie_responses: false,
            trust_forwarded_headers: false,
            default_scheme: DEFAULT_SCHEME.to_string(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            origin_timeout_ms: DEFAULT_ORIGIN_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

impl CacheConfig {
    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn store_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.store_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms)
    }

    /// Absolute expiry for an entry created at `now`, given an origin-supplied lifetime.
    pub fn expiry_for(&self, now: i64, origin_max_age: Option<u64>) -> i64 {
        let ttl = origin_max_age.unwrap_or(self.default_ttl_seconds);
        if origin_max_age.is_none() && ttl == 0 {
            return super::entry::NEVER_EXPIRES;
        }
        now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX))
    }
}
