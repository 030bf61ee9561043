//! Pagefront page cache.
//!
//! A request flows through the [`PolicyChain`], which either vetoes caching,
//! overrides the response, or yields a variant key. The [`CacheEngine`] then
//! serves the stored [`ResponseEntry`] for `hash(url) [+ "-" + variant]` or
//! asks the [`Origin`] for a fresh one. Serve-time [`Instruction`]s rewrite
//! bodies without invalidating what is stored.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! store_capacity = 2000
//! default_ttl_seconds = 0
//! # ... see config.rs for all options
//! ```

mod config;
mod context;
mod engine;
mod entry;
mod instruction;
mod keys;
mod lock;
mod middleware;
mod origin;
mod policy;
mod records;
mod rules;
mod store;

pub use config::{CacheConfig, DEFAULT_EXCLUDED_PATH_PREFIXES, DEFAULT_SESSION_COOKIE_PREFIXES};
pub use context::{ContextOptions, RequestContext, RequestContextBuilder, normalize_full_url};
pub use engine::{AdminError, CacheEngine, CacheEngineBuilder, CacheOutcome, ServedResponse};
pub use entry::{
    HeaderSet, InstructionRef, NEVER_EXPIRES, OriginRecord, ResponseEntry, http_date, max_age_for,
    now_unix,
};
pub use instruction::{
    AppendText, Drained, Instruction, InstructionError, InstructionKind, InstructionPipeline,
    InstructionPipelineBuilder, ReplacePlaceholder, RequestNonce,
};
pub use keys::{entry_key, url_hash, variant_key};
pub use middleware::{CacheState, page_cache_layer};
pub use origin::{FnOrigin, Origin, OriginError, OriginResponse};
pub use policy::{
    ChainResult, MaintenancePage, MaintenancePolicy, MaintenanceSwitch, Policy, PolicyChain,
    PolicyChainBuilder, PolicyError, PolicyOutcome, QueryVariantPolicy, SessionPolicy,
};
pub use records::{InvalidationReport, RecordBook};
pub use rules::{ResponseRule, ResponseRules, ServerErrorRule, SetCookieRule};
pub use store::{MemoryStore, Store, StoreError};
