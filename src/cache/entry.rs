//! Stored artifacts: the cached response body and the per-URL origin record.
//!
//! Both are persisted as JSON. The response field names (`headers`, `body`,
//! `expiry`, `instructions`, `lastmodified`) are a stable wire contract shared
//! with every node reading the same store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use super::keys::entry_key;

/// `expiry` value meaning the entry never expires on its own.
pub const NEVER_EXPIRES: i64 = 0;

const DEFAULT_STATUS: u16 = 200;

const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Current Unix time in seconds.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `Cache-Control` max-age for an entry expiring at `expiry`.
pub fn max_age_for(expiry: i64, now: i64, never_max_age: u64) -> u64 {
    if expiry == NEVER_EXPIRES {
        never_max_age
    } else {
        u64::try_from(expiry.saturating_sub(now)).unwrap_or(0)
    }
}

/// Format a Unix timestamp as an IMF-fixdate HTTP date.
pub fn http_date(unix: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()?
        .format(HTTP_DATE)
        .ok()
}

/// Response headers with case-insensitive, unique names.
///
/// Names are folded to lowercase on insertion so lookups and persisted JSON
/// agree regardless of how the origin spelled them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct HeaderSet(BTreeMap<String, String>);

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header, returning the previous value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0
            .insert(name.as_ref().trim().to_ascii_lowercase(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for HeaderSet {
    fn from(raw: BTreeMap<String, String>) -> Self {
        raw.into_iter().collect()
    }
}

impl From<HeaderSet> for BTreeMap<String, String> {
    fn from(headers: HeaderSet) -> Self {
        headers.0
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderSet
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A queued reference to a registered ephemeral instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

impl InstructionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// A cached, servable response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEntry {
    #[serde(default)]
    pub headers: HeaderSet,
    pub body: String,
    /// Unix seconds; [`NEVER_EXPIRES`] disables expiry.
    #[serde(default)]
    pub expiry: i64,
    /// Pending ephemeral instructions, applied front to back.
    #[serde(default)]
    pub instructions: VecDeque<InstructionRef>,
    #[serde(default, rename = "lastmodified")]
    pub last_modified: i64,
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    DEFAULT_STATUS
}

impl ResponseEntry {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            headers: HeaderSet::new(),
            body: body.into(),
            expiry: NEVER_EXPIRES,
            instructions: VecDeque::new(),
            last_modified: now_unix(),
            status: DEFAULT_STATUS,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = expiry;
        self
    }

    /// Queue an ephemeral instruction behind any already pending.
    pub fn with_instruction(mut self, instruction: InstructionRef) -> Self {
        self.instructions.push_back(instruction);
        self
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(now_unix())
    }

    pub fn has_expired_at(&self, now: i64) -> bool {
        self.expiry != NEVER_EXPIRES && self.expiry <= now
    }

    /// Seconds a downstream cache may keep this entry.
    ///
    /// Entries that never expire report `never_max_age` rather than an
    /// unbounded value.
    pub fn max_age_at(&self, now: i64, never_max_age: u64) -> u64 {
        max_age_for(self.expiry, now, never_max_age)
    }

    /// Remaining lifetime to hand to the store, if the entry expires at all.
    pub fn store_ttl_at(&self, now: i64) -> Option<std::time::Duration> {
        (self.expiry != NEVER_EXPIRES)
            .then(|| std::time::Duration::from_secs(self.max_age_at(now, 0)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// Per-URL bookkeeping kept apart from the response bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginRecord {
    pub cache_key: String,
    #[serde(default = "default_cacheable")]
    pub is_cacheable: bool,
    #[serde(default)]
    pub expiry_hint: i64,
    /// Every variant key ever stored for this URL; `""` is the canonical entry.
    #[serde(default)]
    pub known_variants: BTreeSet<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

fn default_cacheable() -> bool {
    true
}

impl OriginRecord {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            is_cacheable: true,
            expiry_hint: NEVER_EXPIRES,
            known_variants: BTreeSet::new(),
            data: Map::new(),
        }
    }

    pub fn knows(&self, variant_key: &str) -> bool {
        self.known_variants.contains(variant_key)
    }

    /// Record a variant; returns `true` if it was not known before.
    pub fn remember(&mut self, variant_key: &str) -> bool {
        self.known_variants.insert(variant_key.to_string())
    }

    pub fn forget(&mut self, variant_key: &str) -> bool {
        self.known_variants.remove(variant_key)
    }

    /// Store keys of every known variant of this URL.
    pub fn entry_keys(&self) -> Vec<String> {
        self.known_variants
            .iter()
            .map(|variant| entry_key(&self.cache_key, variant))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
