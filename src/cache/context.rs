//! Normalized, read-only view of an incoming request.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use axum::http::{Method, request::Parts};
use url::{Url, form_urlencoded};

use super::config::CacheConfig;
use super::entry::HeaderSet;

/// How raw request data is interpreted when building a [`RequestContext`].
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub default_scheme: String,
    pub trust_forwarded_headers: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for ContextOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default_scheme: config.default_scheme.clone(),
            trust_forwarded_headers: config.trust_forwarded_headers,
        }
    }
}

/// Request fields the cache consults, built once at request entry.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: BTreeMap<String, String>,
    raw_query: Option<String>,
    cookies: BTreeMap<String, String>,
    headers: HeaderSet,
    client_ip: Option<IpAddr>,
    full_url: String,
}

impl RequestContext {
    pub fn builder(method: Method, host: &str, path: &str) -> RequestContextBuilder {
        RequestContextBuilder::new(method, host, path)
    }

    /// Build a context from HTTP request parts.
    pub fn from_parts(parts: &Parts, remote: Option<SocketAddr>, options: &ContextOptions) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
        };

        let host = header("host")
            .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
            .unwrap_or("localhost");

        let mut builder = RequestContextBuilder::new(parts.method.clone(), host, parts.uri.path())
            .scheme(parts.uri.scheme_str().unwrap_or(&options.default_scheme));

        if let Some(query) = parts.uri.query() {
            builder = builder.query_string(query);
        }

        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                builder = builder.header(name.as_str(), value);
            }
        }

        let mut client_ip = remote.map(|addr| addr.ip());
        if options.trust_forwarded_headers {
            if let Some(proto) = header("x-forwarded-proto") {
                let proto = proto.trim().to_ascii_lowercase();
                if proto == "http" || proto == "https" {
                    builder = builder.scheme(&proto);
                }
            }
            if let Some(forwarded) = header("x-forwarded-for") {
                client_ip = forwarded.split(',').next().and_then(parse_ip);
            }
        }
        builder.client_ip(client_ip).build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The query string as received, for forwarding to the origin.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent")
    }

    /// `scheme://host/path`, never including the query string.
    pub fn full_url(&self) -> &str {
        &self.full_url
    }

    pub fn has_basic_auth(&self) -> bool {
        self.headers
            .get("authorization")
            .and_then(|value| value.get(..6))
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic "))
    }
}

/// Incremental constructor for [`RequestContext`].
#[derive(Debug, Clone)]
pub struct RequestContextBuilder {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: BTreeMap<String, String>,
    raw_query: Option<String>,
    cookies: BTreeMap<String, String>,
    headers: HeaderSet,
    client_ip: Option<IpAddr>,
}

impl RequestContextBuilder {
    fn new(method: Method, host: &str, path: &str) -> Self {
        Self {
            method,
            scheme: "http".to_string(),
            host: normalize_host(host),
            path: normalize_path(path),
            query: BTreeMap::new(),
            raw_query: None,
            cookies: BTreeMap::new(),
            headers: HeaderSet::new(),
            client_ip: None,
        }
    }

    pub fn scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.trim().to_ascii_lowercase();
        self
    }

    /// Parse a raw `a=1&b=2` query; repeated names keep the last value.
    pub fn query_string(mut self, raw: &str) -> Self {
        self.query
            .extend(form_urlencoded::parse(raw.as_bytes()).into_owned());
        if !raw.is_empty() {
            self.raw_query = Some(match self.raw_query.take() {
                Some(existing) => format!("{existing}&{raw}"),
                None => raw.to_string(),
            });
        }
        self
    }

    /// Record a header; `Cookie` headers also populate the cookie map.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if name.eq_ignore_ascii_case("cookie") {
            self.cookies.extend(parse_cookies(value));
            let merged = match self.headers.get("cookie") {
                Some(existing) => format!("{existing}; {value}"),
                None => value.to_string(),
            };
            self.headers.insert("cookie", merged);
        } else if !self.headers.contains(name) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn build(self) -> RequestContext {
        let full_url = format!("{}://{}{}", self.scheme, self.host, self.path);
        RequestContext {
            method: self.method,
            scheme: self.scheme,
            host: self.host,
            path: self.path,
            query: self.query,
            raw_query: self.raw_query,
            cookies: self.cookies,
            headers: self.headers,
            client_ip: self.client_ip,
            full_url,
        }
    }
}

/// Reduce an absolute URL to the `scheme://host/path` form used for cache keys.
pub fn normalize_full_url(raw: &str) -> Result<String, url::ParseError> {
    let url = Url::parse(raw.trim())?;
    let host = url.host_str().ok_or(url::ParseError::EmptyHost)?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!(
        "{}://{}{}",
        url.scheme(),
        normalize_host(&host),
        normalize_path(url.path())
    ))
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn parse_cookies(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = name.trim();
        (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
    })
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}
