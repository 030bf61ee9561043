//! Pagefront: a full-page HTTP response cache and caching reverse proxy.

pub mod cache;
pub mod config;
pub mod infra;
