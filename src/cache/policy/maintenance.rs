use std::sync::{Arc, RwLock};

use super::{Policy, PolicyError, PolicyOutcome};
use crate::cache::context::RequestContext;
use crate::cache::entry::ResponseEntry;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::policy::maintenance";
const DEFAULT_MAINTENANCE_STATUS: u16 = 503;

/// The response served to every visitor while maintenance is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenancePage {
    pub body: String,
    pub status: u16,
    pub retry_after_seconds: Option<u64>,
}

impl MaintenancePage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: DEFAULT_MAINTENANCE_STATUS,
            retry_after_seconds: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    fn to_entry(&self) -> ResponseEntry {
        let mut entry = ResponseEntry::new(self.body.clone())
            .with_status(self.status)
            .with_header("cache-control", "no-cache")
            .with_header("content-type", "text/html; charset=utf-8");
        if let Some(seconds) = self.retry_after_seconds {
            entry = entry.with_header("retry-after", seconds.to_string());
        }
        entry
    }
}

/// Shared on/off switch for the maintenance override.
///
/// Cloned into the policy at startup and into the admin surface that flips it.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceSwitch {
    page: Arc<RwLock<Option<MaintenancePage>>>,
}

impl MaintenanceSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, page: MaintenancePage) {
        *rw_write(&self.page, SOURCE, "enable") = Some(page);
    }

    pub fn disable(&self) {
        *rw_write(&self.page, SOURCE, "disable") = None;
    }

    pub fn current(&self) -> Option<MaintenancePage> {
        rw_read(&self.page, SOURCE, "current").clone()
    }

    pub fn is_active(&self) -> bool {
        rw_read(&self.page, SOURCE, "is_active").is_some()
    }
}

/// Overrides every URL with the maintenance page while the switch is on.
#[derive(Debug, Clone)]
pub struct MaintenancePolicy {
    switch: MaintenanceSwitch,
}

impl MaintenancePolicy {
    pub fn new(switch: MaintenanceSwitch) -> Self {
        Self { switch }
    }
}

impl Policy for MaintenancePolicy {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn evaluate(&self, _ctx: &RequestContext) -> Result<PolicyOutcome, PolicyError> {
        Ok(match self.switch.current() {
            Some(page) => PolicyOutcome::Override(Box::new(page.to_entry())),
            None => PolicyOutcome::pass(),
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;

    #[test]
    fn passes_while_switch_is_off() {
        let policy = MaintenancePolicy::new(MaintenanceSwitch::new());
        let ctx = RequestContext::builder(Method::GET, "host", "/").build();
        assert_eq!(policy.evaluate(&ctx).expect("evaluates"), PolicyOutcome::pass());
    }

    #[test]
    fn overrides_every_url_while_on() {
        let switch = MaintenanceSwitch::new();
        let policy = MaintenancePolicy::new(switch.clone());
        switch.enable(MaintenancePage::new("back soon").with_retry_after(120));

        for path in ["/", "/a", "/deep/path"] {
            let ctx = RequestContext::builder(Method::GET, "host", path).build();
            match policy.evaluate(&ctx).expect("evaluates") {
                PolicyOutcome::Override(entry) => {
                    assert_eq!(entry.body, "back soon");
                    assert_eq!(entry.status, 503);
                    assert_eq!(entry.headers.get("Cache-Control"), Some("no-cache"));
                    assert_eq!(entry.headers.get("Retry-After"), Some("120"));
                }
                other => panic!("expected override, got {other:?}"),
            }
        }

        switch.disable();
        assert!(!switch.is_active());
    }
}
