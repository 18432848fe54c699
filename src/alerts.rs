use std::sync::Arc;

use log::{debug, warn};

use crate::db::Store;
use crate::error::Result;
use crate::threat::index::ThreatIndex;

/// Single entry point for alert rows. Every caller goes through `emit`,
/// which re-checks the whitelist right before the insert so an entry added
/// mid-pipeline still suppresses the alert.
#[derive(Clone)]
pub struct AlertWriter {
    store: Arc<dyn Store>,
    index: Arc<ThreatIndex>,
}

impl AlertWriter {
    pub fn new(store: Arc<dyn Store>, index: Arc<ThreatIndex>) -> Self {
        Self { store, index }
    }

    /// Returns whether a row was written; whitelisted indicators drop
    /// silently.
    pub fn emit(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        query_type: &str,
        source_ip: &str,
    ) -> Result<bool> {
        let snap = self.index.snapshot();
        let suppressed = match indicator_type {
            "ip" => ip.map(|i| snap.is_whitelisted_ip(i)).unwrap_or(true),
            _ => domain.map(|d| snap.is_whitelisted_domain(d)).unwrap_or(true),
        };
        if suppressed {
            debug!("alert suppressed by whitelist: {:?}/{:?}", domain, ip);
            return Ok(false);
        }

        self.store
            .append_alert(feed_name, indicator_type, domain, ip, query_type, source_ip)?;
        warn!(
            "threat alert: {indicator_type} match {} from {source_ip} (feed {feed_name})",
            domain.or(ip).unwrap_or("?")
        );
        Ok(true)
    }
}
