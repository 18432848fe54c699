pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    DashboardStats, DnsEventRecord, DnsEventRow, DnsLookupRow, FlowKey, FlowStats,
    OrphanedIpAggregate, ThreatAlertRow, ThreatFeedMeta, ThreatIndicator, TopDomainAggregate,
    TrafficFlowRow, User, WhitelistEntry,
};

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Default)]
pub struct DnsEventFilter {
    pub limit: i64,
    pub since: Option<DateTime<Utc>>,
    pub source_ip: Option<String>,
    pub domain: Option<String>,
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub limit: i64,
    pub since: Option<DateTime<Utc>>,
    pub resolved: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub hashed_password: Option<String>,
    pub is_admin: Option<bool>,
    pub is_active: Option<bool>,
}

/// Persistence operations the engine is written against. One implementation
/// (SQLite) lives in this module; components receive the store as an
/// explicit `Arc<dyn Store>` at construction.
pub trait Store: Send + Sync {
    /* DNS lookups */

    /// Upsert the `(domain, qtype)` summary row: replace `resolved_ips`,
    /// advance `last_seen`, never touch an existing `first_seen`.
    fn upsert_dns_lookup(
        &self,
        domain: &str,
        query_type: &str,
        resolved_ips: &[String],
        ts: DateTime<Utc>,
    ) -> Result<()>;

    fn dns_lookup_by_domain(&self, domain: &str) -> Result<Option<DnsLookupRow>>;

    /// Most recent lookup whose answer set contains `ip`, bounded below by
    /// `since` on `last_seen` and above by `upper_bound_first_seen` on
    /// `first_seen` when given. Ties go to the most recent `first_seen`.
    fn lookup_domain_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        upper_bound_first_seen: Option<DateTime<Utc>>,
    ) -> Result<Option<String>>;

    fn dns_lookups_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<DnsLookupRow>, i64)>;

    fn search_domains(&self, query: &str, limit: i64) -> Result<Vec<DnsLookupRow>>;

    fn recent_dns_lookups(
        &self,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DnsLookupRow>>;

    /* DNS events */

    fn append_dns_event(&self, event: &DnsEventRecord) -> Result<()>;

    fn dns_events(&self, filter: &DnsEventFilter) -> Result<Vec<DnsEventRow>>;

    /* Traffic flows */

    /// Delta-upsert on the canonical key: counters summed, `first_seen`
    /// min'd, `last_update` advanced, domain sticky via COALESCE,
    /// `is_orphaned` recomputed from the post-coalesce domain and
    /// `is_abnormal` latched.
    fn upsert_flow(&self, key: &FlowKey, stats: &FlowStats, domain: Option<&str>) -> Result<()>;

    fn traffic_by_domain(
        &self,
        domain: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrafficFlowRow>>;

    fn top_domains(
        &self,
        limit: i64,
        offset: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TopDomainAggregate>>;

    fn top_domains_count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<i64>;

    fn orphaned_aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrphanedIpAggregate>>;

    /* Threat indicators */

    /// Replace every indicator of `feed_name` with the given sets, in one
    /// transaction: readers see the full old set or the full new set.
    fn replace_feed_indicators(
        &self,
        feed_name: &str,
        domains: &[String],
        ips: &[String],
    ) -> Result<i64>;

    fn all_indicators(&self) -> Result<Vec<ThreatIndicator>>;

    fn add_custom_indicator(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
    ) -> Result<i64>;

    fn remove_custom_indicator(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
    ) -> Result<bool>;

    fn feed_indicators(
        &self,
        feed_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ThreatIndicator>>;

    /* Threat feed metadata */

    #[allow(clippy::too_many_arguments)]
    fn upsert_feed_meta(
        &self,
        feed_name: &str,
        source_url: &str,
        enabled: bool,
        last_update: Option<DateTime<Utc>>,
        indicator_count: i64,
        last_error: Option<&str>,
        config: Option<&serde_json::Value>,
    ) -> Result<()>;

    fn feed_meta(&self, feed_name: &str) -> Result<Option<ThreatFeedMeta>>;

    fn list_feeds(&self) -> Result<Vec<ThreatFeedMeta>>;

    fn set_feed_enabled(&self, feed_name: &str, enabled: bool) -> Result<bool>;

    /// Drop a feed's metadata row and all of its indicators.
    fn delete_feed(&self, feed_name: &str) -> Result<bool>;

    /* Threat alerts */

    fn append_alert(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        query_type: &str,
        source_ip: &str,
    ) -> Result<i64>;

    fn alerts(&self, filter: &AlertFilter) -> Result<Vec<ThreatAlertRow>>;

    fn alerts_count(&self, since: Option<DateTime<Utc>>, resolved: Option<bool>) -> Result<i64>;

    fn resolve_alert(&self, alert_id: i64) -> Result<bool>;

    fn resolve_alerts_batch(&self, alert_ids: &[i64]) -> Result<i64>;

    /// Resolve all open alerts whose domain or ip matches; used when an
    /// indicator gets whitelisted.
    fn resolve_alerts_by_indicator(&self, domain: Option<&str>, ip: Option<&str>) -> Result<i64>;

    /// `(normalized indicator, feed_name, indicator_type)` of every existing
    /// alert row; the rescan dedup guard.
    fn alert_keys(&self) -> Result<Vec<(String, String, String)>>;

    /* Whitelist */

    /// Add an entry; on a duplicate indicator the existing row is returned
    /// unchanged. The flag reports whether a new row was created.
    fn add_whitelist(
        &self,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(WhitelistEntry, bool)>;

    fn remove_whitelist(&self, id: i64) -> Result<bool>;

    fn list_whitelist(
        &self,
        limit: i64,
        indicator_type: Option<&str>,
    ) -> Result<Vec<WhitelistEntry>>;

    /* Users */

    fn create_user(
        &self,
        username: &str,
        email: &str,
        hashed_password: &str,
        is_admin: bool,
    ) -> Result<i64>;

    fn user_by_username(&self, username: &str) -> Result<Option<User>>;

    fn user_by_id(&self, id: i64) -> Result<Option<User>>;

    fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>>;

    fn update_user(&self, id: i64, update: &UserUpdate) -> Result<bool>;

    fn delete_user(&self, id: i64) -> Result<bool>;

    fn count_users(&self) -> Result<i64>;

    /* WHOIS cache */

    fn save_whois(&self, domain: &str, data: &serde_json::Value) -> Result<()>;

    fn whois_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<(serde_json::Value, DateTime<Utc>)>>;

    /* Settings */

    fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>>;

    fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /* Dashboard */

    fn dashboard_stats(&self, hours: i64) -> Result<DashboardStats>;
}
