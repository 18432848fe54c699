use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/* Capture pipeline records */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// One decoded L4 packet handed from capture to the flow aggregator.
#[derive(Debug, Clone)]
pub struct L4Record {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub size: u64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsEventType {
    Query,
    Response,
}

impl DnsEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsEventType::Query => "query",
            DnsEventType::Response => "response",
        }
    }
}

/// One DNS query or response as extracted from a captured frame.
/// `answers` keeps wire order: A/AAAA as plain addresses, everything else
/// encoded `"<QTYPE>:<data>"`.
#[derive(Debug, Clone)]
pub struct DnsEventRecord {
    pub event_type: DnsEventType,
    pub domain: String,
    pub query_type: String,
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub answers: Vec<String>,
    pub ts: DateTime<Utc>,
}

/* Flow aggregation */

/// Canonical flow identity. For normal flows the client is always the LAN
/// side; the same connection seen from either direction maps here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: IpAddr,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone)]
pub struct FlowStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packet_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub is_abnormal: bool,
}

/* Store rows */

#[derive(Debug, Clone, Serialize)]
pub struct DnsLookupRow {
    pub id: i64,
    pub domain: String,
    pub query_type: String,
    pub resolved_ips: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsEventRow {
    pub id: i64,
    pub event_type: String,
    pub domain: String,
    pub query_type: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub resolved_ips: Vec<String>,
    pub event_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficFlowRow {
    pub id: i64,
    pub client_ip: String,
    pub server_ip: String,
    pub server_port: u16,
    pub protocol: String,
    pub domain: Option<String>,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub packet_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub is_orphaned: bool,
    pub is_abnormal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatIndicator {
    pub feed_name: String,
    pub indicator_type: String,
    pub domain: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatFeedMeta {
    pub id: i64,
    pub feed_name: String,
    pub source_url: String,
    pub enabled: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub indicator_count: i64,
    pub last_error: Option<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatAlertRow {
    pub id: i64,
    pub feed_name: String,
    pub indicator_type: String,
    pub domain: Option<String>,
    pub ip: Option<String>,
    pub query_type: String,
    pub source_ip: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhitelistEntry {
    pub id: i64,
    pub indicator_type: String,
    pub domain: Option<String>,
    pub ip: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/* Aggregates */

#[derive(Debug, Clone, Serialize)]
pub struct OrphanedIpAggregate {
    pub destination_ip: String,
    pub total_bytes_sent: i64,
    pub total_bytes_received: i64,
    pub total_bytes: i64,
    pub total_packets: i64,
    pub connection_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopDomainAggregate {
    pub domain: String,
    pub flow_count: i64,
    pub total_bytes: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub total_packets: i64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub dns_queries: i64,
    pub total_bytes: i64,
    pub flow_count: i64,
    pub active_connections: i64,
    pub period_hours: i64,
    pub dropped_dns_events: u64,
    pub dropped_l4_records: u64,
    pub dropped_whois_jobs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RescanSummary {
    pub events_scanned: u64,
    pub domains_checked: u64,
    pub ips_checked: u64,
    pub alerts_created: u64,
    pub lookback_days: i64,
}
