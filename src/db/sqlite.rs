use chrono::{DateTime, Utc};
use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};

use super::{AlertFilter, DnsEventFilter, Store, UserUpdate};
use crate::error::{Error, Result};
use crate::model::{
    DashboardStats, DnsEventRecord, DnsEventRow, DnsLookupRow, FlowKey, FlowStats,
    OrphanedIpAggregate, ThreatAlertRow, ThreatFeedMeta, ThreatIndicator, TopDomainAggregate,
    TrafficFlowRow, User, WhitelistEntry,
};

/// SQLite-backed store. WAL journal, one pool shared by every task; the
/// schema is created on construction and startup fails if that fails.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager)?;
        let store = Self { pool };
        store.migrate()?;
        info!("sqlite store ready at {path}");
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dns_lookups(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              domain TEXT NOT NULL,
              query_type TEXT NOT NULL,
              resolved_ips TEXT NOT NULL,
              first_seen TIMESTAMP NOT NULL,
              last_seen TIMESTAMP NOT NULL,
              UNIQUE(domain, query_type)
            );
            CREATE INDEX IF NOT EXISTS idx_dns_domain ON dns_lookups(domain);
            CREATE INDEX IF NOT EXISTS idx_dns_last_seen ON dns_lookups(last_seen);
            CREATE INDEX IF NOT EXISTS idx_dns_first_seen ON dns_lookups(first_seen);

            CREATE TABLE IF NOT EXISTS dns_events(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_type TEXT NOT NULL,
              domain TEXT NOT NULL,
              query_type TEXT NOT NULL,
              source_ip TEXT NOT NULL,
              destination_ip TEXT NOT NULL,
              resolved_ips TEXT,
              event_timestamp TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dnsevents_time ON dns_events(event_timestamp);
            CREATE INDEX IF NOT EXISTS idx_dnsevents_domain ON dns_events(domain);
            CREATE INDEX IF NOT EXISTS idx_dnsevents_src ON dns_events(source_ip);

            CREATE TABLE IF NOT EXISTS traffic_flows(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              client_ip TEXT NOT NULL,
              server_ip TEXT NOT NULL,
              server_port INTEGER NOT NULL,
              protocol TEXT NOT NULL,
              domain TEXT,
              bytes_sent INTEGER NOT NULL DEFAULT 0,
              bytes_received INTEGER NOT NULL DEFAULT 0,
              packet_count INTEGER NOT NULL DEFAULT 0,
              first_seen TIMESTAMP NOT NULL,
              last_update TIMESTAMP NOT NULL,
              is_orphaned INTEGER NOT NULL DEFAULT 0,
              is_abnormal INTEGER NOT NULL DEFAULT 0,
              UNIQUE(client_ip, server_ip, server_port, protocol)
            );
            CREATE INDEX IF NOT EXISTS idx_flow_server ON traffic_flows(server_ip);
            CREATE INDEX IF NOT EXISTS idx_flow_domain ON traffic_flows(domain);
            CREATE INDEX IF NOT EXISTS idx_flow_orphaned ON traffic_flows(is_orphaned);
            CREATE INDEX IF NOT EXISTS idx_flow_last_update ON traffic_flows(last_update);

            CREATE TABLE IF NOT EXISTS threat_feeds(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              feed_name TEXT NOT NULL UNIQUE,
              source_url TEXT NOT NULL,
              enabled INTEGER NOT NULL DEFAULT 1,
              last_update TIMESTAMP,
              indicator_count INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              config TEXT
            );

            CREATE TABLE IF NOT EXISTS threat_indicators(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              feed_name TEXT NOT NULL,
              indicator_type TEXT NOT NULL,
              domain TEXT,
              ip TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_threat_ind_unique
              ON threat_indicators(feed_name, indicator_type, COALESCE(domain, ''), COALESCE(ip, ''));
            CREATE INDEX IF NOT EXISTS idx_threat_ind_domain ON threat_indicators(domain);
            CREATE INDEX IF NOT EXISTS idx_threat_ind_ip ON threat_indicators(ip);

            CREATE TABLE IF NOT EXISTS threat_alerts(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              feed_name TEXT NOT NULL,
              indicator_type TEXT NOT NULL,
              domain TEXT,
              ip TEXT,
              query_type TEXT NOT NULL,
              source_ip TEXT NOT NULL,
              resolved INTEGER NOT NULL DEFAULT 0,
              resolved_at TIMESTAMP,
              created_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_resolved ON threat_alerts(resolved);
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON threat_alerts(created_at);
            CREATE INDEX IF NOT EXISTS idx_alerts_domain ON threat_alerts(domain);
            CREATE INDEX IF NOT EXISTS idx_alerts_ip ON threat_alerts(ip);

            CREATE TABLE IF NOT EXISTS threat_whitelist(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              indicator_type TEXT NOT NULL,
              domain TEXT,
              ip TEXT,
              reason TEXT,
              created_at TIMESTAMP NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_whitelist_unique
              ON threat_whitelist(indicator_type, COALESCE(domain, ''), COALESCE(ip, ''));

            CREATE TABLE IF NOT EXISTS users(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              email TEXT NOT NULL UNIQUE,
              hashed_password TEXT NOT NULL,
              is_admin INTEGER NOT NULL DEFAULT 0,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS whois_data(
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              domain TEXT NOT NULL UNIQUE,
              whois_data TEXT NOT NULL,
              whois_updated_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings(
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn ips_to_json(ips: &[String]) -> String {
    serde_json::to_string(ips).unwrap_or_else(|_| "[]".to_string())
}

fn ips_from_json(s: Option<String>) -> Vec<String> {
    s.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn map_lookup_row(row: &Row<'_>) -> rusqlite::Result<DnsLookupRow> {
    Ok(DnsLookupRow {
        id: row.get(0)?,
        domain: row.get(1)?,
        query_type: row.get(2)?,
        resolved_ips: ips_from_json(row.get(3)?),
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
    })
}

fn map_alert_row(row: &Row<'_>) -> rusqlite::Result<ThreatAlertRow> {
    Ok(ThreatAlertRow {
        id: row.get(0)?,
        feed_name: row.get(1)?,
        indicator_type: row.get(2)?,
        domain: row.get(3)?,
        ip: row.get(4)?,
        query_type: row.get(5)?,
        source_ip: row.get(6)?,
        resolved: row.get::<_, i64>(7)? != 0,
        resolved_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn map_user_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        hashed_password: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

const LOOKUP_COLS: &str = "id, domain, query_type, resolved_ips, first_seen, last_seen";
const ALERT_COLS: &str =
    "id, feed_name, indicator_type, domain, ip, query_type, source_ip, resolved, resolved_at, created_at";
const USER_COLS: &str = "id, username, email, hashed_password, is_admin, is_active, created_at";

impl Store for SqliteStore {
    fn upsert_dns_lookup(
        &self,
        domain: &str,
        query_type: &str,
        resolved_ips: &[String],
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dns_lookups(domain, query_type, resolved_ips, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(domain, query_type) DO UPDATE SET
               resolved_ips = excluded.resolved_ips,
               last_seen = MAX(last_seen, excluded.last_seen)",
            params![domain, query_type, ips_to_json(resolved_ips), ts],
        )?;
        Ok(())
    }

    fn dns_lookup_by_domain(&self, domain: &str) -> Result<Option<DnsLookupRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {LOOKUP_COLS} FROM dns_lookups
                     WHERE domain = ?1 ORDER BY last_seen DESC LIMIT 1"
                ),
                params![domain],
                map_lookup_row,
            )
            .optional()?;
        Ok(row)
    }

    fn lookup_domain_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        upper_bound_first_seen: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT domain FROM dns_lookups
                 WHERE last_seen >= ?1
                   AND (?3 IS NULL OR first_seen <= ?3)
                   AND EXISTS (SELECT 1 FROM json_each(dns_lookups.resolved_ips)
                               WHERE json_each.value = ?2)
                 ORDER BY last_seen DESC, first_seen DESC
                 LIMIT 1",
                params![since, ip, upper_bound_first_seen],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(row)
    }

    fn dns_lookups_by_ip(
        &self,
        ip: &str,
        since: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<DnsLookupRow>, i64)> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOOKUP_COLS} FROM dns_lookups
             WHERE last_seen >= ?1
               AND EXISTS (SELECT 1 FROM json_each(dns_lookups.resolved_ips)
                           WHERE json_each.value = ?2)
             ORDER BY last_seen DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt
            .query_map(params![since, ip, limit, offset], map_lookup_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM dns_lookups
             WHERE last_seen >= ?1
               AND EXISTS (SELECT 1 FROM json_each(dns_lookups.resolved_ips)
                           WHERE json_each.value = ?2)",
            params![since, ip],
            |row| row.get(0),
        )?;
        Ok((rows, total))
    }

    fn search_domains(&self, query: &str, limit: i64) -> Result<Vec<DnsLookupRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOOKUP_COLS} FROM dns_lookups
             WHERE domain LIKE ?1 ORDER BY last_seen DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![format!("%{query}%"), limit], map_lookup_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn recent_dns_lookups(
        &self,
        limit: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DnsLookupRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOOKUP_COLS} FROM dns_lookups
             WHERE (?1 IS NULL OR last_seen >= ?1)
             ORDER BY last_seen DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![since, limit], map_lookup_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn append_dns_event(&self, event: &DnsEventRecord) -> Result<()> {
        let conn = self.conn()?;
        let answers = if event.answers.is_empty() {
            None
        } else {
            Some(ips_to_json(&event.answers))
        };
        conn.execute(
            "INSERT INTO dns_events(event_type, domain, query_type, source_ip,
                                    destination_ip, resolved_ips, event_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_type.as_str(),
                event.domain,
                event.query_type,
                event.source_ip.to_string(),
                event.destination_ip.to_string(),
                answers,
                event.ts,
            ],
        )?;
        Ok(())
    }

    fn dns_events(&self, filter: &DnsEventFilter) -> Result<Vec<DnsEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, domain, query_type, source_ip, destination_ip,
                    resolved_ips, event_timestamp
             FROM dns_events
             WHERE (?1 IS NULL OR event_timestamp >= ?1)
               AND (?2 IS NULL OR source_ip = ?2)
               AND (?3 IS NULL OR domain = ?3)
               AND (?4 IS NULL OR event_type = ?4)
             ORDER BY event_timestamp DESC
             LIMIT ?5",
        )?;
        let rows = stmt
            .query_map(
                params![
                    filter.since,
                    filter.source_ip,
                    filter.domain,
                    filter.event_type,
                    filter.limit,
                ],
                |row| {
                    Ok(DnsEventRow {
                        id: row.get(0)?,
                        event_type: row.get(1)?,
                        domain: row.get(2)?,
                        query_type: row.get(3)?,
                        source_ip: row.get(4)?,
                        destination_ip: row.get(5)?,
                        resolved_ips: ips_from_json(row.get(6)?),
                        event_timestamp: row.get(7)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn upsert_flow(&self, key: &FlowKey, stats: &FlowStats, domain: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let is_orphaned = domain.is_none();
        conn.execute(
            "INSERT INTO traffic_flows(
               client_ip, server_ip, server_port, protocol, domain,
               bytes_sent, bytes_received, packet_count,
               first_seen, last_update, is_orphaned, is_abnormal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(client_ip, server_ip, server_port, protocol) DO UPDATE SET
               bytes_sent = bytes_sent + excluded.bytes_sent,
               bytes_received = bytes_received + excluded.bytes_received,
               packet_count = packet_count + excluded.packet_count,
               first_seen = MIN(first_seen, excluded.first_seen),
               last_update = excluded.last_update,
               domain = COALESCE(domain, excluded.domain),
               is_orphaned = CASE WHEN COALESCE(domain, excluded.domain) IS NULL
                             THEN 1 ELSE 0 END,
               is_abnormal = MAX(is_abnormal, excluded.is_abnormal)",
            params![
                key.client_ip.to_string(),
                key.server_ip.to_string(),
                key.server_port,
                key.protocol.as_str(),
                domain,
                stats.bytes_sent as i64,
                stats.bytes_received as i64,
                stats.packet_count as i64,
                stats.first_seen,
                stats.last_update,
                is_orphaned,
                stats.is_abnormal,
            ],
        )?;
        Ok(())
    }

    fn traffic_by_domain(
        &self,
        domain: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrafficFlowRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, client_ip, server_ip, server_port, protocol, domain,
                    bytes_sent, bytes_received, packet_count,
                    first_seen, last_update, is_orphaned, is_abnormal
             FROM traffic_flows
             WHERE domain = ?1
               AND (?2 IS NULL OR last_update >= ?2)
               AND (?3 IS NULL OR last_update <= ?3)
             ORDER BY last_update DESC",
        )?;
        let rows = stmt
            .query_map(params![domain, start, end], |row| {
                Ok(TrafficFlowRow {
                    id: row.get(0)?,
                    client_ip: row.get(1)?,
                    server_ip: row.get(2)?,
                    server_port: row.get(3)?,
                    protocol: row.get(4)?,
                    domain: row.get(5)?,
                    bytes_sent: row.get(6)?,
                    bytes_received: row.get(7)?,
                    packet_count: row.get(8)?,
                    first_seen: row.get(9)?,
                    last_update: row.get(10)?,
                    is_orphaned: row.get::<_, i64>(11)? != 0,
                    is_abnormal: row.get::<_, i64>(12)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn top_domains(
        &self,
        limit: i64,
        offset: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<TopDomainAggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT COALESCE(domain, server_ip) AS name,
                    COUNT(*) AS flow_count,
                    SUM(bytes_sent + bytes_received) AS total_bytes,
                    SUM(bytes_sent) AS bytes_sent,
                    SUM(bytes_received) AS bytes_received,
                    SUM(packet_count) AS total_packets,
                    MAX(last_update) AS last_seen
             FROM traffic_flows
             WHERE (?1 IS NULL OR last_update >= ?1)
               AND (?2 IS NULL OR last_update <= ?2)
             GROUP BY COALESCE(domain, server_ip)
             ORDER BY total_bytes DESC
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt
            .query_map(params![start, end, limit, offset], |row| {
                Ok(TopDomainAggregate {
                    domain: row.get(0)?,
                    flow_count: row.get(1)?,
                    total_bytes: row.get(2)?,
                    bytes_sent: row.get(3)?,
                    bytes_received: row.get(4)?,
                    total_packets: row.get(5)?,
                    last_seen: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn top_domains_count(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(DISTINCT COALESCE(domain, server_ip)) FROM traffic_flows
             WHERE (?1 IS NULL OR last_update >= ?1)
               AND (?2 IS NULL OR last_update <= ?2)",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn orphaned_aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrphanedIpAggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT server_ip,
                    SUM(bytes_sent) AS total_bytes_sent,
                    SUM(bytes_received) AS total_bytes_received,
                    SUM(bytes_sent + bytes_received) AS total_bytes,
                    SUM(packet_count) AS total_packets,
                    COUNT(*) AS connection_count,
                    MIN(first_seen) AS first_seen,
                    MAX(last_update) AS last_seen
             FROM traffic_flows
             WHERE is_orphaned = 1
               AND last_update >= ?1 AND last_update <= ?2
             GROUP BY server_ip
             ORDER BY total_bytes DESC",
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                Ok(OrphanedIpAggregate {
                    destination_ip: row.get(0)?,
                    total_bytes_sent: row.get(1)?,
                    total_bytes_received: row.get(2)?,
                    total_bytes: row.get(3)?,
                    total_packets: row.get(4)?,
                    connection_count: row.get(5)?,
                    first_seen: row.get(6)?,
                    last_seen: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn replace_feed_indicators(
        &self,
        feed_name: &str,
        domains: &[String],
        ips: &[String],
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM threat_indicators WHERE feed_name = ?1",
            params![feed_name],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO threat_indicators(feed_name, indicator_type, domain, ip)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for domain in domains {
                stmt.execute(params![
                    feed_name,
                    "domain",
                    domain.to_lowercase(),
                    Option::<String>::None
                ])?;
            }
            for ip in ips {
                stmt.execute(params![feed_name, "ip", Option::<String>::None, ip])?;
            }
        }
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM threat_indicators WHERE feed_name = ?1",
            params![feed_name],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }

    fn all_indicators(&self) -> Result<Vec<ThreatIndicator>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT feed_name, indicator_type, domain, ip FROM threat_indicators")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ThreatIndicator {
                    feed_name: row.get(0)?,
                    indicator_type: row.get(1)?,
                    domain: row.get(2)?,
                    ip: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn add_custom_indicator(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let domain = domain.map(|d| d.to_lowercase());
        let changed = conn.execute(
            "INSERT OR IGNORE INTO threat_indicators(feed_name, indicator_type, domain, ip)
             VALUES (?1, ?2, ?3, ?4)",
            params![feed_name, indicator_type, domain, ip],
        )?;
        if changed == 0 {
            return Err(Error::StoreConflict("indicator already present".into()));
        }
        Ok(conn.last_insert_rowid())
    }

    fn remove_custom_indicator(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let domain = domain.map(|d| d.to_lowercase());
        let changed = conn.execute(
            "DELETE FROM threat_indicators
             WHERE feed_name = ?1 AND indicator_type = ?2
               AND COALESCE(domain, '') = COALESCE(?3, '')
               AND COALESCE(ip, '') = COALESCE(?4, '')",
            params![feed_name, indicator_type, domain, ip],
        )?;
        Ok(changed > 0)
    }

    fn feed_indicators(
        &self,
        feed_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ThreatIndicator>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT feed_name, indicator_type, domain, ip FROM threat_indicators
             WHERE feed_name = ?1 ORDER BY indicator_type, domain, ip
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![feed_name, limit, offset], |row| {
                Ok(ThreatIndicator {
                    feed_name: row.get(0)?,
                    indicator_type: row.get(1)?,
                    domain: row.get(2)?,
                    ip: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn upsert_feed_meta(
        &self,
        feed_name: &str,
        source_url: &str,
        enabled: bool,
        last_update: Option<DateTime<Utc>>,
        indicator_count: i64,
        last_error: Option<&str>,
        config: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO threat_feeds(feed_name, source_url, enabled, last_update,
                                      indicator_count, last_error, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(feed_name) DO UPDATE SET
               source_url = excluded.source_url,
               enabled = excluded.enabled,
               last_update = excluded.last_update,
               indicator_count = excluded.indicator_count,
               last_error = excluded.last_error,
               config = excluded.config",
            params![
                feed_name,
                source_url,
                enabled,
                last_update,
                indicator_count,
                last_error,
                config.map(|c| c.to_string()),
            ],
        )?;
        Ok(())
    }

    fn feed_meta(&self, feed_name: &str) -> Result<Option<ThreatFeedMeta>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, feed_name, source_url, enabled, last_update,
                        indicator_count, last_error, config
                 FROM threat_feeds WHERE feed_name = ?1",
                params![feed_name],
                map_feed_row,
            )
            .optional()?;
        Ok(row)
    }

    fn list_feeds(&self) -> Result<Vec<ThreatFeedMeta>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, feed_name, source_url, enabled, last_update,
                    indicator_count, last_error, config
             FROM threat_feeds ORDER BY feed_name",
        )?;
        let rows = stmt
            .query_map([], map_feed_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn set_feed_enabled(&self, feed_name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE threat_feeds SET enabled = ?2 WHERE feed_name = ?1",
            params![feed_name, enabled],
        )?;
        Ok(changed > 0)
    }

    fn delete_feed(&self, feed_name: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM threat_indicators WHERE feed_name = ?1",
            params![feed_name],
        )?;
        let changed = tx.execute(
            "DELETE FROM threat_feeds WHERE feed_name = ?1",
            params![feed_name],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    fn append_alert(
        &self,
        feed_name: &str,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        query_type: &str,
        source_ip: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO threat_alerts(feed_name, indicator_type, domain, ip,
                                       query_type, source_ip, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                feed_name,
                indicator_type,
                domain.map(|d| d.to_lowercase()),
                ip,
                query_type,
                source_ip,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn alerts(&self, filter: &AlertFilter) -> Result<Vec<ThreatAlertRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM threat_alerts
             WHERE (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR resolved = ?2)
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![filter.since, filter.resolved, filter.limit], map_alert_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn alerts_count(&self, since: Option<DateTime<Utc>>, resolved: Option<bool>) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM threat_alerts
             WHERE (?1 IS NULL OR created_at >= ?1)
               AND (?2 IS NULL OR resolved = ?2)",
            params![since, resolved],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn resolve_alert(&self, alert_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE threat_alerts SET resolved = 1, resolved_at = ?2
             WHERE id = ?1 AND resolved = 0",
            params![alert_id, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    fn resolve_alerts_batch(&self, alert_ids: &[i64]) -> Result<i64> {
        if alert_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let placeholders = std::iter::repeat("?")
            .take(alert_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE threat_alerts SET resolved = 1, resolved_at = ?1
             WHERE resolved = 0 AND id IN ({placeholders})"
        );
        let now = Utc::now();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
        values.extend(alert_ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        let changed = conn.execute(&sql, values.as_slice())?;
        Ok(changed as i64)
    }

    fn resolve_alerts_by_indicator(&self, domain: Option<&str>, ip: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        let domain = domain.map(|d| d.to_lowercase());
        let changed = conn.execute(
            "UPDATE threat_alerts SET resolved = 1, resolved_at = ?3
             WHERE resolved = 0
               AND ((?1 IS NOT NULL AND domain = ?1) OR (?2 IS NOT NULL AND ip = ?2))",
            params![domain, ip, Utc::now()],
        )?;
        Ok(changed as i64)
    }

    fn alert_keys(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT domain, ip, feed_name, indicator_type FROM threat_alerts")?;
        let rows = stmt
            .query_map([], |row| {
                let domain: Option<String> = row.get(0)?;
                let ip: Option<String> = row.get(1)?;
                let feed: String = row.get(2)?;
                let itype: String = row.get(3)?;
                Ok((domain, ip, feed, itype))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut keys = Vec::with_capacity(rows.len());
        for (domain, ip, feed, itype) in rows {
            let indicator = match itype.as_str() {
                "ip" => ip.unwrap_or_default(),
                _ => domain.unwrap_or_default().to_lowercase(),
            };
            if !indicator.is_empty() {
                keys.push((indicator, feed, itype));
            }
        }
        Ok(keys)
    }

    fn add_whitelist(
        &self,
        indicator_type: &str,
        domain: Option<&str>,
        ip: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(WhitelistEntry, bool)> {
        let conn = self.conn()?;
        let domain = domain.map(|d| d.trim().to_lowercase()).filter(|d| !d.is_empty());
        let ip = ip.map(|i| i.trim().to_string()).filter(|i| !i.is_empty());
        let created = conn.execute(
            "INSERT OR IGNORE INTO threat_whitelist(indicator_type, domain, ip, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![indicator_type, domain, ip, reason, Utc::now()],
        )? > 0;
        // Inserted or already present; either way hand back the row.
        let entry = conn.query_row(
            "SELECT id, indicator_type, domain, ip, reason, created_at
             FROM threat_whitelist
             WHERE indicator_type = ?1
               AND COALESCE(domain, '') = COALESCE(?2, '')
               AND COALESCE(ip, '') = COALESCE(?3, '')",
            params![indicator_type, domain, ip],
            map_whitelist_row,
        )?;
        Ok((entry, created))
    }

    fn remove_whitelist(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM threat_whitelist WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn list_whitelist(
        &self,
        limit: i64,
        indicator_type: Option<&str>,
    ) -> Result<Vec<WhitelistEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, indicator_type, domain, ip, reason, created_at
             FROM threat_whitelist
             WHERE (?1 IS NULL OR indicator_type = ?1)
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![indicator_type, limit], map_whitelist_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn create_user(
        &self,
        username: &str,
        email: &str,
        hashed_password: &str,
        is_admin: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users(username, email, hashed_password, is_admin, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![username, email, hashed_password, is_admin, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE username = ?1"),
                params![username],
                map_user_row,
            )
            .optional()?;
        Ok(row)
    }

    fn user_by_id(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user_row,
            )
            .optional()?;
        Ok(row)
    }

    fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(params![limit, offset], map_user_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn update_user(&self, id: i64, update: &UserUpdate) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET
               email = COALESCE(?2, email),
               hashed_password = COALESCE(?3, hashed_password),
               is_admin = COALESCE(?4, is_admin),
               is_active = COALESCE(?5, is_active)
             WHERE id = ?1",
            params![
                id,
                update.email,
                update.hashed_password,
                update.is_admin,
                update.is_active,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn count_users(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    fn save_whois(&self, domain: &str, data: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO whois_data(domain, whois_data, whois_updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(domain) DO UPDATE SET
               whois_data = excluded.whois_data,
               whois_updated_at = excluded.whois_updated_at",
            params![domain, data.to_string(), Utc::now()],
        )?;
        Ok(())
    }

    fn whois_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<(serde_json::Value, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT whois_data, whois_updated_at FROM whois_data WHERE domain = ?1",
                params![domain],
                |row| {
                    let raw: String = row.get(0)?;
                    let at: DateTime<Utc> = row.get(1)?;
                    Ok((raw, at))
                },
            )
            .optional()?;
        match row {
            Some((raw, at)) => Ok(Some((serde_json::from_str(&raw)?, at))),
            None => Ok(None),
        }
    }

    fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    fn dashboard_stats(&self, hours: i64) -> Result<DashboardStats> {
        let conn = self.conn()?;
        let start = Utc::now() - chrono::Duration::hours(hours);
        let dns_queries: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dns_lookups WHERE last_seen >= ?1",
            params![start],
            |row| row.get(0),
        )?;
        let (total_bytes, flow_count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(bytes_sent + bytes_received), 0), COUNT(*)
             FROM traffic_flows WHERE last_update >= ?1",
            params![start],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let active_start = Utc::now() - chrono::Duration::hours(1);
        let active_connections: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT server_ip) FROM traffic_flows WHERE last_update >= ?1",
            params![active_start],
            |row| row.get(0),
        )?;
        Ok(DashboardStats {
            dns_queries,
            total_bytes,
            flow_count,
            active_connections,
            period_hours: hours,
            dropped_dns_events: 0,
            dropped_l4_records: 0,
            dropped_whois_jobs: 0,
        })
    }
}

fn map_feed_row(row: &Row<'_>) -> rusqlite::Result<ThreatFeedMeta> {
    let config: Option<String> = row.get(7)?;
    Ok(ThreatFeedMeta {
        id: row.get(0)?,
        feed_name: row.get(1)?,
        source_url: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        last_update: row.get(4)?,
        indicator_count: row.get(5)?,
        last_error: row.get(6)?,
        config: config.and_then(|c| serde_json::from_str(&c).ok()),
    })
}

fn map_whitelist_row(row: &Row<'_>) -> rusqlite::Result<WhitelistEntry> {
    Ok(WhitelistEntry {
        id: row.get(0)?,
        indicator_type: row.get(1)?,
        domain: row.get(2)?,
        ip: row.get(3)?,
        reason: row.get(4)?,
        created_at: row.get(5)?,
    })
}
