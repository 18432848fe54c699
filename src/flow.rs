//! Bidirectional flow aggregation. A single thread owns the cache: packets
//! come in over a channel, get folded into canonical per-flow counters, and
//! the whole cache is flushed to the store once a minute and on shutdown.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info};

use crate::db::Store;
use crate::model::{FlowKey, FlowStats, L4Record};
use crate::net::{is_ephemeral_port, is_lan_ip, is_privileged_port, is_well_known_port};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packet travels client → server.
    Outbound,
    /// Packet travels server → client.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub key: FlowKey,
    pub direction: Direction,
    pub is_abnormal: bool,
}

/// Maps a packet onto its canonical flow. Both directions of a connection
/// land on the same key, so the server side must be chosen from addresses
/// and ports alone:
///
/// - LAN to WAN: the LAN side is the client.
/// - LAN-internal and WAN-to-WAN: port heuristics, in order. The ephemeral
///   side is the client; a well-known port is the server; a privileged port
///   is the server; otherwise the lower port is the server. WAN-to-WAN
///   additionally flags the flow abnormal.
pub fn classify(rec: &L4Record) -> Classified {
    let src_lan = is_lan_ip(&rec.src_ip);
    let dst_lan = is_lan_ip(&rec.dst_ip);

    let (src_is_client, is_abnormal) = match (src_lan, dst_lan) {
        (true, false) => (true, false),
        (false, true) => (false, false),
        (true, true) => (src_is_client_by_port(rec.src_port, rec.dst_port), false),
        (false, false) => (src_is_client_by_port(rec.src_port, rec.dst_port), true),
    };

    if src_is_client {
        Classified {
            key: FlowKey {
                client_ip: rec.src_ip,
                server_ip: rec.dst_ip,
                server_port: rec.dst_port,
                protocol: rec.protocol,
            },
            direction: Direction::Outbound,
            is_abnormal,
        }
    } else {
        Classified {
            key: FlowKey {
                client_ip: rec.dst_ip,
                server_ip: rec.src_ip,
                server_port: rec.src_port,
                protocol: rec.protocol,
            },
            direction: Direction::Inbound,
            is_abnormal,
        }
    }
}

fn src_is_client_by_port(src_port: u16, dst_port: u16) -> bool {
    let src_eph = is_ephemeral_port(src_port);
    let dst_eph = is_ephemeral_port(dst_port);
    if src_eph != dst_eph {
        return src_eph;
    }
    let src_known = is_well_known_port(src_port);
    let dst_known = is_well_known_port(dst_port);
    if src_known != dst_known {
        return dst_known;
    }
    let src_priv = is_privileged_port(src_port);
    let dst_priv = is_privileged_port(dst_port);
    if src_priv != dst_priv {
        return dst_priv;
    }
    // deterministic fallback: lower port is the server
    dst_port < src_port
}

pub struct FlowAggregator {
    store: Arc<dyn Store>,
    cache: HashMap<FlowKey, FlowStats>,
    default_lookback_days: i64,
}

impl FlowAggregator {
    pub fn new(store: Arc<dyn Store>, default_lookback_days: i64) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            default_lookback_days,
        }
    }

    pub fn ingest(&mut self, rec: &L4Record) {
        let classified = classify(rec);
        let now = Utc::now();
        let entry = self
            .cache
            .entry(classified.key)
            .or_insert_with(|| FlowStats {
                bytes_sent: 0,
                bytes_received: 0,
                packet_count: 0,
                first_seen: rec.ts,
                last_update: now,
                is_abnormal: false,
            });
        match classified.direction {
            Direction::Outbound => entry.bytes_sent += rec.size,
            Direction::Inbound => entry.bytes_received += rec.size,
        }
        entry.packet_count += 1;
        entry.first_seen = entry.first_seen.min(rec.ts);
        entry.last_update = now;
        entry.is_abnormal |= classified.is_abnormal;
    }

    /// Lookback for DNS binding: the stored setting wins over the env
    /// default, so the API can retune it without a restart.
    fn lookback_days(&self) -> i64 {
        match self.store.get_setting("orphaned_ip_days") {
            Ok(Some(v)) => v.as_i64().unwrap_or(self.default_lookback_days),
            _ => self.default_lookback_days,
        }
    }

    /// Writes the cache out. Domain binding only consults DNS that predates
    /// the flow (`first_seen` as the upper bound) and is skipped entirely
    /// for abnormal flows. Entries whose upsert fails go back into the
    /// cache for the next flush; ingest never waits on the store.
    pub fn flush(&mut self) {
        if self.cache.is_empty() {
            return;
        }
        let days = self.lookback_days();
        let entries = std::mem::take(&mut self.cache);
        let count = entries.len();
        debug!("flushing {count} flow entries");

        for (key, stats) in entries {
            let domain = if stats.is_abnormal {
                None
            } else {
                let since = Utc::now() - chrono::Duration::days(days);
                match self.store.lookup_domain_by_ip(
                    &key.server_ip.to_string(),
                    since,
                    Some(stats.first_seen),
                ) {
                    Ok(domain) => domain,
                    Err(e) => {
                        error!("domain binding failed for {}: {e}", key.server_ip);
                        self.restore(key, stats);
                        continue;
                    }
                }
            };

            if let Err(e) = self.store.upsert_flow(&key, &stats, domain.as_deref()) {
                error!("flow upsert failed for {}: {e}", key.server_ip);
                self.restore(key, stats);
            }
        }
    }

    /// Puts a failed entry back, folding in any packets that arrived since
    /// the cache was taken.
    fn restore(&mut self, key: FlowKey, stats: FlowStats) {
        match self.cache.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let live = e.get_mut();
                live.bytes_sent += stats.bytes_sent;
                live.bytes_received += stats.bytes_received;
                live.packet_count += stats.packet_count;
                live.first_seen = live.first_seen.min(stats.first_seen);
                live.last_update = live.last_update.max(stats.last_update);
                live.is_abnormal |= stats.is_abnormal;
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(stats);
            }
        }
    }

    /// Ingest loop: drains the channel, flushing every minute and once more
    /// when the capture side hangs up.
    pub fn run(mut self, rx: Receiver<L4Record>) {
        info!("flow aggregator started");
        let mut last_flush = Instant::now();
        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(rec) => self.ingest(&rec),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if last_flush.elapsed() >= FLUSH_INTERVAL {
                self.flush();
                last_flush = Instant::now();
            }
        }
        self.flush();
        info!("flow aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::db::SqliteStore;
    use crate::model::Protocol;

    // Test timestamps sit an hour in the past so the binding window
    // (anchored at the wall clock) always covers them.
    static BASE: once_cell::sync::Lazy<i64> =
        once_cell::sync::Lazy::new(|| Utc::now().timestamp() - 3600);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(*BASE + secs, 0).unwrap()
    }

    fn packet(
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        size: u64,
        ts: i64,
    ) -> L4Record {
        L4Record {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            protocol: Protocol::Tcp,
            size,
            ts: at(ts),
        }
    }

    fn aggregator() -> (tempfile::TempDir, Arc<SqliteStore>, FlowAggregator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.db");
        let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
        let agg = FlowAggregator::new(store.clone(), 7);
        (dir, store, agg)
    }

    #[test]
    fn outbound_and_inbound_share_the_canonical_key() {
        let out = classify(&packet("10.0.0.5", 54321, "93.184.216.34", 443, 100, 1));
        let back = classify(&packet("93.184.216.34", 443, "10.0.0.5", 54321, 100, 2));
        assert_eq!(out.key, back.key);
        assert_eq!(out.direction, Direction::Outbound);
        assert_eq!(back.direction, Direction::Inbound);
        assert!(!out.is_abnormal);
        assert_eq!(out.key.client_ip.to_string(), "10.0.0.5");
        assert_eq!(out.key.server_port, 443);
    }

    #[test]
    fn lan_internal_ephemeral_side_is_client() {
        let c = classify(&packet("192.168.1.10", 50000, "192.168.1.20", 8000, 10, 1));
        assert_eq!(c.key.client_ip.to_string(), "192.168.1.10");
        assert_eq!(c.key.server_port, 8000);
        assert_eq!(c.direction, Direction::Outbound);
    }

    #[test]
    fn lan_internal_well_known_side_is_server() {
        // neither port ephemeral, 443 well-known
        let c = classify(&packet("192.168.1.20", 443, "192.168.1.10", 9000, 10, 1));
        assert_eq!(c.key.server_port, 443);
        assert_eq!(c.key.client_ip.to_string(), "192.168.1.10");
        assert_eq!(c.direction, Direction::Inbound);
    }

    #[test]
    fn lan_internal_privileged_side_is_server() {
        // neither ephemeral nor well-known; 900 < 1024
        let c = classify(&packet("192.168.1.10", 2000, "192.168.1.20", 900, 10, 1));
        assert_eq!(c.key.server_port, 900);
        assert_eq!(c.direction, Direction::Outbound);
    }

    #[test]
    fn lan_internal_both_well_known_lower_port_is_server() {
        let c = classify(&packet("192.168.1.10", 443, "192.168.1.20", 80, 10, 1));
        assert_eq!(c.key.server_port, 80);
        assert_eq!(c.key.server_ip.to_string(), "192.168.1.20");
        let reverse = classify(&packet("192.168.1.20", 80, "192.168.1.10", 443, 10, 2));
        assert_eq!(c.key, reverse.key);
    }

    #[test]
    fn wan_to_wan_is_abnormal_and_direction_independent() {
        let c = classify(&packet("198.51.100.3", 5000, "203.0.113.9", 443, 10, 1));
        assert!(c.is_abnormal);
        assert_eq!(c.key.client_ip.to_string(), "198.51.100.3");
        assert_eq!(c.key.server_port, 443);
        let reverse = classify(&packet("203.0.113.9", 443, "198.51.100.3", 5000, 10, 2));
        assert_eq!(c.key, reverse.key);
        assert!(reverse.is_abnormal);
        assert_eq!(reverse.direction, Direction::Inbound);
    }

    #[test]
    fn reversed_trace_yields_same_key_and_split() {
        let trace = vec![
            packet("10.0.0.5", 54321, "93.184.216.34", 443, 80, 11),
            packet("93.184.216.34", 443, "10.0.0.5", 54321, 1500, 12),
            packet("10.0.0.5", 54321, "93.184.216.34", 443, 120, 13),
        ];

        let run = |packets: &[L4Record]| {
            let (_dir, _store, mut agg) = aggregator();
            for p in packets {
                agg.ingest(p);
            }
            let (key, stats) = agg.cache.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
            assert_eq!(agg.cache.len(), 1);
            (key, stats.bytes_sent, stats.bytes_received, stats.packet_count)
        };

        let forward = run(&trace);
        let mut reversed = trace.clone();
        reversed.reverse();
        let backward = run(&reversed);
        assert_eq!(forward, backward);
        assert_eq!(forward.1, 200);
        assert_eq!(forward.2, 1500);
        assert_eq!(forward.3, 3);
    }

    #[test]
    fn https_flow_binds_to_domain_on_flush() {
        let (_dir, store, mut agg) = aggregator();
        store
            .upsert_dns_lookup("example.com", "A", &["93.184.216.34".into()], at(10))
            .unwrap();

        for (size, ts) in [(80, 11), (120, 12), (120, 13), (120, 14), (120, 15)] {
            agg.ingest(&packet("10.0.0.5", 54321, "93.184.216.34", 443, size, ts));
        }
        agg.ingest(&packet("93.184.216.34", 443, "10.0.0.5", 54321, 1500, 12));
        agg.ingest(&packet("93.184.216.34", 443, "10.0.0.5", 54321, 1500, 14));
        agg.flush();
        assert!(agg.cache.is_empty());

        let rows = store.traffic_by_domain("example.com", None, None).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.client_ip, "10.0.0.5");
        assert_eq!(row.server_ip, "93.184.216.34");
        assert_eq!(row.server_port, 443);
        assert_eq!(row.protocol, "TCP");
        assert_eq!(row.bytes_sent, 560);
        assert_eq!(row.bytes_received, 3000);
        assert_eq!(row.packet_count, 7);
        assert_eq!(row.first_seen, at(11));
        assert!(!row.is_orphaned);
        assert!(!row.is_abnormal);
    }

    // DNS that arrives after the flow started must not
    // explain it, but does explain a later flow to the same address
    #[test]
    fn late_dns_does_not_bind_earlier_flow() {
        let (_dir, store, mut agg) = aggregator();

        agg.ingest(&packet("10.0.0.5", 40000, "203.0.113.7", 443, 100, 5));
        store
            .upsert_dns_lookup("foo.test", "A", &["203.0.113.7".into()], at(20))
            .unwrap();
        agg.flush();

        let orphans = store.orphaned_aggregate(at(0), Utc::now()).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].destination_ip, "203.0.113.7");

        // a second flow, from another client, starting after the answer
        agg.ingest(&packet("10.0.0.6", 40001, "203.0.113.7", 443, 100, 25));
        agg.flush();

        let rows = store.traffic_by_domain("foo.test", None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_ip, "10.0.0.6");
    }

    // WAN↔WAN traffic is never bound to a domain
    #[test]
    fn abnormal_flow_skips_dns_binding() {
        let (_dir, store, mut agg) = aggregator();
        // DNS memory knows the address, but abnormal flows must not consult it
        store
            .upsert_dns_lookup("wan.example", "A", &["203.0.113.9".into()], at(1))
            .unwrap();

        agg.ingest(&packet("198.51.100.3", 5000, "203.0.113.9", 443, 400, 10));
        agg.ingest(&packet("203.0.113.9", 443, "198.51.100.3", 5000, 900, 11));
        agg.flush();

        let orphans = store.orphaned_aggregate(at(0), Utc::now()).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].destination_ip, "203.0.113.9");
        assert_eq!(orphans[0].total_bytes, 1300);
        assert_eq!(orphans[0].total_packets, 2);
        assert_eq!(orphans[0].connection_count, 1);
        assert!(store.traffic_by_domain("wan.example", None, None).unwrap().is_empty());
    }

    #[test]
    fn abnormal_latches_across_flushes() {
        let (_dir, store, mut agg) = aggregator();
        agg.ingest(&packet("198.51.100.3", 5000, "203.0.113.9", 443, 10, 10));
        agg.flush();
        // same 4-tuple again; one row, still abnormal
        agg.ingest(&packet("198.51.100.3", 5000, "203.0.113.9", 443, 20, 70));
        agg.flush();

        let orphans = store.orphaned_aggregate(at(0), Utc::now()).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].total_bytes, 30);
        assert_eq!(orphans[0].connection_count, 1);
    }

    #[test]
    fn flush_on_empty_cache_is_a_no_op() {
        let (_dir, _store, mut agg) = aggregator();
        agg.flush();
        assert!(agg.cache.is_empty());
    }

    #[test]
    fn first_seen_takes_earliest_packet_even_out_of_order() {
        let (_dir, store, mut agg) = aggregator();
        agg.ingest(&packet("10.0.0.5", 40000, "203.0.113.7", 443, 10, 50));
        agg.ingest(&packet("10.0.0.5", 40000, "203.0.113.7", 443, 10, 30));
        agg.flush();

        let orphans = store.orphaned_aggregate(at(0), Utc::now()).unwrap();
        assert_eq!(orphans[0].first_seen, at(30));
    }
}
