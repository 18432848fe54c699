//! One-shot replay of stored DNS events against the current indicator set,
//! used after feeds change to surface matches that predate the update.

use std::collections::HashSet;

use chrono::Utc;
use log::info;

use super::index::Snapshot;
use crate::alerts::AlertWriter;
use crate::db::{DnsEventFilter, Store};
use crate::error::Result;
use crate::model::RescanSummary;

const EVENT_SCAN_LIMIT: i64 = 1_000_000;

/// Scans events newer than `days` ago. Each distinct domain and each
/// distinct answer IP is considered once; alerts already present for the
/// same `(indicator, feed, type)` are not duplicated.
pub fn scan_historical(
    store: &dyn Store,
    snapshot: &Snapshot,
    alerts: &AlertWriter,
    days: i64,
) -> Result<RescanSummary> {
    info!("historical threat scan over the past {days} days");
    let since = Utc::now() - chrono::Duration::days(days);

    let mut guard: HashSet<(String, String, String)> =
        store.alert_keys()?.into_iter().collect();

    let events = store.dns_events(&DnsEventFilter {
        limit: EVENT_SCAN_LIMIT,
        since: Some(since),
        ..Default::default()
    })?;

    let mut domains_checked: HashSet<String> = HashSet::new();
    let mut ips_checked: HashSet<String> = HashSet::new();
    let mut alerts_created = 0u64;

    for event in &events {
        let domain = event.domain.to_lowercase();
        if domains_checked.insert(domain.clone()) && !snapshot.is_whitelisted_domain(&domain) {
            if let Some(m) = snapshot.match_domain(&domain) {
                // guard keys carry the observed domain, the same thing the
                // live path writes into the alert row
                let key = (domain.clone(), m.feed_name.clone(), "domain".to_string());
                if !guard.contains(&key)
                    && alerts.emit(
                        &m.feed_name,
                        "domain",
                        Some(&domain),
                        None,
                        &event.query_type,
                        &event.source_ip,
                    )?
                {
                    guard.insert(key);
                    alerts_created += 1;
                }
            }
        }

        for ip in crate::dns::extract::answer_ips(&event.resolved_ips) {
            if !ips_checked.insert(ip.clone()) {
                continue;
            }
            if snapshot.is_whitelisted_ip(&ip) {
                continue;
            }
            if let Some(m) = snapshot.match_ip(&ip) {
                // alert rows and the guard both carry the normalized address
                let key = (m.indicator.clone(), m.feed_name.clone(), "ip".to_string());
                if !guard.contains(&key)
                    && alerts.emit(
                        &m.feed_name,
                        "ip",
                        Some(&domain),
                        Some(&m.indicator),
                        &event.query_type,
                        &event.source_ip,
                    )?
                {
                    guard.insert(key);
                    alerts_created += 1;
                }
            }
        }
    }

    let summary = RescanSummary {
        events_scanned: events.len() as u64,
        domains_checked: domains_checked.len() as u64,
        ips_checked: ips_checked.len() as u64,
        alerts_created,
        lookback_days: days,
    };
    info!(
        "historical scan done: {} events, {} new alerts",
        summary.events_scanned, summary.alerts_created
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::SqliteStore;
    use crate::model::{DnsEventRecord, DnsEventType};
    use crate::threat::feeds::FeedKind;
    use crate::threat::index::ThreatIndex;
    use crate::threat::intel::ThreatIntel;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        index: Arc<ThreatIndex>,
        alerts: AlertWriter,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescan.db");
        let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
        let index = Arc::new(ThreatIndex::empty());
        let alerts = AlertWriter::new(store.clone(), index.clone());
        Fixture {
            _dir: dir,
            store,
            index,
            alerts,
        }
    }

    fn event(domain: &str, answers: Vec<String>) -> DnsEventRecord {
        DnsEventRecord {
            event_type: DnsEventType::Response,
            domain: domain.to_string(),
            query_type: "A".to_string(),
            source_ip: "10.0.0.5".parse().unwrap(),
            destination_ip: "10.0.0.1".parse().unwrap(),
            answers,
            ts: Utc::now(),
        }
    }

    #[test]
    fn live_alert_is_not_duplicated_by_rescan() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("URLhaus", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content("URLhaus", &FeedKind::UrlHaus, "evil.com\n")
            .unwrap();

        // the live path already alerted on a subdomain of the indicator
        let ev = event("a.b.evil.com", vec!["203.0.113.1".to_string()]);
        f.store.append_dns_event(&ev).unwrap();
        let snap = f.index.snapshot();
        let m = snap.match_domain("a.b.evil.com").unwrap();
        // live alerts record the observed domain
        f.alerts
            .emit(&m.feed_name, "domain", Some("a.b.evil.com"), None, "A", "10.0.0.5")
            .unwrap();

        let summary = scan_historical(f.store.as_ref(), &snap, &f.alerts, 30).unwrap();
        assert_eq!(summary.events_scanned, 1);
        assert_eq!(summary.alerts_created, 0);
        assert_eq!(f.store.alerts_count(None, None).unwrap(), 1);
    }

    #[test]
    fn rescan_picks_up_domain_and_ip_matches_once() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("URLhaus", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content(
                "URLhaus",
                &FeedKind::UrlHaus,
                "evil.com\n203.0.113.66\n",
            )
            .unwrap();

        // two events for the same bad domain, two carrying the same bad IP
        f.store.append_dns_event(&event("x.evil.com", vec![])).unwrap();
        f.store.append_dns_event(&event("x.evil.com", vec![])).unwrap();
        f.store
            .append_dns_event(&event("cdn.example.net", vec!["203.0.113.66".to_string()]))
            .unwrap();
        f.store
            .append_dns_event(&event(
                "cdn.example.net",
                vec!["CNAME:edge.example.net".to_string(), "203.0.113.66".to_string()],
            ))
            .unwrap();

        let snap = f.index.snapshot();
        let summary = scan_historical(f.store.as_ref(), &snap, &f.alerts, 30).unwrap();
        assert_eq!(summary.events_scanned, 4);
        assert_eq!(summary.domains_checked, 2);
        assert_eq!(summary.ips_checked, 1);
        assert_eq!(summary.alerts_created, 2);

        // running again creates nothing new
        let again = scan_historical(f.store.as_ref(), &snap, &f.alerts, 30).unwrap();
        assert_eq!(again.alerts_created, 0);
        assert_eq!(f.store.alerts_count(None, None).unwrap(), 2);
    }

    #[test]
    fn whitelisted_and_private_indicators_are_skipped() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("URLhaus", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content("URLhaus", &FeedKind::UrlHaus, "evil.com\n")
            .unwrap();
        f.store
            .add_whitelist("domain", Some("evil.com"), None, None)
            .unwrap();
        f.index.rebuild(f.store.as_ref()).unwrap();

        // a private answer IP never alerts even if someone fed it in
        f.store
            .append_dns_event(&event("sub.evil.com", vec!["192.168.1.50".to_string()]))
            .unwrap();

        let snap = f.index.snapshot();
        let summary = scan_historical(f.store.as_ref(), &snap, &f.alerts, 30).unwrap();
        assert_eq!(summary.alerts_created, 0);
        assert_eq!(f.store.alerts_count(None, None).unwrap(), 0);
    }
}
