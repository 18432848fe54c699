//! DNS ingest task: the single consumer of extracted DNS events. Each
//! event is checked live against the threat index, appended to the event
//! log, folded into the lookup summaries, and may queue WHOIS enrichment.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::{debug, error, info};

use crate::alerts::AlertWriter;
use crate::db::Store;
use crate::dns::extract::answer_ips;
use crate::model::{DnsEventRecord, DnsEventType};
use crate::net::is_public_ip_str;
use crate::threat::index::ThreatIndex;
use crate::whois::WhoisService;

pub struct DnsIngest {
    store: Arc<dyn Store>,
    index: Arc<ThreatIndex>,
    alerts: AlertWriter,
    whois: Arc<WhoisService>,
}

impl DnsIngest {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<ThreatIndex>,
        alerts: AlertWriter,
        whois: Arc<WhoisService>,
    ) -> Self {
        Self {
            store,
            index,
            alerts,
            whois,
        }
    }

    pub fn run(self, rx: Receiver<DnsEventRecord>) {
        info!("dns ingest started");
        for event in rx {
            self.handle_event(&event);
        }
        info!("dns ingest stopped");
    }

    /// Store and analytics are best effort per event: a failed write is
    /// logged and the pipeline moves on.
    pub fn handle_event(&self, event: &DnsEventRecord) {
        let snap = self.index.snapshot();
        let source_ip = event.source_ip.to_string();

        if !snap.is_whitelisted_domain(&event.domain) {
            if let Some(m) = snap.match_domain(&event.domain) {
                if let Err(e) = self.alerts.emit(
                    &m.feed_name,
                    "domain",
                    Some(&event.domain),
                    None,
                    &event.query_type,
                    &source_ip,
                ) {
                    error!("alert write failed for {}: {e}", event.domain);
                }
            }
        }

        if let Err(e) = self.store.append_dns_event(event) {
            error!("dns event append failed: {e}");
        }

        if event.event_type != DnsEventType::Response {
            return;
        }

        let ips = answer_ips(&event.answers);
        let is_address_query = event.query_type == "A" || event.query_type == "AAAA";

        if is_address_query && !ips.is_empty() {
            let first_sighting = match self.store.dns_lookup_by_domain(&event.domain) {
                Ok(existing) => existing.is_none(),
                Err(e) => {
                    error!("dns lookup read failed for {}: {e}", event.domain);
                    false
                }
            };
            if let Err(e) =
                self.store
                    .upsert_dns_lookup(&event.domain, &event.query_type, &ips, event.ts)
            {
                error!("dns lookup upsert failed for {}: {e}", event.domain);
            } else {
                debug!("dns response {} ({}) -> {:?}", event.domain, event.query_type, ips);
            }

            // enrichment is keyed on the first time a public domain shows up
            if first_sighting && ips.iter().any(|ip| is_public_ip_str(ip)) {
                self.whois.enqueue(&event.domain);
            }
        }

        for ip in &ips {
            if snap.is_whitelisted_ip(ip) {
                continue;
            }
            if let Some(m) = snap.match_ip(ip) {
                if let Err(e) = self.alerts.emit(
                    &m.feed_name,
                    "ip",
                    Some(&event.domain),
                    Some(&m.indicator),
                    &event.query_type,
                    &source_ip,
                ) {
                    error!("alert write failed for {ip}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::db::{AlertFilter, SqliteStore};
    use crate::threat::feeds::FeedKind;
    use crate::threat::intel::ThreatIntel;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        index: Arc<ThreatIndex>,
        ingest: DnsIngest,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.db");
        let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
        let index = Arc::new(ThreatIndex::empty());
        let alerts = AlertWriter::new(store.clone(), index.clone());
        let whois = WhoisService::start(store.clone(), 1);
        let ingest = DnsIngest::new(store.clone(), index.clone(), alerts, whois);
        Fixture {
            _dir: dir,
            store,
            index,
            ingest,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn response(domain: &str, qtype: &str, answers: Vec<&str>, ts: i64) -> DnsEventRecord {
        DnsEventRecord {
            event_type: DnsEventType::Response,
            domain: domain.to_string(),
            query_type: qtype.to_string(),
            source_ip: "10.0.0.1".parse().unwrap(),
            destination_ip: "10.0.0.5".parse().unwrap(),
            answers: answers.into_iter().map(String::from).collect(),
            ts: at(ts),
        }
    }

    #[test]
    fn response_updates_lookup_and_logs_event() {
        let f = setup();
        f.ingest
            .handle_event(&response("example.com", "A", vec!["93.184.216.34"], 10));

        let row = f.store.dns_lookup_by_domain("example.com").unwrap().unwrap();
        assert_eq!(row.resolved_ips, vec!["93.184.216.34".to_string()]);

        let events = f
            .store
            .dns_events(&crate::db::DnsEventFilter { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn empty_response_keeps_event_but_no_lookup() {
        let f = setup();
        f.ingest.handle_event(&response("nxdomain.example", "A", vec![], 10));
        assert!(f.store.dns_lookup_by_domain("nxdomain.example").unwrap().is_none());
        let events = f
            .store
            .dns_events(&crate::db::DnsEventFilter { limit: 10, ..Default::default() })
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn cname_only_answers_do_not_create_lookup() {
        let f = setup();
        f.ingest.handle_event(&response(
            "alias.example",
            "A",
            vec!["CNAME:target.example"],
            10,
        ));
        assert!(f.store.dns_lookup_by_domain("alias.example").unwrap().is_none());
    }

    #[test]
    fn txt_response_logged_but_not_in_lookup_table() {
        let f = setup();
        f.ingest
            .handle_event(&response("example.com", "TXT", vec!["TXT:v=spf1 -all"], 10));
        assert!(f.store.dns_lookup_by_domain("example.com").unwrap().is_none());
    }

    #[test]
    fn matching_domain_raises_alert_once_per_event() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("URLhaus", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content("URLhaus", &FeedKind::UrlHaus, "evil.com\n")
            .unwrap();

        f.ingest
            .handle_event(&response("a.b.evil.com", "A", vec!["203.0.113.1"], 10));

        let alerts = f
            .store
            .alerts(&AlertFilter { limit: 10, since: None, resolved: None })
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].domain.as_deref(), Some("a.b.evil.com"));
        assert_eq!(alerts[0].indicator_type, "domain");
        assert_eq!(alerts[0].source_ip, "10.0.0.1");
    }

    #[test]
    fn whitelisted_domain_never_alerts() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("URLhaus", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content("URLhaus", &FeedKind::UrlHaus, "evil.com\n")
            .unwrap();
        f.store.add_whitelist("domain", Some("evil.com"), None, None).unwrap();
        f.index.rebuild(f.store.as_ref()).unwrap();

        f.ingest
            .handle_event(&response("sub.evil.com", "A", vec!["203.0.113.1"], 10));
        assert_eq!(f.store.alerts_count(None, None).unwrap(), 0);
    }

    #[test]
    fn malicious_answer_ip_raises_ip_alert_but_private_never_does() {
        let f = setup();
        let intel = ThreatIntel::new(f.store.clone(), f.index.clone());
        f.store
            .upsert_feed_meta("IPsum-L3", "u", true, None, 0, None, None)
            .unwrap();
        intel
            .apply_feed_content(
                "IPsum-L3",
                &FeedKind::Ipsum { level: 3 },
                "203.0.113.66\n192.168.1.50\n",
            )
            .unwrap();

        f.ingest.handle_event(&response(
            "cdn.example.net",
            "A",
            vec!["203.0.113.66", "192.168.1.50"],
            10,
        ));

        let alerts = f
            .store
            .alerts(&AlertFilter { limit: 10, since: None, resolved: None })
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].indicator_type, "ip");
        assert_eq!(alerts[0].ip.as_deref(), Some("203.0.113.66"));
    }
}
