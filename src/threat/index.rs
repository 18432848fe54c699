//! In-memory threat index. Matching runs against an immutable snapshot
//! shared across tasks; rebuilds publish a whole new snapshot so readers
//! never observe a half-applied feed update.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use log::info;

use crate::db::Store;
use crate::error::Result;
use crate::net::is_public_ip;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatMatch {
    pub feed_name: String,
    pub indicator_type: &'static str,
    pub indicator: String,
}

#[derive(Default)]
pub struct Snapshot {
    domains: HashMap<String, String>,
    ips: HashMap<String, String>,
    whitelist_domains: HashSet<String>,
    whitelist_ips: HashSet<String>,
}

impl Snapshot {
    /// Case-folded exact match first, then the ascending suffix walk,
    /// stopping before single-label suffixes.
    pub fn match_domain(&self, domain: &str) -> Option<ThreatMatch> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return None;
        }
        if let Some(feed) = self.domains.get(&domain) {
            return Some(ThreatMatch {
                feed_name: feed.clone(),
                indicator_type: "domain",
                indicator: domain,
            });
        }
        for suffix in suffixes(&domain) {
            if let Some(feed) = self.domains.get(suffix) {
                return Some(ThreatMatch {
                    feed_name: feed.clone(),
                    indicator_type: "domain",
                    indicator: suffix.to_string(),
                });
            }
        }
        None
    }

    /// Exact match after normalization; LAN-side addresses never match.
    pub fn match_ip(&self, ip: &str) -> Option<ThreatMatch> {
        let addr = ip.trim().parse::<IpAddr>().ok()?;
        if !is_public_ip(&addr) {
            return None;
        }
        let normalized = addr.to_string();
        self.ips.get(&normalized).map(|feed| ThreatMatch {
            feed_name: feed.clone(),
            indicator_type: "ip",
            indicator: normalized,
        })
    }

    /// Exact entry or a whitelisted parent domain.
    pub fn is_whitelisted_domain(&self, domain: &str) -> bool {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return false;
        }
        if self.whitelist_domains.contains(&domain) {
            return true;
        }
        let result = suffixes(&domain).any(|s| self.whitelist_domains.contains(s));
        result
    }

    /// Exact entry; LAN-side addresses are implicitly whitelisted.
    pub fn is_whitelisted_ip(&self, ip: &str) -> bool {
        let Ok(addr) = ip.trim().parse::<IpAddr>() else {
            return false;
        };
        if !is_public_ip(&addr) {
            return true;
        }
        self.whitelist_ips.contains(&addr.to_string())
    }

    pub fn indicator_counts(&self) -> (usize, usize) {
        (self.domains.len(), self.ips.len())
    }
}

/// Ascending suffixes of `a.b.c.d`: `b.c.d`, `c.d`, never the bare TLD.
fn suffixes(domain: &str) -> impl Iterator<Item = &str> {
    domain.char_indices().filter_map(move |(i, c)| {
        if c != '.' {
            return None;
        }
        let suffix = &domain[i + 1..];
        // keep at least two labels
        suffix.contains('.').then_some(suffix)
    })
}

pub struct ThreatIndex {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ThreatIndex {
    pub fn empty() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("threat index lock").clone()
    }

    /// Rebuild from the store and publish atomically.
    pub fn rebuild(&self, store: &dyn Store) -> Result<()> {
        let mut snap = Snapshot::default();
        for ind in store.all_indicators()? {
            match (ind.indicator_type.as_str(), ind.domain, ind.ip) {
                ("domain", Some(domain), _) => {
                    snap.domains.entry(domain.to_lowercase()).or_insert(ind.feed_name);
                }
                ("ip", _, Some(ip)) => {
                    if let Ok(addr) = ip.parse::<IpAddr>() {
                        snap.ips.entry(addr.to_string()).or_insert(ind.feed_name);
                    }
                }
                _ => {}
            }
        }
        for entry in store.list_whitelist(i64::MAX, None)? {
            match (entry.indicator_type.as_str(), entry.domain, entry.ip) {
                ("domain", Some(domain), _) => {
                    snap.whitelist_domains.insert(domain.to_lowercase());
                }
                ("ip", _, Some(ip)) => {
                    if let Ok(addr) = ip.parse::<IpAddr>() {
                        snap.whitelist_ips.insert(addr.to_string());
                    }
                }
                _ => {}
            }
        }
        let (d, i) = snap.indicator_counts();
        info!("threat index rebuilt: {d} domains, {i} ips");
        *self.snapshot.write().expect("threat index lock") = Arc::new(snap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(domains: &[(&str, &str)], ips: &[(&str, &str)]) -> Snapshot {
        let mut s = Snapshot::default();
        for (d, f) in domains {
            s.domains.insert(d.to_string(), f.to_string());
        }
        for (i, f) in ips {
            s.ips.insert(i.to_string(), f.to_string());
        }
        s
    }

    #[test]
    fn exact_match_beats_suffix_walk() {
        let mut s = snap(&[("evil.com", "FeedA"), ("a.evil.com", "FeedB")], &[]);
        s.whitelist_domains.insert("unrelated.org".into());
        let m = s.match_domain("A.EVIL.com").unwrap();
        assert_eq!(m.feed_name, "FeedB");
        assert_eq!(m.indicator, "a.evil.com");
    }

    #[test]
    fn suffix_match_law() {
        let s = snap(&[("x.y.z", "FeedA")], &[]);
        let direct = s.match_domain("x.y.z").unwrap();
        let sub = s.match_domain("a.x.y.z").unwrap();
        assert_eq!(direct.indicator, sub.indicator);
        assert_eq!(direct.feed_name, sub.feed_name);
    }

    #[test]
    fn suffix_walk_stops_before_single_label() {
        // "com" as an indicator must never fire via the walk
        let s = snap(&[("com", "FeedA")], &[]);
        assert!(s.match_domain("a.example.com").is_none());
        // but an exact single-label query still hits the exact path
        assert!(s.match_domain("com").is_some());
    }

    #[test]
    fn ip_match_is_exact_and_public_only() {
        let s = snap(&[], &[("203.0.113.66", "FeedA"), ("10.0.0.7", "FeedB")]);
        assert_eq!(s.match_ip("203.0.113.66").unwrap().feed_name, "FeedA");
        assert!(s.match_ip("203.0.113.67").is_none());
        // present in the set, but private addresses never match
        assert!(s.match_ip("10.0.0.7").is_none());
        assert!(s.match_ip("not-an-ip").is_none());
    }

    #[test]
    fn whitelisted_parent_covers_subdomains() {
        let mut s = Snapshot::default();
        s.whitelist_domains.insert("safe.io".into());
        assert!(s.is_whitelisted_domain("safe.io"));
        assert!(s.is_whitelisted_domain("api.safe.io"));
        assert!(s.is_whitelisted_domain("Deep.Sub.Safe.IO"));
        assert!(!s.is_whitelisted_domain("notsafe.io"));
        assert!(!s.is_whitelisted_domain("safe.io.evil.com"));
    }

    #[test]
    fn lan_ips_are_implicitly_whitelisted() {
        let s = Snapshot::default();
        assert!(s.is_whitelisted_ip("192.168.1.10"));
        assert!(s.is_whitelisted_ip("127.0.0.1"));
        assert!(s.is_whitelisted_ip("169.254.0.3"));
        assert!(!s.is_whitelisted_ip("203.0.113.5"));
    }

    #[test]
    fn ip_normalization_on_match() {
        let s = snap(&[], &[("2001:db8::1", "FeedA")]);
        assert!(s.match_ip("2001:0db8:0000::0001").is_some());
    }
}
