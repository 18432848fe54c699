//! Threat feed descriptors and their parsers. Each feed family is a
//! variant with a pure `parse` over the downloaded text; the scheduler and
//! the API look feeds up by name through `FeedKind::from_meta`.

use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::model::ThreatFeedMeta;
use crate::net::is_public_ip;

pub const URLHAUS: &str = "URLhaus";
pub const PHISHING_ARMY: &str = "PhishingArmy";
pub const IPSUM_PREFIX: &str = "IPsum-L";
pub const DEFAULT_IPSUM_LEVEL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedKind {
    UrlHaus,
    PhishingArmy,
    Ipsum { level: u8 },
    Custom,
}

impl FeedKind {
    /// Kind of a stored feed, by naming convention. Anything unrecognized
    /// is operator-curated.
    pub fn from_meta(meta: &ThreatFeedMeta) -> FeedKind {
        match meta.feed_name.as_str() {
            URLHAUS => FeedKind::UrlHaus,
            PHISHING_ARMY => FeedKind::PhishingArmy,
            name => match name.strip_prefix(IPSUM_PREFIX) {
                Some(level) => match level.parse::<u8>() {
                    Ok(level @ 1..=8) => FeedKind::Ipsum { level },
                    _ => FeedKind::Custom,
                },
                None => FeedKind::Custom,
            },
        }
    }

    pub fn feed_name(&self) -> String {
        match self {
            FeedKind::UrlHaus => URLHAUS.to_string(),
            FeedKind::PhishingArmy => PHISHING_ARMY.to_string(),
            FeedKind::Ipsum { level } => format!("{IPSUM_PREFIX}{level}"),
            FeedKind::Custom => "custom".to_string(),
        }
    }

    /// Download URL; custom feeds have none.
    pub fn source_url(&self) -> Option<String> {
        match self {
            FeedKind::UrlHaus => Some("https://urlhaus.abuse.ch/downloads/text/".to_string()),
            FeedKind::PhishingArmy => Some(
                "https://phishing.army/download/phishing_army_blocklist_extended.txt".to_string(),
            ),
            FeedKind::Ipsum { level } => Some(format!(
                "https://raw.githubusercontent.com/stamparm/ipsum/master/levels/{level}.txt"
            )),
            FeedKind::Custom => None,
        }
    }

    /// Parse downloaded content into `(domains, ips)`. Local domains and
    /// non-public IPs are filtered out before storage.
    pub fn parse(&self, content: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        match self {
            FeedKind::UrlHaus => parse_urlhaus(content),
            FeedKind::PhishingArmy => parse_domain_per_line(content),
            FeedKind::Ipsum { .. } => parse_ip_per_line(content),
            FeedKind::Custom => (BTreeSet::new(), BTreeSet::new()),
        }
    }
}

/// The feeds every deployment starts with.
pub fn builtin_feeds(ipsum_level: u8) -> Vec<FeedKind> {
    vec![
        FeedKind::UrlHaus,
        FeedKind::PhishingArmy,
        FeedKind::Ipsum { level: ipsum_level },
    ]
}

const LOCAL_TLDS: [&str; 11] = [
    ".local",
    ".localhost",
    ".internal",
    ".lan",
    ".home",
    ".corp",
    ".localdomain",
    ".arpa",
    ".test",
    ".example",
    ".invalid",
];

const LOCAL_HOSTNAMES: [&str; 3] = ["localhost", "localhost.localdomain", "broadcasthost"];

/// Domains that should never become indicators: local/reserved TLDs,
/// single labels, and reserved hostnames.
pub fn is_local_domain(domain: &str) -> bool {
    let domain = domain.to_lowercase();
    if LOCAL_TLDS.iter().any(|tld| domain.ends_with(tld)) {
        return true;
    }
    if !domain.contains('.') {
        return true;
    }
    LOCAL_HOSTNAMES.contains(&domain.as_str())
}

/// Files a line under domains or IPs, applying both filters. Accepts an
/// optional `:port` suffix on host-ish lines.
fn classify_indicator(raw: &str, domains: &mut BTreeSet<String>, ips: &mut BTreeSet<String>) {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        if is_public_ip(&ip) {
            ips.insert(ip.to_string());
        }
        return;
    }
    let host = raw.split(':').next().unwrap_or(raw).to_lowercase();
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_public_ip(&ip) {
            ips.insert(ip.to_string());
        }
        return;
    }
    if host.is_empty() || host.starts_with('.') || is_local_domain(&host) {
        return;
    }
    domains.insert(host);
}

/// URLhaus text dump: one URL per line, `#` comments. The host is pulled
/// out of the URL; bare domain or IP lines are taken as-is.
fn parse_urlhaus(content: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut domains = BTreeSet::new();
    let mut ips = BTreeSet::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("http://") || line.starts_with("https://") {
            let Ok(parsed) = url::Url::parse(line) else {
                continue;
            };
            if let Some(host) = parsed.host_str() {
                // Bracketed IPv6 hosts come back with brackets attached.
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if let Ok(ip) = host.parse::<IpAddr>() {
                    if is_public_ip(&ip) {
                        ips.insert(ip.to_string());
                    }
                } else if !is_local_domain(host) {
                    domains.insert(host.to_lowercase());
                }
            }
        } else {
            classify_indicator(line, &mut domains, &mut ips);
        }
    }
    (domains, ips)
}

/// One domain (occasionally an IP) per line, `#` comments.
fn parse_domain_per_line(content: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut domains = BTreeSet::new();
    let mut ips = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        classify_indicator(line, &mut domains, &mut ips);
    }
    (domains, ips)
}

/// One IP per line; tolerates trailing columns (the aggregate ipsum file
/// carries a count after the address).
fn parse_ip_per_line(content: &str) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut ips = BTreeSet::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if let Ok(ip) = first.parse::<IpAddr>() {
            if is_public_ip(&ip) {
                ips.insert(ip.to_string());
            }
        }
    }
    (BTreeSet::new(), ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlhaus_extracts_hosts_from_urls() {
        let content = "\
# URLhaus dump
https://evil.example.com/payload.exe
http://203.0.113.66:8080/mal.bin
http://EVIL2.test/x
bad.domain.net
192.168.1.50
";
        let (domains, ips) = FeedKind::UrlHaus.parse(content);
        assert!(domains.contains("evil.example.com"));
        assert!(domains.contains("bad.domain.net"));
        // .test TLD is local, private IP filtered
        assert!(!domains.iter().any(|d| d.contains("evil2")));
        assert_eq!(ips.len(), 1);
        assert!(ips.contains("203.0.113.66"));
    }

    #[test]
    fn phishing_army_one_domain_per_line() {
        let content = "# comment\nphish.example.org\nPHISH2.example.org\nlocalhost\nsingleton\n";
        let (domains, ips) = FeedKind::PhishingArmy.parse(content);
        assert_eq!(domains.len(), 2);
        assert!(domains.contains("phish.example.org"));
        assert!(domains.contains("phish2.example.org"));
        assert!(ips.is_empty());
    }

    #[test]
    fn ipsum_keeps_only_public_ips() {
        let content = "# ipsum\n203.0.113.5\n10.0.0.1\n198.51.100.77\t9\nnot-an-ip\n";
        let (domains, ips) = FeedKind::Ipsum { level: 3 }.parse(content);
        assert!(domains.is_empty());
        assert_eq!(ips.len(), 2);
        assert!(ips.contains("203.0.113.5"));
        assert!(ips.contains("198.51.100.77"));
    }

    #[test]
    fn local_domain_filter() {
        for d in ["router.local", "printer.lan", "host.internal", "nas", "localhost"] {
            assert!(is_local_domain(d), "{d}");
        }
        assert!(!is_local_domain("example.com"));
        assert!(!is_local_domain("sub.example.co.uk"));
    }

    #[test]
    fn feed_kind_from_name() {
        let meta = |name: &str| ThreatFeedMeta {
            id: 1,
            feed_name: name.to_string(),
            source_url: String::new(),
            enabled: true,
            last_update: None,
            indicator_count: 0,
            last_error: None,
            config: None,
        };
        assert_eq!(FeedKind::from_meta(&meta(URLHAUS)), FeedKind::UrlHaus);
        assert_eq!(FeedKind::from_meta(&meta("IPsum-L5")), FeedKind::Ipsum { level: 5 });
        assert_eq!(FeedKind::from_meta(&meta("IPsum-L9")), FeedKind::Custom);
        assert_eq!(FeedKind::from_meta(&meta("my-blocklist")), FeedKind::Custom);
    }

    #[test]
    fn ipsum_url_carries_level() {
        assert!(FeedKind::Ipsum { level: 4 }
            .source_url()
            .unwrap()
            .ends_with("/levels/4.txt"));
        assert!(FeedKind::Custom.source_url().is_none());
    }
}
