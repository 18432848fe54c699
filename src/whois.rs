//! WHOIS enrichment. First sighting of a public domain queues a lookup on
//! a bounded channel; a small worker pool services the queue and fills the
//! cache table. Overflow drops the job and bumps a counter.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use lru::LruCache;
use serde_json::json;

use crate::db::Store;
use crate::error::{Error, Result};

const QUEUE_DEPTH: usize = 256;
const RECENT_CACHE: usize = 512;
const CACHE_DAYS: i64 = 60;
const IANA_SERVER: &str = "whois.iana.org";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WhoisService {
    store: Arc<dyn Store>,
    tx: SyncSender<String>,
    recent: Mutex<LruCache<String, ()>>,
    pub dropped: AtomicU64,
}

impl WhoisService {
    pub fn start(store: Arc<dyn Store>, workers: usize) -> Arc<Self> {
        let (tx, rx) = sync_channel::<String>(QUEUE_DEPTH);
        let service = Arc::new(Self {
            store,
            tx,
            recent: Mutex::new(LruCache::new(NonZeroUsize::new(RECENT_CACHE).unwrap())),
            dropped: AtomicU64::new(0),
        });

        let rx = Arc::new(Mutex::new(rx));
        for n in 0..workers.max(1) {
            let service = service.clone();
            let rx = rx.clone();
            thread::spawn(move || worker_loop(n, service, rx));
        }
        service
    }

    /// Queue a background lookup. Recently queued domains and a full queue
    /// are both dropped; enrichment is best effort.
    pub fn enqueue(&self, domain: &str) {
        let domain = domain.to_lowercase();
        {
            let mut recent = self.recent.lock().expect("whois lru lock");
            if recent.contains(&domain) {
                return;
            }
            recent.put(domain.clone(), ());
        }
        match self.tx.try_send(domain) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Cached record if fresh, otherwise (or with `force`) a blocking fetch
    /// that refills the cache.
    pub fn lookup(&self, domain: &str, force: bool) -> Result<Option<serde_json::Value>> {
        let domain = domain.to_lowercase();
        if !force {
            if let Some((data, updated_at)) = self.store.whois_by_domain(&domain)? {
                if Utc::now() - updated_at < chrono::Duration::days(CACHE_DAYS) {
                    return Ok(Some(data));
                }
            }
        }
        match fetch_whois(&domain) {
            Ok(data) => {
                self.store.save_whois(&domain, &data)?;
                Ok(Some(data))
            }
            Err(e) => {
                debug!("whois fetch failed for {domain}: {e}");
                // fall back to a stale cache entry if one exists
                Ok(self.store.whois_by_domain(&domain)?.map(|(data, _)| data))
            }
        }
    }
}

fn worker_loop(n: usize, service: Arc<WhoisService>, rx: Arc<Mutex<Receiver<String>>>) {
    info!("whois worker {n} started");
    loop {
        let domain = {
            let rx = rx.lock().expect("whois rx lock");
            rx.recv()
        };
        let Ok(domain) = domain else { break };
        match service.lookup(&domain, false) {
            Ok(Some(_)) => debug!("whois cached for {domain}"),
            Ok(None) => debug!("no whois data for {domain}"),
            Err(e) => warn!("whois store error for {domain}: {e}"),
        }
    }
    info!("whois worker {n} stopped");
}

/// RFC 3912 query: ask IANA for the authoritative server, follow one
/// referral, fold the interesting fields into JSON alongside the raw text.
fn fetch_whois(domain: &str) -> Result<serde_json::Value> {
    let iana = query_server(IANA_SERVER, domain)?;
    let (server, body) = match referral_server(&iana) {
        Some(server) => match query_server(&server, domain) {
            Ok(body) => (server, body),
            Err(_) => (IANA_SERVER.to_string(), iana),
        },
        None => (IANA_SERVER.to_string(), iana),
    };

    let mut registrar = None;
    let mut creation_date = None;
    let mut expiration_date = None;
    let mut updated_date = None;
    let mut name_servers: Vec<String> = Vec::new();

    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "registrar" => registrar.get_or_insert_with(|| value.to_string()),
            "creation date" | "created" => creation_date.get_or_insert_with(|| value.to_string()),
            "registry expiry date" | "expiration date" | "expiry date" => {
                expiration_date.get_or_insert_with(|| value.to_string())
            }
            "updated date" | "last-update" => updated_date.get_or_insert_with(|| value.to_string()),
            "name server" | "nserver" => {
                let ns = value.to_lowercase();
                if !name_servers.contains(&ns) {
                    name_servers.push(ns);
                }
                continue;
            }
            _ => continue,
        };
    }

    Ok(json!({
        "domain": domain,
        "whois_server": server,
        "registrar": registrar,
        "creation_date": creation_date,
        "expiration_date": expiration_date,
        "updated_date": updated_date,
        "name_servers": name_servers,
        "raw": body,
    }))
}

fn referral_server(body: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        matches!(key.trim().to_lowercase().as_str(), "refer" | "whois")
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn query_server(server: &str, domain: &str) -> Result<String> {
    let addr = (server, 43u16)
        .to_socket_addrs()
        .map_err(|e| Error::Internal(format!("whois resolve {server}: {e}")))?
        .next()
        .ok_or_else(|| Error::Internal(format!("whois server {server} has no address")))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| Error::Internal(format!("whois connect {server}: {e}")))?;
    stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
    stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
    stream
        .write_all(format!("{domain}\r\n").as_bytes())
        .map_err(|e| Error::Internal(format!("whois write {server}: {e}")))?;
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .map_err(|e| Error::Internal(format!("whois read {server}: {e}")))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_is_taken_from_refer_line() {
        let body = "% IANA WHOIS server\nrefer:        whois.verisign-grs.com\ndomain: COM\n";
        assert_eq!(
            referral_server(body).as_deref(),
            Some("whois.verisign-grs.com")
        );
        assert_eq!(referral_server("domain: COM\n"), None);
    }
}
