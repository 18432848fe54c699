mod alerts;
mod capture;
mod config;
mod db;
mod dns;
mod error;
mod flow;
mod model;
mod net;
mod routes;
mod threat;
mod whois;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;

use actix_session::{config::CookieContentSecurity, storage::CookieSessionStore, SessionMiddleware};
use actix_web::{cookie::Key, get, web, App, HttpResponse, HttpServer, Responder};
use log::{error, info, warn};
use serde_json::json;

use crate::alerts::AlertWriter;
use crate::capture::CaptureMetrics;
use crate::config::Config;
use crate::db::{SqliteStore, Store};
use crate::dns::ingest::DnsIngest;
use crate::flow::FlowAggregator;
use crate::routes::AppState;
use crate::threat::index::ThreatIndex;
use crate::threat::intel::ThreatIntel;
use crate::threat::scheduler;
use crate::whois::WhoisService;

const DNS_CHANNEL_DEPTH: usize = 4096;
const FLOW_CHANNEL_DEPTH: usize = 16384;

#[get("/")]
async fn root() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "message": "gatewatch network observation API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "healthy" }))
}

fn session_key(hex_key: Option<&str>) -> Key {
    match hex_key.and_then(|h| hex::decode(h).ok()) {
        Some(bytes) if bytes.len() >= 64 => Key::from(&bytes),
        Some(_) => {
            warn!("COOKIE_KEY_HEX too short (need 64 bytes); using a per-boot key");
            Key::generate()
        }
        None => {
            warn!("COOKIE_KEY_HEX not set; sessions will not survive restarts");
            Key::generate()
        }
    }
}

/// First run on an empty users table: create the admin from the
/// environment so the API is reachable at all.
fn bootstrap_admin(cfg: &Config, store: &dyn Store) {
    match store.count_users() {
        Ok(0) => match &cfg.api.admin_password {
            Some(password) => {
                let username = &cfg.api.admin_username;
                let email = format!("{username}@localhost");
                match routes::auth::hash_password(password)
                    .and_then(|hash| store.create_user(username, &email, &hash, true))
                {
                    Ok(_) => info!("bootstrapped admin user '{username}'"),
                    Err(e) => error!("admin bootstrap failed: {e}"),
                }
            }
            None => warn!("no users exist; set ADMIN_USERNAME/ADMIN_PASSWORD to bootstrap one"),
        },
        Ok(_) => {}
        Err(e) => error!("cannot count users: {e}"),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let _ = dotenv::dotenv();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.log_level.to_lowercase()),
    )
    .init();
    info!("starting gatewatch");

    // store bootstrap failure is the one fatal startup path
    let store: Arc<dyn Store> = match SqliteStore::open(&cfg.database.sqlite_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("store bootstrap failed: {e}");
            std::process::exit(1);
        }
    };
    bootstrap_admin(&cfg, store.as_ref());

    let index = Arc::new(ThreatIndex::empty());
    if let Err(e) = index.rebuild(store.as_ref()) {
        error!("threat index bootstrap failed: {e}");
        std::process::exit(1);
    }
    let intel = Arc::new(ThreatIntel::new(store.clone(), index.clone()));
    if let Err(e) = intel.register_builtin_feeds() {
        error!("feed registration failed: {e}");
    }

    let whois = WhoisService::start(store.clone(), 2);
    let metrics = Arc::new(CaptureMetrics::default());
    let running = Arc::new(AtomicBool::new(true));

    let (dns_tx, dns_rx) = sync_channel(DNS_CHANNEL_DEPTH);
    let (flow_tx, flow_rx) = sync_channel(FLOW_CHANNEL_DEPTH);

    let capture_handle = capture::spawn(
        cfg.capture.clone(),
        dns_tx,
        flow_tx,
        running.clone(),
        metrics.clone(),
    );

    let ingest = DnsIngest::new(
        store.clone(),
        index.clone(),
        AlertWriter::new(store.clone(), index.clone()),
        whois.clone(),
    );
    let ingest_handle = thread::spawn(move || ingest.run(dns_rx));

    let aggregator = FlowAggregator::new(store.clone(), cfg.orphaned_ip_days);
    let aggregator_handle = thread::spawn(move || aggregator.run(flow_rx));

    let scheduler_handle = scheduler::spawn(intel.clone(), running.clone());

    let state = web::Data::new(AppState {
        store: store.clone(),
        index,
        intel,
        whois,
        metrics,
        orphaned_ip_days: cfg.orphaned_ip_days,
    });
    let key = session_key(cfg.api.cookie_key_hex.as_deref());

    info!("api listening on {}:{}", cfg.api.host, cfg.api.port);
    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(
                SessionMiddleware::builder(CookieSessionStore::default(), key.clone())
                    .cookie_secure(false)
                    .cookie_content_security(CookieContentSecurity::Private)
                    .build(),
            )
            .service(root)
            .service(health)
            .configure(routes::auth::configure)
            .configure(routes::users::configure)
            .configure(routes::dns::configure)
            .configure(routes::traffic::configure)
            .configure(routes::threat::configure)
            .configure(routes::dashboard::configure)
    })
    .bind((cfg.api.host.as_str(), cfg.api.port))?
    .run()
    .await;

    // Orderly drain: stop capture, let the pipelines run dry, flush the
    // flow cache once more, stop the scheduler.
    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    capture_handle.join().ok();
    ingest_handle.join().ok();
    aggregator_handle.join().ok();
    scheduler_handle.join().ok();
    info!("gatewatch stopped");

    result
}
