use actix_multipart::Multipart;
use actix_session::Session;
use actix_web::{delete, get, post, put, web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use log::info;
use serde::Deserialize;
use serde_json::json;

use super::{current_user, require_admin, validate_days, validate_limit, AppState};
use crate::alerts::AlertWriter;
use crate::db::AlertFilter;
use crate::error::{Error, Result};
use crate::model::WhitelistEntry;
use crate::threat::rescan;

/* Orphaned-IP analytic */

#[derive(Deserialize)]
struct OrphanedQuery {
    days: Option<i64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[get("/api/threat/orphaned-ips")]
async fn orphaned_ips(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<OrphanedQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let days = query.days.unwrap_or(7);
    validate_days(days)?;
    let start = query
        .start_time
        .unwrap_or_else(|| Utc::now() - chrono::Duration::days(days));
    let end = query.end_time.unwrap_or_else(Utc::now);
    Ok(HttpResponse::Ok().json(data.store.orphaned_aggregate(start, end)?))
}

/* Feeds */

#[get("/api/threat/feeds")]
async fn list_feeds(data: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    Ok(HttpResponse::Ok().json(data.store.list_feeds()?))
}

#[derive(Deserialize)]
struct UpdateQuery {
    #[serde(default)]
    force: bool,
}

#[post("/api/threat/feeds/{name}/update")]
async fn update_feed(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<UpdateQuery>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let name = path.into_inner();
    let force = query.force;
    let intel = data.intel.clone();
    let summary = web::block(move || intel.update_feed(&name, force))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "feed": summary.feed,
        "domains": summary.domains,
        "ips": summary.ips,
        "indicator_count": summary.indicator_count,
        "last_update": summary.last_update,
    })))
}

#[derive(Deserialize)]
struct ToggleQuery {
    enabled: bool,
}

/// Flips the metadata flag only; installed indicators stay put.
#[put("/api/threat/feeds/{name}/toggle")]
async fn toggle_feed(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<ToggleQuery>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let name = path.into_inner();
    if !data.store.set_feed_enabled(&name, query.enabled)? {
        return Err(Error::not_found(format!("feed '{name}' not found")));
    }
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "feed": name,
        "enabled": query.enabled,
    })))
}

#[derive(Deserialize)]
struct FeedConfigBody {
    level: Option<u8>,
}

#[put("/api/threat/feeds/{name}/config")]
async fn update_feed_config(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    body: web::Json<FeedConfigBody>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let name = path.into_inner();
    if data.store.feed_meta(&name)?.is_none() {
        return Err(Error::not_found(format!("feed '{name}' not found")));
    }
    if name.starts_with("IPsum-L") {
        let level = body
            .level
            .ok_or_else(|| Error::invalid("level is required for IPsum feeds"))?;
        let new_name = data.intel.set_ipsum_level(level)?;
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "feed_name": new_name,
            "message": format!(
                "IPsum feed switched to level {level}; run an update to download indicators"
            ),
        })));
    }
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "feed_name": name,
        "message": "configuration unchanged",
    })))
}

/* Custom feed indicators */

#[derive(Deserialize)]
struct CustomIndicatorBody {
    feed_name: String,
    indicator_type: String,
    domain: Option<String>,
    ip: Option<String>,
}

fn validate_indicator(indicator_type: &str, domain: &Option<String>, ip: &Option<String>) -> Result<()> {
    match indicator_type {
        "domain" => domain
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(|_| ())
            .ok_or_else(|| Error::invalid("domain is required when indicator_type is 'domain'")),
        "ip" => ip
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .map(|_| ())
            .ok_or_else(|| Error::invalid("ip is required when indicator_type is 'ip'")),
        _ => Err(Error::invalid("indicator_type must be 'domain' or 'ip'")),
    }
}

#[post("/api/threat/feeds/custom/add")]
async fn add_custom_indicator(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<CustomIndicatorBody>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    validate_indicator(&body.indicator_type, &body.domain, &body.ip)?;
    let id = data.intel.add_custom_indicator(
        &body.feed_name,
        &body.indicator_type,
        body.domain.as_deref(),
        body.ip.as_deref(),
    )?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "indicator_id": id,
    })))
}

#[derive(Deserialize)]
struct CustomIndicatorQuery {
    feed_name: String,
    indicator_type: String,
    domain: Option<String>,
    ip: Option<String>,
}

#[delete("/api/threat/feeds/custom/remove")]
async fn remove_custom_indicator(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<CustomIndicatorQuery>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    validate_indicator(&query.indicator_type, &query.domain, &query.ip)?;
    let removed = data.intel.remove_custom_indicator(
        &query.feed_name,
        &query.indicator_type,
        query.domain.as_deref(),
        query.ip.as_deref(),
    )?;
    if !removed {
        return Err(Error::not_found("indicator not found"));
    }
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct IndicatorListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[get("/api/threat/feeds/custom/{name}/indicators")]
async fn custom_feed_indicators(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<IndicatorListQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(1000);
    validate_limit(limit, 10000)?;
    let offset = query.offset.unwrap_or(0).max(0);
    let indicators = data.store.feed_indicators(&path.into_inner(), limit, offset)?;
    Ok(HttpResponse::Ok().json(json!({
        "count": indicators.len(),
        "indicators": indicators,
    })))
}

/* Alerts */

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<i64>,
    since: Option<DateTime<Utc>>,
    resolved: Option<bool>,
}

#[get("/api/threat/alerts")]
async fn alerts(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<AlertsQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(100);
    validate_limit(limit, 1000)?;
    let rows = data.store.alerts(&AlertFilter {
        limit,
        since: query.since,
        resolved: query.resolved,
    })?;
    Ok(HttpResponse::Ok().json(rows))
}

#[get("/api/threat/alerts/count")]
async fn alerts_count(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<AlertsQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let count = data.store.alerts_count(query.since, query.resolved)?;
    Ok(HttpResponse::Ok().json(json!({ "count": count })))
}

#[post("/api/threat/alerts/{id}/resolve")]
async fn resolve_alert(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    if !data.store.resolve_alert(path.into_inner())? {
        return Err(Error::not_found("alert not found"));
    }
    Ok(HttpResponse::Ok().json(json!({ "success": true, "message": "alert resolved" })))
}

#[post("/api/threat/alerts/resolve-batch")]
async fn resolve_alerts_batch(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<Vec<i64>>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    if body.is_empty() {
        return Err(Error::invalid("alert id list must not be empty"));
    }
    if body.len() > 1000 {
        return Err(Error::invalid("cannot resolve more than 1000 alerts at once"));
    }
    let resolved = data.store.resolve_alerts_batch(&body)?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "resolved_count": resolved,
    })))
}

/* Whitelist */

#[derive(Deserialize)]
struct WhitelistQuery {
    limit: Option<i64>,
    indicator_type: Option<String>,
}

#[get("/api/threat/whitelist")]
async fn list_whitelist(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<WhitelistQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(100);
    validate_limit(limit, 1000)?;
    if let Some(indicator_type) = &query.indicator_type {
        if indicator_type != "domain" && indicator_type != "ip" {
            return Err(Error::invalid("indicator_type must be 'domain' or 'ip'"));
        }
    }
    let entries = data
        .store
        .list_whitelist(limit, query.indicator_type.as_deref())?;
    Ok(HttpResponse::Ok().json(entries))
}

#[derive(Deserialize)]
struct WhitelistAddBody {
    indicator_type: String,
    domain: Option<String>,
    ip: Option<String>,
    reason: Option<String>,
}

/// Whitelisting an indicator also closes every open alert it matches.
#[post("/api/threat/whitelist")]
async fn add_whitelist(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<WhitelistAddBody>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    validate_indicator(&body.indicator_type, &body.domain, &body.ip)?;

    let (entry, _created) = data.store.add_whitelist(
        &body.indicator_type,
        body.domain.as_deref(),
        body.ip.as_deref(),
        body.reason.as_deref(),
    )?;
    let resolved = data
        .store
        .resolve_alerts_by_indicator(entry.domain.as_deref(), entry.ip.as_deref())?;
    if resolved > 0 {
        info!(
            "whitelisting {} resolved {resolved} open alert(s)",
            entry.domain.as_deref().or(entry.ip.as_deref()).unwrap_or("?")
        );
    }
    data.index.rebuild(data.store.as_ref())?;
    Ok(HttpResponse::Created().json(json!({
        "entry": entry,
        "resolved_alerts": resolved,
    })))
}

#[delete("/api/threat/whitelist/{id}")]
async fn remove_whitelist(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    if !data.store.remove_whitelist(path.into_inner())? {
        return Err(Error::not_found("whitelist entry not found"));
    }
    data.index.rebuild(data.store.as_ref())?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

pub const WHITELIST_CSV_HEADER: &str = "id,indicator_type,domain,ip,reason,created_at";

#[get("/api/threat/whitelist/export")]
async fn export_whitelist(data: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let entries = data.store.list_whitelist(10000, None)?;
    let csv = whitelist_to_csv(&entries)?;
    let filename = format!(
        "threat_whitelist_{}.csv",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    Ok(HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{filename}\""),
        ))
        .body(csv))
}

#[post("/api/threat/whitelist/import")]
async fn import_whitelist(
    data: web::Data<AppState>,
    session: Session,
    mut payload: Multipart,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;

    let mut content: Option<Vec<u8>> = None;
    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| Error::invalid(e.to_string()))?;
        let filename = field
            .content_disposition()
            .get_filename()
            .map(str::to_string);
        let mut buf = Vec::new();
        while let Some(chunk) = field.next().await {
            let bytes = chunk.map_err(|e| Error::invalid(e.to_string()))?;
            buf.extend_from_slice(&bytes);
        }
        if let Some(name) = filename {
            if !name.to_lowercase().ends_with(".csv") {
                return Err(Error::invalid("file must be a CSV file"));
            }
            content = Some(buf);
            break;
        }
    }
    let content = content.ok_or_else(|| Error::invalid("no file uploaded"))?;
    let text =
        String::from_utf8(content).map_err(|_| Error::invalid("file must be UTF-8 encoded"))?;

    let outcome = import_whitelist_csv(&text, data.get_ref())?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "added": outcome.added,
        "skipped": outcome.skipped,
        "errors": outcome.error_count,
        "error_details": outcome.errors,
    })))
}

/* Historical rescan */

#[derive(Deserialize)]
struct ScanQuery {
    days: Option<i64>,
}

#[post("/api/threat/scan-historical")]
async fn scan_historical(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<ScanQuery>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let days = query.days.unwrap_or(30);
    validate_days(days)?;

    let store = data.store.clone();
    let snapshot = data.index.snapshot();
    let writer = AlertWriter::new(data.store.clone(), data.index.clone());
    let summary = web::block(move || rescan::scan_historical(store.as_ref(), &snapshot, &writer, days))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    Ok(HttpResponse::Ok().json(summary))
}

/* Lookback configuration */

#[get("/api/threat/config")]
async fn get_config(data: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let days = data
        .store
        .get_setting("orphaned_ip_days")?
        .and_then(|v| v.as_i64())
        .unwrap_or(data.orphaned_ip_days);
    Ok(HttpResponse::Ok().json(json!({ "lookback_days": days })))
}

#[derive(Deserialize)]
struct ConfigBody {
    lookback_days: i64,
}

#[put("/api/threat/config")]
async fn put_config(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<ConfigBody>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    validate_days(body.lookback_days)?;
    data.store
        .set_setting("orphaned_ip_days", &json!(body.lookback_days))?;
    Ok(HttpResponse::Ok().json(json!({ "lookback_days": body.lookback_days })))
}

/* CSV plumbing */

pub fn whitelist_to_csv(entries: &[WhitelistEntry]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(WHITELIST_CSV_HEADER.split(','))
        .map_err(|e| Error::Internal(e.to_string()))?;
    for entry in entries {
        writer
            .write_record([
                entry.id.to_string(),
                entry.indicator_type.clone(),
                entry.domain.clone().unwrap_or_default(),
                entry.ip.clone().unwrap_or_default(),
                entry.reason.clone().unwrap_or_default(),
                entry.created_at.to_rfc3339(),
            ])
            .map_err(|e| Error::Internal(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Internal(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::Internal(e.to_string()))
}

pub struct ImportOutcome {
    pub added: usize,
    pub skipped: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

/// Imports whitelist rows. Column order follows the header; `id` and
/// `created_at` are ignored. Row errors are collected (first 10 reported)
/// without aborting the import.
fn import_whitelist_csv(text: &str, state: &AppState) -> Result<ImportOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| Error::invalid(format!("bad csv header: {e}")))?
        .iter()
        .map(|c| c.to_lowercase())
        .collect();
    if columns.iter().all(|c| c.is_empty()) {
        return Err(Error::invalid("csv file is empty"));
    }
    let col = |name: &str| columns.iter().position(|c| c == name);
    let type_col = col("indicator_type")
        .ok_or_else(|| Error::invalid("csv header must contain indicator_type"))?;
    let domain_col = col("domain");
    let ip_col = col("ip");
    let reason_col = col("reason");

    let mut outcome = ImportOutcome {
        added: 0,
        skipped: 0,
        error_count: 0,
        errors: Vec::new(),
    };
    let record_error = |outcome: &mut ImportOutcome, msg: String| {
        outcome.error_count += 1;
        if outcome.errors.len() < 10 {
            outcome.errors.push(msg);
        }
    };

    for (idx, record) in reader.records().enumerate() {
        let row_num = idx + 2;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                record_error(&mut outcome, format!("row {row_num}: {e}"));
                continue;
            }
        };
        let get = |i: Option<usize>| -> Option<String> {
            i.and_then(|i| record.get(i))
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };

        let indicator_type = get(Some(type_col)).unwrap_or_default().to_lowercase();
        let domain = get(domain_col);
        let ip = get(ip_col);
        let reason = get(reason_col);

        if indicator_type != "domain" && indicator_type != "ip" {
            record_error(
                &mut outcome,
                format!("row {row_num}: invalid indicator_type '{indicator_type}'"),
            );
            continue;
        }
        if indicator_type == "domain" && domain.is_none() {
            record_error(&mut outcome, format!("row {row_num}: domain is required"));
            continue;
        }
        if indicator_type == "ip" && ip.is_none() {
            record_error(&mut outcome, format!("row {row_num}: ip is required"));
            continue;
        }

        match state.store.add_whitelist(
            &indicator_type,
            domain.as_deref(),
            ip.as_deref(),
            reason.as_deref(),
        ) {
            Ok((_, true)) => outcome.added += 1,
            Ok((_, false)) => outcome.skipped += 1,
            Err(e) => record_error(&mut outcome, format!("row {row_num}: {e}")),
        }
    }

    if outcome.added > 0 {
        state.index.rebuild(state.store.as_ref())?;
    }
    Ok(outcome)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(orphaned_ips)
        .service(list_feeds)
        .service(add_custom_indicator)
        .service(remove_custom_indicator)
        .service(custom_feed_indicators)
        .service(update_feed)
        .service(toggle_feed)
        .service(update_feed_config)
        .service(alerts_count)
        .service(resolve_alerts_batch)
        .service(resolve_alert)
        .service(alerts)
        .service(export_whitelist)
        .service(import_whitelist)
        .service(list_whitelist)
        .service(add_whitelist)
        .service(remove_whitelist)
        .service(scan_historical)
        .service(get_config)
        .service(put_config);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capture::CaptureMetrics;
    use crate::db::{SqliteStore, Store};
    use crate::threat::index::ThreatIndex;
    use crate::threat::intel::ThreatIntel;
    use crate::whois::WhoisService;

    fn entry(id: i64, domain: Option<&str>, ip: Option<&str>, reason: Option<&str>) -> WhitelistEntry {
        WhitelistEntry {
            id,
            indicator_type: if domain.is_some() { "domain" } else { "ip" }.to_string(),
            domain: domain.map(String::from),
            ip: ip.map(String::from),
            reason: reason.map(String::from),
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn app_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threat-routes.db");
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
        let index = Arc::new(ThreatIndex::empty());
        let intel = Arc::new(ThreatIntel::new(store.clone(), index.clone()));
        let whois = WhoisService::start(store.clone(), 1);
        let state = AppState {
            store,
            index,
            intel,
            whois,
            metrics: Arc::new(CaptureMetrics::default()),
            orphaned_ip_days: 7,
        };
        (dir, state)
    }

    #[test]
    fn csv_export_header_and_quoting() {
        let rows = vec![
            entry(1, Some("safe.io"), None, Some("known good")),
            entry(2, None, Some("203.0.113.9"), Some("partner, upstream \"A\"")),
        ];
        let csv = whitelist_to_csv(&rows).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), WHITELIST_CSV_HEADER);
        assert!(lines.next().unwrap().starts_with("1,domain,safe.io,,known good,"));
        let second = lines.next().unwrap();
        assert!(second.contains("\"partner, upstream \"\"A\"\"\""));
    }

    #[test]
    fn export_import_roundtrip_keeps_logical_set() {
        let (_src_dir, src) = app_state();
        src.store
            .add_whitelist("domain", Some("safe.io"), None, Some("line one\nline two"))
            .unwrap();
        src.store
            .add_whitelist("ip", None, Some("203.0.113.9"), Some("with, comma"))
            .unwrap();
        let csv = whitelist_to_csv(&src.store.list_whitelist(100, None).unwrap()).unwrap();

        let (_dst_dir, dst) = app_state();
        let outcome = import_whitelist_csv(&csv, &dst).unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.error_count, 0);

        let imported = dst.store.list_whitelist(100, None).unwrap();
        assert_eq!(imported.len(), 2);
        let domain_row = imported.iter().find(|e| e.indicator_type == "domain").unwrap();
        assert_eq!(domain_row.domain.as_deref(), Some("safe.io"));
        // a multi-line reason survives the quoted-newline encoding
        assert_eq!(domain_row.reason.as_deref(), Some("line one\nline two"));
        let ip_row = imported.iter().find(|e| e.indicator_type == "ip").unwrap();
        assert_eq!(ip_row.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(ip_row.reason.as_deref(), Some("with, comma"));

        // importing the same export again only skips
        let again = import_whitelist_csv(&csv, &dst).unwrap();
        assert_eq!(again.added, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(again.error_count, 0);
    }

    #[test]
    fn import_collects_row_errors_and_ignores_id_columns() {
        let (_dir, state) = app_state();
        let csv = "id,indicator_type,domain,ip,reason,created_at\n\
                   999,domain,ok.example,,imported,2020-01-01T00:00:00Z\n\
                   1000,bogus,x.example,,,\n\
                   1001,domain,,,missing domain,\n";
        let outcome = import_whitelist_csv(csv, &state).unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.error_count, 2);
        assert!(outcome.errors[0].contains("row 3"));
        assert!(outcome.errors[1].contains("row 4"));

        let entries = state.store.list_whitelist(10, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].domain.as_deref(), Some("ok.example"));
        // ids are assigned locally, not taken from the file
        assert_ne!(entries[0].id, 999);
    }

    #[test]
    fn import_rejects_missing_header_and_empty_file() {
        let (_dir, state) = app_state();
        assert!(matches!(
            import_whitelist_csv("a,b,c\n1,2,3\n", &state),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            import_whitelist_csv("", &state),
            Err(Error::Invalid(_))
        ));
    }
}
