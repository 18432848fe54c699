use actix_session::Session;
use actix_web::{get, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{current_user, validate_days, validate_limit, AppState};
use crate::db::DnsEventFilter;
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct SearchQuery {
    query: String,
    limit: Option<i64>,
}

#[get("/api/dns/search")]
async fn search_domains(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    if query.query.is_empty() {
        return Err(Error::invalid("query string must not be empty"));
    }
    let limit = query.limit.unwrap_or(100);
    validate_limit(limit, 1000)?;
    Ok(HttpResponse::Ok().json(data.store.search_domains(&query.query, limit)?))
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<i64>,
    since: Option<DateTime<Utc>>,
}

#[get("/api/dns/recent")]
async fn recent(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<RecentQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(100);
    validate_limit(limit, 1000)?;
    Ok(HttpResponse::Ok().json(data.store.recent_dns_lookups(limit, query.since)?))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
    since: Option<DateTime<Utc>>,
    source_ip: Option<String>,
    domain: Option<String>,
    event_type: Option<String>,
}

#[get("/api/dns/events")]
async fn events(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(500);
    validate_limit(limit, 5000)?;
    if let Some(event_type) = &query.event_type {
        if event_type != "query" && event_type != "response" {
            return Err(Error::invalid("event_type must be 'query' or 'response'"));
        }
    }
    let rows = data.store.dns_events(&DnsEventFilter {
        limit,
        since: query.since,
        source_ip: query.source_ip.clone(),
        domain: query.domain.as_ref().map(|d| d.to_lowercase()),
        event_type: query.event_type.clone(),
    })?;
    Ok(HttpResponse::Ok().json(rows))
}

#[get("/api/dns/domain/{domain}")]
async fn domain_info(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let row = data
        .store
        .dns_lookup_by_domain(&path.into_inner().to_lowercase())?
        .ok_or_else(|| Error::not_found("domain not found"))?;
    Ok(HttpResponse::Ok().json(row))
}

#[derive(Deserialize)]
struct WhoisQuery {
    #[serde(default)]
    force_refresh: bool,
}

#[get("/api/dns/domain/{domain}/whois")]
async fn domain_whois(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<WhoisQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let domain = path.into_inner().to_lowercase();
    let whois = data.whois.clone();
    let force = query.force_refresh;
    let result = web::block(move || whois.lookup(&domain, force))
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
    match result {
        Some(value) => Ok(HttpResponse::Ok().json(value)),
        None => Err(Error::not_found("whois data not available for this domain")),
    }
}

#[derive(Deserialize)]
struct ByIpQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    days: Option<i64>,
}

#[get("/api/dns/ip/{ip}")]
async fn lookups_by_ip(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<ByIpQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let ip = path.into_inner();
    if ip.trim().is_empty() {
        return Err(Error::invalid("ip address is required"));
    }
    let limit = query.limit.unwrap_or(1000);
    validate_limit(limit, 1000)?;
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(Error::invalid("offset must be >= 0"));
    }
    let days = query.days.unwrap_or(30);
    validate_days(days)?;

    let since = Utc::now() - chrono::Duration::days(days);
    let (rows, total) = data.store.dns_lookups_by_ip(ip.trim(), since, limit, offset)?;
    let returned = rows.len() as i64;
    Ok(HttpResponse::Ok().json(json!({
        "results": rows,
        "total": total,
        "limit": limit,
        "offset": offset,
        "has_more": offset + returned < total,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(search_domains)
        .service(recent)
        .service(events)
        .service(domain_whois)
        .service(domain_info)
        .service(lookups_by_ip);
}
