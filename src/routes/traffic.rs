use actix_session::Session;
use actix_web::{get, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{current_user, validate_limit, AppState};
use crate::error::Result;

#[derive(Deserialize)]
struct RangeQuery {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[get("/api/traffic/domain/{domain}")]
async fn by_domain(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let rows = data.store.traffic_by_domain(
        &path.into_inner().to_lowercase(),
        query.start_time,
        query.end_time,
    )?;
    Ok(HttpResponse::Ok().json(rows))
}

#[derive(Serialize)]
struct VolumePoint {
    timestamp: DateTime<Utc>,
    bytes_sent: i64,
    bytes_received: i64,
    total_bytes: i64,
}

#[get("/api/traffic/domain/{domain}/volume")]
async fn volume_by_domain(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<String>,
    query: web::Query<RangeQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let flows = data.store.traffic_by_domain(
        &path.into_inner().to_lowercase(),
        query.start_time,
        query.end_time,
    )?;
    let points: Vec<VolumePoint> = flows
        .iter()
        .map(|flow| VolumePoint {
            timestamp: flow.last_update,
            bytes_sent: flow.bytes_sent,
            bytes_received: flow.bytes_received,
            total_bytes: flow.bytes_sent + flow.bytes_received,
        })
        .collect();
    Ok(HttpResponse::Ok().json(points))
}

#[derive(Deserialize)]
struct TopQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[get("/api/traffic/top-domains")]
async fn top_domains(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<TopQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(50);
    validate_limit(limit, 1000)?;
    let offset = query.offset.unwrap_or(0).max(0);

    let domains = data
        .store
        .top_domains(limit, offset, query.start_time, query.end_time)?;
    let total = data.store.top_domains_count(query.start_time, query.end_time)?;
    Ok(HttpResponse::Ok().json(json!({
        "domains": domains,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(volume_by_domain)
        .service(by_domain)
        .service(top_domains);
}
