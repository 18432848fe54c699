use std::sync::atomic::Ordering;

use actix_session::Session;
use actix_web::{get, web, HttpResponse};
use serde::Deserialize;

use super::{current_user, AppState};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct StatsQuery {
    hours: Option<i64>,
}

#[get("/api/dashboard/stats")]
async fn stats(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<StatsQuery>,
) -> Result<HttpResponse> {
    current_user(&session, data.store.as_ref())?;
    let hours = query.hours.unwrap_or(24);
    if !(1..=24 * 365).contains(&hours) {
        return Err(Error::invalid("hours must be between 1 and 8760"));
    }
    let mut stats = data.store.dashboard_stats(hours)?;
    stats.dropped_dns_events = data.metrics.dropped_dns_events.load(Ordering::Relaxed);
    stats.dropped_l4_records = data.metrics.dropped_l4_records.load(Ordering::Relaxed);
    stats.dropped_whois_jobs = data.whois.dropped.load(Ordering::Relaxed);
    Ok(HttpResponse::Ok().json(stats))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(stats);
}
