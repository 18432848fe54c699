pub mod auth;
pub mod dashboard;
pub mod dns;
pub mod threat;
pub mod traffic;
pub mod users;

use std::sync::Arc;

use actix_session::Session;

use crate::capture::CaptureMetrics;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::model::User;
use crate::threat::index::ThreatIndex;
use crate::threat::intel::ThreatIntel;
use crate::whois::WhoisService;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub index: Arc<ThreatIndex>,
    pub intel: Arc<ThreatIntel>,
    pub whois: Arc<WhoisService>,
    pub metrics: Arc<CaptureMetrics>,
    pub orphaned_ip_days: i64,
}

/// The logged-in, active user behind a session cookie.
pub fn current_user(session: &Session, store: &dyn Store) -> Result<User> {
    let user_id = session
        .get::<i64>("user_id")
        .map_err(|_| Error::Unauthorized)?
        .ok_or(Error::Unauthorized)?;
    let user = store.user_by_id(user_id)?.ok_or(Error::Unauthorized)?;
    if !user.is_active {
        return Err(Error::Forbidden("account is inactive".into()));
    }
    Ok(user)
}

pub fn require_admin(session: &Session, store: &dyn Store) -> Result<User> {
    let user = current_user(session, store)?;
    if !user.is_admin {
        return Err(Error::Forbidden("admin privileges required".into()));
    }
    Ok(user)
}

pub fn validate_days(days: i64) -> Result<()> {
    if !(1..=365).contains(&days) {
        return Err(Error::invalid("days must be between 1 and 365"));
    }
    Ok(())
}

pub fn validate_limit(limit: i64, max: i64) -> Result<()> {
    if !(1..=max).contains(&limit) {
        return Err(Error::invalid(format!("limit must be between 1 and {max}")));
    }
    Ok(())
}
