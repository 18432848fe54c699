use actix_session::Session;
use actix_web::{delete, get, put, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use super::{require_admin, validate_limit, AppState};
use crate::db::UserUpdate;
use crate::error::{Error, Result};
use crate::routes::auth::hash_password;

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[get("/api/users")]
async fn list_users(
    data: web::Data<AppState>,
    session: Session,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let limit = query.limit.unwrap_or(100);
    validate_limit(limit, 1000)?;
    let offset = query.offset.unwrap_or(0).max(0);
    let users = data.store.list_users(limit, offset)?;
    Ok(HttpResponse::Ok().json(users))
}

#[get("/api/users/{id}")]
async fn get_user(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    let user = data
        .store
        .user_by_id(path.into_inner())?
        .ok_or_else(|| Error::not_found("user not found"))?;
    Ok(HttpResponse::Ok().json(&user))
}

#[derive(Deserialize)]
struct UserPatch {
    email: Option<String>,
    password: Option<String>,
    is_admin: Option<bool>,
    is_active: Option<bool>,
}

#[put("/api/users/{id}")]
async fn update_user(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<i64>,
    body: web::Json<UserPatch>,
) -> Result<HttpResponse> {
    let admin = require_admin(&session, data.store.as_ref())?;
    let id = path.into_inner();
    // an admin cannot lock themselves out
    if id == admin.id && (body.is_admin == Some(false) || body.is_active == Some(false)) {
        return Err(Error::invalid("cannot demote or deactivate your own account"));
    }
    let hashed_password = match &body.password {
        Some(pw) if !pw.is_empty() => Some(hash_password(pw)?),
        Some(_) => return Err(Error::invalid("password must not be empty")),
        None => None,
    };
    let changed = data.store.update_user(
        id,
        &UserUpdate {
            email: body.email.clone(),
            hashed_password,
            is_admin: body.is_admin,
            is_active: body.is_active,
        },
    )?;
    if !changed {
        return Err(Error::not_found("user not found"));
    }
    let user = data
        .store
        .user_by_id(id)?
        .ok_or_else(|| Error::not_found("user not found"))?;
    Ok(HttpResponse::Ok().json(&user))
}

#[delete("/api/users/{id}")]
async fn delete_user(
    data: web::Data<AppState>,
    session: Session,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let admin = require_admin(&session, data.store.as_ref())?;
    let id = path.into_inner();
    if id == admin.id {
        return Err(Error::invalid("cannot delete your own account"));
    }
    if !data.store.delete_user(id)? {
        return Err(Error::not_found("user not found"));
    }
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_users)
        .service(get_user)
        .service(update_user)
        .service(delete_user);
}
