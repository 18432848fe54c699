use actix_session::Session;
use actix_web::{get, post, web, HttpResponse};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use log::warn;
use serde::Deserialize;
use serde_json::json;

use super::{current_user, require_admin, AppState};
use crate::db::UserUpdate;
use crate::error::{Error, Result};

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("password hash failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[post("/api/auth/login")]
async fn login(
    data: web::Data<AppState>,
    body: web::Json<LoginRequest>,
    session: Session,
) -> Result<HttpResponse> {
    let user = match data.store.user_by_username(&body.username)? {
        Some(user) if verify_password(&body.password, &user.hashed_password) => user,
        _ => {
            warn!("failed login attempt for '{}'", body.username);
            return Err(Error::Unauthorized);
        }
    };
    if !user.is_active {
        return Err(Error::Forbidden("account is inactive".into()));
    }
    session
        .insert("user_id", user.id)
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(HttpResponse::Ok().json(&user))
}

#[post("/api/auth/logout")]
async fn logout(session: Session) -> HttpResponse {
    session.purge();
    HttpResponse::Ok().json(json!({ "success": true }))
}

#[get("/api/auth/me")]
async fn me(data: web::Data<AppState>, session: Session) -> Result<HttpResponse> {
    let user = current_user(&session, data.store.as_ref())?;
    Ok(HttpResponse::Ok().json(&user))
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    #[serde(default)]
    is_admin: bool,
}

/// Account creation is an admin action; the first admin comes from the
/// startup bootstrap.
#[post("/api/auth/register")]
async fn register(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse> {
    require_admin(&session, data.store.as_ref())?;
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(Error::invalid("username and password are required"));
    }
    if data.store.user_by_username(&body.username)?.is_some() {
        return Err(Error::StoreConflict("username already registered".into()));
    }
    let hashed = hash_password(&body.password)?;
    let id = data
        .store
        .create_user(&body.username, &body.email, &hashed, body.is_admin)?;
    let user = data
        .store
        .user_by_id(id)?
        .ok_or_else(|| Error::Internal("created user not found".into()))?;
    Ok(HttpResponse::Created().json(&user))
}

#[derive(Deserialize)]
struct PasswordChange {
    current_password: String,
    new_password: String,
}

#[post("/api/auth/change-password")]
async fn change_password(
    data: web::Data<AppState>,
    session: Session,
    body: web::Json<PasswordChange>,
) -> Result<HttpResponse> {
    let user = current_user(&session, data.store.as_ref())?;
    if !verify_password(&body.current_password, &user.hashed_password) {
        return Err(Error::invalid("current password is incorrect"));
    }
    if body.new_password.is_empty() {
        return Err(Error::invalid("new password must not be empty"));
    }
    let hashed = hash_password(&body.new_password)?;
    data.store.update_user(
        user.id,
        &UserUpdate {
            email: None,
            hashed_password: Some(hashed),
            is_admin: None,
            is_active: None,
        },
    )?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(login)
        .service(logout)
        .service(me)
        .service(register)
        .service(change_password);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_and_rejects() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-phc-string"));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
    }
}
