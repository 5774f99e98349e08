use std::sync::Arc;

use rocket::http::{CookieJar, Status};
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, bad_request, too_many_requests, ApiError};
use crate::db::DbPool;
use crate::models::profile::{BillingForm, Profile};
use crate::rate_limit::{self, RateLimiter};
use crate::security::auth::{self, ClientIp, CustomerUser};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct SignupForm {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

fn start_session(pool: &DbPool, cookies: &CookieJar<'_>, profile: &Profile, ip: &str) -> Result<(), ApiError> {
    let session_id = auth::create_session(pool, &profile.id, Some(ip))
        .map_err(|e| api_error(Status::InternalServerError, format!("Session creation failed: {}", e)))?;
    auth::set_session_cookie(cookies, &session_id, pool);
    Ok(())
}

/// Create an account. A guest profile left behind by an earlier checkout
/// with the same email is claimed instead of duplicated. The first account
/// on a store without an admin becomes the admin.
#[post("/api/auth/signup", format = "json", data = "<form>")]
pub fn signup(
    pool: &State<DbPool>,
    limiter: &State<Arc<RateLimiter>>,
    client_ip: ClientIp,
    cookies: &CookieJar<'_>,
    form: Json<SignupForm>,
) -> Result<Json<Value>, ApiError> {
    if !limiter.allow(pool, rate_limit::SIGNUP, &client_ip.0) {
        return Err(too_many_requests());
    }
    let email = form.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(bad_request("A valid email address is required"));
    }
    if form.password.len() < MIN_PASSWORD_LEN {
        return Err(bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let hash = auth::hash_password(&form.password).map_err(|e| api_error(Status::InternalServerError, e))?;

    let profile_id = match Profile::find_by_email(pool, &email) {
        Some(existing) if existing.is_guest() => {
            Profile::claim(pool, &existing.id, form.full_name.trim(), &hash).map_err(bad_request)?;
            log::info!("Guest profile {} claimed by signup", existing.id);
            existing.id
        }
        Some(_) => return Err(api_error(Status::Conflict, "An account with this email already exists")),
        None => {
            let role = if Profile::count_by_role(pool, "admin") == 0 {
                "admin"
            } else {
                "customer"
            };
            let id = Profile::create(pool, &email, form.full_name.trim(), Some(&hash), role).map_err(bad_request)?;
            if role == "admin" {
                log::warn!("First account {} created with the admin role", email);
            }
            id
        }
    };

    let profile = Profile::find_by_id(pool, &profile_id)
        .ok_or_else(|| api_error(Status::InternalServerError, "Profile not found after signup"))?;
    start_session(pool, cookies, &profile, &client_ip.0)?;
    Ok(Json(json!({ "ok": true, "profile": profile.safe_json() })))
}

#[post("/api/auth/login", format = "json", data = "<form>")]
pub fn login(
    pool: &State<DbPool>,
    limiter: &State<Arc<RateLimiter>>,
    client_ip: ClientIp,
    cookies: &CookieJar<'_>,
    form: Json<LoginForm>,
) -> Result<Json<Value>, ApiError> {
    if !limiter.allow(pool, rate_limit::LOGIN, &client_ip.0) {
        return Err(too_many_requests());
    }
    let invalid = || api_error(Status::Unauthorized, "Invalid credentials");

    let profile = Profile::find_by_email(pool, &form.email).ok_or_else(invalid)?;
    let hash = profile.password_hash.as_deref().ok_or_else(invalid)?;
    if !auth::verify_password(&form.password, hash) {
        return Err(invalid());
    }
    start_session(pool, cookies, &profile, &client_ip.0)?;
    Ok(Json(json!({ "ok": true, "profile": profile.safe_json() })))
}

#[post("/api/auth/logout")]
pub fn logout(pool: &State<DbPool>, cookies: &CookieJar<'_>) -> Json<Value> {
    auth::end_session(cookies, pool);
    Json(json!({ "ok": true }))
}

#[get("/api/auth/me")]
pub fn me(user: CustomerUser) -> Json<Value> {
    Json(json!({ "ok": true, "profile": user.profile.safe_json() }))
}

#[put("/api/auth/me/billing", format = "json", data = "<form>")]
pub fn update_billing(
    pool: &State<DbPool>,
    user: CustomerUser,
    form: Json<BillingForm>,
) -> Result<Json<Value>, ApiError> {
    Profile::update_billing(pool, &user.profile.id, &form).map_err(bad_request)?;
    let profile = Profile::find_by_id(pool, &user.profile.id).unwrap_or(user.profile);
    Ok(Json(json!({ "ok": true, "profile": profile.safe_json() })))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![signup, login, logout, me, update_billing]
}
