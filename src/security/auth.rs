use chrono::{Duration, Utc};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::State;

use crate::db::DbPool;
use crate::models::profile::{Profile, Session};
use crate::models::settings::Setting;
use crate::security::{constant_time_eq, hash_ip};

const SESSION_COOKIE: &str = "beatstore_session";

// ── Client IP request guard ──

/// Real client IP, honouring the usual proxy headers before the socket peer.
pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();
        for name in ["CF-Connecting-IP", "X-Real-IP"] {
            if let Some(ip) = headers.get_one(name).map(str::trim).filter(|ip| !ip.is_empty()) {
                return Outcome::Success(ClientIp(ip.to_string()));
            }
        }
        // X-Forwarded-For: leftmost entry is the original client
        if let Some(ip) = headers
            .get_one("X-Forwarded-For")
            .and_then(|f| f.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return Outcome::Success(ClientIp(ip.to_string()));
        }
        let ip = request
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

// ── Session guards ──

/// Any signed-in profile.
pub struct CustomerUser {
    pub profile: Profile,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CustomerUser {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match resolve_session_profile(request).await {
            Some(profile) => Outcome::Success(CustomerUser { profile }),
            None => Outcome::Forward(Status::Unauthorized),
        }
    }
}

/// Requires role = admin.
pub struct AdminUser {
    pub profile: Profile,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match resolve_session_profile(request).await {
            Some(profile) if profile.is_admin() => Outcome::Success(AdminUser { profile }),
            Some(_) => Outcome::Forward(Status::Forbidden),
            None => Outcome::Forward(Status::Unauthorized),
        }
    }
}

/// Who triggered a scheduler run: an admin session, or an external cron
/// presenting `Authorization: Bearer <scheduler_cron_secret>`.
pub enum SchedulerCaller {
    Admin(Profile),
    Cron,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SchedulerCaller {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(bearer) = request
            .headers()
            .get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
        {
            let Some(pool) = request.guard::<&State<DbPool>>().await.succeeded() else {
                return Outcome::Error((Status::InternalServerError, ()));
            };
            let secret = Setting::get_or(pool, "scheduler_cron_secret", "");
            if !secret.is_empty() && constant_time_eq(bearer.trim().as_bytes(), secret.as_bytes()) {
                return Outcome::Success(SchedulerCaller::Cron);
            }
            return Outcome::Forward(Status::Unauthorized);
        }
        match resolve_session_profile(request).await {
            Some(profile) if profile.is_admin() => Outcome::Success(SchedulerCaller::Admin(profile)),
            Some(_) => Outcome::Forward(Status::Forbidden),
            None => Outcome::Forward(Status::Unauthorized),
        }
    }
}

async fn resolve_session_profile(request: &Request<'_>) -> Option<Profile> {
    let pool = request.guard::<&State<DbPool>>().await.succeeded()?;
    let cookies = request.cookies();
    let session_id = cookies.get_private(SESSION_COOKIE)?.value().to_string();

    match Session::get_profile(pool, &session_id) {
        Some(profile) => Some(profile),
        None => {
            cookies.remove_private(Cookie::from(SESSION_COOKIE));
            None
        }
    }
}

// ── Passwords ──

pub fn hash_password(password: &str) -> Result<String, String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| e.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

// ── Sessions ──

pub fn create_session(pool: &DbPool, profile_id: &str, ip: Option<&str>) -> Result<String, String> {
    let expiry_hours = Setting::get_i64(pool, "session_expiry_hours").max(1);
    let expires = Utc::now().naive_utc() + Duration::hours(expiry_hours);
    let ip_hash = ip.map(hash_ip);
    Session::create(pool, profile_id, ip_hash.as_deref(), expires)
}

/// The Secure flag follows the site URL scheme, and is forced in production.
pub fn set_session_cookie(cookies: &CookieJar<'_>, session_id: &str, pool: &DbPool) {
    let secure = Setting::get_or(pool, "site_url", "").starts_with("https://")
        || crate::config::is_production(pool);

    let mut cookie = Cookie::new(SESSION_COOKIE, session_id.to_string());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_path("/");
    cookie.set_secure(secure);
    cookies.add_private(cookie);
}

/// Remove the cookie and its session row.
pub fn end_session(cookies: &CookieJar<'_>, pool: &DbPool) {
    if let Some(c) = cookies.get_private(SESSION_COOKIE) {
        let _ = Session::delete(pool, c.value());
    }
    cookies.remove_private(Cookie::from(SESSION_COOKIE));
}
