use std::sync::Arc;

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::db::DbPool;
use crate::models::order::Order;
use crate::models::profile::Profile;
use crate::models::scheduler::SchedulerState;
use crate::models::track::{Track, TrackFilter};
use crate::models::webhook_log::WebhookLog;
use crate::rate_limit::RateLimiter;
use crate::security::auth::AdminUser;

/// Passes outside production only. In production the debug routes answer
/// 404 as if they did not exist.
pub struct DevOnly;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for DevOnly {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(pool) = request.guard::<&State<DbPool>>().await.succeeded() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        if crate::config::is_production(pool) {
            Outcome::Forward(Status::NotFound)
        } else {
            Outcome::Success(DevOnly)
        }
    }
}

#[get("/api/debug/webhook-logs?<event_type>&<limit>")]
pub fn webhook_logs(
    _dev: DevOnly,
    _admin: AdminUser,
    pool: &State<DbPool>,
    event_type: Option<&str>,
    limit: Option<i64>,
) -> Json<Value> {
    let limit = limit.unwrap_or(50).clamp(1, 500);
    Json(json!({
        "ok": true,
        "logs": WebhookLog::recent(pool, event_type.filter(|t| !t.is_empty()), limit),
        "total": WebhookLog::count(pool),
    }))
}

/// Backfill profiles for orders whose user id points nowhere.
#[post("/api/debug/repair-profiles")]
pub fn repair_profiles(_dev: DevOnly, _admin: AdminUser, pool: &State<DbPool>) -> Result<Json<Value>, ApiError> {
    let created = Profile::repair_missing(pool).map_err(|e| api_error(Status::InternalServerError, e))?;
    log::info!("Profile repair created {} profiles", created);
    Ok(Json(json!({ "ok": true, "created": created })))
}

#[get("/api/debug/health")]
pub fn health(_dev: DevOnly, pool: &State<DbPool>, limiter: &State<Arc<RateLimiter>>) -> (Status, Json<Value>) {
    let db_ok = pool
        .get()
        .ok()
        .and_then(|c| c.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).ok())
        .is_some();
    if !db_ok {
        return (
            Status::ServiceUnavailable,
            Json(json!({ "ok": false, "database": "unreachable" })),
        );
    }
    let scheduler = SchedulerState::load(pool).ok();
    (
        Status::Ok,
        Json(json!({
            "ok": true,
            "database": "ok",
            "counts": {
                "profiles": Profile::count(pool),
                "orders": Order::count(pool),
                "tracks": Track::count(pool, &TrackFilter::default()),
                "webhook_logs": WebhookLog::count(pool),
            },
            "scheduler": scheduler,
            "rate_limited_clients": limiter.tracked_keys(),
        })),
    )
}

pub fn routes() -> Vec<rocket::Route> {
    routes![webhook_logs, repair_profiles, health]
}
