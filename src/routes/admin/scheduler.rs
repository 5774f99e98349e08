use std::sync::Arc;

use chrono::Utc;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::tokio::task::spawn_blocking;
use rocket::State;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::DataDir;
use crate::db::DbPool;
use crate::models::scheduler::{self as store, SchedulerError};
use crate::routes::{api_error, ApiError};
use crate::scheduler::{self, Downloader};
use crate::security::auth::{AdminUser, SchedulerCaller};

fn scheduler_error(e: SchedulerError) -> ApiError {
    let status = match e {
        SchedulerError::Conflict => Status::Conflict,
        SchedulerError::Invalid(_) => Status::BadRequest,
        SchedulerError::Db(_) => Status::InternalServerError,
    };
    api_error(status, e.to_string())
}

#[get("/api/scheduler/status")]
pub fn status(_admin: AdminUser, pool: &State<DbPool>) -> Result<Json<Value>, ApiError> {
    let snapshot = store::snapshot(pool).map_err(scheduler_error)?;
    let due = store::SchedulerState {
        active: snapshot.active,
        next_run: snapshot.next_run,
        version: snapshot.version,
    }
    .is_due(Utc::now().naive_utc());
    Ok(Json(json!({ "ok": true, "due": due, "scheduler": snapshot })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ToggleRequest {
    /// Version the client last saw. Omit to toggle whatever is current.
    pub version: Option<i64>,
}

#[post("/api/scheduler/toggle", data = "<body>")]
pub fn toggle(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    body: Option<Json<ToggleRequest>>,
) -> Result<Json<Value>, ApiError> {
    let expected = body.and_then(|b| b.version);
    let state = scheduler::toggle(pool, &dirs.scheduler_snapshot(), expected, Utc::now().naive_utc())
        .map_err(scheduler_error)?;
    Ok(Json(json!({ "ok": true, "state": state })))
}

#[get("/api/scheduler/sources")]
pub fn list_sources(_admin: AdminUser, pool: &State<DbPool>) -> Json<Value> {
    Json(json!({ "ok": true, "sources": store::list_sources(pool) }))
}

#[derive(Debug, Deserialize)]
pub struct NewSource {
    pub url: String,
    /// Version the client last saw; edits on a stale view answer 409.
    pub version: Option<i64>,
}

fn current_version(pool: &DbPool) -> Option<i64> {
    store::SchedulerState::load(pool).ok().map(|s| s.version)
}

#[post("/api/scheduler/sources", format = "json", data = "<body>")]
pub fn add_source(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    body: Json<NewSource>,
) -> Result<Json<Value>, ApiError> {
    let source = store::add_source(pool, &body.url, body.version).map_err(scheduler_error)?;
    store::log(pool, "info", &format!("Source added: {} ({})", source.url, source.source_type));
    store::write_snapshot(pool, &dirs.scheduler_snapshot());
    Ok(Json(json!({ "ok": true, "source": source, "version": current_version(pool) })))
}

#[delete("/api/scheduler/sources/<id>?<version>")]
pub fn delete_source(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    id: &str,
    version: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    store::delete_source(pool, id, version).map_err(scheduler_error)?;
    store::log(pool, "info", &format!("Source {} removed", id));
    store::write_snapshot(pool, &dirs.scheduler_snapshot());
    Ok(Json(json!({ "ok": true, "version": current_version(pool) })))
}

#[post("/api/scheduler/sources/<id>/toggle?<version>")]
pub fn toggle_source(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    id: &str,
    version: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    let active = store::toggle_source(pool, id, version).map_err(scheduler_error)?;
    store::write_snapshot(pool, &dirs.scheduler_snapshot());
    Ok(Json(json!({ "ok": true, "active": active, "version": current_version(pool) })))
}

/// Run the scheduler now. Without `force` this is a no-op unless a run is
/// due, so an external cron can call it as often as it likes.
#[post("/api/scheduler/run?<force>")]
pub async fn run(
    caller: SchedulerCaller,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    downloader: &State<Arc<dyn Downloader>>,
    force: Option<bool>,
) -> Result<Json<Value>, ApiError> {
    let force = force.unwrap_or(false);
    let who = match &caller {
        SchedulerCaller::Admin(p) => p.email.clone(),
        SchedulerCaller::Cron => "cron".to_string(),
    };
    log::info!("[scheduler] run requested by {} (force: {})", who, force);

    let pool = pool.inner().clone();
    let downloader = Arc::clone(downloader.inner());
    let dirs = dirs.inner().clone();
    let report = spawn_blocking(move || {
        scheduler::run_if_due(
            &pool,
            downloader.as_ref(),
            &dirs.downloads(),
            &dirs.scheduler_snapshot(),
            Utc::now().naive_utc(),
            force,
        )
    })
    .await
    .map_err(|e| api_error(Status::InternalServerError, e.to_string()))?
    .map_err(scheduler_error)?;

    Ok(Json(json!({ "ok": true, "report": report })))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![status, toggle, list_sources, add_source, delete_source, toggle_source, run]
}
