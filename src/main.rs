#[macro_use]
extern crate rocket;

use std::sync::Arc;
use std::time::Duration;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::Request;
use serde_json::{json, Value};

mod boot;
mod checkout;
mod config;
mod db;
mod license;
mod models;
mod payments;
mod pdf;
mod rate_limit;
mod routes;
mod scheduler;
mod security;
mod tasks;

#[cfg(test)]
mod tests;

use checkout::crypto::{CryptoBackend, LiveBackend};
use config::DataDir;
use models::settings::Setting;
use payments::crypto::PriceCache;
use payments::stripe::{HttpStripe, StripeApi};
use rate_limit::RateLimiter;
use scheduler::{Downloader, YtDlp};

fn error_body(status: Status, req: &Request<'_>) -> Json<Value> {
    Json(json!({
        "ok": false,
        "error": status.reason().unwrap_or("Error"),
        "path": req.uri().path().to_string(),
    }))
}

#[catch(401)]
fn unauthorized(req: &Request<'_>) -> Json<Value> {
    error_body(Status::Unauthorized, req)
}

#[catch(403)]
fn forbidden(req: &Request<'_>) -> Json<Value> {
    error_body(Status::Forbidden, req)
}

#[catch(404)]
fn not_found(req: &Request<'_>) -> Json<Value> {
    error_body(Status::NotFound, req)
}

#[catch(422)]
fn unprocessable(req: &Request<'_>) -> Json<Value> {
    error_body(Status::UnprocessableEntity, req)
}

#[catch(500)]
fn server_error(req: &Request<'_>) -> Json<Value> {
    error_body(Status::InternalServerError, req)
}

#[launch]
fn rocket() -> _ {
    env_logger::init();

    // Boot check: create the data directories and make sure they are writable
    let data_dir = config::data_dir();
    boot::run(&data_dir);
    let dirs = DataDir(data_dir);

    let pool = db::init_pool().expect("Failed to initialize database pool");
    db::run_migrations(&pool).expect("Failed to run database migrations");
    db::seed_defaults(&pool).expect("Failed to seed default settings");
    config::apply_env_overrides(&pool).expect("Failed to apply environment overrides");

    match models::scheduler::seed_from_snapshot(&pool, &dirs.scheduler_snapshot()) {
        Ok(true) => log::info!("[scheduler] state restored from {}", dirs.scheduler_snapshot().display()),
        Ok(false) => {}
        Err(e) => log::warn!("[scheduler] snapshot ignored: {}", e),
    }

    let repaired = models::profile::Profile::repair_missing(&pool).unwrap_or(0);
    if repaired > 0 {
        log::warn!("Created {} missing customer profiles for existing orders", repaired);
    }

    let price_ttl = Duration::from_secs(Setting::get_i64(&pool, "crypto_price_cache_secs").clamp(1, 3600) as u64);
    let stripe: Arc<dyn StripeApi> = Arc::new(HttpStripe::new(Duration::from_secs(15)));
    let crypto: Arc<dyn CryptoBackend> = Arc::new(LiveBackend);
    let downloader: Arc<dyn Downloader> = Arc::new(YtDlp::from_settings(&pool));

    log::info!(
        "Beatstore starting ({} mode)",
        if config::is_production(&pool) { "production" } else { "development" }
    );

    assemble(pool, dirs, price_ttl, stripe, crypto, downloader).attach(tasks::BackgroundTasks)
}

/// Managed state, routes and catchers. Background tasks are attached by the
/// caller.
fn assemble(
    pool: db::DbPool,
    dirs: DataDir,
    price_ttl: Duration,
    stripe: Arc<dyn StripeApi>,
    crypto: Arc<dyn CryptoBackend>,
    downloader: Arc<dyn Downloader>,
) -> rocket::Rocket<rocket::Build> {
    rocket::build()
        .manage(pool)
        .manage(dirs)
        .manage(Arc::new(RateLimiter::new()))
        .manage(Arc::new(PriceCache::new(price_ttl)))
        .manage(stripe)
        .manage(crypto)
        .manage(downloader)
        .mount("/", routes::catalog::routes())
        .mount("/", routes::auth::routes())
        .mount("/", routes::orders::routes())
        .mount("/", routes::commerce::routes())
        .mount("/", routes::admin::routes())
        .mount("/", routes::debug::routes())
        .register(
            "/",
            catchers![unauthorized, forbidden, not_found, unprocessable, server_error],
        )
}
