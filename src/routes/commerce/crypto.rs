use std::sync::Arc;

use chrono::Utc;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::tokio::task::spawn_blocking;
use rocket::State;
use serde_json::{json, Value};

use super::join_failed;
use crate::checkout::crypto::{self as flow, CryptoBackend, StartPayment};
use crate::config::DataDir;
use crate::db::DbPool;
use crate::payments::crypto::{CryptoPayment, PaymentState, PriceCache, COINS};
use crate::rate_limit::{self, RateLimiter};
use crate::routes::{api_error, bad_request, not_found, too_many_requests, ApiError};
use crate::security::auth::{ClientIp, CustomerUser};

fn payment_json(id: &str, p: &CryptoPayment) -> Value {
    json!({
        "id": id,
        "state": p.state.as_str(),
        "coin": p.coin,
        "expected_amount": p.expected_amount,
        "usd_amount": p.usd_amount,
        "rate": p.rate,
        "rate_source": p.rate_source,
        "merchant_wallet": p.merchant_wallet,
        "source_wallet": p.source_wallet,
        "created_at": p.created_at,
        "expires_at": p.expires_at,
        "signature": p.signature,
        "received_amount": p.received_amount,
        "order_ids": p.order_ids,
    })
}

#[get("/api/crypto/prices")]
pub async fn prices(
    pool: &State<DbPool>,
    backend: &State<Arc<dyn CryptoBackend>>,
    cache: &State<Arc<PriceCache>>,
) -> Result<Json<Value>, ApiError> {
    let pool = pool.inner().clone();
    let backend = Arc::clone(backend.inner());
    let cache = Arc::clone(cache.inner());
    let prices = spawn_blocking(move || flow::current_prices(&pool, backend.as_ref(), &cache))
        .await
        .map_err(join_failed)?;

    let coins: Vec<Value> = COINS
        .iter()
        .map(|c| {
            json!({
                "symbol": c.symbol,
                "mint": c.mint,
                "decimals": c.decimals,
                "usd": prices.get(c.symbol),
            })
        })
        .collect();
    Ok(Json(json!({
        "ok": true,
        "source": prices.source,
        "fetched_at": prices.fetched_at,
        "coins": coins,
    })))
}

#[post("/api/crypto/payments", format = "json", data = "<body>")]
pub async fn start(
    pool: &State<DbPool>,
    backend: &State<Arc<dyn CryptoBackend>>,
    cache: &State<Arc<PriceCache>>,
    user: Option<CustomerUser>,
    body: Json<StartPayment>,
) -> Result<Json<Value>, ApiError> {
    let pool = pool.inner().clone();
    let backend = Arc::clone(backend.inner());
    let cache = Arc::clone(cache.inner());
    let req = body.into_inner();
    let (id, payment) = spawn_blocking(move || {
        flow::start_payment(
            &pool,
            backend.as_ref(),
            &cache,
            &req,
            user.as_ref().map(|u| &u.profile),
            Utc::now(),
        )
    })
    .await
    .map_err(join_failed)?
    .map_err(bad_request)?;

    Ok(Json(json!({ "ok": true, "payment": payment_json(&id, &payment) })))
}

#[post("/api/crypto/payments/<id>/check")]
pub async fn check(
    pool: &State<DbPool>,
    backend: &State<Arc<dyn CryptoBackend>>,
    limiter: &State<Arc<RateLimiter>>,
    dirs: &State<DataDir>,
    client_ip: ClientIp,
    id: &str,
) -> Result<Json<Value>, ApiError> {
    if !limiter.allow(pool, rate_limit::CRYPTO_CHECK, &client_ip.0) {
        return Err(too_many_requests());
    }
    if flow::load(pool, id).is_err() {
        return Err(not_found("Payment not found"));
    }

    let pool = pool.inner().clone();
    let backend = Arc::clone(backend.inner());
    let licenses_dir = dirs.licenses();
    let id = id.to_string();
    let payment_id = id.clone();
    let payment = spawn_blocking(move || flow::check_payment(&pool, backend.as_ref(), &licenses_dir, &payment_id, Utc::now()))
        .await
        .map_err(join_failed)?
        .map_err(|e| api_error(Status::BadGateway, e))?;

    Ok(Json(json!({
        "ok": true,
        "completed": payment.state == PaymentState::Completed,
        "payment": payment_json(&id, &payment),
    })))
}

#[get("/api/crypto/payments/<id>")]
pub fn get_payment(pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    let (_, payment) = flow::load(pool, id).map_err(not_found)?;
    Ok(Json(json!({ "ok": true, "payment": payment_json(id, &payment) })))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![prices, start, check, get_payment]
}
