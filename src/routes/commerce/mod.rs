pub mod crypto;

use std::sync::Arc;

use chrono::Utc;
use rocket::data::{Data, ToByteUnit};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::tokio::task::spawn_blocking;
use rocket::State;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, bad_request, not_found, too_many_requests, ApiError};
use crate::checkout::webhook::{self, Reconciler};
use crate::checkout::{quote, CartItem};
use crate::config::DataDir;
use crate::db::DbPool;
use crate::license;
use crate::models::discount::DiscountCode;
use crate::models::order::Order;
use crate::models::settings::Setting;
use crate::payments::stripe::{self, CheckoutRequest, StripeApi};
use crate::rate_limit::{self, RateLimiter};
use crate::security::auth::{AdminUser, ClientIp, CustomerUser};

const WEBHOOK_BODY_LIMIT_KIB: u64 = 512;
/// Stripe rejects metadata values longer than this.
const STRIPE_METADATA_MAX: usize = 500;

fn site_url(pool: &DbPool) -> String {
    Setting::get_or(pool, "site_url", "http://localhost:8000")
        .trim_end_matches('/')
        .to_string()
}

fn join_failed(e: rocket::tokio::task::JoinError) -> ApiError {
    api_error(Status::InternalServerError, format!("Background job failed: {}", e))
}

// ── Cart & discounts ──

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub items: Vec<CartItem>,
    pub discount_code: Option<String>,
}

#[post("/api/cart/quote", format = "json", data = "<body>")]
pub fn cart_quote(pool: &State<DbPool>, body: Json<QuoteRequest>) -> Result<Json<Value>, ApiError> {
    let q = quote(pool, &body.items, body.discount_code.as_deref(), Utc::now().naive_utc()).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true, "quote": q })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateDiscount {
    pub code: String,
    pub subtotal: f64,
}

#[post("/api/discounts/validate", format = "json", data = "<body>")]
pub fn validate_discount(
    pool: &State<DbPool>,
    limiter: &State<Arc<RateLimiter>>,
    client_ip: ClientIp,
    body: Json<ValidateDiscount>,
) -> Result<Json<Value>, ApiError> {
    if !limiter.allow(pool, rate_limit::DISCOUNT, &client_ip.0) {
        return Err(too_many_requests());
    }
    if !body.subtotal.is_finite() || body.subtotal < 0.0 {
        return Err(bad_request("Subtotal must be a positive amount"));
    }
    match DiscountCode::validate(pool, &body.code, body.subtotal, Utc::now().naive_utc()) {
        Ok((code, amount)) => Ok(Json(json!({
            "ok": true,
            "valid": true,
            "code": code.code,
            "type": code.kind,
            "amount": code.amount,
            "discount": amount,
            "total": license::round_cents(body.subtotal - amount),
        }))),
        Err(e) => Ok(Json(json!({ "ok": true, "valid": false, "reason": e.to_string() }))),
    }
}

// ── Stripe checkout ──

#[derive(Debug, Deserialize)]
pub struct StripeCreateRequest {
    pub items: Vec<CartItem>,
    pub discount_code: Option<String>,
    pub email: Option<String>,
}

#[post("/api/checkout/stripe/create", format = "json", data = "<body>")]
pub async fn stripe_create_session(
    pool: &State<DbPool>,
    stripe_api: &State<Arc<dyn StripeApi>>,
    user: Option<CustomerUser>,
    body: Json<StripeCreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let secret_key = Setting::get_or(pool, "stripe_secret_key", "");
    if secret_key.is_empty() {
        return Err(api_error(Status::ServiceUnavailable, "Stripe secret key not configured"));
    }
    let q = quote(pool, &body.items, body.discount_code.as_deref(), Utc::now().naive_utc()).map_err(bad_request)?;
    if q.total <= 0.0 {
        return Err(bad_request("Nothing to pay for"));
    }

    let email = user
        .as_ref()
        .map(|u| u.profile.email.clone())
        .or_else(|| body.email.as_deref().map(str::trim).filter(|e| !e.is_empty()).map(String::from));

    let lines = q.cart_lines();
    let mut metadata = vec![
        (
            "user_id".to_string(),
            user.as_ref().map(|u| u.profile.id.clone()).unwrap_or_default(),
        ),
        ("customer_email".to_string(), email.clone().unwrap_or_default()),
        ("discount_code".to_string(), q.discount_code.clone().unwrap_or_default()),
    ];
    // Large carts fall back to the line items API when the webhook fires.
    let cart = serde_json::to_string(&lines).map_err(|e| api_error(Status::InternalServerError, e.to_string()))?;
    if cart.len() <= STRIPE_METADATA_MAX {
        metadata.push(("cart".to_string(), cart));
    }

    let base = site_url(pool);
    let req = CheckoutRequest {
        currency: q.currency.clone(),
        lines,
        success_url: format!("{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}", base),
        cancel_url: format!("{}/cart", base),
        customer_email: email,
        metadata,
    };

    let api = Arc::clone(stripe_api.inner());
    let created = spawn_blocking(move || api.create_checkout_session(&secret_key, &req))
        .await
        .map_err(join_failed)?
        .map_err(|e| api_error(Status::BadGateway, e))?;

    log::info!("Stripe checkout session {} created for {:.2} {}", created.id, q.total, q.currency);
    Ok(Json(json!({
        "ok": true,
        "session_id": created.id,
        "checkout_url": created.url,
        "quote": q,
    })))
}

// ── Stripe webhook ──

/// Raw `Stripe-Signature` header, if any. Verification needs the raw body
/// so it happens in the handler.
pub struct StripeSignature(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for StripeSignature {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(StripeSignature(
            request.headers().get_one("Stripe-Signature").map(String::from),
        ))
    }
}

/// 400 on a bad signature or unreadable body; otherwise always 200 with the
/// processing summary, so Stripe does not redeliver events we have seen.
#[post("/api/webhooks/stripe", data = "<data>")]
pub async fn stripe_webhook(
    pool: &State<DbPool>,
    stripe_api: &State<Arc<dyn StripeApi>>,
    dirs: &State<DataDir>,
    signature: StripeSignature,
    data: Data<'_>,
) -> Result<Json<Value>, ApiError> {
    let body = data
        .open(WEBHOOK_BODY_LIMIT_KIB.kibibytes())
        .into_bytes()
        .await
        .map_err(|e| bad_request(format!("Unreadable body: {}", e)))?;
    if !body.is_complete() {
        return Err(api_error(Status::PayloadTooLarge, "Webhook body too large"));
    }
    let body = body.into_inner();

    let secret = Setting::get_or(pool, "stripe_webhook_secret", "");
    let tolerance = Setting::get_i64(pool, "stripe_webhook_tolerance_secs").max(1);
    if let Err(e) = stripe::verify_signature(&secret, &body, signature.0.as_deref(), tolerance, Utc::now().timestamp()) {
        log::warn!("[webhook] rejected: {}", e);
        return Err(bad_request(e.to_string()));
    }

    let event = webhook::parse_event(&body).map_err(bad_request)?;

    let pool = pool.inner().clone();
    let api = Arc::clone(stripe_api.inner());
    let licenses_dir = dirs.licenses();
    let outcome = spawn_blocking(move || {
        let reconciler = Reconciler {
            pool: &pool,
            stripe: api.as_ref(),
            licenses_dir: &licenses_dir,
        };
        reconciler.handle(&event)
    })
    .await
    .map_err(join_failed)?;

    Ok(Json(json!(outcome)))
}

// ── Licenses ──

#[derive(Debug, Deserialize)]
pub struct GenerateLicense {
    pub order_id: String,
}

#[post("/api/licenses/generate", format = "json", data = "<body>")]
pub fn generate_license(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    body: Json<GenerateLicense>,
) -> Result<Json<Value>, ApiError> {
    let order = Order::find_by_id(pool, &body.order_id).ok_or_else(|| not_found("Order not found"))?;
    let path = license::generate_for_order(pool, &dirs.licenses(), &order)
        .map_err(|e| api_error(Status::InternalServerError, e))?;
    Ok(Json(json!({
        "ok": true,
        "order_id": order.id,
        "license_file": path.to_string_lossy(),
        "download_url": format!("/api/orders/{}/license", order.id),
    })))
}

pub fn routes() -> Vec<rocket::Route> {
    let mut r = routes![
        cart_quote,
        validate_discount,
        stripe_create_session,
        stripe_webhook,
        generate_license
    ];
    r.extend(crypto::routes());
    r
}
