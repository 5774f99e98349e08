pub mod scheduler;
pub mod settings;

use chrono::{Duration, Utc};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, bad_request, not_found, page_window, ApiError};
use crate::checkout::fulfill;
use crate::config::DataDir;
use crate::db::DbPool;
use crate::models::discount::{DiscountCode, DiscountForm};
use crate::models::order::{Order, OrderStatus, TransitionError};
use crate::models::profile::Profile;
use crate::models::settings::Setting;
use crate::models::track::{import_manifests, Track, TrackFilter, TrackForm};
use crate::models::transaction::Transaction;
use crate::security::auth::AdminUser;

const PER_PAGE: i64 = 25;

// ── Dashboard ──

#[get("/api/admin/dashboard")]
pub fn dashboard(_admin: AdminUser, pool: &State<DbPool>) -> Json<Value> {
    let now = Utc::now().naive_utc();
    let by_status: serde_json::Map<String, Value> = OrderStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), json!(Order::count_by_status(pool, s.as_str()))))
        .collect();

    Json(json!({
        "ok": true,
        "currency": Setting::get_or(pool, "commerce_currency", "USD"),
        "revenue": {
            "total": Order::total_revenue(pool),
            "last_30_days": Order::revenue_since(pool, now - Duration::days(30)),
            "last_7_days": Order::revenue_since(pool, now - Duration::days(7)),
        },
        "orders": {
            "total": Order::count(pool),
            "by_status": by_status,
        },
        "customers": Profile::count_by_role(pool, "customer"),
        "tracks": {
            "published": Track::count(pool, &TrackFilter { status: Some("published"), ..Default::default() }),
            "draft": Track::count(pool, &TrackFilter { status: Some("draft"), ..Default::default() }),
            "sold": Track::count(pool, &TrackFilter { status: Some("sold"), ..Default::default() }),
        },
        "recent_orders": Order::list(pool, 10, 0),
    }))
}

// ── Orders ──

#[get("/api/admin/orders?<status>&<email>&<page>")]
pub fn list_orders(
    _admin: AdminUser,
    pool: &State<DbPool>,
    status: Option<&str>,
    email: Option<&str>,
    page: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = page_window(page, PER_PAGE);
    let (orders, total) = match (status.filter(|s| !s.is_empty()), email.filter(|e| !e.is_empty())) {
        (Some(s), _) => {
            let s: OrderStatus = s.parse().map_err(|e: TransitionError| bad_request(e.to_string()))?;
            (
                Order::list_by_status(pool, s.as_str(), limit, offset),
                Order::count_by_status(pool, s.as_str()),
            )
        }
        (None, Some(e)) => {
            let orders = Order::list_by_email(pool, e, limit, offset);
            let total = orders.len() as i64;
            (orders, total)
        }
        (None, None) => (Order::list(pool, limit, offset), Order::count(pool)),
    };
    Ok(Json(json!({
        "ok": true,
        "orders": orders,
        "total": total,
        "page": page.unwrap_or(1).max(1),
        "per_page": PER_PAGE,
    })))
}

#[get("/api/admin/orders/<id>")]
pub fn get_order(_admin: AdminUser, pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    let order = Order::find_by_id(pool, id).ok_or_else(|| not_found("Order not found"))?;
    let customer = Profile::find_by_id(pool, &order.user_id).map(|p| p.safe_json());
    Ok(Json(json!({
        "ok": true,
        "order": order,
        "customer": customer,
        "transactions": Transaction::list_by_order(pool, id),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

/// Move an order along its lifecycle. Completing an order also writes its
/// license; the order's transactions follow the new status.
#[put("/api/admin/orders/<id>/status", format = "json", data = "<body>")]
pub fn update_order_status(
    _admin: AdminUser,
    pool: &State<DbPool>,
    dirs: &State<DataDir>,
    id: &str,
    body: Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    let next: OrderStatus = body.status.parse().map_err(|e: TransitionError| bad_request(e.to_string()))?;
    let order = Order::find_by_id(pool, id).ok_or_else(|| not_found("Order not found"))?;
    if let Err(e) = order.status().check_transition(next) {
        return Err(api_error(Status::Conflict, e.to_string()));
    }
    Order::update_status(pool, id, next).map_err(|e| api_error(Status::Conflict, e))?;
    for txn in Transaction::list_by_order(pool, id) {
        if let Err(e) = Transaction::update_status(pool, &txn.id, next.as_str()) {
            log::warn!("Transaction {} kept its status: {}", txn.id, e);
        }
    }

    let mut warnings = Vec::new();
    let updated = Order::find_by_id(pool, id).ok_or_else(|| not_found("Order not found"))?;
    if next == OrderStatus::Completed {
        if let Err(e) = fulfill::after_paid(pool, &dirs.licenses(), &updated) {
            warnings.push(format!("License not generated: {}", e));
        }
    }
    log::info!("Order {} moved {} -> {}", id, order.status, next);
    Ok(Json(json!({
        "ok": true,
        "order": Order::find_by_id(pool, id),
        "warnings": warnings,
    })))
}

// ── Customers ──

#[get("/api/admin/customers?<q>&<page>")]
pub fn list_customers(_admin: AdminUser, pool: &State<DbPool>, q: Option<&str>, page: Option<i64>) -> Json<Value> {
    let (limit, offset) = page_window(page, PER_PAGE);
    Json(json!({
        "ok": true,
        "customers": Profile::list_customers(pool, q, limit, offset),
        "total": Profile::count(pool),
        "page": page.unwrap_or(1).max(1),
    }))
}

#[get("/api/admin/customers/<id>")]
pub fn get_customer(_admin: AdminUser, pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    let profile = Profile::find_by_id(pool, id).ok_or_else(|| not_found("Customer not found"))?;
    let orders = Order::list_by_user(pool, id);
    let spent: f64 = orders
        .iter()
        .filter(|o| o.status() == OrderStatus::Completed)
        .map(|o| o.total_amount)
        .sum();
    Ok(Json(json!({
        "ok": true,
        "customer": profile.safe_json(),
        "orders": orders,
        "transactions": Transaction::list_by_user(pool, id),
        "total_spent": crate::license::round_cents(spent),
    })))
}

#[derive(Debug, Deserialize)]
pub struct RoleUpdate {
    pub role: String,
}

#[put("/api/admin/customers/<id>/role", format = "json", data = "<body>")]
pub fn update_role(
    admin: AdminUser,
    pool: &State<DbPool>,
    id: &str,
    body: Json<RoleUpdate>,
) -> Result<Json<Value>, ApiError> {
    if id == admin.profile.id && body.role != "admin" {
        return Err(bad_request("You cannot remove your own admin role"));
    }
    Profile::update_role(pool, id, &body.role).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Discount codes ──

#[get("/api/admin/discounts")]
pub fn list_discounts(_admin: AdminUser, pool: &State<DbPool>) -> Json<Value> {
    Json(json!({ "ok": true, "discounts": DiscountCode::list(pool) }))
}

#[post("/api/admin/discounts", format = "json", data = "<form>")]
pub fn create_discount(
    _admin: AdminUser,
    pool: &State<DbPool>,
    form: Json<DiscountForm>,
) -> Result<Json<Value>, ApiError> {
    let id = DiscountCode::create(pool, &form).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true, "discount": DiscountCode::find_by_id(pool, &id) })))
}

#[put("/api/admin/discounts/<id>", format = "json", data = "<form>")]
pub fn update_discount(
    _admin: AdminUser,
    pool: &State<DbPool>,
    id: &str,
    form: Json<DiscountForm>,
) -> Result<Json<Value>, ApiError> {
    if DiscountCode::find_by_id(pool, id).is_none() {
        return Err(not_found("Discount code not found"));
    }
    DiscountCode::update(pool, id, &form).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true, "discount": DiscountCode::find_by_id(pool, id) })))
}

#[post("/api/admin/discounts/<id>/toggle")]
pub fn toggle_discount(_admin: AdminUser, pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    let active = DiscountCode::toggle_active(pool, id).map_err(not_found)?;
    Ok(Json(json!({ "ok": true, "active": active })))
}

#[delete("/api/admin/discounts/<id>")]
pub fn delete_discount(_admin: AdminUser, pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    DiscountCode::delete(pool, id).map_err(not_found)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Tracks ──

#[get("/api/admin/tracks?<status>&<q>&<page>")]
pub fn list_tracks(
    _admin: AdminUser,
    pool: &State<DbPool>,
    status: Option<&str>,
    q: Option<&str>,
    page: Option<i64>,
) -> Json<Value> {
    let filter = TrackFilter {
        status: status.filter(|s| !s.is_empty()),
        genre: None,
        search: q,
    };
    let (limit, offset) = page_window(page, PER_PAGE);
    Json(json!({
        "ok": true,
        "tracks": Track::list(pool, &filter, limit, offset),
        "total": Track::count(pool, &filter),
        "page": page.unwrap_or(1).max(1),
    }))
}

#[post("/api/admin/tracks", format = "json", data = "<form>")]
pub fn create_track(_admin: AdminUser, pool: &State<DbPool>, form: Json<TrackForm>) -> Result<Json<Value>, ApiError> {
    let id = Track::create(pool, &form).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true, "track": Track::find_by_id(pool, &id) })))
}

#[put("/api/admin/tracks/<id>", format = "json", data = "<form>")]
pub fn update_track(
    _admin: AdminUser,
    pool: &State<DbPool>,
    id: &str,
    form: Json<TrackForm>,
) -> Result<Json<Value>, ApiError> {
    if Track::find_by_id(pool, id).is_none() {
        return Err(not_found("Track not found"));
    }
    Track::update(pool, id, &form).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true, "track": Track::find_by_id(pool, id) })))
}

#[post("/api/admin/tracks/<id>/status", format = "json", data = "<body>")]
pub fn set_track_status(
    _admin: AdminUser,
    pool: &State<DbPool>,
    id: &str,
    body: Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    if Track::find_by_id(pool, id).is_none() {
        return Err(not_found("Track not found"));
    }
    Track::update_status(pool, id, &body.status).map_err(bad_request)?;
    Ok(Json(json!({ "ok": true })))
}

#[delete("/api/admin/tracks/<id>")]
pub fn delete_track(_admin: AdminUser, pool: &State<DbPool>, id: &str) -> Result<Json<Value>, ApiError> {
    Track::delete(pool, id).map_err(not_found)?;
    Ok(Json(json!({ "ok": true })))
}

/// Bulk import of track manifests. Entries whose source url is already in
/// the catalog are skipped.
#[post("/api/admin/tracks/import", format = "json", data = "<manifests>")]
pub fn import_tracks(
    _admin: AdminUser,
    pool: &State<DbPool>,
    manifests: Json<Vec<TrackForm>>,
) -> Result<Json<Value>, ApiError> {
    if manifests.is_empty() {
        return Err(bad_request("No tracks to import"));
    }
    let default_price = Setting::get_f64(pool, "scheduler_default_price");
    let report = import_manifests(pool, &manifests, default_price);
    log::info!(
        "Track import: {} imported, {} skipped, {} errors",
        report.imported.len(),
        report.skipped,
        report.errors.len()
    );
    Ok(Json(json!({ "ok": true, "report": report })))
}

pub fn routes() -> Vec<rocket::Route> {
    let mut r = routes![
        dashboard,
        list_orders,
        get_order,
        update_order_status,
        list_customers,
        get_customer,
        update_role,
        list_discounts,
        create_discount,
        update_discount,
        toggle_discount,
        delete_discount,
        list_tracks,
        create_track,
        update_track,
        set_track_status,
        delete_track,
        import_tracks,
    ];
    r.extend(scheduler::routes());
    r.extend(settings::routes());
    r
}
