use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{Request, State};
use serde_json::{json, Value};

use super::{api_error, not_found, ApiError};
use crate::config::DataDir;
use crate::db::DbPool;
use crate::license;
use crate::models::order::{Order, OrderStatus};
use crate::models::profile::Profile;
use crate::models::transaction::Transaction;
use crate::security::auth::CustomerUser;

/// License PDF served as an attachment.
pub struct PdfDownload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl<'r> Responder<'r, 'static> for PdfDownload {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(ContentType::PDF)
            .header(Header::new(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", self.filename),
            ))
            .header(Header::new("Cache-Control", "private, no-store"))
            .sized_body(self.bytes.len(), Cursor::new(self.bytes))
            .ok()
    }
}

/// The order if `profile` owns it or is an admin. Other people's orders
/// answer 404 rather than 403 so ids cannot be probed.
pub fn visible_order(pool: &DbPool, profile: &Profile, id: &str) -> Result<Order, ApiError> {
    Order::find_by_id(pool, id)
        .filter(|o| profile.is_admin() || o.user_id == profile.id)
        .ok_or_else(|| not_found("Order not found"))
}

/// Read the order's license file, generating it first when a completed
/// order has none yet (or the file went missing).
pub fn license_bytes(pool: &DbPool, licenses_dir: &std::path::Path, order: &Order) -> Result<Vec<u8>, ApiError> {
    if order.status() != OrderStatus::Completed {
        return Err(api_error(Status::Conflict, "License is available once the order is completed"));
    }
    let existing = order
        .license_file
        .as_deref()
        .and_then(|path| std::fs::read(path).ok());
    if let Some(bytes) = existing {
        return Ok(bytes);
    }
    let path = license::generate_for_order(pool, licenses_dir, order)
        .map_err(|e| api_error(Status::InternalServerError, e))?;
    std::fs::read(&path).map_err(|e| api_error(Status::InternalServerError, e.to_string()))
}

#[get("/api/orders")]
pub fn my_orders(pool: &State<DbPool>, user: CustomerUser) -> Json<Value> {
    let orders = Order::list_by_user(pool, &user.profile.id);
    Json(json!({ "ok": true, "orders": orders }))
}

#[get("/api/orders/<id>")]
pub fn get_order(pool: &State<DbPool>, user: CustomerUser, id: &str) -> Result<Json<Value>, ApiError> {
    let order = visible_order(pool, &user.profile, id)?;
    let transactions = Transaction::list_by_order(pool, &order.id);
    Ok(Json(json!({
        "ok": true,
        "order": order,
        "transactions": transactions,
        "license_available": order.status() == OrderStatus::Completed,
    })))
}

#[get("/api/orders/<id>/license")]
pub fn download_license(
    pool: &State<DbPool>,
    data: &State<DataDir>,
    user: CustomerUser,
    id: &str,
) -> Result<PdfDownload, ApiError> {
    let order = visible_order(pool, &user.profile, id)?;
    let bytes = license_bytes(pool, &data.licenses(), &order)?;
    Ok(PdfDownload {
        filename: format!("license-{}.pdf", order.id),
        bytes,
    })
}

pub fn routes() -> Vec<rocket::Route> {
    routes![my_orders, get_order, download_license]
}
