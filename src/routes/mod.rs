pub mod admin;
pub mod auth;
pub mod catalog;
pub mod commerce;
pub mod debug;
pub mod orders;

use rocket::http::Status;
use rocket::serde::json::Json;
use serde_json::{json, Value};

/// JSON body with an HTTP status, the shape every failing handler returns.
pub type ApiError = (Status, Json<Value>);

pub fn api_error(status: Status, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "ok": false, "error": message.into() })))
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    api_error(Status::BadRequest, message)
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    api_error(Status::NotFound, message)
}

pub fn too_many_requests() -> ApiError {
    api_error(Status::TooManyRequests, "Too many attempts. Please try again in 15 minutes.")
}

/// 1-based page number to (limit, offset). Absurd page numbers saturate
/// instead of overflowing; they simply return no rows.
pub fn page_window(page: Option<i64>, per_page: i64) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    (per_page, (page - 1).saturating_mul(per_page))
}
