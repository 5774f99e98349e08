use std::collections::HashMap;

use rocket::serde::json::Json;
use rocket::State;
use serde_json::{json, Value};

use crate::db::DbPool;
use crate::models::settings::Setting;
use crate::routes::{bad_request, ApiError};
use crate::security::auth::AdminUser;

/// Current settings, credentials masked. `group` narrows to one prefix.
#[get("/api/admin/settings?<group>")]
pub fn get_settings(_admin: AdminUser, pool: &State<DbPool>, group: Option<&str>) -> Json<Value> {
    let settings = match group.filter(|g| !g.is_empty()) {
        Some(prefix) => Setting::get_group(pool, prefix),
        None => Setting::all(pool),
    };
    Json(json!({ "ok": true, "settings": Setting::masked(settings) }))
}

/// Update existing keys. Unknown keys are rejected so typos do not pile up
/// as dead rows.
#[put("/api/admin/settings", format = "json", data = "<body>")]
pub fn update_settings(
    admin: AdminUser,
    pool: &State<DbPool>,
    body: Json<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let known = Setting::all(pool);
    let unknown: Vec<&str> = body
        .keys()
        .filter(|k| !known.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(bad_request(format!("Unknown settings: {}", unknown.join(", "))));
    }
    let written = Setting::set_many(pool, &body).map_err(bad_request)?;
    log::info!("{} updated {} settings", admin.profile.email, written);
    Ok(Json(json!({ "ok": true, "updated": written })))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![get_settings, update_settings]
}
