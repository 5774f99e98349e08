use rocket::serde::json::Json;
use rocket::State;
use serde_json::{json, Value};

use super::{not_found, page_window, ApiError};
use crate::db::DbPool;
use crate::license::LicenseType;
use crate::models::settings::Setting;
use crate::models::track::{Track, TrackFilter};

const PER_PAGE: i64 = 24;

fn license_table(base_price: f64) -> Vec<Value> {
    LicenseType::ALL.iter().map(|l| l.to_json(Some(base_price))).collect()
}

fn track_json(track: &Track) -> Value {
    let mut v = json!(track);
    v["licenses"] = json!(license_table(track.base_price));
    v
}

#[get("/api/beats?<genre>&<q>&<page>")]
pub fn list_beats(pool: &State<DbPool>, genre: Option<&str>, q: Option<&str>, page: Option<i64>) -> Json<Value> {
    let filter = TrackFilter {
        status: Some("published"),
        genre,
        search: q,
    };
    let (limit, offset) = page_window(page, PER_PAGE);
    let total = Track::count(pool, &filter);
    let beats: Vec<Value> = Track::list(pool, &filter, limit, offset).iter().map(track_json).collect();

    Json(json!({
        "ok": true,
        "beats": beats,
        "total": total,
        "page": page.unwrap_or(1).max(1),
        "per_page": PER_PAGE,
        "genres": Track::genres(pool),
        "currency": Setting::get_or(pool, "commerce_currency", "USD"),
    }))
}

#[get("/api/beats/<key>")]
pub fn get_beat(pool: &State<DbPool>, key: &str) -> Result<Json<Value>, ApiError> {
    let track = Track::find_by_id_or_slug(pool, key)
        .filter(|t| t.is_published())
        .ok_or_else(|| not_found("Beat not found"))?;
    Ok(Json(json!({ "ok": true, "beat": track_json(&track) })))
}

#[get("/api/licenses")]
pub fn list_licenses() -> Json<Value> {
    let tiers: Vec<Value> = LicenseType::ALL.iter().map(|l| l.to_json(None)).collect();
    Json(json!({ "ok": true, "licenses": tiers }))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![list_beats, get_beat, list_licenses]
}
