use rusqlite::params;
use std::collections::HashMap;

use crate::db::DbPool;

/// Key/value store configuration. Every value is text; the typed getters
/// fall back to a neutral value when a key is missing or malformed.
pub struct Setting;

impl Setting {
    pub fn get(pool: &DbPool, key: &str) -> Option<String> {
        let conn = pool.get().ok()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn get_or(pool: &DbPool, key: &str, default: &str) -> String {
        Self::get(pool, key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(pool: &DbPool, key: &str) -> bool {
        Self::get(pool, key)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    pub fn get_i64(pool: &DbPool, key: &str) -> i64 {
        Self::get(pool, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn get_f64(pool: &DbPool, key: &str) -> f64 {
        Self::get(pool, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn set(pool: &DbPool, key: &str, value: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Write several keys in one transaction. Values equal to the mask
    /// are skipped so a form that echoes masked credentials back does not
    /// overwrite them.
    pub fn set_many(pool: &DbPool, settings: &HashMap<String, String>) -> Result<usize, String> {
        let mut conn = pool.get().map_err(|e| e.to_string())?;
        let tx = conn.transaction().map_err(|e| e.to_string())?;
        let mut written = 0;
        for (key, value) in settings.iter().filter(|(_, v)| v.as_str() != MASK) {
            written += tx
                .execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(|e| e.to_string())?;
        }
        tx.commit().map_err(|e| e.to_string())?;
        Ok(written)
    }

    /// Every key starting with `prefix` ("crypto_", "scheduler_", ...).
    pub fn get_group(pool: &DbPool, prefix: &str) -> HashMap<String, String> {
        query_pairs(pool, Some(prefix))
    }

    pub fn all(pool: &DbPool) -> HashMap<String, String> {
        query_pairs(pool, None)
    }

    /// Replace credential values with a fixed mask for display.
    pub fn masked(settings: HashMap<String, String>) -> HashMap<String, String> {
        settings
            .into_iter()
            .map(|(k, v)| {
                if is_secret(&k) && !v.is_empty() {
                    (k, MASK.to_string())
                } else {
                    (k, v)
                }
            })
            .collect()
    }
}

pub const MASK: &str = "********";

pub fn is_secret(key: &str) -> bool {
    key.ends_with("_key") || key.ends_with("_secret")
}

fn query_pairs(pool: &DbPool, prefix: Option<&str>) -> HashMap<String, String> {
    let Ok(conn) = pool.get() else {
        return HashMap::new();
    };
    let pattern = format!("{}%", prefix.unwrap_or(""));
    conn.prepare("SELECT key, COALESCE(value, '') FROM settings WHERE key LIKE ?1")
        .and_then(|mut stmt| {
            stmt.query_map(params![pattern], |row| Ok((row.get(0)?, row.get(1)?)))
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
        })
        .unwrap_or_default()
}
