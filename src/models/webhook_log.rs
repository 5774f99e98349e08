use chrono::NaiveDateTime;
use rusqlite::params;
use serde::Serialize;

use crate::db::DbPool;

/// Payload excerpts are truncated to this many bytes.
const PAYLOAD_EXCERPT: usize = 4096;

#[derive(Debug, Serialize)]
pub struct WebhookLog {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub level: String,
    pub message: String,
    pub payload: Option<String>,
    pub created_at: NaiveDateTime,
}

impl WebhookLog {
    /// Best effort: a failed insert is ignored.
    pub fn log(pool: &DbPool, event_id: &str, event_type: &str, level: &str, message: &str, payload: Option<&str>) {
        let excerpt = payload.map(|p| truncate(p, PAYLOAD_EXCERPT));
        if let Ok(conn) = pool.get() {
            let _ = conn.execute(
                "INSERT INTO webhook_logs (event_id, event_type, level, message, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_id, event_type, level, message, excerpt],
            );
        }
    }

    pub fn recent(pool: &DbPool, event_type: Option<&str>, limit: i64) -> Vec<Self> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        conn.prepare(
            "SELECT * FROM webhook_logs WHERE (?1 IS NULL OR event_type = ?1)
             ORDER BY id DESC LIMIT ?2",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![event_type, limit], |row| {
                Ok(WebhookLog {
                    id: row.get("id")?,
                    event_id: row.get("event_id")?,
                    event_type: row.get("event_type")?,
                    level: row.get("level")?,
                    message: row.get("message")?,
                    payload: row.get("payload")?,
                    created_at: row.get("created_at")?,
                })
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
        })
        .unwrap_or_default()
    }

    pub fn count(pool: &DbPool) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        conn.query_row("SELECT COUNT(*) FROM webhook_logs", [], |row| row.get(0))
            .unwrap_or(0)
    }

    pub fn cleanup(pool: &DbPool, max_age_days: i64) -> Result<usize, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let deleted = conn
            .execute(
                "DELETE FROM webhook_logs WHERE created_at < datetime('now', ?1)",
                params![format!("-{} days", max_age_days)],
            )
            .map_err(|e| e.to_string())?;
        Ok(deleted)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
