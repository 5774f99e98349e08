use std::fmt;
use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;

/// Only the most recent log lines are kept.
pub const MAX_LOGS: i64 = 100;

#[derive(Debug, PartialEq)]
pub enum SchedulerError {
    /// The state row changed since it was read.
    Conflict,
    Invalid(String),
    Db(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Conflict => f.write_str("Scheduler state was modified concurrently, reload and retry"),
            SchedulerError::Invalid(msg) => f.write_str(msg),
            SchedulerError::Db(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::Db(e.to_string())
    }
}

impl From<r2d2::Error> for SchedulerError {
    fn from(e: r2d2::Error) -> Self {
        SchedulerError::Db(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Channel,
    Playlist,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Channel => "channel",
            SourceType::Playlist => "playlist",
        }
    }

    /// Classify a YouTube or YouTube Music URL. Anything else is rejected.
    pub fn classify(raw: &str) -> Result<(SourceType, String), String> {
        let parsed = url::Url::parse(raw.trim()).map_err(|_| "Source must be a valid URL".to_string())?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err("Source must be an http(s) URL".to_string());
        }
        let host = parsed.host_str().unwrap_or_default().to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        if !matches!(host, "youtube.com" | "m.youtube.com" | "music.youtube.com") {
            return Err("Only YouTube and YouTube Music sources are supported".to_string());
        }

        let path = parsed.path().trim_end_matches('/');
        if path == "/playlist" {
            let has_list = parsed
                .query_pairs()
                .any(|(k, v)| k == "list" && !v.is_empty());
            if !has_list {
                return Err("Playlist URL is missing its list parameter".to_string());
            }
            return Ok((SourceType::Playlist, parsed.to_string()));
        }

        let mut segments = path.trim_start_matches('/').split('/');
        let first = segments.next().unwrap_or_default();
        let is_channel = match first {
            "channel" | "c" | "user" => segments.next().is_some_and(|s| !s.is_empty()),
            handle => handle.len() > 1 && handle.starts_with('@'),
        };
        if is_channel {
            let mut clean = parsed.clone();
            clean.set_query(None);
            clean.set_fragment(None);
            return Ok((SourceType::Channel, clean.to_string().trim_end_matches('/').to_string()));
        }
        Err("URL is not a YouTube channel or playlist".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub active: bool,
    pub next_run: Option<NaiveDateTime>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSource {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub last_checked: Option<NaiveDateTime>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLog {
    pub level: String,
    pub message: String,
    pub created_at: NaiveDateTime,
}

/// Whole-state view, used for the status endpoint and the JSON mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub active: bool,
    pub next_run: Option<NaiveDateTime>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub sources: Vec<SchedulerSource>,
    #[serde(default)]
    pub logs: Vec<SchedulerLog>,
}

impl SchedulerSource {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(SchedulerSource {
            id: row.get("id")?,
            url: row.get("url")?,
            source_type: row.get("source_type")?,
            last_checked: row.get("last_checked")?,
            active: row.get::<_, i64>("active")? != 0,
        })
    }
}

impl SchedulerState {
    fn read(conn: &Connection) -> Result<Self, SchedulerError> {
        let state = conn.query_row(
            "SELECT active, next_run, version FROM scheduler_state WHERE id = 1",
            [],
            |row| {
                Ok(SchedulerState {
                    active: row.get::<_, i64>(0)? != 0,
                    next_run: row.get(1)?,
                    version: row.get(2)?,
                })
            },
        )?;
        Ok(state)
    }

    pub fn load(pool: &DbPool) -> Result<Self, SchedulerError> {
        let conn = pool.get()?;
        Self::read(&conn)
    }

    /// Compare-and-swap write of the state row. Fails with `Conflict` when
    /// `expected_version` is no longer current.
    pub fn write(
        pool: &DbPool,
        expected_version: i64,
        active: bool,
        next_run: Option<NaiveDateTime>,
    ) -> Result<Self, SchedulerError> {
        let conn = pool.get()?;
        let n = conn.execute(
            "UPDATE scheduler_state
             SET active = ?1, next_run = ?2, version = version + 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = 1 AND version = ?3",
            params![active as i64, next_run, expected_version],
        )?;
        if n == 0 {
            return Err(SchedulerError::Conflict);
        }
        Self::read(&conn)
    }

    /// True when the scheduler is on and `now` has reached `next_run`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.active && self.next_run.map_or(true, |next| now >= next)
    }
}

// ── Sources ──

pub fn list_sources(pool: &DbPool) -> Vec<SchedulerSource> {
    let conn = match pool.get() {
        Ok(c) => c,
        Err(_) => return vec![],
    };
    conn.prepare("SELECT * FROM scheduler_sources ORDER BY created_at ASC, url ASC")
        .and_then(|mut stmt| {
            stmt.query_map([], SchedulerSource::from_row)
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
        })
        .unwrap_or_default()
}

pub fn active_sources(pool: &DbPool) -> Vec<SchedulerSource> {
    list_sources(pool).into_iter().filter(|s| s.active).collect()
}

/// Claim an edit of the source list by bumping the state version inside the
/// caller's transaction. A client that saw an older version gets `Conflict`.
fn claim_edit(conn: &Connection, expected_version: Option<i64>) -> Result<(), SchedulerError> {
    let n = conn.execute(
        "UPDATE scheduler_state SET version = version + 1, updated_at = CURRENT_TIMESTAMP
         WHERE id = 1 AND (?1 IS NULL OR version = ?1)",
        params![expected_version],
    )?;
    if n == 0 {
        return Err(SchedulerError::Conflict);
    }
    Ok(())
}

pub fn add_source(pool: &DbPool, raw_url: &str, expected_version: Option<i64>) -> Result<SchedulerSource, SchedulerError> {
    let (kind, url) = SourceType::classify(raw_url).map_err(SchedulerError::Invalid)?;
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let exists: Option<String> = tx
        .query_row(
            "SELECT id FROM scheduler_sources WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(SchedulerError::Invalid("Source already exists".to_string()));
    }
    claim_edit(&tx, expected_version)?;
    let id = uuid::Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO scheduler_sources (id, url, source_type, active) VALUES (?1, ?2, ?3, 1)",
        params![id, url, kind.as_str()],
    )?;
    tx.commit()?;
    Ok(SchedulerSource {
        id,
        url,
        source_type: kind.as_str().to_string(),
        last_checked: None,
        active: true,
    })
}

pub fn delete_source(pool: &DbPool, id: &str, expected_version: Option<i64>) -> Result<(), SchedulerError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    claim_edit(&tx, expected_version)?;
    let n = tx.execute("DELETE FROM scheduler_sources WHERE id = ?1", params![id])?;
    if n == 0 {
        return Err(SchedulerError::Invalid("Source not found".to_string()));
    }
    tx.commit()?;
    Ok(())
}

pub fn toggle_source(pool: &DbPool, id: &str, expected_version: Option<i64>) -> Result<bool, SchedulerError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    claim_edit(&tx, expected_version)?;
    let n = tx.execute(
        "UPDATE scheduler_sources SET active = 1 - active WHERE id = ?1",
        params![id],
    )?;
    if n == 0 {
        return Err(SchedulerError::Invalid("Source not found".to_string()));
    }
    let active: i64 = tx.query_row(
        "SELECT active FROM scheduler_sources WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    tx.commit()?;
    Ok(active != 0)
}

pub fn mark_checked(pool: &DbPool, id: &str, at: NaiveDateTime) -> Result<(), SchedulerError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE scheduler_sources SET last_checked = ?1 WHERE id = ?2",
        params![at, id],
    )?;
    Ok(())
}

// ── Logs ──

/// Append a log line and drop everything older than the last `MAX_LOGS`.
pub fn log(pool: &DbPool, level: &str, message: &str) {
    match level {
        "error" => log::error!("[scheduler] {}", message),
        "warn" => log::warn!("[scheduler] {}", message),
        _ => log::info!("[scheduler] {}", message),
    }
    if let Ok(conn) = pool.get() {
        let _ = conn.execute(
            "INSERT INTO scheduler_logs (level, message) VALUES (?1, ?2)",
            params![level, message],
        );
        let _ = conn.execute(
            "DELETE FROM scheduler_logs WHERE id NOT IN
                (SELECT id FROM scheduler_logs ORDER BY id DESC LIMIT ?1)",
            params![MAX_LOGS],
        );
    }
}

/// Newest first.
pub fn recent_logs(pool: &DbPool) -> Vec<SchedulerLog> {
    let conn = match pool.get() {
        Ok(c) => c,
        Err(_) => return vec![],
    };
    conn.prepare("SELECT level, message, created_at FROM scheduler_logs ORDER BY id DESC LIMIT ?1")
        .and_then(|mut stmt| {
            stmt.query_map(params![MAX_LOGS], |row| {
                Ok(SchedulerLog {
                    level: row.get(0)?,
                    message: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
        })
        .unwrap_or_default()
}

// ── JSON mirror ──

pub fn snapshot(pool: &DbPool) -> Result<Snapshot, SchedulerError> {
    let state = SchedulerState::load(pool)?;
    Ok(Snapshot {
        active: state.active,
        next_run: state.next_run,
        version: state.version,
        sources: list_sources(pool),
        logs: recent_logs(pool),
    })
}

/// Mirror the current state to `path`. Failures are logged, never returned.
pub fn write_snapshot(pool: &DbPool, path: &Path) {
    let snap = match snapshot(pool) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[scheduler] snapshot skipped: {}", e);
            return;
        }
    };
    let body = match serde_json::to_vec_pretty(&snap) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("[scheduler] snapshot encode failed: {}", e);
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    // Write then rename so a reader never sees a half-written file.
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp, body).and_then(|_| std::fs::rename(&tmp, path)) {
        log::warn!("[scheduler] snapshot write to {} failed: {}", path.display(), e);
    }
}

/// Seed empty scheduler tables from a snapshot file left by an earlier
/// install. Returns true if anything was imported.
pub fn seed_from_snapshot(pool: &DbPool, path: &Path) -> Result<bool, String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(_) => return Ok(false),
    };
    let snap: Snapshot =
        serde_json::from_str(&raw).map_err(|e| format!("Invalid scheduler snapshot {}: {}", path.display(), e))?;

    let mut conn = pool.get().map_err(|e| e.to_string())?;
    let untouched: i64 = conn
        .query_row(
            "SELECT (SELECT version FROM scheduler_state WHERE id = 1) = 0
                AND (SELECT COUNT(*) FROM scheduler_sources) = 0",
            [],
            |row| row.get(0),
        )
        .map_err(|e| e.to_string())?;
    if untouched == 0 {
        return Ok(false);
    }

    let tx = conn.transaction().map_err(|e| e.to_string())?;
    tx.execute(
        "UPDATE scheduler_state SET active = ?1, next_run = ?2, version = 1 WHERE id = 1",
        params![snap.active as i64, snap.next_run],
    )
    .map_err(|e| e.to_string())?;
    for src in &snap.sources {
        // Re-validate: the file may predate URL checks.
        let Ok((kind, url)) = SourceType::classify(&src.url) else {
            continue;
        };
        tx.execute(
            "INSERT OR IGNORE INTO scheduler_sources (id, url, source_type, last_checked, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![src.id, url, kind.as_str(), src.last_checked, src.active as i64],
        )
        .map_err(|e| e.to_string())?;
    }
    // Snapshot logs are newest first; insert oldest first to keep id order.
    for entry in snap.logs.iter().rev().take(MAX_LOGS as usize) {
        tx.execute(
            "INSERT INTO scheduler_logs (level, message, created_at) VALUES (?1, ?2, ?3)",
            params![entry.level, entry.message, entry.created_at],
        )
        .map_err(|e| e.to_string())?;
    }
    tx.commit().map_err(|e| e.to_string())?;
    log::info!("[scheduler] seeded {} sources from {}", snap.sources.len(), path.display());
    Ok(true)
}
