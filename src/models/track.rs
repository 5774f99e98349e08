use chrono::NaiveDateTime;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub artist: String,
    pub bpm: Option<i64>,
    pub musical_key: String,
    pub genre: String,
    pub tags: String,
    pub duration_secs: Option<i64>,
    pub preview_url: String,
    pub cover_url: String,
    pub base_price: f64,
    pub status: String, // draft, published, sold (exclusive license bought)
    pub source: String, // manual, youtube
    pub source_url: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Create/update payload. Also the manifest format for bulk imports and for
/// the `.json` files the scheduler's downloader leaves next to its audio.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TrackForm {
    pub title: String,
    pub artist: Option<String>,
    pub bpm: Option<i64>,
    pub musical_key: Option<String>,
    pub genre: Option<String>,
    pub tags: Option<String>,
    pub duration_secs: Option<i64>,
    pub preview_url: Option<String>,
    pub cover_url: Option<String>,
    pub base_price: Option<f64>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct TrackFilter<'a> {
    pub status: Option<&'a str>,
    pub genre: Option<&'a str>,
    pub search: Option<&'a str>,
}

impl Track {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Track {
            id: row.get("id")?,
            title: row.get("title")?,
            slug: row.get("slug")?,
            artist: row.get("artist")?,
            bpm: row.get("bpm")?,
            musical_key: row.get("musical_key")?,
            genre: row.get("genre")?,
            tags: row.get("tags")?,
            duration_secs: row.get("duration_secs")?,
            preview_url: row.get("preview_url")?,
            cover_url: row.get("cover_url")?,
            base_price: row.get("base_price")?,
            status: row.get("status")?,
            source: row.get("source")?,
            source_url: row.get("source_url")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn is_published(&self) -> bool {
        self.status == "published"
    }

    pub fn find_by_id(pool: &DbPool, id: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row("SELECT * FROM tracks WHERE id = ?1", params![id], Self::from_row)
            .ok()
    }

    pub fn find_by_slug(pool: &DbPool, slug: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row("SELECT * FROM tracks WHERE slug = ?1", params![slug], Self::from_row)
            .ok()
    }

    /// Storefront URLs accept either the UUID or the slug.
    pub fn find_by_id_or_slug(pool: &DbPool, key: &str) -> Option<Self> {
        Self::find_by_id(pool, key).or_else(|| Self::find_by_slug(pool, key))
    }

    pub fn exists_by_source_url(pool: &DbPool, source_url: &str) -> bool {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return false,
        };
        conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE source_url = ?1",
            params![source_url],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false)
    }

    fn filter_sql(filter: &TrackFilter<'_>) -> (String, Vec<String>) {
        let mut sql = String::from(" WHERE 1=1");
        let mut args = Vec::new();
        if let Some(s) = filter.status {
            args.push(s.to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(g) = filter.genre.filter(|g| !g.is_empty()) {
            args.push(g.to_string());
            sql.push_str(&format!(" AND genre = ?{} COLLATE NOCASE", args.len()));
        }
        if let Some(q) = filter.search.map(str::trim).filter(|q| !q.is_empty()) {
            args.push(format!("%{}%", q));
            let n = args.len();
            sql.push_str(&format!(
                " AND (title LIKE ?{n} OR artist LIKE ?{n} OR tags LIKE ?{n})"
            ));
        }
        (sql, args)
    }

    pub fn list(pool: &DbPool, filter: &TrackFilter<'_>, limit: i64, offset: i64) -> Vec<Self> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        let (where_sql, mut args) = Self::filter_sql(filter);
        args.push(limit.to_string());
        args.push(offset.to_string());
        let sql = format!(
            "SELECT * FROM tracks{} ORDER BY created_at DESC, title ASC LIMIT CAST(?{} AS INTEGER) OFFSET CAST(?{} AS INTEGER)",
            where_sql,
            args.len() - 1,
            args.len()
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        stmt.query_map(rusqlite::params_from_iter(args.iter()), Self::from_row)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn count(pool: &DbPool, filter: &TrackFilter<'_>) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        let (where_sql, args) = Self::filter_sql(filter);
        conn.query_row(
            &format!("SELECT COUNT(*) FROM tracks{}", where_sql),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    pub fn genres(pool: &DbPool) -> Vec<String> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        let mut stmt = match conn.prepare(
            "SELECT DISTINCT genre FROM tracks WHERE status = 'published' AND genre != '' ORDER BY genre",
        ) {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        stmt.query_map([], |row| row.get(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn create(pool: &DbPool, form: &TrackForm) -> Result<String, String> {
        let title = form.title.trim();
        if title.is_empty() {
            return Err("Title is required".to_string());
        }
        let price = form.base_price.unwrap_or(0.0);
        if price < 0.0 || !price.is_finite() {
            return Err("Price must be a positive amount".to_string());
        }
        let id = uuid::Uuid::new_v4().to_string();
        let slug = Self::unique_slug(pool, title)?;
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO tracks (id, title, slug, artist, bpm, musical_key, genre, tags, duration_secs,
                preview_url, cover_url, base_price, status, source, source_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                id,
                title,
                slug,
                form.artist.as_deref().unwrap_or(""),
                form.bpm,
                form.musical_key.as_deref().unwrap_or(""),
                form.genre.as_deref().unwrap_or(""),
                form.tags.as_deref().unwrap_or(""),
                form.duration_secs,
                form.preview_url.as_deref().unwrap_or(""),
                form.cover_url.as_deref().unwrap_or(""),
                price,
                form.status.as_deref().unwrap_or("draft"),
                form.source.as_deref().unwrap_or("manual"),
                form.source_url.as_deref().filter(|u| !u.is_empty()),
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(id)
    }

    pub fn update(pool: &DbPool, id: &str, form: &TrackForm) -> Result<(), String> {
        let current = Self::find_by_id(pool, id).ok_or("Track not found")?;
        let title = form.title.trim();
        if title.is_empty() {
            return Err("Title is required".to_string());
        }
        let slug = if title == current.title {
            current.slug.clone()
        } else {
            Self::unique_slug(pool, title)?
        };
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE tracks SET title = ?1, slug = ?2, artist = ?3, bpm = ?4, musical_key = ?5, genre = ?6,
                tags = ?7, duration_secs = ?8, preview_url = ?9, cover_url = ?10, base_price = ?11,
                status = ?12, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?13",
            params![
                title,
                slug,
                form.artist.clone().unwrap_or(current.artist),
                form.bpm.or(current.bpm),
                form.musical_key.clone().unwrap_or(current.musical_key),
                form.genre.clone().unwrap_or(current.genre),
                form.tags.clone().unwrap_or(current.tags),
                form.duration_secs.or(current.duration_secs),
                form.preview_url.clone().unwrap_or(current.preview_url),
                form.cover_url.clone().unwrap_or(current.cover_url),
                form.base_price.unwrap_or(current.base_price),
                form.status.clone().unwrap_or(current.status),
                id
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn update_status(pool: &DbPool, id: &str, status: &str) -> Result<(), String> {
        if !matches!(status, "draft" | "published" | "sold") {
            return Err(format!("Unknown track status '{}'", status));
        }
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE tracks SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn delete(pool: &DbPool, id: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let n = conn
            .execute("DELETE FROM tracks WHERE id = ?1", params![id])
            .map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("Track not found".to_string());
        }
        Ok(())
    }

    fn unique_slug(pool: &DbPool, title: &str) -> Result<String, String> {
        let base = slug::slugify(title);
        let base = if base.is_empty() { "track".to_string() } else { base };
        let mut candidate = base.clone();
        let mut n = 2;
        while Self::find_by_slug(pool, &candidate).is_some() {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        Ok(candidate)
    }
}

/// Outcome of a bulk manifest import.
#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Import track manifests, skipping any whose `source_url` is already in the catalog.
pub fn import_manifests(pool: &DbPool, manifests: &[TrackForm], default_price: f64) -> ImportReport {
    let mut report = ImportReport::default();
    for m in manifests {
        if let Some(url) = m.source_url.as_deref().filter(|u| !u.is_empty()) {
            if Track::exists_by_source_url(pool, url) {
                report.skipped += 1;
                continue;
            }
        }
        let mut form = m.clone();
        if form.base_price.is_none() {
            form.base_price = Some(default_price);
        }
        match Track::create(pool, &form) {
            Ok(id) => report.imported.push(id),
            Err(e) => report.errors.push(format!("{}: {}", m.title, e)),
        }
    }
    report
}
