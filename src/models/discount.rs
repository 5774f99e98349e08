use std::fmt;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::license::round_cents;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiscountCode {
    pub id: String,
    pub code: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: String, // percentage, fixed
    pub expires_at: Option<NaiveDateTime>,
    pub active: bool,
    pub usage_limit: Option<i64>,
    pub used_count: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscountForm {
    pub code: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub expires_at: Option<NaiveDateTime>,
    pub active: Option<bool>,
    pub usage_limit: Option<i64>,
}

#[derive(Debug, PartialEq)]
pub enum DiscountError {
    NotFound,
    Inactive,
    Expired,
    UsageLimitReached,
}

impl fmt::Display for DiscountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscountError::NotFound => "Discount code not found",
            DiscountError::Inactive => "Discount code is not active",
            DiscountError::Expired => "Discount code has expired",
            DiscountError::UsageLimitReached => "Discount code usage limit reached",
        })
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl DiscountCode {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(DiscountCode {
            id: row.get("id")?,
            code: row.get("code")?,
            amount: row.get("amount")?,
            kind: row.get("type")?,
            expires_at: row.get("expires_at")?,
            active: row.get::<_, i64>("active")? != 0,
            usage_limit: row.get("usage_limit")?,
            used_count: row.get("used_count")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Check whether the code can be used at `now`.
    pub fn check(&self, now: NaiveDateTime) -> Result<(), DiscountError> {
        if !self.active {
            return Err(DiscountError::Inactive);
        }
        if self.expires_at.is_some_and(|exp| exp <= now) {
            return Err(DiscountError::Expired);
        }
        if self.usage_limit.is_some_and(|limit| self.used_count >= limit) {
            return Err(DiscountError::UsageLimitReached);
        }
        Ok(())
    }

    /// Discount amount for `subtotal`: percentages are capped at 100%,
    /// fixed amounts never exceed the subtotal.
    pub fn apply(&self, subtotal: f64) -> f64 {
        let subtotal = subtotal.max(0.0);
        let raw = match self.kind.as_str() {
            "percentage" => subtotal * self.amount.clamp(0.0, 100.0) / 100.0,
            _ => self.amount.max(0.0),
        };
        round_cents(raw.min(subtotal))
    }

    fn validate_form(form: &DiscountForm) -> Result<String, String> {
        let code = normalize_code(&form.code);
        if code.is_empty() || code.len() > 32 {
            return Err("Code must be 1-32 characters".to_string());
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err("Code may only contain letters, digits, '-' and '_'".to_string());
        }
        match form.kind.as_str() {
            "percentage" if form.amount <= 0.0 || form.amount > 100.0 => {
                Err("Percentage must be between 0 and 100".to_string())
            }
            "fixed" if form.amount <= 0.0 => Err("Amount must be positive".to_string()),
            "percentage" | "fixed" => Ok(code),
            other => Err(format!("Unknown discount type '{}'", other)),
        }
    }

    // ── Queries ──

    pub fn find_by_id(pool: &DbPool, id: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row(
            "SELECT * FROM discount_codes WHERE id = ?1",
            params![id],
            Self::from_row,
        )
        .ok()
    }

    pub fn find_by_code(pool: &DbPool, code: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row(
            "SELECT * FROM discount_codes WHERE code = ?1",
            params![normalize_code(code)],
            Self::from_row,
        )
        .ok()
    }

    pub fn list(pool: &DbPool) -> Vec<Self> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        let mut stmt = match conn.prepare("SELECT * FROM discount_codes ORDER BY created_at DESC, code ASC") {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        stmt.query_map([], Self::from_row)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Look up `code`, check it is usable at `now` and compute the discount
    /// it gives on `subtotal`.
    pub fn validate(
        pool: &DbPool,
        code: &str,
        subtotal: f64,
        now: NaiveDateTime,
    ) -> Result<(Self, f64), DiscountError> {
        let dc = Self::find_by_code(pool, code).ok_or(DiscountError::NotFound)?;
        dc.check(now)?;
        let amount = dc.apply(subtotal);
        Ok((dc, amount))
    }

    // ── Admin mutations ──

    pub fn create(pool: &DbPool, form: &DiscountForm) -> Result<String, String> {
        let code = Self::validate_form(form)?;
        let id = uuid::Uuid::new_v4().to_string();
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO discount_codes (id, code, amount, type, expires_at, active, usage_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                code,
                form.amount,
                form.kind,
                form.expires_at,
                form.active.unwrap_or(true) as i64,
                form.usage_limit
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                format!("Discount code '{}' already exists", code)
            }
            other => other.to_string(),
        })?;
        Ok(id)
    }

    pub fn update(pool: &DbPool, id: &str, form: &DiscountForm) -> Result<(), String> {
        let code = Self::validate_form(form)?;
        let conn = pool.get().map_err(|e| e.to_string())?;
        let n = conn
            .execute(
                "UPDATE discount_codes SET code = ?1, amount = ?2, type = ?3, expires_at = ?4,
                    active = COALESCE(?5, active), usage_limit = ?6
                 WHERE id = ?7",
                params![
                    code,
                    form.amount,
                    form.kind,
                    form.expires_at,
                    form.active.map(|a| a as i64),
                    form.usage_limit,
                    id
                ],
            )
            .map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("Discount code not found".to_string());
        }
        Ok(())
    }

    pub fn toggle_active(pool: &DbPool, id: &str) -> Result<bool, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE discount_codes SET active = 1 - active WHERE id = ?1",
            params![id],
        )
        .map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT active FROM discount_codes WHERE id = ?1",
            params![id],
            |row| row.get::<_, i64>(0),
        )
        .map(|a| a != 0)
        .map_err(|_| "Discount code not found".to_string())
    }

    pub fn delete(pool: &DbPool, id: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM discount_codes WHERE id = ?1", params![id])
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    // ── Usage accounting ──

    /// Count one use of `code` for the checkout identified by `checkout_ref`.
    /// Repeated calls for the same checkout are no-ops. Returns whether a use
    /// was recorded.
    pub fn redeem(conn: &Connection, code: &str, checkout_ref: &str) -> Result<bool, String> {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM discount_codes WHERE code = ?1",
                params![normalize_code(code)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        let Some(id) = id else {
            return Ok(false);
        };
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO discount_redemptions (discount_id, checkout_ref) VALUES (?1, ?2)",
                params![id, checkout_ref],
            )
            .map_err(|e| e.to_string())?;
        if inserted == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE discount_codes SET used_count = used_count + 1 WHERE id = ?1",
            params![id],
        )
        .map_err(|e| e.to_string())?;
        Ok(true)
    }

    /// Give back the use recorded for `checkout_ref`, if any.
    /// used_count never drops below zero and never for a checkout that did not redeem.
    pub fn release(conn: &Connection, code: &str, checkout_ref: &str) -> Result<bool, String> {
        let removed = conn
            .execute(
                "DELETE FROM discount_redemptions WHERE checkout_ref = ?2
                 AND discount_id = (SELECT id FROM discount_codes WHERE code = ?1)",
                params![normalize_code(code), checkout_ref],
            )
            .map_err(|e| e.to_string())?;
        if removed == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE discount_codes SET used_count = MAX(used_count - 1, 0) WHERE code = ?1",
            params![normalize_code(code)],
        )
        .map_err(|e| e.to_string())?;
        Ok(true)
    }
}
