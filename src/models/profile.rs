use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::DbPool;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String, // customer, admin
    pub billing_address: String,
    pub billing_city: String,
    pub billing_postal_code: String,
    pub billing_country: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Deserialize, Default)]
pub struct BillingForm {
    pub full_name: Option<String>,
    pub billing_address: Option<String>,
    pub billing_city: Option<String>,
    pub billing_postal_code: Option<String>,
    pub billing_country: Option<String>,
}

/// Profile row joined with its purchase history, for the customers screen.
#[derive(Debug, Serialize)]
pub struct CustomerSummary {
    pub profile: Profile,
    pub order_count: i64,
    pub total_spent: f64,
    pub last_order_at: Option<NaiveDateTime>,
}

impl Profile {
    const SELECT_COLS: &'static str = "id, email, full_name, password_hash, role, billing_address, billing_city, billing_postal_code, billing_country, created_at";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Profile {
            id: row.get(0)?,
            email: row.get(1)?,
            full_name: row.get(2)?,
            password_hash: row.get(3)?,
            role: row.get(4)?,
            billing_address: row.get(5)?,
            billing_city: row.get(6)?,
            billing_postal_code: row.get(7)?,
            billing_country: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn is_guest(&self) -> bool {
        self.password_hash.is_none()
    }

    pub fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.email
        } else {
            &self.full_name
        }
    }

    pub fn safe_json(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "full_name": self.full_name,
            "role": self.role,
            "guest": self.is_guest(),
            "billing": {
                "address": self.billing_address,
                "city": self.billing_city,
                "postal_code": self.billing_postal_code,
                "country": self.billing_country,
            },
            "created_at": self.created_at,
        })
    }

    // ── Lookups ──

    pub fn find_by_id(pool: &DbPool, id: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row(
            &format!("SELECT {} FROM profiles WHERE id = ?1", Self::SELECT_COLS),
            params![id],
            Self::from_row,
        )
        .ok()
    }

    pub fn find_by_email(pool: &DbPool, email: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM profiles WHERE email = ?1 COLLATE NOCASE",
                Self::SELECT_COLS
            ),
            params![email.trim()],
            Self::from_row,
        )
        .ok()
    }

    pub fn count(pool: &DbPool) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
            .unwrap_or(0)
    }

    pub fn count_by_role(pool: &DbPool, role: &str) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE role = ?1",
            params![role],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    // ── Mutations ──

    pub fn create(
        pool: &DbPool,
        email: &str,
        full_name: &str,
        password_hash: Option<&str>,
        role: &str,
    ) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        Self::create_with_id(pool, &id, email, full_name, password_hash, role)?;
        Ok(id)
    }

    pub fn create_with_id(
        pool: &DbPool,
        id: &str,
        email: &str,
        full_name: &str,
        password_hash: Option<&str>,
        role: &str,
    ) -> Result<(), String> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err("A valid email address is required".to_string());
        }
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO profiles (id, email, full_name, password_hash, role) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, email, full_name, password_hash, role],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Return the profile for `email`, creating a password-less guest profile
    /// when none exists. Used when a checkout arrives without a known account.
    pub fn ensure_for_email(pool: &DbPool, email: &str, full_name: &str) -> Result<Self, String> {
        if let Some(p) = Self::find_by_email(pool, email) {
            return Ok(p);
        }
        let id = Self::create(pool, email, full_name, None, "customer")?;
        Self::find_by_id(pool, &id).ok_or_else(|| "Profile not found after creation".to_string())
    }

    /// Upgrade a guest profile into a full account (signup after a guest checkout).
    pub fn claim(pool: &DbPool, id: &str, full_name: &str, password_hash: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let changed = conn
            .execute(
                "UPDATE profiles SET password_hash = ?1, full_name = CASE WHEN ?2 = '' THEN full_name ELSE ?2 END,
                 updated_at = CURRENT_TIMESTAMP WHERE id = ?3 AND password_hash IS NULL",
                params![password_hash, full_name, id],
            )
            .map_err(|e| e.to_string())?;
        if changed == 0 {
            return Err("Account already exists".to_string());
        }
        Ok(())
    }

    pub fn update_billing(pool: &DbPool, id: &str, form: &BillingForm) -> Result<(), String> {
        let current = Self::find_by_id(pool, id).ok_or("Profile not found")?;
        let pick = |new: &Option<String>, old: &str| {
            new.as_deref().map(str::trim).unwrap_or(old).to_string()
        };
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE profiles SET full_name = ?1, billing_address = ?2, billing_city = ?3,
             billing_postal_code = ?4, billing_country = ?5, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?6",
            params![
                pick(&form.full_name, &current.full_name),
                pick(&form.billing_address, &current.billing_address),
                pick(&form.billing_city, &current.billing_city),
                pick(&form.billing_postal_code, &current.billing_postal_code),
                pick(&form.billing_country, &current.billing_country),
                id
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn update_role(pool: &DbPool, id: &str, role: &str) -> Result<(), String> {
        if role != "customer" && role != "admin" {
            return Err(format!("Unknown role '{}'", role));
        }
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE profiles SET role = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![role, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    // ── Customers screen ──

    pub fn list_customers(pool: &DbPool, search: Option<&str>, limit: i64, offset: i64) -> Vec<CustomerSummary> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        let pattern = format!("%{}%", search.unwrap_or("").trim());
        let sql = format!(
            "SELECT {}, COUNT(o.id), COALESCE(SUM(CASE WHEN o.status = 'completed' THEN o.total_amount ELSE 0 END), 0.0), MAX(o.order_date)
             FROM profiles p LEFT JOIN orders o ON o.user_id = p.id
             WHERE p.email LIKE ?1 OR p.full_name LIKE ?1
             GROUP BY p.id ORDER BY p.created_at DESC LIMIT ?2 OFFSET ?3",
            Self::SELECT_COLS
                .split(", ")
                .map(|c| format!("p.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        stmt.query_map(params![pattern, limit, offset], |row| {
            Ok(CustomerSummary {
                profile: Self::from_row(row)?,
                order_count: row.get(10)?,
                total_spent: row.get(11)?,
                last_order_at: row.get(12)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    /// Create guest profiles for orders whose `user_id` has no profile row.
    /// Ids drift when a checkout was reconciled before the account existed.
    /// A row that cannot be repaired is logged and skipped. Returns the
    /// number of profiles created.
    pub fn repair_missing(pool: &DbPool) -> Result<usize, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT o.user_id, MAX(o.customer_email) FROM orders o
                 LEFT JOIN profiles p ON p.id = o.user_id
                 WHERE p.id IS NULL GROUP BY o.user_id",
            )
            .map_err(|e| e.to_string())?;
        let orphans: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, Option<String>>(1)?.unwrap_or_default())))
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        let mut created = 0;
        let mut failed = 0;
        for (user_id, email) in orphans {
            match Self::repair_one(pool, &user_id, email) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Profile repair skipped user {}: {}", user_id, e);
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            log::warn!("Profile repair left {} users unrepaired", failed);
        }
        Ok(created)
    }

    /// Repoint one orphaned user's rows at the account holding their email,
    /// or create a guest profile under the orphaned id. `Ok(true)` when a
    /// profile was created.
    fn repair_one(pool: &DbPool, user_id: &str, email: String) -> Result<bool, String> {
        if let Some(existing) = Self::find_by_email(pool, &email) {
            let conn = pool.get().map_err(|e| e.to_string())?;
            conn.execute(
                "UPDATE orders SET user_id = ?1 WHERE user_id = ?2",
                params![existing.id, user_id],
            )
            .map_err(|e| e.to_string())?;
            conn.execute(
                "UPDATE transactions SET user_id = ?1 WHERE user_id = ?2",
                params![existing.id, user_id],
            )
            .map_err(|e| e.to_string())?;
            return Ok(false);
        }
        let email = if email.is_empty() {
            let short: String = user_id.chars().take(8).collect();
            format!("unknown+{}@invalid.local", short)
        } else {
            email
        };
        Self::create_with_id(pool, user_id, &email, "", None, "customer")?;
        Ok(true)
    }
}

// ── Sessions ──

pub struct Session;

impl Session {
    pub fn create(pool: &DbPool, profile_id: &str, ip_hash: Option<&str>, expires_at: NaiveDateTime) -> Result<String, String> {
        let id = crate::security::generate_token();
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO sessions (id, profile_id, ip_hash, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, profile_id, ip_hash, expires_at],
        )
        .map_err(|e| e.to_string())?;
        Ok(id)
    }

    pub fn get_profile(pool: &DbPool, session_id: &str) -> Option<Profile> {
        let conn = pool.get().ok()?;
        let now = Utc::now().naive_utc();
        let profile_id: Option<String> = conn
            .query_row(
                "SELECT profile_id FROM sessions WHERE id = ?1 AND expires_at > ?2",
                params![session_id, now],
                |row| row.get(0),
            )
            .optional()
            .ok()?;
        drop(conn);
        Profile::find_by_id(pool, &profile_id?)
    }

    pub fn delete(pool: &DbPool, session_id: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn cleanup_expired(pool: &DbPool) -> Result<usize, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![Utc::now().naive_utc()],
        )
        .map_err(|e| e.to_string())
    }
}
