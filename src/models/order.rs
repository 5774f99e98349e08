use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, PartialEq)]
pub enum TransitionError {
    Unknown(String),
    NotAllowed { from: OrderStatus, to: OrderStatus },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::Unknown(s) => write!(f, "Unknown order status '{}'", s),
            TransitionError::NotAllowed { from, to } => {
                write!(f, "Cannot move an order from {} to {}", from, to)
            }
        }
    }
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 3] = [OrderStatus::Pending, OrderStatus::Completed, OrderStatus::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    /// The single place order lifecycle rules live.
    /// pending -> completed | failed, failed -> completed (async retry paid),
    /// completed is terminal. Re-applying the current status is a no-op.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Completed) | (Pending, Failed) | (Failed, Completed)
        ) || self == next
    }

    pub fn check_transition(self, next: OrderStatus) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TransitionError::NotAllowed { from: self, to: next })
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(TransitionError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub track_id: String,
    pub track_name: String,
    pub license: String,
    pub order_date: NaiveDateTime,
    pub total_amount: f64,
    pub discount: f64,
    pub currency: String,
    pub status: String,
    pub stripe_session_id: Option<String>,
    pub license_file: Option<String>,
    pub customer_email: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Everything needed to insert one order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: String,
    pub track_id: String,
    pub track_name: String,
    pub license: String,
    pub total_amount: f64,
    pub discount: f64,
    pub currency: String,
    pub status: OrderStatus,
    pub stripe_session_id: Option<String>,
    pub customer_email: String,
}

impl Order {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            track_id: row.get("track_id")?,
            track_name: row.get("track_name")?,
            license: row.get("license")?,
            order_date: row.get("order_date")?,
            total_amount: row.get("total_amount")?,
            discount: row.get("discount")?,
            currency: row.get("currency")?,
            status: row.get("status")?,
            stripe_session_id: row.get("stripe_session_id")?,
            license_file: row.get("license_file")?,
            customer_email: row.get("customer_email")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn status(&self) -> OrderStatus {
        self.status.parse().unwrap_or(OrderStatus::Pending)
    }

    /// Insert on an existing connection so callers can group it with the
    /// matching transaction row.
    pub fn insert(conn: &Connection, new: &NewOrder) -> rusqlite::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO orders (id, user_id, track_id, track_name, license, order_date, total_amount,
                discount, currency, status, stripe_session_id, customer_email)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                new.user_id,
                new.track_id,
                new.track_name,
                new.license,
                Utc::now().naive_utc(),
                new.total_amount,
                new.discount,
                new.currency,
                new.status.as_str(),
                new.stripe_session_id,
                new.customer_email,
            ],
        )?;
        Ok(id)
    }

    pub fn find_by_id(pool: &DbPool, id: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row("SELECT * FROM orders WHERE id = ?1", params![id], Self::from_row)
            .ok()
    }

    pub fn find_by_session(pool: &DbPool, session_id: &str) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM orders WHERE stripe_session_id = ?1 ORDER BY created_at ASC",
            params![session_id],
        )
    }

    /// True when this checkout line was already recorded (webhook redelivery).
    pub fn exists_for_line_item(conn: &Connection, session_id: &str, track_id: &str, license: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE stripe_session_id = ?1 AND track_id = ?2 AND license = ?3",
            params![session_id, track_id, license],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false)
    }

    fn query<P: rusqlite::Params>(pool: &DbPool, sql: &str, p: P) -> Vec<Self> {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return vec![],
        };
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(_) => return vec![],
        };
        stmt.query_map(p, Self::from_row)
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    pub fn list(pool: &DbPool, limit: i64, offset: i64) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM orders ORDER BY order_date DESC LIMIT ?1 OFFSET ?2",
            params![limit, offset],
        )
    }

    pub fn list_by_status(pool: &DbPool, status: &str, limit: i64, offset: i64) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM orders WHERE status = ?1 ORDER BY order_date DESC LIMIT ?2 OFFSET ?3",
            params![status, limit, offset],
        )
    }

    pub fn list_by_user(pool: &DbPool, user_id: &str) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM orders WHERE user_id = ?1 ORDER BY order_date DESC",
            params![user_id],
        )
    }

    pub fn list_by_email(pool: &DbPool, email: &str, limit: i64, offset: i64) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM orders WHERE customer_email = ?1 COLLATE NOCASE ORDER BY order_date DESC LIMIT ?2 OFFSET ?3",
            params![email, limit, offset],
        )
    }

    pub fn count(pool: &DbPool) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap_or(0)
    }

    pub fn count_by_status(pool: &DbPool, status: &str) -> i64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0,
        };
        conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    pub fn total_revenue(pool: &DbPool) -> f64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0.0,
        };
        conn.query_row(
            "SELECT COALESCE(SUM(total_amount), 0.0) FROM orders WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0.0)
    }

    pub fn revenue_since(pool: &DbPool, since: NaiveDateTime) -> f64 {
        let conn = match pool.get() {
            Ok(c) => c,
            Err(_) => return 0.0,
        };
        conn.query_row(
            "SELECT COALESCE(SUM(total_amount), 0.0) FROM orders WHERE status = 'completed' AND order_date >= ?1",
            params![since],
            |row| row.get(0),
        )
        .unwrap_or(0.0)
    }

    /// Move an order to `next`, enforcing the lifecycle rules.
    pub fn update_status(pool: &DbPool, id: &str, next: OrderStatus) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        Self::update_status_on(&conn, id, next)
    }

    pub fn update_status_on(conn: &Connection, id: &str, next: OrderStatus) -> Result<(), String> {
        let current: String = conn
            .query_row("SELECT status FROM orders WHERE id = ?1", params![id], |row| row.get(0))
            .map_err(|_| "Order not found".to_string())?;
        let current: OrderStatus = current.parse().map_err(|e: TransitionError| e.to_string())?;
        current.check_transition(next).map_err(|e| e.to_string())?;
        if current == next {
            return Ok(());
        }
        conn.execute(
            "UPDATE orders SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2 AND status = ?3",
            params![next.as_str(), id, current.as_str()],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn set_license_file(pool: &DbPool, id: &str, path: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE orders SET license_file = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![path, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}
