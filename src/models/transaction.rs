use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::DbPool;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    pub id: String,
    pub order_id: Option<String>,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: String, // stripe, crypto
    pub status: String,           // pending, completed, failed, expired
    pub stripe_transaction_id: Option<String>,
    pub metadata: Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub order_id: Option<&'a str>,
    pub user_id: &'a str,
    pub amount: f64,
    pub currency: &'a str,
    pub transaction_type: &'a str,
    pub status: &'a str,
    pub stripe_transaction_id: Option<&'a str>,
    pub metadata: &'a Value,
}

impl Transaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let meta: String = row.get("metadata")?;
        Ok(Transaction {
            id: row.get("id")?,
            order_id: row.get("order_id")?,
            user_id: row.get("user_id")?,
            amount: row.get("amount")?,
            currency: row.get("currency")?,
            transaction_type: row.get("transaction_type")?,
            status: row.get("status")?,
            stripe_transaction_id: row.get("stripe_transaction_id")?,
            metadata: serde_json::from_str(&meta).unwrap_or(Value::Null),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn insert(conn: &Connection, new: &NewTransaction<'_>) -> rusqlite::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO transactions (id, order_id, user_id, amount, currency, transaction_type, status,
                stripe_transaction_id, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                new.order_id,
                new.user_id,
                new.amount,
                new.currency,
                new.transaction_type,
                new.status,
                new.stripe_transaction_id,
                new.metadata.to_string(),
            ],
        )?;
        Ok(id)
    }

    pub fn create(pool: &DbPool, new: &NewTransaction<'_>) -> Result<String, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        Self::insert(&conn, new).map_err(|e| e.to_string())
    }

    pub fn find_by_id(pool: &DbPool, id: &str) -> Option<Self> {
        let conn = pool.get().ok()?;
        conn.query_row(
            "SELECT * FROM transactions WHERE id = ?1",
            params![id],
            Self::from_row,
        )
        .ok()
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

    pub fn list_by_order(pool: &DbPool, order_id: &str) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM transactions WHERE order_id = ?1 ORDER BY created_at ASC",
            params![order_id],
        )
    }

    pub fn list_by_user(pool: &DbPool, user_id: &str) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM transactions WHERE user_id = ?1 ORDER BY created_at DESC",
            params![user_id],
        )
    }

    pub fn list_pending_crypto(pool: &DbPool) -> Vec<Self> {
        Self::query(
            pool,
            "SELECT * FROM transactions WHERE transaction_type = 'crypto' AND status = 'pending' ORDER BY created_at ASC",
            [],
        )
    }

    pub fn update_status(pool: &DbPool, id: &str, status: &str) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        Self::update_status_on(&conn, id, status)
    }

    pub fn update_status_on(conn: &Connection, id: &str, status: &str) -> Result<(), String> {
        conn.execute(
            "UPDATE transactions SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn update_metadata(pool: &DbPool, id: &str, metadata: &Value) -> Result<(), String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE transactions SET metadata = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![metadata.to_string(), id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn set_order(conn: &Connection, id: &str, order_id: &str) -> Result<(), String> {
        conn.execute(
            "UPDATE transactions SET order_id = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![order_id, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}
