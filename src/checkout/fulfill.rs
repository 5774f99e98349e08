use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::db::DbPool;
use crate::license::{self, LicenseType};
use crate::models::order::{NewOrder, Order, OrderStatus};
use crate::models::track::Track;
use crate::models::transaction::{NewTransaction, Transaction};
use crate::payments::stripe::CartLine;
use crate::payments::with_retry;

/// Who paid and through which checkout.
#[derive(Debug, Clone)]
pub struct Purchase<'a> {
    /// Stripe session id, or the crypto payment's transaction id.
    pub checkout_ref: &'a str,
    pub user_id: &'a str,
    pub customer_email: &'a str,
    pub currency: &'a str,
    pub status: OrderStatus,
    /// Stripe purchases get one transaction row per line carrying this id.
    /// Crypto purchases already have their transaction row.
    pub stripe_transaction_id: Option<&'a str>,
}

#[derive(Debug, Default, Serialize)]
pub struct PurchaseReport {
    pub created: Vec<String>,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Parse `value` as a UUID, or replace it and note why. The replacement is
/// derived from `scope` and the raw value, so a redelivered event maps the
/// same malformed id to the same UUID.
pub fn coerce_uuid(value: &str, field: &str, scope: &str, warnings: &mut Vec<String>) -> String {
    match uuid::Uuid::parse_str(value.trim()) {
        Ok(id) => id.to_string(),
        Err(_) => {
            let name = format!("{}:{}:{}", scope, field, value);
            let replacement = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string();
            warnings.push(format!(
                "{} '{}' is not a valid UUID, replaced with {}",
                field, value, replacement
            ));
            replacement
        }
    }
}

/// Record one cart line: order plus (for Stripe) its transaction, in a
/// single database transaction. `Ok(None)` when the line was already
/// recorded for this checkout.
pub fn record_line(
    pool: &DbPool,
    purchase: &Purchase<'_>,
    line: &CartLine,
    warnings: &mut Vec<String>,
) -> Result<Option<String>, String> {
    let license: LicenseType = line.license.parse()?;
    let track_id = coerce_uuid(&line.track_id, "track_id", purchase.checkout_ref, warnings);
    let track_name = if !line.name.is_empty() {
        line.name.clone()
    } else {
        Track::find_by_id(pool, &track_id)
            .map(|t| t.title)
            .unwrap_or_else(|| "Unknown track".to_string())
    };

    let mut conn = pool.get().map_err(|e| e.to_string())?;
    let tx = conn.transaction().map_err(|e| e.to_string())?;

    if Order::exists_for_line_item(&tx, purchase.checkout_ref, &track_id, license.as_str()) {
        return Ok(None);
    }

    let order_id = Order::insert(
        &tx,
        &NewOrder {
            user_id: purchase.user_id.to_string(),
            track_id: track_id.clone(),
            track_name,
            license: license.as_str().to_string(),
            total_amount: line.amount,
            discount: line.discount,
            currency: purchase.currency.to_uppercase(),
            status: purchase.status,
            stripe_session_id: Some(purchase.checkout_ref.to_string()),
            customer_email: purchase.customer_email.to_string(),
        },
    )
    .map_err(|e| format!("Order insert failed: {}", e))?;

    if let Some(stripe_id) = purchase.stripe_transaction_id {
        let metadata = json!({
            "checkout_session": purchase.checkout_ref,
            "track_id": track_id,
            "license": license.as_str(),
        });
        let new = NewTransaction {
            order_id: Some(&order_id),
            user_id: purchase.user_id,
            amount: line.amount,
            currency: purchase.currency,
            transaction_type: "stripe",
            status: purchase.status.as_str(),
            stripe_transaction_id: Some(stripe_id),
            metadata: &metadata,
        };
        with_retry("transaction insert", 2, Duration::from_millis(200), || {
            Transaction::insert(&tx, &new).map_err(|e| e.to_string())
        })?;
    }

    tx.commit().map_err(|e| e.to_string())?;
    Ok(Some(order_id))
}

/// Things to do once an order is paid: write its license and retire
/// exclusively sold tracks from the storefront.
pub fn after_paid(pool: &DbPool, licenses_dir: &Path, order: &Order) -> Result<(), String> {
    if order.license_file.is_none() {
        license::generate_for_order(pool, licenses_dir, order)?;
    }
    let exclusive = order
        .license
        .parse::<LicenseType>()
        .map(|l| l.is_exclusive())
        .unwrap_or(false);
    if exclusive && Track::find_by_id(pool, &order.track_id).is_some() {
        Track::update_status(pool, &order.track_id, "sold")?;
    }
    Ok(())
}

/// Record every line of a purchase. A failing line is reported and the
/// rest are still processed.
pub fn record_purchase(
    pool: &DbPool,
    licenses_dir: &Path,
    purchase: &Purchase<'_>,
    lines: &[CartLine],
) -> PurchaseReport {
    let mut report = PurchaseReport::default();
    for line in lines {
        match record_line(pool, purchase, line, &mut report.warnings) {
            Ok(Some(order_id)) => {
                if purchase.status == OrderStatus::Completed {
                    if let Some(order) = Order::find_by_id(pool, &order_id) {
                        if let Err(e) = after_paid(pool, licenses_dir, &order) {
                            report.warnings.push(format!("License for order {}: {}", order_id, e));
                        }
                    }
                }
                report.created.push(order_id);
            }
            Ok(None) => report.skipped += 1,
            Err(e) => report
                .errors
                .push(format!("{} ({}): {}", line.track_id, line.license, e)),
        }
    }
    report
}

/// Move every order of a checkout to `target` (and their transactions with
/// them). Orders whose lifecycle forbids the move are left alone.
/// Returns the number of orders changed.
pub fn settle_checkout(
    pool: &DbPool,
    licenses_dir: &Path,
    checkout_ref: &str,
    target: OrderStatus,
    report: &mut PurchaseReport,
) -> usize {
    let mut changed = 0;
    for order in Order::find_by_session(pool, checkout_ref) {
        let current = order.status();
        if current != target {
            if !current.can_transition_to(target) {
                report
                    .warnings
                    .push(format!("Order {} stays {} (cannot become {})", order.id, current, target));
                continue;
            }
            if let Err(e) = Order::update_status(pool, &order.id, target) {
                report.errors.push(format!("Order {}: {}", order.id, e));
                continue;
            }
            for txn in Transaction::list_by_order(pool, &order.id) {
                if let Err(e) = Transaction::update_status(pool, &txn.id, target.as_str()) {
                    report.errors.push(format!("Transaction {}: {}", txn.id, e));
                }
            }
            changed += 1;
        }
        if target == OrderStatus::Completed {
            if let Some(fresh) = Order::find_by_id(pool, &order.id) {
                if let Err(e) = after_paid(pool, licenses_dir, &fresh) {
                    report.warnings.push(format!("License for order {}: {}", order.id, e));
                }
            }
        }
    }
    changed
}
