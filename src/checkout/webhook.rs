//! Stripe webhook reconciliation: turn checkout session events into orders,
//! transactions, license files and discount usage.

use std::path::Path;

use serde::Serialize;

use super::fulfill::{self, Purchase, PurchaseReport};
use crate::db::DbPool;
use crate::models::discount::DiscountCode;
use crate::models::order::OrderStatus;
use crate::models::profile::Profile;
use crate::models::settings::Setting;
use crate::models::webhook_log::WebhookLog;
use crate::payments::stripe::{
    CartLine, CheckoutSession, StripeApi, StripeEvent, EVENT_ASYNC_FAILED, EVENT_ASYNC_SUCCEEDED, EVENT_COMPLETED,
    EVENT_EXPIRED,
};

pub struct Reconciler<'a> {
    pub pool: &'a DbPool,
    pub stripe: &'a dyn StripeApi,
    pub licenses_dir: &'a Path,
}

/// Body returned to Stripe. Always sent with HTTP 200 once the signature
/// checked out, so failures here never cause redelivery storms.
#[derive(Debug, Default, Serialize)]
pub struct WebhookOutcome {
    pub received: bool,
    pub processed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<String>,
}

impl<'a> Reconciler<'a> {
    fn log(&self, event: &StripeEvent, level: &str, message: &str, payload: Option<&str>) {
        match level {
            "error" => log::error!("[webhook] {} {}: {}", event.event_type, event.id, message),
            "warn" => log::warn!("[webhook] {} {}: {}", event.event_type, event.id, message),
            _ => log::info!("[webhook] {} {}: {}", event.event_type, event.id, message),
        }
        WebhookLog::log(self.pool, &event.id, &event.event_type, level, message, payload);
    }

    pub fn handle(&self, event: &StripeEvent) -> WebhookOutcome {
        let mut outcome = WebhookOutcome {
            received: true,
            ..Default::default()
        };

        let relevant = [EVENT_COMPLETED, EVENT_ASYNC_SUCCEEDED, EVENT_ASYNC_FAILED, EVENT_EXPIRED];
        if !relevant.contains(&event.event_type.as_str()) {
            outcome.ignored = Some(event.event_type.clone());
            return outcome;
        }

        let session: CheckoutSession = match serde_json::from_value(event.data.object.clone()) {
            Ok(s) => s,
            Err(e) => {
                let msg = format!("Unreadable checkout session: {}", e);
                self.log(event, "error", &msg, Some(&event.data.object.to_string()));
                outcome.errors.push(msg);
                return outcome;
            }
        };
        let total = match (session.amount_total, session.currency.as_deref()) {
            (Some(minor), Some(cur)) => format!(" ({:.2} {})", minor as f64 / 100.0, cur.to_uppercase()),
            _ => String::new(),
        };
        self.log(event, "info", &format!("session {} received{}", session.id, total), None);

        let mut report = PurchaseReport::default();
        match event.event_type.as_str() {
            EVENT_COMPLETED => self.on_completed(&session, &mut report),
            EVENT_ASYNC_SUCCEEDED => {
                self.on_completed(&session, &mut report);
                fulfill::settle_checkout(
                    self.pool,
                    self.licenses_dir,
                    &session.id,
                    OrderStatus::Completed,
                    &mut report,
                );
            }
            EVENT_ASYNC_FAILED | EVENT_EXPIRED => self.on_failed(&session, &mut report),
            _ => {}
        }

        for w in &report.warnings {
            self.log(event, "warn", w, None);
        }
        for e in &report.errors {
            self.log(event, "error", e, None);
        }
        outcome.processed = report.created.len();
        outcome.skipped = report.skipped;
        outcome.errors = report.errors;
        outcome
    }

    fn on_completed(&self, session: &CheckoutSession, report: &mut PurchaseReport) {
        let (user_id, email) = match self.resolve_user(session, &mut report.warnings) {
            Ok(v) => v,
            Err(e) => {
                report.errors.push(format!("Could not resolve customer: {}", e));
                return;
            }
        };

        let lines = match self.line_items(session) {
            Ok(lines) if !lines.is_empty() => lines,
            Ok(_) => {
                report.errors.push(format!("Session {} has no line items", session.id));
                return;
            }
            Err(e) => {
                report.errors.push(e);
                return;
            }
        };

        let status = if session.is_paid() {
            OrderStatus::Completed
        } else {
            OrderStatus::Pending
        };
        let default_currency = Setting::get_or(self.pool, "commerce_currency", "USD");
        let currency = session.currency.clone().unwrap_or(default_currency).to_uppercase();
        let purchase = Purchase {
            checkout_ref: &session.id,
            user_id: &user_id,
            customer_email: &email,
            currency: &currency,
            status,
            stripe_transaction_id: Some(session.transaction_ref()),
        };
        let r = fulfill::record_purchase(self.pool, self.licenses_dir, &purchase, &lines);
        report.created.extend(r.created);
        report.skipped += r.skipped;
        report.errors.extend(r.errors);
        report.warnings.extend(r.warnings);

        if status == OrderStatus::Completed {
            self.redeem_discount(session, report);
        }
    }

    fn on_failed(&self, session: &CheckoutSession, report: &mut PurchaseReport) {
        fulfill::settle_checkout(self.pool, self.licenses_dir, &session.id, OrderStatus::Failed, report);
        if let Some(code) = discount_code(session) {
            match self.pool.get() {
                Ok(conn) => match DiscountCode::release(&conn, code, &session.id) {
                    Ok(true) => log::info!("[webhook] released discount {} for {}", code, session.id),
                    Ok(false) => {}
                    Err(e) => report.errors.push(format!("Discount release failed: {}", e)),
                },
                Err(e) => report.errors.push(e.to_string()),
            }
        }
    }

    fn redeem_discount(&self, session: &CheckoutSession, report: &mut PurchaseReport) {
        let Some(code) = discount_code(session) else {
            return;
        };
        match self.pool.get() {
            Ok(conn) => {
                if let Err(e) = DiscountCode::redeem(&conn, code, &session.id) {
                    report.errors.push(format!("Discount redeem failed: {}", e));
                }
            }
            Err(e) => report.errors.push(e.to_string()),
        }
    }

    /// Metadata user id if it names a profile, else the profile for the
    /// customer email, else a freshly created guest profile.
    fn resolve_user(&self, session: &CheckoutSession, warnings: &mut Vec<String>) -> Result<(String, String), String> {
        let email = session.email().map(|e| e.to_lowercase());

        if let Some(raw) = session.metadata.get("user_id").filter(|v| !v.is_empty()) {
            match uuid::Uuid::parse_str(raw) {
                Ok(id) => {
                    if let Some(p) = Profile::find_by_id(self.pool, &id.to_string()) {
                        let email = email.unwrap_or_else(|| p.email.clone());
                        return Ok((p.id, email));
                    }
                    warnings.push(format!("user_id {} has no profile", raw));
                }
                Err(_) => warnings.push(format!("user_id '{}' is not a valid UUID", raw)),
            }
        }

        if let Some(email) = email {
            let name = session.customer_name().unwrap_or_default();
            let p = Profile::ensure_for_email(self.pool, &email, name)?;
            return Ok((p.id, email));
        }

        let id = uuid::Uuid::new_v4().to_string();
        warnings.push(format!("session {} has no customer identity, created guest {}", session.id, id));
        let email = format!("guest+{}@checkout.invalid", &id[..8]);
        Profile::create_with_id(self.pool, &id, &email, "Guest", None, "customer")?;
        Ok((id, email))
    }

    /// The cart from session metadata, or Stripe's line items if the
    /// metadata is missing or unreadable.
    fn line_items(&self, session: &CheckoutSession) -> Result<Vec<CartLine>, String> {
        if let Some(raw) = session.metadata.get("cart") {
            match serde_json::from_str::<Vec<CartLine>>(raw) {
                Ok(lines) if !lines.is_empty() => return Ok(lines),
                _ => log::warn!("[webhook] session {} has unreadable cart metadata", session.id),
            }
        }
        let key = Setting::get_or(self.pool, "stripe_secret_key", "");
        if key.is_empty() {
            return Err("No cart metadata and Stripe secret key not configured".to_string());
        }
        self.stripe
            .list_line_items(&key, &session.id)
            .map_err(|e| format!("Line item lookup failed: {}", e))
    }
}

fn discount_code(session: &CheckoutSession) -> Option<&str> {
    session
        .metadata
        .get("discount_code")
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

/// Parse a raw webhook body into an event.
pub fn parse_event(body: &[u8]) -> Result<StripeEvent, String> {
    serde_json::from_slice(body).map_err(|e| format!("Invalid event payload: {}", e))
}
