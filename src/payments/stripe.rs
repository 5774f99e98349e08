//! Stripe Checkout: webhook signature checks, event payloads and the two
//! API calls the store needs (create a session, list its line items).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::security::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.stripe.com/v1";

/// Accepted clock skew for timestamps from the future.
const FUTURE_SKEW_SECS: i64 = 60;

pub const EVENT_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ASYNC_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const EVENT_ASYNC_FAILED: &str = "checkout.session.async_payment_failed";
pub const EVENT_EXPIRED: &str = "checkout.session.expired";

// ── Signature verification ──

#[derive(Debug, PartialEq)]
pub enum SignatureError {
    NotConfigured,
    Missing,
    Malformed,
    TooOld,
    FromFuture,
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureError::NotConfigured => "Webhook secret not configured",
            SignatureError::Missing => "Missing Stripe-Signature header",
            SignatureError::Malformed => "Malformed Stripe-Signature header",
            SignatureError::TooOld => "Webhook timestamp outside tolerance",
            SignatureError::FromFuture => "Webhook timestamp is in the future",
            SignatureError::Mismatch => "Webhook signature mismatch",
        })
    }
}

fn compute_signature(secret: &str, timestamp: &str, payload: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NotConfigured)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against
/// the raw request body. Any one matching `v1` entry is enough.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: Option<&str>,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NotConfigured);
    }
    let header = header.map(str::trim).filter(|h| !h.is_empty()).ok_or(SignatureError::Missing)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(s) = part.strip_prefix("v1=") {
            candidates.push(s);
        }
    }
    let ts_str = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let ts: i64 = ts_str.parse().map_err(|_| SignatureError::Malformed)?;

    let age = now_unix - ts;
    if age > tolerance_secs {
        return Err(SignatureError::TooOld);
    }
    if age < -FUTURE_SKEW_SECS {
        return Err(SignatureError::FromFuture);
    }

    let expected = compute_signature(secret, ts_str, payload)?;
    if candidates
        .iter()
        .any(|c| constant_time_eq(c.as_bytes(), expected.as_bytes()))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a header the way Stripe does. Used to sign test payloads.
#[cfg(test)]
pub fn signature_header(secret: &str, payload: &[u8], timestamp: i64) -> String {
    let ts = timestamp.to_string();
    let sig = compute_signature(secret, &ts, payload).unwrap_or_default();
    format!("t={},v1={}", ts, sig)
}

// ── Event payloads ──

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_status: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_intent: Option<String>,
}

impl CheckoutSession {
    /// `payment_status` is "paid" once funds are captured; delayed methods
    /// complete the session with "unpaid" and follow up with an async event.
    pub fn is_paid(&self) -> bool {
        matches!(self.payment_status.as_deref(), Some("paid") | Some("no_payment_required"))
    }

    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
            .or(self.metadata.get("customer_email").map(String::as_str))
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }

    pub fn customer_name(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Stripe transaction id: the payment intent when present, else the session.
    pub fn transaction_ref(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }
}

// ── API ──

/// One cart line as carried in session metadata and product metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CartLine {
    #[serde(rename = "t")]
    pub track_id: String,
    #[serde(rename = "l")]
    pub license: String,
    #[serde(rename = "n", default)]
    pub name: String,
    /// Unit price charged, after discount, in major units.
    #[serde(rename = "p")]
    pub amount: f64,
    #[serde(rename = "d", default)]
    pub discount: f64,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub currency: String,
    pub lines: Vec<CartLine>,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

/// The Stripe calls the store makes. Implemented over HTTP in production and
/// by in-memory fakes in tests.
pub trait StripeApi: Send + Sync {
    fn create_checkout_session(&self, secret_key: &str, req: &CheckoutRequest) -> Result<CreatedSession, String>;

    fn list_line_items(&self, secret_key: &str, session_id: &str) -> Result<Vec<CartLine>, String>;
}

pub struct HttpStripe {
    timeout: Duration,
}

impl HttpStripe {
    pub fn new(timeout: Duration) -> Self {
        HttpStripe { timeout }
    }
}

/// Minor units (cents) for a major-unit amount.
pub fn to_minor(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn api_error(body: &Value, fallback: &str) -> String {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or(fallback)
        .to_string()
}

/// Form fields for a Checkout Session, one price_data entry per line.
pub fn checkout_form(req: &CheckoutRequest) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = vec![
        ("mode".into(), "payment".into()),
        ("success_url".into(), req.success_url.clone()),
        ("cancel_url".into(), req.cancel_url.clone()),
    ];
    if let Some(email) = &req.customer_email {
        form.push(("customer_email".into(), email.clone()));
    }
    for (i, line) in req.lines.iter().enumerate() {
        let p = format!("line_items[{}]", i);
        form.push((format!("{}[quantity]", p), "1".into()));
        form.push((format!("{}[price_data][currency]", p), req.currency.to_lowercase()));
        form.push((format!("{}[price_data][unit_amount]", p), to_minor(line.amount).to_string()));
        form.push((format!("{}[price_data][product_data][name]", p), line.name.clone()));
        form.push((format!("{}[price_data][product_data][metadata][track_id]", p), line.track_id.clone()));
        form.push((format!("{}[price_data][product_data][metadata][license]", p), line.license.clone()));
        form.push((
            format!("{}[price_data][product_data][metadata][discount]", p),
            format!("{:.2}", line.discount),
        ));
    }
    for (k, v) in &req.metadata {
        form.push((format!("metadata[{}]", k), v.clone()));
    }
    form
}

/// Map one entry of `GET /checkout/sessions/:id/line_items?expand[]=data.price.product`.
pub fn parse_line_item(item: &Value) -> Option<CartLine> {
    let product = item.get("price")?.get("product")?;
    let meta = product.get("metadata")?;
    let track_id = meta.get("track_id")?.as_str()?.to_string();
    let license = meta.get("license")?.as_str()?.to_string();
    let discount = meta
        .get("discount")
        .and_then(|d| d.as_str())
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);
    let qty = item.get("quantity").and_then(|q| q.as_i64()).unwrap_or(1).max(1);
    let total = item.get("amount_total").and_then(|a| a.as_i64()).unwrap_or(0);
    let name = item
        .get("description")
        .and_then(|d| d.as_str())
        .or_else(|| product.get("name").and_then(|n| n.as_str()))
        .unwrap_or_default()
        .to_string();
    Some(CartLine {
        track_id,
        license,
        name,
        amount: (total / qty) as f64 / 100.0,
        discount,
    })
}

impl StripeApi for HttpStripe {
    fn create_checkout_session(&self, secret_key: &str, req: &CheckoutRequest) -> Result<CreatedSession, String> {
        let client = super::http_client(self.timeout)?;
        let resp = client
            .post(format!("{}/checkout/sessions", API_BASE))
            .basic_auth(secret_key, None::<&str>)
            .form(&checkout_form(req))
            .send()
            .map_err(|e| format!("Stripe request failed: {}", e))?;
        let body: Value = resp.json().map_err(|e| format!("Invalid Stripe response: {}", e))?;
        match (body.get("id").and_then(|v| v.as_str()), body.get("url").and_then(|v| v.as_str())) {
            (Some(id), Some(url)) => Ok(CreatedSession {
                id: id.to_string(),
                url: url.to_string(),
            }),
            _ => Err(api_error(&body, "Stripe API error")),
        }
    }

    fn list_line_items(&self, secret_key: &str, session_id: &str) -> Result<Vec<CartLine>, String> {
        let client = super::http_client(self.timeout)?;
        let resp = client
            .get(format!("{}/checkout/sessions/{}/line_items", API_BASE, session_id))
            .basic_auth(secret_key, None::<&str>)
            .query(&[("limit", "100"), ("expand[]", "data.price.product")])
            .send()
            .map_err(|e| format!("Stripe request failed: {}", e))?;
        let body: Value = resp.json().map_err(|e| format!("Invalid Stripe response: {}", e))?;
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| api_error(&body, "Stripe line items missing"))?;
        Ok(data.iter().filter_map(parse_line_item).collect())
    }
}
