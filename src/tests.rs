#![cfg(test)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::{json, Value};

use crate::checkout::crypto::{self as crypto_flow, CryptoBackend, StartPayment};
use crate::checkout::webhook::{parse_event, Reconciler};
use crate::checkout::{allocate_discount, quote, CartItem};
use crate::db::{run_migrations, seed_defaults, DbPool};
use crate::models::discount::{DiscountCode, DiscountForm};
use crate::models::order::{NewOrder, Order, OrderStatus};
use crate::models::profile::{Profile, Session};
use crate::models::scheduler::{self as store, SchedulerError, SchedulerSource, SchedulerState};
use crate::models::settings::Setting;
use crate::models::track::{Track, TrackForm};
use crate::models::transaction::Transaction;
use crate::models::webhook_log::WebhookLog;
use crate::payments::crypto::{
    claim_signature, Coin, PaymentState, PriceCache, PriceSource, Transfer, TransferSource, COINS,
};
use crate::payments::stripe::{
    self, CartLine, CheckoutRequest, CreatedSession, SignatureError, StripeApi, StripeEvent,
};
use crate::rate_limit::{self, RateLimiter};
use crate::scheduler::{self, Downloader};

/// Atomic counter for unique shared-cache DB names so parallel tests don't collide.
static TEST_DB_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Create a fresh in-memory SQLite pool with all migrations + seed defaults applied.
/// Uses a named shared-cache in-memory DB so multiple connections see the same data
/// (session lookups and fulfilment open a second connection while one is held).
pub(crate) fn test_pool() -> DbPool {
    let id = TEST_DB_COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let uri = format!("file:testdb_{}?mode=memory&cache=shared", id);
    let manager = SqliteConnectionManager::file(uri);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .expect("Failed to create test pool");
    {
        let conn = pool.get().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    }
    run_migrations(&pool).expect("Failed to run migrations");
    seed_defaults(&pool).expect("Failed to seed defaults");
    pool
}

/// Scratch directory under the system temp dir, unique per call.
fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("beatstore-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn fast_hash(password: &str) -> String {
    bcrypt::hash(password, 4).unwrap()
}

fn published_track(pool: &DbPool, title: &str, price: f64) -> String {
    Track::create(
        pool,
        &TrackForm {
            title: title.to_string(),
            artist: Some("Prod. Nova".to_string()),
            genre: Some("trap".to_string()),
            base_price: Some(price),
            status: Some("published".to_string()),
            ..Default::default()
        },
    )
    .unwrap()
}

fn discount(pool: &DbPool, code: &str, kind: &str, amount: f64) -> String {
    DiscountCode::create(
        pool,
        &DiscountForm {
            code: code.to_string(),
            amount,
            kind: kind.to_string(),
            expires_at: None,
            active: Some(true),
            usage_limit: None,
        },
    )
    .unwrap()
}

fn item(track_id: &str, license: &str) -> CartItem {
    CartItem {
        track_id: track_id.to_string(),
        license: license.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════
// Fakes
// ═══════════════════════════════════════════════════════════

/// Records line item lookups and answers with a fixed cart.
#[derive(Default)]
struct FakeStripe {
    lines: Vec<CartLine>,
    lookups: AtomicUsize,
}

impl StripeApi for FakeStripe {
    fn create_checkout_session(&self, _secret_key: &str, req: &CheckoutRequest) -> Result<CreatedSession, String> {
        Ok(CreatedSession {
            id: format!("cs_test_{}", req.lines.len()),
            url: "https://checkout.stripe.com/c/pay/cs_test".to_string(),
        })
    }

    fn list_line_items(&self, _secret_key: &str, _session_id: &str) -> Result<Vec<CartLine>, String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.lines.clone())
    }
}

struct FixedPrices {
    usd: f64,
    calls: Arc<AtomicUsize>,
}

impl PriceSource for FixedPrices {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn fetch(&self, coins: &[Coin]) -> Result<std::collections::HashMap<String, f64>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(coins.iter().map(|c| (c.symbol.to_string(), self.usd)).collect())
    }
}

struct BrokenPrices;

impl PriceSource for BrokenPrices {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn fetch(&self, _coins: &[Coin]) -> Result<std::collections::HashMap<String, f64>, String> {
        Err("HTTP 503".to_string())
    }
}

#[derive(Clone, Default)]
struct SharedTransfers(Arc<Mutex<Vec<Transfer>>>);

impl SharedTransfers {
    fn push(&self, t: Transfer) {
        self.0.lock().unwrap().push(t);
    }
}

impl TransferSource for SharedTransfers {
    fn recent_transfers(&self, wallet: &str) -> Result<Vec<Transfer>, String> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.to == wallet || t.from == wallet)
            .cloned()
            .collect())
    }
}

/// Every coin priced at `usd`, transfers from a shared list.
struct FakeBackend {
    usd: f64,
    price_calls: Arc<AtomicUsize>,
    transfers: SharedTransfers,
}

impl FakeBackend {
    fn new(usd: f64) -> Self {
        FakeBackend {
            usd,
            price_calls: Arc::new(AtomicUsize::new(0)),
            transfers: SharedTransfers::default(),
        }
    }
}

impl CryptoBackend for FakeBackend {
    fn price_sources(&self, _pool: &DbPool) -> Vec<Box<dyn PriceSource>> {
        vec![Box::new(FixedPrices {
            usd: self.usd,
            calls: Arc::clone(&self.price_calls),
        })]
    }

    fn transfer_source(&self, _pool: &DbPool) -> Box<dyn TransferSource> {
        Box::new(self.transfers.clone())
    }
}

/// Hands back the same manifests for every source and counts calls.
#[derive(Default)]
struct FakeDownloader {
    manifests: Vec<TrackForm>,
    fail_for: Option<String>,
    calls: AtomicUsize,
}

impl Downloader for FakeDownloader {
    fn fetch(&self, source: &SchedulerSource, _dest: &std::path::Path) -> Result<Vec<TrackForm>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.as_deref() == Some(source.url.as_str()) {
            return Err("yt-dlp exited with status 1".to_string());
        }
        Ok(self.manifests.clone())
    }
}

fn manifest(video_id: &str, title: &str) -> TrackForm {
    TrackForm {
        title: title.to_string(),
        artist: Some("Prod. Nova".to_string()),
        status: Some("draft".to_string()),
        source: Some("youtube".to_string()),
        source_url: Some(format!("https://www.youtube.com/watch?v={}", video_id)),
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════
// Settings
// ═══════════════════════════════════════════════════════════

#[test]
fn test_settings_defaults_seeded() {
    let pool = test_pool();
    assert_eq!(Setting::get_or(&pool, "commerce_currency", ""), "USD");
    assert_eq!(Setting::get_i64(&pool, "scheduler_interval_hours"), 24);
    assert!(Setting::get_bool(&pool, "crypto_enabled"));
}

#[test]
fn test_settings_set_and_overwrite() {
    let pool = test_pool();
    Setting::set(&pool, "site_name", "Night Beats").unwrap();
    assert_eq!(Setting::get(&pool, "site_name").as_deref(), Some("Night Beats"));
    Setting::set(&pool, "site_name", "Day Beats").unwrap();
    assert_eq!(Setting::get_or(&pool, "site_name", ""), "Day Beats");
}

#[test]
fn test_seed_does_not_clobber_existing_values() {
    let pool = test_pool();
    Setting::set(&pool, "crypto_payment_window_minutes", "30").unwrap();
    seed_defaults(&pool).unwrap();
    assert_eq!(Setting::get_i64(&pool, "crypto_payment_window_minutes"), 30);
}

// ═══════════════════════════════════════════════════════════
// Profiles & sessions
// ═══════════════════════════════════════════════════════════

#[test]
fn test_profile_email_is_normalized_and_unique() {
    let pool = test_pool();
    let id = Profile::create(&pool, "  Buyer@Example.COM ", "Buyer", None, "customer").unwrap();
    let p = Profile::find_by_email(&pool, "buyer@example.com").unwrap();
    assert_eq!(p.id, id);
    assert!(Profile::create(&pool, "buyer@example.com", "Again", None, "customer").is_err());
}

#[test]
fn test_guest_profile_can_be_claimed_once() {
    let pool = test_pool();
    let guest = Profile::ensure_for_email(&pool, "guest@example.com", "").unwrap();
    assert!(guest.is_guest());

    Profile::claim(&pool, &guest.id, "Guest Buyer", &fast_hash("hunter22")).unwrap();
    let claimed = Profile::find_by_id(&pool, &guest.id).unwrap();
    assert!(!claimed.is_guest());
    assert_eq!(claimed.full_name, "Guest Buyer");

    assert!(Profile::claim(&pool, &guest.id, "", &fast_hash("other")).is_err());
}

#[test]
fn test_session_lifecycle() {
    let pool = test_pool();
    let id = Profile::create(&pool, "s@example.com", "S", Some(&fast_hash("pw123456")), "customer").unwrap();

    let live = Session::create(&pool, &id, None, Utc::now().naive_utc() + ChronoDuration::hours(1)).unwrap();
    let stale = Session::create(&pool, &id, None, Utc::now().naive_utc() - ChronoDuration::hours(1)).unwrap();
    assert_eq!(Session::get_profile(&pool, &live).map(|p| p.id), Some(id.clone()));
    assert!(Session::get_profile(&pool, &stale).is_none());

    assert_eq!(Session::cleanup_expired(&pool).unwrap(), 1);
    Session::delete(&pool, &live).unwrap();
    assert!(Session::get_profile(&pool, &live).is_none());
}

#[test]
fn test_repair_missing_creates_or_repoints() {
    let pool = test_pool();
    let track = published_track(&pool, "Phantom", 30.0);
    let orphan_id = uuid::Uuid::new_v4().to_string();
    let drifted_id = uuid::Uuid::new_v4().to_string();
    let existing = Profile::create(&pool, "known@example.com", "Known", None, "customer").unwrap();

    for (user_id, email) in [(&orphan_id, "lost@example.com"), (&drifted_id, "known@example.com")] {
        Order::insert(
            &pool.get().unwrap(),
            &NewOrder {
                user_id: user_id.clone(),
                track_id: track.clone(),
                track_name: "Phantom".to_string(),
                license: "non_exclusive".to_string(),
                total_amount: 30.0,
                discount: 0.0,
                currency: "USD".to_string(),
                status: OrderStatus::Completed,
                stripe_session_id: Some("cs_old".to_string()),
                customer_email: email.to_string(),
            },
        )
        .unwrap();
    }

    assert_eq!(Profile::repair_missing(&pool).unwrap(), 1);
    assert_eq!(Profile::find_by_id(&pool, &orphan_id).unwrap().email, "lost@example.com");
    assert_eq!(Order::list_by_user(&pool, &existing).len(), 1);
    assert!(Order::list_by_user(&pool, &drifted_id).is_empty());

    assert_eq!(Profile::repair_missing(&pool).unwrap(), 0);
}

fn orphan_order(pool: &DbPool, user_id: &str, email: &str) {
    Order::insert(
        &pool.get().unwrap(),
        &NewOrder {
            user_id: user_id.to_string(),
            track_id: uuid::Uuid::new_v4().to_string(),
            track_name: "Phantom".to_string(),
            license: "non_exclusive".to_string(),
            total_amount: 30.0,
            discount: 0.0,
            currency: "USD".to_string(),
            status: OrderStatus::Completed,
            stripe_session_id: Some("cs_old".to_string()),
            customer_email: email.to_string(),
        },
    )
    .unwrap();
}

#[test]
fn test_repair_missing_skips_bad_rows_and_continues() {
    let pool = test_pool();
    orphan_order(&pool, "aaaa-broken", "not-an-email");
    orphan_order(&pool, "éééééééééé-legacy", "");
    orphan_order(&pool, "zzzz-good", "good@example.com");

    assert_eq!(Profile::repair_missing(&pool).unwrap(), 2);
    let legacy = Profile::find_by_id(&pool, "éééééééééé-legacy").unwrap();
    assert_eq!(legacy.email, "unknown+éééééééé@invalid.local");
    assert!(Profile::find_by_id(&pool, "zzzz-good").is_some());
    assert!(Profile::find_by_id(&pool, "aaaa-broken").is_none());
}

// ═══════════════════════════════════════════════════════════
// Cart quotes & discounts
// ═══════════════════════════════════════════════════════════

#[test]
fn test_quote_prices_licenses_and_splits_discount() {
    let pool = test_pool();
    let a = published_track(&pool, "Phantom", 30.0);
    let b = published_track(&pool, "Midnight", 20.0);
    discount(&pool, "save10", "percentage", 10.0);

    let now = Utc::now().naive_utc();
    let q = quote(&pool, &[item(&a, "premium"), item(&b, "non_exclusive")], Some("SAVE10"), now).unwrap();
    assert_eq!(q.subtotal, 80.0);
    assert_eq!(q.discount, 8.0);
    assert_eq!(q.total, 72.0);
    assert_eq!(q.discount_code.as_deref(), Some("SAVE10"));

    let line_discounts: f64 = q.lines.iter().map(|l| l.discount).sum();
    assert!((line_discounts - 8.0).abs() < 1e-9);
    let line_totals: f64 = q.lines.iter().map(|l| l.amount).sum();
    assert!((line_totals - 72.0).abs() < 1e-9);
}

#[test]
fn test_quote_rejects_duplicates_drafts_and_bad_codes() {
    let pool = test_pool();
    let now = Utc::now().naive_utc();
    let a = published_track(&pool, "Phantom", 30.0);
    let draft = Track::create(
        &pool,
        &TrackForm {
            title: "Unreleased".to_string(),
            base_price: Some(30.0),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(quote(&pool, &[], None, now).is_err());
    assert!(quote(&pool, &[item(&a, "premium"), item(&a, "Premium")], None, now).is_err());
    assert!(quote(&pool, &[item(&draft, "premium")], None, now).is_err());
    assert!(quote(&pool, &[item(&a, "platinum")], None, now).is_err());
    assert!(quote(&pool, &[item(&a, "premium")], Some("NOPE"), now).is_err());
    // Same track under two licenses is fine.
    assert!(quote(&pool, &[item(&a, "premium"), item(&a, "unlimited")], None, now).is_ok());
}

#[test]
fn test_allocate_discount_never_exceeds_lines() {
    let shares = allocate_discount(&[10.0, 10.0, 10.0], 10.0);
    assert!((shares.iter().sum::<f64>() - 10.0).abs() < 1e-9);
    assert!(shares.iter().all(|s| *s <= 10.0));

    let capped = allocate_discount(&[5.0, 5.0], 50.0);
    assert_eq!(capped, vec![5.0, 5.0]);
    assert_eq!(allocate_discount(&[], 5.0), Vec::<f64>::new());
}

#[test]
fn test_discount_redeem_and_release_once_per_checkout() {
    let pool = test_pool();
    discount(&pool, "SPRING", "fixed", 5.0);
    let conn = pool.get().unwrap();

    assert!(DiscountCode::redeem(&conn, "spring", "cs_1").unwrap());
    assert!(!DiscountCode::redeem(&conn, "SPRING", "cs_1").unwrap());
    assert!(DiscountCode::redeem(&conn, "SPRING", "cs_2").unwrap());
    drop(conn);
    assert_eq!(DiscountCode::find_by_code(&pool, "SPRING").unwrap().used_count, 2);

    let conn = pool.get().unwrap();
    assert!(DiscountCode::release(&conn, "SPRING", "cs_1").unwrap());
    assert!(!DiscountCode::release(&conn, "SPRING", "cs_1").unwrap());
    assert!(!DiscountCode::release(&conn, "SPRING", "cs_never").unwrap());
    drop(conn);
    assert_eq!(DiscountCode::find_by_code(&pool, "SPRING").unwrap().used_count, 1);
}

#[test]
fn test_discount_usage_limit_blocks_validation() {
    let pool = test_pool();
    DiscountCode::create(
        &pool,
        &DiscountForm {
            code: "ONCE".to_string(),
            amount: 5.0,
            kind: "fixed".to_string(),
            expires_at: None,
            active: Some(true),
            usage_limit: Some(1),
        },
    )
    .unwrap();
    let now = Utc::now().naive_utc();
    assert!(DiscountCode::validate(&pool, "ONCE", 50.0, now).is_ok());

    let conn = pool.get().unwrap();
    DiscountCode::redeem(&conn, "ONCE", "cs_1").unwrap();
    drop(conn);
    assert!(DiscountCode::validate(&pool, "ONCE", 50.0, now).is_err());
}

// ═══════════════════════════════════════════════════════════
// Orders
// ═══════════════════════════════════════════════════════════

#[test]
fn test_order_status_lifecycle() {
    use OrderStatus::*;
    assert!(Pending.can_transition_to(Completed));
    assert!(Pending.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Completed));
    assert!(!Completed.can_transition_to(Pending));
    assert!(!Completed.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Pending));
    for s in OrderStatus::ALL {
        assert!(s.can_transition_to(s));
        assert_eq!(s.as_str().parse::<OrderStatus>().unwrap(), s);
    }
    assert!("refunded".parse::<OrderStatus>().is_err());
}

// ═══════════════════════════════════════════════════════════
// Stripe webhooks
// ═══════════════════════════════════════════════════════════

fn cart_json(lines: &[CartLine]) -> String {
    serde_json::to_string(lines).unwrap()
}

fn line(track_id: &str, license: &str, amount: f64) -> CartLine {
    CartLine {
        track_id: track_id.to_string(),
        license: license.to_string(),
        name: String::new(),
        amount,
        discount: 0.0,
    }
}

fn session_event(event_type: &str, session_id: &str, payment_status: &str, email: Option<&str>, metadata: Value) -> StripeEvent {
    let body = json!({
        "id": format!("evt_{}_{}", event_type.len(), session_id),
        "type": event_type,
        "data": { "object": {
            "id": session_id,
            "payment_status": payment_status,
            "customer_details": { "email": email },
            "metadata": metadata,
            "currency": "usd",
            "payment_intent": format!("pi_{}", session_id),
        }},
    });
    parse_event(body.to_string().as_bytes()).unwrap()
}

#[test]
fn test_webhook_signature_verification() {
    let secret = "whsec_test";
    let body = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{}}}"#;
    let now = Utc::now().timestamp();
    let header = stripe::signature_header(secret, body, now);

    assert!(stripe::verify_signature(secret, body, Some(&header), 300, now).is_ok());
    assert_eq!(
        stripe::verify_signature(secret, b"{\"tampered\":true}", Some(&header), 300, now),
        Err(SignatureError::Mismatch)
    );
    assert_eq!(
        stripe::verify_signature(secret, body, Some(&header), 300, now + 301),
        Err(SignatureError::TooOld)
    );
    assert_eq!(
        stripe::verify_signature(secret, body, None, 300, now),
        Err(SignatureError::Missing)
    );
    assert_eq!(
        stripe::verify_signature("", body, Some(&header), 300, now),
        Err(SignatureError::NotConfigured)
    );
}

#[test]
fn test_webhook_completed_creates_one_order_per_line() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);
    let b = published_track(&pool, "Midnight", 20.0);
    let buyer = Profile::create(&pool, "buyer@example.com", "Buyer", None, "customer").unwrap();

    let event = session_event(
        stripe::EVENT_COMPLETED,
        "cs_paid",
        "paid",
        Some("buyer@example.com"),
        json!({
            "user_id": buyer,
            "cart": cart_json(&[line(&a, "premium", 60.0), line(&b, "non_exclusive", 20.0)]),
        }),
    );
    let reconciler = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir };

    let outcome = reconciler.handle(&event);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.processed, 2);

    let orders = Order::find_by_session(&pool, "cs_paid");
    assert_eq!(orders.len(), 2);
    for order in &orders {
        assert_eq!(order.user_id, buyer);
        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(order.currency, "USD");
        let txns = Transaction::list_by_order(&pool, &order.id);
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].stripe_transaction_id.as_deref(), Some("pi_cs_paid"));
        assert_eq!(txns[0].status, "completed");
        let file = order.license_file.as_deref().expect("license written");
        assert!(std::path::Path::new(file).exists());
    }
    assert_eq!(stripe.lookups.load(Ordering::SeqCst), 0);

    // Redelivery changes nothing.
    let again = reconciler.handle(&event);
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(Order::find_by_session(&pool, "cs_paid").len(), 2);
    for order in Order::find_by_session(&pool, "cs_paid") {
        assert_eq!(Transaction::list_by_order(&pool, &order.id).len(), 1);
    }
    assert!(WebhookLog::count(&pool) > 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_falls_back_to_line_items_and_email() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let a = published_track(&pool, "Phantom", 30.0);
    let stripe = FakeStripe {
        lines: vec![line(&a, "non_exclusive", 30.0)],
        ..Default::default()
    };
    Setting::set(&pool, "stripe_secret_key", "sk_test_123").unwrap();
    let known = Profile::create(&pool, "known@example.com", "Known", None, "customer").unwrap();

    let event = session_event(
        stripe::EVENT_COMPLETED,
        "cs_lookup",
        "paid",
        Some("Known@Example.com"),
        json!({ "user_id": "not-a-uuid" }),
    );
    let outcome = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir }.handle(&event);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(stripe.lookups.load(Ordering::SeqCst), 1);

    let orders = Order::find_by_session(&pool, "cs_lookup");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].user_id, known);
    assert_eq!(orders[0].customer_email, "known@example.com");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_creates_guest_for_unknown_customer() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);

    let event = session_event(
        stripe::EVENT_COMPLETED,
        "cs_guest",
        "paid",
        None,
        json!({ "cart": cart_json(&[line(&a, "non_exclusive", 30.0)]) }),
    );
    let outcome = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir }.handle(&event);
    assert_eq!(outcome.processed, 1);

    let order = &Order::find_by_session(&pool, "cs_guest")[0];
    let guest = Profile::find_by_id(&pool, &order.user_id).unwrap();
    assert!(guest.email.ends_with("@checkout.invalid"));
    assert!(guest.is_guest());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_async_success_completes_and_redeems_once() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);
    discount(&pool, "FIVE", "fixed", 5.0);
    let metadata = json!({
        "discount_code": "FIVE",
        "cart": cart_json(&[line(&a, "non_exclusive", 25.0)]),
    });
    let reconciler = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir };

    reconciler.handle(&session_event(stripe::EVENT_COMPLETED, "cs_async", "unpaid", Some("a@example.com"), metadata.clone()));
    let order = &Order::find_by_session(&pool, "cs_async")[0];
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(DiscountCode::find_by_code(&pool, "FIVE").unwrap().used_count, 0);

    let succeeded = session_event(stripe::EVENT_ASYNC_SUCCEEDED, "cs_async", "paid", Some("a@example.com"), metadata);
    let outcome = reconciler.handle(&succeeded);
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    reconciler.handle(&succeeded);

    let orders = Order::find_by_session(&pool, "cs_async");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status(), OrderStatus::Completed);
    assert!(orders[0].license_file.is_some());
    for txn in Transaction::list_by_order(&pool, &orders[0].id) {
        assert_eq!(txn.status, "completed");
    }
    assert_eq!(DiscountCode::find_by_code(&pool, "FIVE").unwrap().used_count, 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_failure_and_expiry_fail_orders() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);
    let metadata = json!({ "cart": cart_json(&[line(&a, "non_exclusive", 30.0)]) });
    let reconciler = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir };

    reconciler.handle(&session_event(stripe::EVENT_COMPLETED, "cs_fail", "unpaid", Some("f@example.com"), metadata.clone()));
    reconciler.handle(&session_event(stripe::EVENT_ASYNC_FAILED, "cs_fail", "unpaid", Some("f@example.com"), metadata));
    let order = &Order::find_by_session(&pool, "cs_fail")[0];
    assert_eq!(order.status(), OrderStatus::Failed);
    assert!(order.license_file.is_none());

    // An expired session never created orders; nothing to do, nothing breaks.
    let outcome = reconciler.handle(&session_event(stripe::EVENT_EXPIRED, "cs_gone", "unpaid", None, json!({})));
    assert!(outcome.errors.is_empty());
    assert!(Order::find_by_session(&pool, "cs_gone").is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_completed_cannot_be_failed_later() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);
    let metadata = json!({ "cart": cart_json(&[line(&a, "non_exclusive", 30.0)]) });
    let reconciler = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir };

    reconciler.handle(&session_event(stripe::EVENT_COMPLETED, "cs_done", "paid", Some("d@example.com"), metadata.clone()));
    reconciler.handle(&session_event(stripe::EVENT_ASYNC_FAILED, "cs_done", "unpaid", Some("d@example.com"), metadata));
    assert_eq!(Order::find_by_session(&pool, "cs_done")[0].status(), OrderStatus::Completed);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_exclusive_sale_retires_track() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let a = published_track(&pool, "Phantom", 30.0);

    let event = session_event(
        stripe::EVENT_COMPLETED,
        "cs_excl",
        "paid",
        Some("x@example.com"),
        json!({ "cart": cart_json(&[line(&a, "exclusive", 300.0)]) }),
    );
    Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir }.handle(&event);

    assert_eq!(Track::find_by_id(&pool, &a).unwrap().status, "sold");
    assert!(quote(&pool, &[item(&a, "premium")], None, Utc::now().naive_utc()).is_err());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_replaces_invalid_track_ids() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();

    let event = session_event(
        stripe::EVENT_COMPLETED,
        "cs_legacy",
        "paid",
        Some("l@example.com"),
        json!({ "cart": cart_json(&[line("42", "non_exclusive", 30.0)]) }),
    );
    let outcome = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir }.handle(&event);
    assert_eq!(outcome.processed, 1);
    let order = &Order::find_by_session(&pool, "cs_legacy")[0];
    assert!(uuid::Uuid::parse_str(&order.track_id).is_ok());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_redelivery_with_invalid_track_id_keeps_one_order() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let metadata = json!({ "cart": cart_json(&[line("42", "non_exclusive", 30.0)]) });
    let reconciler = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir };

    let event = session_event(stripe::EVENT_COMPLETED, "cs_replay", "paid", Some("r@example.com"), metadata.clone());
    assert_eq!(reconciler.handle(&event).processed, 1);
    let again = reconciler.handle(&event);
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 1);
    let orders = Order::find_by_session(&pool, "cs_replay");
    assert_eq!(orders.len(), 1);
    assert_eq!(Transaction::list_by_order(&pool, &orders[0].id).len(), 1);

    // Unpaid completion followed by async success lands on the same order.
    reconciler.handle(&session_event(stripe::EVENT_COMPLETED, "cs_replay_async", "unpaid", Some("r@example.com"), metadata.clone()));
    let pending = Order::find_by_session(&pool, "cs_replay_async");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status(), OrderStatus::Pending);

    let outcome = reconciler.handle(&session_event(stripe::EVENT_ASYNC_SUCCEEDED, "cs_replay_async", "paid", Some("r@example.com"), metadata));
    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    let orders = Order::find_by_session(&pool, "cs_replay_async");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, pending[0].id);
    assert_eq!(orders[0].status(), OrderStatus::Completed);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_webhook_ignores_unrelated_events() {
    let pool = test_pool();
    let dir = temp_dir("licenses");
    let stripe = FakeStripe::default();
    let event = parse_event(br#"{"id":"evt_x","type":"invoice.paid","data":{"object":{}}}"#).unwrap();
    let outcome = Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir }.handle(&event);
    assert_eq!(outcome.ignored.as_deref(), Some("invoice.paid"));
    assert_eq!(Order::count(&pool), 0);
    assert!(parse_event(b"not json").is_err());

    let _ = std::fs::remove_dir_all(&dir);
}

// ═══════════════════════════════════════════════════════════
// Crypto payments
// ═══════════════════════════════════════════════════════════

const MERCHANT: &str = "MerchantWa11etAddre55xxxxxxxxxxxxxxxxxxxx";
const BUYER: &str = "BuyerWa11etAddre55xxxxxxxxxxxxxxxxxxxxxxx";

fn crypto_setup() -> (DbPool, String) {
    let pool = test_pool();
    Setting::set(&pool, "crypto_merchant_wallet", MERCHANT).unwrap();
    let track = published_track(&pool, "Phantom", 30.0);
    (pool, track)
}

fn sol_request(track: &str) -> StartPayment {
    StartPayment {
        items: vec![item(track, "non_exclusive")],
        coin: "SOL".to_string(),
        source_wallet: BUYER.to_string(),
        discount_code: None,
        email: Some("crypto@example.com".to_string()),
    }
}

fn sol_transfer(signature: &str, amount: f64, at: i64) -> Transfer {
    Transfer {
        signature: signature.to_string(),
        from: BUYER.to_string(),
        to: MERCHANT.to_string(),
        mint: None,
        amount,
        timestamp: at,
    }
}

#[test]
fn test_crypto_payment_matches_and_completes() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let (id, payment) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    assert_eq!(payment.state, PaymentState::AwaitingPayment);
    assert_eq!(payment.expected_amount, 0.2);
    assert_eq!(Transaction::find_by_id(&pool, &id).unwrap().status, "pending");

    // Nothing on chain yet.
    let p = crypto_flow::check_payment(&pool, &backend, &dir, &id, now).unwrap();
    assert_eq!(p.state, PaymentState::AwaitingPayment);

    backend.transfers.push(sol_transfer("sig_1", 0.2, now.timestamp()));
    let p = crypto_flow::check_payment(&pool, &backend, &dir, &id, now).unwrap();
    assert_eq!(p.state, PaymentState::Completed);
    assert_eq!(p.signature.as_deref(), Some("sig_1"));
    assert_eq!(p.order_ids.len(), 1);

    let order = Order::find_by_id(&pool, &p.order_ids[0]).unwrap();
    assert_eq!(order.status(), OrderStatus::Completed);
    assert_eq!(order.customer_email, "crypto@example.com");
    assert!(order.license_file.is_some());
    let txn = Transaction::find_by_id(&pool, &id).unwrap();
    assert_eq!(txn.status, "completed");
    assert_eq!(txn.order_id.as_deref(), Some(order.id.as_str()));

    // Checking a finished payment is a no-op.
    let again = crypto_flow::check_payment(&pool, &backend, &dir, &id, now).unwrap();
    assert_eq!(again.order_ids, p.order_ids);
    assert_eq!(Order::count(&pool), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_crypto_signature_cannot_pay_twice() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let (first, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    let (second, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    // Both quotes came from one cached price fetch.
    assert_eq!(backend.price_calls.load(Ordering::SeqCst), 1);
    backend.transfers.push(sol_transfer("sig_once", 0.2, now.timestamp()));

    let p1 = crypto_flow::check_payment(&pool, &backend, &dir, &first, now).unwrap();
    assert_eq!(p1.state, PaymentState::Completed);
    let p2 = crypto_flow::check_payment(&pool, &backend, &dir, &second, now).unwrap();
    assert_eq!(p2.state, PaymentState::AwaitingPayment);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_crypto_amount_outside_tolerance_is_ignored() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let (id, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    backend.transfers.push(sol_transfer("sig_short", 0.1, now.timestamp()));
    let p = crypto_flow::check_payment(&pool, &backend, &dir, &id, now).unwrap();
    assert_eq!(p.state, PaymentState::AwaitingPayment);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_crypto_payment_expires() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let (checked, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    let (swept, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    let later = now + ChronoDuration::minutes(16);

    let p = crypto_flow::check_payment(&pool, &backend, &dir, &checked, later).unwrap();
    assert_eq!(p.state, PaymentState::Expired);
    assert_eq!(Transaction::find_by_id(&pool, &checked).unwrap().status, "expired");

    assert_eq!(crypto_flow::expire_stale(&pool, now), 0);
    assert_eq!(crypto_flow::expire_stale(&pool, later), 1);
    assert_eq!(Transaction::find_by_id(&pool, &swept).unwrap().status, "expired");

    // A late transfer does not revive an expired payment.
    backend.transfers.push(sol_transfer("sig_late", 0.2, later.timestamp()));
    let p = crypto_flow::check_payment(&pool, &backend, &dir, &swept, later).unwrap();
    assert_eq!(p.state, PaymentState::Expired);
    assert_eq!(Order::count(&pool), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_crypto_claimed_payment_survives_expiry_sweep() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let (id, _) = crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).unwrap();
    // The signature was claimed but the process stopped before the metadata write.
    {
        let conn = pool.get().unwrap();
        assert!(claim_signature(&conn, "sig_claimed", &id).unwrap());
    }

    let later = now + ChronoDuration::minutes(30);
    assert_eq!(crypto_flow::expire_stale(&pool, later), 0);
    assert_eq!(Transaction::find_by_id(&pool, &id).unwrap().status, "pending");

    let p = crypto_flow::check_payment(&pool, &backend, &dir, &id, later).unwrap();
    assert_eq!(p.state, PaymentState::Completed);
    assert_eq!(p.signature.as_deref(), Some("sig_claimed"));
    assert_eq!(Order::find_by_session(&pool, &id).len(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_crypto_start_validates_input() {
    let (pool, track) = crypto_setup();
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();

    let mut req = sol_request(&track);
    req.coin = "DOGE".to_string();
    assert!(crypto_flow::start_payment(&pool, &backend, &cache, &req, None, now).is_err());

    let mut req = sol_request(&track);
    req.source_wallet = MERCHANT.to_string();
    assert!(crypto_flow::start_payment(&pool, &backend, &cache, &req, None, now).is_err());

    let mut req = sol_request(&track);
    req.email = None;
    assert!(crypto_flow::start_payment(&pool, &backend, &cache, &req, None, now).is_err());

    Setting::set(&pool, "crypto_enabled", "false").unwrap();
    assert!(crypto_flow::start_payment(&pool, &backend, &cache, &sol_request(&track), None, now).is_err());
}

#[test]
fn test_crypto_discount_redeemed_on_completion() {
    let (pool, track) = crypto_setup();
    let dir = temp_dir("licenses");
    let backend = FakeBackend::new(150.0);
    let cache = PriceCache::new(Duration::from_secs(60));
    let now = Utc::now();
    discount(&pool, "HALF", "percentage", 50.0);

    let mut req = sol_request(&track);
    req.discount_code = Some("half".to_string());
    let (id, payment) = crypto_flow::start_payment(&pool, &backend, &cache, &req, None, now).unwrap();
    assert_eq!(payment.usd_amount, 15.0);
    assert_eq!(payment.expected_amount, 0.1);
    assert_eq!(DiscountCode::find_by_code(&pool, "HALF").unwrap().used_count, 0);

    backend.transfers.push(sol_transfer("sig_half", 0.1, now.timestamp()));
    crypto_flow::check_payment(&pool, &backend, &dir, &id, now).unwrap();
    assert_eq!(DiscountCode::find_by_code(&pool, "HALF").unwrap().used_count, 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_price_cache_reuses_fetch_and_skips_fallback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let sources: Vec<Box<dyn PriceSource>> = vec![Box::new(FixedPrices {
        usd: 2.0,
        calls: Arc::clone(&calls),
    })];
    let cache = PriceCache::new(Duration::from_secs(60));
    let t0 = Instant::now();

    assert_eq!(cache.get_or_fetch(&sources, t0).source, "fixed");
    cache.get_or_fetch(&sources, t0 + Duration::from_secs(30));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    cache.get_or_fetch(&sources, t0 + Duration::from_secs(61));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let broken: Vec<Box<dyn PriceSource>> = vec![Box::new(BrokenPrices)];
    let fresh = PriceCache::new(Duration::from_secs(60));
    let prices = fresh.get_or_fetch(&broken, t0);
    assert_eq!(prices.source, "fallback");
    assert_eq!(prices.usd.len(), COINS.len());
    assert!(fresh.cached(t0).is_none());
}

// ═══════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════

#[test]
fn test_scheduler_inactive_is_never_due() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let downloader = FakeDownloader::default();
    store::add_source(&pool, "https://www.youtube.com/@prodnova", None).unwrap();

    let report = scheduler::run_if_due(
        &pool,
        &downloader,
        &dir.join("downloads"),
        &dir.join("scheduler.json"),
        Utc::now().naive_utc(),
        false,
    )
    .unwrap();
    assert!(!report.ran);
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scheduler_toggle_then_run_when_due() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let snapshot = dir.join("scheduler.json");
    let downloader = FakeDownloader {
        manifests: vec![manifest("abc123", "Phantom"), manifest("def456", "Midnight")],
        ..Default::default()
    };
    store::add_source(&pool, "https://www.youtube.com/@prodnova", None).unwrap();
    store::add_source(&pool, "https://www.youtube.com/playlist?list=PL123", None).unwrap();

    let now = Utc::now().naive_utc();
    let state = scheduler::toggle(&pool, &snapshot, None, now).unwrap();
    assert!(state.active);
    assert_eq!(state.next_run, Some(now + ChronoDuration::hours(24)));
    assert!(snapshot.exists());

    let early = scheduler::run_if_due(&pool, &downloader, &dir, &snapshot, now + ChronoDuration::hours(1), false).unwrap();
    assert!(!early.ran);

    let due = now + ChronoDuration::hours(25);
    let report = scheduler::run_if_due(&pool, &downloader, &dir, &snapshot, due, false).unwrap();
    assert!(report.ran);
    assert_eq!(report.sources, 2);
    // Both sources list the same videos; the second pass finds them already imported.
    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.next_run, Some(due + ChronoDuration::hours(24)));

    let imported = Track::find_by_slug(&pool, "phantom").unwrap();
    assert_eq!(imported.status, "draft");
    assert_eq!(imported.base_price, 29.99);
    assert!(store::list_sources(&pool).iter().all(|s| s.last_checked == Some(due)));

    // Not due again until the next interval.
    let report = scheduler::run_if_due(&pool, &downloader, &dir, &snapshot, due, false).unwrap();
    assert!(!report.ran);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scheduler_force_runs_and_reports_source_errors() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let bad = store::add_source(&pool, "https://www.youtube.com/@broken", None).unwrap();
    store::add_source(&pool, "https://www.youtube.com/@prodnova", None).unwrap();
    let downloader = FakeDownloader {
        manifests: vec![manifest("abc123", "Phantom")],
        fail_for: Some(bad.url.clone()),
        ..Default::default()
    };

    let report = scheduler::run_if_due(
        &pool,
        &downloader,
        &dir,
        &dir.join("scheduler.json"),
        Utc::now().naive_utc(),
        true,
    )
    .unwrap();
    assert!(report.ran);
    assert_eq!(report.imported, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(store::recent_logs(&pool).iter().any(|l| l.level == "error"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scheduler_skips_inactive_sources() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let src = store::add_source(&pool, "https://www.youtube.com/@prodnova", None).unwrap();
    assert!(!store::toggle_source(&pool, &src.id, None).unwrap());
    let downloader = FakeDownloader::default();

    let report = scheduler::run_if_due(&pool, &downloader, &dir, &dir.join("s.json"), Utc::now().naive_utc(), true).unwrap();
    assert_eq!(report.sources, 0);
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scheduler_stale_version_conflicts() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let snapshot = dir.join("scheduler.json");
    let before = SchedulerState::load(&pool).unwrap();

    scheduler::toggle(&pool, &snapshot, Some(before.version), Utc::now().naive_utc()).unwrap();
    let err = scheduler::toggle(&pool, &snapshot, Some(before.version), Utc::now().naive_utc()).unwrap_err();
    assert_eq!(err, SchedulerError::Conflict);
    assert!(matches!(
        SchedulerState::write(&pool, before.version, false, None),
        Err(SchedulerError::Conflict)
    ));
    assert!(SchedulerState::load(&pool).unwrap().active);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_scheduler_source_edits_bump_version() {
    let pool = test_pool();
    let v0 = SchedulerState::load(&pool).unwrap().version;
    let src = store::add_source(&pool, "https://www.youtube.com/@prodnova", Some(v0)).unwrap();
    let v1 = SchedulerState::load(&pool).unwrap().version;
    assert_eq!(v1, v0 + 1);

    // A client still holding v0 cannot edit the list.
    assert_eq!(
        store::add_source(&pool, "https://www.youtube.com/@other", Some(v0)).unwrap_err(),
        SchedulerError::Conflict
    );
    assert_eq!(store::toggle_source(&pool, &src.id, Some(v0)).unwrap_err(), SchedulerError::Conflict);
    assert_eq!(store::delete_source(&pool, &src.id, Some(v0)).unwrap_err(), SchedulerError::Conflict);
    assert_eq!(store::list_sources(&pool).len(), 1);
    assert!(store::list_sources(&pool)[0].active);
    assert_eq!(SchedulerState::load(&pool).unwrap().version, v1);

    // A failed edit rolls back its version bump.
    assert!(store::delete_source(&pool, "missing", Some(v1)).is_err());
    assert_eq!(SchedulerState::load(&pool).unwrap().version, v1);

    assert!(!store::toggle_source(&pool, &src.id, Some(v1)).unwrap());
    assert_eq!(SchedulerState::load(&pool).unwrap().version, v1 + 1);
}

#[test]
fn test_scheduler_sources_validate_and_dedupe() {
    let pool = test_pool();
    assert!(matches!(
        store::add_source(&pool, "https://vimeo.com/someone", None),
        Err(SchedulerError::Invalid(_))
    ));
    store::add_source(&pool, "https://www.youtube.com/@prodnova/", None).unwrap();
    assert!(store::add_source(&pool, "https://www.youtube.com/@prodnova", None).is_err());
    let sources = store::list_sources(&pool);
    assert_eq!(sources.len(), 1);

    store::delete_source(&pool, &sources[0].id, None).unwrap();
    assert!(store::delete_source(&pool, &sources[0].id, None).is_err());
}

#[test]
fn test_scheduler_log_keeps_last_hundred() {
    let pool = test_pool();
    for i in 0..130 {
        store::log(&pool, "info", &format!("entry {}", i));
    }
    let conn = pool.get().unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM scheduler_logs", [], |row| row.get(0))
        .unwrap();
    drop(conn);
    assert_eq!(count, store::MAX_LOGS);
    let logs = store::recent_logs(&pool);
    assert_eq!(logs[0].message, "entry 129");
    assert_eq!(logs.last().unwrap().message, "entry 30");
}

#[test]
fn test_scheduler_snapshot_seeds_fresh_install() {
    let pool = test_pool();
    let dir = temp_dir("scheduler");
    let snapshot = dir.join("scheduler.json");
    store::add_source(&pool, "https://www.youtube.com/@prodnova", None).unwrap();
    scheduler::toggle(&pool, &snapshot, None, Utc::now().naive_utc()).unwrap();

    let fresh = test_pool();
    assert!(store::seed_from_snapshot(&fresh, &snapshot).unwrap());
    assert!(SchedulerState::load(&fresh).unwrap().active);
    assert_eq!(store::list_sources(&fresh).len(), 1);
    // Already seeded: a second import is refused.
    assert!(!store::seed_from_snapshot(&fresh, &snapshot).unwrap());
    assert!(!store::seed_from_snapshot(&fresh, &dir.join("missing.json")).unwrap());

    let _ = std::fs::remove_dir_all(&dir);
}

// ═══════════════════════════════════════════════════════════
// Rate limiting
// ═══════════════════════════════════════════════════════════

#[test]
fn test_rate_limit_buckets_per_client() {
    let pool = test_pool();
    let limiter = RateLimiter::new();
    for _ in 0..5 {
        assert!(limiter.allow(&pool, rate_limit::LOGIN, "203.0.113.7"));
    }
    assert!(!limiter.allow(&pool, rate_limit::LOGIN, "203.0.113.7"));
    assert!(limiter.allow(&pool, rate_limit::LOGIN, "198.51.100.1"));
    assert!(limiter.allow(&pool, rate_limit::SIGNUP, "203.0.113.7"));
    assert_eq!(limiter.tracked_keys(), 3);

    limiter.cleanup(Duration::from_secs(0));
    assert_eq!(limiter.tracked_keys(), 0);
}

#[test]
fn test_rate_limit_reads_setting() {
    let pool = test_pool();
    Setting::set(&pool, "discount_rate_limit", "2").unwrap();
    let limiter = RateLimiter::new();
    assert!(limiter.allow(&pool, rate_limit::DISCOUNT, "203.0.113.7"));
    assert!(limiter.allow(&pool, rate_limit::DISCOUNT, "203.0.113.7"));
    assert!(!limiter.allow(&pool, rate_limit::DISCOUNT, "203.0.113.7"));
}

// ═══════════════════════════════════════════════════════════
// HTTP routes
// ═══════════════════════════════════════════════════════════

mod http {
    use rocket::http::{ContentType, Header, Status};
    use rocket::local::blocking::Client;

    use super::*;
    use crate::config::DataDir;

    const WEBHOOK_SECRET: &str = "whsec_routes";

    fn client(pool: &DbPool, dir: &std::path::Path) -> Client {
        let rocket = crate::assemble(
            pool.clone(),
            DataDir(dir.to_path_buf()),
            Duration::from_secs(60),
            Arc::new(FakeStripe::default()),
            Arc::new(FakeBackend::new(100.0)),
            Arc::new(FakeDownloader::default()),
        );
        Client::tracked(rocket).expect("valid rocket instance")
    }

    fn sign_in_admin(client: &Client, pool: &DbPool) {
        Profile::create(pool, "admin@example.com", "Admin", Some(&fast_hash("correct horse")), "admin").unwrap();
        let res = client
            .post("/api/auth/login")
            .header(ContentType::JSON)
            .body(r#"{"email":"admin@example.com","password":"correct horse"}"#)
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }

    fn signed(client: &Client, body: &'static [u8], header: String) -> Status {
        client
            .post("/api/webhooks/stripe")
            .header(Header::new("Stripe-Signature", header))
            .body(body)
            .dispatch()
            .status()
    }

    #[test]
    fn webhook_rejects_bad_signatures() {
        let pool = test_pool();
        let dir = temp_dir("routes");
        Setting::set(&pool, "stripe_webhook_secret", WEBHOOK_SECRET).unwrap();
        let client = client(&pool, &dir);
        let body: &[u8] = br#"{"id":"evt_r1","type":"checkout.session.completed","data":{"object":{"id":"cs_r1"}}}"#;
        let now = Utc::now().timestamp();

        assert_eq!(signed(&client, body, stripe::signature_header("whsec_other", body, now)), Status::BadRequest);
        assert_eq!(signed(&client, body, stripe::signature_header(WEBHOOK_SECRET, body, now - 3600)), Status::BadRequest);
        let unsigned = client.post("/api/webhooks/stripe").body(body).dispatch();
        assert_eq!(unsigned.status(), Status::BadRequest);
        assert_eq!(Order::count(&pool), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn webhook_acknowledges_signed_events_that_fail_to_process() {
        let pool = test_pool();
        let dir = temp_dir("routes");
        Setting::set(&pool, "stripe_webhook_secret", WEBHOOK_SECRET).unwrap();
        let client = client(&pool, &dir);
        // No cart metadata and no secret key for a line item lookup.
        let body: &[u8] = br#"{"id":"evt_r2","type":"checkout.session.completed","data":{"object":{"id":"cs_r2","payment_status":"paid","customer_details":{"email":"r2@example.com"},"metadata":{}}}}"#;
        let header = stripe::signature_header(WEBHOOK_SECRET, body, Utc::now().timestamp());

        let res = client
            .post("/api/webhooks/stripe")
            .header(Header::new("Stripe-Signature", header))
            .body(body)
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let outcome: Value = res.into_json().unwrap();
        assert_eq!(outcome["received"], true);
        assert!(!outcome["errors"].as_array().unwrap().is_empty());
        assert_eq!(Order::count(&pool), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn debug_routes_hidden_in_production() {
        let pool = test_pool();
        let dir = temp_dir("routes");
        let client = client(&pool, &dir);
        sign_in_admin(&client, &pool);

        let health = client.get("/api/debug/health").dispatch();
        assert_eq!(health.status(), Status::Ok);
        let body: Value = health.into_json().unwrap();
        // The admin login above opened one rate limit bucket.
        assert_eq!(body["rate_limited_clients"], 1);

        Setting::set(&pool, "app_env", "production").unwrap();
        assert_eq!(client.get("/api/debug/health").dispatch().status(), Status::NotFound);
        assert_eq!(client.get("/api/debug/webhook-logs").dispatch().status(), Status::NotFound);
        assert_eq!(client.post("/api/debug/repair-profiles").dispatch().status(), Status::NotFound);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scheduler_source_edits_on_stale_version_conflict() {
        let pool = test_pool();
        let dir = temp_dir("routes");
        let client = client(&pool, &dir);
        sign_in_admin(&client, &pool);
        let stale = SchedulerState::load(&pool).unwrap().version;

        let res = client
            .post("/api/scheduler/sources")
            .header(ContentType::JSON)
            .body(format!(r#"{{"url":"https://www.youtube.com/@prodnova","version":{}}}"#, stale))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let added: Value = res.into_json().unwrap();
        let id = added["source"]["id"].as_str().unwrap().to_string();
        assert_eq!(added["version"], stale + 1);

        let res = client
            .delete(format!("/api/scheduler/sources/{}?version={}", id, stale))
            .dispatch();
        assert_eq!(res.status(), Status::Conflict);
        let res = client
            .post(format!("/api/scheduler/sources/{}/toggle?version={}", id, stale))
            .dispatch();
        assert_eq!(res.status(), Status::Conflict);
        assert_eq!(store::list_sources(&pool).len(), 1);

        let res = client
            .delete(format!("/api/scheduler/sources/{}?version={}", id, stale + 1))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        assert!(store::list_sources(&pool).is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn admin_customer_detail_lists_transactions() {
        let pool = test_pool();
        let dir = temp_dir("routes");
        let client = client(&pool, &dir);
        sign_in_admin(&client, &pool);

        let a = published_track(&pool, "Phantom", 30.0);
        let buyer = Profile::create(&pool, "buyer@example.com", "Buyer", None, "customer").unwrap();
        let stripe = FakeStripe::default();
        let event = session_event(
            stripe::EVENT_COMPLETED,
            "cs_admin_view",
            "paid",
            Some("buyer@example.com"),
            json!({ "user_id": buyer, "cart": cart_json(&[line(&a, "non_exclusive", 30.0)]) }),
        );
        Reconciler { pool: &pool, stripe: &stripe, licenses_dir: &dir.join("licenses") }.handle(&event);

        let res = client.get(format!("/api/admin/customers/{}", buyer)).dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body: Value = res.into_json().unwrap();
        assert_eq!(body["orders"].as_array().unwrap().len(), 1);
        let txns = body["transactions"].as_array().unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0]["stripe_transaction_id"], "pi_cs_admin_view");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
