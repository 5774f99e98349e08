use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::fulfill::{self, Purchase};
use super::{quote, CartItem};
use crate::db::DbPool;
use crate::models::discount::DiscountCode;
use crate::models::order::{Order, OrderStatus};
use crate::models::profile::Profile;
use crate::models::settings::Setting;
use crate::models::transaction::{NewTransaction, Transaction};
use crate::payments::crypto::{
    self, claim_signature, claimed_signature, find_match, signature_used, Birdeye, CoinGecko, CryptoPayment, Helius, Jupiter,
    PaymentState, PriceCache, PriceSource, Prices, TransferSource,
};

/// Where prices and transfers come from. Built from settings on each call
/// so API keys can change at runtime.
pub trait CryptoBackend: Send + Sync {
    fn price_sources(&self, pool: &DbPool) -> Vec<Box<dyn PriceSource>>;

    fn transfer_source(&self, pool: &DbPool) -> Box<dyn TransferSource>;
}

pub struct LiveBackend;

fn lookup_timeout(pool: &DbPool) -> Duration {
    Duration::from_secs(Setting::get_i64(pool, "crypto_price_timeout_secs").clamp(1, 30) as u64)
}

impl CryptoBackend for LiveBackend {
    fn price_sources(&self, pool: &DbPool) -> Vec<Box<dyn PriceSource>> {
        let timeout = lookup_timeout(pool);
        vec![
            Box::new(Jupiter { timeout }),
            Box::new(CoinGecko { timeout }),
            Box::new(Birdeye {
                timeout,
                api_key: Setting::get_or(pool, "crypto_birdeye_api_key", ""),
            }),
        ]
    }

    fn transfer_source(&self, pool: &DbPool) -> Box<dyn TransferSource> {
        Box::new(Helius {
            api_key: Setting::get_or(pool, "crypto_helius_api_key", ""),
            timeout: Duration::from_secs(10),
        })
    }
}

pub fn current_prices(pool: &DbPool, backend: &dyn CryptoBackend, cache: &PriceCache) -> Prices {
    cache.get_or_fetch(&backend.price_sources(pool), Instant::now())
}

#[derive(Debug, Deserialize)]
pub struct StartPayment {
    pub items: Vec<CartItem>,
    pub coin: String,
    pub source_wallet: String,
    pub discount_code: Option<String>,
    pub email: Option<String>,
}

/// Open a payment window: price the cart, convert to the chosen coin and
/// store a pending crypto transaction holding the payment sub-state.
pub fn start_payment(
    pool: &DbPool,
    backend: &dyn CryptoBackend,
    cache: &PriceCache,
    req: &StartPayment,
    customer: Option<&Profile>,
    now: DateTime<Utc>,
) -> Result<(String, CryptoPayment), String> {
    if !Setting::get_bool(pool, "crypto_enabled") {
        return Err("Crypto payments are not enabled".to_string());
    }
    let merchant = Setting::get_or(pool, "crypto_merchant_wallet", "");
    if !crypto::is_valid_wallet(&merchant) {
        return Err("Merchant wallet not configured".to_string());
    }
    let coin = crypto::coin(&req.coin).ok_or_else(|| format!("Unsupported coin '{}'", req.coin))?;
    let source_wallet = req.source_wallet.trim();
    if !crypto::is_valid_wallet(source_wallet) {
        return Err("Invalid source wallet address".to_string());
    }
    if source_wallet == merchant {
        return Err("Source wallet cannot be the merchant wallet".to_string());
    }

    let q = quote(pool, &req.items, req.discount_code.as_deref(), now.naive_utc())?;
    if q.total <= 0.0 {
        return Err("Nothing to pay for".to_string());
    }

    let prices = current_prices(pool, backend, cache);
    let rate = prices
        .get(coin.symbol)
        .ok_or_else(|| format!("No price available for {}", coin.symbol))?;

    let profile = match customer {
        Some(p) => p.clone(),
        None => {
            let email = req
                .email
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .ok_or("An email address is required for guest checkout")?;
            Profile::ensure_for_email(pool, email, "")?
        }
    };

    let window = Setting::get_i64(pool, "crypto_payment_window_minutes").clamp(1, 120);
    let payment = CryptoPayment {
        state: PaymentState::AwaitingPayment,
        coin: coin.symbol.to_string(),
        source_wallet: source_wallet.to_string(),
        merchant_wallet: merchant,
        usd_amount: q.total,
        expected_amount: crypto::expected_amount(q.total, rate, coin.decimals),
        rate,
        rate_source: prices.source.clone(),
        created_at: now,
        expires_at: now + chrono::Duration::minutes(window),
        signature: None,
        received_amount: None,
        cart: q.cart_lines(),
        discount_code: q.discount_code.clone(),
        customer_email: profile.email.clone(),
        order_ids: vec![],
    };

    let metadata = payment.to_metadata();
    let id = Transaction::create(
        pool,
        &NewTransaction {
            order_id: None,
            user_id: &profile.id,
            amount: q.total,
            currency: "USD",
            transaction_type: "crypto",
            status: "pending",
            stripe_transaction_id: None,
            metadata: &metadata,
        },
    )?;
    log::info!(
        "[crypto] payment {} opened: {} {} for ${:.2}",
        id,
        payment.expected_amount,
        payment.coin,
        payment.usd_amount
    );
    Ok((id, payment))
}

pub fn load(pool: &DbPool, id: &str) -> Result<(Transaction, CryptoPayment), String> {
    let txn = Transaction::find_by_id(pool, id)
        .filter(|t| t.transaction_type == "crypto")
        .ok_or_else(|| "Payment not found".to_string())?;
    let payment = CryptoPayment::from_metadata(&txn.metadata)?;
    Ok((txn, payment))
}

fn save(pool: &DbPool, id: &str, payment: &CryptoPayment) -> Result<(), String> {
    Transaction::update_metadata(pool, id, &payment.to_metadata())?;
    Transaction::update_status(pool, id, payment.state.transaction_status())
}

/// One poll step. Returns the payment after any transition.
pub fn check_payment(
    pool: &DbPool,
    backend: &dyn CryptoBackend,
    licenses_dir: &Path,
    id: &str,
    now: DateTime<Utc>,
) -> Result<CryptoPayment, String> {
    let (txn, mut payment) = load(pool, id)?;
    if payment.state.is_final() {
        return Ok(payment);
    }
    // The claim was written but the metadata update after it was lost.
    if payment.signature.is_none() {
        let conn = pool.get().map_err(|e| e.to_string())?;
        if let Some(sig) = claimed_signature(&conn, id)? {
            drop(conn);
            log::warn!("[crypto] payment {} resumes from claimed signature {}", id, sig);
            payment.signature = Some(sig);
            if payment.state == PaymentState::AwaitingPayment {
                payment.advance(PaymentState::Confirming)?;
            }
            save(pool, id, &payment)?;
        }
    }
    // A previous check matched a transfer but did not finish fulfilment.
    if payment.state == PaymentState::Confirming && payment.signature.is_some() {
        payment.advance(PaymentState::Confirmed)?;
        save(pool, id, &payment)?;
    }
    if payment.state == PaymentState::Confirmed {
        complete(pool, licenses_dir, &txn, &mut payment)?;
        return Ok(payment);
    }
    if payment.is_expired_at(now) {
        payment.advance(PaymentState::Expired)?;
        save(pool, id, &payment)?;
        log::info!("[crypto] payment {} expired", id);
        return Ok(payment);
    }

    let transfers = backend.transfer_source(pool).recent_transfers(&payment.merchant_wallet)?;
    let tolerance = Setting::get_f64(pool, "crypto_amount_tolerance_pct");

    let conn = pool.get().map_err(|e| e.to_string())?;
    let matched = find_match(&transfers, &payment, tolerance, |sig| signature_used(&conn, sig)).cloned();
    let Some(transfer) = matched else {
        return Ok(payment);
    };
    if !claim_signature(&conn, &transfer.signature, id)? {
        // Claimed by a concurrent check; the next poll looks again.
        return Ok(payment);
    }
    drop(conn);

    payment.signature = Some(transfer.signature.clone());
    payment.received_amount = Some(transfer.amount);
    payment.advance(PaymentState::Confirming)?;
    save(pool, id, &payment)?;
    payment.advance(PaymentState::Confirmed)?;
    save(pool, id, &payment)?;
    log::info!("[crypto] payment {} confirmed by {}", id, transfer.signature);

    complete(pool, licenses_dir, &txn, &mut payment)?;
    Ok(payment)
}

/// Create the orders for a confirmed payment and close it.
fn complete(pool: &DbPool, licenses_dir: &Path, txn: &Transaction, payment: &mut CryptoPayment) -> Result<(), String> {
    let purchase = Purchase {
        checkout_ref: &txn.id,
        user_id: &txn.user_id,
        customer_email: &payment.customer_email,
        currency: &txn.currency,
        status: OrderStatus::Completed,
        stripe_transaction_id: None,
    };
    let report = fulfill::record_purchase(pool, licenses_dir, &purchase, &payment.cart);
    for w in &report.warnings {
        log::warn!("[crypto] payment {}: {}", txn.id, w);
    }
    if !report.errors.is_empty() {
        save(pool, &txn.id, payment)?;
        return Err(report.errors.join("; "));
    }

    let orders = Order::find_by_session(pool, &txn.id);
    payment.order_ids = orders.iter().map(|o| o.id.clone()).collect();
    if let Some(first) = orders.first() {
        let conn = pool.get().map_err(|e| e.to_string())?;
        Transaction::set_order(&conn, &txn.id, &first.id)?;
        if let Some(code) = payment.discount_code.as_deref() {
            DiscountCode::redeem(&conn, code, &txn.id)?;
        }
    }
    payment.advance(PaymentState::Completed)?;
    save(pool, &txn.id, payment)?;
    log::info!("[crypto] payment {} completed with {} orders", txn.id, payment.order_ids.len());
    Ok(())
}

/// Expire pending payments whose window has closed. A payment that has
/// already claimed a transfer signature is left for `check_payment` to
/// finish. Returns how many expired.
pub fn expire_stale(pool: &DbPool, now: DateTime<Utc>) -> usize {
    let mut expired = 0;
    for txn in Transaction::list_pending_crypto(pool) {
        let Ok(mut payment) = CryptoPayment::from_metadata(&txn.metadata) else {
            continue;
        };
        if !payment.is_expired_at(now) || !payment.state.can_transition_to(PaymentState::Expired) {
            continue;
        }
        let claimed = match pool.get() {
            Ok(conn) => claimed_signature(&conn, &txn.id).map(|s| s.is_some()).unwrap_or(true),
            Err(_) => true,
        };
        if payment.signature.is_some() || claimed {
            continue;
        }
        if payment.advance(PaymentState::Expired).is_ok() && save(pool, &txn.id, &payment).is_ok() {
            expired += 1;
        }
    }
    expired
}
