//! Solana payments: supported coins, USD price lookup with a short cache,
//! explorer transfer lookup and matching a transfer to a pending payment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stripe::CartLine;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coin {
    pub symbol: &'static str,
    pub mint: &'static str,
    pub decimals: u8,
    pub coingecko_id: &'static str,
    /// Used when every price source fails.
    pub fallback_usd: f64,
}

pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

pub const COINS: [Coin; 4] = [
    Coin {
        symbol: "SOL",
        mint: WRAPPED_SOL_MINT,
        decimals: 9,
        coingecko_id: "solana",
        fallback_usd: 150.0,
    },
    Coin {
        symbol: "USDC",
        mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
        decimals: 6,
        coingecko_id: "usd-coin",
        fallback_usd: 1.0,
    },
    Coin {
        symbol: "USDT",
        mint: "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB",
        decimals: 6,
        coingecko_id: "tether",
        fallback_usd: 1.0,
    },
    Coin {
        symbol: "BONK",
        mint: "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
        decimals: 5,
        coingecko_id: "bonk",
        fallback_usd: 0.00002,
    },
];

pub fn coin(symbol: &str) -> Option<Coin> {
    COINS
        .iter()
        .copied()
        .find(|c| c.symbol.eq_ignore_ascii_case(symbol.trim()))
}

/// Crypto amount for a USD total, rounded to the coin's precision.
pub fn expected_amount(usd: f64, price_usd: f64, decimals: u8) -> f64 {
    if price_usd <= 0.0 {
        return 0.0;
    }
    let scale = 10f64.powi(decimals as i32);
    (usd / price_usd * scale).round() / scale
}

// ── Prices ──

#[derive(Debug, Clone, Serialize)]
pub struct Prices {
    pub usd: HashMap<String, f64>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl Prices {
    pub fn fallback() -> Self {
        Prices {
            usd: COINS
                .iter()
                .map(|c| (c.symbol.to_string(), c.fallback_usd))
                .collect(),
            source: "fallback".to_string(),
            fetched_at: Utc::now(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.usd.get(symbol).copied().filter(|p| *p > 0.0)
    }
}

/// A USD price feed. Returns prices keyed by coin symbol.
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch(&self, coins: &[Coin]) -> Result<HashMap<String, f64>, String>;
}

fn get_json(req: reqwest::blocking::RequestBuilder) -> Result<Value, String> {
    let resp = req.send().map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    resp.json::<Value>().map_err(|e| e.to_string())
}

fn as_price(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .filter(|p: &f64| p.is_finite() && *p > 0.0)
}

pub struct Jupiter {
    pub timeout: Duration,
}

impl PriceSource for Jupiter {
    fn name(&self) -> &'static str {
        "jupiter"
    }

    fn fetch(&self, coins: &[Coin]) -> Result<HashMap<String, f64>, String> {
        let ids: Vec<&str> = coins.iter().map(|c| c.mint).collect();
        let client = super::http_client(self.timeout)?;
        let body = get_json(client.get("https://api.jup.ag/price/v2").query(&[("ids", ids.join(","))]))?;
        let data = body.get("data").ok_or("missing data")?;
        Ok(coins
            .iter()
            .filter_map(|c| {
                let price = data.get(c.mint)?.get("price").and_then(as_price)?;
                Some((c.symbol.to_string(), price))
            })
            .collect())
    }
}

pub struct CoinGecko {
    pub timeout: Duration,
}

impl PriceSource for CoinGecko {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    fn fetch(&self, coins: &[Coin]) -> Result<HashMap<String, f64>, String> {
        let ids: Vec<&str> = coins.iter().map(|c| c.coingecko_id).collect();
        let client = super::http_client(self.timeout)?;
        let body = get_json(
            client
                .get("https://api.coingecko.com/api/v3/simple/price")
                .query(&[("ids", ids.join(",").as_str()), ("vs_currencies", "usd")]),
        )?;
        Ok(coins
            .iter()
            .filter_map(|c| {
                let price = body.get(c.coingecko_id)?.get("usd").and_then(as_price)?;
                Some((c.symbol.to_string(), price))
            })
            .collect())
    }
}

pub struct Birdeye {
    pub timeout: Duration,
    pub api_key: String,
}

impl PriceSource for Birdeye {
    fn name(&self) -> &'static str {
        "birdeye"
    }

    fn fetch(&self, coins: &[Coin]) -> Result<HashMap<String, f64>, String> {
        if self.api_key.is_empty() {
            return Err("no API key".to_string());
        }
        let ids: Vec<&str> = coins.iter().map(|c| c.mint).collect();
        let client = super::http_client(self.timeout)?;
        let body = get_json(
            client
                .get("https://public-api.birdeye.so/defi/multi_price")
                .header("X-API-KEY", &self.api_key)
                .header("x-chain", "solana")
                .query(&[("list_address", ids.join(","))]),
        )?;
        let data = body.get("data").ok_or("missing data")?;
        Ok(coins
            .iter()
            .filter_map(|c| {
                let price = data.get(c.mint)?.get("value").and_then(as_price)?;
                Some((c.symbol.to_string(), price))
            })
            .collect())
    }
}

/// Last fetched prices and when. One timestamp for the whole table.
pub struct PriceCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Prices)>>,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        PriceCache {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn cached(&self, now: Instant) -> Option<Prices> {
        let guard = self.entry.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .filter(|(at, _)| now.duration_since(*at) < self.ttl)
            .map(|(_, prices)| prices.clone())
    }

    pub fn store(&self, now: Instant, prices: Prices) {
        let mut guard = self.entry.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some((now, prices));
    }

    /// Serve from cache, else try each source in order. A source only wins
    /// if it prices every coin; missing coins fall through to the next one.
    /// Fallback prices are returned but never cached.
    pub fn get_or_fetch(&self, sources: &[Box<dyn PriceSource>], now: Instant) -> Prices {
        if let Some(p) = self.cached(now) {
            return p;
        }
        for source in sources {
            match source.fetch(&COINS) {
                Ok(map) if COINS.iter().all(|c| map.contains_key(c.symbol)) => {
                    let prices = Prices {
                        usd: map,
                        source: source.name().to_string(),
                        fetched_at: Utc::now(),
                    };
                    self.store(now, prices.clone());
                    return prices;
                }
                Ok(_) => log::warn!("[crypto] {} returned incomplete prices", source.name()),
                Err(e) => log::warn!("[crypto] {} price lookup failed: {}", source.name(), e),
            }
        }
        log::warn!("[crypto] all price sources failed, using fallback prices");
        Prices::fallback()
    }
}

// ── Transfers ──

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub signature: String,
    pub from: String,
    pub to: String,
    /// `None` for native SOL.
    pub mint: Option<String>,
    /// In whole coin units.
    pub amount: f64,
    pub timestamp: i64,
}

/// Recent incoming/outgoing transfers for a wallet.
pub trait TransferSource: Send + Sync {
    fn recent_transfers(&self, wallet: &str) -> Result<Vec<Transfer>, String>;
}

pub struct Helius {
    pub api_key: String,
    pub timeout: Duration,
}

/// Flatten Helius enhanced transactions into individual transfers.
pub fn parse_helius(body: &Value) -> Vec<Transfer> {
    let mut out = Vec::new();
    let Some(txs) = body.as_array() else {
        return out;
    };
    for tx in txs {
        let signature = tx.get("signature").and_then(|s| s.as_str()).unwrap_or_default();
        if signature.is_empty() {
            continue;
        }
        let timestamp = tx.get("timestamp").and_then(|t| t.as_i64()).unwrap_or(0);
        let str_of = |v: &Value, k: &str| v.get(k).and_then(|s| s.as_str()).unwrap_or_default().to_string();

        for nt in tx.get("nativeTransfers").and_then(|v| v.as_array()).into_iter().flatten() {
            let lamports = nt.get("amount").and_then(|a| a.as_i64()).unwrap_or(0);
            out.push(Transfer {
                signature: signature.to_string(),
                from: str_of(nt, "fromUserAccount"),
                to: str_of(nt, "toUserAccount"),
                mint: None,
                amount: lamports as f64 / 1e9,
                timestamp,
            });
        }
        for tt in tx.get("tokenTransfers").and_then(|v| v.as_array()).into_iter().flatten() {
            let amount = tt.get("tokenAmount").and_then(as_price).unwrap_or(0.0);
            out.push(Transfer {
                signature: signature.to_string(),
                from: str_of(tt, "fromUserAccount"),
                to: str_of(tt, "toUserAccount"),
                mint: Some(str_of(tt, "mint")),
                amount,
                timestamp,
            });
        }
    }
    out
}

impl TransferSource for Helius {
    fn recent_transfers(&self, wallet: &str) -> Result<Vec<Transfer>, String> {
        if self.api_key.is_empty() {
            return Err("Helius API key not configured".to_string());
        }
        let client = super::http_client(self.timeout)?;
        let body = get_json(
            client
                .get(format!("https://api.helius.xyz/v0/addresses/{}/transactions", wallet))
                .query(&[("api-key", self.api_key.as_str()), ("limit", "50")]),
        )?;
        Ok(parse_helius(&body))
    }
}

// ── Payment state ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    AwaitingPayment,
    Confirming,
    Confirmed,
    Completed,
    Expired,
}

impl PaymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::AwaitingPayment => "awaiting_payment",
            PaymentState::Confirming => "confirming",
            PaymentState::Confirmed => "confirmed",
            PaymentState::Completed => "completed",
            PaymentState::Expired => "expired",
        }
    }

    /// Linear progression; expiry only before a transfer is confirmed.
    pub fn can_transition_to(self, next: PaymentState) -> bool {
        use PaymentState::*;
        matches!(
            (self, next),
            (AwaitingPayment, Confirming)
                | (Confirming, Confirmed)
                | (Confirmed, Completed)
                | (AwaitingPayment, Expired)
                | (Confirming, Expired)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Expired)
    }

    /// Status of the backing transaction row.
    pub fn transaction_status(self) -> &'static str {
        match self {
            PaymentState::Completed => "completed",
            PaymentState::Expired => "expired",
            _ => "pending",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state of a crypto payment, stored as the transaction's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoPayment {
    pub state: PaymentState,
    pub coin: String,
    pub source_wallet: String,
    pub merchant_wallet: String,
    pub usd_amount: f64,
    pub expected_amount: f64,
    pub rate: f64,
    pub rate_source: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub received_amount: Option<f64>,
    #[serde(default)]
    pub cart: Vec<CartLine>,
    #[serde(default)]
    pub discount_code: Option<String>,
    #[serde(default)]
    pub customer_email: String,
    #[serde(default)]
    pub order_ids: Vec<String>,
}

impl CryptoPayment {
    pub fn from_metadata(v: &Value) -> Result<Self, String> {
        serde_json::from_value(v.clone()).map_err(|e| format!("Invalid crypto payment metadata: {}", e))
    }

    pub fn to_metadata(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn advance(&mut self, next: PaymentState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!("Cannot move payment from {} to {}", self.state, next));
        }
        self.state = next;
        Ok(())
    }
}

fn mint_matches(coin: &Coin, mint: Option<&str>) -> bool {
    match mint {
        None => coin.symbol == "SOL",
        Some(m) => m == coin.mint,
    }
}

/// First transfer that pays `payment`: from the source wallet into the
/// merchant wallet, in the right coin, within `tolerance_pct` of the
/// expected amount, not older than the payment and not already used.
pub fn find_match<'a, F>(
    transfers: &'a [Transfer],
    payment: &CryptoPayment,
    tolerance_pct: f64,
    is_used: F,
) -> Option<&'a Transfer>
where
    F: Fn(&str) -> bool,
{
    let coin = coin(&payment.coin)?;
    let tol = payment.expected_amount * tolerance_pct.max(0.0) / 100.0;
    let low = payment.expected_amount - tol;
    let high = payment.expected_amount + tol;
    // Allow a little clock drift between the explorer and this server.
    let not_before = payment.created_at.timestamp() - 120;

    transfers.iter().find(|t| {
        t.to == payment.merchant_wallet
            && t.from == payment.source_wallet
            && mint_matches(&coin, t.mint.as_deref())
            && t.amount >= low
            && t.amount <= high
            && (t.timestamp == 0 || t.timestamp >= not_before)
            && !is_used(&t.signature)
    })
}

pub fn signature_used(conn: &Connection, signature: &str) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM used_signatures WHERE signature = ?1",
        params![signature],
        |row| row.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(true)
}

/// Record `signature` as spent by `transaction_id`. False if another payment
/// already claimed it; the primary key makes this race-free.
pub fn claim_signature(conn: &Connection, signature: &str, transaction_id: &str) -> Result<bool, String> {
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO used_signatures (signature, transaction_id) VALUES (?1, ?2)",
            params![signature, transaction_id],
        )
        .map_err(|e| e.to_string())?;
    Ok(n == 1)
}

/// The signature `transaction_id` has claimed, if any.
pub fn claimed_signature(conn: &Connection, transaction_id: &str) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT signature FROM used_signatures WHERE transaction_id = ?1 LIMIT 1",
        params![transaction_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| e.to_string())
}

/// Solana addresses are 32-44 base58 characters.
pub fn is_valid_wallet(addr: &str) -> bool {
    const BASE58: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    (32..=44).contains(&addr.len()) && addr.chars().all(|c| BASE58.contains(c))
}
