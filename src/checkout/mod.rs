//! Cart pricing and the purchase flows built on it.

pub mod crypto;
pub mod fulfill;
pub mod webhook;

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::license::{round_cents, LicenseType};
use crate::models::discount::DiscountCode;
use crate::models::settings::Setting;
use crate::models::track::Track;
use crate::payments::stripe::{to_minor, CartLine};

const MAX_CART_ITEMS: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CartItem {
    pub track_id: String,
    pub license: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteLine {
    pub track_id: String,
    pub track_name: String,
    pub license: LicenseType,
    pub license_name: &'static str,
    pub unit_price: f64,
    pub discount: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub lines: Vec<QuoteLine>,
    pub subtotal: f64,
    pub discount: f64,
    pub total: f64,
    pub currency: String,
    pub discount_code: Option<String>,
}

impl Quote {
    /// Compact per-line form carried through payment providers.
    pub fn cart_lines(&self) -> Vec<CartLine> {
        self.lines
            .iter()
            .map(|l| CartLine {
                track_id: l.track_id.clone(),
                license: l.license.as_str().to_string(),
                name: format!("{} ({})", l.track_name, l.license_name),
                amount: l.amount,
                discount: l.discount,
            })
            .collect()
    }
}

/// Split `discount` across `prices` in proportion, in whole cents. Each line
/// gets the floor of its exact share and the leftover cents go to the lines
/// with the largest remainders, so the shares always sum to the discount
/// and no line is discounted below zero.
pub fn allocate_discount(prices: &[f64], discount: f64) -> Vec<f64> {
    let cents: Vec<i64> = prices.iter().map(|p| to_minor(*p).max(0)).collect();
    let total: i64 = cents.iter().sum();
    let discount = to_minor(discount).clamp(0, total);
    if discount == 0 {
        return vec![0.0; prices.len()];
    }

    let mut shares = Vec::with_capacity(cents.len());
    let mut remainders = Vec::with_capacity(cents.len());
    for (i, c) in cents.iter().enumerate() {
        let exact = discount as i128 * *c as i128;
        shares.push((exact / total as i128) as i64);
        remainders.push(((exact % total as i128) as i64, i));
    }
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut left = discount - shares.iter().sum::<i64>();
    for (_, i) in remainders {
        if left == 0 {
            break;
        }
        if shares[i] < cents[i] {
            shares[i] += 1;
            left -= 1;
        }
    }
    shares.into_iter().map(|c| c as f64 / 100.0).collect()
}

/// Price a cart against the catalog, applying `discount_code` if given.
pub fn quote(pool: &DbPool, items: &[CartItem], discount_code: Option<&str>, now: NaiveDateTime) -> Result<Quote, String> {
    if items.is_empty() {
        return Err("Cart is empty".to_string());
    }
    if items.len() > MAX_CART_ITEMS {
        return Err(format!("Cart cannot hold more than {} items", MAX_CART_ITEMS));
    }

    let mut seen = HashSet::new();
    let mut priced = Vec::with_capacity(items.len());
    for item in items {
        let license: LicenseType = item.license.parse()?;
        let track = Track::find_by_id(pool, &item.track_id)
            .filter(|t| t.is_published())
            .ok_or_else(|| format!("Track {} is not available", item.track_id))?;
        if !seen.insert((track.id.clone(), license)) {
            return Err(format!("\"{}\" ({}) is already in the cart", track.title, license.display_name()));
        }
        priced.push((track, license));
    }

    let prices: Vec<f64> = priced.iter().map(|(t, l)| l.price_for(t.base_price)).collect();
    let subtotal = round_cents(prices.iter().sum());

    let (code, discount) = match discount_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => {
            let (dc, amount) = DiscountCode::validate(pool, code, subtotal, now).map_err(|e| e.to_string())?;
            (Some(dc.code), amount)
        }
        None => (None, 0.0),
    };
    let shares = allocate_discount(&prices, discount);

    let lines = priced
        .into_iter()
        .zip(prices.iter().zip(shares.iter()))
        .map(|((track, license), (price, share))| QuoteLine {
            track_id: track.id,
            track_name: track.title,
            license,
            license_name: license.display_name(),
            unit_price: *price,
            discount: *share,
            amount: round_cents(price - share),
        })
        .collect();

    Ok(Quote {
        lines,
        subtotal,
        discount,
        total: round_cents(subtotal - discount),
        currency: Setting::get_or(pool, "commerce_currency", "USD"),
        discount_code: code,
    })
}
