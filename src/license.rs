use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::DbPool;
use crate::models::order::Order;
use crate::models::settings::Setting;
use crate::pdf::{Document, Style};

/// The five license tiers sold for every beat. The tier decides the price
/// multiplier and the royalty/distribution terms printed on the license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseType {
    NonExclusive,
    Premium,
    Unlimited,
    Exclusive,
    ExclusivePro,
}

impl LicenseType {
    pub const ALL: [LicenseType; 5] = [
        LicenseType::NonExclusive,
        LicenseType::Premium,
        LicenseType::Unlimited,
        LicenseType::Exclusive,
        LicenseType::ExclusivePro,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LicenseType::NonExclusive => "non_exclusive",
            LicenseType::Premium => "premium",
            LicenseType::Unlimited => "unlimited",
            LicenseType::Exclusive => "exclusive",
            LicenseType::ExclusivePro => "exclusive_pro",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            LicenseType::NonExclusive => "Non-Exclusive",
            LicenseType::Premium => "Premium",
            LicenseType::Unlimited => "Unlimited",
            LicenseType::Exclusive => "Exclusive",
            LicenseType::ExclusivePro => "Exclusive Pro",
        }
    }

    /// Multiplier applied to a track's base price.
    pub fn price_multiplier(self) -> f64 {
        match self {
            LicenseType::NonExclusive => 1.0,
            LicenseType::Premium => 2.0,
            LicenseType::Unlimited => 4.0,
            LicenseType::Exclusive => 10.0,
            LicenseType::ExclusivePro => 20.0,
        }
    }

    /// Maximum streams/sales the licensee may distribute. `None` = unlimited.
    pub fn distribution_cap(self) -> Option<u64> {
        match self {
            LicenseType::NonExclusive => Some(50_000),
            LicenseType::Premium => Some(500_000),
            _ => None,
        }
    }

    /// Producer's share of publishing royalties, in percent.
    pub fn producer_royalty_pct(self) -> u8 {
        match self {
            LicenseType::NonExclusive => 50,
            LicenseType::Premium => 50,
            LicenseType::Unlimited => 40,
            LicenseType::Exclusive => 30,
            LicenseType::ExclusivePro => 20,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, LicenseType::Exclusive | LicenseType::ExclusivePro)
    }

    pub fn price_for(self, base_price: f64) -> f64 {
        round_cents(base_price * self.price_multiplier())
    }

    /// Human-readable clauses, in the order they appear on the document.
    pub fn terms(self) -> Vec<String> {
        let mut terms = Vec::new();
        terms.push(match self.distribution_cap() {
            Some(cap) => format!(
                "Distribution is limited to {} combined streams, downloads or sales.",
                group_thousands(cap)
            ),
            None => "Distribution is unlimited across all platforms and formats.".to_string(),
        });
        terms.push(format!(
            "Publishing split: the Producer retains {}% of the writer's share; the Licensee holds {}%.",
            self.producer_royalty_pct(),
            100 - self.producer_royalty_pct()
        ));
        if self.is_exclusive() {
            terms.push(
                "Exclusive rights: the Producer will not license this composition to any other party after the date of purchase."
                    .to_string(),
            );
        } else {
            terms.push(
                "Non-exclusive rights: the Producer may continue to license this composition to other parties."
                    .to_string(),
            );
        }
        if self == LicenseType::ExclusivePro {
            terms.push("Includes trackout stems and the right to register the master with content ID services.".to_string());
        }
        terms.push("Credit must read \"Prod. by <Producer>\" wherever credits are displayed.".to_string());
        terms
    }

    pub fn to_json(self, base_price: Option<f64>) -> Value {
        json!({
            "id": self.as_str(),
            "name": self.display_name(),
            "multiplier": self.price_multiplier(),
            "price": base_price.map(|p| self.price_for(p)),
            "distribution_cap": self.distribution_cap(),
            "producer_royalty_pct": self.producer_royalty_pct(),
            "exclusive": self.is_exclusive(),
            "terms": self.terms(),
        })
    }
}

impl fmt::Display for LicenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LicenseType {
    type Err = String;

    /// Accepts the stored id as well as the display names the storefront sends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        LicenseType::ALL
            .into_iter()
            .find(|t| t.as_str() == norm)
            .ok_or_else(|| format!("Unknown license type '{}'", s))
    }
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ── Document rendering ──────────────────────────────────

/// Render the license agreement for one order line as PDF bytes.
pub fn render_license_pdf(pool: &DbPool, order: &Order, licensee_name: &str) -> Result<Vec<u8>, String> {
    let tier: LicenseType = order.license.parse()?;
    let licensor = Setting::get_or(pool, "license_licensor_name", "Beatstore Productions");
    let law = Setting::get_or(pool, "license_governing_law", "the State of California");

    let licensee = if licensee_name.is_empty() {
        order.customer_email.as_str()
    } else {
        licensee_name
    };

    let mut doc = Document::new();
    doc.line(Style::Title, &format!("{} License Agreement", tier.display_name()))
        .rule()
        .gap(6.0)
        .line(Style::Body, &format!("Licensor (Producer): {}", licensor))
        .line(Style::Body, &format!("Licensee: {} <{}>", licensee, order.customer_email))
        .line(Style::Body, &format!("Composition: \"{}\"", order.track_name))
        .line(Style::Body, &format!("Order: {}", order.id))
        .line(Style::Body, &format!("Date: {}", order.order_date.format("%B %-d, %Y")))
        .line(
            Style::Body,
            &format!("Amount paid: {:.2} {}", order.total_amount, order.currency.to_uppercase()),
        )
        .gap(10.0)
        .line(Style::Heading, "Terms");

    for (i, term) in tier.terms().iter().enumerate() {
        doc.line(Style::Body, &format!("{}. {}", i + 1, term));
    }

    doc.gap(10.0)
        .line(Style::Heading, "General")
        .line(
            Style::Body,
            "The Licensee may not resell, sublicense or claim ownership of the underlying composition. \
             All rights not expressly granted remain with the Producer.",
        )
        .line(Style::Body, &format!("This agreement is governed by the laws of {}.", law))
        .gap(18.0)
        .rule()
        .line(Style::Small, &format!("License file generated for order {}.", order.id));

    Ok(doc.render())
}

pub fn license_path(dir: &Path, order_id: &str) -> PathBuf {
    dir.join(format!("{}.pdf", order_id))
}

/// Render, write and record the license file for `order`. Returns the path.
pub fn generate_for_order(pool: &DbPool, dir: &Path, order: &Order) -> Result<PathBuf, String> {
    let name = crate::models::profile::Profile::find_by_id(pool, &order.user_id)
        .map(|p| p.display_name().to_string())
        .unwrap_or_default();
    let bytes = render_license_pdf(pool, order, &name)?;

    std::fs::create_dir_all(dir).map_err(|e| format!("Cannot create {}: {}", dir.display(), e))?;
    let path = license_path(dir, &order.id);
    std::fs::write(&path, bytes).map_err(|e| format!("Cannot write {}: {}", path.display(), e))?;

    Order::set_license_file(pool, &order.id, &path.to_string_lossy())?;
    log::info!("License generated for order {} ({})", order.id, order.license);
    Ok(path)
}
