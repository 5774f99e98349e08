use std::path::PathBuf;

use log::info;

use crate::db::DbPool;
use crate::models::settings::Setting;

/// Environment variables that override a settings row at boot.
/// Credentials are never seeded into the database by default; they only
/// land there when the operator exports them.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("STRIPE_SECRET_KEY", "stripe_secret_key"),
    ("STRIPE_WEBHOOK_SECRET", "stripe_webhook_secret"),
    ("HELIUS_API_KEY", "crypto_helius_api_key"),
    ("BIRDEYE_API_KEY", "crypto_birdeye_api_key"),
    ("MERCHANT_WALLET", "crypto_merchant_wallet"),
    ("SITE_URL", "site_url"),
    ("APP_ENV", "app_env"),
    ("SCHEDULER_CRON_SECRET", "scheduler_cron_secret"),
];

/// Root directory for the database, license PDFs and the scheduler snapshot.
pub fn data_dir() -> PathBuf {
    std::env::var("BEATSTORE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

pub fn db_path() -> String {
    std::env::var("BEATSTORE_DB").unwrap_or_else(|_| {
        data_dir()
            .join("db")
            .join("beatstore.db")
            .to_string_lossy()
            .into_owned()
    })
}

/// Managed state: where generated files live.
#[derive(Debug, Clone)]
pub struct DataDir(pub PathBuf);

impl DataDir {
    pub fn licenses(&self) -> PathBuf {
        self.0.join("licenses")
    }

    pub fn scheduler_snapshot(&self) -> PathBuf {
        self.0.join("scheduler").join("state.json")
    }

    pub fn downloads(&self) -> PathBuf {
        self.0.join("downloads")
    }
}

/// Copy any set environment overrides into the settings table.
pub fn apply_env_overrides(pool: &DbPool) -> Result<(), String> {
    apply_overrides(pool, |name| std::env::var(name).ok())
}

fn apply_overrides<F>(pool: &DbPool, lookup: F) -> Result<(), String>
where
    F: Fn(&str) -> Option<String>,
{
    for (var, key) in ENV_OVERRIDES {
        if let Some(value) = lookup(var).filter(|v| !v.is_empty()) {
            Setting::set(pool, key, &value)?;
            info!("Setting '{}' taken from ${}", key, var);
        }
    }
    Ok(())
}

/// Debug endpoints and verbose error bodies are only served outside production.
pub fn is_production(pool: &DbPool) -> bool {
    Setting::get_or(pool, "app_env", "development") == "production"
}
