use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn init_pool() -> Result<DbPool, Box<dyn std::error::Error>> {
    let path = crate::config::db_path();
    init_pool_at(&path).map_err(|e| e.into())
}

pub fn init_pool_at(path: &str) -> Result<DbPool, String> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| e.to_string())?;

    // WAL for concurrent readers while the webhook handler writes
    let conn = pool.get().map_err(|e| e.to_string())?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(|e| e.to_string())?;

    Ok(pool)
}

pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;

    conn.execute_batch(
        "
        -- Settings (key-value)
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        -- Customer and admin accounts
        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            email TEXT UNIQUE NOT NULL,
            full_name TEXT NOT NULL DEFAULT '',
            password_hash TEXT,
            role TEXT NOT NULL DEFAULT 'customer',
            billing_address TEXT NOT NULL DEFAULT '',
            billing_city TEXT NOT NULL DEFAULT '',
            billing_postal_code TEXT NOT NULL DEFAULT '',
            billing_country TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            profile_id TEXT NOT NULL,
            ip_hash TEXT,
            expires_at DATETIME NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
        );

        -- Catalog
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            slug TEXT UNIQUE NOT NULL,
            artist TEXT NOT NULL DEFAULT '',
            bpm INTEGER,
            musical_key TEXT NOT NULL DEFAULT '',
            genre TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '',
            duration_secs INTEGER,
            preview_url TEXT NOT NULL DEFAULT '',
            cover_url TEXT NOT NULL DEFAULT '',
            base_price REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'draft',
            source TEXT NOT NULL DEFAULT 'manual',
            source_url TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tracks_source_url
            ON tracks(source_url) WHERE source_url IS NOT NULL;

        -- Orders: one row per purchased line item. user_id and track_id are
        -- not foreign keys; reconciliation may have to fabricate them.
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            track_name TEXT NOT NULL,
            license TEXT NOT NULL,
            order_date DATETIME NOT NULL,
            total_amount REAL NOT NULL,
            discount REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'USD',
            status TEXT NOT NULL DEFAULT 'pending',
            stripe_session_id TEXT,
            license_file TEXT,
            customer_email TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_orders_session ON orders(stripe_session_id);
        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            order_id TEXT,
            user_id TEXT NOT NULL,
            amount REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            transaction_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            stripe_transaction_id TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (order_id) REFERENCES orders(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_stripe ON transactions(stripe_transaction_id);

        CREATE TABLE IF NOT EXISTS discount_codes (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE NOT NULL,
            amount REAL NOT NULL,
            type TEXT NOT NULL DEFAULT 'percentage',
            expires_at DATETIME,
            active INTEGER NOT NULL DEFAULT 1,
            usage_limit INTEGER,
            used_count INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        -- One row per checkout that consumed a discount use
        CREATE TABLE IF NOT EXISTS discount_redemptions (
            discount_id TEXT NOT NULL,
            checkout_ref TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (discount_id, checkout_ref),
            FOREIGN KEY (discount_id) REFERENCES discount_codes(id) ON DELETE CASCADE
        );

        -- Blockchain signatures already matched to a payment
        CREATE TABLE IF NOT EXISTS used_signatures (
            signature TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS webhook_logs (
            id INTEGER PRIMARY KEY,
            event_id TEXT NOT NULL DEFAULT '',
            event_type TEXT NOT NULL DEFAULT '',
            level TEXT NOT NULL DEFAULT 'info',
            message TEXT NOT NULL,
            payload TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        -- Scheduler: a single state row guarded by a version column
        CREATE TABLE IF NOT EXISTS scheduler_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            active INTEGER NOT NULL DEFAULT 0,
            next_run DATETIME,
            version INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS scheduler_sources (
            id TEXT PRIMARY KEY,
            url TEXT UNIQUE NOT NULL,
            source_type TEXT NOT NULL,
            last_checked DATETIME,
            active INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS scheduler_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL DEFAULT 'info',
            message TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO scheduler_state (id, active, version) VALUES (1, 0, 0)",
        [],
    )?;

    Ok(())
}

pub fn seed_defaults(pool: &DbPool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get()?;

    let defaults: Vec<(&str, &str)> = vec![
        // Site
        ("site_name", "Beatstore"),
        ("site_url", "http://localhost:8000"),
        ("app_env", "development"),
        ("commerce_currency", "USD"),
        // Stripe
        ("stripe_secret_key", ""),
        ("stripe_webhook_secret", ""),
        ("stripe_webhook_tolerance_secs", "300"),
        // Crypto
        ("crypto_enabled", "true"),
        ("crypto_merchant_wallet", ""),
        ("crypto_helius_api_key", ""),
        ("crypto_birdeye_api_key", ""),
        ("crypto_payment_window_minutes", "15"),
        ("crypto_amount_tolerance_pct", "15"),
        ("crypto_price_cache_secs", "60"),
        ("crypto_price_timeout_secs", "5"),
        // Licensing
        ("license_licensor_name", "Beatstore Productions"),
        ("license_governing_law", "the State of California"),
        // Auth
        ("session_expiry_hours", "168"),
        ("login_rate_limit", "5"),
        ("signup_rate_limit", "5"),
        ("discount_rate_limit", "30"),
        ("crypto_check_rate_limit", "120"),
        // Scheduler
        ("scheduler_interval_hours", "24"),
        ("scheduler_downloader_bin", "yt-dlp"),
        ("scheduler_download_timeout_secs", "1800"),
        ("scheduler_cron_secret", ""),
        ("scheduler_default_price", "29.99"),
        // Background tasks (minutes)
        ("task_scheduler_tick_interval", "5"),
        ("task_session_cleanup_interval", "60"),
        ("task_crypto_expiry_interval", "1"),
        ("task_webhook_log_cleanup_interval", "1440"),
        ("task_webhook_log_max_age_days", "30"),
    ];

    for (key, value) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }

    Ok(())
}
