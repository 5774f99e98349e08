use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::db::DbPool;
use crate::models::settings::Setting;
use crate::security::hash_ip;

/// Buckets with their limit setting. All share a 15 minute window.
pub const LOGIN: (&str, &str) = ("login", "login_rate_limit");
pub const SIGNUP: (&str, &str) = ("signup", "signup_rate_limit");
pub const DISCOUNT: (&str, &str) = ("discount", "discount_rate_limit");
pub const CRYPTO_CHECK: (&str, &str) = ("crypto_check", "crypto_check_rate_limit");

const WINDOW: Duration = Duration::from_secs(15 * 60);

/// Sliding-window limiter keyed by "<bucket>:<ip hash>".
pub struct RateLimiter {
    entries: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an attempt; false once `max_attempts` were already made inside `window`.
    pub fn check_and_record(&self, key: &str, max_attempts: u64, window: Duration) -> bool {
        let mut map = self.lock();
        let now = Instant::now();
        let attempts = map.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if (attempts.len() as u64) < max_attempts {
            attempts.push(now);
            true
        } else {
            false
        }
    }

    /// Apply a named bucket to a client, reading the limit from settings.
    pub fn allow(&self, pool: &DbPool, bucket: (&str, &str), client_ip: &str) -> bool {
        let (name, setting) = bucket;
        let max = Setting::get_i64(pool, setting).max(1) as u64;
        let key = format!("{}:{}", name, hash_ip(client_ip));
        self.check_and_record(&key, max, WINDOW)
    }

    /// Drop keys whose attempts are all older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let mut map = self.lock();
        let now = Instant::now();
        map.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < max_age);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}
