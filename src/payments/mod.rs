pub mod crypto;
pub mod stripe;

use std::time::Duration;

/// Run `op` up to `attempts` times, sleeping `pause` between tries.
/// The last error is returned if every attempt fails.
pub fn with_retry<T, F>(label: &str, attempts: u32, pause: Duration, mut op: F) -> Result<T, String>
where
    F: FnMut() -> Result<T, String>,
{
    let attempts = attempts.max(1);
    let mut last_err = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < attempts {
                    log::warn!("{} failed (attempt {}/{}): {}, retrying", label, attempt, attempts, e);
                    if !pause.is_zero() {
                        std::thread::sleep(pause);
                    }
                }
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Shared blocking HTTP client with a per-request timeout.
pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, String> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("beatstore/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| e.to_string())
}
