use rocket::fairing::{Fairing, Info, Kind};
use rocket::tokio;
use rocket::{Orbit, Rocket};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::checkout::crypto as crypto_flow;
use crate::config::DataDir;
use crate::db::DbPool;
use crate::models::profile::Session;
use crate::models::settings::Setting;
use crate::models::webhook_log::WebhookLog;
use crate::rate_limit::RateLimiter;
use crate::scheduler::{self, Downloader};

pub struct BackgroundTasks;

#[rocket::async_trait]
impl Fairing for BackgroundTasks {
    fn info(&self) -> Info {
        Info {
            name: "Background Tasks",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let (Some(pool), Some(dirs), Some(downloader), Some(limiter)) = (
            rocket.state::<DbPool>(),
            rocket.state::<DataDir>(),
            rocket.state::<Arc<dyn Downloader>>(),
            rocket.state::<Arc<RateLimiter>>(),
        ) else {
            log::error!("[task] managed state missing, background tasks not started");
            return;
        };

        // Scheduler tick. The run itself decides whether it is due.
        let p = pool.clone();
        let d = dirs.clone();
        let dl = Arc::clone(downloader);
        tokio::spawn(async move {
            loop {
                let interval = get_interval(&p, "task_scheduler_tick_interval", 5);
                tokio::time::sleep(Duration::from_secs(interval * 60)).await;
                let (p2, d2, dl2) = (p.clone(), d.clone(), Arc::clone(&dl));
                let result = tokio::task::spawn_blocking(move || {
                    scheduler::run_if_due(
                        &p2,
                        dl2.as_ref(),
                        &d2.downloads(),
                        &d2.scheduler_snapshot(),
                        Utc::now().naive_utc(),
                        false,
                    )
                })
                .await;
                match result {
                    Ok(Ok(report)) if report.ran => log::info!(
                        "[task] Scheduler run imported {} tracks from {} sources",
                        report.imported,
                        report.sources
                    ),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::warn!("[task] Scheduler tick skipped: {}", e),
                    Err(e) => log::error!("[task] Scheduler tick panicked: {}", e),
                }
            }
        });

        // Session cleanup task
        let p = pool.clone();
        tokio::spawn(async move {
            loop {
                let interval = get_interval(&p, "task_session_cleanup_interval", 60);
                tokio::time::sleep(Duration::from_secs(interval * 60)).await;
                match Session::cleanup_expired(&p) {
                    Ok(count) => {
                        if count > 0 {
                            log::info!("[task] Cleaned up {} expired sessions", count);
                        }
                    }
                    Err(e) => log::error!("[task] Session cleanup failed: {}", e),
                }
            }
        });

        // Crypto payment expiry
        let p = pool.clone();
        tokio::spawn(async move {
            loop {
                let interval = get_interval(&p, "task_crypto_expiry_interval", 1);
                tokio::time::sleep(Duration::from_secs(interval * 60)).await;
                let count = crypto_flow::expire_stale(&p, Utc::now());
                if count > 0 {
                    log::info!("[task] Expired {} stale crypto payments", count);
                }
            }
        });

        // Webhook log cleanup task
        let p = pool.clone();
        tokio::spawn(async move {
            loop {
                let interval = get_interval(&p, "task_webhook_log_cleanup_interval", 1440);
                tokio::time::sleep(Duration::from_secs(interval * 60)).await;
                let max_age = Setting::get_i64(&p, "task_webhook_log_max_age_days").max(1);
                match WebhookLog::cleanup(&p, max_age) {
                    Ok(count) => {
                        if count > 0 {
                            log::info!("[task] Cleaned up {} old webhook log entries", count);
                        }
                    }
                    Err(e) => log::error!("[task] Webhook log cleanup failed: {}", e),
                }
            }
        });

        // Rate limiter housekeeping
        let l = Arc::clone(limiter);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(15 * 60)).await;
                l.cleanup(Duration::from_secs(15 * 60));
            }
        });

        log::info!("[task] Background tasks started");
    }
}

fn get_interval(pool: &DbPool, key: &str, default: u64) -> u64 {
    Setting::get_or(pool, key, &default.to_string())
        .parse::<u64>()
        .unwrap_or(default)
        .max(1)
}
