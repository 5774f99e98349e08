//! Track ingestion from YouTube channels and playlists.
//!
//! The scheduler is a single state row (active flag, next run, version)
//! plus a list of sources. A run is claimed by advancing `next_run` with a
//! compare-and-swap on the version, so two overlapping triggers (cron and
//! the background tick, or two admins) never both process the sources.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;

use crate::db::DbPool;
use crate::models::scheduler::{self as store, SchedulerError, SchedulerSource, SchedulerState};
use crate::models::settings::Setting;
use crate::models::track::{import_manifests, TrackForm};

/// Fetches new uploads for a source and describes them as track manifests.
pub trait Downloader: Send + Sync {
    fn fetch(&self, source: &SchedulerSource, dest: &Path) -> Result<Vec<TrackForm>, String>;
}

/// Runs yt-dlp out of process. Audio lands in `dest/<source id>/` with an
/// `.info.json` per video; a download archive stops repeat downloads.
/// A run that outlives `timeout` is killed and reported as failed.
pub struct YtDlp {
    pub bin: String,
    pub max_items: u32,
    pub timeout: StdDuration,
}

impl YtDlp {
    pub fn from_settings(pool: &DbPool) -> Self {
        let secs = Setting::get_i64(pool, "scheduler_download_timeout_secs").clamp(30, 6 * 3600);
        YtDlp {
            bin: Setting::get_or(pool, "scheduler_downloader_bin", "yt-dlp"),
            max_items: 25,
            timeout: StdDuration::from_secs(secs as u64),
        }
    }
}

/// Wait for `child` until `timeout` has passed, then kill it.
/// `Ok(None)` means the process was killed.
pub fn wait_with_deadline(child: &mut Child, timeout: StdDuration) -> Result<Option<ExitStatus>, String> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(|e| e.to_string())? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                log::warn!("[scheduler] could not kill pid {}: {}", child.id(), e);
            }
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(StdDuration::from_millis(200));
    }
}

/// Map a yt-dlp info document to a draft track.
pub fn manifest_from_info(info: &Value, audio: Option<&Path>) -> Option<TrackForm> {
    let title = info.get("title")?.as_str()?.trim().to_string();
    if title.is_empty() {
        return None;
    }
    let str_field = |k: &str| info.get(k).and_then(|v| v.as_str()).map(String::from);
    let source_url = str_field("webpage_url").or_else(|| {
        str_field("id").map(|id| format!("https://www.youtube.com/watch?v={}", id))
    })?;
    let tags = info
        .get("tags")
        .and_then(|t| t.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str()).collect::<Vec<_>>().join(","));

    Some(TrackForm {
        title,
        artist: str_field("artist").or_else(|| str_field("uploader")).or_else(|| str_field("channel")),
        duration_secs: info.get("duration").and_then(|d| d.as_f64()).map(|d| d.round() as i64),
        cover_url: str_field("thumbnail"),
        preview_url: audio.map(|p| p.to_string_lossy().into_owned()),
        tags,
        status: Some("draft".to_string()),
        source: Some("youtube".to_string()),
        source_url: Some(source_url),
        ..Default::default()
    })
}

impl Downloader for YtDlp {
    fn fetch(&self, source: &SchedulerSource, dest: &Path) -> Result<Vec<TrackForm>, String> {
        let dir = dest.join(&source.id);
        fs::create_dir_all(&dir).map_err(|e| format!("Cannot create {}: {}", dir.display(), e))?;

        // stderr goes to a file: a full pipe would stall the child until the deadline.
        let log_path = dir.join("yt-dlp.log");
        let log_file = fs::File::create(&log_path).map_err(|e| format!("Cannot create {}: {}", log_path.display(), e))?;

        let mut child = Command::new(&self.bin)
            .arg("--extract-audio")
            .args(["--audio-format", "mp3"])
            .arg("--write-info-json")
            .arg("--no-progress")
            .args(["--socket-timeout", "30"])
            .args(["--playlist-end", &self.max_items.to_string()])
            .arg("--download-archive")
            .arg(dir.join("archive.txt"))
            .arg("-o")
            .arg(dir.join("%(id)s.%(ext)s"))
            .arg(&source.url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .spawn()
            .map_err(|e| format!("Cannot run {}: {}", self.bin, e))?;

        let status = match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                return Err(format!(
                    "{} killed after {}s without finishing",
                    self.bin,
                    self.timeout.as_secs()
                ))
            }
        };
        if !status.success() {
            let stderr = fs::read_to_string(&log_path).unwrap_or_default();
            let last = stderr.lines().last().unwrap_or("no output");
            return Err(format!("{} exited with {}: {}", self.bin, status, last));
        }
        Ok(read_manifests(&dir))
    }
}

/// Collect manifests from every `*.info.json` in `dir`.
pub fn read_manifests(dir: &Path) -> Vec<TrackForm> {
    let Ok(entries) = fs::read_dir(dir) else {
        return vec![];
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".info.json") else {
            continue;
        };
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(info) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let audio: PathBuf = dir.join(format!("{}.mp3", stem));
        let audio = audio.exists().then_some(audio);
        if let Some(m) = manifest_from_info(&info, audio.as_deref()) {
            out.push(m);
        }
    }
    out.sort_by(|a, b| a.title.cmp(&b.title));
    out
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub ran: bool,
    pub sources: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub next_run: Option<NaiveDateTime>,
}

fn interval(pool: &DbPool) -> Duration {
    Duration::hours(Setting::get_i64(pool, "scheduler_interval_hours").clamp(1, 24 * 30))
}

/// Turn the scheduler on or off. Enabling schedules the first run one
/// interval from `now`. `expected_version` guards against stale clients.
pub fn toggle(
    pool: &DbPool,
    snapshot_path: &Path,
    expected_version: Option<i64>,
    now: NaiveDateTime,
) -> Result<SchedulerState, SchedulerError> {
    let state = SchedulerState::load(pool)?;
    if expected_version.is_some_and(|v| v != state.version) {
        return Err(SchedulerError::Conflict);
    }
    let active = !state.active;
    let next_run = if active {
        Some(now + interval(pool))
    } else {
        state.next_run
    };
    let updated = SchedulerState::write(pool, state.version, active, next_run)?;
    store::log(
        pool,
        "info",
        if active { "Scheduler enabled" } else { "Scheduler disabled" },
    );
    store::write_snapshot(pool, snapshot_path);
    Ok(updated)
}

/// Process every active source if the scheduler is due (or `force` is set)
/// and move `next_run` one interval past `now`.
pub fn run_if_due(
    pool: &DbPool,
    downloader: &dyn Downloader,
    downloads_dir: &Path,
    snapshot_path: &Path,
    now: NaiveDateTime,
    force: bool,
) -> Result<RunReport, SchedulerError> {
    let state = SchedulerState::load(pool)?;
    if !force && !state.is_due(now) {
        return Ok(RunReport {
            ran: false,
            next_run: state.next_run,
            ..Default::default()
        });
    }

    // Claim the run. A concurrent trigger that read the same version loses.
    let next = now + interval(pool);
    let claimed = SchedulerState::write(pool, state.version, state.active, Some(next))?;

    let default_price = {
        let p = Setting::get_f64(pool, "scheduler_default_price");
        if p > 0.0 {
            p
        } else {
            29.99
        }
    };
    let sources = store::active_sources(pool);
    let mut report = RunReport {
        ran: true,
        sources: sources.len(),
        next_run: claimed.next_run,
        ..Default::default()
    };
    store::log(
        pool,
        "info",
        &format!("Run started{} with {} active sources", if force { " (forced)" } else { "" }, sources.len()),
    );

    for source in &sources {
        match downloader.fetch(source, downloads_dir) {
            Ok(manifests) => {
                let imported = import_manifests(pool, &manifests, default_price);
                report.imported += imported.imported.len();
                report.skipped += imported.skipped;
                for e in &imported.errors {
                    store::log(pool, "warn", &format!("{}: {}", source.url, e));
                }
                report.errors.extend(imported.errors);
                store::log(
                    pool,
                    "info",
                    &format!(
                        "{}: {} new, {} already in catalog",
                        source.url,
                        imported.imported.len(),
                        imported.skipped
                    ),
                );
            }
            Err(e) => {
                store::log(pool, "error", &format!("{}: {}", source.url, e));
                report.errors.push(format!("{}: {}", source.url, e));
            }
        }
        if let Err(e) = store::mark_checked(pool, &source.id, now) {
            report.errors.push(format!("{}: {}", source.url, e));
        }
    }

    store::log(
        pool,
        "info",
        &format!(
            "Run finished: {} imported, next run at {}",
            report.imported,
            next.format("%Y-%m-%d %H:%M UTC")
        ),
    );
    store::write_snapshot(pool, snapshot_path);
    Ok(report)
}
