use log::{error, info, warn};
use std::fs;
use std::path::Path;
use std::process;

/// Subdirectories of the data dir created if missing. The first three
/// must be writable; downloads only matter once the scheduler runs.
const REQUIRED_DIRS: &[&str] = &["db", "licenses", "scheduler"];
const OPTIONAL_DIRS: &[&str] = &["downloads"];

fn writable(dir: &Path) -> Result<(), std::io::Error> {
    let test_file = dir.join(".write_test");
    fs::write(&test_file, "test")?;
    let _ = fs::remove_file(&test_file);
    Ok(())
}

/// Run all boot checks. Call this before Rocket launches.
/// Creates missing directories and aborts if the database or license
/// directories cannot be written.
pub fn run(data_dir: &Path) {
    info!("Beatstore boot check starting (data dir: {})...", data_dir.display());

    let mut warnings = 0u32;
    let mut errors = 0u32;

    // ── 1. Directories ─────────────────────────────────
    for dir in REQUIRED_DIRS.iter().chain(OPTIONAL_DIRS) {
        let path = data_dir.join(dir);
        if !path.exists() {
            match fs::create_dir_all(&path) {
                Ok(_) => info!("  Created directory: {}", path.display()),
                Err(e) => {
                    error!("  FAILED to create directory {}: {}", path.display(), e);
                    errors += 1;
                }
            }
        }
    }

    // ── 2. Writable ────────────────────────────────────
    for dir in REQUIRED_DIRS {
        let path = data_dir.join(dir);
        if path.exists() {
            if let Err(e) = writable(&path) {
                error!("  Directory not writable: {} ({})", path.display(), e);
                errors += 1;
            }
        }
    }
    for dir in OPTIONAL_DIRS {
        let path = data_dir.join(dir);
        if path.exists() {
            if let Err(e) = writable(&path) {
                warn!("  Downloads directory not writable: {} (scheduler imports will fail)", e);
                warnings += 1;
            }
        }
    }

    // ── 3. Rocket.toml exists ───────────────────────────
    if !Path::new("Rocket.toml").exists() {
        warn!("  Rocket.toml not found, using default config");
        warnings += 1;
    }

    // ── Summary ─────────────────────────────────────────
    if errors > 0 {
        error!(
            "Boot check FAILED: {} error(s), {} warning(s). Aborting.",
            errors, warnings
        );
        process::exit(1);
    }

    if warnings > 0 {
        warn!(
            "Boot check passed with {} warning(s). Some features may not work correctly.",
            warnings
        );
    } else {
        info!("Boot check passed. All systems go.");
    }
}
