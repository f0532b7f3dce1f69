//! Simulated modeller file traffic.
//!
//! The modeller runs on its own cadence; tests stand in for it by consuming sink files and
//! writing source files. Both helpers push the mtime forward explicitly so change detection
//! never depends on file system timestamp granularity.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

const MTIME_STEP: Duration = Duration::from_secs(1);

fn advanced_mtime(file: &File) -> Result<SystemTime> {
    let current = file.metadata()?.modified()?;
    Ok(current.max(SystemTime::now()) + MTIME_STEP)
}

/// Consume a sink file the way the modeller does: read it, then clear it.
///
/// Returns what was read.
pub fn consume_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("truncating {}", path.display()))?;
    let mtime = advanced_mtime(&file)?;
    file.set_modified(mtime)
        .with_context(|| format!("advancing mtime of {}", path.display()))?;
    Ok(content)
}

/// Replace a source file's content the way the modeller does.
pub fn modeler_write(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    let mtime = advanced_mtime(&file)?;
    file.set_modified(mtime)
        .with_context(|| format!("advancing mtime of {}", path.display()))?;
    Ok(())
}
