//! Common helper functions for setting output
//!
//! The functions are used by the subcommands to write their results either to
//! a file or to stdout.

use std::fs::File;
use std::io::{stdout, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::Result;

/// Set a buffered stream to write to.
///
/// Either a file (if [`Some`] and not `-`) or stdout otherwise.
pub fn set_ostream(opath: &Option<String>) -> Result<BufWriter<Box<dyn Write>>> {
    let out_writer = match opath.as_deref() {
        Some(path) if path != "-" => Box::new(File::create(Path::new(path))?) as Box<dyn Write>,
        _ => Box::new(stdout()) as Box<dyn Write>,
    };
    Ok(BufWriter::new(out_writer))
}

/// Seconds since the Unix epoch, 0 if the clock is before it
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `<output_dir>/<prefix>_<stamp>_benchmark_<len>.json`
pub fn results_path(output_dir: &str, prefix: &str, stamp: u64, len: usize) -> PathBuf {
    let mut path = PathBuf::from(output_dir);
    path.push(format!("{prefix}_{stamp}_benchmark_{len}.json"));
    path
}

/// Writes `value` as pretty JSON, creating the parent directory if needed.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    log::info!("Saved {}", path.display());
    Ok(())
}
