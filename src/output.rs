// src/output.rs

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Reduces a requested name to letters, digits, space, `-`, `_` and `.`,
/// trimming trailing whitespace. An empty result becomes
/// `download_<timestamp>` based on `now`.
pub fn safe_filename(requested: &str, now: DateTime<Local>) -> String {
    let kept: String = requested
        .chars()
        .filter(|&c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .collect();
    let kept = kept.trim_end();
    if kept.is_empty() {
        format!("download_{}", now.format("%Y%m%d_%H%M%S"))
    } else {
        kept.to_string()
    }
}

/// Template handed to the engine; it substitutes the final extension.
pub fn output_template(dir: &Path, safe_name: &str) -> PathBuf {
    dir.join(format!("{safe_name}.%(ext)s"))
}

/// Finds the file the engine produced for `safe_name` inside `dir`.
///
/// Best effort: the first regular file (by name) starting with `safe_name`
/// wins, ignoring the engine's partial/temporary leftovers. Jobs writing
/// similar names into the same directory can pick up each other's file.
pub async fn locate_output(dir: &Path, safe_name: &str) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(safe_name) || name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        if entry.file_type().await?.is_file() {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}
