use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "webm"];

pub fn is_supported_video(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

/// Expand user input into absolute video file paths.
///
/// Files are kept in input order; directories are walked (sorted by file
/// name) and contribute their supported files. Missing paths are skipped with
/// a warning.
pub fn resolve_media_paths(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for input in inputs {
        let abs = match std::path::absolute(input) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(path = %input.display(), "cannot resolve path: {err}");
                continue;
            }
        };
        if abs.is_file() {
            if is_supported_video(&abs) {
                out.push(abs);
            } else {
                tracing::debug!(path = %abs.display(), "skipping unsupported file");
            }
        } else if abs.is_dir() {
            for entry in WalkDir::new(&abs)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.is_file() && is_supported_video(path) {
                    out.push(path.to_path_buf());
                }
            }
        } else {
            tracing::warn!(path = %abs.display(), "path does not exist");
        }
    }
    out
}

pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size_bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} {}", UNITS[UNITS.len() - 1])
}
