use std::path::{Path, PathBuf};

/// Format bytes into a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Sanitize a filename by removing or replacing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    let mut sanitized: String = filename
        .chars()
        .map(|ch| if invalid_chars.contains(&ch) || ch.is_control() { '_' } else { ch })
        .collect();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        sanitized = "chunk".to_string();
    }
    if sanitized.len() > 255 {
        let mut cut = 252;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
    }
    sanitized
}

/// A path in `dir` for `filename` that does not exist yet.
///
/// `seg.mp4` becomes `seg_1.mp4`, `seg_2.mp4`, ... when taken.
pub fn unique_output_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = sanitize_filename(filename);
    let candidate = dir.join(&filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (filename.clone(), None),
    };
    (1u32..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
