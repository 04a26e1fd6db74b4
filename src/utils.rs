use std::path::PathBuf;

/// Well-known locations under the platform data directory.
#[derive(Debug, Clone)]
pub struct StandardPaths {
    pub base_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub memory_file: PathBuf,
}

/// Resolves the application directories.
///
/// - Windows: `%APPDATA%/tabletalk`
/// - macOS: `~/Library/Application Support/tabletalk`
/// - Linux: `~/.local/share/tabletalk`
///
/// Falls back to the system temp dir when no data dir is known.
pub fn standard_paths() -> StandardPaths {
    let base_dir = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tabletalk");
    StandardPaths {
        logs_dir: base_dir.join("logs"),
        memory_file: base_dir.join("memory.jsonl"),
        base_dir,
    }
}

/// Formats an optional f64 to 4 decimal places, or returns "—" if None or non-finite.
pub fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) if x.is_finite() => format!("{x:.4}"),
        _ => "—".to_owned(),
    }
}

pub fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS.get(unit).copied().unwrap_or("B"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_opt() {
        assert_eq!(fmt_opt(Some(1.23456)), "1.2346");
        assert_eq!(fmt_opt(None), "—");
        assert_eq!(fmt_opt(Some(f64::NAN)), "—");
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(150 * 1024 * 1024), "150.0 MB");
    }

    #[test]
    fn test_standard_paths_layout() {
        let paths = standard_paths();
        assert!(paths.base_dir.ends_with("tabletalk"));
        assert!(paths.memory_file.starts_with(&paths.base_dir));
    }
}
