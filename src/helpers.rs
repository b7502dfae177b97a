use std::fs;
use std::path::{Component, Path, PathBuf};

pub mod emojis {
    use console::Emoji;

    pub static SPARKLES: Emoji<'_, '_> = Emoji("✨ ", "");
    pub static EYES: Emoji<'_, '_> = Emoji("👀 ", "");
    pub const LINE_CLEAR: &str = "\x1b[2K\r";
}

/// Extensions the toolchain can parse directly.
pub const JS_EXTENSIONS: &[&str] = &[".ts", ".js", ".cjs", ".mjs", ".mts", ".cts", ".tsx", ".jsx"];

/// Extensions the toolchain supports as passthrough loaders.
pub const LOADER_EXTENSIONS: &[&str] = &[".json", ".txt", ".data"];

/// Probe order for extensionless relative imports.
pub const EXTENSION_PROBE_ORDER: &[&str] = &[".ts", ".mts", ".cts", ".js", ".mjs", ".cjs"];

pub fn parsable_extensions() -> Vec<&'static str> {
    let mut extensions = JS_EXTENSIONS.to_vec();
    extensions.extend_from_slice(LOADER_EXTENSIONS);
    extensions
}

/// The extension of a path including the leading dot, lowercased.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
}

pub fn is_parsable(path: &Path, parsable: &[&str]) -> bool {
    match extension_of(path) {
        Some(ext) => parsable.contains(&ext.as_str()),
        None => false,
    }
}

/// Swap the extension of `file` for `ext`, preserving a leading `./`.
pub fn change_ext(file: &str, ext: &str) -> String {
    let path = Path::new(file);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let result = match path.parent() {
        Some(parent) if parent != Path::new("") => {
            format!("{}/{}{}", to_specifier(parent), stem, ext)
        }
        _ => format!("{stem}{ext}"),
    };

    if file.starts_with("./") && !result.starts_with("./") {
        return format!("./{result}");
    }
    result
}

/// Prefix a bare relative path with `./` so module loaders treat it as a
/// filesystem path rather than a package name.
pub fn as_relative(path: &str) -> String {
    if path.starts_with('.') || path.starts_with('/') {
        path.to_string()
    } else {
        format!("./{path}")
    }
}

/// Render a path as an import specifier: forward slashes on every platform.
pub fn to_specifier(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Relative path from `from_dir` to `to`, computed lexically. Both inputs
/// must be absolute.
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from = normalize(from_dir);
    let to = normalize(to);

    let from_components: Vec<_> = from.components().collect();
    let to_components: Vec<_> = to.components().collect();

    let common = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..from_components.len() {
        result.push("..");
    }
    for component in &to_components[common..] {
        result.push(component);
    }
    result
}

/// Recursively collect every file under `dir`. Directories that vanish
/// mid-walk are skipped rather than reported.
pub fn read_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => files.extend(read_files_recursive(&path)),
            Ok(file_type) if file_type.is_file() => files.push(path),
            _ => {}
        }
    }
    files
}

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
