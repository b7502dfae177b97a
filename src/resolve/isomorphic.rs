use ahash::{AHashMap, AHashSet};
use std::path::{Path, PathBuf};

use crate::config::{Format, IsomorphicEntry};
use crate::helpers;

/// Maps a logical source file to its format-specific substitute files.
///
/// A substitute exists only to deputize for the logical file under one
/// format; it must never be scheduled for compilation on its own, which is
/// what [`IsomorphicImportMapper::is_isomorphic_target`] guards.
pub struct IsomorphicImportMapper {
    src_dir: PathBuf,
    /// normalized logical path (relative to src root) -> per-format substitutes
    mappings: AHashMap<PathBuf, FormatSubstitutes>,
    targets: AHashSet<PathBuf>,
}

#[derive(Default)]
struct FormatSubstitutes {
    cjs: Option<PathBuf>,
    esm: Option<PathBuf>,
    legacy: Option<PathBuf>,
}

impl FormatSubstitutes {
    fn for_format(&self, format: Format) -> Option<&PathBuf> {
        match format {
            Format::Cjs => self.cjs.as_ref(),
            Format::Esm => self.esm.as_ref(),
            Format::Legacy => self.legacy.as_ref(),
        }
    }
}

impl IsomorphicImportMapper {
    pub fn new(isomorphic_imports: &AHashMap<String, IsomorphicEntry>, src_dir: &Path) -> Self {
        let mut mappings = AHashMap::new();
        let mut targets = AHashSet::new();

        for (logical, entry) in isomorphic_imports {
            let mut normalize_value = |value: &Option<String>| -> Option<PathBuf> {
                let normalized = helpers::normalize(Path::new(value.as_deref()?));
                targets.insert(normalized.clone());
                Some(normalized)
            };

            let substitutes = FormatSubstitutes {
                cjs: normalize_value(&entry.cjs),
                esm: normalize_value(&entry.mjs),
                legacy: normalize_value(&entry.js),
            };
            mappings.insert(helpers::normalize(Path::new(logical)), substitutes);
        }

        Self {
            src_dir: src_dir.to_path_buf(),
            mappings,
            targets,
        }
    }

    /// Normalize a path into the root-relative form the tables are keyed by.
    /// Accepts both absolute paths (resolved against the source root) and
    /// already-relative ones.
    fn as_key(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            helpers::relative_path(&self.src_dir, path)
        } else {
            helpers::normalize(path)
        }
    }

    /// True for a file that exists only as a format-specific substitute.
    pub fn is_isomorphic_target(&self, path: &Path) -> bool {
        self.targets.contains(&self.as_key(path))
    }

    pub fn is_isomorphic(&self, logical: &Path) -> bool {
        self.mappings.contains_key(&self.as_key(logical))
    }

    /// The file to compile for `logical` under `format`. Falls back to the
    /// logical path itself when no substitute is registered for the format.
    pub fn resolve(&self, logical: &Path, format: Format) -> PathBuf {
        let substitute = self
            .mappings
            .get(&self.as_key(logical))
            .and_then(|subs| subs.for_format(format));

        match substitute {
            Some(substitute) if logical.is_absolute() => self.src_dir.join(substitute),
            Some(substitute) => substitute.clone(),
            None => logical.to_path_buf(),
        }
    }
}
