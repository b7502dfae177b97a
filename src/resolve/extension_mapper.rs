use ahash::AHashMap;

/// Sentinel extension-map target that resolves to the current format's
/// default extension.
pub const FORMAT_SENTINEL: &str = "%FORMAT%";

/// Pure lookup table from input extensions to output extensions. Bound to a
/// format via [`ExtensionMapper::with_format`]; the formatless base mapper
/// only carries the user table.
#[derive(Debug, Clone)]
pub struct ExtensionMapper {
    table: AHashMap<String, String>,
    format_ext: Option<String>,
}

impl ExtensionMapper {
    pub fn new(table: AHashMap<String, String>) -> Self {
        Self {
            table,
            format_ext: None,
        }
    }

    /// Re-instantiate the mapper for a format. The format's default
    /// extension becomes the target of the passthrough loaders (`.js`,
    /// `.json`, `.txt`, `.data`) and the resolution of [`FORMAT_SENTINEL`].
    pub fn with_format(&self, default_ext: &str) -> ExtensionMapper {
        let mut table = self.table.clone();
        for ext in [".js", ".json", ".txt", ".data"] {
            table.insert(ext.to_string(), default_ext.to_string());
        }
        ExtensionMapper {
            table,
            format_ext: Some(default_ext.to_string()),
        }
    }

    /// The bound format's default extension. Falls back to `.js` for an
    /// unbound mapper.
    pub fn default_ext(&self) -> &str {
        self.format_ext.as_deref().unwrap_or(".js")
    }

    pub fn has_mapping(&self, ext: &str) -> bool {
        self.table.contains_key(ext)
    }

    /// Map an extension; unmapped extensions pass through unchanged.
    pub fn map(&self, ext: &str) -> String {
        let mapped = self.table.get(ext).map(String::as_str).unwrap_or(ext);
        if mapped == FORMAT_SENTINEL {
            return self.format_ext.clone().unwrap_or_else(|| ext.to_string());
        }
        mapped.to_string()
    }

    /// The extension a compiled file carries in the output tree: the mapped
    /// extension when a mapping exists, the format default for source
    /// extensions the compiler swallows (`.ts` never survives compilation),
    /// `None` for everything else.
    pub fn output_ext(&self, ext: &str) -> Option<String> {
        if self.has_mapping(ext) {
            return Some(self.map(ext));
        }
        if crate::helpers::JS_EXTENSIONS.contains(&ext) {
            return Some(self.default_ext().to_string());
        }
        None
    }
}
