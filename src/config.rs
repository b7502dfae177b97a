use ahash::AHashMap;
use anyhow::{Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// One of the module output flavors produced in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Cjs,
    Esm,
    Legacy,
}

impl Format {
    /// All formats in their canonical pass order.
    pub const ALL: [Format; 3] = [Format::Cjs, Format::Esm, Format::Legacy];

    /// Default output extension for this format.
    pub fn default_ext(&self) -> &'static str {
        match self {
            Format::Cjs => ".cjs",
            Format::Esm => ".mjs",
            Format::Legacy => ".js",
        }
    }

    /// Subdirectory of the output root this format writes into.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Format::Cjs => "cjs",
            Format::Esm => "esm",
            Format::Legacy => "legacy",
        }
    }

    /// The module system the toolchain emits for this format. Legacy output
    /// is CommonJS under a plain `.js` extension.
    pub fn module_kind(&self) -> ModuleKind {
        match self {
            Format::Esm => ModuleKind::EsModule,
            Format::Cjs | Format::Legacy => ModuleKind::CommonJs,
        }
    }

    fn from_spelling(value: &str) -> Option<Format> {
        match value {
            "cjs" | "commonjs" => Some(Format::Cjs),
            "esm" | "esmodules" => Some(Format::Esm),
            "legacy" => Some(Format::Legacy),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    CommonJs,
    EsModule,
}

/// Declaration output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeclarationsMode {
    #[default]
    Off,
    Alongside,
    Only,
}

/// Configuration failures detected before any compilation starts.
#[derive(Debug)]
pub enum ConfigError {
    InvalidAliasKey(String),
    InvalidAliasValue { key: String, value: String },
    AmbiguousAlias { first: String, second: String },
    MissingEntrypoint,
    RelativeDir { field: &'static str, value: String },
    UnknownFormat(String),
    NoFormats,
    InvalidPattern { pattern: String, error: regex::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidAliasKey(key) => {
                write!(f, "path alias \"{key}\" must end with \"/*\"")
            }
            ConfigError::InvalidAliasValue { key, value } => write!(
                f,
                "path alias value \"{value}\" for \"{key}\" must start with \"./\" and end with \"/*\""
            ),
            ConfigError::AmbiguousAlias { first, second } => write!(
                f,
                "path aliases \"{first}\" and \"{second}\" overlap; overlapping alias prefixes are not supported"
            ),
            ConfigError::MissingEntrypoint => {
                write!(f, "`entrypoint` must be provided when bundling is enabled")
            }
            ConfigError::RelativeDir { field, value } => {
                write!(f, "`{field}` must be an absolute path, got \"{value}\"")
            }
            ConfigError::UnknownFormat(format) => write!(f, "unknown output format \"{format}\""),
            ConfigError::NoFormats => write!(f, "`formats` must name at least one output format"),
            ConfigError::InvalidPattern { pattern, error } => {
                write!(f, "invalid pattern \"{pattern}\": {error}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// An external-package matcher: either an exact specifier or a pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExternalSpec {
    Exact(String),
    Pattern { pattern: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VendorsSpec {
    All(String),
    List(Vec<String>),
}

/// Banner or footer content: inline text or a file under the source root.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Snippet {
    Text { text: String },
    File { file: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsomorphicEntry {
    pub cjs: Option<String>,
    pub mjs: Option<String>,
    pub js: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Presets {
    pub node: bool,
    pub deno: bool,
    pub gjs: bool,
}

/// The raw, serde-shaped configuration as written in `jspack.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub formats: Vec<String>,
    pub src_dir: String,
    pub out_dir: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub bundle: bool,
    #[serde(default)]
    pub declarations: Option<serde_json::Value>,
    #[serde(default)]
    pub ext_mapping: AHashMap<String, String>,
    #[serde(default)]
    pub path_aliases: AHashMap<String, String>,
    #[serde(default)]
    pub isomorphic_imports: AHashMap<String, IsomorphicEntry>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub external: Vec<ExternalSpec>,
    #[serde(default)]
    pub compile_vendors: Option<VendorsSpec>,
    #[serde(default)]
    pub replace_imports: AHashMap<String, String>,
    #[serde(default)]
    pub banner: AHashMap<String, Snippet>,
    #[serde(default)]
    pub footer: AHashMap<String, Snippet>,
    #[serde(default)]
    pub decorators_metadata: bool,
    #[serde(default)]
    pub preset: Option<Presets>,
    #[serde(default)]
    pub ts_config: Option<String>,
    #[serde(default)]
    pub ts_compiler: Option<String>,
    #[serde(default)]
    pub parsable_extensions: Option<Vec<String>>,
}

enum ExternalMatcher {
    Exact(String),
    Pattern(Regex),
}

/// How vendor packages are selected.
pub enum VendorMode {
    None,
    List(Vec<String>),
    All,
}

/// Validated, immutable build configuration. Constructed once at build
/// start; read-only thereafter.
pub struct BuildConfig {
    pub formats: FormatsFacade,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub target: Option<String>,
    pub entrypoint: Option<PathBuf>,
    pub bundle: bool,
    pub declarations: DeclarationsMode,
    pub ext_mapping: AHashMap<String, String>,
    pub path_aliases: Vec<(String, String)>,
    pub isomorphic_imports: AHashMap<String, IsomorphicEntry>,
    pub exclude: Vec<Regex>,
    pub replace_imports: AHashMap<String, String>,
    pub decorators_metadata: bool,
    pub ts_config: Option<PathBuf>,
    pub ts_compiler: Option<PathBuf>,
    pub parsable_extensions: Vec<String>,
    vendor_mode: VendorMode,
    vendor_set: ahash::AHashSet<String>,
    externals: Vec<ExternalMatcher>,
    banner: Vec<(Regex, Snippet)>,
    footer: Vec<(Regex, Snippet)>,
}

/// Which formats were requested, exposed as simple flags.
pub struct FormatsFacade {
    requested: Vec<Format>,
}

impl FormatsFacade {
    pub fn new(formats: Vec<Format>) -> Self {
        Self { requested: formats }
    }

    pub fn is_cjs(&self) -> bool {
        self.requested.contains(&Format::Cjs)
    }

    pub fn is_esm(&self) -> bool {
        self.requested.contains(&Format::Esm)
    }

    pub fn is_legacy(&self) -> bool {
        self.requested.contains(&Format::Legacy)
    }

    /// Requested formats in canonical pass order.
    pub fn iter(&self) -> impl Iterator<Item = Format> + '_ {
        Format::ALL.iter().copied().filter(|f| self.requested.contains(f))
    }
}

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "console", "crypto", "dns", "events", "fs", "http",
    "http2", "https", "module", "net", "os", "path", "perf_hooks", "process", "querystring", "readline",
    "stream", "string_decoder", "timers", "tls", "tty", "url", "util", "v8", "vm", "worker_threads", "zlib",
];

fn preset_externals(presets: &Presets) -> Vec<ExternalSpec> {
    let mut externals = Vec::new();
    if presets.node {
        externals.push(ExternalSpec::Pattern {
            pattern: "^node:.+".to_string(),
        });
        externals.extend(NODE_BUILTINS.iter().map(|name| ExternalSpec::Exact(name.to_string())));
    }
    if presets.deno {
        externals.push(ExternalSpec::Pattern {
            pattern: "^http(s?)://.+".to_string(),
        });
        externals.push(ExternalSpec::Pattern {
            pattern: "^npm:.+".to_string(),
        });
    }
    if presets.gjs {
        externals.push(ExternalSpec::Pattern {
            pattern: "^gi?://.+".to_string(),
        });
        for name in ["console", "gettext", "gi", "system"] {
            externals.push(ExternalSpec::Exact(name.to_string()));
        }
    }
    externals
}

fn parse_declarations(value: &Option<serde_json::Value>) -> DeclarationsMode {
    match value {
        Some(serde_json::Value::Bool(true)) => DeclarationsMode::Alongside,
        Some(serde_json::Value::String(s)) if s == "only" => DeclarationsMode::Only,
        _ => DeclarationsMode::Off,
    }
}

fn ensure_absolute(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::RelativeDir {
            field,
            value: path.to_string_lossy().to_string(),
        })
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|error| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        error,
    })
}

impl BuildConfig {
    /// Validate and freeze a raw configuration. Relative `srcDir`/`outDir`/
    /// `tsConfig` entries are resolved against `base_dir` first; afterwards
    /// they are required to be absolute.
    pub fn from_raw(raw: RawConfig, base_dir: &Path) -> Result<BuildConfig, ConfigError> {
        let mut formats = Vec::new();
        for spelling in &raw.formats {
            let format =
                Format::from_spelling(spelling).ok_or_else(|| ConfigError::UnknownFormat(spelling.clone()))?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            return Err(ConfigError::NoFormats);
        }

        let resolve_dir = |value: &str| -> PathBuf {
            let path = Path::new(value);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                crate::helpers::normalize(&base_dir.join(path))
            }
        };

        let src_dir = resolve_dir(&raw.src_dir);
        let out_dir = resolve_dir(&raw.out_dir);
        ensure_absolute("srcDir", &src_dir)?;
        ensure_absolute("outDir", &out_dir)?;

        let ts_config = raw.ts_config.as_deref().map(resolve_dir);
        if let Some(ts_config) = &ts_config {
            ensure_absolute("tsConfig", ts_config)?;
        }

        if raw.bundle && raw.entrypoint.is_none() {
            return Err(ConfigError::MissingEntrypoint);
        }

        let mut external_specs = raw.external.clone();
        if let Some(presets) = &raw.preset {
            external_specs.extend(preset_externals(presets));
        }
        let mut externals = Vec::new();
        for spec in &external_specs {
            externals.push(match spec {
                ExternalSpec::Exact(name) => ExternalMatcher::Exact(name.clone()),
                ExternalSpec::Pattern { pattern } => ExternalMatcher::Pattern(compile_pattern(pattern)?),
            });
        }

        let mut exclude = Vec::new();
        for pattern in &raw.exclude {
            exclude.push(compile_pattern(pattern)?);
        }

        let (vendor_mode, vendor_set) = match &raw.compile_vendors {
            None => (VendorMode::None, ahash::AHashSet::new()),
            Some(VendorsSpec::All(keyword)) if keyword == "all" => (VendorMode::All, ahash::AHashSet::new()),
            Some(VendorsSpec::All(other)) => {
                (VendorMode::List(vec![other.clone()]), [other.clone()].into_iter().collect())
            }
            Some(VendorsSpec::List(names)) => (
                VendorMode::List(names.clone()),
                names.iter().cloned().collect(),
            ),
        };

        let mut banner = Vec::new();
        for (pattern, snippet) in &raw.banner {
            banner.push((compile_pattern(pattern)?, snippet.clone()));
        }
        let mut footer = Vec::new();
        for (pattern, snippet) in &raw.footer {
            footer.push((compile_pattern(pattern)?, snippet.clone()));
        }

        let parsable_extensions = raw
            .parsable_extensions
            .clone()
            .unwrap_or_else(|| crate::helpers::parsable_extensions().iter().map(|s| s.to_string()).collect());

        Ok(BuildConfig {
            formats: FormatsFacade::new(formats),
            entrypoint: raw.entrypoint.as_ref().map(|e| src_dir.join(e)),
            bundle: raw.bundle,
            declarations: parse_declarations(&raw.declarations),
            ext_mapping: raw.ext_mapping,
            path_aliases: raw.path_aliases.into_iter().collect(),
            isomorphic_imports: raw.isomorphic_imports,
            exclude,
            replace_imports: raw.replace_imports,
            decorators_metadata: raw.decorators_metadata,
            ts_config,
            ts_compiler: raw.ts_compiler.map(PathBuf::from),
            parsable_extensions,
            vendor_mode,
            vendor_set,
            externals,
            banner,
            footer,
            target: raw.target,
            src_dir,
            out_dir,
        })
    }

    pub fn vendor_mode(&self) -> &VendorMode {
        &self.vendor_mode
    }

    /// Does the specifier match a configured external string or pattern?
    pub fn is_external(&self, specifier: &str) -> bool {
        self.externals.iter().any(|matcher| match matcher {
            ExternalMatcher::Exact(name) => name == specifier,
            ExternalMatcher::Pattern(pattern) => pattern.is_match(specifier),
        })
    }

    /// Is the specifier a vendor package? Only bare package imports qualify.
    pub fn is_vendor(&self, specifier: &str) -> bool {
        if specifier.starts_with('/') || specifier.starts_with('.') {
            return false;
        }
        match &self.vendor_mode {
            VendorMode::None => false,
            VendorMode::All => true,
            VendorMode::List(_) => self.vendor_set.contains(specifier),
        }
    }

    /// The banner and footer snippets whose patterns match `file`. Later
    /// matches win, mirroring a last-write-wins map scan.
    pub fn snippets_for(&self, file: &str) -> (Option<&Snippet>, Option<&Snippet>) {
        let mut banner = None;
        for (pattern, snippet) in &self.banner {
            if pattern.is_match(file) {
                banner = Some(snippet);
            }
        }
        let mut footer = None;
        for (pattern, snippet) in &self.footer {
            if pattern.is_match(file) {
                footer = Some(snippet);
            }
        }
        (banner, footer)
    }
}

/// Read and validate a `jspack.json` file.
pub fn read_config(config_path: &Path) -> Result<BuildConfig> {
    let contents = fs::read_to_string(config_path)
        .map_err(|e| anyhow!("could not read config at {}: {e}", config_path.display()))?;
    let raw: RawConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("could not parse {}: {e}", config_path.display()))?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    // The folder argument may be relative; the src/out dir invariant wants
    // an absolute anchor.
    let base_dir = base_dir.canonicalize().unwrap_or_else(|_| base_dir.to_path_buf());
    Ok(BuildConfig::from_raw(raw, &base_dir)?)
}

pub const CONFIG_FILENAME: &str = "jspack.json";
