use ahash::AHashSet;
use anyhow::{Result, anyhow};
use regex::Regex;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::config::ModuleKind;
use crate::helpers;
use crate::resolve::ResolutionError;

/// Why an import specifier is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    ImportStatement,
    RequireCall,
    DynamicImport,
}

/// Arguments handed to the resolve hook for every import specifier
/// encountered during compilation.
pub struct ResolveArgs<'a> {
    pub specifier: &'a str,
    pub importer: &'a Path,
    pub resolve_dir: &'a Path,
    pub kind: ImportKind,
}

/// Outcome of one resolve-hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Final path for the import. External imports are left as references in
    /// the output; non-external results are inlined when bundling.
    Resolved { path: String, external: bool },
    /// Hand the specifier back to the host resolver.
    Delegate,
}

pub trait ResolveHook: Sync {
    /// Returns `None` to fall through to the default behavior.
    fn on_resolve(&self, args: &ResolveArgs) -> Result<Option<Resolution>, ResolutionError>;
}

pub trait LoadHook: Sync {
    /// Returns transformed source text for `path`, or `None` to load the
    /// file as-is.
    fn on_load(&self, path: &Path) -> Result<Option<String>>;
}

/// Load hook that never transforms.
pub struct DefaultLoad;

impl LoadHook for DefaultLoad {
    fn on_load(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }
}

/// One compiler invocation: a single entry compiled to a single output file.
pub struct BuildRequest<'a> {
    pub entry: &'a Path,
    /// Synthetic entry source; when set, `entry` is only used as the
    /// importer identity and resolve dir anchor.
    pub entry_source: Option<&'a str>,
    pub outfile: &'a Path,
    pub module_kind: ModuleKind,
    pub bundle: bool,
    pub banner: Option<String>,
    pub footer: Option<String>,
}

/// The narrow boundary to the JS/TS compiler toolchain. Parsing, lowering
/// and code generation live behind this trait; the orchestrator only drives
/// it with resolve/load hooks attached.
pub trait Toolchain: Send + Sync {
    fn build(&self, request: &BuildRequest, resolve: &dyn ResolveHook, load: &dyn LoadHook) -> Result<()>;
}

struct ImportSpan {
    /// Byte range of the quoted specifier content.
    range: Range<usize>,
    specifier: String,
    kind: ImportKind,
}

fn from_clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:import|export)\s[^;]*?\bfrom\s*(?:"([^"]+)"|'([^']+)')"#).unwrap())
}

fn side_effect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"import\s*(?:"([^"]+)"|'([^']+)')"#).unwrap())
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\b(require|import)\s*\(\s*(?:"([^"]+)"|'([^']+)')\s*\)"#).unwrap())
}

fn scan_imports(source: &str) -> Vec<ImportSpan> {
    let mut spans: Vec<ImportSpan> = Vec::new();

    let mut push = |range: Range<usize>, specifier: &str, kind: ImportKind| {
        if spans.iter().all(|span| span.range.start != range.start) {
            spans.push(ImportSpan {
                range,
                specifier: specifier.to_string(),
                kind,
            });
        }
    };

    for captures in from_clause_re().captures_iter(source) {
        if let Some(m) = captures.get(1).or_else(|| captures.get(2)) {
            push(m.range(), m.as_str(), ImportKind::ImportStatement);
        }
    }
    for captures in side_effect_re().captures_iter(source) {
        if let Some(m) = captures.get(1).or_else(|| captures.get(2)) {
            push(m.range(), m.as_str(), ImportKind::ImportStatement);
        }
    }
    for captures in call_re().captures_iter(source) {
        let kind = match captures.get(1).map(|m| m.as_str()) {
            Some("require") => ImportKind::RequireCall,
            _ => ImportKind::DynamicImport,
        };
        if let Some(m) = captures.get(2).or_else(|| captures.get(3)) {
            push(m.range(), m.as_str(), kind);
        }
    }

    spans.sort_by_key(|span| span.range.start);
    spans
}

/// Reference toolchain: transplants each source file to its output location
/// while rewriting every import specifier through the resolve hook. Syntax
/// lowering is not its job; a production deployment points [`Toolchain`] at
/// a real compiler.
pub struct RewriteToolchain;

impl RewriteToolchain {
    pub fn new() -> Self {
        Self
    }

    fn load_source(&self, path: &Path, load: &dyn LoadHook) -> Result<String> {
        if let Some(transformed) = load.on_load(path)? {
            return Ok(transformed);
        }
        fs::read_to_string(path).map_err(|e| anyhow!("could not read {}: {e}", path.display()))
    }

    fn rewrite_module(
        &self,
        entry: &Path,
        source: &str,
        resolve: &dyn ResolveHook,
    ) -> Result<(String, Vec<(String, PathBuf)>)> {
        let resolve_dir = entry.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        let spans = scan_imports(source);

        let mut output = String::with_capacity(source.len());
        let mut cursor = 0usize;
        let mut inlined: Vec<(String, PathBuf)> = Vec::new();

        for span in spans {
            output.push_str(&source[cursor..span.range.start]);

            let args = ResolveArgs {
                specifier: &span.specifier,
                importer: entry,
                resolve_dir: &resolve_dir,
                kind: span.kind,
            };
            let resolution = resolve.on_resolve(&args)?;

            match resolution {
                Some(Resolution::Resolved { path, external: true }) => output.push_str(&path),
                Some(Resolution::Resolved { path, external: false }) => {
                    inlined.push((span.specifier.clone(), PathBuf::from(&path)));
                    output.push_str(&path);
                }
                Some(Resolution::Delegate) => {
                    let target = host_resolve(&span.specifier, &resolve_dir)?;
                    inlined.push((span.specifier.clone(), target.clone()));
                    output.push_str(&target.to_string_lossy());
                }
                None => output.push_str(&span.specifier),
            }

            cursor = span.range.end;
        }
        output.push_str(&source[cursor..]);

        Ok((output, inlined))
    }

    fn inline_graph(
        &self,
        entry: &Path,
        entry_source: Option<&str>,
        resolve: &dyn ResolveHook,
        load: &dyn LoadHook,
        visited: &mut AHashSet<PathBuf>,
        output: &mut String,
    ) -> Result<()> {
        let source = match entry_source {
            Some(source) => source.to_string(),
            None => self.load_source(entry, load)?,
        };

        let (rewritten, inlined) = self.rewrite_module(entry, &source, resolve)?;

        let mut body = rewritten;
        for (_, target) in &inlined {
            let normalized = helpers::normalize(target);
            if visited.insert(normalized.clone()) {
                self.inline_graph(&normalized, None, resolve, load, visited, output)?;
            }
            // The inlined module's code now precedes this one; its import
            // statement is dropped from the body.
            body = strip_import_of(&body, &target.to_string_lossy());
        }

        output.push_str(&body);
        if !body.ends_with('\n') {
            output.push('\n');
        }
        Ok(())
    }
}

impl Default for RewriteToolchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove import/require statements whose specifier equals `path`.
fn strip_import_of(source: &str, path: &str) -> String {
    source
        .lines()
        .filter(|line| !(line.contains(path) && (line.contains("import") || line.contains("require") || line.contains("export"))))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Toolchain for RewriteToolchain {
    fn build(&self, request: &BuildRequest, resolve: &dyn ResolveHook, load: &dyn LoadHook) -> Result<()> {
        let mut code = String::new();

        if request.bundle {
            let mut visited = AHashSet::new();
            visited.insert(helpers::normalize(request.entry));
            self.inline_graph(
                request.entry,
                request.entry_source,
                resolve,
                load,
                &mut visited,
                &mut code,
            )?;
        } else {
            let source = match request.entry_source {
                Some(source) => source.to_string(),
                None => self.load_source(request.entry, load)?,
            };
            let is_js = helpers::is_parsable(request.entry, helpers::JS_EXTENSIONS);
            code = if is_js || request.entry_source.is_some() {
                self.rewrite_module(request.entry, &source, resolve)?.0
            } else {
                // Loader extensions (.json, .txt, .data) pass through.
                source
            };
        }

        let mut out = String::new();
        if let Some(banner) = &request.banner {
            out.push_str(banner);
            out.push('\n');
        }
        out.push_str(&code);
        if let Some(footer) = &request.footer {
            out.push_str(footer);
            out.push('\n');
        }

        helpers::ensure_parent_dir(request.outfile)?;
        fs::write(request.outfile, out)
            .map_err(|e| anyhow!("could not write {}: {e}", request.outfile.display()))?;
        Ok(())
    }
}

/// Locate a bare package specifier the way the host module resolver would:
/// walk `node_modules` directories upward from `resolve_dir`.
pub fn host_resolve(specifier: &str, resolve_dir: &Path) -> Result<PathBuf, ResolutionError> {
    let (package, subpath) = split_package_specifier(specifier);

    let mut dir = Some(resolve_dir);
    while let Some(current) = dir {
        let package_dir = current.join("node_modules").join(package);
        if package_dir.is_dir() {
            return resolve_in_package(&package_dir, subpath)
                .ok_or_else(|| ResolutionError::PackageNotFound(specifier.to_string()));
        }
        dir = current.parent();
    }

    Err(ResolutionError::PackageNotFound(specifier.to_string()))
}

fn split_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    let segments_in_name = if specifier.starts_with('@') { 2 } else { 1 };
    let mut separators = specifier.match_indices('/').skip(segments_in_name - 1);
    match separators.next() {
        Some((idx, _)) => (&specifier[..idx], Some(&specifier[idx + 1..])),
        None => (specifier, None),
    }
}

fn resolve_in_package(package_dir: &Path, subpath: Option<&str>) -> Option<PathBuf> {
    match subpath {
        Some(subpath) => {
            let candidate = package_dir.join(subpath);
            if candidate.is_file() {
                return Some(candidate);
            }
            for ext in helpers::EXTENSION_PROBE_ORDER {
                let with_ext = package_dir.join(format!("{subpath}{ext}"));
                if with_ext.is_file() {
                    return Some(with_ext);
                }
            }
            None
        }
        None => {
            let manifest = package_dir.join("package.json");
            if let Ok(contents) = fs::read_to_string(&manifest)
                && let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents)
            {
                for field in ["module", "main"] {
                    if let Some(rel) = json.get(field).and_then(|v| v.as_str()) {
                        let candidate = package_dir.join(rel);
                        if candidate.is_file() {
                            return Some(candidate);
                        }
                    }
                }
            }
            let fallback = package_dir.join("index.js");
            fallback.is_file().then_some(fallback)
        }
    }
}
