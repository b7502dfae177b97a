use ahash::AHashMap;
use anyhow::{Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::compiler::{DefaultLoad, LoadHook};
use crate::config::{BuildConfig, ConfigError, Format, Snippet};
use crate::helpers;
use crate::resolve::exclude::ExcludeFilter;
use crate::resolve::extension_mapper::ExtensionMapper;
use crate::resolve::isomorphic::IsomorphicImportMapper;
use crate::resolve::path_alias::PathAliasResolver;
use crate::worker::{CacheMode, DecoratorPrePass, TranspileWorkerPool};

/// Filesystem probe cache scoped to one build session. Watch sessions run
/// `Uncached` so a path whose content changed between events is re-probed.
pub struct FsCache {
    mode: CacheMode,
    exists: Mutex<AHashMap<PathBuf, bool>>,
    dirs: Mutex<AHashMap<PathBuf, bool>>,
}

impl FsCache {
    pub fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            exists: Mutex::new(AHashMap::new()),
            dirs: Mutex::new(AHashMap::new()),
        }
    }

    pub fn file_exists(&self, path: &Path) -> bool {
        if self.mode == CacheMode::Uncached {
            return path.is_file();
        }
        let mut cache = self.exists.lock().unwrap_or_else(|e| e.into_inner());
        *cache.entry(path.to_path_buf()).or_insert_with(|| path.is_file())
    }

    pub fn is_directory(&self, path: &Path) -> bool {
        if self.mode == CacheMode::Uncached {
            return path.is_dir();
        }
        let mut cache = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
        *cache.entry(path.to_path_buf()).or_insert_with(|| path.is_dir())
    }
}

/// A (source file, output format) pair with its derived output path.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// The logical source file the unit stands for.
    pub source: PathBuf,
    /// The file actually handed to the compiler; differs from `source` when
    /// an isomorphic substitute deputizes for it under this format.
    pub entry: PathBuf,
    pub format: Format,
    pub outfile: PathBuf,
}

/// Everything a build pass needs, constructed once from configuration and
/// discarded at build end.
pub struct BuildContext {
    pub config: BuildConfig,
    pub aliases: PathAliasResolver,
    pub excludes: ExcludeFilter,
    pub ext_map: ExtensionMapper,
    pub isomorphic: IsomorphicImportMapper,
    pub fs_cache: FsCache,
    pub pool: Arc<TranspileWorkerPool>,
    pre_pass: Option<DecoratorPrePass>,
}

pub const VENDORS_DIR: &str = "_vendors";

static DEFAULT_LOAD: DefaultLoad = DefaultLoad;

impl BuildContext {
    pub fn new(
        config: BuildConfig,
        pool: Arc<TranspileWorkerPool>,
        cache_mode: CacheMode,
    ) -> Result<Self, ConfigError> {
        let aliases = PathAliasResolver::new(&config.path_aliases)?;
        let excludes = ExcludeFilter::new(config.exclude.clone());
        let ext_map = ExtensionMapper::new(config.ext_mapping.clone());
        let isomorphic = IsomorphicImportMapper::new(&config.isomorphic_imports, &config.src_dir);
        let pre_pass = config
            .decorators_metadata
            .then(|| DecoratorPrePass::new(Arc::clone(&pool), cache_mode));

        Ok(Self {
            aliases,
            excludes,
            ext_map,
            isomorphic,
            fs_cache: FsCache::new(cache_mode),
            pool,
            pre_pass,
            config,
        })
    }

    pub fn load_hook(&self) -> &dyn LoadHook {
        match &self.pre_pass {
            Some(pre_pass) => pre_pass,
            None => &DEFAULT_LOAD,
        }
    }

    /// The output subtree for one format.
    pub fn format_dir(&self, format: Format) -> PathBuf {
        self.config.out_dir.join(format.dir_name())
    }

    /// Inclusion predicate for the source walk: not excluded, parsable by
    /// extension or covered by an extension-map entry, and not an
    /// isomorphic substitute.
    pub fn should_compile(&self, path: &Path) -> bool {
        let parsable: Vec<&str> = self.config.parsable_extensions.iter().map(String::as_str).collect();
        self.excludes.is_not_excluded(path)
            && (helpers::is_parsable(path, &parsable)
                || helpers::extension_of(path).is_some_and(|ext| self.ext_map.has_mapping(&ext)))
            && !self.isomorphic.is_isomorphic_target(path)
    }

    /// Output path for a source file under a format: mirrors the source
    /// tree's relative structure with the extension mapped.
    pub fn output_file(&self, source: &Path, format: Format) -> PathBuf {
        let relative = helpers::relative_path(&self.config.src_dir, source);
        let mapper = self.ext_map.with_format(format.default_ext());
        let ext = helpers::extension_of(source).unwrap_or_default();
        let out_ext = mapper.output_ext(&ext).unwrap_or_else(|| format.default_ext().to_string());
        let mapped = helpers::change_ext(&helpers::to_specifier(&relative), &out_ext);
        self.format_dir(format).join(mapped)
    }

    /// Derive the compilation unit for a (source, format) pair. The entry
    /// swaps in the isomorphic substitute when one is registered; the
    /// output path always derives from the logical source so importers of
    /// the logical module reach the per-format implementation.
    pub fn unit(&self, source: &Path, format: Format) -> CompilationUnit {
        CompilationUnit {
            source: source.to_path_buf(),
            entry: self.isomorphic.resolve(source, format),
            format,
            outfile: self.output_file(source, format),
        }
    }

    /// Materialize a banner/footer snippet: inline text as-is, file
    /// references read relative to the source root.
    pub fn snippet_text(&self, snippet: &Snippet) -> Result<String> {
        match snippet {
            Snippet::Text { text } => Ok(text.clone()),
            Snippet::File { file } => {
                let path = self.config.src_dir.join(file);
                fs::read_to_string(&path)
                    .map_err(|e| anyhow!("could not read banner/footer file {}: {e}", path.display()))
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::tests::{CreateConfigArgs, create_raw};
    use crate::worker::{DeclarationOptions, ParseRequest, TranspileBackend};

    struct NoopBackend;

    impl TranspileBackend for NoopBackend {
        fn parse_file(&self, request: &ParseRequest) -> Result<String, String> {
            Ok(request.file_content.clone())
        }

        fn emit_declarations(&self, _options: &DeclarationOptions) -> Result<(), String> {
            Ok(())
        }
    }

    pub fn test_pool() -> Arc<TranspileWorkerPool> {
        Arc::new(TranspileWorkerPool::with_size(Arc::new(NoopBackend), 1))
    }

    fn context_with(raw: crate::config::RawConfig) -> BuildContext {
        let config = BuildConfig::from_raw(raw, Path::new("/project")).unwrap();
        BuildContext::new(config, test_pool(), CacheMode::Cached).unwrap()
    }

    #[test]
    fn output_file_mirrors_the_source_tree_per_format() {
        let ctx = context_with(create_raw(CreateConfigArgs::default()));

        assert_eq!(
            ctx.output_file(Path::new("/project/src/lib/util.ts"), Format::Cjs),
            PathBuf::from("/project/dist/cjs/lib/util.cjs")
        );
        assert_eq!(
            ctx.output_file(Path::new("/project/src/lib/util.ts"), Format::Esm),
            PathBuf::from("/project/dist/esm/lib/util.mjs")
        );
        assert_eq!(
            ctx.output_file(Path::new("/project/src/lib/util.ts"), Format::Legacy),
            PathBuf::from("/project/dist/legacy/lib/util.js")
        );
    }

    #[test]
    fn should_compile_excludes_isomorphic_substitutes() {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.isomorphic_imports.insert(
            "./index.ts".to_string(),
            crate::config::IsomorphicEntry {
                cjs: Some("./index.cjs.ts".to_string()),
                mjs: None,
                js: None,
            },
        );
        let ctx = context_with(raw);

        assert!(ctx.should_compile(Path::new("/project/src/index.ts")));
        assert!(!ctx.should_compile(Path::new("/project/src/index.cjs.ts")));
    }

    #[test]
    fn should_compile_honors_exclude_patterns_and_extensions() {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.exclude = vec![r"\.test\.".to_string()];
        let ctx = context_with(raw);

        assert!(ctx.should_compile(Path::new("/project/src/a.ts")));
        assert!(!ctx.should_compile(Path::new("/project/src/a.test.ts")));
        assert!(!ctx.should_compile(Path::new("/project/src/readme.md")));
    }

    #[test]
    fn ext_map_entries_extend_compilable_files() {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.ext_mapping.insert(".vue".to_string(), "%FORMAT%".to_string());
        let ctx = context_with(raw);

        assert!(ctx.should_compile(Path::new("/project/src/app.vue")));
    }

    #[test]
    fn unit_swaps_in_the_isomorphic_entry_but_keeps_the_logical_outfile() {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.isomorphic_imports.insert(
            "./index.ts".to_string(),
            crate::config::IsomorphicEntry {
                cjs: Some("./index.cjs.ts".to_string()),
                mjs: None,
                js: None,
            },
        );
        let ctx = context_with(raw);

        let unit = ctx.unit(Path::new("/project/src/index.ts"), Format::Cjs);
        assert_eq!(unit.entry, PathBuf::from("/project/src/index.cjs.ts"));
        assert_eq!(unit.outfile, PathBuf::from("/project/dist/cjs/index.cjs"));

        let esm_unit = ctx.unit(Path::new("/project/src/index.ts"), Format::Esm);
        assert_eq!(esm_unit.entry, PathBuf::from("/project/src/index.ts"));
    }
}
