use std::path::{Path, PathBuf};

use crate::build::build_types::{BuildContext, VENDORS_DIR};
use crate::compiler::{Resolution, ResolveArgs, ResolveHook};
use crate::config::Format;
use crate::helpers;
use crate::resolve::ResolutionError;
use crate::resolve::extension_mapper::ExtensionMapper;
use crate::vendor::VendorBundler;

/// The per-build resolve hook: applies import replacement, externalization,
/// vendor redirection, alias rewriting, extension mapping and bundling-mode
/// path absolutization, in that order, first applicable rule winning.
pub struct ImportResolutionPlugin<'a> {
    ctx: &'a BuildContext,
    vendors: &'a VendorBundler,
    format: Format,
    ext_map: ExtensionMapper,
    /// Output file of the compilation unit being built; vendor and
    /// replacement redirects are expressed relative to its directory.
    outfile: PathBuf,
    bundle: bool,
}

impl<'a> ImportResolutionPlugin<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        vendors: &'a VendorBundler,
        format: Format,
        outfile: &Path,
        bundle: bool,
    ) -> Self {
        Self {
            ctx,
            vendors,
            format,
            ext_map: ctx.ext_map.with_format(format.default_ext()),
            outfile: outfile.to_path_buf(),
            bundle,
        }
    }

    fn out_dir(&self) -> &Path {
        self.outfile.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// Path of a vendor's pre-bundled output, relative to the importing
    /// file's output directory.
    fn vendor_redirect(&self, name: &str) -> String {
        let vendor_file = self
            .ctx
            .format_dir(self.format)
            .join(VENDORS_DIR)
            .join(format!("{name}{}", self.ext_map.default_ext()));
        let relative = helpers::relative_path(self.out_dir(), &vendor_file);
        helpers::as_relative(&helpers::to_specifier(&relative))
    }

    /// Probe an extensionless path against the ordered extension list.
    fn probe_with_ext(&self, path: &Path) -> Option<PathBuf> {
        let rendered = path.to_string_lossy();
        for ext in helpers::EXTENSION_PROBE_ORDER {
            let candidate = PathBuf::from(format!("{rendered}{ext}"));
            if self.ctx.fs_cache.file_exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn probe_index_file(&self, dir: &Path) -> Option<PathBuf> {
        self.probe_with_ext(&dir.join("index"))
    }

    /// Swap in the isomorphic substitute when bundling pulls a logical
    /// module into the graph.
    fn isomorphic_entry(&self, path: PathBuf) -> PathBuf {
        if self.ctx.isomorphic.is_isomorphic(&path) {
            self.ctx.isomorphic.resolve(&path, self.format)
        } else {
            path
        }
    }

    fn resolve_relative(
        &self,
        specifier: &str,
        resolve_dir: &Path,
    ) -> Result<Option<Resolution>, ResolutionError> {
        let abs_import = helpers::normalize(&resolve_dir.join(specifier));

        // A trailing extension only counts once the file actually exists;
        // "./util.service" with no such file on disk still probes
        // "./util.service.ts" and friends.
        let import_ext = if self.ctx.fs_cache.file_exists(&abs_import) {
            helpers::extension_of(&abs_import).unwrap_or_default()
        } else {
            String::new()
        };

        if import_ext.is_empty() {
            if self.ctx.fs_cache.is_directory(&abs_import) {
                // Import points at a directory: redirect to its index file.
                if self.bundle {
                    let index = self
                        .probe_index_file(&abs_import)
                        .ok_or_else(|| ResolutionError::NoIndexFile(abs_import.clone()))?;
                    return Ok(Some(Resolution::Resolved {
                        path: self.isomorphic_entry(index).to_string_lossy().to_string(),
                        external: false,
                    }));
                }
                return Ok(Some(Resolution::Resolved {
                    path: format!(
                        "{}/index{}",
                        specifier.trim_end_matches('/'),
                        self.ext_map.default_ext()
                    ),
                    external: true,
                }));
            }

            if self.bundle {
                let probed = self.probe_with_ext(&abs_import).ok_or_else(|| {
                    ResolutionError::Unresolvable {
                        specifier: specifier.to_string(),
                        importer: abs_import.clone(),
                    }
                })?;
                return Ok(Some(Resolution::Resolved {
                    path: self.isomorphic_entry(probed).to_string_lossy().to_string(),
                    external: false,
                }));
            }
            return Ok(Some(Resolution::Resolved {
                path: format!("{specifier}{}", self.ext_map.default_ext()),
                external: true,
            }));
        }

        if self.bundle {
            return Ok(Some(Resolution::Resolved {
                path: self.isomorphic_entry(abs_import).to_string_lossy().to_string(),
                external: false,
            }));
        }

        if let Some(mapped) = self.ext_map.output_ext(&import_ext) {
            return Ok(Some(Resolution::Resolved {
                path: helpers::change_ext(specifier, &mapped),
                external: true,
            }));
        }

        // Unmapped extension: fall through to the compiler's own loader.
        Ok(None)
    }
}

/// Apply the configured literal import replacement, if any. A relative
/// replacement is re-expressed relative to the importing file's output
/// location; a package replacement substitutes the specifier as-is.
pub fn replacement_for(ctx: &BuildContext, format: Format, outfile: &Path, specifier: &str) -> Option<String> {
    let replace_with = ctx.config.replace_imports.get(specifier)?;

    if replace_with.starts_with('.') {
        let mapper = ctx.ext_map.with_format(format.default_ext());
        let ext = helpers::extension_of(Path::new(replace_with)).unwrap_or_default();
        let mapped = mapper.output_ext(&ext).unwrap_or(ext);
        let target_out = ctx
            .format_dir(format)
            .join(helpers::change_ext(replace_with.trim_start_matches("./"), &mapped));
        let out_dir = outfile.parent().unwrap_or_else(|| Path::new("/"));
        let relative = helpers::relative_path(out_dir, &target_out);
        Some(helpers::as_relative(&helpers::to_specifier(&relative)))
    } else {
        Some(replace_with.clone())
    }
}

impl ResolveHook for ImportResolutionPlugin<'_> {
    fn on_resolve(&self, args: &ResolveArgs) -> Result<Option<Resolution>, ResolutionError> {
        let original = args.specifier;
        let mut specifier = original.to_string();

        // 1. Import replacement.
        if let Some(replaced) = replacement_for(self.ctx, self.format, &self.outfile, original) {
            if replaced.starts_with('.') {
                // Already re-expressed against the output tree; final.
                return Ok(Some(Resolution::Resolved {
                    path: replaced,
                    external: true,
                }));
            }
            specifier = replaced;
        }

        // 2. External check, against the original specifier.
        if self.ctx.config.is_external(original) {
            return Ok(Some(Resolution::Resolved {
                path: specifier,
                external: true,
            }));
        }

        // 3. Vendor check.
        if self.ctx.config.is_vendor(&specifier) {
            self.vendors.add_vendors(std::slice::from_ref(&specifier));
            return Ok(Some(Resolution::Resolved {
                path: self.vendor_redirect(&specifier),
                external: true,
            }));
        }

        // 4. Alias expansion, then continue as a relative import.
        if self.ctx.aliases.is_alias(&specifier) {
            let expanded = self.ctx.aliases.replace_alias_pattern(&specifier)?;
            let abs = self.ctx.config.src_dir.join(&expanded);
            let relative = helpers::relative_path(args.resolve_dir, &abs);
            specifier = helpers::as_relative(&helpers::to_specifier(&relative));
        }

        // 5. Relative-path resolution.
        if specifier.starts_with('.') {
            return self.resolve_relative(&specifier, args.resolve_dir);
        }

        // 6. Bare package specifier.
        if self.bundle {
            return Ok(Some(Resolution::Delegate));
        }
        Ok(Some(Resolution::Resolved {
            path: specifier,
            external: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_types::tests::test_pool;
    use crate::compiler::ImportKind;
    use crate::config::tests::{CreateConfigArgs, create_raw};
    use crate::config::{BuildConfig, VendorsSpec};
    use crate::worker::CacheMode;
    use std::fs;

    fn context(raw: crate::config::RawConfig, base: &Path) -> BuildContext {
        let config = BuildConfig::from_raw(raw, base).unwrap();
        BuildContext::new(config, test_pool(), CacheMode::Uncached).unwrap()
    }

    fn resolve(
        ctx: &BuildContext,
        vendors: &VendorBundler,
        format: Format,
        bundle: bool,
        specifier: &str,
        importer: &Path,
    ) -> Result<Option<Resolution>, ResolutionError> {
        let outfile = ctx.output_file(importer, format);
        let plugin = ImportResolutionPlugin::new(ctx, vendors, format, &outfile, bundle);
        let resolve_dir = importer.parent().unwrap().to_path_buf();
        plugin.on_resolve(&ResolveArgs {
            specifier,
            importer,
            resolve_dir: &resolve_dir,
            kind: ImportKind::ImportStatement,
        })
    }

    fn external(path: &str) -> Option<Resolution> {
        Some(Resolution::Resolved {
            path: path.to_string(),
            external: true,
        })
    }

    struct Project {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn project(files: &[&str]) -> Project {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        for file in files {
            let path = root.join("src").join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "export {};\n").unwrap();
        }
        Project { _dir: dir, root }
    }

    fn raw_for(project: &Project) -> crate::config::RawConfig {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.src_dir = project.root.join("src").to_string_lossy().to_string();
        raw.out_dir = project.root.join("dist").to_string_lossy().to_string();
        raw
    }

    #[test]
    fn alias_imports_map_per_format() {
        let project = project(&["feature/mod.ts", "lib/util.ts"]);
        let mut raw = raw_for(&project);
        raw.path_aliases.insert("@X/*".to_string(), "./lib/*".to_string());
        let ctx = context(raw, &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs, Format::Esm]);
        let importer = ctx.config.src_dir.join("feature/mod.ts");

        let cjs = resolve(&ctx, &vendors, Format::Cjs, false, "@X/util", &importer).unwrap();
        assert_eq!(cjs, external("../lib/util.cjs"));

        let esm = resolve(&ctx, &vendors, Format::Esm, false, "@X/util", &importer).unwrap();
        assert_eq!(esm, external("../lib/util.mjs"));
    }

    #[test]
    fn relative_import_with_known_extension_is_mapped_and_externalized() {
        let project = project(&["a.ts", "b.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, false, "./b.ts", &importer).unwrap();
        assert_eq!(result, external("./b.cjs"));
    }

    #[test]
    fn extensionless_relative_import_gets_the_format_extension() {
        let project = project(&["a.ts", "b.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Esm]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Esm, false, "./b", &importer).unwrap();
        assert_eq!(result, external("./b.mjs"));
    }

    #[test]
    fn directory_import_redirects_to_its_index() {
        let project = project(&["a.ts", "common/index.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, false, "./common", &importer).unwrap();
        assert_eq!(result, external("./common/index.cjs"));
    }

    #[test]
    fn directory_import_without_index_fails_under_bundling() {
        let project = project(&["a.ts", "common/other.css"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, true, "./common", &importer);
        assert!(matches!(result, Err(ResolutionError::NoIndexFile(_))));
    }

    #[test]
    fn bundling_resolves_relative_imports_to_absolute_paths() {
        let project = project(&["a.ts", "b.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, true, "./b", &importer).unwrap();
        match result {
            Some(Resolution::Resolved { path, external }) => {
                assert!(!external);
                assert_eq!(PathBuf::from(path), ctx.config.src_dir.join("b.ts"));
            }
            other => panic!("expected inlined resolution, got {other:?}"),
        }
    }

    #[test]
    fn probe_order_prefers_typescript_sources() {
        let project = project(&["a.ts", "b.ts", "b.js"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, true, "./b", &importer).unwrap();
        match result {
            Some(Resolution::Resolved { path, .. }) => {
                assert_eq!(PathBuf::from(path), ctx.config.src_dir.join("b.ts"));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn externals_keep_their_specifier() {
        let project = project(&["a.ts"]);
        let mut raw = raw_for(&project);
        raw.external = vec![crate::config::ExternalSpec::Exact("lodash".to_string())];
        let ctx = context(raw, &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, false, "lodash", &importer).unwrap();
        assert_eq!(result, external("lodash"));
        assert_eq!(vendors.take_pending().len(), 0);
    }

    #[test]
    fn vendor_import_is_redirected_and_scheduled_once() {
        let project = project(&["a.ts", "deep/b.ts"]);
        let mut raw = raw_for(&project);
        raw.compile_vendors = Some(VendorsSpec::List(vec!["lodash".to_string()]));
        let ctx = context(raw, &project.root);
        let vendors = VendorBundler::new(vec![Format::Esm]);

        let importer = ctx.config.src_dir.join("a.ts");
        let result = resolve(&ctx, &vendors, Format::Esm, false, "lodash", &importer).unwrap();
        assert_eq!(result, external("./_vendors/lodash.mjs"));

        let nested = ctx.config.src_dir.join("deep/b.ts");
        let result = resolve(&ctx, &vendors, Format::Esm, false, "lodash", &nested).unwrap();
        assert_eq!(result, external("../_vendors/lodash.mjs"));

        // Two imports, one scheduled job.
        assert_eq!(vendors.take_pending().len(), 1);
    }

    #[test]
    fn bare_specifiers_stay_external_outside_bundling() {
        let project = project(&["a.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, false, "lodash", &importer).unwrap();
        assert_eq!(result, external("lodash"));
    }

    #[test]
    fn bare_specifiers_delegate_to_the_host_when_bundling() {
        let project = project(&["a.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, true, "lodash", &importer).unwrap();
        assert_eq!(result, Some(Resolution::Delegate));
    }

    #[test]
    fn package_replacement_substitutes_and_continues() {
        let project = project(&["a.ts"]);
        let mut raw = raw_for(&project);
        raw.replace_imports.insert("old-pkg".to_string(), "new-pkg".to_string());
        let ctx = context(raw, &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let result = resolve(&ctx, &vendors, Format::Cjs, false, "old-pkg", &importer).unwrap();
        assert_eq!(result, external("new-pkg"));
    }

    #[test]
    fn relative_replacement_targets_the_output_tree() {
        let project = project(&["feature/a.ts", "shims/crypto.ts"]);
        let mut raw = raw_for(&project);
        raw.replace_imports
            .insert("crypto".to_string(), "./shims/crypto.ts".to_string());
        let ctx = context(raw, &project.root);
        let vendors = VendorBundler::new(vec![Format::Esm]);
        let importer = ctx.config.src_dir.join("feature/a.ts");

        let result = resolve(&ctx, &vendors, Format::Esm, false, "crypto", &importer).unwrap();
        assert_eq!(result, external("../shims/crypto.mjs"));
    }

    #[test]
    fn resolution_is_idempotent_for_fixed_config_and_filesystem() {
        let project = project(&["a.ts", "b.ts"]);
        let ctx = context(raw_for(&project), &project.root);
        let vendors = VendorBundler::new(vec![Format::Cjs]);
        let importer = ctx.config.src_dir.join("a.ts");

        let first = resolve(&ctx, &vendors, Format::Cjs, false, "./b", &importer).unwrap();
        let second = resolve(&ctx, &vendors, Format::Cjs, false, "./b", &importer).unwrap();
        assert_eq!(first, second);
    }
}
