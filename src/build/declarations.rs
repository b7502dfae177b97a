use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::build::build_types::BuildContext;
use crate::helpers;
use crate::resolve::path_alias::PathAliasResolver;
use crate::worker::DeclarationOptions;

/// Emit type declarations for every requested format and rewrite aliased
/// imports inside the emitted `.d.ts` files, since the declaration emitter
/// has no notion of the configured path aliases.
pub fn emit_declarations(ctx: &BuildContext) -> Result<()> {
    for format in ctx.config.formats.iter() {
        let types_dir = ctx.format_dir(format).join("types");

        ctx.pool.emit_declarations(DeclarationOptions {
            ts_config: ctx.config.ts_config.clone(),
            src_dir: ctx.config.src_dir.clone(),
            out_dir: types_dir.clone(),
            target: ctx.config.target.clone(),
        })?;

        if !ctx.config.path_aliases.is_empty() {
            rewrite_declaration_paths(&ctx.aliases, &types_dir)?;
        }
    }
    Ok(())
}

fn import_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(import|export).+from\s*"(.+?)""#).unwrap())
}

/// Rewrite one declaration line: an aliased `from "..."` specifier becomes
/// a relative path under the types tree.
fn rewrite_import_line(aliases: &PathAliasResolver, types_dir: &Path, line: &str, resolve_dir: &Path) -> String {
    let Some(captures) = import_line_re().captures(line) else {
        return line.to_string();
    };
    let Some(import_path) = captures.get(2).map(|m| m.as_str()) else {
        return line.to_string();
    };

    if !aliases.is_alias(import_path) {
        return line.to_string();
    }

    let Ok(expanded) = aliases.replace_alias_pattern(import_path) else {
        return line.to_string();
    };
    let abs_import = types_dir.join(expanded);
    let relative = helpers::relative_path(resolve_dir, &abs_import);
    let new_import = helpers::as_relative(&helpers::to_specifier(&relative));
    line.replace(import_path, &new_import)
}

fn rewrite_declaration_file(aliases: &PathAliasResolver, types_dir: &Path, file: &Path) -> Result<()> {
    let content =
        fs::read_to_string(file).with_context(|| format!("reading declaration file {}", file.display()))?;
    let resolve_dir = file.parent().unwrap_or(types_dir);

    let rewritten: Vec<String> = content
        .lines()
        .map(|line| {
            if line.contains("import") || line.contains("export") {
                rewrite_import_line(aliases, types_dir, line, resolve_dir)
            } else {
                line.to_string()
            }
        })
        .collect();

    fs::write(file, rewritten.join("\n"))
        .with_context(|| format!("writing declaration file {}", file.display()))
}

pub fn rewrite_declaration_paths(aliases: &PathAliasResolver, types_dir: &Path) -> Result<()> {
    for file in helpers::read_files_recursive(types_dir) {
        if file.to_string_lossy().ends_with(".d.ts") {
            rewrite_declaration_file(aliases, types_dir, &file)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases(entries: &[(&str, &str)]) -> PathAliasResolver {
        let entries: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PathAliasResolver::new(&entries).unwrap()
    }

    #[test]
    fn rewrites_aliased_imports_to_relative_paths() {
        let aliases = aliases(&[("@Utils/*", "./utils/*")]);
        let types_dir = Path::new("/dist/cjs/types");
        let resolve_dir = Path::new("/dist/cjs/types/feature");

        let line = rewrite_import_line(
            &aliases,
            types_dir,
            "import { helper } from \"@Utils/helper\";",
            resolve_dir,
        );
        assert_eq!(line, "import { helper } from \"../utils/helper\";");
    }

    #[test]
    fn leaves_non_alias_imports_untouched() {
        let aliases = aliases(&[("@Utils/*", "./utils/*")]);
        let types_dir = Path::new("/dist/cjs/types");

        let line = "import { x } from \"./local\";";
        assert_eq!(rewrite_import_line(&aliases, types_dir, line, types_dir), line);

        let bare = "import lodash from \"lodash\";";
        assert_eq!(rewrite_import_line(&aliases, types_dir, bare, types_dir), bare);
    }

    #[test]
    fn rewrites_every_declaration_file_under_the_types_tree() {
        let dir = tempfile::tempdir().unwrap();
        let types_dir = dir.path().join("types");
        std::fs::create_dir_all(types_dir.join("feature")).unwrap();
        std::fs::write(
            types_dir.join("feature/mod.d.ts"),
            "export { helper } from \"@Utils/helper\";\nexport declare const x: number;\n",
        )
        .unwrap();

        let aliases = aliases(&[("@Utils/*", "./utils/*")]);
        rewrite_declaration_paths(&aliases, &types_dir).unwrap();

        let rewritten = std::fs::read_to_string(types_dir.join("feature/mod.d.ts")).unwrap();
        assert!(rewritten.contains("\"../utils/helper\""), "got: {rewritten}");
        assert!(rewritten.contains("export declare const x"));
    }
}
