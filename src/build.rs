pub mod build_types;
pub mod declarations;

use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::compiler::{BuildRequest, Toolchain};
use crate::config::{BuildConfig, DeclarationsMode, Format, VendorMode};
use crate::helpers;
use crate::helpers::emojis::*;
use crate::vendor::VendorBundler;
use crate::worker::{CacheMode, TranspileWorkerPool, TscBackend};
use build_types::{BuildContext, CompilationUnit};

/// Construct the per-session build context: resolvers, caches, worker pool.
pub fn initialize_build(config: BuildConfig, cache_mode: CacheMode) -> Result<BuildContext> {
    let backend = Arc::new(TscBackend::new(config.ts_compiler.clone()));
    let pool = Arc::new(TranspileWorkerPool::new(backend));
    Ok(BuildContext::new(config, pool, cache_mode)?)
}

/// Every file under the source root that should be compiled.
pub fn enumerate_source_files(ctx: &BuildContext) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = helpers::read_files_recursive(&ctx.config.src_dir)
        .into_iter()
        .filter(|path| ctx.should_compile(path))
        .collect();
    files.sort();
    files
}

/// Compile one unit: attach the import-resolution plugin and invoke the
/// toolchain once.
pub fn build_unit(
    ctx: &BuildContext,
    vendors: &VendorBundler,
    toolchain: &dyn Toolchain,
    unit: &CompilationUnit,
    bundle: bool,
) -> Result<()> {
    let plugin =
        crate::resolve::plugin::ImportResolutionPlugin::new(ctx, vendors, unit.format, &unit.outfile, bundle);

    let source_id = helpers::to_specifier(&unit.source);
    let (banner, footer) = ctx.config.snippets_for(&source_id);
    let banner = banner.map(|snippet| ctx.snippet_text(snippet)).transpose()?;
    let footer = footer.map(|snippet| ctx.snippet_text(snippet)).transpose()?;

    let request = BuildRequest {
        entry: &unit.entry,
        entry_source: None,
        outfile: &unit.outfile,
        module_kind: unit.format.module_kind(),
        bundle,
        banner,
        footer,
    };
    toolchain
        .build(&request, &plugin, ctx.load_hook())
        .with_context(|| format!("compiling {} for {}", unit.source.display(), unit.format))
}

fn schedule_listed_vendors(ctx: &BuildContext, vendors: &VendorBundler) {
    if let VendorMode::List(names) = ctx.config.vendor_mode() {
        vendors.add_vendors(names);
    }
}

fn format_pass(
    ctx: &BuildContext,
    toolchain: &dyn Toolchain,
    vendors: &VendorBundler,
    files: &[PathBuf],
    format: Format,
    progress: Option<&ProgressBar>,
) -> Result<()> {
    files
        .par_iter()
        .map(|file| {
            let unit = ctx.unit(file, format);
            let result = build_unit(ctx, vendors, toolchain, &unit, false);
            if let Some(progress) = progress {
                progress.inc(1);
            }
            result
        })
        .collect::<Result<Vec<_>>>()?;

    schedule_listed_vendors(ctx, vendors);
    vendors.flush(ctx, toolchain)
}

fn bundle_pass(
    ctx: &BuildContext,
    toolchain: &dyn Toolchain,
    vendors: &VendorBundler,
    format: Format,
) -> Result<()> {
    let entrypoint = ctx
        .config
        .entrypoint
        .as_ref()
        .ok_or_else(|| anyhow!("`entrypoint` must be provided when bundling is enabled"))?;

    let unit = ctx.unit(entrypoint, format);
    build_unit(ctx, vendors, toolchain, &unit, true)?;

    schedule_listed_vendors(ctx, vendors);
    vendors.flush(ctx, toolchain)
}

/// Transpile the whole source tree (or bundle from the entrypoint) for
/// every requested format. All files of a format pass run in parallel and
/// any failure fails the pass; formats write to disjoint subtrees so output
/// of other formats is never corrupted.
pub fn transpile_source(ctx: &BuildContext, toolchain: &dyn Toolchain, show_progress: bool) -> Result<()> {
    let formats: Vec<Format> = ctx.config.formats.iter().collect();
    let vendors = VendorBundler::new(formats.clone());

    if ctx.config.bundle {
        for format in formats {
            bundle_pass(ctx, toolchain, &vendors, format)?;
        }
        return Ok(());
    }

    let files = enumerate_source_files(ctx);

    let progress = show_progress.then(|| {
        let bar = ProgressBar::new((files.len() * formats.len()) as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {pos}/{len} {msg}").expect("valid progress template"),
        );
        bar
    });

    for format in formats {
        if let Some(bar) = &progress {
            bar.set_message(format.to_string());
        }
        format_pass(ctx, toolchain, &vendors, &files, format, progress.as_ref())?;
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    Ok(())
}

/// One-shot build entry point: transpile and/or emit declarations per the
/// configured declarations mode.
pub fn build(ctx: &BuildContext, toolchain: &dyn Toolchain, show_progress: bool) -> Result<()> {
    let timing_total = Instant::now();

    if ctx.config.declarations != DeclarationsMode::Only {
        transpile_source(ctx, toolchain, show_progress)?;
    }

    if ctx.config.declarations != DeclarationsMode::Off {
        declarations::emit_declarations(ctx)?;
    }

    if show_progress {
        println!(
            "{}{}Finished build in {:.2}s",
            LINE_CLEAR,
            SPARKLES,
            timing_total.elapsed().as_secs_f64()
        );
    }
    Ok(())
}
