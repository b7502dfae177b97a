use ahash::AHashSet;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::build::build_types::{BuildContext, VENDORS_DIR};
use crate::compiler::{BuildRequest, DefaultLoad, Resolution, ResolveArgs, ResolveHook, Toolchain};
use crate::config::{Format, ModuleKind};
use crate::helpers;
use crate::resolve::ResolutionError;
use crate::resolve::plugin::replacement_for;

/// One pre-bundled vendor build: (vendor name, format) -> one output file
/// under the `_vendors` subdirectory of that format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorJob {
    pub name: String,
    pub format: Format,
}

/// Schedules and runs vendor pre-bundling jobs, decoupled from the main
/// build graph. Scheduling is idempotent per (name, format) within a build
/// pass; a vendor discovered mid-build (including by another vendor job)
/// enqueues exactly one job per requested format.
pub struct VendorBundler {
    formats: Vec<Format>,
    scheduled: Mutex<AHashSet<(String, Format)>>,
    pending: Mutex<Vec<VendorJob>>,
}

impl VendorBundler {
    pub fn new(formats: Vec<Format>) -> Self {
        Self {
            formats,
            scheduled: Mutex::new(AHashSet::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn add_vendors(&self, names: &[String]) {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());

        for name in names {
            for format in &self.formats {
                if scheduled.insert((name.clone(), *format)) {
                    pending.push(VendorJob {
                        name: name.clone(),
                        format: *format,
                    });
                }
            }
        }
    }

    pub fn take_pending(&self) -> Vec<VendorJob> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pending)
    }

    /// Run every scheduled job to a fixed point: jobs may discover further
    /// vendors, so the pending list is re-checked after each wave until it
    /// drains empty.
    pub fn flush(&self, ctx: &BuildContext, toolchain: &dyn Toolchain) -> Result<()> {
        loop {
            let wave = self.take_pending();
            if wave.is_empty() {
                return Ok(());
            }
            wave.par_iter()
                .map(|job| {
                    self.build_vendor(ctx, toolchain, job)
                        .with_context(|| format!("building vendor {} for {}", job.name, job.format))
                })
                .collect::<Result<Vec<_>>>()?;
        }
    }

    fn vendor_outfile(&self, ctx: &BuildContext, job: &VendorJob) -> PathBuf {
        ctx.format_dir(job.format)
            .join(VENDORS_DIR)
            .join(format!("{}{}", job.name, job.format.default_ext()))
    }

    fn build_vendor(&self, ctx: &BuildContext, toolchain: &dyn Toolchain, job: &VendorJob) -> Result<()> {
        let outfile = self.vendor_outfile(ctx, job);

        // Synthetic entry re-exporting the vendor; anchored at the source
        // root so host resolution walks the project's node_modules.
        let proxy_source = match job.format.module_kind() {
            ModuleKind::EsModule => format!("export * from \"{}\";\n", job.name),
            ModuleKind::CommonJs => format!("module.exports = require(\"{}\");\n", job.name),
        };
        let proxy_entry = ctx.config.src_dir.join("__vendor_proxy__");

        let plugin = VendorResolvePlugin {
            ctx,
            bundler: self,
            vendor: &job.name,
            format: job.format,
            outfile: outfile.clone(),
        };

        let request = BuildRequest {
            entry: &proxy_entry,
            entry_source: Some(&proxy_source),
            outfile: &outfile,
            module_kind: job.format.module_kind(),
            bundle: true,
            banner: None,
            footer: None,
        };
        toolchain.build(&request, &plugin, &DefaultLoad)
    }
}

/// Resolve hook for vendor builds: the vendor itself is inlined through the
/// host resolver, while replacements, externals and sibling vendors are
/// honored so the vendor's own dependencies follow the same rules as
/// application code.
struct VendorResolvePlugin<'a> {
    ctx: &'a BuildContext,
    bundler: &'a VendorBundler,
    vendor: &'a str,
    format: Format,
    outfile: PathBuf,
}

impl ResolveHook for VendorResolvePlugin<'_> {
    fn on_resolve(&self, args: &ResolveArgs) -> Result<Option<Resolution>, ResolutionError> {
        let original = args.specifier;

        if original == self.vendor {
            return Ok(Some(Resolution::Delegate));
        }

        let mut specifier = original.to_string();
        if let Some(replaced) = replacement_for(self.ctx, self.format, &self.outfile, original) {
            if replaced.starts_with('.') {
                return Ok(Some(Resolution::Resolved {
                    path: replaced,
                    external: true,
                }));
            }
            specifier = replaced;
        }

        if self.ctx.config.is_external(original) {
            return Ok(Some(Resolution::Resolved {
                path: specifier,
                external: true,
            }));
        }

        if self.ctx.config.is_vendor(&specifier) {
            self.bundler.add_vendors(std::slice::from_ref(&specifier));
            // Sibling vendors land in the same _vendors directory.
            return Ok(Some(Resolution::Resolved {
                path: helpers::as_relative(&format!("{specifier}{}", self.format.default_ext())),
                external: true,
            }));
        }

        if specifier.starts_with('.') {
            let abs = helpers::normalize(&args.resolve_dir.join(&specifier));
            return Ok(Some(Resolution::Resolved {
                path: abs.to_string_lossy().to_string(),
                external: false,
            }));
        }

        Ok(Some(Resolution::Delegate))
    }
}
