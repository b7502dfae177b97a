use ahash::AHashMap;
use futures_timer::Delay;
use notify::event::ModifyKind;
use notify::{Config, Error, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::build;
use crate::build::build_types::{BuildContext, CompilationUnit};
use crate::compiler::Toolchain;
use crate::config::Format;
use crate::helpers;
use crate::helpers::emojis::*;
use crate::queue::FifoQueue;
use crate::vendor::VendorBundler;

/// A live incremental-build handle: one per (watched file, format).
#[derive(Debug, Clone)]
struct IncrementalHandle {
    unit: CompilationUnit,
}

/// Handles registered for one watched path.
struct WatchedEntry {
    generation: u64,
    handles: Vec<IncrementalHandle>,
}

/// Bookkeeping for the watch session, keyed by watched path. Generations
/// race-check cancellation: only the handles that are still current for a
/// path are ever acted on.
struct WatchState {
    entries: AHashMap<PathBuf, WatchedEntry>,
    next_generation: u64,
}

impl WatchState {
    fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            next_generation: 0,
        }
    }

    /// Cancel and dispose the live handles for `path`. Returns the number
    /// of handles disposed; a path with no current entry is a no-op.
    fn cancel_and_dispose(&mut self, path: &Path) -> usize {
        match self.entries.remove(path) {
            Some(entry) => {
                log::debug!(
                    "disposed {} handle(s) for {} (generation {})",
                    entry.handles.len(),
                    path.display(),
                    entry.generation
                );
                entry.handles.len()
            }
            None => 0,
        }
    }

    /// Dispose every entry under a directory that disappeared.
    fn cancel_and_dispose_under(&mut self, dir: &Path) -> usize {
        let doomed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|path| path.starts_with(dir))
            .cloned()
            .collect();
        doomed.iter().map(|path| self.cancel_and_dispose(path)).sum()
    }

    /// Register fresh handles for `path`, replacing nothing: callers dispose
    /// the previous entry first when the file changed identity.
    fn register(&mut self, path: &Path, units: Vec<CompilationUnit>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let handles = units.into_iter().map(|unit| IncrementalHandle { unit }).collect();
        self.entries
            .insert(path.to_path_buf(), WatchedEntry { generation, handles });
        generation
    }

    fn units_for(&self, path: &Path) -> Option<Vec<CompilationUnit>> {
        self.entries
            .get(path)
            .map(|entry| entry.handles.iter().map(|handle| handle.unit.clone()).collect())
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    /// Create/delete/rename: the path changed identity.
    Rename,
    /// Content-only modification of an already-watched file.
    Content,
    /// Not relevant for compilation.
    Ignored,
}

fn classify(kind: EventKind) -> ChangeKind {
    match kind {
        EventKind::Remove(_) | EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any => {
            ChangeKind::Rename
        }
        // windows reports content changes as ModifyKind::Any
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => ChangeKind::Content,
        // access, metadata and the rest are not relevant for compilation
        _ => ChangeKind::Ignored,
    }
}

struct WatchSession<'a> {
    ctx: &'a BuildContext,
    toolchain: &'a dyn Toolchain,
    formats: Vec<Format>,
    state: WatchState,
    show_progress: bool,
}

impl<'a> WatchSession<'a> {
    fn new(ctx: &'a BuildContext, toolchain: &'a dyn Toolchain, show_progress: bool) -> Self {
        Self {
            formats: ctx.config.formats.iter().collect(),
            state: WatchState::new(),
            ctx,
            toolchain,
            show_progress,
        }
    }

    fn units_for_file(&self, path: &Path) -> Vec<CompilationUnit> {
        self.formats.iter().map(|format| self.ctx.unit(path, *format)).collect()
    }

    fn register_initial_handles(&mut self) {
        if self.ctx.config.bundle {
            if let Some(entrypoint) = self.ctx.config.entrypoint.clone() {
                let units = self.units_for_file(&entrypoint);
                self.state.register(&entrypoint, units);
            }
            return;
        }
        for file in build::enumerate_source_files(self.ctx) {
            let units = self.units_for_file(&file);
            self.state.register(&file, units);
        }
    }

    /// Rebuild a set of units, isolating failures per file/format: a broken
    /// rebuild is logged and the watcher keeps running.
    fn rebuild(&self, units: &[CompilationUnit]) {
        let vendors = VendorBundler::new(self.formats.clone());

        for unit in units {
            // The file may have vanished between the event and this
            // rebuild; that race is recovered as a no-op.
            if !unit.entry.is_file() {
                log::debug!("skipping rebuild, {} disappeared", unit.entry.display());
                continue;
            }
            if let Err(error) = build::build_unit(self.ctx, &vendors, self.toolchain, unit, self.ctx.config.bundle)
            {
                log::error!("{error:#}");
            }
        }

        if let Err(error) = vendors.flush(self.ctx, self.toolchain) {
            log::error!("{error:#}");
        }
    }

    /// A rename-kind event: cancel and dispose any live handles for the
    /// exact path, then re-register based on what the path is now.
    fn on_rename(&mut self, path: &Path) {
        self.state.cancel_and_dispose(path);

        if path.is_dir() {
            self.state.cancel_and_dispose_under(path);
            // The recursive watch already covers the new directory; newly
            // discovered compilable files still need scheduling.
            for file in helpers::read_files_recursive(path) {
                if self.ctx.should_compile(&file) && !self.state.is_watched(&file) {
                    let units = self.units_for_file(&file);
                    self.rebuild(&units);
                    self.state.register(&file, units);
                }
            }
            return;
        }

        if path.is_file() {
            let units = self.units_for_file(path);
            self.rebuild(&units);
            self.state.register(path, units);
        }
        // A deleted path stays disposed until something is created there.
    }

    fn on_content_change(&mut self, path: &Path) {
        match self.state.units_for(path) {
            Some(units) => self.rebuild(&units),
            // Some platforms report a brand-new file as a bare modify.
            None if path.is_file() => {
                let units = self.units_for_file(path);
                self.rebuild(&units);
                self.state.register(path, units);
            }
            None => {}
        }
    }

    fn handle_event(&mut self, event: &Event) -> bool {
        let change = classify(event.kind);
        if change == ChangeKind::Ignored {
            return false;
        }

        let mut handled = false;
        for path in &event.paths {
            let relevant = path.starts_with(&self.ctx.config.src_dir)
                && (path.is_dir() || self.ctx.should_compile(path) || self.state.is_watched(path));
            if !relevant {
                continue;
            }

            // Bundle mode: any relevant change re-runs the entrypoint
            // bundles; per-file output does not exist.
            if self.ctx.config.bundle {
                if let Some(entrypoint) = self.ctx.config.entrypoint.clone() {
                    if change == ChangeKind::Rename {
                        self.state.cancel_and_dispose(&entrypoint);
                        let units = self.units_for_file(&entrypoint);
                        self.state.register(&entrypoint, units);
                    }
                    if let Some(units) = self.state.units_for(&entrypoint) {
                        self.rebuild(&units);
                    }
                }
                handled = true;
                continue;
            }

            match change {
                ChangeKind::Rename => self.on_rename(path),
                ChangeKind::Content => self.on_content_change(path),
                ChangeKind::Ignored => {}
            }
            handled = true;
        }
        handled
    }
}

async fn async_watch(
    queue: Arc<FifoQueue<Result<Event, Error>>>,
    ctx: &BuildContext,
    toolchain: &dyn Toolchain,
    show_progress: bool,
    abort: Arc<AtomicBool>,
) {
    let mut session = WatchSession::new(ctx, toolchain, show_progress);

    if show_progress {
        println!("Initial build...");
    }
    if let Err(error) = build::transpile_source(ctx, toolchain, show_progress) {
        log::error!("{error:#}");
    }
    session.register_initial_handles();

    if show_progress {
        println!("{}Watching for changes...", EYES);
    }

    loop {
        if abort.load(Ordering::SeqCst) {
            log::debug!("watch aborted");
            break;
        }

        if !queue.is_empty() {
            // Wait for events to settle.
            Delay::new(Duration::from_millis(50)).await;
        }

        let mut events: Vec<Event> = Vec::new();
        while let Some(result) = queue.pop() {
            match result {
                Ok(event) => events.push(event),
                Err(error) => log::warn!("watch error: {error}"),
            }
        }

        if events.is_empty() {
            // Let the CPU schedule other work instead of spinning.
            Delay::new(Duration::from_millis(50)).await;
            continue;
        }

        let timing = Instant::now();
        let mut rebuilt = false;
        for event in &events {
            rebuilt |= session.handle_event(event);
        }

        if rebuilt && session.show_progress {
            println!(
                "{}{}Finished incremental compilation in {:.2}s",
                LINE_CLEAR,
                SPARKLES,
                timing.elapsed().as_secs_f64()
            );
        }
    }
}

/// Watch the source tree and rebuild on changes until `abort` is raised.
pub fn start(ctx: &BuildContext, toolchain: &dyn Toolchain, show_progress: bool, abort: Arc<AtomicBool>) {
    futures::executor::block_on(async {
        let queue = Arc::new(FifoQueue::<Result<Event, Error>>::new());
        let producer = queue.clone();

        let mut watcher = RecommendedWatcher::new(move |res| producer.push(res), Config::default())
            .expect("Could not create watcher");

        log::debug!("watching {}", ctx.config.src_dir.display());

        watcher
            .watch(&ctx.config.src_dir, RecursiveMode::Recursive)
            .expect("Could not start watcher");

        async_watch(queue, ctx, toolchain, show_progress, abort).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::build_types::tests::test_pool;
    use crate::compiler::RewriteToolchain;
    use crate::config::BuildConfig;
    use crate::config::tests::{CreateConfigArgs, create_raw};
    use crate::worker::CacheMode;
    use std::fs;

    fn context(src_root: &Path) -> BuildContext {
        let mut raw = create_raw(CreateConfigArgs::default());
        raw.formats = vec!["cjs".to_string(), "esm".to_string()];
        raw.src_dir = src_root.join("src").to_string_lossy().to_string();
        raw.out_dir = src_root.join("dist").to_string_lossy().to_string();
        let config = BuildConfig::from_raw(raw, src_root).unwrap();
        BuildContext::new(config, test_pool(), CacheMode::Uncached).unwrap()
    }

    #[test]
    fn classify_separates_renames_from_content_changes() {
        use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};

        assert_eq!(classify(EventKind::Create(CreateKind::File)), ChangeKind::Rename);
        assert_eq!(classify(EventKind::Remove(RemoveKind::File)), ChangeKind::Rename);
        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            ChangeKind::Rename
        );
        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            ChangeKind::Content
        );
        assert_eq!(
            classify(EventKind::Access(notify::event::AccessKind::Read)),
            ChangeKind::Ignored
        );
    }

    #[test]
    fn dispose_acts_exactly_once_per_registration() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        let ctx = context(&root);

        let mut state = WatchState::new();
        let file = ctx.config.src_dir.join("a.ts");
        let units = vec![ctx.unit(&file, Format::Cjs), ctx.unit(&file, Format::Esm)];
        state.register(&file, units);

        // one live handle per format, disposed exactly once
        assert_eq!(state.cancel_and_dispose(&file), 2);
        assert_eq!(state.cancel_and_dispose(&file), 0);
    }

    #[test]
    fn replacing_a_file_disposes_the_old_handles_before_registering_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        let ctx = context(&root);

        let mut state = WatchState::new();
        let file = ctx.config.src_dir.join("a.ts");

        let first = state.register(&file, vec![ctx.unit(&file, Format::Cjs)]);
        // delete + create at the same path
        assert_eq!(state.cancel_and_dispose(&file), 1);
        let second = state.register(&file, vec![ctx.unit(&file, Format::Cjs)]);

        assert!(second > first);
        assert!(state.is_watched(&file));
    }

    #[test]
    fn rename_event_for_a_new_file_builds_and_registers_it() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/a.ts"), "export const a = 1;\n").unwrap();
        let ctx = context(&root);

        let toolchain = RewriteToolchain::new();
        let mut session = WatchSession::new(&ctx, &toolchain, false);
        session.on_rename(&ctx.config.src_dir.join("a.ts"));

        assert!(session.state.is_watched(&ctx.config.src_dir.join("a.ts")));
        assert!(root.join("dist/cjs/a.cjs").is_file());
        assert!(root.join("dist/esm/a.mjs").is_file());
    }

    #[test]
    fn rename_event_for_a_deleted_file_only_disposes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        let ctx = context(&root);

        let toolchain = RewriteToolchain::new();
        let mut session = WatchSession::new(&ctx, &toolchain, false);
        let ghost = ctx.config.src_dir.join("gone.ts");
        session.state.register(&ghost, vec![ctx.unit(&ghost, Format::Cjs)]);

        session.on_rename(&ghost);
        assert!(!session.state.is_watched(&ghost));
    }

    #[test]
    fn rebuild_of_a_vanished_file_is_a_silent_noop() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        let ctx = context(&root);

        let toolchain = RewriteToolchain::new();
        let session = WatchSession::new(&ctx, &toolchain, false);
        let ghost = ctx.config.src_dir.join("gone.ts");

        // must not error or write output
        session.rebuild(&[ctx.unit(&ghost, Format::Cjs)]);
        assert!(!root.join("dist/cjs/gone.cjs").exists());
    }

    #[test]
    fn new_directory_schedules_its_compilable_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("src/feature")).unwrap();
        fs::write(root.join("src/feature/a.ts"), "export const a = 1;\n").unwrap();
        fs::write(root.join("src/feature/notes.md"), "# nope\n").unwrap();
        let ctx = context(&root);

        let toolchain = RewriteToolchain::new();
        let mut session = WatchSession::new(&ctx, &toolchain, false);
        session.on_rename(&ctx.config.src_dir.join("feature"));

        assert!(session.state.is_watched(&ctx.config.src_dir.join("feature/a.ts")));
        assert!(!session.state.is_watched(&ctx.config.src_dir.join("feature/notes.md")));
        assert!(root.join("dist/cjs/feature/a.cjs").is_file());
    }
}
