use anyhow::{Result, anyhow};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{Receiver, Sender, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::compiler::LoadHook;
use crate::helpers;

/// A worker crashed or the pool was closed while requests were pending.
/// Fatal for the build pass; the pool is not revived mid-build.
#[derive(Debug)]
pub struct WorkerError {
    pub message: String,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transpile worker failed: {}", self.message)
    }
}

impl std::error::Error for WorkerError {}

pub struct ParseRequest {
    pub file_path: PathBuf,
    pub file_content: String,
}

/// Options for a declaration-emission run.
pub struct DeclarationOptions {
    pub ts_config: Option<PathBuf>,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    pub target: Option<String>,
}

/// The compiler-project instance each worker wraps. The production backend
/// shells out to a TypeScript compiler; tests substitute a closure.
pub trait TranspileBackend: Send + Sync + 'static {
    fn parse_file(&self, request: &ParseRequest) -> Result<String, String>;
    fn emit_declarations(&self, options: &DeclarationOptions) -> Result<(), String>;
}

enum Job {
    Parse {
        request: ParseRequest,
        reply: Sender<Result<String, String>>,
    },
    EmitDeclarations {
        options: DeclarationOptions,
        reply: Sender<Result<(), String>>,
    },
}

/// Fixed-size pool of long-lived worker threads pulling jobs from a bounded
/// channel. Each request carries its own reply channel, which doubles as
/// the correlation id: a crashed worker drops the reply sender and the
/// requester observes the disconnect instead of deadlocking.
pub struct TranspileWorkerPool {
    sender: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TranspileWorkerPool {
    pub fn new(backend: Arc<dyn TranspileBackend>) -> Self {
        let size = std::cmp::max(1, num_cpus::get().saturating_sub(1));
        Self::with_size(backend, size)
    }

    pub fn with_size(backend: Arc<dyn TranspileBackend>, size: usize) -> Self {
        let (sender, receiver) = sync_channel::<Job>(size * 2);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let backend = Arc::clone(&backend);
                std::thread::Builder::new()
                    .name(format!("transpile-worker-{index}"))
                    .spawn(move || worker_loop(receiver, backend))
                    .expect("failed to spawn transpile worker")
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, job: Job) -> Result<(), WorkerError> {
        let closed = || WorkerError {
            message: "worker pool is closed".to_string(),
        };
        // Clone the sender out so a full queue does not block other
        // submitters on the mutex.
        let sender = {
            let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        match sender {
            Some(sender) => sender.send(job).map_err(|_| closed()),
            None => Err(closed()),
        }
    }

    /// Transform one file through a worker. Blocks until the correlated
    /// reply arrives or the serving worker dies.
    pub fn parse_file(&self, file_path: &Path, file_content: String) -> Result<String, WorkerError> {
        let (reply, response) = std::sync::mpsc::channel();
        self.submit(Job::Parse {
            request: ParseRequest {
                file_path: file_path.to_path_buf(),
                file_content,
            },
            reply,
        })?;

        match response.recv() {
            Ok(Ok(transpiled)) => Ok(transpiled),
            Ok(Err(message)) => Err(WorkerError { message }),
            Err(_) => Err(WorkerError {
                message: format!("worker died while transpiling {}", file_path.display()),
            }),
        }
    }

    /// Run the external declaration emitter once. Side effect: writes
    /// `.d.ts` files under the configured output directory.
    pub fn emit_declarations(&self, options: DeclarationOptions) -> Result<(), WorkerError> {
        let (reply, response) = std::sync::mpsc::channel();
        self.submit(Job::EmitDeclarations { options, reply })?;

        match response.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(WorkerError { message }),
            Err(_) => Err(WorkerError {
                message: "worker died while emitting declarations".to_string(),
            }),
        }
    }

    /// Shut the pool down: close the queue and join every worker.
    pub fn close(&self) {
        {
            let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            sender.take();
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, backend: Arc<dyn TranspileBackend>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
            receiver.recv()
        };
        match job {
            Ok(Job::Parse { request, reply }) => {
                let _ = reply.send(backend.parse_file(&request));
            }
            Ok(Job::EmitDeclarations { options, reply }) => {
                let _ = reply.send(backend.emit_declarations(&options));
            }
            // Queue closed: pool shutdown.
            Err(_) => break,
        }
    }
}

/// Backend that invokes an external TypeScript compiler binary per request.
pub struct TscBackend {
    compiler: PathBuf,
}

impl TscBackend {
    pub fn new(compiler: Option<PathBuf>) -> Self {
        Self {
            compiler: compiler.unwrap_or_else(|| PathBuf::from("tsc")),
        }
    }

    fn run(&self, args: &[String]) -> Result<(), String> {
        let output = Command::new(&self.compiler)
            .args(args)
            .output()
            .map_err(|e| format!("failed to run {}: {e}", self.compiler.display()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{}{}", stdout.trim(), stderr.trim()))
        }
    }
}

impl TranspileBackend for TscBackend {
    fn parse_file(&self, request: &ParseRequest) -> Result<String, String> {
        let workdir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let file_name = request
            .file_path
            .file_name()
            .ok_or_else(|| format!("invalid path: {}", request.file_path.display()))?;
        let input = workdir.path().join(file_name);
        fs::write(&input, &request.file_content).map_err(|e| e.to_string())?;

        let out_dir = workdir.path().join("out");
        self.run(&[
            input.to_string_lossy().to_string(),
            "--outDir".to_string(),
            out_dir.to_string_lossy().to_string(),
            "--experimentalDecorators".to_string(),
            "--emitDecoratorMetadata".to_string(),
            "--target".to_string(),
            "esnext".to_string(),
            "--module".to_string(),
            "esnext".to_string(),
            "--moduleResolution".to_string(),
            "node".to_string(),
            "--inlineSourceMap".to_string(),
            "--inlineSources".to_string(),
            "--skipLibCheck".to_string(),
            "--noResolve".to_string(),
        ])?;

        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let emitted = out_dir.join(format!("{stem}.js"));
        fs::read_to_string(&emitted).map_err(|e| format!("no transpiler output for {stem}: {e}"))
    }

    fn emit_declarations(&self, options: &DeclarationOptions) -> Result<(), String> {
        let mut args = Vec::new();
        match &options.ts_config {
            Some(ts_config) => {
                args.push("-p".to_string());
                args.push(ts_config.to_string_lossy().to_string());
            }
            None => {
                for file in helpers::read_files_recursive(&options.src_dir) {
                    if helpers::is_parsable(&file, &[".ts", ".mts", ".cts", ".tsx"]) {
                        args.push(file.to_string_lossy().to_string());
                    }
                }
            }
        }
        args.push("--declaration".to_string());
        args.push("--emitDeclarationOnly".to_string());
        args.push("--rootDir".to_string());
        args.push(options.src_dir.to_string_lossy().to_string());
        args.push("--outDir".to_string());
        args.push(options.out_dir.to_string_lossy().to_string());
        if let Some(target) = &options.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        self.run(&args)
    }
}

fn decorator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)class.*?\{.*?@[A-Za-z0-9]+(\(.*?\))?\s+[A-Za-z0-9]+.*?;").unwrap())
}

/// Heuristic for sources that need the decorator-metadata pre-pass: a class
/// body with an `@Name(...)`-shaped member decorator.
pub fn has_decorators(source: &str) -> bool {
    decorator_re().is_match(source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
}

enum CachedTransform {
    /// No decorators; the compiler can load the file itself.
    Plain,
    Transpiled(String),
}

/// Load hook feeding decorator-using sources through the worker pool before
/// the primary compiler sees them. The no-transform-needed cache is keyed
/// by absolute path and valid for one build pass; watch sessions run
/// [`CacheMode::Uncached`] because content may change under an unchanged
/// path.
pub struct DecoratorPrePass {
    pool: Arc<TranspileWorkerPool>,
    mode: CacheMode,
    cache: Mutex<ahash::AHashMap<PathBuf, Arc<CachedTransform>>>,
}

impl DecoratorPrePass {
    pub fn new(pool: Arc<TranspileWorkerPool>, mode: CacheMode) -> Self {
        Self {
            pool,
            mode,
            cache: Mutex::new(ahash::AHashMap::new()),
        }
    }
}

const TS_EXTENSIONS: &[&str] = &[".ts", ".mts", ".cts", ".tsx"];

impl LoadHook for DecoratorPrePass {
    fn on_load(&self, path: &Path) -> Result<Option<String>> {
        if !helpers::is_parsable(path, TS_EXTENSIONS) {
            return Ok(None);
        }

        if self.mode == CacheMode::Cached {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(path) {
                return Ok(match cached.as_ref() {
                    CachedTransform::Plain => None,
                    CachedTransform::Transpiled(source) => Some(source.clone()),
                });
            }
        }

        let content =
            fs::read_to_string(path).map_err(|e| anyhow!("could not read {}: {e}", path.display()))?;

        if !has_decorators(&content) {
            if self.mode == CacheMode::Cached {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.insert(path.to_path_buf(), Arc::new(CachedTransform::Plain));
            }
            return Ok(None);
        }

        let transpiled = self.pool.parse_file(path, content)?;
        if self.mode == CacheMode::Cached {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.insert(
                path.to_path_buf(),
                Arc::new(CachedTransform::Transpiled(transpiled.clone())),
            );
        }
        Ok(Some(transpiled))
    }
}
