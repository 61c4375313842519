//! The engine bridge.
//!
//! The native engine is not reentrant, so every call into it happens on one
//! dedicated OS thread (`llm-runloop`) that is started once and outlives all
//! individual operations. Callers talk to that thread through a job queue;
//! each job carries a oneshot reply, except `generate` which carries the
//! sending half of the fragment stream and the receiving half of a pull
//! channel. The worker takes one completion step per pull, so generation
//! only advances while the consumer is waiting for a fragment.
//!
//! ```text
//! caller ──Job──▶ [ llm-runloop ] ──▶ NativeBackend
//!    ◀──oneshot / fragments──┘
//!    ──pull──▶
//! ```

use crate::native::{BenchParams, EngineHandle, LoadParams, NativeBackend};
use crate::params::{HostResources, select_load_params};
use crate::stream::TokenStream;
use llamachat_config::EngineConfig;
use llamachat_core::EngineError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const WORKER_NAME: &str = "llm-runloop";

/// Bridge settings.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub engine: EngineConfig,

    /// Fixed host resources. Probed at each load when unset.
    pub host: Option<HostResources>,
}

impl From<EngineConfig> for BridgeConfig {
    fn from(engine: EngineConfig) -> Self {
        Self { engine, host: None }
    }
}

/// Observable lifecycle state of the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub loaded: bool,
    pub model_path: Option<PathBuf>,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Sending side of the job queue; emptied by `shutdown`.
type JobQueue = Arc<Mutex<Option<std_mpsc::Sender<Job>>>>;

enum Job {
    Load { path: PathBuf, reply: Reply<()> },
    Unload { reply: Reply<()> },
    Generate {
        prompt: String,
        format_chat: bool,
        fragments: mpsc::Sender<Result<String, EngineError>>,
        pulls: mpsc::Receiver<()>,
    },
    Bench { params: BenchParams, reply: Reply<String> },
    ClearCache { reply: Reply<()> },
}

/// Serialized access to a [`NativeBackend`].
///
/// Share it behind an `Arc`. Dropping the last reference stops the worker,
/// which releases any loaded model on its way out.
pub struct EngineBridge {
    jobs: JobQueue,
    status: watch::Receiver<EngineStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EngineBridge {
    /// Start the worker thread and hand `backend` to it.
    pub fn spawn<B: NativeBackend>(backend: B, config: BridgeConfig) -> Result<Self, EngineError> {
        let (job_tx, job_rx) = std_mpsc::channel::<Job>();
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());

        let worker = std::thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                Worker {
                    backend,
                    config,
                    loaded: None,
                    status: status_tx,
                    init_error: None,
                }
                .run(job_rx)
            })
            .map_err(|e| EngineError::Backend(format!("failed to start {WORKER_NAME}: {e}")))?;

        Ok(Self {
            jobs: Arc::new(Mutex::new(Some(job_tx))),
            status: status_rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Load a model. Fails with an invalid-state error when one is already loaded.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Job::Load { path, reply }).await
    }

    /// Release the loaded model. No-op when idle.
    pub async fn unload(&self) -> Result<(), EngineError> {
        self.request(|reply| Job::Unload { reply }).await
    }

    /// Stream a completion for `prompt`.
    ///
    /// Nothing reaches the worker until the stream is first polled, and each
    /// poll that waits for a fragment allows exactly one completion step.
    /// When no model is loaded the stream yields a single invalid-state
    /// error and ends.
    pub fn generate(&self, prompt: impl Into<String>, format_chat: bool) -> TokenStream {
        let (fragment_tx, fragment_rx) = mpsc::channel(1);
        let (pull_tx, pull_rx) = mpsc::channel(1);
        let job = Job::Generate {
            prompt: prompt.into(),
            format_chat,
            fragments: fragment_tx,
            pulls: pull_rx,
        };
        let jobs = self.jobs.clone();
        let start = move || submit(&jobs, job);
        TokenStream::new(start, pull_tx, fragment_rx)
    }

    /// Run the native benchmark. Fails when no model is loaded.
    pub async fn bench(&self, params: BenchParams) -> Result<String, EngineError> {
        self.request(|reply| Job::Bench { params, reply }).await
    }

    /// Drop the native key-value cache. No-op when idle.
    pub async fn clear_cache(&self) -> Result<(), EngineError> {
        self.request(|reply| Job::ClearCache { reply }).await
    }

    pub fn is_loaded(&self) -> bool {
        self.status.borrow().loaded
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Follow lifecycle transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    /// Stop accepting jobs and wait for the worker to drain and exit.
    ///
    /// Blocks the calling thread; call it from synchronous code or
    /// `spawn_blocking`.
    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{WORKER_NAME} panicked during shutdown");
            }
        }
    }

    async fn request<T>(&self, job: impl FnOnce(Reply<T>) -> Job) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        submit(&self.jobs, job(reply))?;
        rx.await.map_err(|_| EngineError::WorkerGone)?
    }
}

fn submit(jobs: &JobQueue, job: Job) -> Result<(), EngineError> {
    let jobs = jobs.lock().map_err(|_| EngineError::WorkerGone)?;
    let tx = jobs.as_ref().ok_or(EngineError::WorkerGone)?;
    tx.send(job).map_err(|_| EngineError::WorkerGone)
}

impl std::fmt::Debug for EngineBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBridge")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

// --- Worker side ---

struct Worker<B> {
    backend: B,
    config: BridgeConfig,
    loaded: Option<(EngineHandle, PathBuf)>,
    status: watch::Sender<EngineStatus>,
    init_error: Option<EngineError>,
}

impl<B: NativeBackend> Worker<B> {
    fn run(mut self, jobs: std_mpsc::Receiver<Job>) {
        match self.backend.backend_init() {
            Ok(()) => info!(system = %self.backend.system_info(), "Engine backend initialized"),
            Err(e) => {
                warn!(error = %e, "Engine backend initialization failed");
                self.init_error = Some(e);
            }
        }

        for job in jobs.iter() {
            self.handle(job);
        }

        if self.loaded.is_some() {
            debug!("Releasing model on worker shutdown");
            self.unload();
        }
        debug!("{WORKER_NAME} exited");
    }

    fn handle(&mut self, job: Job) {
        if let Some(e) = &self.init_error {
            let err = e.clone();
            match job {
                Job::Load { reply, .. } | Job::Unload { reply } | Job::ClearCache { reply } => {
                    let _ = reply.send(Err(err));
                }
                Job::Bench { reply, .. } => {
                    let _ = reply.send(Err(err));
                }
                Job::Generate { fragments, .. } => {
                    let _ = fragments.blocking_send(Err(err));
                }
            }
            return;
        }

        match job {
            Job::Load { path, reply } => {
                let _ = reply.send(self.load(path));
            }
            Job::Unload { reply } => {
                self.unload();
                let _ = reply.send(Ok(()));
            }
            Job::Generate {
                prompt,
                format_chat,
                fragments,
                pulls,
            } => self.generate(&prompt, format_chat, fragments, pulls),
            Job::Bench { params, reply } => {
                let result = match self.loaded {
                    Some((handle, _)) => self.backend.bench(&handle, &params),
                    None => Err(EngineError::no_model_loaded()),
                };
                let _ = reply.send(result);
            }
            Job::ClearCache { reply } => {
                if let Some((handle, _)) = self.loaded {
                    self.backend.kv_cache_clear(handle.context);
                    debug!("KV cache cleared");
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn load(&mut self, path: PathBuf) -> Result<(), EngineError> {
        if self.loaded.is_some() {
            return Err(EngineError::model_already_loaded());
        }

        let host = self.config.host.unwrap_or_else(HostResources::probe);
        let params = select_load_params(host, &self.config.engine);
        info!(
            path = %path.display(),
            threads = params.threads,
            context_size = params.context_size,
            batch_size = params.batch_size,
            available_memory_mb = host.available_memory_mb,
            "Loading model"
        );

        let handle = self.allocate(&path, &params)?;
        self.loaded = Some((handle, path.clone()));
        self.status.send_replace(EngineStatus {
            loaded: true,
            model_path: Some(path),
        });
        info!("Model loaded");
        Ok(())
    }

    /// Allocate model, context, batch and sampler in order. A null handle at
    /// any step releases everything allocated before it.
    fn allocate(&mut self, path: &Path, params: &LoadParams) -> Result<EngineHandle, EngineError> {
        let model = match self.backend.load_model_with_config(path, params) {
            Ok(h) if !h.is_null() => h,
            Ok(_) => {
                warn!("Optimized load returned no model, retrying with defaults");
                self.backend.load_model(path)
            }
            Err(e) => {
                warn!(error = %e, "Optimized load failed, retrying with defaults");
                self.backend.load_model(path)
            }
        };
        if model.is_null() {
            return Err(EngineError::Allocation { step: "load_model" });
        }

        let context = self.backend.new_context(model, params);
        if context.is_null() {
            self.backend.free_model(model);
            return Err(EngineError::Allocation { step: "new_context" });
        }

        let batch = self
            .backend
            .new_batch(self.config.engine.batch_capacity, 0, 1);
        if batch.is_null() {
            self.backend.free_context(context);
            self.backend.free_model(model);
            return Err(EngineError::Allocation { step: "new_batch" });
        }

        let sampler = self.backend.new_sampler();
        if sampler.is_null() {
            self.backend.free_batch(batch);
            self.backend.free_context(context);
            self.backend.free_model(model);
            return Err(EngineError::Allocation { step: "new_sampler" });
        }

        Ok(EngineHandle {
            model,
            context,
            batch,
            sampler,
        })
    }

    fn unload(&mut self) {
        let Some((handle, path)) = self.loaded.take() else {
            return;
        };
        self.release(handle);
        self.status.send_replace(EngineStatus::default());
        info!(path = %path.display(), "Model unloaded");
    }

    fn release(&mut self, handle: EngineHandle) {
        self.backend.free_sampler(handle.sampler);
        self.backend.free_batch(handle.batch);
        self.backend.free_context(handle.context);
        self.backend.free_model(handle.model);
    }

    fn generate(
        &mut self,
        prompt: &str,
        format_chat: bool,
        fragments: mpsc::Sender<Result<String, EngineError>>,
        mut pulls: mpsc::Receiver<()>,
    ) {
        let Some((handle, _)) = self.loaded else {
            let _ = fragments.blocking_send(Err(EngineError::no_model_loaded()));
            return;
        };

        let n_len = self.config.engine.max_generation_tokens;
        let mut n_cur = match self
            .backend
            .completion_init(&handle, prompt, format_chat, n_len)
        {
            Ok(n) => n,
            Err(e) => {
                let _ = fragments.blocking_send(Err(e));
                return;
            }
        };

        let mut emitted = 0usize;
        'pull: while n_cur < n_len {
            if pulls.blocking_recv().is_none() {
                debug!(emitted, "Generation abandoned by consumer");
                return;
            }
            // Empty fragments yield nothing, so keep stepping for this pull
            while n_cur < n_len {
                match self.backend.completion_loop(&handle, n_len, &mut n_cur) {
                    Ok(Some(text)) if text.is_empty() => continue,
                    Ok(Some(text)) => {
                        if fragments.blocking_send(Ok(text)).is_err() {
                            debug!(emitted, "Generation abandoned by consumer");
                            return;
                        }
                        emitted += 1;
                        continue 'pull;
                    }
                    Ok(None) => break 'pull,
                    Err(e) => {
                        warn!(error = %e, "Completion loop failed");
                        let _ = fragments.blocking_send(Err(e));
                        return;
                    }
                }
            }
        }
        debug!(emitted, n_cur, "Generation finished");
    }
}
