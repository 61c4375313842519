//! A scripted native backend for tests.
//!
//! Plays back a fixed list of fragments for every completion and records
//! what the bridge asked of it, so tests can check serialization, handle
//! hygiene and cache clears without a real model.

use crate::native::{BenchParams, EngineHandle, LoadParams, NativeBackend, RawHandle};
use llamachat_core::EngineError;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the scripted backend observed.
#[derive(Debug, Default)]
pub struct ScriptedLog {
    pub calls: Vec<String>,
    pub live: HashSet<u64>,
    pub kv_clears: usize,
    pub prompts: Vec<String>,
    /// `format_chat` flag of each completion, in order
    pub format_flags: Vec<bool>,
    pub threads: Vec<Option<String>>,
    in_flight: usize,
    max_in_flight: usize,
}

pub type SharedLog = Arc<Mutex<ScriptedLog>>;

impl ScriptedLog {
    pub fn calls(log: &SharedLog) -> Vec<String> {
        log.lock().map(|l| l.calls.clone()).unwrap_or_default()
    }

    /// Handles allocated and not yet freed.
    pub fn live(log: &SharedLog) -> usize {
        log.lock().map(|l| l.live.len()).unwrap_or_default()
    }

    /// Calls to `completion_loop` so far.
    pub fn completion_steps(log: &SharedLog) -> usize {
        log.lock()
            .map(|l| l.calls.iter().filter(|c| *c == "completion_loop").count())
            .unwrap_or_default()
    }

    pub fn kv_clears(log: &SharedLog) -> usize {
        log.lock().map(|l| l.kv_clears).unwrap_or_default()
    }

    pub fn prompts(log: &SharedLog) -> Vec<String> {
        log.lock().map(|l| l.prompts.clone()).unwrap_or_default()
    }

    pub fn format_flags(log: &SharedLog) -> Vec<bool> {
        log.lock().map(|l| l.format_flags.clone()).unwrap_or_default()
    }

    /// Distinct names of the threads that called into the backend.
    pub fn threads(log: &SharedLog) -> Vec<Option<String>> {
        log.lock().map(|l| l.threads.clone()).unwrap_or_default()
    }

    /// The largest number of overlapping backend calls seen.
    pub fn max_concurrency(log: &SharedLog) -> usize {
        log.lock().map(|l| l.max_in_flight).unwrap_or_default()
    }
}

/// Replays `fragments` for every generation.
pub struct ScriptedBackend {
    fragments: Vec<String>,
    fail_step: Option<&'static str>,
    optimized_fails: bool,
    init_fails: bool,
    error_after: Option<(usize, EngineError)>,
    delay: Option<Duration>,
    next_handle: u64,
    emitted: usize,
    log: SharedLog,
}

impl ScriptedBackend {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_step: None,
            optimized_fails: false,
            init_fails: false,
            error_after: None,
            delay: None,
            next_handle: 0,
            emitted: 0,
            log: Arc::default(),
        }
    }

    /// Make one allocation step (`load_model`, `new_context`, `new_batch`,
    /// `new_sampler`) return a null handle.
    pub fn fail_at(mut self, step: &'static str) -> Self {
        self.fail_step = Some(step);
        self
    }

    pub fn optimized_load_fails(mut self) -> Self {
        self.optimized_fails = true;
        self
    }

    pub fn init_fails(mut self) -> Self {
        self.init_fails = true;
        self
    }

    /// Fail the completion loop after `n` fragments.
    pub fn error_after(mut self, n: usize, err: EngineError) -> Self {
        self.error_after = Some((n, err));
        self
    }

    /// Sleep before producing each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn log(&self) -> SharedLog {
        self.log.clone()
    }

    fn enter(&self, call: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.calls.push(call.to_string());
            let name = std::thread::current().name().map(str::to_string);
            if !log.threads.contains(&name) {
                log.threads.push(name);
            }
            log.in_flight += 1;
            log.max_in_flight = log.max_in_flight.max(log.in_flight);
        }
    }

    fn leave(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.in_flight -= 1;
        }
    }

    fn alloc(&mut self, step: &str) -> RawHandle {
        self.enter(step);
        let handle = if self.fail_step == Some(step) {
            RawHandle::NULL
        } else {
            self.next_handle += 1;
            if let Ok(mut log) = self.log.lock() {
                log.live.insert(self.next_handle);
            }
            RawHandle(self.next_handle)
        };
        self.leave();
        handle
    }

    fn free(&mut self, step: &str, handle: RawHandle) {
        self.enter(step);
        if let Ok(mut log) = self.log.lock() {
            log.live.remove(&handle.0);
        }
        self.leave();
    }
}

impl NativeBackend for ScriptedBackend {
    fn backend_init(&mut self) -> Result<(), EngineError> {
        self.enter("backend_init");
        self.leave();
        if self.init_fails {
            return Err(EngineError::Backend("no compute backend".into()));
        }
        Ok(())
    }

    fn system_info(&self) -> String {
        "scripted".into()
    }

    fn load_model_with_config(
        &mut self,
        _path: &Path,
        _params: &LoadParams,
    ) -> Result<RawHandle, EngineError> {
        if self.optimized_fails {
            self.enter("load_model_with_config");
            self.leave();
            return Err(EngineError::Backend("optimized load unsupported".into()));
        }
        Ok(self.alloc("load_model_with_config"))
    }

    fn load_model(&mut self, _path: &Path) -> RawHandle {
        self.alloc("load_model")
    }

    fn new_context(&mut self, _model: RawHandle, _params: &LoadParams) -> RawHandle {
        self.alloc("new_context")
    }

    fn new_batch(&mut self, _n_tokens: u32, _embd: u32, _n_seq_max: u32) -> RawHandle {
        self.alloc("new_batch")
    }

    fn new_sampler(&mut self) -> RawHandle {
        self.alloc("new_sampler")
    }

    fn free_model(&mut self, model: RawHandle) {
        self.free("free_model", model)
    }

    fn free_context(&mut self, context: RawHandle) {
        self.free("free_context", context)
    }

    fn free_batch(&mut self, batch: RawHandle) {
        self.free("free_batch", batch)
    }

    fn free_sampler(&mut self, sampler: RawHandle) {
        self.free("free_sampler", sampler)
    }

    fn completion_init(
        &mut self,
        _handle: &EngineHandle,
        text: &str,
        format_chat: bool,
        _n_len: u32,
    ) -> Result<u32, EngineError> {
        self.enter("completion_init");
        if let Ok(mut log) = self.log.lock() {
            log.prompts.push(text.to_string());
            log.format_flags.push(format_chat);
        }
        self.emitted = 0;
        self.leave();
        Ok(0)
    }

    fn completion_loop(
        &mut self,
        _handle: &EngineHandle,
        _n_len: u32,
        n_cur: &mut u32,
    ) -> Result<Option<String>, EngineError> {
        self.enter("completion_loop");
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let result = match &self.error_after {
            Some((n, err)) if self.emitted == *n => Err(err.clone()),
            _ => Ok(self.fragments.get(self.emitted).cloned()),
        };
        self.emitted += 1;
        *n_cur += 1;
        self.leave();
        result
    }

    fn kv_cache_clear(&mut self, _context: RawHandle) {
        self.enter("kv_cache_clear");
        if let Ok(mut log) = self.log.lock() {
            log.kv_clears += 1;
        }
        self.leave();
    }

    fn bench(&mut self, _handle: &EngineHandle, params: &BenchParams) -> Result<String, EngineError> {
        self.enter("bench");
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.leave();
        Ok(format!(
            "| model | backend | test | t/s |\n| --- | --- | --- | --- |\n| scripted | cpu | pp {} | 100.00 ± 0.00 |\n| scripted | cpu | tg {} | 20.00 ± 0.00 |\n",
            params.prompt_tokens, params.gen_tokens
        ))
    }
}
