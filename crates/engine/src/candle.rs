//! Local inference backend built on [Candle](https://github.com/huggingface/candle).
//!
//! Runs GGUF-quantized Llama-family models on the host. Candle has no
//! native handles, so this backend keeps its own handle tables and gives
//! the bridge the same null-on-failure allocation contract a C engine would.
//!
//! A context owns its own copy of the weights; the key-value cache lives
//! inside them and is reset whenever a forward pass starts at position 0.

use crate::native::{BenchParams, EngineHandle, LoadParams, NativeBackend, RawHandle};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama as qlm;
use llamachat_core::EngineError;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const EOS_TOKENS: [&str; 4] = ["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

/// Sampling settings for new samplers.
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub seed: u64,
    pub temperature: f64,
    pub top_p: Option<f64>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            temperature: 0.7,
            top_p: Some(0.9),
        }
    }
}

struct LoadedModel {
    weights: qlm::ModelWeights,
    tokenizer: Tokenizer,
    eos: Vec<u32>,
    device: Device,
    name: String,
    size_bytes: u64,
}

struct Context {
    model: u64,
    weights: qlm::ModelWeights,
    capacity: usize,
    position: usize,
    pending: Option<u32>,
    generated: Vec<u32>,
    decoded_len: usize,
}

/// Candle-backed [`NativeBackend`].
pub struct CandleBackend {
    sampling: SamplerSettings,
    next_handle: u64,
    models: HashMap<u64, LoadedModel>,
    contexts: HashMap<u64, Context>,
    batches: HashMap<u64, u32>,
    samplers: HashMap<u64, LogitsProcessor>,
}

impl CandleBackend {
    pub fn new(sampling: SamplerSettings) -> Self {
        Self {
            sampling,
            next_handle: 0,
            models: HashMap::new(),
            contexts: HashMap::new(),
            batches: HashMap::new(),
            samplers: HashMap::new(),
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn read_model(path: &Path, device: &Device) -> Result<LoadedModel, EngineError> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| EngineError::Backend(format!("Failed to open GGUF file: {e}")))?;
        let size_bytes = file.metadata().map(|m| m.len()).unwrap_or_default();

        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| EngineError::Backend(format!("Failed to parse GGUF file: {e}")))?;
        let weights = qlm::ModelWeights::from_gguf(gguf, &mut file, device)
            .map_err(|e| EngineError::Backend(format!("Failed to load model weights: {e}")))?;

        let tokenizer_path = path.with_file_name("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EngineError::Backend(format!(
                "Failed to load tokenizer from {}: {e}",
                tokenizer_path.display()
            ))
        })?;

        let eos: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();

        Ok(LoadedModel {
            weights,
            tokenizer,
            eos: if eos.is_empty() { vec![2] } else { eos },
            device: device.clone(),
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".into()),
            size_bytes,
        })
    }

    fn insert_model(&mut self, model: LoadedModel) -> RawHandle {
        let h = self.handle();
        self.models.insert(h, model);
        RawHandle(h)
    }

    /// Feed `tokens` at the context's current position and return the logits.
    fn forward(&mut self, context: u64, tokens: &[u32]) -> Result<Tensor, EngineError> {
        let ctx = self
            .contexts
            .get_mut(&context)
            .ok_or_else(|| EngineError::InvalidState("unknown context".into()))?;
        let device = self
            .models
            .get(&ctx.model)
            .map(|m| m.device.clone())
            .ok_or_else(|| EngineError::InvalidState("context outlived its model".into()))?;

        let input = Tensor::new(tokens, &device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;
        let logits = ctx
            .weights
            .forward(&input, ctx.position)
            .and_then(|l| l.squeeze(0))
            .map_err(map_candle_err)?;
        ctx.position += tokens.len();
        Ok(logits)
    }

    fn sample(&mut self, sampler: u64, logits: &Tensor) -> Result<u32, EngineError> {
        self.samplers
            .get_mut(&sampler)
            .ok_or_else(|| EngineError::InvalidState("unknown sampler".into()))?
            .sample(logits)
            .map_err(map_candle_err)
    }

    fn tokenizer_for(&self, context: u64) -> Result<(&Tokenizer, &[u32]), EngineError> {
        self.contexts
            .get(&context)
            .and_then(|c| self.models.get(&c.model))
            .map(|m| (&m.tokenizer, m.eos.as_slice()))
            .ok_or_else(|| EngineError::InvalidState("unknown context".into()))
    }

    fn reset(&mut self, context: u64) {
        if let Some(ctx) = self.contexts.get_mut(&context) {
            ctx.position = 0;
            ctx.pending = None;
            ctx.generated.clear();
            ctx.decoded_len = 0;
        }
    }

    /// Tokens per second for one pass of `n` tokens, fed all at once or one by one.
    fn timed_pass(&mut self, context: u64, n: u32, one_by_one: bool) -> Result<f64, EngineError> {
        self.reset(context);
        let tokens: Vec<u32> = (0..n).map(|i| 1 + i % 100).collect();
        let start = Instant::now();
        if one_by_one {
            for t in &tokens {
                self.forward(context, std::slice::from_ref(t))?;
            }
        } else {
            self.forward(context, &tokens)?;
        }
        let secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
        Ok(f64::from(n) / secs)
    }
}

impl Default for CandleBackend {
    fn default() -> Self {
        Self::new(SamplerSettings::default())
    }
}

impl NativeBackend for CandleBackend {
    fn backend_init(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn system_info(&self) -> String {
        format!(
            "candle | AVX = {} | NEON = {} | F16C = {} | CUDA = {} | Metal = {}",
            u8::from(candle_core::utils::with_avx()),
            u8::from(candle_core::utils::with_neon()),
            u8::from(candle_core::utils::with_f16c()),
            u8::from(candle_core::utils::cuda_is_available()),
            u8::from(candle_core::utils::metal_is_available()),
        )
    }

    fn load_model_with_config(
        &mut self,
        path: &Path,
        params: &LoadParams,
    ) -> Result<RawHandle, EngineError> {
        let device = if params.gpu_layers > 0 {
            Device::cuda_if_available(0).map_err(map_candle_err)?
        } else {
            Device::Cpu
        };
        if params.rope_scaling != 1.0 {
            debug!(rope_scaling = params.rope_scaling, "RoPE scaling is fixed by the GGUF metadata");
        }
        let model = Self::read_model(path, &device)?;
        info!(name = %model.name, device = ?device, "GGUF model loaded");
        Ok(self.insert_model(model))
    }

    fn load_model(&mut self, path: &Path) -> RawHandle {
        match Self::read_model(path, &Device::Cpu) {
            Ok(model) => self.insert_model(model),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Model load failed");
                RawHandle::NULL
            }
        }
    }

    fn new_context(&mut self, model: RawHandle, params: &LoadParams) -> RawHandle {
        let Some(weights) = self.models.get(&model.0).map(|m| m.weights.clone()) else {
            return RawHandle::NULL;
        };
        let h = self.handle();
        self.contexts.insert(
            h,
            Context {
                model: model.0,
                weights,
                capacity: params.context_size as usize,
                position: 0,
                pending: None,
                generated: Vec::new(),
                decoded_len: 0,
            },
        );
        RawHandle(h)
    }

    fn new_batch(&mut self, n_tokens: u32, _embd: u32, _n_seq_max: u32) -> RawHandle {
        if n_tokens == 0 {
            return RawHandle::NULL;
        }
        let h = self.handle();
        self.batches.insert(h, n_tokens);
        RawHandle(h)
    }

    fn new_sampler(&mut self) -> RawHandle {
        let s = self.sampling;
        let h = self.handle();
        self.samplers
            .insert(h, LogitsProcessor::new(s.seed, Some(s.temperature), s.top_p));
        RawHandle(h)
    }

    fn free_model(&mut self, model: RawHandle) {
        self.models.remove(&model.0);
    }

    fn free_context(&mut self, context: RawHandle) {
        self.contexts.remove(&context.0);
    }

    fn free_batch(&mut self, batch: RawHandle) {
        self.batches.remove(&batch.0);
    }

    fn free_sampler(&mut self, sampler: RawHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn completion_init(
        &mut self,
        handle: &EngineHandle,
        text: &str,
        format_chat: bool,
        _n_len: u32,
    ) -> Result<u32, EngineError> {
        let ctx_id = handle.context.0;
        let prompt = chat_wrap(text, format_chat);

        let (tokenizer, _) = self.tokenizer_for(ctx_id)?;
        let tokens = tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Backend(format!("Tokenization failed: {e}")))?
            .get_ids()
            .to_vec();

        let batch_capacity = self.batches.get(&handle.batch.0).copied().unwrap_or(0) as usize;
        if tokens.len() > batch_capacity {
            return Err(EngineError::Generation(format!(
                "prompt of {} tokens exceeds batch capacity {batch_capacity}",
                tokens.len()
            )));
        }
        let capacity = self.contexts.get(&ctx_id).map(|c| c.capacity).unwrap_or(0);
        if tokens.len() >= capacity {
            return Err(EngineError::Generation(format!(
                "prompt of {} tokens does not fit context of {capacity}",
                tokens.len()
            )));
        }

        debug!(prompt_tokens = tokens.len(), "Evaluating prompt");
        self.reset(ctx_id);
        let logits = self.forward(ctx_id, &tokens)?;
        let first = self.sample(handle.sampler.0, &logits)?;
        if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
            ctx.pending = Some(first);
        }
        Ok(0)
    }

    fn completion_loop(
        &mut self,
        handle: &EngineHandle,
        n_len: u32,
        n_cur: &mut u32,
    ) -> Result<Option<String>, EngineError> {
        if *n_cur >= n_len {
            return Ok(None);
        }
        let ctx_id = handle.context.0;
        let (token, at_capacity) = match self.contexts.get(&ctx_id) {
            Some(ctx) => (ctx.pending, ctx.position >= ctx.capacity),
            None => return Err(EngineError::InvalidState("unknown context".into())),
        };
        let Some(token) = token else {
            return Ok(None);
        };
        let (tokenizer, eos) = self.tokenizer_for(ctx_id)?;
        if eos.contains(&token) || at_capacity {
            return Ok(None);
        }

        // Incremental detokenization: hold back output until it is valid UTF-8.
        let (fragment, decoded_len) = {
            let ctx = self
                .contexts
                .get(&ctx_id)
                .ok_or_else(|| EngineError::InvalidState("unknown context".into()))?;
            let mut generated = ctx.generated.clone();
            generated.push(token);
            let full = tokenizer
                .decode(&generated, true)
                .map_err(|e| EngineError::Backend(format!("Detokenization failed: {e}")))?;
            match full.get(ctx.decoded_len..) {
                Some(tail) if !tail.ends_with('\u{FFFD}') => (tail.to_string(), full.len()),
                _ => (String::new(), ctx.decoded_len),
            }
        };

        if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
            ctx.generated.push(token);
            ctx.decoded_len = decoded_len;
        }

        let logits = self.forward(ctx_id, &[token])?;
        let next = self.sample(handle.sampler.0, &logits)?;
        if let Some(ctx) = self.contexts.get_mut(&ctx_id) {
            ctx.pending = Some(next);
        }
        *n_cur += 1;
        Ok(Some(fragment))
    }

    fn kv_cache_clear(&mut self, context: RawHandle) {
        self.reset(context.0);
    }

    fn bench(&mut self, handle: &EngineHandle, params: &BenchParams) -> Result<String, EngineError> {
        let ctx_id = handle.context.0;
        let (name, size_bytes) = self
            .models
            .get(&handle.model.0)
            .map(|m| (m.name.clone(), m.size_bytes))
            .ok_or_else(|| EngineError::InvalidState("unknown model".into()))?;

        let reps = params.repetitions.max(1);
        let mut pp = Vec::with_capacity(reps as usize);
        let mut tg = Vec::with_capacity(reps as usize);
        for _ in 0..reps {
            pp.push(self.timed_pass(ctx_id, params.prompt_tokens, false)?);
            tg.push(self.timed_pass(ctx_id, params.gen_tokens, true)?);
        }
        self.reset(ctx_id);

        let (pp_avg, pp_std) = mean_std(&pp);
        let (tg_avg, tg_std) = mean_std(&tg);
        let size_gib = size_bytes as f64 / 1024.0 / 1024.0 / 1024.0;
        Ok(format!(
            "| model | size | backend | test | t/s |\n\
             | --- | --- | --- | --- | --- |\n\
             | {name} | {size_gib:.2} GiB | candle | pp {} | {pp_avg:.2} ± {pp_std:.2} |\n\
             | {name} | {size_gib:.2} GiB | candle | tg {} | {tg_avg:.2} ± {tg_std:.2} |\n",
            params.prompt_tokens, params.gen_tokens
        ))
    }
}

fn mean_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Wrap a plain prompt as a single ChatML user turn. Prompts that already
/// carry role markers are passed through untouched.
fn chat_wrap(text: &str, format_chat: bool) -> String {
    let templated = ["<|im_start|>", "<|begin_of_text|>", "<|start_header_id|>"]
        .iter()
        .any(|m| text.trim_start().starts_with(m));
    if format_chat && !templated {
        format!("<|im_start|>user\n{text}<|im_end|>\n<|im_start|>assistant\n")
    } else {
        text.to_string()
    }
}

/// Forward-pass failures are reported as transport errors, which a cache
/// clear recovers from.
fn map_candle_err(e: candle_core::Error) -> EngineError {
    EngineError::Transport(format!("Candle inference error: {e}"))
}
