use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

// Candle 相关
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama as qllama;
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;

use crate::config::ModelConfig;
use crate::generation::{generate_tokens, GenerationParams, LogitsSource};

/// 请求期的生成错误；由 HTTP 层决定状态码
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("prompt produced no tokens")]
    EmptyPrompt,

    #[error("input length is {tokens} tokens, but max_length is set to {max_length}")]
    PromptTooLong { tokens: usize, max_length: usize },

    #[error("generation worker failed: {0}")]
    Worker(String),
}

/// 一次生成的结果
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// 统一的推理引擎抽象
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn model_id(&self) -> &str;

    /// 一次性生成完整结果（不流式）
    async fn generate(&self, prompt: &str) -> Result<Generation, EngineError>;
}

pub struct CandleEngine {
    model_id: String,
    inner: Arc<CandleModel>,
}

struct CandleModel {
    device: Device,
    // forward 需要 &mut（KV cache），所以串行化
    model: Mutex<qllama::ModelWeights>,
    tokenizer: Tokenizer,
    eos_tokens: Vec<u32>,
    params: GenerationParams,
}

impl CandleEngine {
    /// 进程启动时调用一次；任何失败都应终止启动
    pub fn load(cfg: &ModelConfig, params: GenerationParams) -> anyhow::Result<Arc<Self>> {
        // 设备：固定 CPU
        let device = Device::Cpu;
        let model_id = cfg.model_id();

        info!("Loading tokenizer...");
        let tokenizer_path = resolve_tokenizer(cfg)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Error loading tokenizer {}: {e}", tokenizer_path.display())
        })?;
        info!("Tokenizer loaded successfully.");

        info!(model = %model_id, "Loading model...");
        let model_path = resolve_weights(cfg)?;
        let mut file = std::fs::File::open(&model_path)
            .with_context(|| format!("failed to open weights {}", model_path.display()))?;
        let start = Instant::now();

        let content = gguf_file::Content::read(&mut file)
            .with_context(|| format!("failed to read GGUF header from {}", model_path.display()))?;
        let mut total_size_in_bytes = 0usize;
        for (_, tensor) in content.tensor_infos.iter() {
            let elem_count = tensor.shape.elem_count();
            total_size_in_bytes +=
                elem_count * tensor.ggml_dtype.type_size() / tensor.ggml_dtype.block_size();
        }
        info!(
            "loaded {} tensors ({}) in {:.2}s",
            content.tensor_infos.len(),
            format_size(total_size_in_bytes),
            start.elapsed().as_secs_f32(),
        );

        let mut eos_tokens: Vec<u32> = content
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok())
            .into_iter()
            .collect();
        for token in &cfg.eos_tokens {
            if let Some(id) = tokenizer.token_to_id(token) {
                if !eos_tokens.contains(&id) {
                    eos_tokens.push(id);
                }
            }
        }
        debug!(?eos_tokens, "end-of-sequence ids");

        let model = qllama::ModelWeights::from_gguf(content, &mut file, &device)
            .context("failed to build model weights")?;
        info!("Model loaded successfully.");
        info!("Model is on device (CPU).");

        Ok(Arc::new(Self {
            model_id,
            inner: Arc::new(CandleModel {
                device,
                model: Mutex::new(model),
                tokenizer,
                eos_tokens,
                params,
            }),
        }))
    }
}

fn hub_repo(api: &Api, repo_id: &str, revision: Option<&str>) -> hf_hub::api::sync::ApiRepo {
    match revision {
        Some(rev) => api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(repo_id.to_string()),
    }
}

fn resolve_tokenizer(cfg: &ModelConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &cfg.tokenizer_path {
        return Ok(path.clone());
    }
    let api = Api::new().context("failed to initialize HuggingFace Hub API")?;
    hub_repo(&api, &cfg.tokenizer_repo, cfg.revision.as_deref())
        .get("tokenizer.json")
        .with_context(|| format!("failed to download tokenizer.json from {}", cfg.tokenizer_repo))
}

fn resolve_weights(cfg: &ModelConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &cfg.weights_path {
        return Ok(path.clone());
    }
    let api = Api::new().context("failed to initialize HuggingFace Hub API")?;
    hub_repo(&api, &cfg.repo, cfg.revision.as_deref())
        .get(&cfg.filename)
        .with_context(|| format!("failed to download {} from {}", cfg.filename, cfg.repo))
}

/// 把量化权重接到解码循环上
struct QuantizedSource<'a> {
    model: &'a mut qllama::ModelWeights,
    device: &'a Device,
}

impl LogitsSource for QuantizedSource<'_> {
    fn next_logits(&mut self, input: &[u32], index_pos: usize) -> candle_core::Result<Tensor> {
        let input = Tensor::new(input, self.device)?.unsqueeze(0)?;
        self.model.forward(&input, index_pos)?.squeeze(0)
    }
}

impl CandleModel {
    fn generate_blocking(&self, prompt: &str) -> Result<Generation, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EngineError::Tokenizer(format!("encode: {e}")))?;
        let prompt_tokens = encoding.get_ids();
        if prompt_tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let tokens = {
            let mut model = self.model.lock();
            let mut source = QuantizedSource {
                model: &mut *model,
                device: &self.device,
            };
            generate_tokens(&mut source, prompt_tokens, &self.eos_tokens, &self.params)?
        };

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| EngineError::Tokenizer(format!("decode: {e}")))?;

        Ok(Generation {
            text,
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: tokens.len().saturating_sub(prompt_tokens.len()),
        })
    }
}

// 小工具：人类可读的字节数
fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}

#[async_trait]
impl InferenceEngine for CandleEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, EngineError> {
        let inner = self.inner.clone();
        let prompt = prompt.to_owned();
        tokio::task::spawn_blocking(move || inner.generate_blocking(&prompt))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}
