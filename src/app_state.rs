use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use crate::engine::{EngineError, InferenceEngine};

/// 全局共享状态（Rocket managed）：
/// - engine: 启动时加载好的模型，只读共享
/// - template_path: /download/template 返回的文件
pub struct AppState {
    pub engine: Arc<dyn InferenceEngine>,
    pub template_path: PathBuf,
}

impl AppState {
    pub fn new(engine: Arc<dyn InferenceEngine>, template_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            template_path: template_path.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.engine.model_id()
    }

    /// 对单条消息生成回复；错误原样返回，由调用方决定如何呈现
    pub async fn respond(&self, message: &str) -> Result<String, EngineError> {
        info!("Generating response...");
        let start = Instant::now();

        match self.engine.generate(message).await {
            Ok(generation) => {
                info!(
                    prompt_tokens = generation.prompt_tokens,
                    generated_tokens = generation.generated_tokens,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Response generated successfully."
                );
                Ok(generation.text)
            }
            Err(e) => {
                error!("Error generating response: {e}");
                Err(e)
            }
        }
    }
}
