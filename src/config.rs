use std::path::PathBuf;

use rocket::data::{ByteUnit, Limits, ToByteUnit};
use rocket::figment::providers::{Env, Format, Toml};
use rocket::figment::{Figment, Profile};
use serde::{Deserialize, Serialize};

use crate::generation::GenerationParams;

/// 默认监听端口（5000 常被占用）
pub const DEFAULT_PORT: u16 = 5001;

/// JSON body 上限；Rocket 默认 1 MiB 太小，长消息会被截断
pub fn json_limit() -> ByteUnit {
    64.mebibytes()
}

/// 模型来源：HF repo + GGUF 文件名，或本地路径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub repo: String,
    pub filename: String,
    pub tokenizer_repo: String,
    pub revision: Option<String>,
    /// 设置后跳过下载，直接读本地 GGUF
    pub weights_path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    /// 除 GGUF 元数据外额外识别的结束符
    pub eos_tokens: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: "tiiuae/Falcon3-7B-Instruct-GGUF".to_string(),
            filename: "Falcon3-7B-Instruct-q4_k_m.gguf".to_string(),
            tokenizer_repo: "tiiuae/Falcon3-7B-Instruct".to_string(),
            revision: None,
            weights_path: None,
            tokenizer_path: None,
            eos_tokens: vec!["<|endoftext|>".to_string(), "</s>".to_string()],
        }
    }
}

impl ModelConfig {
    /// 日志和 /health 里展示的模型标识
    pub fn model_id(&self) -> String {
        match &self.weights_path {
            Some(path) => path.display().to_string(),
            None => format!("{}/{}", self.repo, self.filename),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model: ModelConfig,
    pub generation: GenerationParams,
    pub template_path: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            generation: GenerationParams::default(),
            // 占位路径，模板功能尚未实现
            template_path: PathBuf::from("path_to_template.zip"),
        }
    }
}

impl ChatConfig {
    /// 从 figment 的 `chat` 段读取；缺省字段全部走默认值
    pub fn from_figment(figment: &Figment) -> Result<Self, rocket::figment::Error> {
        figment.focus("chat").extract()
    }
}

/// Rocket 默认值 < 端口 5001 < Rocket.toml < ROCKET_* 环境变量
pub fn figment() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(("port", DEFAULT_PORT))
        .merge(("limits", Limits::default().limit("json", json_limit())))
        .merge(Toml::file(Env::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(Env::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
        .select(Profile::from_env_or("ROCKET_PROFILE", rocket::Config::DEFAULT_PROFILE))
}
