use serde::{Deserialize, Serialize};

/// 客户端缺少 message 时返回的固定文案
pub const NO_MESSAGE: &str = "No message received";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
}

impl ChatRequest {
    /// 空字符串与缺失同等对待
    pub fn into_message(self) -> Option<String> {
        self.message.filter(|m| !m.is_empty())
    }
}

/// 成功与失败共用同一个 body 形状，状态码区分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

impl ChatResponse {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}
