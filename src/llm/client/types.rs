use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 推理服务边界上的错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("请求被限流: {0}")]
    RateLimited(String),
    #[error("模型调用超时 ({0}秒)")]
    Timeout(u64),
    #[error("模型返回内容格式错误: {0}")]
    Malformed(String),
    #[error("模型服务不可用: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// 根据底层错误信息归类
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("too many requests") {
            ProviderError::RateLimited(message)
        } else {
            ProviderError::Unavailable(message)
        }
    }
}

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// 对话历史中的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一次推理请求：角色提示词 + 对话历史 + 输出上限
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

/// 推理后端的抽象，只负责 prompt in / completion out
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError>;

    fn model_name(&self) -> &str;
}

/// Token使用情况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}
