//! LLM客户端 - 提供统一的LLM服务接口

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LLMConfig;
use crate::error::{ResearchError, Result};
use crate::llm::router::AgentRole;

pub mod providers;
pub mod types;
pub mod utils;

use providers::RigChatModel;
use types::{ChatMessage, ChatModel, ChatRequest, ProviderError};
use utils::{estimate_token_usage, parse_json_response};

/// 推理后端：rig provider走原生Extractor，其余实现走文本解析
#[derive(Clone)]
enum Backend {
    Rig(Arc<RigChatModel>),
    Custom(Arc<dyn ChatModel>),
}

impl Backend {
    fn chat_model(&self) -> &dyn ChatModel {
        match self {
            Backend::Rig(model) => model.as_ref(),
            Backend::Custom(model) => model.as_ref(),
        }
    }
}

/// LLM客户端 - 绑定了角色、模型与重试策略
#[derive(Clone)]
pub struct LLMClient {
    role: AgentRole,
    backend: Backend,
    max_tokens: u32,
    retry_attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl LLMClient {
    /// 创建新的LLM客户端
    pub fn new(role: AgentRole, model: Arc<dyn ChatModel>, max_tokens: u32, config: &LLMConfig) -> Self {
        Self::with_backend(role, Backend::Custom(model), max_tokens, config)
    }

    /// 基于rig provider创建客户端，结构化输出交给provider的Extractor
    pub fn from_rig(role: AgentRole, model: Arc<RigChatModel>, max_tokens: u32, config: &LLMConfig) -> Self {
        Self::with_backend(role, Backend::Rig(model), max_tokens, config)
    }

    fn with_backend(role: AgentRole, backend: Backend, max_tokens: u32, config: &LLMConfig) -> Self {
        Self {
            role,
            backend,
            max_tokens,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// 覆盖单次调用超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn model_name(&self) -> &str {
        self.backend.chat_model().model_name()
    }

    #[cfg(test)]
    pub(crate) fn uses_provider_extractor(&self) -> bool {
        matches!(self.backend, Backend::Rig(_))
    }

    /// 通用重试逻辑，用于处理异步操作的重试机制
    async fn retry_with_backoff<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_retries = self.retry_attempts;
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    retries += 1;
                    tracing::warn!(
                        role = %self.role,
                        attempt = retries,
                        max_attempts = max_retries,
                        error = %err,
                        "调用模型服务出错"
                    );
                    if retries >= max_retries {
                        return Err(ResearchError::ProviderTransient {
                            role: self.role.to_string(),
                            attempts: retries,
                            source: err,
                        });
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// 单次调用，带超时
    async fn complete_once(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let input = format!("{}\n{}", request.system_prompt, request.prompt);
        let model = self.backend.chat_model();
        let response = tokio::time::timeout(self.timeout, model.complete(request))
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))??;

        let usage = estimate_token_usage(&input, &response);
        tracing::debug!(
            role = %self.role,
            model = model.model_name(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "模型调用完成"
        );
        Ok(response)
    }

    fn request(&self, system_prompt: &str, history: &[ChatMessage], prompt: &str) -> ChatRequest {
        ChatRequest {
            system_prompt: system_prompt.to_string(),
            history: history.to_vec(),
            prompt: prompt.to_string(),
            max_tokens: Some(self.max_tokens),
        }
    }

    /// 单轮对话
    pub async fn prompt(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        self.chat(system_prompt, &[], user_prompt).await
    }

    /// 携带历史的多轮对话
    pub async fn chat(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_prompt: &str,
    ) -> Result<String> {
        self.retry_with_backoff(|| async {
            self.complete_once(self.request(system_prompt, history, user_prompt))
                .await
        })
        .await
    }

    /// 数据提取方法，格式错误的输出与其他暂时性错误一样会被重试
    pub async fn extract<T>(&self, system_prompt: &str, user_prompt: &str) -> Result<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        self.extract_with_history(system_prompt, &[], user_prompt).await
    }

    pub async fn extract_with_history<T>(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_prompt: &str,
    ) -> Result<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        match &self.backend {
            Backend::Rig(model) => {
                self.retry_with_backoff(|| async {
                    let request = self.request(system_prompt, history, user_prompt);
                    tokio::time::timeout(self.timeout, model.extract::<T>(request))
                        .await
                        .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))?
                })
                .await
            }
            Backend::Custom(_) => self.extract_from_text(system_prompt, history, user_prompt).await,
        }
    }

    /// 没有原生结构化输出的后端：在prompt中附带Schema并解析文本回复
    async fn extract_from_text<T>(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_prompt: &str,
    ) -> Result<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a>,
    {
        let schema = serde_json::to_string_pretty(&schemars::schema_for!(T))
            .map_err(|e| ResearchError::configuration(format!("无法生成输出Schema: {}", e)))?;
        let user_prompt = format!(
            "{}\n\n请只输出一个符合以下JSON Schema的JSON对象，不要输出其他内容：\n```json\n{}\n```",
            user_prompt, schema
        );

        self.retry_with_backoff(|| async {
            let response = self
                .complete_once(self.request(system_prompt, history, &user_prompt))
                .await?;
            parse_json_response::<T>(&response)
        })
        .await
    }
}
