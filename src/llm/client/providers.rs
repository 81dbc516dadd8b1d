//! LLM Provider支持模块

use async_trait::async_trait;
use rig::{
    agent::Agent,
    client::CompletionClient,
    completion::{Chat, Message, PromptError},
    extractor::{ExtractionError, Extractor},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::LLMConfig;
use crate::error::{ResearchError, Result};
use crate::llm::client::types::{ChatMessage, ChatModel, ChatRequest, ChatRole, ProviderError};
use crate::llm::router::ModelBinding;

/// 统一的Provider客户端枚举
#[derive(Clone)]
pub enum ProviderClient {
    OpenAI(rig::providers::openai::Client),
    Anthropic(rig::providers::anthropic::Client),
    DeepSeek(rig::providers::deepseek::Client),
    Moonshot(rig::providers::moonshot::Client),
    Mistral(rig::providers::mistral::Client),
    OpenRouter(rig::providers::openrouter::Client),
    Ollama(rig::providers::ollama::Client),
}

impl ProviderClient {
    /// 根据路由结果创建相应的provider客户端
    ///
    /// `provider/model`形式下由routing hint决定provider，其余情况使用前缀。
    pub fn new(binding: &ModelBinding, config: &LLMConfig) -> Result<Self> {
        let provider = binding
            .routing_hint
            .as_deref()
            .unwrap_or(&binding.spec.provider);

        if provider == "ollama" {
            let client = rig::providers::ollama::Client::builder().build();
            return Ok(ProviderClient::Ollama(client));
        }

        let api_key = config.api_key_for(provider).ok_or_else(|| {
            ResearchError::configuration(format!(
                "角色 {} 使用的provider {} 缺少API KEY（{}_API_KEY）",
                binding.role,
                provider,
                provider.to_uppercase()
            ))
        })?;

        match provider {
            "openai" => {
                let mut builder = rig::providers::openai::Client::builder(api_key);
                if let Some(base_url) = &binding.base_url {
                    builder = builder.base_url(base_url);
                }
                Ok(ProviderClient::OpenAI(builder.build()))
            }
            "anthropic" => {
                let mut builder = rig::providers::anthropic::ClientBuilder::new(api_key);
                if let Some(base_url) = &binding.base_url {
                    builder = builder.base_url(base_url);
                }
                let client = builder.build().map_err(|e| {
                    ResearchError::configuration(format!("无法创建Anthropic客户端: {}", e))
                })?;
                Ok(ProviderClient::Anthropic(client))
            }
            "deepseek" => {
                let client = rig::providers::deepseek::Client::builder(api_key).build();
                Ok(ProviderClient::DeepSeek(client))
            }
            "moonshot" => {
                let client = rig::providers::moonshot::Client::builder(api_key).build();
                Ok(ProviderClient::Moonshot(client))
            }
            "mistral" => {
                let client = rig::providers::mistral::Client::builder(api_key).build();
                Ok(ProviderClient::Mistral(client))
            }
            "openrouter" => {
                let client = rig::providers::openrouter::Client::builder(api_key).build();
                Ok(ProviderClient::OpenRouter(client))
            }
            other => Err(ResearchError::configuration(format!(
                "不支持的provider: {}",
                other
            ))),
        }
    }

    /// 创建Agent
    fn create_agent(
        &self,
        model: &str,
        system_prompt: &str,
        max_tokens: u64,
        temperature: Option<f64>,
    ) -> ProviderAgent {
        macro_rules! build_agent {
            ($builder:expr) => {{
                let mut builder = $builder.preamble(system_prompt).max_tokens(max_tokens);
                if let Some(temperature) = temperature {
                    builder = builder.temperature(temperature);
                }
                builder.build()
            }};
        }

        match self {
            ProviderClient::OpenAI(client) => ProviderAgent::OpenAI(build_agent!(
                client
                    .completion_model(model)
                    .completions_api()
                    .into_agent_builder()
            )),
            ProviderClient::Anthropic(client) => {
                ProviderAgent::Anthropic(build_agent!(client.agent(model)))
            }
            ProviderClient::DeepSeek(client) => {
                ProviderAgent::DeepSeek(build_agent!(client.agent(model)))
            }
            ProviderClient::Moonshot(client) => {
                ProviderAgent::Moonshot(build_agent!(client.agent(model)))
            }
            ProviderClient::Mistral(client) => {
                ProviderAgent::Mistral(build_agent!(client.agent(model)))
            }
            ProviderClient::OpenRouter(client) => {
                ProviderAgent::OpenRouter(build_agent!(client.agent(model)))
            }
            ProviderClient::Ollama(client) => ProviderAgent::Ollama(build_agent!(client.agent(model))),
        }
    }

    /// 创建Extractor，由provider的工具调用保证输出符合`T`的Schema
    fn create_extractor<T>(&self, model: &str, system_prompt: &str, max_tokens: u64) -> ProviderExtractor<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        macro_rules! build_extractor {
            ($builder:expr) => {
                $builder.preamble(system_prompt).max_tokens(max_tokens).build()
            };
        }

        match self {
            ProviderClient::OpenAI(client) => ProviderExtractor::OpenAI(build_extractor!(
                client.extractor_completions_api::<T>(model)
            )),
            ProviderClient::Anthropic(client) => {
                ProviderExtractor::Anthropic(build_extractor!(client.extractor::<T>(model)))
            }
            ProviderClient::DeepSeek(client) => {
                ProviderExtractor::DeepSeek(build_extractor!(client.extractor::<T>(model)))
            }
            ProviderClient::Moonshot(client) => {
                ProviderExtractor::Moonshot(build_extractor!(client.extractor::<T>(model)))
            }
            ProviderClient::Mistral(client) => {
                ProviderExtractor::Mistral(build_extractor!(client.extractor::<T>(model)))
            }
            ProviderClient::OpenRouter(client) => {
                ProviderExtractor::OpenRouter(build_extractor!(client.extractor::<T>(model)))
            }
            ProviderClient::Ollama(client) => {
                ProviderExtractor::Ollama(build_extractor!(client.extractor::<T>(model)))
            }
        }
    }
}

/// 统一的Agent枚举
pub enum ProviderAgent {
    OpenAI(Agent<rig::providers::openai::CompletionModel>),
    Anthropic(Agent<rig::providers::anthropic::completion::CompletionModel>),
    DeepSeek(Agent<rig::providers::deepseek::CompletionModel>),
    Moonshot(Agent<rig::providers::moonshot::CompletionModel>),
    Mistral(Agent<rig::providers::mistral::CompletionModel>),
    OpenRouter(Agent<rig::providers::openrouter::CompletionModel>),
    Ollama(Agent<rig::providers::ollama::CompletionModel<reqwest::Client>>),
}

impl ProviderAgent {
    /// 携带对话历史执行一次对话
    pub async fn chat(&self, prompt: &str, history: Vec<Message>) -> Result<String, PromptError> {
        match self {
            ProviderAgent::OpenAI(agent) => agent.chat(prompt, history).await,
            ProviderAgent::Anthropic(agent) => agent.chat(prompt, history).await,
            ProviderAgent::DeepSeek(agent) => agent.chat(prompt, history).await,
            ProviderAgent::Moonshot(agent) => agent.chat(prompt, history).await,
            ProviderAgent::Mistral(agent) => agent.chat(prompt, history).await,
            ProviderAgent::OpenRouter(agent) => agent.chat(prompt, history).await,
            ProviderAgent::Ollama(agent) => agent.chat(prompt, history).await,
        }
    }
}

/// 统一的Extractor枚举
pub enum ProviderExtractor<T>
where
    T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
{
    OpenAI(Extractor<rig::providers::openai::CompletionModel, T>),
    Anthropic(Extractor<rig::providers::anthropic::completion::CompletionModel, T>),
    DeepSeek(Extractor<rig::providers::deepseek::CompletionModel, T>),
    Moonshot(Extractor<rig::providers::moonshot::CompletionModel, T>),
    Mistral(Extractor<rig::providers::mistral::CompletionModel, T>),
    OpenRouter(Extractor<rig::providers::openrouter::CompletionModel, T>),
    Ollama(Extractor<rig::providers::ollama::CompletionModel<reqwest::Client>, T>),
}

impl<T> ProviderExtractor<T>
where
    T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
{
    /// 执行提取
    pub async fn extract(&self, prompt: &str) -> Result<T, ExtractionError> {
        match self {
            ProviderExtractor::OpenAI(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::Anthropic(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::DeepSeek(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::Moonshot(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::Mistral(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::OpenRouter(extractor) => extractor.extract(prompt).await,
            ProviderExtractor::Ollama(extractor) => extractor.extract(prompt).await,
        }
    }
}

/// 基于rig的推理后端
pub struct RigChatModel {
    client: ProviderClient,
    model: String,
    temperature: Option<f64>,
}

impl RigChatModel {
    pub fn new(binding: &ModelBinding, config: &LLMConfig) -> Result<Self> {
        Ok(Self {
            client: ProviderClient::new(binding, config)?,
            model: binding.spec.model.clone(),
            temperature: config.temperature,
        })
    }

    /// 结构化提取；Extractor不接受对话历史，历史以文本形式并入prompt
    pub async fn extract<T>(&self, request: ChatRequest) -> Result<T, ProviderError>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        let extractor = self.client.create_extractor::<T>(
            &self.model,
            &request.system_prompt,
            request.max_tokens.unwrap_or(8192) as u64,
        );
        let prompt = with_history_prefix(&request.history, &request.prompt);

        extractor
            .extract(&prompt)
            .await
            .map_err(|e| match e {
                ExtractionError::CompletionError(_) => ProviderError::classify(e.to_string()),
                other => ProviderError::Malformed(other.to_string()),
            })
    }
}

#[async_trait]
impl ChatModel for RigChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let agent = self.client.create_agent(
            &self.model,
            &request.system_prompt,
            request.max_tokens.unwrap_or(8192) as u64,
            self.temperature,
        );
        let history = request.history.iter().map(to_rig_message).collect();

        agent
            .chat(&request.prompt, history)
            .await
            .map_err(|e| ProviderError::classify(e.to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn to_rig_message(message: &ChatMessage) -> Message {
    match message.role {
        ChatRole::User => Message::user(message.content.clone()),
        ChatRole::Assistant => Message::assistant(message.content.clone()),
    }
}

/// 把对话历史渲染在本轮输入之前
fn with_history_prefix(history: &[ChatMessage], prompt: &str) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }

    let mut text = String::from("# 此前的对话\n");
    for message in history {
        let speaker = match message.role {
            ChatRole::User => "用户",
            ChatRole::Assistant => "助手",
        };
        text.push_str(&format!("{}: {}\n", speaker, message.content));
    }
    text.push_str("\n# 本轮输入\n");
    text.push_str(prompt);
    text
}
