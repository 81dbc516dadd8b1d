//! 模型路由 - 把逻辑角色解析为配置好的对话客户端

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ResearchError, Result};
use crate::llm::client::LLMClient;
use crate::llm::client::providers::RigChatModel;
use crate::llm::client::types::ChatModel;

/// 流程中的逻辑角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Researcher,
    Summarizer,
    Compressor,
    Writer,
    DraftWriter,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Supervisor,
        AgentRole::Researcher,
        AgentRole::Summarizer,
        AgentRole::Compressor,
        AgentRole::Writer,
        AgentRole::DraftWriter,
    ];
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Supervisor => write!(f, "supervisor"),
            AgentRole::Researcher => write!(f, "researcher"),
            AgentRole::Summarizer => write!(f, "summarizer"),
            AgentRole::Compressor => write!(f, "compressor"),
            AgentRole::Writer => write!(f, "writer"),
            AgentRole::DraftWriter => write!(f, "draft_writer"),
        }
    }
}

/// 模型标识的书写形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSyntax {
    /// `provider:model`
    Colon,
    /// `provider/model`
    Slash,
}

/// 解析后的模型标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// 小写的provider前缀
    pub provider: String,
    /// 发送给provider的模型名
    pub model: String,
    pub syntax: ModelSyntax,
}

impl ModelSpec {
    /// `provider/model`形式需要显式传递给客户端的provider提示
    pub fn routing_hint(&self) -> Option<&str> {
        match self.syntax {
            ModelSyntax::Slash => Some(&self.provider),
            ModelSyntax::Colon => None,
        }
    }
}

impl FromStr for ModelSpec {
    type Err = String;

    fn from_str(identifier: &str) -> std::result::Result<Self, Self::Err> {
        let identifier = identifier.trim();
        let (index, separator) = identifier
            .char_indices()
            .find(|(_, c)| *c == ':' || *c == '/')
            .ok_or_else(|| {
                format!(
                    "模型标识 `{}` 缺少provider前缀，应为 provider:model 或 provider/model",
                    identifier
                )
            })?;

        let provider = identifier[..index].trim().to_lowercase();
        let rest = identifier[index + 1..].trim();
        if provider.is_empty() || rest.is_empty() {
            return Err(format!("模型标识 `{}` 的provider或模型名为空", identifier));
        }

        let spec = match separator {
            ':' => ModelSpec {
                provider,
                model: rest.to_string(),
                syntax: ModelSyntax::Colon,
            },
            _ => ModelSpec {
                provider,
                // 网关风格：完整标识原样作为模型名
                model: identifier.to_string(),
                syntax: ModelSyntax::Slash,
            },
        };
        Ok(spec)
    }
}

/// 角色的完整路由结果（纯配置）
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBinding {
    pub role: AgentRole,
    pub spec: ModelSpec,
    pub max_tokens: u32,
    pub base_url: Option<String>,
    pub routing_hint: Option<String>,
}

impl ModelBinding {
    /// 计算角色的路由结果，模型标识无效时返回配置错误
    pub fn resolve(config: &Config, role: AgentRole) -> Result<Self> {
        let identifier = config.llm.model_for(role);
        let spec = ModelSpec::from_str(identifier).map_err(|e| {
            ResearchError::configuration(format!("角色 {} 的模型配置无效: {}", role, e))
        })?;

        let base_url = provider_base_url(config, &spec.provider);
        let routing_hint = spec.routing_hint().map(str::to_string);

        Ok(Self {
            role,
            max_tokens: config.llm.max_tokens_for(role),
            base_url,
            routing_hint,
            spec,
        })
    }
}

/// provider → 基地址覆盖，只有已知provider才会被覆盖
pub fn provider_base_url(config: &Config, provider: &str) -> Option<String> {
    match provider {
        "openai" => config.llm.openai_base_url.clone(),
        "anthropic" => config.llm.anthropic_base_url.clone(),
        _ => None,
    }
}

/// 模型路由器，进程内构建一次后以引用传递
#[derive(Clone)]
pub struct ModelRouter {
    clients: HashMap<AgentRole, LLMClient>,
}

impl ModelRouter {
    /// 根据配置为每个角色构建客户端，任何配置问题都在此处失败
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let mut clients = HashMap::new();
        for role in AgentRole::ALL {
            let binding = ModelBinding::resolve(config, role)?;
            let model = RigChatModel::new(&binding, &config.llm)?;
            tracing::debug!(
                role = %role,
                model = %binding.spec.model,
                provider = %binding.spec.provider,
                base_url = ?binding.base_url,
                "模型路由已解析"
            );
            clients.insert(
                role,
                LLMClient::from_rig(role, Arc::new(model), binding.max_tokens, &config.llm),
            );
        }

        Ok(Self { clients })
    }

    /// 所有角色共用同一个模型实现，输出上限仍按角色配置
    pub fn uniform(model: Arc<dyn ChatModel>, config: &Config) -> Self {
        let clients = AgentRole::ALL
            .into_iter()
            .map(|role| {
                let client = LLMClient::new(
                    role,
                    model.clone(),
                    config.llm.max_tokens_for(role),
                    &config.llm,
                );
                (role, client)
            })
            .collect();
        Self { clients }
    }

    /// 替换单个角色的模型实现
    pub fn with_model(mut self, role: AgentRole, model: Arc<dyn ChatModel>, config: &Config) -> Self {
        self.clients.insert(
            role,
            LLMClient::new(role, model, config.llm.max_tokens_for(role), &config.llm),
        );
        self
    }

    /// 解析角色对应的客户端
    pub fn resolve(&self, role: AgentRole) -> Result<LLMClient> {
        self.clients
            .get(&role)
            .cloned()
            .ok_or_else(|| ResearchError::configuration(format!("角色 {} 没有绑定模型", role)))
    }
}
