//! 错误类型 - 只有配置错误与聚合失败会传播到调用方

use thiserror::Error;

use crate::llm::client::types::ProviderError;
use crate::memory::StoreError;

/// 研究流程的统一错误
#[derive(Debug, Error)]
pub enum ResearchError {
    /// 配置错误：启动时立即暴露，不重试
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 模型服务的暂时性错误，已在所属任务内用尽重试次数
    #[error("模型服务调用失败 [{role}]，已重试 {attempts} 次: {source}")]
    ProviderTransient {
        role: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// 没有任何子问题产出可用结果
    #[error("研究聚合失败: 查询「{query}」没有任何可用的子问题结果，失败的子问题: {failed_sub_questions:?}")]
    Aggregation {
        query: String,
        failed_sub_questions: Vec<String>,
    },

    /// 已有研究结果，但写作输入预算连一条截断后的摘要都放不下
    #[error("写作输入预算不足: 查询「{query}」的 {summaries} 条摘要在 {max_context_length} tokens 内无法保留任何内容")]
    ContextBudget {
        query: String,
        summaries: usize,
        max_context_length: usize,
    },

    /// 运行状态存储失败
    #[error("运行状态存储失败: {0}")]
    Store(#[from] StoreError),
}

impl ResearchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ResearchError::Configuration(message.into())
    }

    /// 该错误是否需要传播给调用方（任务内的暂时性错误会被吸收）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ResearchError::ProviderTransient { .. })
    }
}

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;
