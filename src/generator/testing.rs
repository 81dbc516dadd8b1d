//! 单元测试共用的模拟组件

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Config;
use crate::generator::context::ResearchContext;
use crate::llm::client::types::{ChatModel, ChatRequest, ProviderError};
use crate::llm::router::ModelRouter;
use crate::memory::MemoryRunStateStore;
use crate::search::{RetrievalError, SearchDocument, SearchProvider};

/// 由闭包决定回复的模型
pub struct FnModel<F> {
    reply: F,
}

impl<F> FnModel<F>
where
    F: Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync,
{
    pub fn new(reply: F) -> Self {
        Self { reply }
    }
}

#[async_trait]
impl<F> ChatModel for FnModel<F>
where
    F: Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync,
{
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        (self.reply)(&request)
    }

    fn model_name(&self) -> &str {
        "fn-model"
    }
}

#[derive(Clone, Copy)]
enum SearchMode {
    Numbered,
    Failing,
}

/// 计数的检索服务：numbered 每次返回两篇带编号的新文档，failing 总是不可用
#[derive(Clone)]
pub struct ScriptedSearch {
    mode: SearchMode,
    calls: Arc<AtomicUsize>,
}

impl ScriptedSearch {
    pub fn numbered() -> Self {
        Self {
            mode: SearchMode::Numbered,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: SearchMode::Failing,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, _query: &str) -> Result<Vec<SearchDocument>, RetrievalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            SearchMode::Failing => Err(RetrievalError::Unavailable("offline".to_string())),
            SearchMode::Numbered => Ok((0..2)
                .map(|i| SearchDocument {
                    title: format!("Doc {}-{}", call, i),
                    url: format!("https://doc.test/{}-{}", call, i),
                    content: format!("content of document {}-{}", call, i),
                    score: 1.0 - i as f64 * 0.1,
                })
                .collect()),
        }
    }
}

/// 测试配置：不等待重试、不使用缓存、不写初稿
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.llm.retry_attempts = 2;
    config.llm.retry_delay_ms = 0;
    config.research.retrieval_retry_delay_ms = 0;
    config.research.enable_draft = false;
    config.cache.enabled = false;
    config
}

pub fn context_with<F>(reply: F, search: ScriptedSearch) -> ResearchContext
where
    F: Fn(&ChatRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
{
    context_from(test_config(), Arc::new(FnModel::new(reply)), search)
}

/// 指定配置与模型实现
pub fn context_from(config: Config, model: Arc<dyn ChatModel>, search: ScriptedSearch) -> ResearchContext {
    let router = ModelRouter::uniform(model, &config);
    ResearchContext::with_components(
        config,
        router,
        Arc::new(search),
        Arc::new(MemoryRunStateStore::new()),
    )
}

pub fn reply_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap()
}
