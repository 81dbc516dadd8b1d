//! 检索服务 - 查询进，排序后的文档出

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::cache::CacheManager;

pub mod tavily;

pub use tavily::TavilySearch;

/// 检索返回的单篇文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub title: String,
    pub url: String,
    /// 摘要或正文
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalError {
    #[error("没有检索到结果")]
    NoResults,
    #[error("检索服务不可用: {0}")]
    Unavailable(String),
}

/// 检索服务的抽象
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// 按相关度从高到低返回文档，空结果以`NoResults`表示
    async fn search(&self, query: &str) -> Result<Vec<SearchDocument>, RetrievalError>;
}

/// 带磁盘缓存的检索，缓存读写失败不影响检索本身
pub struct CachedSearch {
    inner: Arc<dyn SearchProvider>,
    cache: Arc<CacheManager>,
}

impl CachedSearch {
    pub const CATEGORY: &'static str = "search";

    pub fn new(inner: Arc<dyn SearchProvider>, cache: Arc<CacheManager>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl SearchProvider for CachedSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchDocument>, RetrievalError> {
        match self.cache.get::<Vec<SearchDocument>>(Self::CATEGORY, query).await {
            Ok(Some(documents)) if !documents.is_empty() => {
                tracing::debug!(query, "检索结果命中缓存");
                return Ok(documents);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(query, error = %e, "读取检索缓存失败"),
        }

        let documents = self.inner.search(query).await?;
        if let Err(e) = self.cache.set(Self::CATEGORY, query, &documents).await {
            tracing::warn!(query, error = %e, "写入检索缓存失败");
        }
        Ok(documents)
    }
}
