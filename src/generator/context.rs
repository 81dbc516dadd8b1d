use std::sync::Arc;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::Result;
use crate::llm::router::ModelRouter;
use crate::memory::{FileRunStateStore, MemoryRunStateStore, RunStateStore};
use crate::search::{CachedSearch, SearchProvider, TavilySearch};
use crate::utils::token_estimator::TokenEstimator;

/// 研究流程共享的组件，各阶段只读使用
#[derive(Clone)]
pub struct ResearchContext {
    /// 配置
    pub config: Config,
    /// 角色到模型客户端的路由
    pub router: ModelRouter,
    /// 检索服务
    pub search: Arc<dyn SearchProvider>,
    /// 检查点存储
    pub store: Arc<dyn RunStateStore>,
    /// 检索缓存，未启用时为空
    pub cache: Option<Arc<CacheManager>>,
    pub estimator: TokenEstimator,
}

impl ResearchContext {
    /// 根据配置创建上下文，配置问题在这里直接失败
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let router = ModelRouter::from_config(&config)?;

        let tavily: Arc<dyn SearchProvider> = Arc::new(TavilySearch::new(&config.search)?);
        let (search, cache) = if config.cache.enabled {
            let cache = Arc::new(CacheManager::new(config.cache.clone()));
            let search: Arc<dyn SearchProvider> =
                Arc::new(CachedSearch::new(tavily, cache.clone()));
            (search, Some(cache))
        } else {
            (tavily, None)
        };

        let store: Arc<dyn RunStateStore> = match &config.checkpoint.checkpoint_dir {
            Some(dir) => Arc::new(FileRunStateStore::new(dir.clone())),
            None => Arc::new(MemoryRunStateStore::new()),
        };

        Ok(Self::with_components(config, router, search, store).with_cache(cache))
    }

    /// 使用外部提供的组件创建上下文
    pub fn with_components(
        config: Config,
        router: ModelRouter,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn RunStateStore>,
    ) -> Self {
        Self {
            config,
            router,
            search,
            store,
            cache: None,
            estimator: TokenEstimator::new(),
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<CacheManager>>) -> Self {
        self.cache = cache;
        self
    }
}
