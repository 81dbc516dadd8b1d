use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ResearchError;
use crate::llm::router::{AgentRole, ModelSpec};

/// 模型标识的默认值
pub const DEFAULT_MODEL_ID: &str = "openai:gpt-5";

/// 应用程序配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// LLM模型配置
    pub llm: LLMConfig,

    /// 研究流程预算
    pub research: ResearchConfig,

    /// 检索服务配置
    pub search: SearchConfig,

    /// 检索缓存配置
    pub cache: CacheConfig,

    /// 运行状态存储配置
    pub checkpoint: CheckpointConfig,

    /// 最终报告输出路径，为空时只打印
    pub output_path: Option<PathBuf>,

    /// 是否启用详细日志
    pub verbose: bool,
}

/// LLM模型配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LLMConfig {
    /// 研究员未单独配置时使用的模型
    pub default_model: String,

    pub supervisor_model: String,

    pub researcher_model: String,

    /// 网页内容摘要模型
    pub summarization_model: String,

    pub compress_model: String,

    /// 报告撰写模型（初稿与终稿共用）
    pub writer_model: String,

    /// 未单独配置输出上限的角色使用的最大tokens
    pub max_tokens: u32,

    /// 压缩模型最大输出tokens，同时作为压缩摘要的预算
    pub compress_max_tokens: u32,

    /// 终稿撰写最大输出tokens
    pub report_writer_max_tokens: u32,

    /// 初稿撰写最大输出tokens
    pub draft_writer_max_tokens: u32,

    /// OpenAI API基地址覆盖
    pub openai_base_url: Option<String>,

    /// Anthropic API基地址覆盖
    pub anthropic_base_url: Option<String>,

    /// 各provider的API KEY，key为provider名称
    pub api_keys: BTreeMap<String, String>,

    /// 温度，为空时使用provider默认值
    pub temperature: Option<f64>,

    /// 重试次数
    pub retry_attempts: u32,

    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,

    /// 单次调用超时时间（秒）
    pub timeout_seconds: u64,
}

/// 研究流程预算
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ResearchConfig {
    /// 单个研究员任务的最大检索-推理迭代次数
    pub max_researcher_iterations: usize,

    /// 同时进行中的研究员任务上限
    pub max_concurrent_researchers: usize,

    /// 写作阶段的输入上下文预算（tokens），也用于限制压缩阶段的输入
    pub max_context_length: usize,

    /// 监督者的最大轮次
    pub recursion_limit: usize,

    /// 同一次迭代内检索失败的额外重试次数
    pub retrieval_retries: u32,

    /// 检索重试间隔（毫秒）
    pub retrieval_retry_delay_ms: u64,

    /// 单个研究员任务的墙钟超时（秒），为空时不限制
    pub task_timeout_seconds: Option<u64>,

    /// 超过该长度（tokens）的检索文档先交给摘要模型压缩，为空时直接截断
    pub summarize_documents_over_tokens: Option<usize>,

    /// 单篇检索文档进入推理时的长度上限（tokens）
    pub max_document_tokens: usize,

    /// 是否在拆解问题前先撰写初稿
    pub enable_draft: bool,
}

/// 检索服务配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub api_key: String,

    pub api_base_url: String,

    /// 每次检索返回的最大文档数
    pub max_results: usize,

    /// 是否请求网页正文
    pub include_raw_content: bool,

    /// 检索请求超时时间（秒）
    pub timeout_seconds: u64,
}

/// 缓存配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// 是否启用缓存
    pub enabled: bool,

    /// 缓存目录
    pub cache_dir: PathBuf,

    /// 缓存过期时间（小时）
    pub expire_hours: u64,
}

/// 运行状态存储配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// 检查点目录，为空时使用进程内存储
    pub checkpoint_dir: Option<PathBuf>,
}

/// 需要API KEY的provider
pub const KEYED_PROVIDERS: [&str; 6] = [
    "openai",
    "anthropic",
    "deepseek",
    "moonshot",
    "mistral",
    "openrouter",
];

impl Config {
    /// 从文件加载配置
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let mut file =
            File::open(path).context(format!("Failed to open config file: {:?}", path))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// 加载`.env`（不覆盖已有环境变量）后叠加进程环境变量
    pub fn apply_process_env(&mut self) -> Result<(), ResearchError> {
        let _ = dotenvy::dotenv();
        self.apply_env(std::env::vars())
    }

    /// 叠加环境变量风格的键值对，缺失的键保留当前值
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ResearchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();

        let llm = &mut self.llm;
        if let Some(v) = vars.get("DEFAULT_MODEL") {
            // 研究员模型跟随默认模型，除非已在配置文件中单独指定
            if llm.researcher_model == DEFAULT_MODEL_ID || llm.researcher_model == llm.default_model {
                llm.researcher_model = v.clone();
            }
            llm.default_model = v.clone();
        }
        let models = [
            ("SUPERVISOR_MODEL", &mut llm.supervisor_model),
            ("RESEARCHER_MODEL", &mut llm.researcher_model),
            ("SUMMARIZATION_MODEL", &mut llm.summarization_model),
            ("COMPRESS_MODEL", &mut llm.compress_model),
            ("WRITER_MODEL", &mut llm.writer_model),
        ];
        for (key, slot) in models {
            if let Some(v) = vars.get(key) {
                *slot = v.clone();
            }
        }

        parse_into(&vars, "MAX_TOKENS", &mut llm.max_tokens)?;
        parse_into(&vars, "COMPRESS_MODEL_MAX_TOKENS", &mut llm.compress_max_tokens)?;
        parse_into(&vars, "REPORT_WRITER_MODEL_MAX_TOKENS", &mut llm.report_writer_max_tokens)?;
        parse_into(&vars, "DRAFT_WRITER_MODEL_MAX_TOKENS", &mut llm.draft_writer_max_tokens)?;
        parse_into(&vars, "LLM_RETRY_ATTEMPTS", &mut llm.retry_attempts)?;
        parse_into(&vars, "LLM_RETRY_DELAY_MS", &mut llm.retry_delay_ms)?;
        parse_into(&vars, "LLM_TIMEOUT_SECONDS", &mut llm.timeout_seconds)?;

        if let Some(v) = vars.get("OPENAI_BASE_URL") {
            llm.openai_base_url = Some(v.clone());
        }
        if let Some(v) = vars.get("ANTHROPIC_BASE_URL") {
            llm.anthropic_base_url = Some(v.clone());
        }
        for provider in KEYED_PROVIDERS {
            let key = format!("{}_API_KEY", provider.to_uppercase());
            if let Some(v) = vars.get(&key) {
                llm.api_keys.insert(provider.to_string(), v.clone());
            }
        }

        let research = &mut self.research;
        parse_into(&vars, "MAX_RESEARCHER_ITERATIONS", &mut research.max_researcher_iterations)?;
        parse_into(&vars, "MAX_CONCURRENT_RESEARCHERS", &mut research.max_concurrent_researchers)?;
        parse_into(&vars, "MAX_CONTEXT_LENGTH", &mut research.max_context_length)?;
        parse_into(&vars, "RECURSION_LIMIT", &mut research.recursion_limit)?;

        if let Some(v) = vars.get("TAVILY_API_KEY") {
            self.search.api_key = v.clone();
        }
        if let Some(v) = vars.get("CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = Some(PathBuf::from(v));
        }

        Ok(())
    }

    /// 启动时校验：模型标识语法和各项预算
    pub fn validate(&self) -> Result<(), ResearchError> {
        for role in AgentRole::ALL {
            let identifier = self.llm.model_for(role);
            ModelSpec::from_str(identifier).map_err(|e| {
                ResearchError::configuration(format!("角色 {} 的模型配置无效: {}", role, e))
            })?;
        }

        let research = &self.research;
        let budgets = [
            ("max_researcher_iterations", research.max_researcher_iterations),
            ("max_concurrent_researchers", research.max_concurrent_researchers),
            ("max_context_length", research.max_context_length),
            ("recursion_limit", research.recursion_limit),
            ("max_document_tokens", research.max_document_tokens),
        ];
        for (name, value) in budgets {
            if value == 0 {
                return Err(ResearchError::configuration(format!("{} 必须大于0", name)));
            }
        }
        if self.llm.retry_attempts == 0 {
            return Err(ResearchError::configuration("retry_attempts 必须大于0"));
        }

        Ok(())
    }
}

impl LLMConfig {
    /// 获取角色对应的模型标识
    pub fn model_for(&self, role: AgentRole) -> &str {
        match role {
            AgentRole::Supervisor => &self.supervisor_model,
            AgentRole::Researcher => &self.researcher_model,
            AgentRole::Summarizer => &self.summarization_model,
            AgentRole::Compressor => &self.compress_model,
            AgentRole::Writer | AgentRole::DraftWriter => &self.writer_model,
        }
    }

    /// 获取角色对应的输出token上限
    pub fn max_tokens_for(&self, role: AgentRole) -> u32 {
        match role {
            AgentRole::Compressor => self.compress_max_tokens,
            AgentRole::Writer => self.report_writer_max_tokens,
            AgentRole::DraftWriter => self.draft_writer_max_tokens,
            AgentRole::Supervisor | AgentRole::Researcher | AgentRole::Summarizer => {
                self.max_tokens
            }
        }
    }

    pub fn api_key_for(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

fn parse_into<T>(vars: &BTreeMap<String, String>, key: &str, slot: &mut T) -> Result<(), ResearchError>
where
    T: FromStr,
{
    if let Some(raw) = vars.get(key) {
        *slot = raw.trim().parse::<T>().map_err(|_| {
            ResearchError::configuration(format!("环境变量 {} 的值无效: {}", key, raw))
        })?;
    }
    Ok(())
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL_ID.to_string(),
            supervisor_model: DEFAULT_MODEL_ID.to_string(),
            researcher_model: DEFAULT_MODEL_ID.to_string(),
            summarization_model: DEFAULT_MODEL_ID.to_string(),
            compress_model: DEFAULT_MODEL_ID.to_string(),
            writer_model: DEFAULT_MODEL_ID.to_string(),
            max_tokens: 8192,
            compress_max_tokens: 32000,
            report_writer_max_tokens: 40000,
            draft_writer_max_tokens: 32000,
            openai_base_url: None,
            anthropic_base_url: None,
            api_keys: BTreeMap::new(),
            temperature: None,
            retry_attempts: 5,
            retry_delay_ms: 5000,
            timeout_seconds: 300,
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_researcher_iterations: 15,
            max_concurrent_researchers: 3,
            max_context_length: 250000,
            recursion_limit: 10,
            retrieval_retries: 2,
            retrieval_retry_delay_ms: 1000,
            task_timeout_seconds: None,
            summarize_documents_over_tokens: Some(4000),
            max_document_tokens: 8000,
            enable_draft: true,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: String::from("https://api.tavily.com"),
            max_results: 5,
            include_raw_content: true,
            timeout_seconds: 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: PathBuf::from(".deepresearch/cache"),
            expire_hours: 24,
        }
    }
}
