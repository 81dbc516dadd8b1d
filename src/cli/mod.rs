use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;
use crate::generator::research::RunRequest;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "deepresearch.toml";

/// DeepResearch-RS - 多阶段、预算受控的深度研究引擎
#[derive(Parser, Debug)]
#[command(name = "deepresearch-rs")]
#[command(
    about = "Answers a research question by decomposing it, researching sub-questions concurrently against web search, and writing a long-form cited report."
)]
#[command(version)]
pub struct Args {
    /// 研究问题
    pub query: Option<String>,

    /// 运行ID，相同ID会从检查点恢复；默认随机生成
    #[arg(long)]
    pub run_id: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 报告输出路径（文件或目录）
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    /// 检查点目录，未指定时只在进程内保存
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// 所有角色的默认模型，形如 provider:model
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub supervisor_model: Option<String>,

    #[arg(long)]
    pub researcher_model: Option<String>,

    #[arg(long)]
    pub compress_model: Option<String>,

    #[arg(long)]
    pub writer_model: Option<String>,

    /// 最大轮次
    #[arg(long)]
    pub recursion_limit: Option<usize>,

    /// 并发研究员上限
    #[arg(long)]
    pub max_concurrent_researchers: Option<usize>,

    /// 单个研究员的最大迭代次数
    #[arg(long)]
    pub max_researcher_iterations: Option<usize>,

    /// 写作输入上下文预算（tokens）
    #[arg(long)]
    pub max_context_length: Option<usize>,

    /// 单个研究员任务的超时时间（秒）
    #[arg(long)]
    pub task_timeout: Option<u64>,

    /// 温度参数
    #[arg(long)]
    pub temperature: Option<f64>,

    /// 跳过初稿
    #[arg(long)]
    pub no_draft: bool,

    /// 是否禁用缓存
    #[arg(long)]
    pub no_cache: bool,

    /// 列出检查点中的运行
    #[arg(long)]
    pub list_runs: bool,

    /// 删除指定运行的检查点
    #[arg(long, value_name = "RUN_ID")]
    pub discard_run: Option<String>,

    /// 是否启用详细日志
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// 默认值 → 配置文件 → 环境变量（含`.env`） → 命令行
    pub fn into_config(&self) -> Result<Config> {
        let mut config = self.load_file()?;
        config.apply_process_env()?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// 与`into_config`相同，但环境变量由调用方提供
    pub fn into_config_with_env<I, K, V>(&self, vars: I) -> Result<Config>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = self.load_file()?;
        config.apply_env(vars)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn load_file(&self) -> Result<Config> {
        if let Some(config_path) = &self.config {
            // 显式指定的配置文件必须可读
            return Config::from_file(config_path)
                .with_context(|| format!("无法读取配置文件 {:?}", config_path));
        }

        let default_config_path = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DEFAULT_CONFIG_FILE);
        if default_config_path.exists() {
            Config::from_file(&default_config_path)
        } else {
            Ok(Config::default())
        }
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            let llm = &mut config.llm;
            for slot in [
                &mut llm.default_model,
                &mut llm.supervisor_model,
                &mut llm.researcher_model,
                &mut llm.summarization_model,
                &mut llm.compress_model,
                &mut llm.writer_model,
            ] {
                *slot = model.clone();
            }
        }
        let models = [
            (&self.supervisor_model, &mut config.llm.supervisor_model),
            (&self.researcher_model, &mut config.llm.researcher_model),
            (&self.compress_model, &mut config.llm.compress_model),
            (&self.writer_model, &mut config.llm.writer_model),
        ];
        for (value, slot) in models {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        if let Some(temperature) = self.temperature {
            config.llm.temperature = Some(temperature);
        }

        let research = &mut config.research;
        if let Some(limit) = self.recursion_limit {
            research.recursion_limit = limit;
        }
        if let Some(cap) = self.max_concurrent_researchers {
            research.max_concurrent_researchers = cap;
        }
        if let Some(iterations) = self.max_researcher_iterations {
            research.max_researcher_iterations = iterations;
        }
        if let Some(length) = self.max_context_length {
            research.max_context_length = length;
        }
        if let Some(timeout) = self.task_timeout {
            research.task_timeout_seconds = Some(timeout);
        }
        if self.no_draft {
            research.enable_draft = false;
        }

        if self.no_cache {
            config.cache.enabled = false;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint.checkpoint_dir = Some(dir.clone());
        }
        if let Some(output_path) = &self.output_path {
            config.output_path = Some(output_path.clone());
        }
        if self.verbose {
            config.verbose = true;
        }
    }

    /// 构造研究请求，未提供问题时返回None
    pub fn run_request(&self) -> Option<RunRequest> {
        let query = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())?;
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Some(RunRequest {
            query: query.to_string(),
            run_id,
            recursion_limit: self.recursion_limit,
            max_concurrent_researchers: self.max_concurrent_researchers,
        })
    }
}

// Include tests
#[cfg(test)]
mod tests;
