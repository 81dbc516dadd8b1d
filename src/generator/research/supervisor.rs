//! 监督者：拆解问题、按并发上限派发研究员任务、逐轮评估覆盖度，最后交给写作者

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ResearchConfig;
use crate::error::{ResearchError, Result};
use crate::generator::compose::Writer;
use crate::generator::context::ResearchContext;
use crate::generator::research::compressor::Compressor;
use crate::generator::research::researcher::{Investigator, Researcher};
use crate::generator::types::{
    CompressedSummary, RunState, RunStatus, SubQuestion, SubQuestionStatus,
};
use crate::llm::client::LLMClient;
use crate::llm::router::AgentRole;
use crate::memory::{RunStateStore, StoreError};
use crate::utils::threads::do_parallel_with_limit;
use crate::utils::token_estimator::TokenEstimator;

pub const PLAN_PROMPT: &str = "你是一名研究主管，负责把用户的研究问题拆解为若干可以独立检索的子问题。\
子问题之间尽量不重叠，合起来能够完整回答原问题；如果原问题已经足够具体，只返回一个子问题。";

pub const COVERAGE_PROMPT: &str = "你是一名研究主管，负责评估已有研究资料是否足以完整回答用户的问题。\
如果足够，sufficient为true；否则给出需要补充研究的后续子问题，不要重复已经研究过的内容。";

/// 一次研究请求
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub query: String,
    pub run_id: String,
    /// 覆盖配置中的轮次上限
    pub recursion_limit: Option<usize>,
    /// 覆盖配置中的并发上限
    pub max_concurrent_researchers: Option<usize>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            run_id: run_id.into(),
            recursion_limit: None,
            max_concurrent_researchers: None,
        }
    }
}

/// 研究结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchReport {
    pub run_id: String,
    pub query: String,
    pub report: String,
    pub rounds: usize,
    pub sub_questions: Vec<SubQuestion>,
    /// 写作时使用的摘要数
    pub corpus_entries: usize,
    /// 是否直接返回了已完成运行的报告
    pub from_checkpoint: bool,
}

/// 覆盖度评估结果
#[derive(Debug, Clone, PartialEq)]
pub enum CoverageDecision {
    Sufficient,
    Insufficient { follow_ups: Vec<String> },
}

/// 每轮结束后判断是否需要继续研究
#[async_trait]
pub trait CoveragePolicy: Send + Sync {
    async fn evaluate(&self, state: &RunState) -> CoverageDecision;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResearchPlan {
    /// 拆解出的子问题，按研究顺序排列
    pub sub_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoverageAssessment {
    /// 已有资料是否足以回答原问题
    pub sufficient: bool,
    /// 需要补充研究的子问题
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
}

/// 由监督者模型评估覆盖度，评估失败时视为已足够
pub struct ModelCoveragePolicy {
    client: LLMClient,
    estimator: TokenEstimator,
    max_context_length: usize,
}

impl ModelCoveragePolicy {
    pub fn new(context: &ResearchContext) -> Result<Self> {
        Ok(Self {
            client: context.router.resolve(AgentRole::Supervisor)?,
            estimator: context.estimator.clone(),
            max_context_length: context.config.research.max_context_length,
        })
    }
}

#[async_trait]
impl CoveragePolicy for ModelCoveragePolicy {
    async fn evaluate(&self, state: &RunState) -> CoverageDecision {
        let mut corpus = state.corpus.clone();
        corpus.fit_to_budget(self.max_context_length, &self.estimator);

        let researched: Vec<String> = state
            .sub_questions
            .iter()
            .map(|sq| format!("- {} ({:?})", sq.text, sq.status))
            .collect();
        let prompt = format!(
            "研究问题：{}\n\n## 已研究的子问题\n{}\n\n## 已有研究资料\n{}\n\n请评估覆盖度。",
            state.run.query,
            researched.join("\n"),
            corpus.render()
        );

        match self
            .client
            .extract::<CoverageAssessment>(COVERAGE_PROMPT, &prompt)
            .await
        {
            Ok(assessment) if !assessment.sufficient => CoverageDecision::Insufficient {
                follow_ups: assessment.follow_up_questions,
            },
            Ok(_) => CoverageDecision::Sufficient,
            Err(e) => {
                tracing::warn!(error = %e, "覆盖度评估失败，按已足够处理");
                CoverageDecision::Sufficient
            }
        }
    }
}

/// 监督者
pub struct Supervisor {
    planner: LLMClient,
    investigator: Arc<dyn Investigator>,
    compressor: Compressor,
    writer: Writer,
    policy: Arc<dyn CoveragePolicy>,
    store: Arc<dyn RunStateStore>,
    research: ResearchConfig,
    estimator: TokenEstimator,
}

impl Supervisor {
    pub fn new(context: &ResearchContext) -> Result<Self> {
        Ok(Self {
            planner: context.router.resolve(AgentRole::Supervisor)?,
            investigator: Arc::new(Researcher::new(context)?),
            compressor: Compressor::new(context)?,
            writer: Writer::new(context)?,
            policy: Arc::new(ModelCoveragePolicy::new(context)?),
            store: context.store.clone(),
            research: context.config.research.clone(),
            estimator: context.estimator.clone(),
        })
    }

    pub fn with_investigator(mut self, investigator: Arc<dyn Investigator>) -> Self {
        self.investigator = investigator;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn CoveragePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// 执行一次研究；同一run_id已有检查点时从中断处继续
    pub async fn run(&self, request: &RunRequest) -> Result<ResearchReport> {
        let recursion_limit = request
            .recursion_limit
            .unwrap_or(self.research.recursion_limit);
        let concurrency = request
            .max_concurrent_researchers
            .unwrap_or(self.research.max_concurrent_researchers);
        if recursion_limit == 0 || concurrency == 0 {
            return Err(ResearchError::configuration("轮次上限与并发上限必须大于0"));
        }

        let (mut state, resumed) = self.load_or_create(request).await?;

        if state.run.status == RunStatus::Completed {
            if let Some(report) = state.run.final_report.clone() {
                tracing::info!(run_id = %request.run_id, "运行已完成，直接返回报告");
                return Ok(self.report(&state, report, true));
            }
        }

        if resumed {
            let requeued = state.requeue_in_progress();
            tracing::info!(
                run_id = %request.run_id,
                round = state.run.round,
                requeued,
                "🔁 从检查点恢复运行"
            );
        }
        state.run.status = RunStatus::Running;

        if state.sub_questions.is_empty() {
            if self.research.enable_draft && state.run.draft_report.is_none() {
                state.run.draft_report = self.writer.draft(&state.run.query).await;
            }
            let plan = self.decompose(&state.run.query, state.run.draft_report.as_deref()).await;
            for text in plan {
                state.enqueue(&text, 0);
            }
            tracing::info!(
                run_id = %request.run_id,
                sub_questions = state.sub_questions.len(),
                "📋 问题拆解完成"
            );
            self.checkpoint(&mut state).await?;
        }

        while state.run.round < recursion_limit && state.has_queued() {
            self.execute_round(&mut state, concurrency).await;
            state.run.round += 1;

            if state.run.round < recursion_limit {
                match self.policy.evaluate(&state).await {
                    CoverageDecision::Sufficient => {}
                    CoverageDecision::Insufficient { follow_ups } => {
                        let round = state.run.round;
                        let added = follow_ups
                            .iter()
                            .filter_map(|text| state.enqueue(text, round))
                            .count();
                        tracing::info!(round, added, "覆盖度不足，追加后续子问题");
                    }
                }
            }

            self.checkpoint(&mut state).await?;
        }

        if state.has_queued() {
            tracing::info!(
                round = state.run.round,
                queued = state.count(SubQuestionStatus::Queued),
                "轮次预算已用尽，使用已有资料撰写报告"
            );
        }

        if state.corpus.is_empty() {
            let error = ResearchError::Aggregation {
                query: state.run.query.clone(),
                failed_sub_questions: state.failed_questions(),
            };
            return self.fail(&mut state, error).await;
        }

        // 只剩一条时fit_to_budget会截断它而不是丢弃，清空说明连一个字符都放不下
        let mut corpus = state.corpus.clone();
        let dropped = corpus.fit_to_budget(self.research.max_context_length, &self.estimator);
        if dropped > 0 {
            tracing::info!(dropped, "写作输入超出预算，丢弃低优先级摘要");
        }
        if corpus.is_empty() {
            let error = ResearchError::ContextBudget {
                query: state.run.query.clone(),
                summaries: state.corpus.len(),
                max_context_length: self.research.max_context_length,
            };
            return self.fail(&mut state, error).await;
        }

        tracing::info!(run_id = %request.run_id, entries = corpus.len(), "✍️ 开始撰写报告");
        let report = match self
            .writer
            .write(&state.run.query, &corpus, state.run.draft_report.as_deref())
            .await
        {
            Ok(report) => report,
            Err(e) if e.is_fatal() => return self.fail(&mut state, e).await,
            Err(e) => {
                tracing::warn!(error = %e, "报告撰写失败，使用研究资料直接生成报告");
                self.writer.fallback_report(&state.run.query, &corpus)
            }
        };

        state.run.final_report = Some(report.clone());
        state.run.status = RunStatus::Completed;
        self.checkpoint(&mut state).await?;

        let mut result = self.report(&state, report, false);
        result.corpus_entries = corpus.len();
        Ok(result)
    }

    async fn load_or_create(&self, request: &RunRequest) -> Result<(RunState, bool)> {
        match self.store.load(&request.run_id).await {
            Ok(state) => {
                if state.run.query != request.query {
                    return Err(ResearchError::configuration(format!(
                        "运行 {} 已存在且对应不同的问题：{}",
                        request.run_id, state.run.query
                    )));
                }
                Ok((state, true))
            }
            Err(StoreError::NotFound(_)) => Ok((RunState::new(&request.run_id, &request.query), false)),
            Err(e) => Err(e.into()),
        }
    }

    /// 拆解问题，失败或结果为空时把原问题作为唯一子问题
    async fn decompose(&self, query: &str, draft: Option<&str>) -> Vec<String> {
        let mut prompt = format!("研究问题：{}\n", query);
        if let Some(draft) = draft {
            prompt.push_str(&format!("\n## 初稿（仅供参考，可能不准确）\n{}\n", draft));
        }
        prompt.push_str("\n请拆解为子问题。");

        match self.planner.extract::<ResearchPlan>(PLAN_PROMPT, &prompt).await {
            Ok(plan) => {
                let sub_questions: Vec<String> = plan
                    .sub_questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
                if sub_questions.is_empty() {
                    tracing::warn!("拆解结果为空，直接研究原问题");
                    vec![query.to_string()]
                } else {
                    sub_questions
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "问题拆解失败，直接研究原问题");
                vec![query.to_string()]
            }
        }
    }

    /// 执行一轮：所有排队的子问题进入容量为并发上限的任务池
    ///
    /// 子问题在任务真正开始时才标记为InProgress，等待槽位的仍是Queued。
    async fn execute_round(&self, state: &mut RunState, concurrency: usize) {
        let batch = state.queued();
        tracing::info!(
            round = state.run.round + 1,
            tasks = batch.len(),
            concurrency,
            "🔍 开始新一轮研究"
        );

        let shared = Mutex::new(&mut *state);
        let futures = batch
            .into_iter()
            .map(|mut sq| {
                let shared = &shared;
                async move {
                    shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .set_status(&sq.id, SubQuestionStatus::InProgress);
                    sq.status = SubQuestionStatus::InProgress;
                    let summary = self.research_one(&sq).await;
                    (sq, summary)
                }
            })
            .collect();
        let results = do_parallel_with_limit(futures, concurrency).await;
        let state = shared.into_inner().unwrap_or_else(PoisonError::into_inner);

        for (sq, summary) in results {
            match summary {
                Some(summary) => {
                    state.corpus.insert(summary);
                    state.set_status(&sq.id, SubQuestionStatus::Done);
                }
                None => state.set_status(&sq.id, SubQuestionStatus::Failed),
            }
        }
    }

    /// 研究并压缩一个子问题，没有可用结果时返回None
    async fn research_one(&self, sub_question: &SubQuestion) -> Option<CompressedSummary> {
        let deadline = self
            .research
            .task_timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let outcome = match self
            .investigator
            .investigate(sub_question, self.research.max_researcher_iterations, deadline)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(sub_question = %sub_question.id, error = %e, "研究员任务失败");
                return None;
            }
        };
        tracing::info!(
            sub_question = %sub_question.id,
            iterations = outcome.iterations_used,
            findings = outcome.findings.len(),
            stop_reason = ?outcome.stop_reason,
            "研究员任务结束"
        );
        if outcome.findings.is_empty() {
            return None;
        }

        let summary = self
            .compressor
            .compress(sub_question, &outcome.findings, self.compressor.budget())
            .await;
        (!summary.is_empty()).then_some(summary)
    }

    /// 把运行标记为失败并保存，随后返回原错误
    async fn fail<T>(&self, state: &mut RunState, error: ResearchError) -> Result<T> {
        tracing::error!(run_id = %state.run.run_id, error = %error, "研究运行失败");
        state.run.status = RunStatus::Failed;
        self.checkpoint(state).await?;
        Err(error)
    }

    async fn checkpoint(&self, state: &mut RunState) -> Result<()> {
        state.run.touch();
        self.store.save(&state.run.run_id, state).await?;
        tracing::debug!(run_id = %state.run.run_id, round = state.run.round, "检查点已保存");
        Ok(())
    }

    fn report(&self, state: &RunState, report: String, from_checkpoint: bool) -> ResearchReport {
        ResearchReport {
            run_id: state.run.run_id.clone(),
            query: state.run.query.clone(),
            report,
            rounds: state.run.round,
            sub_questions: state.sub_questions.clone(),
            corpus_entries: state.corpus.len(),
            from_checkpoint,
        }
    }
}
