//! 研究员任务：围绕一个子问题迭代执行 检索 → 推理

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::generator::context::ResearchContext;
use crate::generator::types::{Citation, Finding, SubQuestion};
use crate::llm::client::LLMClient;
use crate::llm::client::types::ChatMessage;
use crate::llm::router::AgentRole;
use crate::search::{RetrievalError, SearchDocument, SearchProvider};
use crate::utils::token_estimator::TokenEstimator;

pub const SYSTEM_PROMPT: &str = "你是一名严谨的研究员，负责围绕一个子问题检索资料并提取可溯源的事实。\
只从提供的文档中提取信息，每条发现都必须注明来源URL。\
当已有发现足以回答子问题时选择stop，否则选择continue并给出下一次检索的查询语句。";

pub const SUMMARIZE_PROMPT: &str = "你是一名资料整理助手。请在不丢失事实、数据和专有名词的前提下压缩网页内容，\
只保留与研究问题相关的部分，直接输出压缩后的正文。";

/// 推理后保留的最近对话轮数
const HISTORY_TURNS: usize = 4;

/// 研究员任务结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// 模型判断已足够回答
    Sufficient,
    /// 达到迭代上限
    IterationBudget,
    /// 超过任务截止时间
    Deadline,
    /// 推理调用失败
    ReasoningFailed,
}

/// 研究员任务的结果，任何结束原因都会带回已积累的发现
#[derive(Debug, Clone, PartialEq)]
pub struct ResearchOutcome {
    pub findings: Vec<Finding>,
    pub iterations_used: usize,
    pub stop_reason: StopReason,
}

/// 单次推理中提取出的发现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFinding {
    /// 事实陈述
    pub content: String,
    /// 支撑该事实的文档URL，必须来自提供的文档
    pub source_urls: Vec<String>,
}

/// 每次迭代的推理结果：提取发现 + 继续或停止
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ResearchStep {
    /// 需要继续检索
    Continue {
        findings: Vec<ExtractedFinding>,
        /// 下一次检索使用的查询
        next_query: Option<String>,
    },
    /// 子问题已充分回答
    Stop { findings: Vec<ExtractedFinding> },
}

impl ResearchStep {
    fn findings(&self) -> &[ExtractedFinding] {
        match self {
            ResearchStep::Continue { findings, .. } | ResearchStep::Stop { findings } => findings,
        }
    }
}

/// 研究员任务的抽象，监督者只依赖它
#[async_trait]
pub trait Investigator: Send + Sync {
    async fn investigate(
        &self,
        sub_question: &SubQuestion,
        max_iterations: usize,
        deadline: Option<Instant>,
    ) -> Result<ResearchOutcome>;
}

/// 基于检索服务与模型推理的研究员
pub struct Researcher {
    client: LLMClient,
    summarizer: LLMClient,
    search: Arc<dyn SearchProvider>,
    estimator: TokenEstimator,
    retrieval_retries: u32,
    retrieval_retry_delay: Duration,
    summarize_over_tokens: Option<usize>,
    max_document_tokens: usize,
}

impl Researcher {
    pub fn new(context: &ResearchContext) -> Result<Self> {
        let research = &context.config.research;
        Ok(Self {
            client: context.router.resolve(AgentRole::Researcher)?,
            summarizer: context.router.resolve(AgentRole::Summarizer)?,
            search: context.search.clone(),
            estimator: context.estimator.clone(),
            retrieval_retries: research.retrieval_retries,
            retrieval_retry_delay: Duration::from_millis(research.retrieval_retry_delay_ms),
            summarize_over_tokens: research.summarize_documents_over_tokens,
            max_document_tokens: research.max_document_tokens,
        })
    }

    /// 同一次迭代内重试检索，全部失败时返回最后一次的错误
    async fn retrieve(&self, query: &str) -> std::result::Result<Vec<SearchDocument>, RetrievalError> {
        let mut attempt = 0;
        loop {
            match self.search.search(query).await {
                Ok(documents) if !documents.is_empty() => return Ok(documents),
                Ok(_) => {
                    if attempt >= self.retrieval_retries {
                        return Err(RetrievalError::NoResults);
                    }
                }
                Err(e) => {
                    if attempt >= self.retrieval_retries {
                        return Err(e);
                    }
                    tracing::debug!(query, attempt, error = %e, "检索失败，重试中");
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retrieval_retry_delay).await;
        }
    }

    /// 过长的文档先交给摘要模型，失败时直接截断
    async fn condense(&self, sub_question: &SubQuestion, document: SearchDocument) -> SearchDocument {
        let tokens = self.estimator.count_tokens(&document.content);
        let mut content = document.content.clone();

        if let Some(threshold) = self.summarize_over_tokens {
            if tokens > threshold {
                let prompt = format!(
                    "研究问题：{}\n\n网页标题：{}\n网页内容：\n{}",
                    sub_question.text,
                    document.title,
                    self.estimator.truncate_to_tokens(
                        &document.content,
                        self.max_document_tokens.saturating_mul(4)
                    )
                );
                match self.summarizer.prompt(SUMMARIZE_PROMPT, &prompt).await {
                    Ok(summary) if !summary.trim().is_empty() => content = summary,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(url = %document.url, error = %e, "文档摘要失败，改为截断");
                    }
                }
            }
        }

        SearchDocument {
            content: self
                .estimator
                .truncate_to_tokens(&content, self.max_document_tokens),
            ..document
        }
    }

    fn reasoning_prompt(
        &self,
        sub_question: &SubQuestion,
        iteration: usize,
        max_iterations: usize,
        findings: &[Finding],
        documents: &[SearchDocument],
    ) -> String {
        let mut prompt = format!(
            "子问题：{}\n当前迭代：第{}次，共{}次\n\n",
            sub_question.text, iteration, max_iterations
        );

        prompt.push_str("## 已有发现\n");
        if findings.is_empty() {
            prompt.push_str("（暂无）\n");
        }
        for finding in findings {
            let urls: Vec<&str> = finding.citations.iter().map(|c| c.url.as_str()).collect();
            prompt.push_str(&format!("- {} ({})\n", finding.content, urls.join(", ")));
        }

        prompt.push_str("\n## 本次检索到的文档\n");
        if documents.is_empty() {
            prompt.push_str("（本次没有新的文档）\n");
        }
        for (i, document) in documents.iter().enumerate() {
            prompt.push_str(&format!(
                "### 文档{}: {}\nURL: {}\n{}\n\n",
                i + 1,
                document.title,
                document.url,
                document.content
            ));
        }

        prompt.push_str("\n请提取新的发现，并决定是否需要继续检索。");
        prompt
    }
}

#[async_trait]
impl Investigator for Researcher {
    async fn investigate(
        &self,
        sub_question: &SubQuestion,
        max_iterations: usize,
        deadline: Option<Instant>,
    ) -> Result<ResearchOutcome> {
        let mut findings: Vec<Finding> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut titles: HashMap<String, String> = HashMap::new();
        let mut history: Vec<ChatMessage> = Vec::new();
        let mut query = sub_question.text.clone();

        let outcome = |findings: Vec<Finding>, iterations_used, stop_reason| ResearchOutcome {
            findings,
            iterations_used,
            stop_reason,
        };

        for iteration in 1..=max_iterations {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(outcome(findings, iteration - 1, StopReason::Deadline));
            }
            tracing::debug!(sub_question = %sub_question.id, iteration, query = %query, "开始检索");

            let Some(retrieved) = before_deadline(deadline, self.retrieve(&query)).await else {
                return Ok(outcome(findings, iteration, StopReason::Deadline));
            };
            let documents = match retrieved {
                Ok(documents) => documents,
                Err(e) => {
                    tracing::warn!(sub_question = %sub_question.id, iteration, error = %e, "本次迭代检索失败");
                    continue;
                }
            };

            let mut fresh = Vec::new();
            for document in documents {
                if seen_urls.insert(document.url.clone()) {
                    titles.insert(document.url.clone(), document.title.clone());
                    let Some(condensed) =
                        before_deadline(deadline, self.condense(sub_question, document)).await
                    else {
                        return Ok(outcome(findings, iteration, StopReason::Deadline));
                    };
                    fresh.push(condensed);
                }
            }

            let prompt =
                self.reasoning_prompt(sub_question, iteration, max_iterations, &findings, &fresh);
            let reasoning = self
                .client
                .extract_with_history::<ResearchStep>(SYSTEM_PROMPT, &history, &prompt);
            let step = match before_deadline(deadline, reasoning).await {
                None => return Ok(outcome(findings, iteration, StopReason::Deadline)),
                Some(Err(e)) => {
                    tracing::warn!(sub_question = %sub_question.id, iteration, error = %e, "推理失败，返回已有发现");
                    return Ok(outcome(findings, iteration, StopReason::ReasoningFailed));
                }
                Some(Ok(step)) => step,
            };

            let extracted = step.findings().len();
            for finding in step.findings() {
                if let Some(finding) = to_finding(sub_question, iteration, finding, &titles) {
                    findings.push(finding);
                }
            }
            tracing::debug!(
                sub_question = %sub_question.id,
                iteration,
                extracted,
                total = findings.len(),
                "推理完成"
            );

            history.push(ChatMessage::user(format!("第{}次检索，查询：{}", iteration, query)));
            history.push(ChatMessage::assistant(
                serde_json::to_string(&step).unwrap_or_default(),
            ));
            if history.len() > HISTORY_TURNS * 2 {
                let excess = history.len() - HISTORY_TURNS * 2;
                history.drain(..excess);
            }

            match step {
                ResearchStep::Stop { .. } => {
                    return Ok(outcome(findings, iteration, StopReason::Sufficient));
                }
                ResearchStep::Continue { next_query, .. } => {
                    if let Some(next) = next_query.filter(|q| !q.trim().is_empty()) {
                        query = next;
                    }
                }
            }
        }

        Ok(outcome(findings, max_iterations, StopReason::IterationBudget))
    }
}

/// 只保留引用了已检索文档的发现
fn to_finding(
    sub_question: &SubQuestion,
    iteration: usize,
    extracted: &ExtractedFinding,
    titles: &HashMap<String, String>,
) -> Option<Finding> {
    if extracted.content.trim().is_empty() {
        return None;
    }

    let mut citations: Vec<Citation> = Vec::new();
    for url in &extracted.source_urls {
        let url = url.trim();
        if let Some(title) = titles.get(url) {
            let citation = Citation {
                title: title.clone(),
                url: url.to_string(),
            };
            if !citations.contains(&citation) {
                citations.push(citation);
            }
        }
    }
    if citations.is_empty() {
        return None;
    }

    Some(Finding {
        sub_question_id: sub_question.id.clone(),
        content: extracted.content.trim().to_string(),
        citations,
        iteration,
    })
}

/// 在截止时间前等待，超时返回None
pub async fn before_deadline<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::testing::{
        ScriptedSearch, context_from, context_with, reply_json, test_config,
    };
    use crate::generator::types::SubQuestionStatus;
    use crate::llm::client::types::{ChatModel, ChatRequest, ProviderError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sub_question() -> SubQuestion {
        SubQuestion {
            id: "sq-1".to_string(),
            text: "What is the boiling point of water?".to_string(),
            status: SubQuestionStatus::InProgress,
            round: 0,
        }
    }

    fn step_continue(url: &str) -> String {
        reply_json(&ResearchStep::Continue {
            findings: vec![ExtractedFinding {
                content: format!("fact from {}", url),
                source_urls: vec![url.to_string()],
            }],
            next_query: Some("water boiling altitude".to_string()),
        })
    }

    #[tokio::test]
    async fn test_stops_at_iteration_budget() {
        let search = ScriptedSearch::numbered();
        let context = context_with(
            |_request: &ChatRequest| Ok(step_continue("https://doc.test/1-0")),
            search.clone(),
        );
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 3, None).await.unwrap();
        assert_eq!(outcome.iterations_used, 3);
        assert_eq!(outcome.stop_reason, StopReason::IterationBudget);
        assert_eq!(search.calls(), 3);
    }

    #[tokio::test]
    async fn test_findings_require_retrieved_source() {
        let search = ScriptedSearch::numbered();
        let context = context_with(
            |_request: &ChatRequest| {
                Ok(reply_json(&ResearchStep::Stop {
                    findings: vec![
                        ExtractedFinding {
                            content: "supported".to_string(),
                            source_urls: vec!["https://doc.test/1-0".to_string()],
                        },
                        ExtractedFinding {
                            content: "made up".to_string(),
                            source_urls: vec!["https://elsewhere.test".to_string()],
                        },
                    ],
                }))
            },
            search,
        );
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 5, None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Sufficient);
        assert_eq!(outcome.iterations_used, 1);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].content, "supported");
        assert_eq!(outcome.findings[0].iteration, 1);
        assert_eq!(outcome.findings[0].citations[0].title, "Doc 1-0");
    }

    #[tokio::test]
    async fn test_retrieval_failure_yields_empty_findings() {
        let search = ScriptedSearch::failing();
        let context = context_with(|_request: &ChatRequest| Ok(step_continue("x")), search.clone());
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 2, None).await.unwrap();
        assert!(outcome.findings.is_empty());
        assert_eq!(outcome.stop_reason, StopReason::IterationBudget);
        // 每次迭代 1 次检索 + retrieval_retries 次重试
        let expected = 2 * (1 + context.config.research.retrieval_retries as usize);
        assert_eq!(search.calls(), expected);
    }

    #[tokio::test]
    async fn test_reasoning_failure_returns_partial_findings() {
        let search = ScriptedSearch::numbered();
        let context = context_with(
            |request: &ChatRequest| {
                if request.history.is_empty() {
                    Ok(step_continue("https://doc.test/1-0"))
                } else {
                    Err(ProviderError::Unavailable("down".to_string()))
                }
            },
            search,
        );
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 5, None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ReasoningFailed);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_returns_immediately() {
        let search = ScriptedSearch::numbered();
        let context = context_with(|_request: &ChatRequest| Ok(step_continue("x")), search.clone());
        let researcher = Researcher::new(&context).unwrap();

        let deadline = Instant::now() - Duration::from_millis(1);
        let outcome = researcher
            .investigate(&sub_question(), 5, Some(deadline))
            .await
            .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Deadline);
        assert!(outcome.findings.is_empty());
    }

    #[tokio::test]
    async fn test_long_documents_are_condensed_before_reasoning() {
        let summarized = Arc::new(AtomicUsize::new(0));
        let counter = summarized.clone();
        let mut context = context_with(
            move |request: &ChatRequest| {
                if request.system_prompt == SUMMARIZE_PROMPT {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("condensed page".to_string())
                } else {
                    assert!(request.prompt.contains("condensed page"));
                    assert!(!request.prompt.contains("content of document"));
                    Ok(reply_json(&ResearchStep::Stop { findings: vec![] }))
                }
            },
            ScriptedSearch::numbered(),
        );
        context.config.research.summarize_documents_over_tokens = Some(1);
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 3, None).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Sufficient);
        assert_eq!(summarized.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back_to_truncation() {
        let mut context = context_with(
            |request: &ChatRequest| {
                if request.system_prompt == SUMMARIZE_PROMPT {
                    Err(ProviderError::Unavailable("down".to_string()))
                } else {
                    assert!(request.prompt.contains("content of"));
                    Ok(step_continue("https://doc.test/1-0"))
                }
            },
            ScriptedSearch::numbered(),
        );
        context.config.research.summarize_documents_over_tokens = Some(1);
        context.config.research.max_document_tokens = 3;
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 1, None).await.unwrap();
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::IterationBudget);
    }

    /// 第一次推理正常返回，之后的推理一直挂起
    struct StallingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatModel for StallingModel {
        async fn complete(&self, _request: ChatRequest) -> std::result::Result<String, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(step_continue("https://doc.test/1-0"));
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(reply_json(&ResearchStep::Stop { findings: vec![] }))
        }

        fn model_name(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn test_deadline_during_reasoning_keeps_earlier_findings() {
        let model = Arc::new(StallingModel {
            calls: AtomicUsize::new(0),
        });
        let context = context_from(test_config(), model.clone(), ScriptedSearch::numbered());
        let researcher = Researcher::new(&context).unwrap();

        let deadline = Instant::now() + Duration::from_millis(300);
        let started = Instant::now();
        let outcome = researcher
            .investigate(&sub_question(), 5, Some(deadline))
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Deadline);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].citations[0].url, "https://doc.test/1-0");
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unbounded_document_tokens_do_not_overflow() {
        let mut context = context_with(
            |request: &ChatRequest| {
                if request.system_prompt == SUMMARIZE_PROMPT {
                    assert!(request.prompt.contains("content of document"));
                    Ok("condensed page".to_string())
                } else {
                    Ok(step_continue("https://doc.test/1-0"))
                }
            },
            ScriptedSearch::numbered(),
        );
        context.config.research.summarize_documents_over_tokens = Some(1);
        context.config.research.max_document_tokens = usize::MAX;
        let researcher = Researcher::new(&context).unwrap();

        let outcome = researcher.investigate(&sub_question(), 1, None).await.unwrap();
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.stop_reason, StopReason::IterationBudget);
    }

    #[test]
    fn test_research_step_wire_format() {
        let step: ResearchStep = serde_json::from_str(
            r#"{"decision": "stop", "findings": [{"content": "c", "source_urls": ["u"]}]}"#,
        )
        .unwrap();
        assert!(matches!(step, ResearchStep::Stop { .. }));

        let step: ResearchStep =
            serde_json::from_str(r#"{"decision": "continue", "findings": []}"#).unwrap();
        assert_eq!(
            step,
            ResearchStep::Continue {
                findings: vec![],
                next_query: None
            }
        );
    }
}
