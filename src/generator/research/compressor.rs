//! 压缩器：把一个子问题的原始发现整理为有预算上限、可溯源的摘要

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::generator::context::ResearchContext;
use crate::generator::types::{Citation, Claim, CompressedSummary, Finding, SubQuestion};
use crate::llm::client::LLMClient;
use crate::llm::router::AgentRole;
use crate::utils::token_estimator::TokenEstimator;

pub const SYSTEM_PROMPT: &str = "你是一名研究资料整理专家。请把研究员收集到的原始发现整理为简洁、去重的论断列表。\
每条论断都必须引用至少一条编号的原始发现作为依据，不要引入原始发现之外的信息。\
为每条论断给出0到1之间的相关度，并给出整体相关度。";

/// 兜底时原始发现的统一相关度
const FALLBACK_RELEVANCE: f64 = 0.5;

/// 模型输出的论断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompressedClaim {
    /// 论断内容
    pub text: String,
    /// 依据的原始发现编号（从1开始）
    pub findings: Vec<usize>,
    /// 与子问题的相关度，0到1
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompressionOutput {
    pub claims: Vec<CompressedClaim>,
    /// 摘要整体对子问题的相关度，0到1
    pub relevance: f64,
}

pub struct Compressor {
    client: LLMClient,
    estimator: TokenEstimator,
    /// 送入压缩模型的输入上限
    max_input_tokens: usize,
}

impl Compressor {
    pub fn new(context: &ResearchContext) -> Result<Self> {
        Ok(Self {
            client: context.router.resolve(AgentRole::Compressor)?,
            estimator: context.estimator.clone(),
            max_input_tokens: context.config.research.max_context_length,
        })
    }

    /// 压缩预算，与压缩模型的输出上限一致
    pub fn budget(&self) -> usize {
        self.client.max_tokens() as usize
    }

    /// 压缩一组发现；模型失败时退回到原始发现，结果总在预算以内
    pub async fn compress(
        &self,
        sub_question: &SubQuestion,
        findings: &[Finding],
        budget_tokens: usize,
    ) -> CompressedSummary {
        if findings.is_empty() {
            return CompressedSummary::new(sub_question, vec![], vec![], 0.0);
        }

        let findings = self.bounded_input(findings);
        let prompt = compression_prompt(sub_question, findings);

        let mut summary = match self
            .client
            .extract::<CompressionOutput>(SYSTEM_PROMPT, &prompt)
            .await
        {
            Ok(output) => {
                let summary = from_output(sub_question, findings, output);
                if summary.is_empty() {
                    tracing::warn!(sub_question = %sub_question.id, "压缩结果没有可溯源的论断，使用原始发现");
                    from_raw_findings(sub_question, findings)
                } else {
                    summary
                }
            }
            Err(e) => {
                tracing::warn!(sub_question = %sub_question.id, error = %e, "压缩失败，使用原始发现");
                from_raw_findings(sub_question, findings)
            }
        };

        summary.fit_to_budget(budget_tokens, &self.estimator);
        if summary.truncated {
            tracing::info!(
                sub_question = %sub_question.id,
                budget = budget_tokens,
                claims = summary.claims.len(),
                "压缩摘要超出预算，已截断"
            );
        }
        summary
    }

    /// 输入超过上限时只保留前面能放下的发现
    fn bounded_input<'a>(&self, findings: &'a [Finding]) -> &'a [Finding] {
        let mut used = 0;
        for (i, finding) in findings.iter().enumerate() {
            used += self.estimator.count_tokens(&finding.content);
            if used > self.max_input_tokens && i > 0 {
                tracing::warn!(kept = i, total = findings.len(), "压缩输入过长，丢弃后面的发现");
                return &findings[..i];
            }
        }
        findings
    }
}

fn compression_prompt(sub_question: &SubQuestion, findings: &[Finding]) -> String {
    let mut prompt = format!("子问题：{}\n\n## 原始发现\n", sub_question.text);
    for (i, finding) in findings.iter().enumerate() {
        let sources: Vec<String> = finding
            .citations
            .iter()
            .map(|c| format!("{} <{}>", c.title, c.url))
            .collect();
        prompt.push_str(&format!(
            "[{}] {}\n    来源: {}\n",
            i + 1,
            finding.content,
            sources.join("; ")
        ));
    }
    prompt.push_str("\n请整理为论断列表，用编号引用原始发现。");
    prompt
}

/// 收集论断引用的来源，按首次出现编号
fn collect_citations(
    citations: &mut Vec<Citation>,
    findings: &[Finding],
    finding_numbers: &[usize],
) -> Vec<usize> {
    let mut numbers = Vec::new();
    for n in finding_numbers {
        let Some(finding) = n.checked_sub(1).and_then(|i| findings.get(i)) else {
            continue;
        };
        for citation in &finding.citations {
            let index = match citations.iter().position(|c| c == citation) {
                Some(index) => index,
                None => {
                    citations.push(citation.clone());
                    citations.len() - 1
                }
            };
            numbers.push(index + 1);
        }
    }
    numbers
}

fn from_output(
    sub_question: &SubQuestion,
    findings: &[Finding],
    output: CompressionOutput,
) -> CompressedSummary {
    let mut citations = Vec::new();
    let claims = output
        .claims
        .into_iter()
        .map(|claim| Claim {
            citations: collect_citations(&mut citations, findings, &claim.findings),
            text: claim.text,
            relevance: claim.relevance,
        })
        .collect();
    CompressedSummary::new(sub_question, claims, citations, output.relevance)
}

fn from_raw_findings(sub_question: &SubQuestion, findings: &[Finding]) -> CompressedSummary {
    let mut citations = Vec::new();
    let claims = findings
        .iter()
        .enumerate()
        .map(|(i, finding)| Claim {
            text: finding.content.clone(),
            citations: collect_citations(&mut citations, findings, &[i + 1]),
            relevance: FALLBACK_RELEVANCE,
        })
        .collect();
    CompressedSummary::new(sub_question, claims, citations, FALLBACK_RELEVANCE)
}
