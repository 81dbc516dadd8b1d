//! 写作者：根据研究语料撰写最终报告，以及拆解前的初稿

use crate::error::{ResearchError, Result};
use crate::generator::context::ResearchContext;
use crate::generator::types::ResearchCorpus;
use crate::llm::client::LLMClient;
use crate::llm::router::AgentRole;
use crate::utils::token_estimator::TokenEstimator;

pub const WRITER_PROMPT: &str = "你是一名专业的研究报告撰写者。请基于提供的研究资料撰写一份结构清晰、内容详实的长篇报告。\
使用与用户问题相同的语言；只使用研究资料中的事实，并在正文中以 [标题](URL) 的形式标注来源；\
报告末尾列出全部参考来源。";

pub const DRAFT_PROMPT: &str = "你是一名研究助理。请仅凭已有知识为用户的问题撰写一份简短的初稿，\
列出你认为需要重点核实的方面。初稿只用于指导后续检索，不需要引用来源。";

pub struct Writer {
    client: LLMClient,
    draft_client: LLMClient,
    estimator: TokenEstimator,
}

impl Writer {
    pub fn new(context: &ResearchContext) -> Result<Self> {
        Ok(Self {
            client: context.router.resolve(AgentRole::Writer)?,
            draft_client: context.router.resolve(AgentRole::DraftWriter)?,
            estimator: context.estimator.clone(),
        })
    }

    /// 报告长度预算，与写作模型的输出上限一致
    pub fn budget(&self) -> usize {
        self.client.max_tokens() as usize
    }

    /// 撰写初稿，失败时返回None
    pub async fn draft(&self, query: &str) -> Option<String> {
        let prompt = format!("研究问题：{}\n\n请撰写初稿。", query);
        match self.draft_client.prompt(DRAFT_PROMPT, &prompt).await {
            Ok(draft) if !draft.trim().is_empty() => Some(
                self.estimator
                    .truncate_to_tokens(draft.trim(), self.draft_client.max_tokens() as usize),
            ),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "初稿撰写失败，跳过初稿");
                None
            }
        }
    }

    /// 撰写最终报告；语料为空时不调用模型
    pub async fn write(
        &self,
        query: &str,
        corpus: &ResearchCorpus,
        draft: Option<&str>,
    ) -> Result<String> {
        if corpus.is_empty() {
            return Err(ResearchError::Aggregation {
                query: query.to_string(),
                failed_sub_questions: vec![],
            });
        }

        let mut prompt = format!("研究问题：{}\n\n# 研究资料\n{}\n", query, corpus.render());
        if let Some(draft) = draft {
            prompt.push_str(&format!("\n# 初稿（结构参考，事实以研究资料为准）\n{}\n", draft));
        }
        prompt.push_str("\n请撰写最终报告。");

        let report = self.client.prompt(WRITER_PROMPT, &prompt).await?;
        Ok(self.estimator.truncate_to_tokens(report.trim(), self.budget()))
    }

    /// 写作模型不可用时直接由语料拼出报告
    pub fn fallback_report(&self, query: &str, corpus: &ResearchCorpus) -> String {
        let mut report = format!("# {}\n\n", query);
        for summary in corpus.ordered() {
            report.push_str(&format!("## {}\n\n", summary.sub_question));
            for claim in &summary.claims {
                let links: Vec<String> = claim
                    .citations
                    .iter()
                    .filter_map(|n| summary.citations.get(n - 1))
                    .map(|c| format!("[{}]({})", c.title, c.url))
                    .collect();
                report.push_str(&format!("- {} {}\n", claim.text.trim(), links.join(" ")));
            }
            report.push('\n');
        }
        self.estimator.truncate_to_tokens(&report, self.budget())
    }
}
