//! 研究流程中的核心数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::utils::token_estimator::TokenEstimator;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 一次研究运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub query: String,
    /// 已完成的轮次
    pub round: usize,
    pub status: RunStatus,
    /// 拆解前根据模型已有知识撰写的初稿
    pub draft_report: Option<String>,
    pub final_report: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            query: query.into(),
            round: 0,
            status: RunStatus::Pending,
            draft_report: None,
            final_report: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQuestionStatus {
    Queued,
    InProgress,
    Done,
    Failed,
}

/// 拆解后的单个研究子问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuestion {
    /// 形如 `sq-3`
    pub id: String,
    pub text: String,
    pub status: SubQuestionStatus,
    /// 产生该子问题的轮次
    pub round: usize,
}

/// 来源引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// 研究员在某次迭代中提取出的一条信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub sub_question_id: String,
    pub content: String,
    pub citations: Vec<Citation>,
    pub iteration: usize,
}

/// 压缩摘要中的一条论断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    /// 指向所属摘要`citations`的编号（从1开始）
    pub citations: Vec<usize>,
    /// 与子问题的相关度，0到1
    pub relevance: f64,
}

/// 单个子问题的压缩摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedSummary {
    pub sub_question_id: String,
    pub sub_question: String,
    pub round: usize,
    pub claims: Vec<Claim>,
    pub citations: Vec<Citation>,
    /// 摘要整体的相关度，写作阶段裁剪语料时使用
    pub relevance: f64,
    /// 是否因预算被截断过
    pub truncated: bool,
}

impl CompressedSummary {
    /// 构造摘要，丢弃没有有效引用的论断并整理引用编号
    pub fn new(
        sub_question: &SubQuestion,
        claims: Vec<Claim>,
        citations: Vec<Citation>,
        relevance: f64,
    ) -> Self {
        let mut summary = Self {
            sub_question_id: sub_question.id.clone(),
            sub_question: sub_question.text.clone(),
            round: sub_question.round,
            claims,
            citations,
            relevance: relevance.clamp(0.0, 1.0),
            truncated: false,
        };
        let citation_count = summary.citations.len();
        for claim in &mut summary.claims {
            claim.citations.retain(|n| *n >= 1 && *n <= citation_count);
            claim.citations.sort_unstable();
            claim.citations.dedup();
            claim.relevance = claim.relevance.clamp(0.0, 1.0);
        }
        summary
            .claims
            .retain(|c| !c.text.trim().is_empty() && !c.citations.is_empty());
        summary.prune_citations();
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// 渲染为带编号引用的文本，没有论断时为空
    pub fn render(&self) -> String {
        if self.claims.is_empty() {
            return String::new();
        }

        let mut text = String::new();
        for claim in &self.claims {
            text.push_str("- ");
            text.push_str(claim.text.trim());
            for n in &claim.citations {
                text.push_str(&format!(" [{}]", n));
            }
            text.push('\n');
        }
        text.push_str("\nSources:\n");
        for (i, citation) in self.citations.iter().enumerate() {
            text.push_str(&format!("[{}] {}: {}\n", i + 1, citation.title, citation.url));
        }
        text
    }

    pub fn token_count(&self, estimator: &TokenEstimator) -> usize {
        estimator.count_tokens(&self.render())
    }

    /// 把摘要压到预算以内，已在预算内时不做任何修改
    ///
    /// 先按相关度从低到高丢弃论断（相同相关度时先丢靠后的），只剩一条时截断其文本，
    /// 仍放不下则丢弃。论断与其引用一起移除。
    pub fn fit_to_budget(&mut self, budget: usize, estimator: &TokenEstimator) {
        while self.token_count(estimator) > budget {
            self.truncated = true;

            if self.claims.len() > 1 {
                let index = self.lowest_relevance_claim();
                self.claims.remove(index);
                self.prune_citations();
                continue;
            }

            if !self.shorten_last_claim(budget, estimator) {
                self.claims.clear();
                self.citations.clear();
            }
        }
    }

    fn lowest_relevance_claim(&self) -> usize {
        let mut lowest = 0;
        for (i, claim) in self.claims.iter().enumerate() {
            // <= 使相同相关度时选中更靠后的
            if claim.relevance <= self.claims[lowest].relevance {
                lowest = i;
            }
        }
        lowest
    }

    /// 截断唯一一条论断的文本；连一个字符都放不下时返回false
    fn shorten_last_claim(&mut self, budget: usize, estimator: &TokenEstimator) -> bool {
        let Some(claim) = self.claims.first() else {
            return false;
        };
        let original = claim.text.trim().to_string();
        let boundaries: Vec<usize> = original
            .char_indices()
            .map(|(i, _)| i)
            .skip(1)
            .chain(std::iter::once(original.len()))
            .collect();

        let fits = |summary: &mut Self, end: usize| {
            summary.claims[0].text = original[..end].to_string();
            summary.token_count(estimator) <= budget
        };

        // 找到能放下的最长前缀
        let (mut lo, mut hi) = (0usize, boundaries.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if fits(self, boundaries[mid]) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == 0 {
            return false;
        }
        self.claims[0].text = original[..boundaries[lo - 1]].to_string();
        true
    }

    /// 移除未被引用的来源并重新编号
    fn prune_citations(&mut self) {
        let mut used: Vec<usize> = self
            .claims
            .iter()
            .flat_map(|c| c.citations.iter().copied())
            .collect();
        used.sort_unstable();
        used.dedup();

        let remap: BTreeMap<usize, usize> = used
            .iter()
            .enumerate()
            .map(|(new, old)| (*old, new + 1))
            .collect();
        self.citations = used
            .iter()
            .filter_map(|old| self.citations.get(old - 1).cloned())
            .collect();
        for claim in &mut self.claims {
            for n in &mut claim.citations {
                if let Some(new) = remap.get(n) {
                    *n = *new;
                }
            }
        }
    }
}

/// 监督者在各轮中累积的摘要集合，按子问题ID存放，合并与顺序无关
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchCorpus {
    entries: BTreeMap<String, CompressedSummary>,
}

impl ResearchCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一条摘要，空摘要不会进入语料
    pub fn insert(&mut self, summary: CompressedSummary) -> bool {
        if summary.is_empty() {
            return false;
        }
        self.entries.insert(summary.sub_question_id.clone(), summary);
        true
    }

    pub fn merge(&mut self, other: ResearchCorpus) {
        for summary in other.entries.into_values() {
            self.insert(summary);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, sub_question_id: &str) -> Option<&CompressedSummary> {
        self.entries.get(sub_question_id)
    }

    pub fn contains(&self, sub_question_id: &str) -> bool {
        self.entries.contains_key(sub_question_id)
    }

    /// 按轮次、子问题序号排列的摘要
    pub fn ordered(&self) -> Vec<&CompressedSummary> {
        let mut summaries: Vec<&CompressedSummary> = self.entries.values().collect();
        summaries.sort_by(|a, b| {
            (a.round, id_ordinal(&a.sub_question_id), &a.sub_question_id).cmp(&(
                b.round,
                id_ordinal(&b.sub_question_id),
                &b.sub_question_id,
            ))
        });
        summaries
    }

    /// 写作阶段使用的语料文本
    pub fn render(&self) -> String {
        self.ordered()
            .into_iter()
            .map(|s| format!("## {}\n\n{}", s.sub_question, s.render()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn token_count(&self, estimator: &TokenEstimator) -> usize {
        estimator.count_tokens(&self.render())
    }

    /// 把语料压到写作输入预算以内，返回被整条丢弃的摘要数
    ///
    /// 优先丢弃相关度最低的摘要，相同时先丢较早轮次的，再按ID；只剩一条时压缩它本身。
    pub fn fit_to_budget(&mut self, budget: usize, estimator: &TokenEstimator) -> usize {
        let mut dropped = 0;
        loop {
            let total = self.token_count(estimator);
            if total <= budget {
                return dropped;
            }

            if self.entries.len() > 1 {
                if let Some(id) = self.lowest_priority() {
                    self.entries.remove(&id);
                    dropped += 1;
                }
                continue;
            }

            let Some(last) = self.entries.values_mut().next() else {
                return dropped;
            };
            let current = last.token_count(estimator);
            let excess = (total - budget).max(1);
            last.fit_to_budget(current.saturating_sub(excess), estimator);
            if last.is_empty() {
                self.entries.clear();
                dropped += 1;
            }
        }
    }

    fn lowest_priority(&self) -> Option<String> {
        self.entries
            .values()
            .min_by(|a, b| {
                a.relevance
                    .total_cmp(&b.relevance)
                    .then(a.round.cmp(&b.round))
                    .then(id_ordinal(&a.sub_question_id).cmp(&id_ordinal(&b.sub_question_id)))
                    .then(a.sub_question_id.cmp(&b.sub_question_id))
            })
            .map(|s| s.sub_question_id.clone())
    }
}

/// `sq-12` → 12，无法解析时排在最后
fn id_ordinal(id: &str) -> usize {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

/// 可持久化的完整运行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run: Run,
    pub sub_questions: Vec<SubQuestion>,
    pub corpus: ResearchCorpus,
    pub next_sub_question_seq: usize,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            run: Run::new(run_id, query),
            sub_questions: Vec::new(),
            corpus: ResearchCorpus::new(),
            next_sub_question_seq: 1,
        }
    }

    /// 排入一个新的子问题；空文本或与已有子问题重复时返回None
    pub fn enqueue(&mut self, text: &str, round: usize) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let normalized = normalize(text);
        if self
            .sub_questions
            .iter()
            .any(|sq| normalize(&sq.text) == normalized)
        {
            return None;
        }

        let id = format!("sq-{}", self.next_sub_question_seq);
        self.next_sub_question_seq += 1;
        self.sub_questions.push(SubQuestion {
            id: id.clone(),
            text: text.to_string(),
            status: SubQuestionStatus::Queued,
            round,
        });
        Some(id)
    }

    pub fn queued(&self) -> Vec<SubQuestion> {
        self.sub_questions
            .iter()
            .filter(|sq| sq.status == SubQuestionStatus::Queued)
            .cloned()
            .collect()
    }

    pub fn has_queued(&self) -> bool {
        self.sub_questions
            .iter()
            .any(|sq| sq.status == SubQuestionStatus::Queued)
    }

    pub fn set_status(&mut self, id: &str, status: SubQuestionStatus) {
        if let Some(sq) = self.sub_questions.iter_mut().find(|sq| sq.id == id) {
            sq.status = status;
        }
    }

    /// 恢复时把中断的子问题重新排队
    pub fn requeue_in_progress(&mut self) -> usize {
        let mut count = 0;
        for sq in &mut self.sub_questions {
            if sq.status == SubQuestionStatus::InProgress {
                sq.status = SubQuestionStatus::Queued;
                count += 1;
            }
        }
        count
    }

    pub fn count(&self, status: SubQuestionStatus) -> usize {
        self.sub_questions
            .iter()
            .filter(|sq| sq.status == status)
            .count()
    }

    pub fn failed_questions(&self) -> Vec<String> {
        self.sub_questions
            .iter()
            .filter(|sq| sq.status == SubQuestionStatus::Failed)
            .map(|sq| sq.text.clone())
            .collect()
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sub_question(id: &str, round: usize) -> SubQuestion {
        SubQuestion {
            id: id.to_string(),
            text: format!("question {}", id),
            status: SubQuestionStatus::Done,
            round,
        }
    }

    fn citation(n: usize) -> Citation {
        Citation {
            title: format!("Source {}", n),
            url: format!("https://example.com/{}", n),
        }
    }

    fn claim(text: &str, citations: Vec<usize>, relevance: f64) -> Claim {
        Claim {
            text: text.to_string(),
            citations,
            relevance,
        }
    }

    fn summary(id: &str, round: usize, relevance: f64) -> CompressedSummary {
        CompressedSummary::new(
            &sub_question(id, round),
            vec![
                claim("first fact about the topic", vec![1], 0.9),
                claim("second fact about the topic", vec![2], 0.4),
            ],
            vec![citation(1), citation(2)],
            relevance,
        )
    }

    #[test]
    fn test_new_drops_claims_without_citations() {
        let summary = CompressedSummary::new(
            &sub_question("sq-1", 0),
            vec![
                claim("cited", vec![2], 0.5),
                claim("uncited", vec![], 0.9),
                claim("out of range", vec![7], 0.9),
            ],
            vec![citation(1), citation(2)],
            0.5,
        );

        assert_eq!(summary.claims.len(), 1);
        assert_eq!(summary.claims[0].citations, vec![1]);
        assert_eq!(summary.citations, vec![citation(2)]);
    }

    #[test]
    fn test_render_empty_summary() {
        let summary = CompressedSummary::new(&sub_question("sq-1", 0), vec![], vec![], 0.0);
        assert!(summary.is_empty());
        assert_eq!(summary.render(), "");
    }

    #[test]
    fn test_render_with_sources() {
        let rendered = summary("sq-1", 0, 0.5).render();
        assert!(rendered.contains("- first fact about the topic [1]"));
        assert!(rendered.contains("[2] Source 2: https://example.com/2"));
    }

    #[test]
    fn test_fit_drops_lowest_relevance_first() {
        let estimator = TokenEstimator::new();
        let mut s = summary("sq-1", 0, 0.5);
        let full = s.token_count(&estimator);
        s.fit_to_budget(full - 1, &estimator);

        assert!(s.truncated);
        assert_eq!(s.claims.len(), 1);
        assert_eq!(s.claims[0].text, "first fact about the topic");
        // 被丢弃论断的引用一并移除并重新编号
        assert_eq!(s.citations, vec![citation(1)]);
        assert_eq!(s.claims[0].citations, vec![1]);
    }

    #[test]
    fn test_fit_within_budget_is_noop() {
        let estimator = TokenEstimator::new();
        let mut s = summary("sq-1", 0, 0.5);
        let before = s.clone();
        s.fit_to_budget(10_000, &estimator);
        assert_eq!(s, before);
    }

    #[test]
    fn test_fit_zero_budget_empties_summary() {
        let estimator = TokenEstimator::new();
        let mut s = summary("sq-1", 0, 0.5);
        s.fit_to_budget(0, &estimator);
        assert!(s.is_empty());
        assert!(s.citations.is_empty());
        assert!(s.truncated);
    }

    #[test]
    fn test_corpus_ignores_empty_summary() {
        let mut corpus = ResearchCorpus::new();
        let empty = CompressedSummary::new(&sub_question("sq-1", 0), vec![], vec![], 0.0);
        assert!(!corpus.insert(empty));
        assert!(corpus.is_empty());
    }

    #[test]
    fn test_corpus_render_orders_by_round_then_id() {
        let mut corpus = ResearchCorpus::new();
        corpus.insert(summary("sq-10", 1, 0.5));
        corpus.insert(summary("sq-2", 0, 0.5));
        corpus.insert(summary("sq-3", 1, 0.5));

        let order: Vec<&str> = corpus
            .ordered()
            .iter()
            .map(|s| s.sub_question_id.as_str())
            .collect();
        assert_eq!(order, vec!["sq-2", "sq-3", "sq-10"]);
        assert!(corpus.render().starts_with("## question sq-2"));
    }

    #[test]
    fn test_corpus_fit_drops_lowest_priority() {
        let estimator = TokenEstimator::new();
        let mut corpus = ResearchCorpus::new();
        corpus.insert(summary("sq-1", 0, 0.3));
        corpus.insert(summary("sq-2", 1, 0.3));
        corpus.insert(summary("sq-3", 0, 0.9));

        let mut two = corpus.clone();
        two.entries.remove("sq-1");
        let dropped = corpus.fit_to_budget(two.token_count(&estimator), &estimator);

        // 相关度相同，较早轮次的sq-1先被丢弃
        assert_eq!(dropped, 1);
        assert!(!corpus.contains("sq-1"));
        assert!(corpus.contains("sq-2"));
        assert!(corpus.contains("sq-3"));
    }

    #[test]
    fn test_corpus_fit_shrinks_last_entry() {
        let estimator = TokenEstimator::new();
        let mut corpus = ResearchCorpus::new();
        corpus.insert(summary("sq-1", 0, 0.3));
        let budget = corpus.token_count(&estimator) - 5;

        let dropped = corpus.fit_to_budget(budget, &estimator);
        assert_eq!(dropped, 0);
        assert!(corpus.token_count(&estimator) <= budget);
        assert!(corpus.get("sq-1").unwrap().truncated);
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let mut state = RunState::new("run-1", "query");
        assert_eq!(state.enqueue("What is Rust?", 0), Some("sq-1".to_string()));
        assert_eq!(state.enqueue("  what is   rust? ", 1), None);
        assert_eq!(state.enqueue("", 1), None);
        assert_eq!(state.enqueue("Who made Rust?", 1), Some("sq-2".to_string()));
        assert_eq!(state.queued().len(), 2);
    }

    #[test]
    fn test_requeue_in_progress() {
        let mut state = RunState::new("run-1", "query");
        state.enqueue("a", 0);
        state.enqueue("b", 0);
        state.set_status("sq-1", SubQuestionStatus::InProgress);
        state.set_status("sq-2", SubQuestionStatus::Failed);

        assert_eq!(state.requeue_in_progress(), 1);
        assert_eq!(state.count(SubQuestionStatus::Queued), 1);
        assert_eq!(state.failed_questions(), vec!["b".to_string()]);
    }

    fn arb_summary(id: usize) -> impl Strategy<Value = CompressedSummary> {
        (
            prop::collection::vec(("[a-z ]{1,60}", 0.0f64..1.0, 1usize..4), 1..6),
            0usize..3,
            0.0f64..1.0,
        )
            .prop_map(move |(claims, round, relevance)| {
                let citations: Vec<Citation> = (1..=3).map(citation).collect();
                let claims = claims
                    .into_iter()
                    .map(|(text, relevance, n)| claim(&format!("x{}", text), vec![n], relevance))
                    .collect();
                CompressedSummary::new(
                    &sub_question(&format!("sq-{}", id), round),
                    claims,
                    citations,
                    relevance,
                )
            })
    }

    fn arb_summaries() -> impl Strategy<Value = Vec<CompressedSummary>> {
        (1usize..6).prop_flat_map(|n| (1..=n).map(arb_summary).collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn prop_summary_fits_budget_and_refit_is_noop(s in arb_summary(1), budget in 0usize..200) {
            let estimator = TokenEstimator::new();
            let mut s = s;
            s.fit_to_budget(budget, &estimator);
            prop_assert!(s.token_count(&estimator) <= budget);
            for claim in &s.claims {
                prop_assert!(!claim.citations.is_empty());
                for n in &claim.citations {
                    prop_assert!(*n >= 1 && *n <= s.citations.len());
                }
            }

            let fitted = s.clone();
            s.fit_to_budget(budget, &estimator);
            prop_assert_eq!(s, fitted);
        }

        #[test]
        fn prop_corpus_merge_is_order_independent(
            (summaries, shuffled) in arb_summaries().prop_flat_map(|v| {
                let shuffled = Just(v.clone()).prop_shuffle();
                (Just(v), shuffled)
            }),
            budget in 0usize..400,
        ) {
            let estimator = TokenEstimator::new();
            let mut a = ResearchCorpus::new();
            for s in summaries {
                let mut single = ResearchCorpus::new();
                single.insert(s);
                a.merge(single);
            }
            let mut b = ResearchCorpus::new();
            for s in shuffled {
                b.insert(s);
            }
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.render(), b.render());

            a.fit_to_budget(budget, &estimator);
            b.fit_to_budget(budget, &estimator);
            prop_assert!(a.token_count(&estimator) <= budget);
            prop_assert_eq!(a, b);
        }
    }
}
