use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

use crate::{
    llm::client::types::{ProviderError, TokenUsage},
    utils::token_estimator::TokenEstimator,
};

static TOKEN_ESTIMATOR: LazyLock<TokenEstimator> = LazyLock::new(TokenEstimator::new);

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)```").expect("valid regex")
});

/// 从模型输出中找出JSON片段：优先取代码块，其次取首个`{`到最后一个`}`
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(captures) = FENCED_BLOCK.captures(text) {
        if let Some(block) = captures.get(1) {
            let block = block.as_str().trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 把模型输出解析为结构化结果
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, ProviderError> {
    let block = extract_json_block(text)
        .ok_or_else(|| ProviderError::Malformed(format!("输出中没有JSON: {}", preview(text))))?;
    serde_json::from_str(block)
        .map_err(|e| ProviderError::Malformed(format!("{}: {}", e, preview(block))))
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

/// 估算token使用情况（基于文本长度）
pub fn estimate_token_usage(input_text: &str, output_text: &str) -> TokenUsage {
    TokenUsage::new(
        TOKEN_ESTIMATOR.count_tokens(input_text),
        TOKEN_ESTIMATOR.count_tokens(output_text),
    )
}
