use serde::{Deserialize, Serialize};

/// Token估算器，所有预算（压缩预算、写作输入上下文、报告长度）都按它计量
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    rules: TokenCalculationRules,
}

/// Token计算规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCalculationRules {
    /// 英文字符的平均token比例（字符数/token数）
    pub english_char_per_token: f64,
    /// 中文字符的平均token比例
    pub chinese_char_per_token: f64,
    /// 一次请求的基础token开销（系统prompt等）
    pub base_token_overhead: usize,
}

impl Default for TokenCalculationRules {
    fn default() -> Self {
        Self {
            // 基于GPT系列模型的经验值
            english_char_per_token: 4.0,
            chinese_char_per_token: 1.5,
            base_token_overhead: 50,
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            rules: TokenCalculationRules::default(),
        }
    }

    /// 估算一次完整请求的token数量（含基础开销）
    pub fn estimate_request_tokens(&self, text: &str) -> usize {
        self.count_tokens(text) + self.rules.base_token_overhead
    }

    /// 估算一段内容本身的token数量，空文本为0
    pub fn count_tokens(&self, text: &str) -> usize {
        let mut chinese = 0usize;
        let mut other = 0usize;
        for c in text.chars() {
            if is_chinese_char(c) {
                chinese += 1;
            } else {
                other += 1;
            }
        }

        let chinese_tokens = (chinese as f64 / self.rules.chinese_char_per_token).ceil() as usize;
        let other_tokens = (other as f64 / self.rules.english_char_per_token).ceil() as usize;
        chinese_tokens + other_tokens
    }

    /// 检查文本是否超过token限制
    pub fn exceeds_limit(&self, text: &str, limit: usize) -> bool {
        self.count_tokens(text) > limit
    }

    /// 截取不超过limit个token的最长前缀
    pub fn truncate_to_tokens(&self, text: &str, limit: usize) -> String {
        if !self.exceeds_limit(text, limit) {
            return text.to_string();
        }

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        // 前缀的token数随长度单调不减，二分查找最长的合法前缀
        let (mut low, mut high) = (0usize, boundaries.len() - 1);
        while low < high {
            let mid = (low + high).div_ceil(2);
            if self.count_tokens(&text[..boundaries[mid]]) <= limit {
                low = mid;
            } else {
                high = mid - 1;
            }
        }

        text[..boundaries[low]].to_string()
    }
}

/// 判断是否为中文字符
fn is_chinese_char(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF |  // CJK统一汉字
        0x3400..=0x4DBF |  // CJK扩展A
        0x20000..=0x2A6DF | // CJK扩展B
        0x2A700..=0x2B73F | // CJK扩展C
        0x2B740..=0x2B81F | // CJK扩展D
        0x2B820..=0x2CEAF | // CJK扩展E
        0x2CEB0..=0x2EBEF | // CJK扩展F
        0x30000..=0x3134F   // CJK扩展G
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_has_no_tokens() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.count_tokens(""), 0);
        assert_eq!(estimator.estimate_request_tokens(""), 50);
    }

    #[test]
    fn test_chinese_and_english_rules() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.count_tokens("abcd"), 1);
        assert_eq!(estimator.count_tokens("abcde"), 2);
        assert_eq!(estimator.count_tokens("元胞自动"), 3);
    }

    #[test]
    fn test_truncate_to_tokens() {
        let estimator = TokenEstimator::new();
        let text = "a".repeat(100);
        let truncated = estimator.truncate_to_tokens(&text, 10);
        assert_eq!(truncated.len(), 40);

        let mixed = "元胞自动机 cellular automaton 三角形结构";
        let truncated = estimator.truncate_to_tokens(mixed, 5);
        assert!(estimator.count_tokens(&truncated) <= 5);
        assert!(mixed.starts_with(&truncated));
    }

    #[test]
    fn test_truncate_within_limit_is_identity() {
        let estimator = TokenEstimator::new();
        let text = "short text";
        assert_eq!(estimator.truncate_to_tokens(text, 100), text);
        assert_eq!(estimator.truncate_to_tokens("abc", 0), "");
    }
}
