//! Tavily检索服务

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SearchConfig;
use crate::error::{ResearchError, Result};
use crate::search::{RetrievalError, SearchDocument, SearchProvider};

pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    max_results: usize,
    include_raw_content: bool,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: usize,
    include_raw_content: bool,
    topic: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    score: f64,
}

impl TavilySearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(ResearchError::configuration(
                "缺少检索服务API KEY（TAVILY_API_KEY）",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ResearchError::configuration(format!("无法创建HTTP客户端: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/search", config.api_base_url.trim_end_matches('/')),
            max_results: config.max_results,
            include_raw_content: config.include_raw_content,
        })
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchDocument>, RetrievalError> {
        let request = SearchRequest {
            query,
            max_results: self.max_results,
            include_raw_content: self.include_raw_content,
            topic: "general",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable(format!("{}: {}", status, text)));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("无法解析检索结果: {}", e)))?;

        let documents = into_documents(body);
        if documents.is_empty() {
            return Err(RetrievalError::NoResults);
        }
        Ok(documents)
    }
}

/// 转换为文档并按分数排序，有正文时优先使用正文
fn into_documents(body: SearchResponse) -> Vec<SearchDocument> {
    let mut documents: Vec<SearchDocument> = body
        .results
        .into_iter()
        .filter(|r| !r.url.trim().is_empty())
        .map(|r| SearchDocument {
            title: r.title,
            url: r.url,
            content: r
                .raw_content
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(r.content),
            score: r.score,
        })
        .collect();
    documents.sort_by(|a, b| b.score.total_cmp(&a.score));
    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let config = SearchConfig::default();
        assert!(matches!(
            TavilySearch::new(&config),
            Err(ResearchError::Configuration(_))
        ));
    }

    #[test]
    fn test_response_conversion() {
        let body: SearchResponse = serde_json::from_str(
            r#"{
                "query": "rust",
                "results": [
                    {"title": "low", "url": "https://a.dev", "content": "snippet a", "score": 0.2},
                    {"title": "high", "url": "https://b.dev", "content": "snippet b",
                     "raw_content": "full page b", "score": 0.8},
                    {"title": "no url", "url": "", "content": "x", "score": 0.9}
                ]
            }"#,
        )
        .unwrap();

        let documents = into_documents(body);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].title, "high");
        assert_eq!(documents[0].content, "full page b");
        assert_eq!(documents[1].content, "snippet a");
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let config = SearchConfig {
            api_key: "tvly-test".to_string(),
            api_base_url: "https://api.tavily.com/".to_string(),
            ..SearchConfig::default()
        };
        let search = TavilySearch::new(&config).unwrap();
        assert_eq!(search.endpoint, "https://api.tavily.com/search");
    }
}
