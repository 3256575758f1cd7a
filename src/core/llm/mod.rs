//! LLM gateway: per-agent model selection, token accounting, retry on
//! transient failures, and a scripted fake for deterministic tests.

pub mod fake;
pub mod openai;

pub use fake::FakeGateway;
pub use openai::OpenAiGateway;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Interviewer,
    Planner,
    Writer,
    Reviewer,
    Verifier,
    Summarizer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Interviewer => "interviewer",
            AgentRole::Planner => "planner",
            AgentRole::Writer => "writer",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Verifier => "verifier",
            AgentRole::Summarizer => "summarizer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// True when the provider omitted usage and we fell back to estimation.
    #[serde(default)]
    pub estimated: bool,
}

impl TokenUsage {
    pub fn estimated_from(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated: true,
        }
    }
}

/// Rough token count when the provider does not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        0
    } else {
        ((text.len() as u64) / 3).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// 429 from the provider; honor `retry_after` when present.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// 5xx or transport failure; retryable.
    #[error("transient llm failure: {0}")]
    Transient(String),
    /// Non-retryable (4xx other than 429, malformed response).
    #[error("llm request failed: {0}")]
    Failed(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::Transient(_))
    }
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(
        &self,
        role: AgentRole,
        messages: &[ChatMessage],
    ) -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimation() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(300)), 100);
        let usage = TokenUsage::estimated_from("abcdef", "");
        assert!(usage.estimated);
        assert_eq!(usage.total_tokens, 2);
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_transient());
        assert!(LlmError::Transient("503".into()).is_transient());
        assert!(!LlmError::Failed("401".into()).is_transient());
    }
}
