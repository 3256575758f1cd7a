//! OpenAI-compatible chat completions backend.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AgentRole, ChatMessage, Completion, LlmError, LlmGateway, TokenUsage};
use crate::config::Settings;

// ── Request/response wire types ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageOwned,
}

#[derive(Deserialize)]
struct MessageOwned {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

// ── Gateway ──

pub struct OpenAiGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_version: Option<String>,
    planner_model: String,
    writer_model: String,
    reviewer_model: String,
    max_retries: u32,
    retry_base_ms: u64,
}

impl OpenAiGateway {
    pub fn new(settings: &Settings) -> Result<Self, LlmError> {
        let base_url = settings
            .llm_base_url
            .clone()
            .ok_or_else(|| LlmError::Failed("DOCWRITER_LLM_BASE_URL not configured".into()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_s))
            .build()
            .map_err(|e| LlmError::Failed(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key: settings.llm_api_key.clone(),
            api_version: settings.llm_api_version.clone(),
            planner_model: settings.planner_model.clone(),
            writer_model: settings.writer_model.clone(),
            reviewer_model: settings.reviewer_model.clone(),
            max_retries: settings.max_transient_retries,
            retry_base_ms: 500,
        })
    }

    #[cfg(test)]
    fn with_retry_base_ms(mut self, ms: u64) -> Self {
        self.retry_base_ms = ms;
        self
    }

    fn model_for(&self, role: AgentRole) -> &str {
        match role {
            AgentRole::Planner | AgentRole::Interviewer => &self.planner_model,
            AgentRole::Writer => &self.writer_model,
            AgentRole::Reviewer | AgentRole::Verifier | AgentRole::Summarizer => {
                &self.reviewer_model
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_base_ms.saturating_mul(1u64 << attempt.min(6));
        let capped = base.min(10_000);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }

    async fn attempt(
        &self,
        model: &str,
        messages: &[ChatMessage],
        prompt_chars: &str,
    ) -> Result<Completion, LlmError> {
        let request = ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: 0.2,
        };
        let mut builder = self.client.post(&self.base_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(version) = &self.api_version {
            builder = builder.header("api-version", version);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(LlmError::Transient(format!("llm returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Failed(format!("llm returned {status}: {body}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Failed(format!("malformed llm response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = match parsed.usage {
            Some(u) => {
                let prompt = u.prompt_tokens.unwrap_or(0);
                let completion = u.completion_tokens.unwrap_or(0);
                TokenUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: u.total_tokens.unwrap_or(prompt + completion),
                    estimated: false,
                }
            }
            None => TokenUsage::estimated_from(prompt_chars, &text),
        };
        Ok(Completion {
            text,
            usage,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn generate(
        &self,
        role: AgentRole,
        messages: &[ChatMessage],
    ) -> Result<Completion, LlmError> {
        let model = self.model_for(role).to_string();
        let prompt_chars: String = messages.iter().map(|m| m.content.as_str()).collect();
        let mut attempt = 0u32;
        loop {
            match self.attempt(&model, messages, &prompt_chars).await {
                Ok(completion) => {
                    debug!(
                        role = role.as_str(),
                        model,
                        tokens = completion.usage.total_tokens,
                        "llm call complete"
                    );
                    return Ok(completion);
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = match &err {
                        LlmError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => self.retry_delay(attempt),
                    };
                    warn!(
                        role = role.as_str(),
                        attempt,
                        "retrying llm call in {:?}: {err}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn settings(url: &str) -> Settings {
        let mut env = HashMap::new();
        env.insert("DOCWRITER_LLM_BASE_URL".to_string(), url.to_string());
        env.insert("DOCWRITER_LLM_API_KEY".to_string(), "test-key".to_string());
        env.insert("DOCWRITER_WRITER_MODEL".to_string(), "writer-x".to_string());
        Settings::from_map(&env)
    }

    fn ok_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": text}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    struct FlakyResponder {
        failures: std::sync::atomic::AtomicU32,
    }

    impl Respond for FlakyResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            use std::sync::atomic::Ordering;
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            }).is_ok()
            {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_json(ok_body("recovered"))
            }
        }
    }

    #[tokio::test]
    async fn success_reports_usage_and_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("hello")))
            .mount(&server)
            .await;
        let gateway =
            OpenAiGateway::new(&settings(&format!("{}/v1/chat/completions", server.uri())))
                .unwrap();
        let out = gateway
            .generate(AgentRole::Writer, &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.model, "writer-x");
        assert_eq!(out.usage.total_tokens, 15);
        assert!(!out.usage.estimated);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(FlakyResponder {
                failures: std::sync::atomic::AtomicU32::new(2),
            })
            .mount(&server)
            .await;
        let gateway = OpenAiGateway::new(&settings(&server.uri()))
            .unwrap()
            .with_retry_base_ms(1);
        let out = gateway
            .generate(AgentRole::Writer, &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(out.text, "recovered");
    }

    #[tokio::test]
    async fn client_errors_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;
        let gateway = OpenAiGateway::new(&settings(&server.uri()))
            .unwrap()
            .with_retry_base_ms(1);
        let err = gateway
            .generate(AgentRole::Planner, &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn persistent_rate_limit_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;
        let gateway = OpenAiGateway::new(&settings(&server.uri()))
            .unwrap()
            .with_retry_base_ms(1);
        let err = gateway
            .generate(AgentRole::Reviewer, &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        // 1 initial + max_transient_retries (3) attempts
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn estimates_usage_when_provider_omits_it() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "abcdef"}}]
        });
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let gateway = OpenAiGateway::new(&settings(&server.uri())).unwrap();
        let out = gateway
            .generate(AgentRole::Summarizer, &[ChatMessage::user("123456")])
            .await
            .unwrap();
        assert!(out.usage.estimated);
        assert_eq!(out.usage.total_tokens, 4);
    }
}
