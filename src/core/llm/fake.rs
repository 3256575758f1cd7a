//! Scripted gateway for deterministic tests: responses are queued per agent
//! role and popped in order. An exhausted queue is a test bug, surfaced as a
//! non-transient failure.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AgentRole, ChatMessage, Completion, LlmError, LlmGateway, TokenUsage};

enum Scripted {
    Text(String),
    Error(LlmError),
}

#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<HashMap<&'static str, VecDeque<Scripted>>>,
    /// Fallback per role when its queue runs dry.
    defaults: Mutex<HashMap<&'static str, String>>,
    calls: AtomicU64,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_text(&self, role: AgentRole, text: impl Into<String>) {
        self.script
            .lock()
            .await
            .entry(role.as_str())
            .or_default()
            .push_back(Scripted::Text(text.into()));
    }

    pub async fn push_json(&self, role: AgentRole, value: serde_json::Value) {
        self.push_text(role, value.to_string()).await;
    }

    pub async fn push_error(&self, role: AgentRole, error: LlmError) {
        self.script
            .lock()
            .await
            .entry(role.as_str())
            .or_default()
            .push_back(Scripted::Error(error));
    }

    /// Answer with `text` whenever the role's queue is empty.
    pub async fn default_text(&self, role: AgentRole, text: impl Into<String>) {
        self.defaults.lock().await.insert(role.as_str(), text.into());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for FakeGateway {
    async fn generate(
        &self,
        role: AgentRole,
        messages: &[ChatMessage],
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt: String = messages.iter().map(|m| m.content.as_str()).collect();
        let scripted = self
            .script
            .lock()
            .await
            .get_mut(role.as_str())
            .and_then(|queue| queue.pop_front());
        let text = match scripted {
            Some(Scripted::Text(text)) => text,
            Some(Scripted::Error(error)) => return Err(error),
            None => match self.defaults.lock().await.get(role.as_str()) {
                Some(text) => text.clone(),
                None => {
                    return Err(LlmError::Failed(format!(
                        "fake gateway script exhausted for role {}",
                        role.as_str()
                    )))
                }
            },
        };
        Ok(Completion {
            usage: TokenUsage::estimated_from(&prompt, &text),
            model: format!("fake-{}", role.as_str()),
            text,
        })
    }
}
