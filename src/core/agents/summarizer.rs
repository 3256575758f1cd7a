//! Key-fact extraction feeding the shared job memory.

use std::sync::Arc;

use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway};

pub struct Summarizer {
    gateway: Arc<dyn LlmGateway>,
}

impl Summarizer {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// 5-10 bullet key facts from a freshly written section.
    pub async fn summarize_section(&self, markdown: &str) -> Result<(String, u64), LlmError> {
        let sys = "You are a precise summarizer. Extract 5-10 bullet key facts/definitions \
                   from the text. Be terse and faithful; no new claims. Output plain bullets.";
        let completion = self
            .gateway
            .generate(
                AgentRole::Summarizer,
                &[ChatMessage::system(sys), ChatMessage::user(markdown)],
            )
            .await?;
        Ok((completion.text, completion.usage.total_tokens))
    }
}
