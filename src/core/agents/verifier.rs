//! Second-pass verification: contradictions between the facts earlier
//! sections declared (dependency summaries) and the current draft.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::extract_json_block;
use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contradiction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_bullet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VerifyReport {
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    #[serde(default)]
    pub needs_rewrite: bool,
}

impl VerifyReport {
    pub fn sections(&self) -> BTreeSet<String> {
        self.contradictions
            .iter()
            .filter_map(|c| c.section_id.clone())
            .collect()
    }
}

pub struct VerifierAgent {
    gateway: Arc<dyn LlmGateway>,
}

impl VerifierAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    pub async fn verify(
        &self,
        dependency_summaries: &serde_json::Value,
        draft: &str,
    ) -> Result<(VerifyReport, u64), LlmError> {
        let sys = "You are a precise verifier. Compare the provided dependency summaries \
                   (bullet facts per section) against the final Markdown. Identify \
                   contradictions or violations of those facts.";
        let guide = "Respond ONLY with JSON: {\"contradictions\": [{\"section_id\", \
                     \"summary_bullet\", \"snippet\", \"explanation\", \"fix\"}], \
                     \"needs_rewrite\": bool}";
        let completion = self
            .gateway
            .generate(
                AgentRole::Verifier,
                &[
                    ChatMessage::system(sys),
                    ChatMessage::user(format!(
                        "Dependency summaries per section (JSON):\n{dependency_summaries}"
                    )),
                    ChatMessage::user(format!("Final document Markdown begins:\n{draft}")),
                    ChatMessage::user(guide),
                ],
            )
            .await?;

        let report = parse_report(&completion.text).unwrap_or_else(|| {
            warn!("verifier output was not structured, treating as clean");
            VerifyReport::default()
        });
        Ok((report, completion.usage.total_tokens))
    }
}

fn parse_report(text: &str) -> Option<VerifyReport> {
    let block = extract_json_block(text)?;
    let value: serde_json::Value = serde_json::from_str(block).ok()?;
    let mut report: VerifyReport = serde_json::from_value(value.clone()).ok()?;
    // A report that lists contradictions but omits the flag still demands
    // a rewrite.
    if value.get("needs_rewrite").is_none() {
        report.needs_rewrite = !report.contradictions.is_empty();
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::FakeGateway;

    #[tokio::test]
    async fn contradictions_imply_rewrite_when_flag_missing() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(
            AgentRole::Verifier,
            serde_json::json!({
                "contradictions": [
                    {"section_id": "s2", "explanation": "contradicts s1 throughput claim"}
                ]
            }),
        )
        .await;
        let agent = VerifierAgent::new(fake);
        let (report, _) = agent
            .verify(&serde_json::json!({"s1": "- fact"}), "draft")
            .await
            .unwrap();
        assert!(report.needs_rewrite);
        assert_eq!(report.sections().into_iter().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[tokio::test]
    async fn explicit_flag_wins() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(
            AgentRole::Verifier,
            serde_json::json!({"contradictions": [], "needs_rewrite": false}),
        )
        .await;
        let agent = VerifierAgent::new(fake);
        let (report, _) = agent.verify(&serde_json::json!({}), "draft").await.unwrap();
        assert!(!report.needs_rewrite);
    }

    #[tokio::test]
    async fn junk_output_is_clean_report() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_text(AgentRole::Verifier, "all seems fine").await;
        let agent = VerifierAgent::new(fake);
        let (report, _) = agent.verify(&serde_json::json!({}), "draft").await.unwrap();
        assert!(report.contradictions.is_empty());
        assert!(!report.needs_rewrite);
    }
}
