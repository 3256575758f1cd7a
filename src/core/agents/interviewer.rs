//! Intake questionnaire generation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::extract_json_block;
use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway, TokenUsage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntakeQuestion {
    pub id: String,
    pub q: String,
    #[serde(default)]
    pub sample: String,
}

fn question(id: &str, q: &str, sample: &str) -> IntakeQuestion {
    IntakeQuestion {
        id: id.to_string(),
        q: q.to_string(),
        sample: sample.to_string(),
    }
}

/// Built-in questionnaire used when the model's proposal cannot be parsed.
pub fn default_questions() -> Vec<IntakeQuestion> {
    vec![
        question(
            "audience",
            "Who is the primary audience? (roles, seniority, background)",
            "Senior platform engineers and architects evaluating the design.",
        ),
        question(
            "goals",
            "What are the main goals of this document?",
            "Give implementation guidance, design rationale, and operational practices.",
        ),
        question(
            "non_goals",
            "What is explicitly out of scope?",
            "Product comparisons and step-by-step vendor tutorials.",
        ),
        question(
            "constraints",
            "Any constraints (tech stack, compliance, timeline)?",
            "Must match the existing platform stack and meet internal review standards.",
        ),
        question(
            "tone",
            "Preferred tone (formal, pragmatic, tutorial, RFC-like)?",
            "Authoritative and pragmatic.",
        ),
        question(
            "pov",
            "Point of view (1st person plural, neutral, instructive)?",
            "Neutral advisory viewpoint.",
        ),
        question(
            "structure",
            "Any structure preferences (chapters, case studies, appendices)?",
            "Overview, core chapters, case studies, appendices.",
        ),
        question(
            "must_cover",
            "Mandatory topics or keywords to cover?",
            "Reliability patterns, failure handling, observability.",
        ),
        question(
            "must_avoid",
            "Topics to avoid?",
            "Marketing claims and unreleased features.",
        ),
        question(
            "diagrams",
            "Which diagrams are needed (types, key entities/flows)?",
            "A component overview plus one sequence diagram for the main flow.",
        ),
    ]
}

pub struct InterviewerAgent {
    gateway: Arc<dyn LlmGateway>,
}

impl InterviewerAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Propose a prioritized questionnaire for the document title. Transient
    /// gateway failures bubble up for redelivery; unparseable output falls
    /// back to the built-in questionnaire.
    pub async fn propose_questions(
        &self,
        title: &str,
    ) -> Result<(Vec<IntakeQuestion>, TokenUsage), LlmError> {
        let sys = "You are a documentation scoping expert. Given a working title, propose a \
                   concise questionnaire to collect everything needed to produce a long, \
                   high-quality, consistent technical document.";
        let guide = format!(
            "Return ONLY a JSON list of objects {{id, q, sample}} where sample is a concise \
             default answer. Cover audience, goals, constraints, tone, pov, structure, \
             must_cover, must_avoid, and diagrams. At most 12 questions; prioritize the most \
             critical ones. Example questions: {}",
            serde_json::to_string(&default_questions()).unwrap_or_default()
        );
        let completion = self
            .gateway
            .generate(
                AgentRole::Interviewer,
                &[
                    ChatMessage::system(sys),
                    ChatMessage::user(format!("Title of the document: {title}")),
                    ChatMessage::user(guide),
                ],
            )
            .await?;

        let questions = parse_questions(&completion.text).unwrap_or_else(|| {
            warn!("interviewer output was not a question list, using defaults");
            default_questions()
        });
        Ok((questions, completion.usage))
    }
}

fn parse_questions(text: &str) -> Option<Vec<IntakeQuestion>> {
    let block = extract_json_block(text)?;
    let raw: Vec<serde_json::Value> = serde_json::from_str(block).ok()?;
    let mut questions = Vec::new();
    for (idx, item) in raw.iter().enumerate() {
        let obj = item.as_object()?;
        let q = obj
            .get("q")
            .or_else(|| obj.get("question"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if q.is_empty() {
            continue;
        }
        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("q{}", idx + 1));
        let sample = obj
            .get("sample")
            .or_else(|| obj.get("sample_answer"))
            .or_else(|| obj.get("example"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        questions.push(IntakeQuestion { id, q: q.to_string(), sample });
    }
    if questions.is_empty() {
        None
    } else {
        Some(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::FakeGateway;

    #[tokio::test]
    async fn parses_model_questionnaire() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(
            AgentRole::Interviewer,
            serde_json::json!([
                {"id": "audience", "q": "Who reads this?", "sample": "Engineers"},
                {"question": "What to avoid?", "example": "Hype"}
            ]),
        )
        .await;
        let agent = InterviewerAgent::new(fake);
        let (questions, usage) = agent.propose_questions("Async Patterns").await.unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "audience");
        assert_eq!(questions[1].id, "q2");
        assert_eq!(questions[1].sample, "Hype");
        assert!(usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn falls_back_to_defaults_on_prose() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_text(AgentRole::Interviewer, "I would ask about the audience.")
            .await;
        let agent = InterviewerAgent::new(fake);
        let (questions, _) = agent.propose_questions("T").await.unwrap();
        assert_eq!(questions, default_questions());
    }

    #[tokio::test]
    async fn transient_failure_propagates() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_error(AgentRole::Interviewer, LlmError::Transient("503".into()))
            .await;
        let agent = InterviewerAgent::new(fake);
        assert!(agent.propose_questions("T").await.is_err());
    }
}
