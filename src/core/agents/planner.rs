//! Outline planning: one model call producing the full document plan, with a
//! single in-place repair attempt when the output fails validation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use super::extract_json_block;
use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway};
use crate::core::plan::{DiagramSpec, GlobalStyle, Plan, SectionSpec};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Output still invalid after the repair attempt; the job dead-letters.
    #[error("planner produced an invalid plan: {0}")]
    Invalid(String),
}

#[derive(Deserialize)]
struct PlannerOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    length_pages: Option<u32>,
    #[serde(default, alias = "outline")]
    sections: Vec<SectionSpec>,
    #[serde(default)]
    glossary: BTreeMap<String, String>,
    #[serde(default)]
    global_style: GlobalStyle,
    #[serde(default)]
    diagram_specs: Vec<RawDiagramSpec>,
}

#[derive(Deserialize)]
struct RawDiagramSpec {
    section_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "type")]
    diagram_type: Option<String>,
    #[serde(default, alias = "plantuml_goal")]
    goal: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    relationships: Vec<String>,
}

pub struct PlannerAgent {
    gateway: Arc<dyn LlmGateway>,
}

impl PlannerAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    pub async fn plan(
        &self,
        title: &str,
        audience: &str,
        length_pages: u32,
    ) -> Result<(Plan, u64), PlannerError> {
        let sys = "You are a meticulous planning agent. Produce a JSON plan for a long, \
                   consistent markdown document with sections, objectives, constraints, a \
                   glossary, and PlantUML diagram specs. Keep it compact but complete.";
        let guide = "Respond ONLY with JSON having keys: title, audience, length_pages, \
                     sections, glossary, global_style, diagram_specs.\n\
                     - sections: list of {id, title, goals, key_points, depends_on, target_words}; \
                     depends_on may only reference ids of EARLIER sections\n\
                     - glossary: {term: definition}\n\
                     - global_style: {tone, pov, structure, constraints, formatting_rules}\n\
                     - diagram_specs: list of {section_id, name, diagram_type, goal, entities, \
                     relationships}\n";
        let request = format!(
            "Title: {title}\nAudience: {audience}\nTarget length pages: {length_pages}"
        );

        let completion = self
            .gateway
            .generate(
                AgentRole::Planner,
                &[
                    ChatMessage::system(sys),
                    ChatMessage::user(request.clone()),
                    ChatMessage::user(guide),
                ],
            )
            .await?;
        let mut tokens = completion.usage.total_tokens;

        match parse_plan(&completion.text, title, audience, length_pages) {
            Ok(plan) => return Ok((plan, tokens)),
            Err(reason) => {
                warn!("planner output invalid ({reason}), retrying with repair prompt");
                let repair = format!(
                    "Your previous plan was rejected: {reason}\n\
                     Previous output:\n{}\n\
                     Produce a corrected plan. {guide}",
                    completion.text
                );
                let retry = self
                    .gateway
                    .generate(
                        AgentRole::Planner,
                        &[
                            ChatMessage::system(sys),
                            ChatMessage::user(request),
                            ChatMessage::user(repair),
                        ],
                    )
                    .await?;
                tokens += retry.usage.total_tokens;
                match parse_plan(&retry.text, title, audience, length_pages) {
                    Ok(plan) => Ok((plan, tokens)),
                    Err(reason) => Err(PlannerError::Invalid(reason)),
                }
            }
        }
    }
}

fn parse_plan(
    text: &str,
    title: &str,
    audience: &str,
    length_pages: u32,
) -> Result<Plan, String> {
    let block = extract_json_block(text).ok_or_else(|| "no JSON block in output".to_string())?;
    let raw: PlannerOutput = serde_json::from_str(block).map_err(|e| e.to_string())?;
    let diagram_specs = raw
        .diagram_specs
        .into_iter()
        .enumerate()
        .map(|(idx, d)| DiagramSpec {
            name: d
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{}-diagram-{}", d.section_id, idx + 1)),
            diagram_type: d.diagram_type.unwrap_or_else(|| "component".to_string()),
            section_id: d.section_id,
            goal: d.goal,
            entities: d.entities,
            relationships: d.relationships,
        })
        .collect();
    let plan = Plan {
        title: raw.title.unwrap_or_else(|| title.to_string()),
        audience: raw.audience.unwrap_or_else(|| audience.to_string()),
        length_pages: raw.length_pages.unwrap_or(length_pages).max(60),
        sections: raw.sections,
        glossary: raw.glossary,
        global_style: raw.global_style,
        diagram_specs,
        executive_summary: None,
    };
    plan.validate().map_err(|e| e.to_string())?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::FakeGateway;

    fn two_section_plan() -> serde_json::Value {
        serde_json::json!({
            "title": "Async Patterns",
            "audience": "Architects",
            "length_pages": 72,
            "sections": [
                {"id": "s1", "title": "Intro", "depends_on": []},
                {"id": "s2", "title": "Patterns", "dependencies": ["s1"]}
            ],
            "glossary": {"broker": "message transport"},
            "diagram_specs": [
                {"section_id": "s2", "type": "sequence", "goal": "request flow"}
            ]
        })
    }

    #[tokio::test]
    async fn parses_valid_plan() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(AgentRole::Planner, two_section_plan()).await;
        let agent = PlannerAgent::new(fake);
        let (plan, tokens) = agent.plan("Async Patterns", "Architects", 80).await.unwrap();
        assert_eq!(plan.sections.len(), 2);
        assert_eq!(plan.sections[1].depends_on, vec!["s1"]);
        assert_eq!(plan.length_pages, 72);
        assert_eq!(plan.diagram_specs[0].name, "s2-diagram-1");
        assert!(tokens > 0);
    }

    #[tokio::test]
    async fn length_floor_applied() {
        let fake = Arc::new(FakeGateway::new());
        let mut body = two_section_plan();
        body["length_pages"] = serde_json::json!(20);
        fake.push_json(AgentRole::Planner, body).await;
        let agent = PlannerAgent::new(fake);
        let (plan, _) = agent.plan("T", "A", 80).await.unwrap();
        assert_eq!(plan.length_pages, 60);
    }

    #[tokio::test]
    async fn repair_prompt_fixes_invalid_first_attempt() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_text(AgentRole::Planner, "not a plan at all").await;
        fake.push_json(AgentRole::Planner, two_section_plan()).await;
        let agent = PlannerAgent::new(fake.clone());
        let (plan, _) = agent.plan("T", "A", 80).await.unwrap();
        assert_eq!(plan.sections.len(), 2);
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn second_invalid_output_is_terminal() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(
            AgentRole::Planner,
            serde_json::json!({"sections": [{"id": "s1", "title": "A", "depends_on": ["s2"]},
                                            {"id": "s2", "title": "B"}]}),
        )
        .await;
        fake.push_text(AgentRole::Planner, "still broken").await;
        let agent = PlannerAgent::new(fake);
        match agent.plan("T", "A", 80).await {
            Err(PlannerError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
