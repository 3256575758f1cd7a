//! Section writing: one model call per section, output wrapped in section
//! markers so later stages can splice it.

use std::sync::Arc;

use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway};
use crate::core::markdown::wrap_section;
use crate::core::plan::{Plan, SectionSpec};

pub struct WriterAgent {
    gateway: Arc<dyn LlmGateway>,
}

impl WriterAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Produce the Markdown for one section, markers included. Returns the
    /// wrapped text and the tokens spent.
    pub async fn write_section(
        &self,
        plan: &Plan,
        section: &SectionSpec,
        dependency_context: &str,
        extra_guidance: Option<&str>,
    ) -> Result<(String, u64), LlmError> {
        let sys = "You are a disciplined technical writer. Write Markdown that strictly \
                   adheres to the provided plan, maintains global consistency, and embeds \
                   PlantUML diagrams where requested.";
        let section_diagrams = plan.diagrams_for(&section.id);
        let mut guide = format!(
            "Global style: {}\n\
             Glossary: {}\n\
             Section: {}\n\
             Diagrams: {}\n\
             Dependency context (key facts to respect): {}\n\
             Rules:\n\
             - Use consistent terminology from the glossary.\n\
             - Be concise but thorough; prefer clear subsections and lists.\n\
             - For each diagram spec, produce exactly one ```plantuml``` code block whose \
             first line is a single-quote comment naming the diagram, e.g. ' {}\n",
            serde_json::to_string(&plan.global_style).unwrap_or_default(),
            serde_json::to_string(&plan.glossary).unwrap_or_default(),
            serde_json::to_string(section).unwrap_or_default(),
            serde_json::to_string(&section_diagrams).unwrap_or_default(),
            if dependency_context.is_empty() {
                "N/A"
            } else {
                dependency_context
            },
            section_diagrams
                .first()
                .map(|d| d.name.as_str())
                .unwrap_or("diagram-name"),
        );
        if let Some(guidance) = extra_guidance {
            guide.push_str(&format!(
                "- Apply the following revision guidance (adjust prose accordingly; do not \
                 copy these notes verbatim):\n{guidance}\n"
            ));
        }

        let completion = self
            .gateway
            .generate(
                AgentRole::Writer,
                &[ChatMessage::system(sys), ChatMessage::user(guide)],
            )
            .await?;
        Ok((
            wrap_section(&section.id, &completion.text),
            completion.usage.total_tokens,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::FakeGateway;
    use crate::core::markdown::extract_sections;
    use crate::core::plan::GlobalStyle;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        Plan {
            title: "T".into(),
            audience: "A".into(),
            length_pages: 80,
            sections: vec![SectionSpec {
                id: "s1".into(),
                title: "Intro".into(),
                goals: vec!["orient the reader".into()],
                key_points: vec![],
                depends_on: vec![],
                target_words: Some(900),
            }],
            glossary: BTreeMap::new(),
            global_style: GlobalStyle::default(),
            diagram_specs: vec![],
            executive_summary: None,
        }
    }

    #[tokio::test]
    async fn output_is_marker_wrapped() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_text(AgentRole::Writer, "## Intro\n\nBody text.").await;
        let agent = WriterAgent::new(fake);
        let plan = plan();
        let (text, tokens) = agent
            .write_section(&plan, &plan.sections[0], "", None)
            .await
            .unwrap();
        let sections = extract_sections(&text);
        assert!(sections.contains_key("s1"));
        assert!(text.contains("Body text."));
        assert!(tokens > 0);
    }
}
