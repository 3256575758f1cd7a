//! Review flavors: the mandatory general reviewer plus the feature-flagged
//! style, cohesion, and executive-summary reviewers. All flavors share one
//! output schema so the verify stage can consolidate them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::extract_json_block;
use crate::config::Settings;
use crate::core::llm::{AgentRole, ChatMessage, LlmError, LlmGateway};
use crate::core::plan::Plan;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_patch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReviewNote {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub needs_rewrite: bool,
    #[serde(default)]
    pub tokens_used: u64,
    /// Full-document revision proposed by the general reviewer, folded into
    /// the draft at verify time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_markdown: Option<String>,
    /// Executive summary produced by the summary flavor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ReviewNote {
    /// Section ids named by this note's issues.
    pub fn sections(&self) -> BTreeSet<String> {
        self.issues
            .iter()
            .filter_map(|i| i.section_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewerFlavor {
    General,
    Style,
    Cohesion,
    Summary,
}

impl ReviewerFlavor {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewerFlavor::General => "general",
            ReviewerFlavor::Style => "style",
            ReviewerFlavor::Cohesion => "cohesion",
            ReviewerFlavor::Summary => "summary",
        }
    }

    pub fn artifact_name(self) -> String {
        format!("{}.json", self.as_str())
    }
}

/// Flavors to run this cycle. `general` always runs; the rest follow flags.
pub fn enabled_flavors(settings: &Settings) -> Vec<ReviewerFlavor> {
    let mut flavors = vec![ReviewerFlavor::General];
    if settings.review_style_enabled {
        flavors.push(ReviewerFlavor::Style);
    }
    if settings.review_cohesion_enabled {
        flavors.push(ReviewerFlavor::Cohesion);
    }
    if settings.review_summary_enabled {
        flavors.push(ReviewerFlavor::Summary);
    }
    flavors
}

/// Consolidated rewrite decision: an explicit flag from any flavor, or any
/// finding at high severity or above.
pub fn requires_rewrite(notes: &[ReviewNote]) -> bool {
    notes.iter().any(|note| {
        note.needs_rewrite || note.issues.iter().any(|i| i.severity >= Severity::High)
    })
}

pub struct ReviewerAgent {
    gateway: Arc<dyn LlmGateway>,
}

impl ReviewerAgent {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    pub async fn review(
        &self,
        flavor: ReviewerFlavor,
        plan: &Plan,
        draft: &str,
    ) -> Result<ReviewNote, LlmError> {
        let (sys, context) = match flavor {
            ReviewerFlavor::General => (
                "You are a critical reviewer. Check for contradictions, inconsistencies, and \
                 missing definitions, and propose a revised draft when needed.",
                format!(
                    "Plan: {}",
                    serde_json::to_string(&serde_json::json!({
                        "title": plan.title,
                        "audience": plan.audience,
                        "glossary": plan.glossary,
                        "global_style": plan.global_style,
                    }))
                    .unwrap_or_default()
                ),
            ),
            ReviewerFlavor::Style => (
                "You are a style editor. Assess clarity, tone, readability, and consistency.",
                format!(
                    "Plan style: {}",
                    serde_json::to_string(&plan.global_style).unwrap_or_default()
                ),
            ),
            ReviewerFlavor::Cohesion => (
                "You are a cohesion editor. Assess flow, transitions, cross-references, and \
                 section alignment.",
                format!(
                    "Outline: {}",
                    serde_json::to_string(&plan.sections).unwrap_or_default()
                ),
            ),
            ReviewerFlavor::Summary => (
                "You are an executive editor. Produce or assess an executive summary.",
                format!("Title: {} Audience: {}", plan.title, plan.audience),
            ),
        };
        let guide = "Return ONLY JSON with keys: issues (list of {section_id, severity, \
                     description, suggested_patch}), needs_rewrite (bool), and optionally \
                     revised_markdown or summary. Severity is one of low, medium, high, \
                     critical. IMPORTANT: preserve any section markers of the form \
                     '<!-- SECTION:ID:START -->' / '<!-- SECTION:ID:END -->' exactly.";

        let completion = self
            .gateway
            .generate(
                AgentRole::Reviewer,
                &[
                    ChatMessage::system(sys),
                    ChatMessage::user(context),
                    ChatMessage::user(format!("Draft Markdown begins:\n{draft}")),
                    ChatMessage::user(guide),
                ],
            )
            .await?;

        let mut note = parse_note(&completion.text).unwrap_or_else(|| {
            warn!(
                flavor = flavor.as_str(),
                "reviewer output was not structured, treating as no findings"
            );
            ReviewNote::default()
        });
        note.tokens_used = completion.usage.total_tokens;
        Ok(note)
    }
}

fn parse_note(text: &str) -> Option<ReviewNote> {
    let block = extract_json_block(text)?;
    serde_json::from_str(block).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::FakeGateway;
    use crate::core::plan::{GlobalStyle, SectionSpec};
    use std::collections::{BTreeMap, HashMap};

    fn plan() -> Plan {
        Plan {
            title: "T".into(),
            audience: "A".into(),
            length_pages: 80,
            sections: vec![SectionSpec {
                id: "s1".into(),
                title: "Intro".into(),
                goals: vec![],
                key_points: vec![],
                depends_on: vec![],
                target_words: None,
            }],
            glossary: BTreeMap::new(),
            global_style: GlobalStyle::default(),
            diagram_specs: vec![],
            executive_summary: None,
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn rewrite_decision() {
        let clean = ReviewNote::default();
        assert!(!requires_rewrite(&[clean.clone()]));

        let flagged = ReviewNote {
            needs_rewrite: true,
            ..Default::default()
        };
        assert!(requires_rewrite(&[clean.clone(), flagged]));

        let severe = ReviewNote {
            issues: vec![ReviewIssue {
                section_id: Some("s1".into()),
                severity: Severity::High,
                description: "wrong".into(),
                suggested_patch: None,
            }],
            ..Default::default()
        };
        assert!(requires_rewrite(&[severe]));

        let mild = ReviewNote {
            issues: vec![ReviewIssue {
                section_id: None,
                severity: Severity::Medium,
                description: "meh".into(),
                suggested_patch: None,
            }],
            ..Default::default()
        };
        assert!(!requires_rewrite(&[clean, mild]));
    }

    #[test]
    fn flavor_registry_follows_flags() {
        let mut env = HashMap::new();
        env.insert("DOCWRITER_REVIEW_STYLE_ENABLED".to_string(), "0".to_string());
        env.insert(
            "DOCWRITER_REVIEW_COHESION_ENABLED".to_string(),
            "false".to_string(),
        );
        env.insert(
            "DOCWRITER_REVIEW_SUMMARY_ENABLED".to_string(),
            "no".to_string(),
        );
        let settings = Settings::from_map(&env);
        assert_eq!(enabled_flavors(&settings), vec![ReviewerFlavor::General]);

        let all = Settings::from_map(&HashMap::new());
        assert_eq!(enabled_flavors(&all).len(), 4);
    }

    #[tokio::test]
    async fn parses_structured_note() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_json(
            AgentRole::Reviewer,
            serde_json::json!({
                "issues": [{"section_id": "s1", "severity": "high", "description": "contradiction"}],
                "needs_rewrite": true
            }),
        )
        .await;
        let agent = ReviewerAgent::new(fake);
        let note = agent
            .review(ReviewerFlavor::General, &plan(), "draft")
            .await
            .unwrap();
        assert!(note.needs_rewrite);
        assert_eq!(note.sections().into_iter().collect::<Vec<_>>(), vec!["s1"]);
        assert!(note.tokens_used > 0);
    }

    #[tokio::test]
    async fn prose_output_treated_as_clean() {
        let fake = Arc::new(FakeGateway::new());
        fake.push_text(AgentRole::Reviewer, "Looks good to me!").await;
        let agent = ReviewerAgent::new(fake);
        let note = agent
            .review(ReviewerFlavor::Style, &plan(), "draft")
            .await
            .unwrap();
        assert!(!note.needs_rewrite);
        assert!(note.issues.is_empty());
    }
}
