//! The agents: thin prompt-and-parse layers over the LLM gateway. Each agent
//! owns its prompt, its output schema, and the tolerance rules for sloppy
//! model output.

pub mod interviewer;
pub mod planner;
pub mod reviewer;
pub mod summarizer;
pub mod verifier;
pub mod writer;

pub use interviewer::{IntakeQuestion, InterviewerAgent};
pub use planner::{PlannerAgent, PlannerError};
pub use reviewer::{
    enabled_flavors, requires_rewrite, ReviewIssue, ReviewNote, ReviewerAgent, ReviewerFlavor,
    Severity,
};
pub use summarizer::Summarizer;
pub use verifier::{Contradiction, VerifierAgent, VerifyReport};
pub use writer::WriterAgent;

/// Extract a JSON block from model output. Tries a fenced ```json block
/// first, then raw JSON starting with `{` or `[`.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\ndone";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_raw_json() {
        assert_eq!(extract_json_block(" [1,2] "), Some("[1,2]"));
        assert_eq!(extract_json_block("{\"x\":0}"), Some("{\"x\":0}"));
    }

    #[test]
    fn rejects_prose() {
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block(""), None);
    }
}
