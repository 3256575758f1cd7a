//! Shared per-job memory: facts declared by earlier sections, style notes,
//! and glossary increments surfaced to later sections.
//!
//! The authoritative copy lives in the status store guarded by a
//! `memory_version` compare-and-swap; `memory.json` in the object store is a
//! mirror written after each successful swap.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::plan::SectionSpec;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMemory {
    /// Bullet-fact summaries keyed by section id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summaries: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub style_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
}

/// Increment produced by writing one section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDelta {
    pub section_id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub style_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
}

impl JobMemory {
    pub fn apply(&mut self, delta: &MemoryDelta) {
        self.summaries
            .insert(delta.section_id.clone(), delta.summary.clone());
        for note in &delta.style_notes {
            if !self.style_notes.contains(note) {
                self.style_notes.push(note.clone());
            }
        }
        for (term, definition) in &delta.glossary {
            self.glossary
                .entry(term.clone())
                .or_insert_with(|| definition.clone());
        }
    }

    /// Key facts from a section's dependencies, joined for the writer prompt.
    pub fn dependency_context(&self, section: &SectionSpec) -> String {
        section
            .depends_on
            .iter()
            .filter_map(|dep| self.summaries.get(dep))
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Summaries keyed by section id, as handed to the verifier.
    pub fn summaries_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.summaries).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(section: &str, summary: &str) -> MemoryDelta {
        MemoryDelta {
            section_id: section.to_string(),
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn apply_merges_without_duplicates() {
        let mut mem = JobMemory::default();
        let mut d = delta("s1", "- fact one");
        d.style_notes.push("terse voice".into());
        d.glossary.insert("QB".into(), "queue broker".into());
        mem.apply(&d);
        mem.apply(&d);
        assert_eq!(mem.style_notes.len(), 1);
        assert_eq!(mem.glossary.len(), 1);
        assert_eq!(mem.summaries["s1"], "- fact one");
    }

    #[test]
    fn glossary_first_definition_wins() {
        let mut mem = JobMemory::default();
        let mut d1 = delta("s1", "a");
        d1.glossary.insert("SS".into(), "status store".into());
        let mut d2 = delta("s2", "b");
        d2.glossary.insert("SS".into(), "something else".into());
        mem.apply(&d1);
        mem.apply(&d2);
        assert_eq!(mem.glossary["SS"], "status store");
    }

    #[test]
    fn dependency_context_joins_in_dependency_order() {
        let mut mem = JobMemory::default();
        mem.apply(&delta("s1", "- s1 facts"));
        mem.apply(&delta("s2", "- s2 facts"));
        let section = SectionSpec {
            id: "s3".into(),
            title: "S3".into(),
            goals: vec![],
            key_points: vec![],
            depends_on: vec!["s2".into(), "s1".into()],
            target_words: None,
        };
        assert_eq!(mem.dependency_context(&section), "- s2 facts\n- s1 facts");
    }
}
