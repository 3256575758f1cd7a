//! Markdown surgery shared by the write, verify, rewrite, and finalize stages.
//!
//! Drafts are delimited by HTML-comment section markers so individual sections
//! can be located and spliced without re-parsing the whole document.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

pub fn section_start(id: &str) -> String {
    format!("<!-- SECTION:{id}:START -->")
}

pub fn section_end(id: &str) -> String {
    format!("<!-- SECTION:{id}:END -->")
}

/// Wrap a section body in its markers.
pub fn wrap_section(id: &str, body: &str) -> String {
    format!("{}\n{}\n{}\n", section_start(id), body.trim_end(), section_end(id))
}

fn section_start_re() -> Regex {
    Regex::new(r"<!-- SECTION:(?P<id>[^:]+):START -->").unwrap()
}

/// Extract marked sections (markers included) keyed by section id.
pub fn extract_sections(text: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    for caps in section_start_re().captures_iter(text) {
        let id = caps["id"].to_string();
        let start = caps.get(0).unwrap().start();
        let end_marker = section_end(&id);
        let search_from = caps.get(0).unwrap().end();
        if let Some(rel) = text[search_from..].find(&end_marker) {
            let end = search_from + rel + end_marker.len();
            sections.insert(id, text[start..end].to_string());
        }
    }
    sections
}

/// Body of a marked section block, markers stripped.
pub fn section_body(id: &str, block: &str) -> String {
    block
        .replace(&section_start(id), "")
        .replace(&section_end(id), "")
        .trim()
        .to_string()
}

/// Fold a reviewer's revised document back into the original draft.
///
/// Sections present in the revision replace their originals; empty bodies and
/// "content unchanged" stubs are skipped. A revision without any markers is
/// treated as a full-document replacement.
pub fn merge_revised(original: &str, revised: &str) -> String {
    if revised.trim().is_empty() {
        return original.to_string();
    }
    let revised_sections = extract_sections(revised);
    if revised_sections.is_empty() {
        return revised.to_string();
    }
    let original_sections = extract_sections(original);
    if original_sections.is_empty() {
        return revised.to_string();
    }
    let mut updated = original.to_string();
    for (id, block) in &revised_sections {
        let Some(original_block) = original_sections.get(id) else {
            continue;
        };
        let inner = section_body(id, block);
        if inner.is_empty() || inner.to_lowercase().contains("content unchanged") {
            continue;
        }
        updated = updated.replace(original_block, block);
    }
    updated
}

/// Sections whose body is a stub the writer never filled in.
pub fn find_placeholder_sections(text: &str) -> BTreeSet<String> {
    let mut placeholders = BTreeSet::new();
    for (id, block) in extract_sections(text) {
        let inner = section_body(&id, &block).to_lowercase();
        if inner.contains("content unchanged") || inner.contains("placeholder") {
            placeholders.insert(id);
        }
    }
    placeholders
}

// --- Finalize helpers ---

const TITLE_PAGE_START: &str = "<!-- TITLE_PAGE_START -->";
const TITLE_PAGE_END: &str = "<!-- TITLE_PAGE_END -->";

/// Title page prepended to the final document.
pub fn build_title_page(title: &str, audience: &str, job_id: &str) -> String {
    let generated_on = chrono::Utc::now().format("%Y-%m-%d");
    let mut lines = vec![TITLE_PAGE_START.to_string(), format!("# {title}"), String::new()];
    if !audience.trim().is_empty() {
        lines.push(format!("**Audience:** {audience}"));
    }
    lines.push(format!("**Job ID:** {job_id}"));
    lines.push(format!("**Generated:** {generated_on}"));
    lines.push(String::new());
    lines.push("<div style=\"page-break-after: always;\"></div>".to_string());
    lines.push(TITLE_PAGE_END.to_string());
    lines.push(String::new());
    lines.join("\n")
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes, rest.trim()))
}

/// Number ATX headings ("1.", "1.1", ...) outside code fences and outside the
/// title page. Idempotent: already-numbered headings are renumbered, not
/// double-prefixed.
pub fn number_headings(text: &str) -> String {
    let numbered_prefix = Regex::new(r"^\d+(\.\d+)*\.?\s+").unwrap();
    let mut counters = [0usize; 6];
    let mut in_fence = false;
    let mut in_title_page = false;
    let mut out = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            out.push(line.to_string());
            continue;
        }
        if trimmed.starts_with(TITLE_PAGE_START) {
            in_title_page = true;
        }
        if in_fence || in_title_page {
            if trimmed.starts_with(TITLE_PAGE_END) {
                in_title_page = false;
            }
            out.push(line.to_string());
            continue;
        }
        match heading_level(line) {
            Some((level, title)) => {
                counters[level - 1] += 1;
                for deeper in counters.iter_mut().skip(level) {
                    *deeper = 0;
                }
                // Documents whose top heading level is below H1 still number
                // from their own top: drop the leading zero counters.
                let first = counters[..level]
                    .iter()
                    .position(|c| *c > 0)
                    .unwrap_or(level - 1);
                let number = counters[first..level]
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                let bare = numbered_prefix.replace(title, "");
                out.push(format!("{} {}. {}", "#".repeat(level), number, bare));
            }
            None => out.push(line.to_string()),
        }
    }
    let mut joined = out.join("\n");
    if text.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Insert a table of contents after the title page (or at the top when no
/// title page is present), built from the document's headings.
pub fn insert_table_of_contents(text: &str) -> String {
    let mut toc = vec!["## Table of Contents".to_string(), String::new()];
    let mut in_fence = false;
    let mut in_title_page = false;
    let mut found = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if trimmed.starts_with(TITLE_PAGE_START) {
            in_title_page = true;
        }
        if in_fence || in_title_page {
            if trimmed.starts_with(TITLE_PAGE_END) {
                in_title_page = false;
            }
            continue;
        }
        if let Some((level, title)) = heading_level(line) {
            toc.push(format!("{}- {}", "  ".repeat(level.saturating_sub(1)), title));
            found = true;
        }
    }
    if !found {
        return text.to_string();
    }
    toc.push(String::new());
    let toc_block = toc.join("\n");
    match text.find(TITLE_PAGE_END) {
        Some(pos) => {
            let after = pos + TITLE_PAGE_END.len();
            format!("{}\n\n{}\n{}", &text[..after], toc_block, text[after..].trim_start_matches('\n'))
        }
        None => format!("{toc_block}\n{text}"),
    }
}

// --- Diagram block extraction ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramBlock {
    /// The full block as it appears in the draft, fence included.
    pub block: String,
    /// Normalized PlantUML source.
    pub source: String,
}

/// Find PlantUML blocks: fenced ```plantuml code blocks first, then bare
/// `@startuml`..`@enduml` spans that are not inside an already-found fence.
pub fn extract_diagram_blocks(text: &str) -> Vec<DiagramBlock> {
    let fenced = Regex::new(r"(?is)```plantuml\s+(?P<body>.*?)```").unwrap();
    let inline = Regex::new(r"(?is)@startuml.*?@enduml").unwrap();

    let mut spans: Vec<(usize, usize, DiagramBlock)> = Vec::new();
    for caps in fenced.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        spans.push((
            whole.start(),
            whole.end(),
            DiagramBlock {
                block: whole.as_str().to_string(),
                source: caps["body"].trim().to_string(),
            },
        ));
    }
    for m in inline.find_iter(text) {
        let overlaps = spans
            .iter()
            .any(|(s, e, _)| m.start() < *e && m.end() > *s);
        if overlaps {
            continue;
        }
        spans.push((
            m.start(),
            m.end(),
            DiagramBlock {
                block: m.as_str().to_string(),
                source: m.as_str().trim().to_string(),
            },
        ));
    }
    spans.sort_by_key(|(start, _, _)| *start);
    spans.into_iter().map(|(_, _, b)| b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_and_extract_roundtrip() {
        let doc = format!(
            "{}\n\n{}",
            wrap_section("s1", "First body"),
            wrap_section("s2", "Second body")
        );
        let sections = extract_sections(&doc);
        assert_eq!(sections.len(), 2);
        assert_eq!(section_body("s1", &sections["s1"]), "First body");
        assert_eq!(section_body("s2", &sections["s2"]), "Second body");
    }

    #[test]
    fn unterminated_section_skipped() {
        let doc = format!("{}\nno end marker", section_start("s1"));
        assert!(extract_sections(&doc).is_empty());
    }

    #[test]
    fn merge_replaces_changed_sections_only() {
        let original = format!(
            "{}\n{}",
            wrap_section("s1", "old one"),
            wrap_section("s2", "old two")
        );
        let revised = format!(
            "{}\n{}",
            wrap_section("s1", "new one"),
            wrap_section("s2", "Content unchanged.")
        );
        let merged = merge_revised(&original, &revised);
        assert!(merged.contains("new one"));
        assert!(merged.contains("old two"));
        assert!(!merged.contains("old one"));
    }

    #[test]
    fn merge_without_markers_replaces_document() {
        let original = wrap_section("s1", "body");
        let merged = merge_revised(&original, "A fully rewritten document.");
        assert_eq!(merged, "A fully rewritten document.");
        assert_eq!(merge_revised(&original, "   "), original);
    }

    #[test]
    fn placeholder_detection() {
        let doc = format!(
            "{}\n{}",
            wrap_section("s1", "Real prose."),
            wrap_section("s2", "PLACEHOLDER - fill in later")
        );
        let found = find_placeholder_sections(&doc);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[test]
    fn heading_numbering_skips_fences_and_title_page() {
        let text = format!(
            "{}# Intro\n\n```plantuml\n# not a heading\n```\n## Details\n## More\n",
            build_title_page("Doc", "Everyone", "j1")
        );
        let numbered = number_headings(&text);
        assert!(numbered.contains("# 1. Intro"));
        assert!(numbered.contains("## 1.1. Details"));
        assert!(numbered.contains("## 1.2. More"));
        assert!(numbered.contains("# not a heading"));
        // Title page heading keeps its bare form.
        assert!(numbered.contains("# Doc"));
        // Idempotent renumbering
        let twice = number_headings(&numbered);
        assert!(twice.contains("## 1.1. Details"));
        assert!(!twice.contains("1.1. 1.1."));
    }

    #[test]
    fn heading_numbering_without_h1() {
        let numbered = number_headings("## Alpha\n## Beta\n### Nested\n");
        assert!(numbered.contains("## 1. Alpha"));
        assert!(numbered.contains("## 2. Beta"));
        assert!(numbered.contains("### 2.1. Nested"));
    }

    #[test]
    fn toc_inserted_after_title_page() {
        let text = format!("{}# 1. Intro\n## 1.1. Details\n", build_title_page("Doc", "", "j1"));
        let with_toc = insert_table_of_contents(&text);
        let toc_pos = with_toc.find("## Table of Contents").unwrap();
        let intro_pos = with_toc.find("# 1. Intro").unwrap();
        assert!(toc_pos < intro_pos);
        assert!(with_toc.contains("- 1. Intro"));
        assert!(with_toc.contains("  - 1.1. Details"));
    }

    #[test]
    fn diagram_extraction_fenced_and_inline() {
        let text = "prose\n```plantuml\n@startuml\nA -> B\n@enduml\n```\nmore\n@startuml\nC -> D\n@enduml\ntail";
        let blocks = extract_diagram_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].block.starts_with("```plantuml"));
        assert!(blocks[0].source.contains("A -> B"));
        assert!(blocks[1].source.contains("C -> D"));
    }

    #[test]
    fn diagram_extraction_no_double_count() {
        let text = "```plantuml\n@startuml\nA -> B\n@enduml\n```";
        assert_eq!(extract_diagram_blocks(text).len(), 1);
    }
}
