//! Document plan model and the section dependency graph.
//!
//! The planner produces an ordered section list whose `depends_on` edges must
//! form a DAG; sections are written in topological order and every dependency
//! must appear earlier in the list. Violations are rejected at plan time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no sections")]
    Empty,
    #[error("duplicate section id `{0}`")]
    DuplicateSection(String),
    #[error("section `{0}` depends on unknown section `{1}`")]
    UnknownDependency(String, String),
    #[error("section `{0}` depends on `{1}` which appears later in the plan")]
    ForwardDependency(String, String),
    #[error("cycle detected in section dependencies")]
    Cycle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pov: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formatting_rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionSpec {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_points: Vec<String>,
    #[serde(default, alias = "dependencies", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagramSpec {
    pub section_id: String,
    pub name: String,
    pub diagram_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub title: String,
    pub audience: String,
    pub length_pages: u32,
    pub sections: Vec<SectionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
    #[serde(default)]
    pub global_style: GlobalStyle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagram_specs: Vec<DiagramSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<String>,
}

impl Plan {
    pub fn section(&self, id: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn section_ids(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.id.clone()).collect()
    }

    pub fn diagrams_for(&self, section_id: &str) -> Vec<&DiagramSpec> {
        self.diagram_specs
            .iter()
            .filter(|d| d.section_id == section_id)
            .collect()
    }

    /// Enforce the plan invariants: at least one section, unique ids, and
    /// every dependency referencing an earlier section.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.sections.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for section in &self.sections {
            if !seen.insert(section.id.as_str()) {
                return Err(PlanError::DuplicateSection(section.id.clone()));
            }
        }
        let mut earlier: HashSet<&str> = HashSet::new();
        for section in &self.sections {
            for dep in &section.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency(
                        section.id.clone(),
                        dep.clone(),
                    ));
                }
                if !earlier.contains(dep.as_str()) {
                    return Err(PlanError::ForwardDependency(
                        section.id.clone(),
                        dep.clone(),
                    ));
                }
            }
            earlier.insert(section.id.as_str());
        }
        // Earlier-only references already exclude cycles; keep the graph
        // check so callers that build graphs from untrusted edges agree.
        DependencyGraph::from_sections(&self.sections).topological_order()?;
        Ok(())
    }
}

// --- Dependency graph ---

pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: HashMap<String, HashSet<String>>,
    reverse: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn from_sections(sections: &[SectionSpec]) -> Self {
        let nodes: Vec<String> = sections.iter().map(|s| s.id.clone()).collect();
        let known: HashSet<&str> = nodes.iter().map(|s| s.as_str()).collect();
        let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
        let mut reverse: HashMap<String, HashSet<String>> = HashMap::new();
        for section in sections {
            for dep in &section.depends_on {
                if !known.contains(dep.as_str()) {
                    continue;
                }
                edges
                    .entry(dep.clone())
                    .or_default()
                    .insert(section.id.clone());
                reverse
                    .entry(section.id.clone())
                    .or_default()
                    .insert(dep.clone());
            }
        }
        Self {
            nodes,
            edges,
            reverse,
        }
    }

    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.reverse
            .get(id)
            .map(|deps| deps.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Kahn's algorithm; ties broken by plan order so output is stable.
    pub fn topological_order(&self) -> Result<Vec<String>, PlanError> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.as_str(),
                    self.reverse.get(n).map(|p| p.len()).unwrap_or(0),
                )
            })
            .collect();
        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| indegree[n.as_str()] == 0)
            .map(|n| n.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(next) = self.edges.get(node) {
                // Preserve plan order among newly unblocked nodes.
                for candidate in self.nodes.iter().filter(|n| next.contains(*n)) {
                    let entry = indegree.get_mut(candidate.as_str()).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(candidate.as_str());
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(PlanError::Cycle);
        }
        Ok(order)
    }

    /// Kahn layering: each layer's sections only depend on earlier layers,
    /// so a layer can be written as one parallel batch.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, PlanError> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.as_str(),
                    self.reverse.get(n).map(|p| p.len()).unwrap_or(0),
                )
            })
            .collect();
        let mut frontier: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| indegree[n.as_str()] == 0)
            .cloned()
            .collect();
        let mut layers = Vec::new();
        let mut seen = 0usize;
        while !frontier.is_empty() {
            seen += frontier.len();
            let mut next_frontier = Vec::new();
            for node in &frontier {
                if let Some(next) = self.edges.get(node) {
                    for candidate in self.nodes.iter().filter(|n| next.contains(*n)) {
                        let entry = indegree.get_mut(candidate.as_str()).unwrap();
                        *entry -= 1;
                        if *entry == 0 {
                            next_frontier.push(candidate.clone());
                        }
                    }
                }
            }
            layers.push(std::mem::replace(&mut frontier, next_frontier));
        }
        if seen != self.nodes.len() {
            return Err(PlanError::Cycle);
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(id: &str, deps: &[&str]) -> SectionSpec {
        SectionSpec {
            id: id.to_string(),
            title: format!("Section {id}"),
            goals: vec![],
            key_points: vec![],
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            target_words: None,
        }
    }

    fn plan(sections: Vec<SectionSpec>) -> Plan {
        Plan {
            title: "T".into(),
            audience: "A".into(),
            length_pages: 80,
            sections,
            glossary: BTreeMap::new(),
            global_style: GlobalStyle::default(),
            diagram_specs: vec![],
            executive_summary: None,
        }
    }

    #[test]
    fn valid_linear_plan() {
        let p = plan(vec![
            section("s1", &[]),
            section("s2", &["s1"]),
            section("s3", &["s2"]),
        ]);
        assert!(p.validate().is_ok());
        let order = DependencyGraph::from_sections(&p.sections)
            .topological_order()
            .unwrap();
        assert_eq!(order, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn empty_plan_rejected() {
        assert_eq!(plan(vec![]).validate(), Err(PlanError::Empty));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let p = plan(vec![section("s1", &[]), section("s1", &[])]);
        assert_eq!(
            p.validate(),
            Err(PlanError::DuplicateSection("s1".into()))
        );
    }

    #[test]
    fn unknown_dependency_rejected() {
        let p = plan(vec![section("s1", &["ghost"])]);
        assert_eq!(
            p.validate(),
            Err(PlanError::UnknownDependency("s1".into(), "ghost".into()))
        );
    }

    #[test]
    fn forward_dependency_rejected() {
        let p = plan(vec![section("s1", &["s2"]), section("s2", &[])]);
        assert_eq!(
            p.validate(),
            Err(PlanError::ForwardDependency("s1".into(), "s2".into()))
        );
    }

    #[test]
    fn cycle_detected_by_graph() {
        let sections = vec![section("s1", &["s2"]), section("s2", &["s1"])];
        let graph = DependencyGraph::from_sections(&sections);
        assert_eq!(graph.topological_order(), Err(PlanError::Cycle));
        assert_eq!(graph.layers(), Err(PlanError::Cycle));
    }

    #[test]
    fn diamond_layers() {
        let sections = vec![
            section("root", &[]),
            section("left", &["root"]),
            section("right", &["root"]),
            section("merge", &["left", "right"]),
        ];
        let layers = DependencyGraph::from_sections(&sections).layers().unwrap();
        assert_eq!(
            layers,
            vec![
                vec!["root".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["merge".to_string()],
            ]
        );
    }

    #[test]
    fn predecessors_reported() {
        let sections = vec![section("s1", &[]), section("s2", &["s1"])];
        let graph = DependencyGraph::from_sections(&sections);
        assert_eq!(graph.predecessors("s2"), vec!["s1"]);
        assert!(graph.predecessors("s1").is_empty());
    }
}
