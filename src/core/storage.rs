//! Object store abstraction and the canonical per-job blob layout.
//!
//! Every artifact a job produces lives under `jobs/{owner_id}/{job_id}/`;
//! stage workers never read or write outside their job root.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Canonical blob paths for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub owner_id: String,
    pub job_id: String,
}

impl JobPaths {
    pub fn new(owner_id: &str, job_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            job_id: job_id.to_string(),
        }
    }

    pub fn root(&self) -> String {
        format!("jobs/{}/{}", self.owner_id, self.job_id)
    }

    /// Whether a blob path lies inside this job's root.
    pub fn contains(&self, blob: &str) -> bool {
        blob.starts_with(&format!("{}/", self.root()))
    }

    /// A job-relative path ("drafts/s1.md") resolved against the root.
    pub fn resolve(&self, relative: &str) -> String {
        format!("{}/{}", self.root(), relative.trim_start_matches('/'))
    }

    pub fn intake(&self, name: &str) -> String {
        format!("{}/intake/{name}", self.root())
    }

    pub fn plan(&self) -> String {
        format!("{}/plan.json", self.root())
    }

    pub fn memory(&self) -> String {
        format!("{}/memory.json", self.root())
    }

    pub fn draft(&self, section_id: &str) -> String {
        format!("{}/drafts/{section_id}.md", self.root())
    }

    pub fn drafts_prefix(&self) -> String {
        format!("{}/drafts/", self.root())
    }

    pub fn review(&self, cycle: u32, name: &str) -> String {
        format!("{}/reviews/cycle-{cycle}/{name}", self.root())
    }

    pub fn rewrite(&self, cycle: u32, section_id: &str) -> String {
        format!("{}/rewrites/cycle-{cycle}/{section_id}.md", self.root())
    }

    pub fn diagram_index(&self) -> String {
        format!("{}/diagrams/index.json", self.root())
    }

    pub fn diagram_source(&self, name: &str) -> String {
        format!("{}/diagrams/{name}.puml", self.root())
    }

    pub fn diagram_asset(&self, name: &str, format: &str) -> String {
        format!("{}/diagrams/{name}.{format}", self.root())
    }

    pub fn diagrams_prefix(&self) -> String {
        format!("{}/diagrams/", self.root())
    }

    pub fn final_artifact(&self, ext: &str) -> String {
        format!("{}/final.{ext}", self.root())
    }

    pub fn diagram_archive(&self) -> String {
        format!("{}/diagrams.zip", self.root())
    }

    pub fn metrics(&self, name: &str) -> String {
        format!("{}/metrics/{name}.json", self.root())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_bytes(&self, blob: &str, data: &[u8]) -> Result<()>;
    async fn get_bytes(&self, blob: &str) -> Result<Vec<u8>>;
    async fn exists(&self, blob: &str) -> Result<bool>;
    /// Blob paths under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put_text(&self, blob: &str, text: &str) -> Result<()> {
        self.put_bytes(blob, text.as_bytes()).await
    }

    async fn get_text(&self, blob: &str) -> Result<String> {
        let bytes = self.get_bytes(blob).await?;
        String::from_utf8(bytes).with_context(|| format!("blob {blob} is not utf-8"))
    }
}

// JSON helpers live on the trait object: generic methods would make the
// trait itself non-object-safe.
impl dyn ObjectStore + '_ {
    pub async fn put_json<T: serde::Serialize + Sync>(&self, blob: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.put_text(blob, &text).await
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, blob: &str) -> Result<T> {
        let text = self.get_text(blob).await?;
        serde_json::from_str(&text).with_context(|| format!("blob {blob} is not valid JSON"))
    }
}

/// Filesystem-backed store rooted at a directory; blob names map to relative
/// paths. Blob names with traversal components are rejected.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, blob: &str) -> Result<PathBuf> {
        let rel = Path::new(blob);
        if rel.is_absolute() {
            bail!("blob path {blob} must be relative");
        }
        for part in rel.components() {
            match part {
                Component::Normal(_) => {}
                _ => bail!("blob path {blob} contains a traversal component"),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_bytes(&self, blob: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(blob)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing blob {blob}"))
    }

    async fn get_bytes(&self, blob: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob {blob}"))
    }

    async fn exists(&self, blob: &str) -> Result<bool> {
        let path = self.path_for(blob)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        let mut found = BTreeMap::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    found.insert(name, ());
                }
            }
        }
        Ok(found.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, store) = store();
        store.put_text("jobs/u/j/plan.json", "{}").await.unwrap();
        assert_eq!(store.get_text("jobs/u/j/plan.json").await.unwrap(), "{}");
        assert!(store.exists("jobs/u/j/plan.json").await.unwrap());
        assert!(!store.exists("jobs/u/j/missing").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_rejected() {
        let (_dir, store) = store();
        assert!(store.put_text("../escape.txt", "x").await.is_err());
        assert!(store.get_bytes("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_sorted_blobs_under_prefix() {
        let (_dir, store) = store();
        store.put_text("jobs/u/j/drafts/s2.md", "b").await.unwrap();
        store.put_text("jobs/u/j/drafts/s1.md", "a").await.unwrap();
        store.put_text("jobs/u/j/plan.json", "{}").await.unwrap();
        let drafts = store.list("jobs/u/j/drafts/").await.unwrap();
        assert_eq!(drafts, vec!["jobs/u/j/drafts/s1.md", "jobs/u/j/drafts/s2.md"]);
        assert!(store.list("jobs/u/other/").await.unwrap().is_empty());
    }

    #[test]
    fn job_paths_layout() {
        let paths = JobPaths::new("u1", "j1");
        assert_eq!(paths.plan(), "jobs/u1/j1/plan.json");
        assert_eq!(paths.intake("answers.json"), "jobs/u1/j1/intake/answers.json");
        assert_eq!(paths.draft("s1"), "jobs/u1/j1/drafts/s1.md");
        assert_eq!(paths.review(2, "verify.json"), "jobs/u1/j1/reviews/cycle-2/verify.json");
        assert_eq!(paths.rewrite(1, "s2"), "jobs/u1/j1/rewrites/cycle-1/s2.md");
        assert_eq!(paths.diagram_asset("flow", "png"), "jobs/u1/j1/diagrams/flow.png");
        assert_eq!(paths.final_artifact("pdf"), "jobs/u1/j1/final.pdf");
        assert!(paths.contains("jobs/u1/j1/plan.json"));
        assert!(!paths.contains("jobs/u2/j1/plan.json"));
        assert!(!paths.contains("jobs/u1/j10/plan.json"));
    }
}
