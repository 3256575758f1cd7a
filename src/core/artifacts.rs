//! Final artifact production: the converter seam for PDF/DOCX, the diagram
//! archive, and content-type mapping for artifact downloads.
//!
//! PDF/DOCX conversion libraries are external collaborators; the kernel only
//! defines the seam and degrades gracefully when no converter is wired in.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::storage::{JobPaths, ObjectStore};

#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn to_pdf(&self, markdown: &str) -> Result<Vec<u8>>;
    async fn to_docx(&self, markdown: &str) -> Result<Vec<u8>>;
}

/// Bundle every blob under `diagrams/` into a zip archive keyed by file name.
pub async fn build_diagram_archive(
    store: &dyn ObjectStore,
    paths: &JobPaths,
) -> Result<Vec<u8>> {
    let blobs = store.list(&paths.diagrams_prefix()).await?;
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for blob in blobs {
        let name = blob
            .rsplit('/')
            .next()
            .unwrap_or(blob.as_str())
            .to_string();
        let data = store.get_bytes(&blob).await?;
        writer
            .start_file(format!("diagrams/{name}"), options)
            .context("starting zip entry")?;
        writer.write_all(&data).context("writing zip entry")?;
    }
    let cursor = writer.finish().context("finishing diagram archive")?;
    Ok(cursor.into_inner())
}

/// Content type for an artifact path, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "md" => "text/markdown",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "puml" | "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::FsObjectStore;

    #[tokio::test]
    async fn archive_contains_diagram_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let paths = JobPaths::new("u1", "j1");
        store
            .put_bytes(&paths.diagram_asset("flow", "png"), b"PNG")
            .await
            .unwrap();
        store
            .put_text(&paths.diagram_source("flow"), "@startuml\n@enduml")
            .await
            .unwrap();

        let archive = build_diagram_archive(&store, &paths).await.unwrap();
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"diagrams/flow.png".to_string()));
        assert!(names.contains(&"diagrams/flow.puml".to_string()));
    }

    #[tokio::test]
    async fn empty_archive_for_diagramless_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let paths = JobPaths::new("u1", "j1");
        let archive = build_diagram_archive(&store, &paths).await.unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("final.md"), "text/markdown");
        assert_eq!(content_type_for("final.pdf"), "application/pdf");
        assert_eq!(content_type_for("diagrams.zip"), "application/zip");
        assert_eq!(content_type_for("weird.bin"), "application/octet-stream");
    }
}
