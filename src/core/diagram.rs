//! Diagram manifest and the PlantUML render client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagramEntry {
    pub name: String,
    pub format: String,
    /// Blob path of the `.puml` source.
    pub source_path: String,
    /// Blob path of the rendered asset.
    pub asset_path: String,
    /// The block in the draft this diagram replaces at finalize time.
    pub code_block: String,
}

/// `diagrams/index.json`: maps logical diagram references to asset paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiagramManifest {
    #[serde(default)]
    pub diagrams: Vec<DiagramEntry>,
}

impl DiagramManifest {
    pub fn len(&self) -> usize {
        self.diagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagrams.is_empty()
    }
}

/// Diagram name declared by the writer as a leading single-quote comment
/// inside the PlantUML block.
pub fn diagram_name_from_source(source: &str) -> Option<String> {
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.to_lowercase().starts_with("@startuml") {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('\'') {
            let name: String = rest
                .trim()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
                .collect();
            let name = name.trim_matches('-').to_string();
            if !name.is_empty() {
                return Some(name);
            }
        }
        break;
    }
    None
}

/// Normalize raw PlantUML text: unify newlines, unescape literal `\n`, and
/// ensure the `@startuml` / `@enduml` envelope.
pub fn normalize_plantuml(source: &str) -> String {
    let normalized = source.replace("\r\n", "\n").replace('\r', "\n").replace("\\n", "\n");
    let mut trimmed = normalized
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if !trimmed.to_lowercase().starts_with("@startuml") {
        trimmed = format!("@startuml\n{trimmed}");
    }
    if !trimmed.to_lowercase().ends_with("@enduml") {
        trimmed.push_str("\n@enduml");
    }
    trimmed
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer not configured")]
    NotConfigured,
    #[error("transient render failure: {0}")]
    Transient(String),
    #[error("render failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, source: &str, format: &str) -> Result<Vec<u8>, RenderError>;
}

/// HTTP client for an external PlantUML server (`POST {server}/{format}`).
pub struct PlantUmlRenderer {
    client: reqwest::Client,
    server_url: String,
    max_retries: u32,
    retry_base_ms: u64,
}

impl PlantUmlRenderer {
    pub fn new(server_url: &str, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            server_url: server_url.trim_end_matches('/').to_string(),
            max_retries,
            retry_base_ms: 500,
        }
    }

    #[cfg(test)]
    fn with_retry_base_ms(mut self, ms: u64) -> Self {
        self.retry_base_ms = ms;
        self
    }

    async fn attempt(&self, body: &[u8], format: &str) -> Result<Vec<u8>, RenderError> {
        let endpoint = format!("{}/{format}", self.server_url);
        let response = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/octet-stream")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| RenderError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(RenderError::Transient(format!("renderer returned {status}")));
        }
        if !status.is_success() {
            return Err(RenderError::Failed(format!("renderer returned {status}")));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| RenderError::Transient(e.to_string()))
    }
}

#[async_trait]
impl DiagramRenderer for PlantUmlRenderer {
    async fn render(&self, source: &str, format: &str) -> Result<Vec<u8>, RenderError> {
        let body = normalize_plantuml(source).into_bytes();
        let mut attempt = 0u32;
        loop {
            match self.attempt(&body, format).await {
                Ok(bytes) => return Ok(bytes),
                Err(RenderError::Transient(reason)) if attempt < self.max_retries => {
                    let delay = self.retry_base_ms.saturating_mul(1 << attempt.min(6));
                    warn!("retrying diagram render in {delay}ms: {reason}");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_adds_envelope() {
        assert_eq!(normalize_plantuml("A -> B"), "@startuml\nA -> B\n@enduml");
        assert_eq!(
            normalize_plantuml("@startuml\nA -> B\n@enduml"),
            "@startuml\nA -> B\n@enduml"
        );
        assert_eq!(
            normalize_plantuml("A\\nB"),
            "@startuml\nA\nB\n@enduml"
        );
    }

    #[test]
    fn name_from_leading_comment() {
        assert_eq!(
            diagram_name_from_source("@startuml\n' Flow Overview\nA -> B\n@enduml"),
            Some("flow-overview".to_string())
        );
        assert_eq!(diagram_name_from_source("@startuml\nA -> B\n@enduml"), None);
    }

    #[tokio::test]
    async fn renders_via_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PNGDATA".to_vec()))
            .mount(&server)
            .await;
        let renderer = PlantUmlRenderer::new(&server.uri(), 1);
        let bytes = renderer.render("A -> B", "png").await.unwrap();
        assert_eq!(bytes, b"PNGDATA");
    }

    #[tokio::test]
    async fn server_errors_retry_then_surface_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let renderer = PlantUmlRenderer::new(&server.uri(), 2).with_retry_base_ms(1);
        match renderer.render("A -> B", "png").await {
            Err(RenderError::Transient(_)) => {}
            other => panic!("expected transient, got {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn bad_source_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;
        let renderer = PlantUmlRenderer::new(&server.uri(), 3).with_retry_base_ms(1);
        assert!(matches!(
            renderer.render("junk", "png").await,
            Err(RenderError::Failed(_))
        ));
    }
}
