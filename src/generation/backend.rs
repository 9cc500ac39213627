// src/generation/backend.rs
//! Inference backends.
//!
//! `InferenceBackend` is the seam between the tracker and whatever runs the
//! model. `OllamaBackend` speaks Ollama's streaming `/api/generate`: the
//! response is newline-delimited JSON, one object per generated fragment,
//! the last one carrying `"done": true` and timing figures.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::constants::{BACKEND_CONNECT_TIMEOUT, BACKEND_LIST_TIMEOUT};
use crate::protocol::types::PacketType;
use crate::server::session::ClientSession;

/// Error type for backend calls
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Malformed backend response: {0}")]
    Protocol(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// What to generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
}

/// Final figures reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub model: String,
    pub total_duration_ns: Option<u64>,
    pub eval_count: Option<u64>,
}

/// Forwards streamed output to the session until the generation is cancelled
pub struct ChunkSink {
    session: ClientSession,
    token: CancellationToken,
    /// Held while delivering, so nothing is forwarded after a cancel notice
    gate: Arc<Mutex<()>>,
}

impl ChunkSink {
    pub(crate) fn new(session: ClientSession, token: CancellationToken, gate: Arc<Mutex<()>>) -> Self {
        Self { session, token, gate }
    }

    /// Forward a fragment. Returns false once the generation is cancelled or
    /// the session is gone.
    pub fn send(&self, content: &str) -> bool {
        let _delivering = self.gate.lock();
        if self.token.is_cancelled() {
            return false;
        }
        self.session.send(PacketType::GenerateChunk {
            content: content.to_string(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A model backend able to stream a generation
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run a generation, streaming fragments into `sink`.
    ///
    /// Implementations must return promptly with `BackendError::Cancelled`
    /// once `cancel` fires.
    async fn generate(
        &self,
        request: GenerationRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<GenerationSummary, BackendError>;
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

/// HTTP client for an Ollama-compatible server
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(BACKEND_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// List the models the backend has available
    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.endpoint("api/tags"))
            .timeout(BACKEND_LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let tags: OllamaTags = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Handle one NDJSON line; returns the summary once the backend says done
fn process_line(
    line: &[u8],
    request: &GenerationRequest,
    sink: &ChunkSink,
) -> Result<Option<GenerationSummary>, BackendError> {
    let line = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Err(BackendError::Protocol(e.to_string())),
    };
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: OllamaGenerateChunk =
        serde_json::from_str(line).map_err(|e| BackendError::Protocol(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(BackendError::Model(error));
    }

    if !chunk.response.is_empty() {
        trace!(bytes = chunk.response.len(), "Backend fragment");
        sink.send(&chunk.response);
    }

    if chunk.done {
        return Ok(Some(GenerationSummary {
            model: chunk.model.unwrap_or_else(|| request.model.clone()),
            total_duration_ns: chunk.total_duration,
            eval_count: chunk.eval_count,
        }));
    }

    Ok(None)
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(
        &self,
        request: GenerationRequest,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<GenerationSummary, BackendError> {
        let body = OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
        };
        let send = self.client.post(self.endpoint("api/generate")).json(&body).send();

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = send => result.map_err(|e| BackendError::Unavailable(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut buffer = BytesMut::new();
        loop {
            // Dropping `response` on cancel aborts the HTTP request
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(model = %request.model, "Backend stream abandoned on cancel");
                    return Err(BackendError::Cancelled);
                }
                chunk = response.chunk() => chunk.map_err(|e| BackendError::Unavailable(e.to_string()))?,
            };

            match next {
                Some(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        if let Some(summary) = process_line(&line[..pos], &request, &sink)? {
                            return Ok(summary);
                        }
                    }
                }
                None => {
                    if let Some(summary) = process_line(&buffer, &request, &sink)? {
                        return Ok(summary);
                    }
                    return Err(BackendError::Protocol("stream ended before completion".to_string()));
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::{ConnectionId, Outbound};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serve one canned HTTP response and return the base URL
    async fn canned_server(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers, then whatever body Content-Length announces
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "{}\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n{}",
                status_line, body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}", addr)
    }

    fn sink() -> (ChunkSink, CancellationToken, mpsc::UnboundedReceiver<Outbound>) {
        let (session, rx) = ClientSession::new(ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None);
        let token = CancellationToken::new();
        (ChunkSink::new(session, token.clone(), Arc::new(Mutex::new(()))), token, rx)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "llama2".to_string(),
            prompt: "Why is the sky blue?".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ollama_stream_is_forwarded() {
        let body = [
            r#"{"model":"llama2","response":"Rayleigh","done":false}"#,
            r#"{"model":"llama2","response":" scattering","done":false}"#,
            r#"{"model":"llama2","response":"","done":true,"total_duration":12345,"eval_count":2}"#,
        ]
        .join("\n");
        let url = canned_server("HTTP/1.1 200 OK", body).await;
        let backend = OllamaBackend::new(&url).unwrap();
        let (sink, token, mut rx) = sink();

        let summary = backend.generate(request(), sink, token).await.unwrap();
        assert_eq!(summary.model, "llama2");
        assert_eq!(summary.total_duration_ns, Some(12345));
        assert_eq!(summary.eval_count, Some(2));

        let mut content = String::new();
        while let Ok(Outbound::Packet(PacketType::GenerateChunk { content: c })) = rx.try_recv() {
            content.push_str(&c);
        }
        assert_eq!(content, "Rayleigh scattering");
    }

    #[tokio::test]
    async fn test_ollama_model_error() {
        let url = canned_server("HTTP/1.1 200 OK", r#"{"error":"model 'nope' not found"}"#.to_string()).await;
        let backend = OllamaBackend::new(&url).unwrap();
        let (sink, token, _rx) = sink();

        assert!(matches!(
            backend.generate(request(), sink, token).await,
            Err(BackendError::Model(_))
        ));
    }

    #[tokio::test]
    async fn test_ollama_http_error() {
        let url = canned_server("HTTP/1.1 500 Internal Server Error", "boom".to_string()).await;
        let backend = OllamaBackend::new(&url).unwrap();
        let (sink, token, _rx) = sink();

        match backend.generate(request(), sink, token).await {
            Err(BackendError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ollama_truncated_stream() {
        let url = canned_server("HTTP/1.1 200 OK", r#"{"response":"partial","done":false}"#.to_string()).await;
        let backend = OllamaBackend::new(&url).unwrap();
        let (sink, token, _rx) = sink();

        assert!(matches!(
            backend.generate(request(), sink, token).await,
            Err(BackendError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_ollama_unreachable() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let backend = OllamaBackend::new(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let (sink, token, _rx) = sink();

        assert!(matches!(
            backend.generate(request(), sink, token).await,
            Err(BackendError::Unavailable(_))
        ));
        assert!(matches!(backend.list_models().await, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_list_models_from_tags() {
        let url = canned_server(
            "HTTP/1.1 200 OK",
            r#"{"models":[{"name":"llama2:latest"},{"name":"mistral:7b"}]}"#.to_string(),
        )
        .await;
        let backend = OllamaBackend::new(&url).unwrap();
        assert_eq!(backend.list_models().await.unwrap(), vec!["llama2:latest", "mistral:7b"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let backend = OllamaBackend::new("http://127.0.0.1:9").unwrap();
        let (sink, token, _rx) = sink();
        token.cancel();
        assert!(matches!(
            backend.generate(request(), sink, token).await,
            Err(BackendError::Cancelled)
        ));
    }

    #[test]
    fn test_sink_stops_after_cancel() {
        let (sink, token, mut rx) = sink();
        assert!(sink.send("a"));
        token.cancel();
        assert!(!sink.send("b"));
        assert!(sink.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Packet(PacketType::GenerateChunk { .. }))));
        assert!(rx.try_recv().is_err());
    }
}
