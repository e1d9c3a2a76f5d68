//! Ollama HTTP client for embeddings and streamed generation.
//!
//! Embeddings use `/api/embeddings`; answers use `/api/generate` with
//! `stream: true`, which returns one JSON object per line.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ollama embedding and generation client.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    embedding_model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One line of a streamed `/api/generate` response.
#[derive(Debug, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, embedding_model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            embedding_model: embedding_model.to_string(),
            client,
        }
    }

    /// Generate an embedding vector for the given text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            prompt: text,
        };

        let response = self.client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({}): {}", status, body);
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse Ollama embedding response")?;

        debug!(dim = result.embedding.len(), "Generated embedding");
        Ok(result.embedding)
    }

    /// Stream the completion for `prompt`, one text fragment per item.
    pub async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
        };

        let response = self.client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .context("Failed to connect to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({}): {}", status, body);
        }

        debug!(model = %self.model, "Streaming generation");
        Ok(fragments(response.bytes_stream().boxed()).boxed())
    }
}

/// Splits a byte stream into newline-delimited JSON chunks.
#[derive(Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed bytes; returns every complete line decoded so far.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<GenerateChunk>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = decode_line(&line) {
                out.push(chunk);
            }
        }
        out
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Result<GenerateChunk>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<Result<GenerateChunk>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).context("Malformed Ollama stream line"))
}

/// Turn the raw body into answer fragments, stopping at `done` or the first
/// error reported by the server.
fn fragments<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    struct State<S> {
        bytes: S,
        decoder: NdjsonDecoder,
        ready: VecDeque<Result<GenerateChunk>>,
        finished: bool,
    }

    let state = State {
        bytes,
        decoder: NdjsonDecoder::default(),
        ready: Default::default(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if let Some(next) = state.ready.pop_front() {
                match next {
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                    Ok(chunk) => {
                        if let Some(error) = chunk.error {
                            state.finished = true;
                            return Some((Err(anyhow::anyhow!("Ollama error: {}", error)), state));
                        }
                        if chunk.done {
                            state.finished = true;
                        }
                        if chunk.response.is_empty() {
                            continue;
                        }
                        return Some((Ok(chunk.response), state));
                    }
                }
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => state.ready.extend(state.decoder.push(bytes.as_ref())),
                Some(Err(e)) => {
                    state.finished = true;
                    let err = anyhow::Error::new(e).context("Ollama stream interrupted");
                    return Some((Err(err), state));
                }
                None => match state.decoder.finish() {
                    Some(last) => state.ready.push_back(last),
                    None => {
                        state.finished = true;
                        let err = anyhow::anyhow!("Ollama stream ended before completion");
                        return Some((Err(err), state));
                    }
                },
            }
        }
    })
}
