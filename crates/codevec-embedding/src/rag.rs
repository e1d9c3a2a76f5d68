//! Retrieval-augmented answers over a session's indexed codebase.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use codevec_core::config::{OllamaConfig, QdrantConfig};
use codevec_core::{AnswerSource, FragmentStream};
use tracing::{debug, info};

use crate::ollama::OllamaClient;
use crate::qdrant::QdrantStore;

const SYSTEM_PROMPT: &str = "You are a senior software developer with deep knowledge of the \
codebase below. Answer the question using the retrieved context. When the context does not \
contain the answer, say so instead of guessing. Quote code where it helps.";

/// Build the generation prompt from retrieved passages.
pub fn render_prompt(passages: &[String], question: &str) -> String {
    let mut prompt = String::with_capacity(256);
    prompt.push_str(SYSTEM_PROMPT);
    prompt.push_str("\n\nContext information is below.\n---------------------\n");
    for passage in passages {
        prompt.push_str(passage.trim_end());
        prompt.push_str("\n\n");
    }
    prompt.push_str("---------------------\nQuery: ");
    prompt.push_str(question.trim());
    prompt.push_str("\nAnswer: ");
    prompt
}

/// Answers questions by embedding the query, retrieving the nearest chunks
/// from the session's collection and streaming a completion from Ollama.
pub struct RagAnswerer {
    ollama: OllamaClient,
    qdrant: QdrantStore,
    top_k: u64,
}

impl RagAnswerer {
    pub fn new(ollama: OllamaClient, qdrant: QdrantStore, top_k: u64) -> Self {
        Self { ollama, qdrant, top_k }
    }

    pub fn from_config(ollama: &OllamaConfig, qdrant: &QdrantConfig) -> Result<Self> {
        let client = OllamaClient::new(
            &ollama.url,
            &ollama.model,
            &ollama.embedding_model,
            Duration::from_secs(ollama.request_timeout_secs),
        );
        let store = QdrantStore::new(&qdrant.url, qdrant.api_key.clone())?;
        info!(model = %ollama.model, qdrant = %qdrant.url, "Answer pipeline ready");
        Ok(Self::new(client, store, qdrant.top_k))
    }
}

#[async_trait]
impl AnswerSource for RagAnswerer {
    async fn answer(&self, session_id: &str, query: &str) -> Result<FragmentStream> {
        let vector = self.ollama.embed(query).await?;
        let hits = self.qdrant.search(session_id, vector, self.top_k).await?;
        let passages: Vec<String> = hits.iter().filter_map(|h| h.passage()).collect();
        debug!(session_id, passages = passages.len(), "Retrieved context");

        let prompt = render_prompt(&passages, query);
        self.ollama.generate_stream(&prompt).await
    }
}
