//! # Codevec Embedding
//!
//! Answer generation for Codevec: query embeddings via Ollama, retrieval
//! from Qdrant and streamed completions.

pub mod ollama;
pub mod qdrant;
pub mod rag;

pub use ollama::OllamaClient;
pub use qdrant::{QdrantStore, VectorSearchResult};
pub use rag::RagAnswerer;
