//! Qdrant vector store client.
//!
//! Each indexed project lives in its own collection, named after the
//! session id, so retrieval never needs a payload filter.

use std::collections::HashMap;

use anyhow::{Context, Result};
use qdrant_client::qdrant::{value::Kind, SearchPointsBuilder, Value};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A search result from Qdrant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

impl VectorSearchResult {
    /// Source text of the indexed chunk, if the payload carries any.
    ///
    /// Indexers either store the chunk under `text` or embed it in a
    /// serialized `_node_content` document.
    pub fn passage(&self) -> Option<String> {
        if let Some(text) = self.payload.get("text").and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
        let node = self.payload.get("_node_content")?.as_str()?;
        let node: serde_json::Value = serde_json::from_str(node).ok()?;
        node.get("text")?.as_str().map(str::to_string)
    }
}

/// Read-only Qdrant client used for retrieval.
#[derive(Clone)]
pub struct QdrantStore {
    client: Qdrant,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .build()
            .context("Failed to create Qdrant client")?;

        Ok(Self { client })
    }

    /// Search for the `top_k` nearest chunks in a collection.
    pub async fn search(
        &self,
        collection: &str,
        query_vector: Vec<f32>,
        top_k: u64,
    ) -> Result<Vec<VectorSearchResult>> {
        let response = self.client
            .search_points(
                SearchPointsBuilder::new(collection, query_vector, top_k)
                    .with_payload(true),
            )
            .await
            .with_context(|| format!("Failed to search collection '{}'", collection))?;

        let results: Vec<VectorSearchResult> = response.result.into_iter().map(|point| {
            let id = match point.id {
                Some(id) => format!("{:?}", id),
                None => String::new(),
            };
            VectorSearchResult {
                id,
                score: point.score,
                payload: payload_to_json(&point.payload),
            }
        }).collect();

        debug!(collection, hits = results.len(), "Vector search");
        Ok(results)
    }
}

/// Convert Qdrant payload back to serde_json::Value.
fn payload_to_json(payload: &HashMap<String, Value>) -> serde_json::Value {
    let mut map = serde_json::Map::new();

    for (key, val) in payload {
        if let Some(kind) = &val.kind {
            let json_val = match kind {
                Kind::StringValue(s) => serde_json::Value::String(s.clone()),
                Kind::DoubleValue(f) => serde_json::json!(*f),
                Kind::IntegerValue(i) => serde_json::json!(*i),
                Kind::BoolValue(b) => serde_json::Value::Bool(*b),
                _ => continue,
            };
            map.insert(key.clone(), json_val);
        }
    }

    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(payload: serde_json::Value) -> VectorSearchResult {
        VectorSearchResult { id: "1".to_string(), score: 0.9, payload }
    }

    #[test]
    fn test_passage_prefers_text_field() {
        let result = hit(json!({"text": "fn main() {}", "_node_content": "{\"text\":\"other\"}"}));
        assert_eq!(result.passage().as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn test_passage_from_node_content() {
        let node = json!({"id_": "abc", "text": "def handler(): pass"}).to_string();
        let result = hit(json!({"_node_content": node, "file_path": "app.py"}));
        assert_eq!(result.passage().as_deref(), Some("def handler(): pass"));
    }

    #[test]
    fn test_passage_missing() {
        assert!(hit(json!({"file_path": "app.py"})).passage().is_none());
        assert!(hit(json!({"_node_content": "not json"})).passage().is_none());
    }

    #[test]
    fn test_payload_to_json_skips_unsupported_kinds() {
        let mut payload = HashMap::new();
        payload.insert("path".to_string(), Value { kind: Some(Kind::StringValue("a.rs".into())) });
        payload.insert("line".to_string(), Value { kind: Some(Kind::IntegerValue(12)) });
        payload.insert("empty".to_string(), Value { kind: None });

        let json = payload_to_json(&payload);
        assert_eq!(json, json!({"path": "a.rs", "line": 12}));
    }
}
