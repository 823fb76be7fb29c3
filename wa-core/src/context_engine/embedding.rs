use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Text embedding, used only to persist a similarity fingerprint on
/// `customer_contexts.embedding`; no vector search is implemented on top of
/// it (Non-goal, §4.5).
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub struct GeminiEmbeddingClient {
    http: reqwest::Client,
    api_key: String,
}

impl GeminiEmbeddingClient {
    pub fn new(api_key: String) -> Self {
        Self { http: reqwest::Client::new(), api_key }
    }
}

#[async_trait]
impl EmbeddingClient for GeminiEmbeddingClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent";
        let body = serde_json::json!({ "content": { "parts": [{ "text": text }] } });
        let value: serde_json::Value =
            self.http.post(url).header("x-goog-api-key", &self.api_key).json(&body).send().await?.json().await?;
        let values = value
            .pointer("/embedding/values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("malformed embedding response"))?;
        Ok(values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
    }
}

pub struct OpenAiEmbeddingClient {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(api_key: String) -> Self {
        Self { http: reqwest::Client::new(), api_key }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = "https://api.openai.com/v1/embeddings";
        let body = serde_json::json!({ "model": "text-embedding-3-small", "input": text });
        let value: serde_json::Value = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        let values = value
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("malformed embedding response"))?;
        Ok(values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
    }
}

/// Deterministic fallback used when no embedding provider is configured:
/// a 32-dimensional hash-bucket fingerprint of the token set, not a
/// semantic embedding, only good enough to detect gross repetition.
pub struct HashEmbeddingClient;

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut buckets = [0f32; 32];
        for token in super::sentiment::tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() % 32) as usize;
            buckets[idx] += 1.0;
        }
        Ok(buckets.to_vec())
    }
}

pub fn build_embedding_client(provider: &str, gemini_key: &str, openai_key: &str) -> Box<dyn EmbeddingClient> {
    match provider {
        "gemini" if !gemini_key.is_empty() => Box::new(GeminiEmbeddingClient::new(gemini_key.to_string())),
        "openai" if !openai_key.is_empty() => Box::new(OpenAiEmbeddingClient::new(openai_key.to_string())),
        _ => Box::new(HashEmbeddingClient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedding_is_deterministic() {
        let client = HashEmbeddingClient;
        let a = client.embed("preço do produto X").await.unwrap();
        let b = client.embed("preço do produto X").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn build_embedding_client_falls_back_to_hash_without_keys() {
        let client = build_embedding_client("gemini", "", "");
        let _: &dyn EmbeddingClient = client.as_ref();
    }
}
