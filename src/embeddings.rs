use anyhow::{anyhow, Error as E, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use futures::StreamExt;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{info, warn};

use crate::config::EmbeddingConfig;

/// Dimension used when no model dictates one (hash fallback).
pub const DEFAULT_HASH_DIM: usize = 384;

const LOCAL_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const REMOTE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct EmbedderStatus {
    /// "remote", "local", or "hash".
    pub method: &'static str,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub dimension: usize,
}

/// The embedding capability the pipeline depends on. Construction follows a
/// fallback chain (remote -> local -> hash) so indexing always completes;
/// `status()` reports which provider is actually active.
pub enum Embedder {
    Remote(OllamaEmbedder),
    Local(LocalEmbedder),
    Hash(HashEmbedder),
}

impl Embedder {
    /// Build an embedder per `embedding.preferred_method`, degrading to the
    /// deterministic hash provider when nothing else is available. Never fails.
    pub async fn from_config(config: &EmbeddingConfig) -> Self {
        let method = config.preferred_method.as_str();

        if matches!(method, "remote" | "auto") {
            match OllamaEmbedder::connect(&config.model, &config.endpoint).await {
                Ok(remote) => {
                    info!(
                        model = %config.model,
                        endpoint = %config.endpoint,
                        dimension = remote.dimension,
                        "remote embeddings active"
                    );
                    return Embedder::Remote(remote);
                }
                Err(e) => warn!("remote embedding provider unavailable: {e:#}"),
            }
        }

        if matches!(method, "local" | "auto") {
            match LocalEmbedder::load() {
                Ok(local) => {
                    info!(
                        model = LOCAL_MODEL_ID,
                        dimension = local.dimension,
                        "local embeddings active"
                    );
                    return Embedder::Local(local);
                }
                Err(e) => warn!("local embedding model unavailable: {e:#}"),
            }
        }

        if method == "hash" {
            info!("using deterministic hash embeddings");
        } else {
            warn!(
                "falling back to hash embeddings; similarity scores will carry no semantic meaning"
            );
        }
        Embedder::Hash(HashEmbedder::new(DEFAULT_HASH_DIM))
    }

    /// Fixed output dimension, established at construction.
    pub fn dimension(&self) -> usize {
        match self {
            Embedder::Remote(remote) => remote.dimension,
            Embedder::Local(local) => local.dimension,
            Embedder::Hash(hash) => hash.dimension,
        }
    }

    /// Embed a single text. Failure here is fatal to the caller's operation;
    /// batch embedding (used while indexing) degrades per item instead.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Embedder::Remote(remote) => remote.embed_one(text).await,
            Embedder::Local(local) => local.embed_one(text),
            Embedder::Hash(hash) => Ok(hash.embed(text)),
        }
    }

    /// Embed many texts, preserving order. A per-item provider failure
    /// substitutes the deterministic hash vector for that item rather than
    /// failing the whole batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Embedder::Remote(remote) => {
                let dimension = remote.dimension;
                let vectors = futures::stream::iter(texts.iter())
                    .map(|text| async move {
                        match remote.embed_one(text).await {
                            Ok(vector) => vector,
                            Err(e) => {
                                warn!("remote embed failed, substituting hash vector: {e:#}");
                                hash_vector(text, dimension)
                            }
                        }
                    })
                    .buffered(REMOTE_CONCURRENCY)
                    .collect::<Vec<_>>()
                    .await;
                Ok(vectors)
            }
            Embedder::Local(local) => Ok(texts
                .iter()
                .map(|text| match local.embed_one(text) {
                    Ok(vector) => vector,
                    Err(e) => {
                        warn!("local embed failed, substituting hash vector: {e:#}");
                        hash_vector(text, local.dimension)
                    }
                })
                .collect()),
            Embedder::Hash(hash) => Ok(texts.iter().map(|text| hash.embed(text)).collect()),
        }
    }

    /// Prime the provider so the first real embedding does not pay cold-start
    /// costs. Failures are ignored; they will resurface on real calls.
    pub async fn warm_up(&self) {
        let _ = self.embed("def hello(): pass").await;
    }

    pub fn status(&self) -> EmbedderStatus {
        match self {
            Embedder::Remote(remote) => EmbedderStatus {
                method: "remote",
                model: Some(remote.model.clone()),
                endpoint: Some(remote.endpoint.clone()),
                dimension: remote.dimension,
            },
            Embedder::Local(local) => EmbedderStatus {
                method: "local",
                model: Some(LOCAL_MODEL_ID.to_string()),
                endpoint: None,
                dimension: local.dimension,
            },
            Embedder::Hash(hash) => EmbedderStatus {
                method: "hash",
                model: None,
                endpoint: None,
                dimension: hash.dimension,
            },
        }
    }
}

// ---- Remote provider (Ollama HTTP API) --------------------------------

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    /// Verify the server is reachable and the model is present (pulling it
    /// if not), then discover the embedding dimension with a probe request.
    pub async fn connect(model: &str, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(EMBED_TIMEOUT).build()?;

        let tags: TagsResponse = client
            .get(format!("{endpoint}/api/tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let tagged = format!("{model}:");
        let available = tags
            .models
            .iter()
            .any(|m| m.name == model || m.name.starts_with(&tagged));
        if !available {
            info!(model, "model not present on remote provider, pulling");
            client
                .post(format!("{endpoint}/api/pull"))
                .timeout(PULL_TIMEOUT)
                .json(&serde_json::json!({ "name": model }))
                .send()
                .await?
                .error_for_status()?;
        }

        let mut embedder = Self {
            client,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            dimension: 0,
        };
        let probe = embedder.embed_one("dimension probe").await?;
        if probe.is_empty() {
            return Err(anyhow!("remote provider returned an empty embedding"));
        }
        embedder.dimension = probe.len();
        Ok(embedder)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self
            .client
            .post(format!("{}/api/embeddings", self.endpoint))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.embedding.is_empty() {
            return Err(anyhow!("no embedding returned for text"));
        }
        if self.dimension != 0 && response.embedding.len() != self.dimension {
            return Err(anyhow!(
                "remote embedding dimension changed: expected {}, got {}",
                self.dimension,
                response.embedding.len()
            ));
        }
        Ok(response.embedding)
    }
}

// ---- Local provider (candle BERT) -------------------------------------

/// Token budget of the MiniLM positional embedding table. Chunk texts can
/// run to a thousand lines, far past it, so the tokenizer truncates.
const LOCAL_MAX_TOKENS: usize = 512;

pub struct LocalEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl LocalEmbedder {
    pub fn load() -> Result<Self> {
        let device = Device::Cpu;
        let api = Api::new()?;
        let repo = api.repo(Repo::new(LOCAL_MODEL_ID.to_string(), RepoType::Model));

        let config: Config =
            serde_json::from_str(&std::fs::read_to_string(repo.get("config.json")?)?)?;
        let dimension = config.hidden_size;

        let mut tokenizer = Tokenizer::from_file(repo.get("tokenizer.json")?).map_err(E::msg)?;
        let truncation = TruncationParams {
            max_length: LOCAL_MAX_TOKENS,
            ..Default::default()
        };
        tokenizer.with_truncation(Some(truncation)).map_err(E::msg)?;

        let weights = repo.get("model.safetensors")?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], candle_core::DType::F32, &device)?
        };
        let model = BertModel::load(vb, &config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension,
        })
    }

    /// Embed one text. Sequences go through the model unbatched, so there
    /// is no padding and mean pooling over the sequence axis is exact
    /// without any attention-mask bookkeeping. The caller's batch loop
    /// degrades per item on failure, keeping one bad text from poisoning
    /// its whole slice.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self.tokenizer.encode(text, true).map_err(E::msg)?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(anyhow!("tokenizer produced no tokens"));
        }

        let token_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let token_type_ids = token_ids.zeros_like()?;
        let hidden = self.model.forward(&token_ids, &token_type_ids, None)?;

        // [1, seq, hidden] -> mean over the sequence, then unit norm so
        // the store's cosine distance is well behaved.
        let pooled = hidden.squeeze(0)?.mean(0)?;
        let norm = pooled.sqr()?.sum_all()?.sqrt()?;
        let vector = pooled.broadcast_div(&norm)?.to_vec1::<f32>()?;

        if vector.len() != self.dimension {
            return Err(anyhow!(
                "local model produced {} dims, expected {}",
                vector.len(),
                self.dimension
            ));
        }
        Ok(vector)
    }
}

// ---- Deterministic hash fallback --------------------------------------

/// Expands a SHA-256 digest of the text to `dimension` values in [-1, 1].
/// Deterministic, so a hash-built index stays searchable, but similarity
/// between hash vectors carries no semantic meaning.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        hash_vector(text, self.dimension)
    }
}

pub(crate) fn hash_vector(text: &str, dimension: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    (0..dimension)
        .map(|i| digest[i % digest.len()] as f32 / 127.5 - 1.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_vectors_are_deterministic() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed("fn main() {}");
        let b = embedder.embed("fn main() {}");
        let c = embedder.embed("something else entirely");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hash_vectors_have_requested_dimension_and_range() {
        for dim in [1, 32, 384, 768] {
            let vector = hash_vector("some text", dim);
            assert_eq!(vector.len(), dim);
            assert!(vector.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[tokio::test]
    async fn hash_embedder_batch_preserves_order() {
        let embedder = Embedder::Hash(HashEmbedder::new(64));
        let texts = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &hash_vector(text, 64));
        }
    }

    #[tokio::test]
    async fn status_reports_hash_method() {
        let embedder = Embedder::Hash(HashEmbedder::new(DEFAULT_HASH_DIM));
        let status = embedder.status();
        assert_eq!(status.method, "hash");
        assert_eq!(status.dimension, DEFAULT_HASH_DIM);
        assert!(status.model.is_none());
        assert_eq!(embedder.dimension(), DEFAULT_HASH_DIM);
        assert_eq!(embedder.embed("x").await.unwrap().len(), DEFAULT_HASH_DIM);
    }
}
