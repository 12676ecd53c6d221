use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{error::OpenAIError, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;

use common::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Boundary to the embedding collaborator. Implementations must surface
/// quota exhaustion as `AppError::QuotaExhausted` so the loop can tell the
/// one unrecoverable failure apart from transient ones.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}

pub fn embedder_from_config(config: &AppConfig) -> Result<Arc<dyn EmbeddingService>, AppError> {
    match config.embedding_backend {
        EmbeddingBackend::Openai => {
            let client = Arc::new(Client::with_config(
                async_openai::config::OpenAIConfig::new()
                    .with_api_key(&config.openai_api_key)
                    .with_api_base(&config.openai_base_url),
            ));
            Ok(Arc::new(OpenAiEmbedder::new(
                client,
                config.embedding_model.clone(),
                config.embedding_dimensions,
            )))
        }
        EmbeddingBackend::Hashed => Ok(Arc::new(HashedEmbedder::new(
            config.embedding_dimensions as usize,
        ))),
    }
}

pub struct OpenAiEmbedder {
    client: Arc<Client<async_openai::config::OpenAIConfig>>,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbedder {
    pub fn new(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        Self {
            client,
            model,
            dimensions,
        }
    }
}

/// API versions word these errors differently, so both the code and the
/// message text are checked.
fn quota_exhausted(err: &OpenAIError) -> bool {
    let text = err.to_string().to_lowercase();
    ["insufficient", "quota", "balance"]
        .iter()
        .any(|marker| text.contains(marker))
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimensions as usize
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input([text])
            .dimensions(self.dimensions)
            .build()?;

        let response = match self.client.embeddings().create(request).await {
            Ok(response) => response,
            Err(err) if quota_exhausted(&err) => {
                return Err(AppError::QuotaExhausted(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let embedding = response
            .data
            .first()
            .ok_or_else(|| AppError::Processing("no embedding data received".into()))?
            .embedding
            .clone();

        Ok(embedding)
    }
}

/// Deterministic token-bucket embedding for offline runs and tests; no
/// network, no quota, stable across restarts.
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingService for HashedEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(hashed_embedding(text, self.dimension))
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
